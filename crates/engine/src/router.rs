//! Subscription router
//!
//! Authoritative instrument -> slot mapping. Slots never keep their own
//! subscription list; after a reconnect they ask the router what they should
//! carry (`replay_plan`).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tickfeed_wire::{InstrumentToken, Mode};
use tracing::{debug, info, warn};

use crate::config::Placement;
use crate::error::FeedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub slot: usize,
    pub mode: Mode,
}

#[derive(Debug, Default)]
struct SlotBook {
    tokens: BTreeSet<InstrumentToken>,
    /// Degraded slots stop accepting placements until restored
    accepting: bool,
}

/// Tokens grouped per target slot and mode, ready to become slot commands
pub type SlotPlan = BTreeMap<(usize, Mode), Vec<InstrumentToken>>;

/// Outcome of moving a degraded slot's tokens elsewhere
#[derive(Debug, Default)]
pub struct Evacuation {
    pub moved: SlotPlan,
    /// Tokens with nowhere to go; they stay mapped to the degraded slot
    pub stranded: Vec<InstrumentToken>,
}

impl Evacuation {
    pub fn moved_count(&self) -> usize {
        self.moved.values().map(Vec::len).sum()
    }
}

#[derive(Debug)]
pub struct SubscriptionRouter {
    slots: Vec<SlotBook>,
    assignments: HashMap<InstrumentToken, Assignment>,
    max_per_slot: usize,
    placement: Placement,
}

impl SubscriptionRouter {
    pub fn new(slot_count: usize, max_per_slot: usize, placement: Placement) -> Self {
        Self {
            slots: (0..slot_count)
                .map(|_| SlotBook {
                    tokens: BTreeSet::new(),
                    accepting: true,
                })
                .collect(),
            assignments: HashMap::new(),
            max_per_slot,
            placement,
        }
    }

    fn pick_slot(&self) -> Option<usize> {
        let mut open = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, book)| book.accepting && book.tokens.len() < self.max_per_slot);
        match self.placement {
            Placement::FirstFit => open.next().map(|(idx, _)| idx),
            // min_by_key keeps the first minimum, so ties go to the lowest index
            Placement::LeastLoaded => open
                .min_by_key(|(_, book)| book.tokens.len())
                .map(|(idx, _)| idx),
        }
    }

    /// Room left across all accepting slots
    pub fn free_capacity(&self) -> usize {
        self.slots
            .iter()
            .filter(|book| book.accepting)
            .map(|book| self.max_per_slot.saturating_sub(book.tokens.len()))
            .sum()
    }

    /// Place one instrument. An already-mapped token keeps its slot and only
    /// takes the new mode.
    pub fn assign(&mut self, token: InstrumentToken, mode: Mode) -> Result<usize, FeedError> {
        if let Some(existing) = self.assignments.get_mut(&token) {
            existing.mode = mode;
            return Ok(existing.slot);
        }

        let slot = self.pick_slot().ok_or(FeedError::CapacityExceeded {
            requested: 1,
            available: 0,
        })?;
        self.slots[slot].tokens.insert(token);
        self.assignments.insert(token, Assignment { slot, mode });
        Ok(slot)
    }

    /// Place a batch atomically: either every new token fits or nothing changes.
    pub fn assign_all(
        &mut self,
        tokens: &[InstrumentToken],
        mode: Mode,
    ) -> Result<SlotPlan, FeedError> {
        let unique: BTreeSet<InstrumentToken> = tokens.iter().copied().collect();
        let new = unique
            .iter()
            .filter(|t| !self.assignments.contains_key(t))
            .count();
        let available = self.free_capacity();
        if new > available {
            warn!(requested = new, available, "Subscription rejected, capacity exceeded");
            return Err(FeedError::CapacityExceeded {
                requested: new,
                available,
            });
        }

        let mut plan = SlotPlan::new();
        // Preserve caller order so placement is reproducible for the same input
        let mut seen = BTreeSet::new();
        for &token in tokens {
            if !seen.insert(token) {
                continue;
            }
            let slot = self.assign(token, mode)?;
            plan.entry((slot, mode)).or_default().push(token);
        }
        debug!(new, total = self.assignments.len(), "Assigned subscriptions");
        Ok(plan)
    }

    pub fn release(&mut self, token: InstrumentToken) -> Option<usize> {
        let assignment = self.assignments.remove(&token)?;
        self.slots[assignment.slot].tokens.remove(&token);
        Some(assignment.slot)
    }

    /// Release a batch, grouped by the slot each token was on
    pub fn release_all(
        &mut self,
        tokens: &[InstrumentToken],
    ) -> BTreeMap<usize, Vec<InstrumentToken>> {
        let mut by_slot: BTreeMap<usize, Vec<InstrumentToken>> = BTreeMap::new();
        for &token in tokens {
            if let Some(slot) = self.release(token) {
                by_slot.entry(slot).or_default().push(token);
            }
        }
        by_slot
    }

    /// Current token set of a slot
    pub fn slots_for_replay(&self, slot: usize) -> BTreeSet<InstrumentToken> {
        self.slots
            .get(slot)
            .map(|book| book.tokens.clone())
            .unwrap_or_default()
    }

    /// A slot's tokens grouped by mode, in token order
    pub fn replay_plan(&self, slot: usize) -> Vec<(Mode, Vec<InstrumentToken>)> {
        let mut by_mode: BTreeMap<Mode, Vec<InstrumentToken>> = BTreeMap::new();
        for token in self.slots_for_replay(slot) {
            if let Some(a) = self.assignments.get(&token) {
                by_mode.entry(a.mode).or_default().push(token);
            }
        }
        by_mode.into_iter().collect()
    }

    /// Stop placing on `slot` and move its tokens to slots with room.
    pub fn evacuate(&mut self, slot: usize) -> Evacuation {
        let mut evacuation = Evacuation::default();
        let Some(book) = self.slots.get_mut(slot) else {
            return evacuation;
        };
        book.accepting = false;
        let tokens: Vec<InstrumentToken> = book.tokens.iter().copied().collect();

        for token in tokens {
            let Some(target) = self.pick_slot() else {
                evacuation.stranded.push(token);
                continue;
            };
            let Some(assignment) = self.assignments.get_mut(&token) else {
                continue;
            };
            assignment.slot = target;
            let mode = assignment.mode;
            self.slots[slot].tokens.remove(&token);
            self.slots[target].tokens.insert(token);
            evacuation
                .moved
                .entry((target, mode))
                .or_default()
                .push(token);
        }

        info!(
            slot,
            moved = evacuation.moved_count(),
            stranded = evacuation.stranded.len(),
            "Evacuated slot"
        );
        evacuation
    }

    /// Accept placements on `slot` again
    pub fn restore(&mut self, slot: usize) {
        if let Some(book) = self.slots.get_mut(slot) {
            book.accepting = true;
        }
    }

    pub fn slot_of(&self, token: InstrumentToken) -> Option<usize> {
        self.assignments.get(&token).map(|a| a.slot)
    }

    pub fn mode_of(&self, token: InstrumentToken) -> Option<Mode> {
        self.assignments.get(&token).map(|a| a.mode)
    }

    pub fn is_subscribed(&self, token: InstrumentToken) -> bool {
        self.assignments.contains_key(&token)
    }

    /// Token count per slot, in slot order
    pub fn shape(&self) -> Vec<usize> {
        self.slots.iter().map(|b| b.tokens.len()).collect()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// Router shared between the control path, slot loops and the ingest worker
#[derive(Debug, Clone)]
pub struct SharedRouter(Arc<RwLock<SubscriptionRouter>>);

impl SharedRouter {
    pub fn new(router: SubscriptionRouter) -> Self {
        Self(Arc::new(RwLock::new(router)))
    }

    // A panic while holding the lock cannot leave the maps half-updated in a
    // way readers care about, so poisoning is ignored.
    pub fn read(&self) -> RwLockReadGuard<'_, SubscriptionRouter> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, SubscriptionRouter> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_consistent(router: &SubscriptionRouter) {
        let union: BTreeSet<InstrumentToken> = (0..router.slot_count())
            .flat_map(|s| router.slots_for_replay(s))
            .collect();
        let mapped: BTreeSet<InstrumentToken> = router.assignments.keys().copied().collect();
        assert_eq!(union, mapped);
        let total: usize = router.shape().iter().sum();
        assert_eq!(total, router.len(), "a token appears on two slots");
    }

    #[test]
    fn test_least_loaded_spreads_evenly() {
        let mut router = SubscriptionRouter::new(3, 10, Placement::LeastLoaded);
        for token in 0..6 {
            router.assign(token, Mode::Ltp).unwrap();
        }
        assert_eq!(router.shape(), vec![2, 2, 2]);
        // ties resolved to lowest index
        assert_eq!(router.slot_of(0), Some(0));
        assert_eq!(router.slot_of(1), Some(1));
        assert_eq!(router.slot_of(2), Some(2));
        assert_consistent(&router);
    }

    #[test]
    fn test_first_fit_packs_lowest_slot() {
        let mut router = SubscriptionRouter::new(3, 4, Placement::FirstFit);
        let tokens: Vec<u32> = (0..6).collect();
        router.assign_all(&tokens, Mode::Quote).unwrap();
        assert_eq!(router.shape(), vec![4, 2, 0]);
    }

    #[test]
    fn test_capacity_scenario_9000_then_9001() {
        let mut router = SubscriptionRouter::new(3, 3000, Placement::LeastLoaded);
        let tokens: Vec<u32> = (1..=9000).collect();
        let plan = router.assign_all(&tokens, Mode::Quote).unwrap();

        assert_eq!(router.shape(), vec![3000, 3000, 3000]);
        assert_eq!(plan.values().map(Vec::len).sum::<usize>(), 9000);

        let result = router.assign_all(&[9001], Mode::Quote);
        assert!(matches!(
            result,
            Err(FeedError::CapacityExceeded {
                requested: 1,
                available: 0
            })
        ));
        assert_eq!(router.len(), 9000);
        assert_consistent(&router);
    }

    #[test]
    fn test_assign_all_is_atomic_on_failure() {
        let mut router = SubscriptionRouter::new(1, 3, Placement::LeastLoaded);
        router.assign_all(&[1, 2], Mode::Ltp).unwrap();
        assert!(router.assign_all(&[3, 4], Mode::Ltp).is_err());
        assert_eq!(router.len(), 2);
        assert!(!router.is_subscribed(3));
    }

    #[test]
    fn test_resubscribe_only_changes_mode() {
        let mut router = SubscriptionRouter::new(2, 1, Placement::LeastLoaded);
        router.assign_all(&[7, 8], Mode::Ltp).unwrap();
        // pool is full but 7 is already placed
        let plan = router.assign_all(&[7], Mode::Full).unwrap();
        assert_eq!(plan.get(&(0, Mode::Full)), Some(&vec![7]));
        assert_eq!(router.mode_of(7), Some(Mode::Full));
        assert_eq!(router.len(), 2);
    }

    #[test]
    fn test_duplicate_tokens_in_one_request() {
        let mut router = SubscriptionRouter::new(2, 2, Placement::LeastLoaded);
        let plan = router.assign_all(&[5, 5, 5, 6], Mode::Ltp).unwrap();
        assert_eq!(router.len(), 2);
        assert_eq!(plan.values().map(Vec::len).sum::<usize>(), 2);
    }

    #[test]
    fn test_release_and_resubscribe_yields_same_shape() {
        let mut router = SubscriptionRouter::new(3, 100, Placement::LeastLoaded);
        let tokens: Vec<u32> = (100..250).collect();
        router.assign_all(&tokens, Mode::Quote).unwrap();
        let before = router.shape();

        let released = router.release_all(&tokens);
        assert_eq!(released.values().map(Vec::len).sum::<usize>(), 150);
        assert!(router.is_empty());

        router.assign_all(&tokens, Mode::Quote).unwrap();
        assert_eq!(router.shape(), before);
        assert_consistent(&router);
    }

    #[test]
    fn test_replay_plan_groups_by_mode() {
        let mut router = SubscriptionRouter::new(1, 10, Placement::LeastLoaded);
        router.assign_all(&[3, 1], Mode::Full).unwrap();
        router.assign_all(&[2], Mode::Ltp).unwrap();

        let plan = router.replay_plan(0);
        assert_eq!(plan, vec![(Mode::Ltp, vec![2]), (Mode::Full, vec![1, 3])]);
        assert_eq!(router.slots_for_replay(0), BTreeSet::from([1, 2, 3]));
        assert!(router.replay_plan(5).is_empty());
    }

    #[test]
    fn test_evacuate_moves_what_fits() {
        let mut router = SubscriptionRouter::new(3, 4, Placement::LeastLoaded);
        let tokens: Vec<u32> = (0..9).collect();
        router.assign_all(&tokens, Mode::Quote).unwrap();
        assert_eq!(router.shape(), vec![3, 3, 3]);

        let evacuation = router.evacuate(0);
        // two slots with one free place each
        assert_eq!(evacuation.moved_count(), 2);
        assert_eq!(evacuation.stranded.len(), 1);
        assert_eq!(router.shape(), vec![1, 4, 4]);
        assert_eq!(router.len(), 9);
        assert_consistent(&router);

        // degraded slot takes no new placements
        assert_eq!(router.free_capacity(), 0);
        router.restore(0);
        assert_eq!(router.free_capacity(), 3);
    }

    #[test]
    fn test_shared_router_read_write() {
        let shared = SharedRouter::new(SubscriptionRouter::new(1, 1, Placement::LeastLoaded));
        shared.write().assign(42, Mode::Ltp).unwrap();
        assert!(shared.clone().read().is_subscribed(42));
    }
}
