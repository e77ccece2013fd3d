use serde::Serialize;

/// Conditions reported upward to the owner of the feed. None of these stop
/// the process; the caller decides what to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    /// A slot ran out of reconnect attempts. `moved` tokens were re-homed on
    /// other slots; `stranded` tokens stay mapped to the degraded slot.
    SlotDegraded {
        slot: usize,
        attempts: u32,
        moved: usize,
        stranded: usize,
    },
    /// A degraded or reconnecting slot is subscribed again
    SlotRecovered { slot: usize },
    /// The session token was rejected; hand a new one to `set_access_token`
    AuthExpired { slot: usize, reason: String },
    /// Every slot is degraded: total feed loss
    FeedLost { slots: usize },
}
