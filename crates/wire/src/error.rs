use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("truncated message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown mode: {0}")]
    UnknownMode(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
