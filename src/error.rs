// Error taxonomy for the RAO harness.
//
// Everything is carried through anyhow::Result; these variants exist so callers
// (and tests) can downcast and tell configuration mistakes from stream
// exhaustion, misaligned segments, over-long prompts and transient failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaoError {
    /// Invalid or infeasible configuration. Raised while deriving the run config.
    #[error("configuration error: {0}")]
    Config(String),

    /// The token stream ended before a packer slot reached the required width.
    #[error("token stream exhausted: slot {slot} has {have} of {need} tokens")]
    StreamExhausted { slot: usize, have: usize, need: usize },

    /// A scored loss tensor is not a whole number of RAO triples.
    #[error("segment misalignment: scored length {len} is not a multiple of tok_p_rao={tok_p_rao}")]
    SegmentMisaligned { len: usize, tok_p_rao: usize },

    /// Prompt plus requested generation would exceed the model context.
    #[error("length exceeded: {requested} positions requested, model supports {max}")]
    LengthExceeded { requested: usize, max: usize },

    /// A failure from an external provider that is worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl RaoError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// `ensure!`-style guard that fails with `RaoError::Config`.
macro_rules! ensure_config {
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            return Err($crate::error::RaoError::config(format!($($arg)+)).into());
        }
    };
}

pub(crate) use ensure_config;
