use thiserror::Error;

use super::input::Input;

/// Why a send was rejected.
///
/// Rejections are returned synchronously to the sender; they never enter the
/// stream itself.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The signal has no active subscriber and does not cache while inactive.
    #[error("signal is not active")]
    Inactive,
    /// The token no longer matches: the graph was rewired, closed, or dropped
    /// since this handle was minted.
    #[error("handle no longer reaches its signal")]
    Disconnected,
    /// A second subscriber was offered to a single-subscriber signal.
    #[error("signal already has a subscriber")]
    Duplicate,
    /// The requested bind would make the graph cyclic.
    #[error("bind would create a loop")]
    Loop,
}

/// Why an attach was rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    #[error("signal already has a subscriber")]
    Duplicate,
}

/// Why a junction bind failed.
///
/// Every variant hands the offered input back, so a failed bind does not cost
/// the caller the write end.
#[derive(Error)]
pub enum BindError<T: Send + 'static> {
    /// The input's signal is gone or the token is stale.
    #[error("input no longer reaches its signal")]
    Disconnected(Input<T>),
    /// The input's signal already has a predecessor.
    #[error("target already has a predecessor")]
    Duplicate(Input<T>),
    /// Binding would make the graph cyclic.
    #[error("bind would create a loop")]
    Loop(Input<T>),
}

impl<T: Send + 'static> BindError<T> {
    /// Recovers the input offered to the failed bind.
    pub fn into_input(self) -> Input<T> {
        match self {
            BindError::Disconnected(i) | BindError::Duplicate(i) | BindError::Loop(i) => i,
        }
    }
}

// Manual impl: `Input<T>` is deliberately opaque and `T` need not be Debug.
impl<T: Send + 'static> std::fmt::Debug for BindError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindError::Disconnected(_) => f.write_str("BindError::Disconnected"),
            BindError::Duplicate(_) => f.write_str("BindError::Duplicate"),
            BindError::Loop(_) => f.write_str("BindError::Loop"),
        }
    }
}
