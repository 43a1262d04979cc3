use std::sync::{Arc, Weak};

use super::core::Core;
use super::error::SendError;
use super::result::{End, SignalResult};

/// The write end of a signal.
///
/// An input holds a weak reference to its node plus the activation count it
/// was minted under. Every send re-validates that count under the node's
/// mutex, so an input that survived a disconnect, rebind, or node drop can
/// never inject values into the rewired graph — it just starts collecting
/// [`SendError::Disconnected`].
///
/// Inputs are cheap to clone and safe to share across threads; concurrent
/// senders serialize on the node mutex in acquisition order.
pub struct Input<T: Send + 'static> {
    core: Weak<Core<T>>,
    token: usize,
}

impl<T: Send + 'static> Clone for Input<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            token: self.token,
        }
    }
}

impl<T: Send + 'static> Input<T> {
    pub(crate) fn new(core: Weak<Core<T>>, token: usize) -> Self {
        Self { core, token }
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<Core<T>>> {
        self.core.upgrade()
    }

    pub(crate) fn token(&self) -> usize {
        self.token
    }

    /// Sends one value. `None` means accepted.
    pub fn send(&self, value: T) -> Option<SendError> {
        self.send_result(Ok(value))
    }

    /// Sends a value or an end.
    pub fn send_result(&self, result: SignalResult<T>) -> Option<SendError> {
        match self.core.upgrade() {
            Some(core) => core.send(result, self.token),
            None => Some(SendError::Disconnected),
        }
    }

    /// Sends a terminal end, closing the signal.
    pub fn send_end(&self, end: End) -> Option<SendError> {
        self.send_result(Err(end))
    }

    /// Closes the signal with [`End::Complete`].
    pub fn complete(&self) -> Option<SendError> {
        self.send_end(End::Complete)
    }

    /// Closes the signal with [`End::Cancelled`].
    pub fn cancel(&self) -> Option<SendError> {
        self.send_end(End::Cancelled)
    }

    /// Sends every value of `iter`, stopping at the first rejection.
    pub fn send_all<I: IntoIterator<Item = T>>(&self, iter: I) -> Option<SendError> {
        for value in iter {
            if let Some(err) = self.send(value) {
                return Some(err);
            }
        }
        None
    }
}

impl<T: Send + 'static> std::fmt::Debug for Input<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Input")
            .field("token", &self.token)
            .field("live", &(self.core.strong_count() > 0))
            .finish()
    }
}

/// The forwarding sink handed to a transform handler.
///
/// A `Next` is a token-authenticated write end into the handler's downstream
/// stage. It may be cloned and retained past the handler's return — a
/// handler that wants to deliver asynchronously keeps its `Next` and sends
/// later; once every clone is released the downstream stage can wind down
/// normally.
pub struct Next<T: Send + 'static> {
    core: Weak<Core<T>>,
    token: usize,
}

impl<T: Send + 'static> Clone for Next<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            token: self.token,
        }
    }
}

impl<T: Send + 'static> Next<T> {
    pub(crate) fn new(core: Weak<Core<T>>, token: usize) -> Self {
        Self { core, token }
    }

    /// Forwards one value downstream.
    pub fn send(&self, value: T) -> Option<SendError> {
        self.send_result(Ok(value))
    }

    pub fn send_result(&self, result: SignalResult<T>) -> Option<SendError> {
        match self.core.upgrade() {
            Some(core) => core.send(result, self.token),
            None => Some(SendError::Disconnected),
        }
    }

    pub fn send_end(&self, end: End) -> Option<SendError> {
        self.send_result(Err(end))
    }

    pub fn complete(&self) -> Option<SendError> {
        self.send_end(End::Complete)
    }

    pub fn cancel(&self) -> Option<SendError> {
        self.send_end(End::Cancelled)
    }
}
