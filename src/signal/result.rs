use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Application error carried by [`End::Other`].
///
/// `Arc` rather than `Box`: terminal ends fan out to every successor of a
/// node, so they must be cheaply duplicable.
pub type DynError = Arc<dyn Error + Send + Sync + 'static>;

/// Terminal marker that closes an edge.
///
/// Exactly one `End` terminates a stream; after it, no further results are
/// delivered on that edge.
#[derive(Clone, Debug)]
pub enum End {
    /// The stream ran out of values naturally.
    Complete,
    /// The stream was torn down from downstream.
    Cancelled,
    /// The stream failed with an application error.
    Other(DynError),
}

impl End {
    /// Wraps an application error.
    pub fn other<E: Error + Send + Sync + 'static>(e: E) -> Self {
        End::Other(Arc::new(e))
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, End::Complete)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, End::Cancelled)
    }

    /// True only for [`End::Other`]: `Complete` and `Cancelled` are normal
    /// lifecycle ends, not errors.
    pub fn is_error(&self) -> bool {
        matches!(self, End::Other(_))
    }
}

impl fmt::Display for End {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            End::Complete => write!(f, "complete"),
            End::Cancelled => write!(f, "cancelled"),
            End::Other(e) => write!(f, "error: {e}"),
        }
    }
}

// `Other` compares by identity: two ends are the same end only if they carry
// the same error allocation.
impl PartialEq for End {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (End::Complete, End::Complete) => true,
            (End::Cancelled, End::Cancelled) => true,
            (End::Other(a), End::Other(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// One delivered item: a value, or the end that closes the edge.
pub type SignalResult<T> = Result<T, End>;
