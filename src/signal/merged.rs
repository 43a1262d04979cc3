use std::sync::Arc;

use crate::exec::Exec;

use super::core::{ClosePropagation, Core, DynSink, EdgeLink, Link, bind_lock};
use super::error::SendError;
use super::input::Input;
use super::signal::Signal;

/// A multi-source write end: signals can be added to (and removed from) the
/// merged stream at runtime, each with its own close-propagation policy.
///
/// All sources feed one node, so the merged output is linearly ordered by
/// that node's mutex: items from different sources interleave in arrival
/// order, items from one source stay FIFO.
pub struct MergedInput<T: Send + 'static> {
    core: Arc<Core<T>>,
}

impl<T: Send + 'static> Clone for MergedInput<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

/// Identifies one source added to a [`MergedInput`], for later removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergedSource {
    source_id: u64,
}

/// Creates a merged node: the input side accepts dynamic sources (and direct
/// sends), the signal side is its ordinary single-subscriber output.
pub fn merged_channel<T: Send + 'static>() -> (MergedInput<T>, Signal<T>) {
    let core = Core::plain();
    (
        MergedInput { core: core.clone() },
        Signal::from_core(core),
    )
}

impl<T: Send + 'static> MergedInput<T> {
    /// Adds `source` to the merge.
    ///
    /// `propagation` decides whether the source's end closes the merged
    /// stream: under [`ClosePropagation::Errors`], `Other` ends close it
    /// while `Complete` and `Cancelled` just remove the source quietly.
    /// With `remove_on_deactivate`, the source edge is also dropped when the
    /// merged node deactivates.
    pub fn add(
        &self,
        source: Signal<T>,
        propagation: ClosePropagation,
        remove_on_deactivate: bool,
    ) -> Result<MergedSource, SendError> {
        let _guard = bind_lock().lock();
        if self.core.is_closed() {
            return Err(SendError::Disconnected);
        }
        if source.core.reaches(self.core.id) {
            return Err(SendError::Loop);
        }
        let source_id = source.core.id;
        let token = self.core.current_token();
        let merged = Arc::downgrade(&self.core);
        let sink: DynSink<T> = Box::new(move |result, phase| {
            let Some(merged) = merged.upgrade() else {
                return;
            };
            match result {
                Ok(value) => {
                    let _ = merged.send_phased(Ok(value), token, phase);
                }
                Err(end) => {
                    if propagation.allows(&end) {
                        let _ = merged.send_phased(Err(end), token, phase);
                    } else {
                        // The source is over but the merge is not: drop the
                        // edge so the merged node releases its hold on us.
                        if let Some(link) = merged.remove_preceding_by_source(source_id) {
                            drop(link);
                        }
                    }
                }
            }
        });
        let edge = source
            .core
            .attach_single(Exec::direct(), sink, false)
            .map_err(|_| SendError::Duplicate)?;
        let link = Link {
            upstream: Arc::new(EdgeLink {
                source: source.core.clone(),
                edge,
            }),
            propagation,
            remove_on_deactivate,
        };
        // `additional`: merged sources do not mint, so sibling edges (and
        // the merged node's own input handles) keep their tokens.
        let outcome = self.core.bind_preceding(link, None, true)?;
        tracing::debug!(
            target: "segnale::signal",
            merged = self.core.id,
            source = source_id,
            "merged source added"
        );
        if outcome.active {
            source.core.activate_edge(edge);
        }
        Ok(MergedSource { source_id })
    }

    /// Removes a previously added source. The source signal goes dormant;
    /// the merged stream continues.
    pub fn remove(&self, source: MergedSource) {
        let _guard = bind_lock().lock();
        if let Some(link) = self.core.remove_preceding_by_source(source.source_id) {
            tracing::debug!(
                target: "segnale::signal",
                merged = self.core.id,
                source = source.source_id,
                "merged source removed"
            );
            let upstream = link.upstream.clone();
            drop(link);
            upstream.detach();
        }
    }

    /// A direct write end into the merged node, interleaving with the added
    /// sources under the same mutex.
    pub fn input(&self) -> Input<T> {
        Input::new(Arc::downgrade(&self.core), self.core.current_token())
    }
}
