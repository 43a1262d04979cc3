//! Detachable graph edges.
//!
//! A [`Junction`] sits between a producer signal and a consumer input. The
//! producer keeps its identity across disconnects; the consumer side is an
//! ordinary token-authenticated [`Input`], so every disconnect or rebind
//! mints a fresh activation count and stale writers fall away on their own.
//!
//! While unbound, items reaching the junction are dropped at the gap.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::exec::Exec;

use super::channel;
use super::core::{ClosePropagation, Core, DynSink, EdgeLink, Link, bind_lock};
use super::error::{BindError, SendError};
use super::input::Input;
use super::result::End;
use super::signal::Signal;

/// Callback invoked when a terminal end crosses the junction: receives the
/// end plus the freed input, ready for an immediate rebind.
pub type OnEnd<T> = Box<dyn FnMut(End, Input<T>) + Send>;

struct Dest<T: Send + 'static> {
    target: std::sync::Weak<Core<T>>,
    token: usize,
    propagation: ClosePropagation,
    on_end: Option<OnEnd<T>>,
}

struct JunctionShared<T: Send + 'static> {
    dest: Option<Dest<T>>,
    /// Edge the forwarding sink occupies in the source; set once at
    /// construction, read by the sink when a terminal crosses.
    edge: u64,
}

/// A detachable connector owning its producer.
pub struct Junction<T: Send + 'static> {
    source: Arc<Core<T>>,
    /// Edge our forwarding sink occupies in the source.
    edge: u64,
    shared: Arc<Mutex<JunctionShared<T>>>,
}

impl<T: Send + 'static> Signal<T> {
    /// Converts the signal into a junction: a free producer end that can be
    /// bound, disconnected, and rebound to inputs at runtime.
    pub fn junction(self) -> Junction<T> {
        let shared = Arc::new(Mutex::new(JunctionShared {
            dest: None,
            edge: 0,
        }));
        let in_sink = shared.clone();
        let sink: DynSink<T> = Box::new(move |result, phase| {
            // Snapshot under the junction lock, send outside it: the target's
            // mutex must never nest inside ours.
            let snapshot = {
                let shared = in_sink.lock();
                shared
                    .dest
                    .as_ref()
                    .map(|d| (d.target.clone(), d.token, d.propagation))
            };
            match result {
                Ok(value) => {
                    if let Some((target, token, _)) = snapshot
                        && let Some(target) = target.upgrade()
                    {
                        let _ = target.send_phased(Ok(value), token, phase);
                    }
                }
                Err(end) => {
                    // A terminal crossing the junction always disconnects it;
                    // what else happens depends on the bind's policy.
                    let (dest, edge) = {
                        let mut shared = in_sink.lock();
                        (shared.dest.take(), shared.edge)
                    };
                    let Some(dest) = dest else { return };
                    let Some(target) = dest.target.upgrade() else { return };
                    if let Some(mut on_end) = dest.on_end {
                        if let Some(outcome) = target.unbind_preceding(edge) {
                            drop(outcome.link);
                            let input = Input::new(dest.target.clone(), outcome.token);
                            on_end(end, input);
                        }
                    } else if dest.propagation.allows(&end) {
                        let _ = target.send_phased(Err(end), dest.token, phase);
                    } else if let Some(outcome) = target.unbind_preceding(edge) {
                        drop(outcome.link);
                    }
                }
            }
        });
        let edge = self
            .core
            .attach_single(Exec::direct(), sink, false)
            .expect("moved-in signal has no subscriber");
        shared.lock().edge = edge;
        Junction {
            source: self.core,
            edge,
            shared,
        }
    }
}

impl<T: Send + 'static> Junction<T> {
    /// Connects the producer to `input`'s signal.
    ///
    /// Authenticates both sides (the input's token, the target's free
    /// predecessor slot), refuses binds that would close a cycle, mints a
    /// new activation count on the target, and starts the producer if the
    /// target is already live. `on_end` fires when a terminal crosses the
    /// junction, with the freed input.
    pub fn bind(
        &self,
        input: Input<T>,
        propagation: ClosePropagation,
        on_end: Option<OnEnd<T>>,
    ) -> Result<(), BindError<T>> {
        let _guard = bind_lock().lock();
        self.bind_locked(input, propagation, on_end)
    }

    /// Severs the edge, returning the freed input for later reuse. `None`
    /// when nothing is bound or the target is gone.
    pub fn disconnect(&self) -> Option<Input<T>> {
        let _guard = bind_lock().lock();
        self.disconnect_locked()
    }

    /// Atomic [`disconnect`](Self::disconnect) + [`bind`](Self::bind) to the
    /// same target, under one critical section. The target's activation
    /// count changes; its delivery behavior does not.
    pub fn rebind(&self, on_end: Option<OnEnd<T>>) -> Result<(), BindError<T>> {
        let _guard = bind_lock().lock();
        let Some(propagation) = self.shared.lock().dest.as_ref().map(|d| d.propagation) else {
            return Ok(());
        };
        let Some(input) = self.disconnect_locked() else {
            return Ok(());
        };
        self.bind_locked(input, propagation, on_end)
    }

    fn bind_locked(
        &self,
        input: Input<T>,
        propagation: ClosePropagation,
        on_end: Option<OnEnd<T>>,
    ) -> Result<(), BindError<T>> {
        let Some(target) = input.upgrade() else {
            return Err(BindError::Disconnected(input));
        };
        if self.source.reaches(target.id) {
            return Err(BindError::Loop(input));
        }
        let link = Link {
            upstream: Arc::new(EdgeLink {
                source: self.source.clone(),
                edge: self.edge,
            }),
            propagation,
            remove_on_deactivate: false,
        };
        match target.bind_preceding(link, Some(input.token()), false) {
            Ok(outcome) => {
                {
                    let mut shared = self.shared.lock();
                    shared.dest = Some(Dest {
                        target: Arc::downgrade(&target),
                        token: outcome.token,
                        propagation,
                        on_end,
                    });
                }
                tracing::debug!(
                    target: "segnale::signal",
                    source = self.source.id,
                    dest = target.id,
                    "junction bound"
                );
                if outcome.active {
                    self.source.activate_edge(self.edge);
                }
                Ok(())
            }
            Err(SendError::Duplicate) => Err(BindError::Duplicate(input)),
            Err(_) => Err(BindError::Disconnected(input)),
        }
    }

    fn disconnect_locked(&self) -> Option<Input<T>> {
        let dest = self.shared.lock().dest.take()?;
        let target = dest.target.upgrade()?;
        let outcome = target.unbind_preceding(self.edge)?;
        tracing::debug!(
            target: "segnale::signal",
            source = self.source.id,
            dest = target.id,
            "junction disconnected"
        );
        // The producer side goes dormant; items sent meanwhile are dropped
        // at the gap by token mismatch.
        self.source.deactivate_edge(self.edge);
        drop(outcome.link);
        Some(Input::new(dest.target.clone(), outcome.token))
    }
}

/// A disconnect/reconnect switch over one span of the graph.
///
/// During disconnect, items are dropped at the gap; reconnecting resumes
/// normal delivery without disturbing downstream state.
pub struct Reconnector<T: Send + 'static> {
    junction: Junction<T>,
    parked: Mutex<Option<Input<T>>>,
    propagation: ClosePropagation,
}

impl<T: Send + 'static> Signal<T> {
    /// Splits the signal into a [`Reconnector`] and its downstream
    /// continuation.
    pub fn reconnector(self) -> (Reconnector<T>, Signal<T>) {
        let (input, downstream) = channel();
        let junction = self.junction();
        // A fresh channel cannot be cyclic, stale, or occupied.
        let _ = junction.bind(input, ClosePropagation::All, None);
        (
            Reconnector {
                junction,
                parked: Mutex::new(None),
                propagation: ClosePropagation::All,
            },
            downstream,
        )
    }
}

impl<T: Send + 'static> Reconnector<T> {
    /// Opens the gap: subsequent items are dropped until
    /// [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        if let Some(input) = self.junction.disconnect() {
            *self.parked.lock() = Some(input);
        }
    }

    /// Closes the gap and resumes delivery. No-op when not disconnected.
    pub fn reconnect(&self) -> Result<(), BindError<T>> {
        let Some(input) = self.parked.lock().take() else {
            return Ok(());
        };
        self.junction.bind(input, self.propagation, None)
    }
}
