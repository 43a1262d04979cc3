use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::exec::Exec;

use super::channel;
use super::core::{ClosePropagation, DeliveryPhase, DynSink, EdgeLink, Link, bind_lock};
use super::error::BindError;
use super::input::Input;
use super::output::Output;
use super::result::{End, SignalResult};
use super::signal::{Signal, collecting_sink};

/// An immutable snapshot of a signal's activation state, plus the retained
/// upstream for deferred resumption.
///
/// Taking a capture attaches to (and activates) the signal, collects exactly
/// the activation prefix and terminal-if-any, and then holds the edge
/// paused: normal-phase items arriving before [`resume`](Self::resume) are
/// dropped at the gap. Dropping an unresumed capture releases the edge.
pub struct Capture<T: Send + 'static> {
    source: Arc<super::core::Core<T>>,
    edge: u64,
    values: Vec<T>,
    end: Option<End>,
    resumed: bool,
}

impl<T: Send + 'static> Signal<T> {
    /// Snapshots the signal's activation state.
    pub fn capture(self) -> Capture<T> {
        let collected: Arc<Mutex<(Vec<T>, Option<End>)>> = Arc::new(Mutex::new((Vec::new(), None)));
        let sink = collecting_sink(collected.clone());
        let edge = self
            .core
            .attach_single(Exec::direct(), sink, true)
            .expect("moved-in signal has no subscriber");
        // Activation replay ran synchronously inside the attach; whatever the
        // cell holds now *is* the activation state at capture time.
        let (values, end) = {
            let mut collected = collected.lock();
            (mem::take(&mut collected.0), collected.1.take())
        };
        Capture {
            source: self.core,
            edge,
            values,
            end,
            resumed: false,
        }
    }
}

impl<T: Send + 'static> Capture<T> {
    /// The captured activation values.
    pub fn values(&self) -> &[T] {
        &self.values
    }

    /// The captured terminal, if the stream had already ended.
    pub fn end(&self) -> Option<&End> {
        self.end.as_ref()
    }

    /// Reattaches the captured upstream to `input`'s signal. With `resend`,
    /// the captured values (and terminal, if any) are replayed to the new
    /// edge as its activation prefix before live delivery resumes.
    pub fn resume(mut self, input: Input<T>, resend: bool) -> Result<(), BindError<T>> {
        let _guard = bind_lock().lock();
        self.resumed = true;
        self.source.detach_edge(self.edge);
        let Some(target) = input.upgrade() else {
            return Err(BindError::Disconnected(input));
        };
        if self.source.reaches(target.id) {
            return Err(BindError::Loop(input));
        }
        // The forwarding sink starts gated on a zero token: nothing flows
        // until the bind below mints the real one. The source is dormant and
        // the bind lock is held, so nothing is lost in the window.
        let gate = Arc::new(AtomicUsize::new(0));
        let sink_gate = gate.clone();
        let weak_target = Arc::downgrade(&target);
        let sink: DynSink<T> = Box::new(move |result: SignalResult<T>, phase| {
            let token = sink_gate.load(Ordering::Acquire);
            if token == 0 {
                return;
            }
            if resend && phase == DeliveryPhase::Activation {
                // The captured prefix already stood in for the upstream's
                // activation on this edge.
                return;
            }
            if let Some(target) = weak_target.upgrade() {
                let _ = target.send_phased(result, token, phase);
            }
        });
        let edge = self
            .source
            .attach_single(Exec::direct(), sink, false)
            .expect("capture released the slot above");
        let link = Link {
            upstream: Arc::new(EdgeLink {
                source: self.source.clone(),
                edge,
            }),
            propagation: ClosePropagation::All,
            remove_on_deactivate: false,
        };
        match target.bind_preceding(link, Some(input.token()), false) {
            Ok(outcome) => {
                if resend {
                    for value in self.values.drain(..) {
                        let _ =
                            target.send_phased(Ok(value), outcome.token, DeliveryPhase::Activation);
                    }
                    if let Some(end) = self.end.take() {
                        let _ =
                            target.send_phased(Err(end), outcome.token, DeliveryPhase::Activation);
                    }
                }
                gate.store(outcome.token, Ordering::Release);
                if outcome.active {
                    self.source.activate_edge(edge);
                }
                Ok(())
            }
            Err(super::error::SendError::Duplicate) => Err(BindError::Duplicate(input)),
            Err(_) => Err(BindError::Disconnected(input)),
        }
    }

    /// One-step resume-into-subscription: builds a channel, subscribes
    /// `handler` on `context`, then resumes into it.
    pub fn subscribe<F>(self, context: Exec, resend: bool, handler: F) -> Output<T>
    where
        F: FnMut(SignalResult<T>) + Send + 'static,
    {
        let (input, signal) = channel();
        let output = signal.subscribe(context, handler);
        // The channel is fresh and acyclic; the bind cannot fail.
        let _ = self.resume(input, resend);
        output
    }
}

impl<T: Send + 'static> Drop for Capture<T> {
    fn drop(&mut self) {
        if !self.resumed {
            self.source.detach_edge(self.edge);
        }
    }
}
