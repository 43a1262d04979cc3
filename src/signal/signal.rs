use std::sync::Arc;

use parking_lot::Mutex;

use crate::exec::Exec;

use super::core::{
    CacheMode, ChildSend, ClosePropagation, Core, DeliveryPhase, DynSink, EdgeLink, Link,
};
use super::input::Next;
use super::result::{End, SignalResult};

/// One stage of a signal graph, emitting `T` to at most one successor.
///
/// A `Signal` is single-subscriber: attaching a transform, a subscription, a
/// junction, or a capture consumes it, so a second attach is unrepresentable.
/// Fan-out goes through the caching variants, which return a cloneable
/// [`SignalMulti`].
///
/// Ownership runs downstream→upstream: whatever you build from a signal
/// (another signal, an [`Output`](super::Output)) keeps the whole upstream
/// chain alive; dropping the last downstream handle releases it.
pub struct Signal<T: Send + 'static> {
    pub(crate) core: Arc<Core<T>>,
}

impl<T: Send + 'static> Signal<T> {
    pub(crate) fn from_core(core: Arc<Core<T>>) -> Self {
        Self { core }
    }

    /// Attaches a handler stage and returns its output signal.
    ///
    /// The handler receives every result this signal emits plus a [`Next`]
    /// into the new stage; it decides what (and whether) to forward,
    /// including ends. It runs on `context`, outside every node mutex, and
    /// may retain the `Next` to deliver asynchronously later.
    pub fn transform<U, F>(self, context: Exec, mut f: F) -> Signal<U>
    where
        U: Send + 'static,
        F: FnMut(SignalResult<T>, &Next<U>) + Send + 'static,
    {
        let child = Core::<U>::plain();
        let next = Next::new(Arc::downgrade(&child), child.current_token());
        let sink: DynSink<T> = Box::new(move |result, _phase| f(result, &next));
        let edge = self
            .core
            .attach_single(context, sink, false)
            .expect("moved-in signal has no subscriber");
        child.set_preceding(Link {
            upstream: Arc::new(EdgeLink {
                source: self.core,
                edge,
            }),
            propagation: ClosePropagation::All,
            remove_on_deactivate: false,
        });
        Signal::from_core(child)
    }

    /// [`transform`](Self::transform) with a mutable state threaded through
    /// every invocation.
    pub fn transform_with<S, U, F>(self, initial: S, context: Exec, mut f: F) -> Signal<U>
    where
        S: Send + 'static,
        U: Send + 'static,
        F: FnMut(&mut S, SignalResult<T>, &Next<U>) + Send + 'static,
    {
        let mut state = initial;
        self.transform(context, move |result, next| f(&mut state, result, next))
    }
}

impl<T: Send + Clone + 'static> Signal<T> {
    fn into_multi(
        self,
        context: Exec,
        cache: Option<CacheMode<T>>,
        always_active: bool,
        exclusive: bool,
    ) -> SignalMulti<T> {
        let multi = Core::multi(
            Box::new(|result: &SignalResult<T>| result.clone()),
            context,
            cache,
            always_active,
            exclusive,
        );
        let target = ChildSend {
            core: Arc::downgrade(&multi),
            token: multi.current_token(),
        };
        let sink: DynSink<T> = Box::new(move |result, phase| {
            let _ = target.send(result, phase);
        });
        let edge = self
            .core
            .attach_single(Exec::direct(), sink, false)
            .expect("moved-in signal has no subscriber");
        multi.set_preceding(Link {
            upstream: Arc::new(EdgeLink {
                source: self.core,
                edge,
            }),
            propagation: ClosePropagation::All,
            remove_on_deactivate: false,
        });
        if always_active {
            multi.force_activate();
        }
        SignalMulti { core: multi }
    }

    /// Plain fan-out: every subscriber sees values from its attach onward.
    /// No cache; the upstream runs only while at least one subscriber is
    /// attached.
    pub fn multicast(self) -> SignalMulti<T> {
        self.into_multi(Exec::direct(), None, false, false)
    }

    /// Fan-out that remembers the latest value: a late subscriber receives
    /// it as its activation prefix. Keeps the upstream running with zero
    /// subscribers so there is always a latest value to remember.
    pub fn continuous(self) -> SignalMulti<T> {
        self.into_multi(Exec::direct(), Some(cache_latest()), true, false)
    }

    /// [`continuous`](Self::continuous) pre-seeded with `initial`.
    pub fn continuous_with(self, initial: T) -> SignalMulti<T> {
        let mut cache = cache_latest();
        cache.values.push(initial);
        self.into_multi(Exec::direct(), Some(cache), true, false)
    }

    /// Fan-out that remembers *every* value: a late subscriber replays the
    /// full history before live delivery.
    pub fn playback(self) -> SignalMulti<T> {
        self.into_multi(Exec::direct(), Some(cache_all(false)), true, false)
    }

    /// Caches every value until the first subscriber attaches, replays the
    /// cache to it, then disables caching. The signal is single-use: a
    /// second subscriber trips a debug assertion, or in release builds
    /// receives `failure(End::other(AttachError::Duplicate))`.
    pub fn cache_until_active(self) -> SignalMulti<T> {
        self.into_multi(Exec::direct(), Some(cache_all(true)), true, true)
    }

    /// Fan-out whose activation cache is maintained by `f`: on every
    /// incoming result, `f` mutates an opaque `state` plus the (values,
    /// preclosed end) pair that late subscribers will replay.
    pub fn custom_activation<S, F>(
        self,
        state: S,
        initial_values: Vec<T>,
        context: Exec,
        mut f: F,
    ) -> SignalMulti<T>
    where
        S: Send + 'static,
        F: FnMut(&mut S, &mut Vec<T>, &mut Option<End>, &SignalResult<T>) + Send + 'static,
    {
        let mut state = state;
        let cache = CacheMode {
            update: Box::new(move |values, end, result| f(&mut state, values, end, result)),
            dup: Box::new(T::clone),
            values: initial_values,
            end: None,
            until_active: false,
            disabled: false,
        };
        self.into_multi(context, Some(cache), true, false)
    }
}

pub(crate) fn cache_latest<T: Send + Clone + 'static>() -> CacheMode<T> {
    CacheMode {
        update: Box::new(|values, end, result| match result {
            Ok(v) => {
                values.clear();
                values.push(v.clone());
            }
            Err(e) => *end = Some(e.clone()),
        }),
        dup: Box::new(T::clone),
        values: Vec::new(),
        end: None,
        until_active: false,
        disabled: false,
    }
}

pub(crate) fn cache_all<T: Send + Clone + 'static>(until_active: bool) -> CacheMode<T> {
    CacheMode {
        update: Box::new(|values, end, result| match result {
            Ok(v) => values.push(v.clone()),
            Err(e) => *end = Some(e.clone()),
        }),
        dup: Box::new(T::clone),
        values: Vec::new(),
        end: None,
        until_active,
        disabled: false,
    }
}

/// A fan-out stage. Cloneable; every [`signal`](Self::signal) call mints an
/// independent subscriber edge that receives the variant's activation cache
/// before live values.
pub struct SignalMulti<T: Send + Clone + 'static> {
    pub(crate) core: Arc<Core<T>>,
}

impl<T: Send + Clone + 'static> Clone for SignalMulti<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: Send + Clone + 'static> SignalMulti<T> {
    /// Subscribes a fresh edge; shorthand for `self.signal().subscribe(..)`.
    pub fn subscribe<F>(&self, context: Exec, handler: F) -> super::Output<T>
    where
        F: FnMut(SignalResult<T>) + Send + 'static,
    {
        self.signal().subscribe(context, handler)
    }

    /// Subscribes a fresh edge to values only.
    pub fn subscribe_values<F>(&self, context: Exec, handler: F) -> super::Output<T>
    where
        F: FnMut(T) + Send + 'static,
    {
        self.signal().subscribe_values(context, handler)
    }

    /// Captures the activation state of a fresh edge.
    pub fn capture(&self) -> super::Capture<T> {
        self.signal().capture()
    }

    /// Mints a fresh single-subscriber signal fed by this fan-out stage.
    pub fn signal(&self) -> Signal<T> {
        let child = Core::plain();
        let target = ChildSend {
            core: Arc::downgrade(&child),
            token: child.current_token(),
        };
        match self.core.attach_child(target) {
            Ok(edge) => {
                child.set_preceding(Link {
                    upstream: Arc::new(EdgeLink {
                        source: self.core.clone(),
                        edge,
                    }),
                    // One subscriber cancelling must not tear down its
                    // siblings.
                    propagation: ClosePropagation::None,
                    remove_on_deactivate: false,
                });
            }
            Err(_) => {
                // The fan-out stage is gone; its terminal is all that is
                // left to deliver.
                let end = self.core.closed_end().unwrap_or(End::Complete);
                child.close_with(end);
            }
        }
        Signal::from_core(child)
    }
}

/// Internal helper for building one-off erased sinks around a shared cell.
pub(crate) fn collecting_sink<T: Send + 'static>(
    cell: Arc<Mutex<(Vec<T>, Option<End>)>>,
) -> DynSink<T> {
    Box::new(move |result, phase| {
        if phase == DeliveryPhase::Activation {
            let mut collected = cell.lock();
            match result {
                Ok(v) => collected.0.push(v),
                Err(e) => collected.1 = Some(e),
            }
        }
        // Normal-phase items are dropped at the gap.
    })
}
