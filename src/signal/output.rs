use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::exec::Exec;

use super::core::{Core, DynSink};
use super::result::{End, SignalResult};
use super::signal::Signal;

#[cfg(feature = "async")]
pub use r#async::SignalStream;

/// A live subscription: the terminal sink of a graph.
///
/// The output holds the final stage strongly, and through it the whole
/// upstream chain; dropping (or cancelling) it delivers one
/// `failure(Cancelled)` to the handler and then tears the chain down along
/// every edge whose close-propagation policy admits cancellation.
pub struct Output<T: Send + 'static> {
    core: Arc<Core<T>>,
    cancelled: AtomicBool,
}

impl<T: Send + 'static> Output<T> {
    /// Cancels the subscription. Idempotent.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.core.close_with(End::Cancelled);
        }
    }

    /// True once a terminal end has been delivered (by the stream or by
    /// cancellation).
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

impl<T: Send + 'static> Drop for Output<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<T: Send + 'static> Signal<T> {
    /// Attaches `handler` as the graph's terminal observer and activates the
    /// chain. The handler runs on `context` for every delivered result,
    /// ends included.
    pub fn subscribe<F>(self, context: Exec, mut handler: F) -> Output<T>
    where
        F: FnMut(SignalResult<T>) + Send + 'static,
    {
        let sink: DynSink<T> = Box::new(move |result, _phase| handler(result));
        let _ = self
            .core
            .attach_single(context, sink, true)
            .expect("moved-in signal has no subscriber");
        Output {
            core: self.core,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Like [`subscribe`](Self::subscribe), but the handler sees values
    /// only; ends are absorbed.
    pub fn subscribe_values<F>(self, context: Exec, mut handler: F) -> Output<T>
    where
        F: FnMut(T) + Send + 'static,
    {
        self.subscribe(context, move |result| {
            if let Ok(value) = result {
                handler(value);
            }
        })
    }

    /// Subscribes with no handle to keep: the subscription retains itself
    /// and releases when the stream delivers its end.
    pub fn subscribe_until_end<F>(self, context: Exec, mut handler: F)
    where
        F: FnMut(SignalResult<T>) + Send + 'static,
    {
        // The handler owns the slot its own Output lives in; taking it on the
        // terminal result drops the last strong reference to the graph.
        let slot: Arc<Mutex<SelfRetained<T>>> = Arc::new(Mutex::new(SelfRetained::Pending));
        let in_handler = slot.clone();
        let output = self.subscribe(context, move |result| {
            let ended = result.is_err();
            handler(result);
            if ended {
                let mut retained = in_handler.lock();
                *retained = SelfRetained::Done;
            }
        });
        let mut retained = slot.lock();
        if matches!(&*retained, SelfRetained::Done) {
            // The stream ended during subscribe (preclosed source): nothing
            // left to retain. Release outside the slot lock.
            drop(retained);
            drop(output);
        } else {
            *retained = SelfRetained::Held(output);
        }
    }

    /// [`subscribe_until_end`](Self::subscribe_until_end) over values only.
    pub fn subscribe_values_until_end<F>(self, context: Exec, mut handler: F)
    where
        F: FnMut(T) + Send + 'static,
    {
        self.subscribe_until_end(context, move |result| {
            if let Ok(value) = result {
                handler(value);
            }
        })
    }

    /// Self-retained subscription that lives while `predicate` keeps
    /// returning true. A false return (or a stream end) releases it; the
    /// release surfaces to the graph as an ordinary cancellation.
    pub fn subscribe_while<F>(self, context: Exec, mut predicate: F)
    where
        F: FnMut(T) -> bool + Send + 'static,
    {
        let slot: Arc<Mutex<SelfRetained<T>>> = Arc::new(Mutex::new(SelfRetained::Pending));
        let in_handler = slot.clone();
        let output = self.subscribe(context, move |result| {
            let stop = match result {
                Ok(value) => !predicate(value),
                Err(_) => true,
            };
            if stop {
                let mut retained = in_handler.lock();
                *retained = SelfRetained::Done;
            }
        });
        let mut retained = slot.lock();
        if matches!(&*retained, SelfRetained::Done) {
            drop(retained);
            drop(output);
        } else {
            *retained = SelfRetained::Held(output);
        }
    }
}

enum SelfRetained<T: Send + 'static> {
    Pending,
    Held(Output<T>),
    Done,
}

#[cfg(feature = "async")]
mod r#async {
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll, Waker};

    use futures::Stream;

    use super::*;

    impl<T: Send + 'static> Signal<T> {
        /// Adapts the signal into a [`futures::Stream`] of delivered
        /// results. The final item is the stream's end; after it the
        /// adapter reports exhaustion. Dropping the adapter cancels the
        /// underlying subscription.
        pub fn into_stream(self) -> SignalStream<T> {
            let shared = Arc::new(Mutex::new(Shared {
                queue: VecDeque::new(),
                waker: None,
                done: false,
            }));
            let in_handler = shared.clone();
            eprintln!("about to subscribe");
            let output = self.subscribe(Exec::direct(), move |result| {
                eprintln!("handler called");
                let waker = {
                    let mut shared = in_handler.lock();
                    shared.done |= result.is_err();
                    shared.queue.push_back(result);
                    shared.waker.take()
                };
                // Wake outside the lock: the executor may poll immediately.
                if let Some(waker) = waker {
                    waker.wake();
                }
            });
            SignalStream {
                shared,
                _output: output,
            }
        }
    }

    struct Shared<T> {
        queue: VecDeque<SignalResult<T>>,
        waker: Option<Waker>,
        done: bool,
    }

    #[must_use = "streams do nothing unless polled"]
    pub struct SignalStream<T: Send + 'static> {
        shared: Arc<Mutex<Shared<T>>>,
        _output: Output<T>,
    }

    /// Safe: the struct is not self-referential.
    impl<T: Send + 'static> Unpin for SignalStream<T> {}

    impl<T: Send + 'static> Stream for SignalStream<T> {
        type Item = SignalResult<T>;

        fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            eprintln!("poll_next called");
            let mut shared = self.shared.lock();
            eprintln!("poll_next locked, queue_len={} done={}", shared.queue.len(), shared.done);
            if let Some(result) = shared.queue.pop_front() {
                return Poll::Ready(Some(result));
            }
            if shared.done {
                return Poll::Ready(None);
            }
            // The handler takes this same lock before enqueueing, so no send
            // can slip between the pop above and this registration.
            shared.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}
