//! # segnale
//!
//! Push-based reactive signal graphs: typed value streams composed into
//! directed graphs, with well-defined ordering across threads and safe
//! rewiring while data is in flight.
//!
//! The crate is two layers:
//!
//! - [`exec`] — injected execution contexts: where handlers run (inline,
//!   under a recursive lock, on a serial worker, on a pool, on a designated
//!   thread, or on a deterministic debug timeline), plus timers.
//! - [`signal`] — the graph core: per-stage state machines, the delivery
//!   pump, activation caching, junctions, captures, merged inputs, and
//!   combiners.
//!
//! ## Design rules
//!
//! - Every stage serializes on a short-held mutex; user handlers always run
//!   *outside* it, on the stage's [`exec::Exec`].
//! - Every write end carries the activation count it was minted under;
//!   rewiring mints a new one, so stale writers are rejected instead of
//!   raced.
//! - Ownership points downstream→upstream: subscriptions keep their whole
//!   chain alive, forward references are weak.
//! - A stream is any number of values plus at most one terminal
//!   [`signal::End`]; send rejections are synchronous return values and
//!   never enter the stream.
//!
//! ## Quick start
//!
//!```
//! use segnale::exec::Exec;
//! use segnale::signal::{channel, End};
//!
//! let (input, signal) = channel::<u32>();
//! let multi = signal.continuous_with(0);
//! let output = multi.subscribe_values(Exec::direct(), |v| {
//!     let _ = v;
//! });
//! input.send(1);
//! input.send_end(End::Complete);
//! drop(output);
//!```

mod defer;
pub mod exec;
pub mod signal;

pub use exec::{DebugContext, Exec, ExecKind, TimerHandle};
pub use signal::{
    AttachError, BindError, Capture, ClosePropagation, CombinedResult2, CombinedResult3,
    CombinedResult4, CombinedResult5, DynError, End, Input, Junction, MergedInput, MergedSource,
    Next, OnEnd, Output, Reconnector, SendError, Signal, SignalMulti, SignalResult, channel,
    empty, from_iter, generate, interval, just, merged_channel, never, preclosed,
};
#[cfg(feature = "async")]
pub use signal::SignalStream;
