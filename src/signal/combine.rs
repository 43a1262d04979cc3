//! N-ary combiners.
//!
//! `combine` attaches to several upstreams at once and feeds a single user
//! function every result, tagged by source. Ends are delivered *as tagged
//! items* — termination of any input is observable, and the function decides
//! whether to close the output. The combiner emits its own `Complete` only
//! once every source has ended and the function has not already closed the
//! stream.
//!
//! Arity 2 is written out below; arities 3–5 are generated the same way.

use crate::exec::Exec;

use super::core::ClosePropagation;
use super::input::Next;
use super::merged::merged_channel;
use super::result::SignalResult;
use super::signal::Signal;

/// Tagged result from one of two combined sources.
#[derive(Debug, Clone, PartialEq)]
pub enum CombinedResult2<A, B> {
    First(SignalResult<A>),
    Second(SignalResult<B>),
}

impl<A: Send + 'static> Signal<A> {
    /// Combines this signal with `other`: `f` receives every result from
    /// either source, tagged, in arrival order at the merge point.
    pub fn combine<B, U, F>(self, other: Signal<B>, context: Exec, mut f: F) -> Signal<U>
    where
        B: Send + 'static,
        U: Send + 'static,
        F: FnMut(CombinedResult2<A, B>, &Next<U>) + Send + 'static,
    {
        let (merged, signal) = merged_channel::<CombinedResult2<A, B>>();
        let first = self.transform(Exec::direct(), |result, next| {
            let ended = result.is_err();
            let _ = next.send(CombinedResult2::First(result));
            if ended {
                let _ = next.complete();
            }
        });
        let _ = merged.add(first, ClosePropagation::None, false);
        let second = other.transform(Exec::direct(), |result, next| {
            let ended = result.is_err();
            let _ = next.send(CombinedResult2::Second(result));
            if ended {
                let _ = next.complete();
            }
        });
        let _ = merged.add(second, ClosePropagation::None, false);
        signal.transform_with(0usize, context, move |ended, item, next| {
            let item = match item {
                Ok(item) => item,
                Err(end) => {
                    let _ = next.send_end(end);
                    return;
                }
            };
            let is_end = match &item {
                CombinedResult2::First(r) => r.is_err(),
                CombinedResult2::Second(r) => r.is_err(),
            };
            if is_end {
                *ended += 1;
            }
            f(item, next);
            if *ended == 2 {
                // Every input is over; close unless `f` already did.
                let _ = next.complete();
            }
        })
    }
}

macro_rules! combine_arity {
    ($n:literal, ($fty:ident, $fvar:ident), $(($ty:ident, $var:ident, $arg:ident)),+ $(,)?) => {
        paste::paste! {
            #[doc = concat!("Tagged result from one of ", stringify!($n), " combined sources.")]
            #[derive(Debug, Clone, PartialEq)]
            pub enum [<CombinedResult $n>]<$fty, $($ty),+> {
                $fvar(SignalResult<$fty>),
                $($var(SignalResult<$ty>)),+
            }

            impl<$fty: Send + 'static> Signal<$fty> {
                #[doc = concat!(
                    "[`combine`](Signal::combine) over ", stringify!($n), " sources."
                )]
                pub fn [<combine $n>]<$($ty,)+ U, F>(
                    self,
                    $($arg: Signal<$ty>,)+
                    context: Exec,
                    mut f: F,
                ) -> Signal<U>
                where
                    $($ty: Send + 'static,)+
                    U: Send + 'static,
                    F: FnMut([<CombinedResult $n>]<$fty, $($ty),+>, &Next<U>) + Send + 'static,
                {
                    let (merged, signal) =
                        merged_channel::<[<CombinedResult $n>]<$fty, $($ty),+>>();
                    let wrapped = self.transform(Exec::direct(), |result, next| {
                        let ended = result.is_err();
                        let _ = next.send([<CombinedResult $n>]::$fvar(result));
                        if ended {
                            let _ = next.complete();
                        }
                    });
                    let _ = merged.add(wrapped, ClosePropagation::None, false);
                    $(
                        let wrapped = $arg.transform(Exec::direct(), |result, next| {
                            let ended = result.is_err();
                            let _ = next.send([<CombinedResult $n>]::$var(result));
                            if ended {
                                let _ = next.complete();
                            }
                        });
                        let _ = merged.add(wrapped, ClosePropagation::None, false);
                    )+
                    signal.transform_with(0usize, context, move |ended, item, next| {
                        let item = match item {
                            Ok(item) => item,
                            Err(end) => {
                                let _ = next.send_end(end);
                                return;
                            }
                        };
                        let is_end = match &item {
                            [<CombinedResult $n>]::$fvar(r) => r.is_err(),
                            $([<CombinedResult $n>]::$var(r) => r.is_err()),+
                        };
                        if is_end {
                            *ended += 1;
                        }
                        f(item, next);
                        if *ended == $n {
                            let _ = next.complete();
                        }
                    })
                }
            }
        }
    };
}

combine_arity!(3, (A, First), (B, Second, b), (C, Third, c));
combine_arity!(4, (A, First), (B, Second, b), (C, Third, c), (D, Fourth, d));
combine_arity!(
    5,
    (A, First),
    (B, Second, b),
    (C, Third, c),
    (D, Fourth, d),
    (E, Fifth, e)
);
