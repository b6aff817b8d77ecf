//! Scoped resources: acquire/release brackets with an abort-safe `use`
//!
//! A [`Managed`] pairs an acquire effect with a release function. `use_`
//! guarantees the release runs exactly once on every exit path of the
//! body: success, failure, and abort of the enclosing fiber. Release is
//! infallible by type.
//!
//! The bracket runs the body on a worker fiber and the
//! await-then-release sequence on a supervisor fiber. Aborting the
//! enclosing fiber only ever aborts the worker; the supervisor is not a
//! child of the abort and always completes the release.

use std::convert::Infallible;
use std::rc::Rc;

use crate::effect::{Eff, RawEff, Resolver};
use crate::fiber::Fiber;
use crate::outcome::RawExit;
use crate::scheduler::CancelHandle;

/// An acquired value paired with its pending release effect.
pub(crate) struct Reservation<A> {
    value: A,
    finalizer: RawEff,
}

impl<A: Clone> Clone for Reservation<A> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            finalizer: self.finalizer.clone(),
        }
    }
}

/// A scoped resource: a description of how to acquire a value and how to
/// give it back.
pub struct Managed<A, E = Infallible, R = ()> {
    reserve: Eff<Reservation<A>, E, R>,
}

impl<A, E, R> Clone for Managed<A, E, R> {
    fn clone(&self) -> Self {
        Self {
            reserve: self.reserve.clone(),
        }
    }
}

/// A finalizer cannot fail, so it may run under any error channel.
fn run_finalizer<E, R>(finalizer: RawEff) -> Eff<(), E, R>
where
    E: Clone + 'static,
    R: 'static,
{
    Eff::from_raw(finalizer)
}

/// Run `first`, then `second` (LIFO composition: inner release first).
fn sequence_finalizers<R: 'static>(first: RawEff, second: RawEff) -> RawEff {
    run_finalizer::<Infallible, R>(first)
        .and_then(move |_| run_finalizer::<Infallible, R>(second.clone()))
        .raw
}

impl<A, E, R> Managed<A, E, R>
where
    A: Clone + 'static,
    E: Clone + 'static,
    R: 'static,
{
    /// Describe a resource by its acquire effect and release function.
    pub fn make(
        acquire: Eff<A, E, R>,
        release: impl Fn(A) -> Eff<(), Infallible, R> + 'static,
    ) -> Self {
        let release = Rc::new(release);
        let reserve = acquire.map(move |a: A| {
            let finalizer = release(a.clone());
            Reservation {
                value: a,
                finalizer: finalizer.raw,
            }
        });
        Self { reserve }
    }

    /// Transform the resource value. The release is unchanged.
    pub fn map<B>(self, f: impl Fn(A) -> B + 'static) -> Managed<B, E, R>
    where
        B: Clone + 'static,
    {
        Managed {
            reserve: self.reserve.map(move |res| Reservation {
                value: f(res.value.clone()),
                finalizer: res.finalizer.clone(),
            }),
        }
    }

    /// Acquire a second resource from the first. Releases run in LIFO
    /// order: the inner resource first, then the outer. If the inner
    /// acquire fails, the outer resource is still released.
    pub fn and_then<B>(self, f: impl Fn(A) -> Managed<B, E, R> + 'static) -> Managed<B, E, R>
    where
        B: Clone + 'static,
    {
        let f = Rc::new(f);
        let reserve = self.reserve.and_then(move |outer: Reservation<A>| {
            let f = f.clone();
            let outer_finalizer = outer.finalizer.clone();
            let inner = f(outer.value.clone()).reserve;
            let guarded = inner.catch({
                let outer_finalizer = outer_finalizer.clone();
                move |e: E| {
                    let e = e.clone();
                    run_finalizer::<E, R>(outer_finalizer.clone())
                        .and_then(move |_| Eff::fail(e.clone()))
                }
            });
            guarded.map(move |inner: Reservation<B>| Reservation {
                value: inner.value.clone(),
                finalizer: sequence_finalizers::<R>(
                    inner.finalizer.clone(),
                    outer_finalizer.clone(),
                ),
            })
        });
        Managed { reserve }
    }

    /// Acquire every resource in parallel; release all of them in
    /// parallel when the use ends.
    pub fn zip(list: Vec<Managed<A, E, R>>) -> Managed<Vec<A>, E, R> {
        let reserves: Vec<Eff<Reservation<A>, E, R>> =
            list.into_iter().map(|m| m.reserve).collect();
        let reserve = Eff::par(reserves).map(|all: Vec<Reservation<A>>| {
            let values: Vec<A> = all.iter().map(|r| r.value.clone()).collect();
            let finalizers: Vec<Eff<(), Infallible, R>> = all
                .iter()
                .map(|r| run_finalizer(r.finalizer.clone()))
                .collect();
            let release_all = Eff::par(finalizers).unit();
            Reservation {
                value: values,
                finalizer: release_all.raw,
            }
        });
        Managed { reserve }
    }

    /// Acquire, run `body`, release exactly once, reproduce the body's
    /// exit. Release also runs when the enclosing fiber is aborted while
    /// the body is in flight.
    pub fn use_<B>(self, body: impl Fn(A) -> Eff<B, E, R> + 'static) -> Eff<B, E, R>
    where
        B: Clone + 'static,
    {
        let body: Rc<dyn Fn(A) -> Eff<B, E, R>> = Rc::new(body);
        self.reserve
            .and_then(move |res: Reservation<A>| bracket(res.clone(), body.clone()))
    }
}

/// The abort-safe bracket.
///
/// The body runs on a worker fiber. A supervisor fiber awaits the worker,
/// runs the finalizer, and reproduces the worker's exit. The enclosing
/// fiber waits on the supervisor with a cancellation that aborts only the
/// worker: however the wait ends, the supervisor still runs the finalizer
/// exactly once.
fn bracket<A, B, E, R>(res: Reservation<A>, body: Rc<dyn Fn(A) -> Eff<B, E, R>>) -> Eff<B, E, R>
where
    A: Clone + 'static,
    B: Clone + 'static,
    E: Clone + 'static,
    R: 'static,
{
    let finalizer = res.finalizer.clone();
    body(res.value.clone())
        .fork()
        .and_then(move |worker: Fiber<B, E>| {
            let finalizer = finalizer.clone();
            let supervise: Eff<Option<Result<B, E>>, E, R> = {
                let release: Eff<(), E, R> = run_finalizer(finalizer.clone());
                worker
                    .await_exit()
                    .and_then(move |exit: Option<Result<B, E>>| {
                        let exit = exit.clone();
                        release.clone().map(move |_| exit.clone())
                    })
            };
            let worker = worker.clone();
            supervise
                .fork()
                .and_then(move |keeper: Fiber<Option<Result<B, E>>, E>| {
                    let worker = worker.clone();
                    let outcome: Eff<Option<Result<B, E>>, E, R> =
                        Eff::from_async(move |resolver: Resolver<Option<Result<B, E>>, E>| {
                            let raw = resolver.raw();
                            keeper
                                .inner()
                                .on_exit(Box::new(move |exit: &RawExit| raw.resolve(exit.clone())));
                            let worker = worker.clone();
                            CancelHandle::new(move || worker.inner().abort_now())
                        });
                    outcome.and_then(|exit| match exit {
                        Some(Ok(b)) => Eff::succeed(b),
                        Some(Err(e)) => Eff::fail(e),
                        None => Eff::never(),
                    })
                })
        })
}
