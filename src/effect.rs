//! Effect values: immutable descriptions of computations
//!
//! An [`Eff<A, E, R>`] describes a computation that may succeed with `A`,
//! fail with `E`, and read an environment `R`. Nothing runs until a
//! [`Runtime`](crate::runtime::Runtime) interprets the description. Values
//! are freely shareable: cloning an `Eff` clones a description, and the
//! same description can be evaluated any number of times.
//!
//! The public surface is fully typed; internally values travel erased as
//! `Rc<dyn Any>` through a tagged instruction tree ([`RawEff`]) so the
//! interpreter can thread continuations of changing types through one
//! stack machine. Typed wrappers downcast at the boundary; success and
//! error types therefore need `Clone + 'static`.

use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use crate::fiber::{Fiber, FiberInner, RawResolver};
use crate::latch::RawLatch;
use crate::outcome::{Panicked, RawExit};
use crate::runtime::Runtime;
use crate::scheduler::CancelHandle;

/// An erased value flowing through the interpreter.
pub(crate) type Dyn = Rc<dyn Any>;

/// Erase a value.
pub(crate) fn wrap<T: 'static>(value: T) -> Dyn {
    Rc::new(value)
}

/// Un-erase a value, moving it out when this is the only reference and
/// cloning otherwise (shared descriptions may deliver the same value to
/// several observers).
pub(crate) fn take<T: Clone + 'static>(value: Dyn) -> T {
    match value.downcast::<T>() {
        Ok(rc) => Rc::try_unwrap(rc).unwrap_or_else(|shared| (*shared).clone()),
        Err(_) => panic!("effect value arrived with an unexpected type"),
    }
}

/// Un-erase by reference.
pub(crate) fn peek<T: Clone + 'static>(value: &Dyn) -> T {
    value
        .downcast_ref::<T>()
        .expect("effect value arrived with an unexpected type")
        .clone()
}

// ============================================================================
// The instruction tree
// ============================================================================

/// The primitive constructors the interpreter dispatches on.
#[derive(Clone)]
pub(crate) enum RawEff {
    /// Succeed synchronously with a value.
    Succeed(Dyn),
    /// Fail synchronously with an error.
    Fail(Dyn),
    /// Run a thunk producing success or failure.
    Sync(Rc<dyn Fn() -> Result<Dyn, Dyn>>),
    /// Substitute the effect returned by the thunk.
    Suspend(Rc<dyn Fn() -> RawEff>),
    /// Transform the success value with a pure function.
    Map(Rc<RawEff>, Rc<dyn Fn(Dyn) -> Dyn>),
    /// Feed the success value to a continuation producing the next effect.
    AndThen(Rc<RawEff>, Rc<dyn Fn(Dyn) -> RawEff>),
    /// Feed a failure to a recovery continuation.
    Catch(Rc<RawEff>, Rc<dyn Fn(Dyn) -> RawEff>),
    /// Suspend until the registration resolves; the returned handle becomes
    /// the fiber's current cancellation.
    Async(Rc<dyn Fn(RawResolver) -> CancelHandle>),
    /// Read from the current environment.
    Access(Rc<dyn Fn(&Dyn) -> Dyn>),
    /// Install an environment for the duration of the inner effect.
    Provide(Rc<RawEff>, Dyn),
    /// Succeed with the current runtime handle.
    GetRuntime,
    /// Start the inner effect on a new fiber; succeed with its handle.
    Fork(Rc<RawEff>),
    /// Suspend forever; only abort terminates.
    Never,
}

impl RawEff {
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            RawEff::Succeed(_) => "succeed",
            RawEff::Fail(_) => "fail",
            RawEff::Sync(_) => "sync",
            RawEff::Suspend(_) => "suspend",
            RawEff::Map(..) => "map",
            RawEff::AndThen(..) => "and_then",
            RawEff::Catch(..) => "catch",
            RawEff::Async(_) => "async",
            RawEff::Access(_) => "access",
            RawEff::Provide(..) => "provide",
            RawEff::GetRuntime => "runtime",
            RawEff::Fork(_) => "fork",
            RawEff::Never => "never",
        }
    }
}

impl fmt::Debug for RawEff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

// ============================================================================
// The typed facade
// ============================================================================

/// A description of a computation: success channel `A`, error channel `E`,
/// environment requirement `R`.
pub struct Eff<A, E = Infallible, R = ()> {
    pub(crate) raw: RawEff,
    _marker: PhantomData<fn(R) -> (A, E)>,
}

/// An effect that cannot fail and needs no environment.
pub type UIO<A> = Eff<A>;

/// An effect whose only failure mode is a reified panic.
pub type Task<A> = Eff<A, Panicked>;

impl<A, E, R> Clone for Eff<A, E, R> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E, R> fmt::Debug for Eff<A, E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Eff({})", self.raw.tag())
    }
}

impl<A, E, R> Eff<A, E, R> {
    pub(crate) fn from_raw(raw: RawEff) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }
}

impl<A, E, R> Eff<A, E, R>
where
    A: Clone + 'static,
    E: Clone + 'static,
    R: 'static,
{
    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    /// Succeed with `value`.
    pub fn succeed(value: A) -> Self {
        Eff::from_raw(RawEff::Succeed(wrap(value)))
    }

    /// Fail with `error`.
    pub fn fail(error: E) -> Self {
        Eff::from_raw(RawEff::Fail(wrap(error)))
    }

    /// `Ok` succeeds, `Err` fails.
    pub fn from_result(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Eff::succeed(a),
            Err(e) => Eff::fail(e),
        }
    }

    /// Run an infallible thunk when the effect is evaluated.
    pub fn from_fn(f: impl Fn() -> A + 'static) -> Self {
        Eff::from_raw(RawEff::Sync(Rc::new(move || Ok(wrap(f())))))
    }

    /// Run a fallible thunk when the effect is evaluated.
    pub fn try_fn(f: impl Fn() -> Result<A, E> + 'static) -> Self {
        Eff::from_raw(RawEff::Sync(Rc::new(move || match f() {
            Ok(a) => Ok(wrap(a)),
            Err(e) => Err(wrap(e)),
        })))
    }

    /// Defer construction: the thunk's effect is substituted at this point
    /// during evaluation.
    pub fn suspend(f: impl Fn() -> Eff<A, E, R> + 'static) -> Self {
        Eff::from_raw(RawEff::Suspend(Rc::new(move || f().raw)))
    }

    /// Evaluate `f(arg)` inside the interpreter loop, so effects that
    /// recurse through `call` consume no native stack.
    pub fn call<T>(f: impl Fn(T) -> Eff<A, E, R> + 'static, arg: T) -> Self
    where
        T: Clone + 'static,
    {
        Eff::from_raw(RawEff::Suspend(Rc::new(move || f(arg.clone()).raw)))
    }

    /// Suspend forever. Only abort terminates the evaluating fiber.
    pub fn never() -> Self {
        Eff::from_raw(RawEff::Never)
    }

    /// Suspend until the registered callback resolves.
    ///
    /// `register` receives a [`Resolver`]; its first `succeed`/`fail` call
    /// wins and later calls are ignored. The returned [`CancelHandle`] is
    /// stored as the evaluating fiber's current cancellation and is invoked
    /// if the fiber is aborted while suspended here.
    pub fn from_async(register: impl Fn(Resolver<A, E>) -> CancelHandle + 'static) -> Self {
        Eff::from_raw(RawEff::Async(Rc::new(move |raw| {
            register(Resolver::from_raw(raw))
        })))
    }

    /// Like [`Eff::from_async`], but the suspension cannot be interrupted:
    /// abort marks the fiber dead without cancelling the pending callback.
    pub fn from_async_uninterruptible(register: impl Fn(Resolver<A, E>) + 'static) -> Self {
        Eff::from_async(move |resolver| {
            register(resolver);
            CancelHandle::noop()
        })
    }

    /// Succeed with a value read from the environment.
    pub fn access(f: impl Fn(&R) -> A + 'static) -> Self {
        Eff::from_raw(RawEff::Access(Rc::new(move |env| {
            let r = env
                .downcast_ref::<R>()
                .expect("environment arrived with an unexpected type");
            wrap(f(r))
        })))
    }

    /// Continue with an effect built from the environment.
    pub fn access_eff(f: impl Fn(&R) -> Eff<A, E, R> + 'static) -> Self {
        let read = RawEff::Access(Rc::new(move |env: &Dyn| {
            let r = env
                .downcast_ref::<R>()
                .expect("environment arrived with an unexpected type");
            wrap(f(r))
        }));
        Eff::from_raw(RawEff::AndThen(
            Rc::new(read),
            Rc::new(|d| take::<Eff<A, E, R>>(d).raw),
        ))
    }

    /// Succeed with `value` after at least `wait`.
    ///
    /// Aborting the fiber while it waits cancels the underlying timer
    /// exactly once.
    pub fn after(value: A, wait: Duration) -> Self {
        Eff::runtime().and_then(move |rt: Runtime| {
            let value = value.clone();
            Eff::from_async(move |resolver: Resolver<A, E>| {
                let value = value.clone();
                rt.scheduler()
                    .delay(Box::new(move || resolver.succeed(value)), wait)
            })
        })
    }

    // ------------------------------------------------------------------
    // Sequencing
    // ------------------------------------------------------------------

    /// Transform the success value.
    pub fn map<B>(self, f: impl Fn(A) -> B + 'static) -> Eff<B, E, R>
    where
        B: Clone + 'static,
    {
        Eff::from_raw(RawEff::Map(
            Rc::new(self.raw),
            Rc::new(move |d| wrap(f(take(d)))),
        ))
    }

    /// Continue with the effect produced from the success value.
    pub fn and_then<B>(self, k: impl Fn(A) -> Eff<B, E, R> + 'static) -> Eff<B, E, R>
    where
        B: Clone + 'static,
    {
        Eff::from_raw(RawEff::AndThen(
            Rc::new(self.raw),
            Rc::new(move |d| k(take(d)).raw),
        ))
    }

    /// Recover from a failure. Interruption is not a failure and bypasses
    /// the handler.
    pub fn catch<E2>(self, h: impl Fn(E) -> Eff<A, E2, R> + 'static) -> Eff<A, E2, R>
    where
        E2: Clone + 'static,
    {
        Eff::from_raw(RawEff::Catch(
            Rc::new(self.raw),
            Rc::new(move |d| h(take(d)).raw),
        ))
    }

    /// Transform the error value.
    pub fn map_err<E2>(self, f: impl Fn(E) -> E2 + 'static) -> Eff<A, E2, R>
    where
        E2: Clone + 'static,
    {
        self.catch(move |e| Eff::fail(f(e)))
    }

    /// Replace the success value.
    pub fn map_to<B>(self, value: B) -> Eff<B, E, R>
    where
        B: Clone + 'static,
    {
        self.map(move |_| value.clone())
    }

    /// Discard the success value.
    pub fn unit(self) -> Eff<(), E, R> {
        self.map_to(())
    }

    /// Sequence, keeping the second result.
    pub fn and<B>(self, that: Eff<B, E, R>) -> Eff<B, E, R>
    where
        B: Clone + 'static,
    {
        self.and_then(move |_| that.clone())
    }

    /// Sequence, combining both results.
    pub fn zip_with<B, C>(self, that: Eff<B, E, R>, f: impl Fn(A, B) -> C + 'static) -> Eff<C, E, R>
    where
        B: Clone + 'static,
        C: Clone + 'static,
    {
        let f = Rc::new(f);
        self.and_then(move |a: A| {
            let f = f.clone();
            that.clone().map(move |b| f(a.clone(), b))
        })
    }

    /// Sequence, pairing both results.
    pub fn zip<B>(self, that: Eff<B, E, R>) -> Eff<(A, B), E, R>
    where
        B: Clone + 'static,
    {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Start this effect only after `wait` has elapsed.
    pub fn delay(self, wait: Duration) -> Self {
        Eff::<(), E, R>::sleep(wait).and_then(move |_| self.clone())
    }

    /// Left-to-right sequencing of a list, collecting results in order.
    pub fn sequence(items: Vec<Eff<A, E, R>>) -> Eff<Vec<A>, E, R> {
        items
            .into_iter()
            .fold(Eff::succeed(Vec::new()), |acc, eff| {
                acc.zip_with(eff, |mut collected, a| {
                    collected.push(a);
                    collected
                })
            })
    }

    // ------------------------------------------------------------------
    // Environment
    // ------------------------------------------------------------------

    /// Install `env` for the duration of this effect. The previously
    /// active environment is restored on success, failure and unwind.
    pub fn provide<R2>(self, env: R) -> Eff<A, E, R2>
    where
        R2: 'static,
    {
        Eff::from_raw(RawEff::Provide(Rc::new(self.raw), Rc::new(env)))
    }

    // ------------------------------------------------------------------
    // Concurrency
    // ------------------------------------------------------------------

    /// Start this effect on a new fiber and succeed immediately with its
    /// handle. The child inherits the current environment; the parent is
    /// not descheduled.
    pub fn fork(self) -> Eff<Fiber<A, E>, E, R> {
        Eff::from_raw(RawEff::Map(
            Rc::new(RawEff::Fork(Rc::new(self.raw))),
            Rc::new(|d| {
                let inner: Rc<FiberInner> = take(d);
                wrap(Fiber::<A, E>::from_inner(inner))
            }),
        ))
    }

    /// The canonical parallel primitive.
    ///
    /// Forks both effects, then settles with whichever continuation is
    /// installed first: when the left fiber exits, `on_self(exit, right)`
    /// is stored; when the right fiber exits, `on_that(exit, left)` is.
    /// The first store wins; the loser's store is a no-op. A fiber exit of
    /// `None` means that fiber was aborted. Continuations run with the
    /// environment captured at this call site.
    pub fn race_with<B, C>(
        self,
        that: Eff<B, E, R>,
        on_self: impl Fn(Option<Result<A, E>>, Fiber<B, E>) -> Eff<C, E, R> + 'static,
        on_that: impl Fn(Option<Result<B, E>>, Fiber<A, E>) -> Eff<C, E, R> + 'static,
    ) -> Eff<C, E, R>
    where
        B: Clone + 'static,
        C: Clone + 'static,
    {
        let on_self: Rc<dyn Fn(Option<Result<A, E>>, Fiber<B, E>) -> Eff<C, E, R>> =
            Rc::new(on_self);
        let on_that: Rc<dyn Fn(Option<Result<B, E>>, Fiber<A, E>) -> Eff<C, E, R>> =
            Rc::new(on_that);
        let left = self;
        let right = that;

        Eff::runtime().and_then(move |rt: Runtime| {
            let (left, right) = (left.clone(), right.clone());
            let (on_self, on_that) = (on_self.clone(), on_that.clone());
            env_dyn().and_then(move |env: Dyn| {
                let (right, on_self, on_that) = (right.clone(), on_self.clone(), on_that.clone());
                let (env, rt) = (env.clone(), rt.clone());
                left.clone().fork().and_then(move |lf: Fiber<A, E>| {
                    let (right, on_self, on_that) = (right.clone(), on_self.clone(), on_that.clone());
                    let (env, rt, lf) = (env.clone(), rt.clone(), lf.clone());
                    right.clone().fork().and_then(move |rf: Fiber<B, E>| {
                        let done = RawLatch::new();
                        let register = {
                            let done = done.clone();
                            let (lf, rf) = (lf.clone(), rf.clone());
                            let (on_self, on_that) = (on_self.clone(), on_that.clone());
                            let (env, rt) = (env.clone(), rt.clone());
                            RawEff::Sync(Rc::new(move || {
                                {
                                    let done = done.clone();
                                    let rf = rf.clone();
                                    let cb = on_self.clone();
                                    let (env, rt) = (env.clone(), rt.clone());
                                    lf.inner().on_exit(Box::new(move |exit| {
                                        let typed: Option<Result<A, E>> = match exit {
                                            RawExit::Success(v) => Some(Ok(peek::<A>(v))),
                                            RawExit::Failure(e) => Some(Err(peek::<E>(e))),
                                            RawExit::Interrupted => None,
                                        };
                                        let cont = cb(typed, rf.clone());
                                        done.set_now(
                                            RawEff::Provide(Rc::new(cont.raw), env.clone()),
                                            &rt,
                                        );
                                    }));
                                }
                                {
                                    let done = done.clone();
                                    let lf = lf.clone();
                                    let cb = on_that.clone();
                                    let (env, rt) = (env.clone(), rt.clone());
                                    rf.inner().on_exit(Box::new(move |exit| {
                                        let typed: Option<Result<B, E>> = match exit {
                                            RawExit::Success(v) => Some(Ok(peek::<B>(v))),
                                            RawExit::Failure(e) => Some(Err(peek::<E>(e))),
                                            RawExit::Interrupted => None,
                                        };
                                        let cont = cb(typed, lf.clone());
                                        done.set_now(
                                            RawEff::Provide(Rc::new(cont.raw), env.clone()),
                                            &rt,
                                        );
                                    }));
                                }
                                Ok(wrap(()))
                            }))
                        };
                        Eff::<(), E, R>::from_raw(register)
                            .and_then(move |_| Eff::from_raw(done.get_raw()))
                    })
                })
            })
        })
    }

    /// First completion wins; the loser is aborted.
    pub fn race(self, that: Eff<A, E, R>) -> Eff<A, E, R> {
        self.race_with(that, settle, settle)
    }

    /// Run both effects on their own fibers and combine the results in
    /// declared positions regardless of completion order. The first
    /// failure aborts the sibling.
    pub fn zip_with_par<B, C>(
        self,
        that: Eff<B, E, R>,
        f: impl Fn(A, B) -> C + 'static,
    ) -> Eff<C, E, R>
    where
        B: Clone + 'static,
        C: Clone + 'static,
    {
        let f = Rc::new(f);
        let g = f.clone();
        self.race_with(
            that,
            move |exit, sibling: Fiber<B, E>| match exit {
                Some(Ok(a)) => {
                    let f = f.clone();
                    sibling.join().map(move |b| f(a.clone(), b))
                }
                Some(Err(e)) => sibling.abort().and_then(move |_| Eff::fail(e.clone())),
                None => sibling.abort().and_then(|_| Eff::never()),
            },
            move |exit, sibling: Fiber<A, E>| match exit {
                Some(Ok(b)) => {
                    let g = g.clone();
                    sibling.join().map(move |a| g(a, b.clone()))
                }
                Some(Err(e)) => sibling.abort().and_then(move |_| Eff::fail(e.clone())),
                None => sibling.abort().and_then(|_| Eff::never()),
            },
        )
    }

    /// Run all effects in parallel, collecting results in declared order.
    /// Fibers start in left-to-right order; the first failure aborts the
    /// rest.
    pub fn par(items: Vec<Eff<A, E, R>>) -> Eff<Vec<A>, E, R> {
        items
            .into_iter()
            .fold(Eff::succeed(Vec::new()), |acc, eff| {
                acc.zip_with_par(eff, |mut collected, a| {
                    collected.push(a);
                    collected
                })
            })
    }

    /// Like [`Eff::par`] but at most `n` effects run concurrently: the
    /// list is processed in chunks of `n`.
    pub fn par_n(n: usize, items: Vec<Eff<A, E, R>>) -> Eff<Vec<A>, E, R> {
        let width = n.max(1);
        let mut chunks: Vec<Vec<Eff<A, E, R>>> = Vec::new();
        for eff in items {
            let start_new = chunks.last().map_or(true, |chunk| chunk.len() >= width);
            if start_new {
                chunks.push(vec![eff]);
            } else {
                chunks.last_mut().expect("chunks is non-empty").push(eff);
            }
        }
        chunks
            .into_iter()
            .fold(Eff::succeed(Vec::new()), |acc, chunk| {
                acc.zip_with(Eff::par(chunk), |mut collected, mut part| {
                    collected.append(&mut part);
                    collected
                })
            })
    }

    /// Memoize: the effect is evaluated at most once per `once()` value,
    /// no matter how many observers run it; every observer shares the
    /// exit.
    pub fn once(self) -> Eff<A, E, R> {
        let memo = RawLatch::new();
        let source = self.raw;
        Eff::runtime().and_then(move |rt: Runtime| {
            let memo = memo.clone();
            let source = source.clone();
            env_dyn().and_then(move |env: Dyn| {
                memo.set_now(RawEff::Provide(Rc::new(source.clone()), env), &rt);
                Eff::from_raw(memo.get_raw())
            })
        })
    }
}

/// Race continuation: abort the loser, then reproduce the winner's exit.
fn settle<A, E, R>(exit: Option<Result<A, E>>, loser: Fiber<A, E>) -> Eff<A, E, R>
where
    A: Clone + 'static,
    E: Clone + 'static,
    R: 'static,
{
    loser.abort().and_then(move |_| match exit.clone() {
        Some(Ok(a)) => Eff::succeed(a),
        Some(Err(e)) => Eff::fail(e),
        None => Eff::never(),
    })
}

impl<E, R> Eff<(), E, R>
where
    E: Clone + 'static,
    R: 'static,
{
    /// Succeed with `()` after at least `wait`.
    pub fn sleep(wait: Duration) -> Self {
        Eff::after((), wait)
    }
}

impl<E, R> Eff<Runtime, E, R>
where
    E: Clone + 'static,
    R: 'static,
{
    /// Succeed with the runtime evaluating this effect.
    pub fn runtime() -> Self {
        Eff::from_raw(RawEff::GetRuntime)
    }
}

impl<A, R> Eff<A, Panicked, R>
where
    A: Clone + 'static,
    R: 'static,
{
    /// Run a thunk, reifying a panic into the error channel.
    pub fn attempt(f: impl Fn() -> A + 'static) -> Self {
        Eff::from_raw(RawEff::Sync(Rc::new(move || {
            match catch_unwind(AssertUnwindSafe(&f)) {
                Ok(a) => Ok(wrap(a)),
                Err(payload) => Err(wrap(Panicked::from_payload(payload))),
            }
        })))
    }
}

impl<A, R> Eff<A, Infallible, R>
where
    A: Clone + 'static,
    R: 'static,
{
    /// An infallible effect may be used where any error type is expected.
    pub fn widen_err<E>(self) -> Eff<A, E, R>
    where
        E: Clone + 'static,
    {
        Eff::from_raw(self.raw)
    }
}

impl<A, E> Eff<A, E, ()>
where
    A: Clone + 'static,
    E: Clone + 'static,
{
    /// An environment-free effect may be used under any environment.
    pub fn widen_env<R>(self) -> Eff<A, E, R>
    where
        R: 'static,
    {
        Eff::from_raw(self.raw)
    }
}

/// Capture the current environment in its erased form.
pub(crate) fn env_dyn<E, R>() -> Eff<Dyn, E, R>
where
    E: Clone + 'static,
    R: 'static,
{
    Eff::from_raw(RawEff::Access(Rc::new(|env: &Dyn| wrap(env.clone()))))
}

// ============================================================================
// Async resolution
// ============================================================================

/// The resumption callback handed to [`Eff::from_async`] registrations.
/// The first `succeed`/`fail` call wins; later calls are ignored.
pub struct Resolver<A, E> {
    raw: RawResolver,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Resolver<A, E> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> Resolver<A, E>
where
    A: 'static,
    E: 'static,
{
    pub(crate) fn from_raw(raw: RawResolver) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub(crate) fn raw(&self) -> RawResolver {
        self.raw.clone()
    }

    /// Resume the suspended fiber with a success.
    pub fn succeed(&self, value: A) {
        self.raw.resolve(RawExit::Success(wrap(value)));
    }

    /// Resume the suspended fiber with a failure.
    pub fn fail(&self, error: E) {
        self.raw.resolve(RawExit::Failure(wrap(error)));
    }
}
