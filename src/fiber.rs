//! The fiber interpreter: a trampolined stack machine over effect values
//!
//! Each fiber owns an evaluation of one effect description. Pure
//! constructors reduce synchronously in a loop (the trampoline — deep
//! recursion through `suspend`/`call` becomes iteration); the fiber yields
//! only at `Async`, `Fork`, `Never` and completion. Resumption always
//! re-enters through `scheduler.asap`, never synchronously from inside a
//! registration, which is what makes the cancellation protocol race-safe.

use std::cell::{Cell, RefCell};
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::effect::{peek, wrap, Dyn, Eff, RawEff};
use crate::outcome::RawExit;
use crate::runtime::Runtime;
use crate::scheduler::CancelHandle;

thread_local! {
    static NEXT_FIBER_ID: Cell<u64> = const { Cell::new(1) };
}

fn next_fiber_id() -> u64 {
    NEXT_FIBER_ID.with(|counter| {
        let id = counter.get();
        counter.set(id + 1);
        id
    })
}

// ============================================================================
// Continuation frames
// ============================================================================

/// One entry of the continuation stack.
enum Frame {
    /// Pure transform of the success value.
    Map(Rc<dyn Fn(Dyn) -> Dyn>),
    /// Success continuation producing the next effect.
    Apply(Rc<dyn Fn(Dyn) -> RawEff>),
    /// Failure continuation producing the next effect.
    Recover(Rc<dyn Fn(Dyn) -> RawEff>),
    /// Restore a previously-active environment.
    RestoreEnv(Dyn),
}

struct Machine {
    stack: Vec<Frame>,
    env: Dyn,
}

/// What the loop works on next.
pub(crate) enum Step {
    Eval(RawEff),
    Succeed(Dyn),
    Fail(Dyn),
}

enum Control {
    Next(Step),
    Suspend,
}

enum Unwound {
    Next(Step),
    Done(RawExit),
}

/// Pop frames for a success value.
fn unwind_success(machine: &mut Machine, value: Dyn) -> Unwound {
    loop {
        match machine.stack.pop() {
            Some(Frame::Map(f)) => return Unwound::Next(Step::Succeed(f(value))),
            Some(Frame::Apply(k)) => return Unwound::Next(Step::Eval(k(value))),
            Some(Frame::Recover(_)) => continue,
            Some(Frame::RestoreEnv(prev)) => {
                machine.env = prev;
                continue;
            }
            None => return Unwound::Done(RawExit::Success(value)),
        }
    }
}

/// Pop frames for a failure, restoring environments on the way down.
fn unwind_failure(machine: &mut Machine, error: Dyn) -> Unwound {
    loop {
        match machine.stack.pop() {
            Some(Frame::Recover(h)) => return Unwound::Next(Step::Eval(h(error))),
            Some(Frame::Map(_)) | Some(Frame::Apply(_)) => continue,
            Some(Frame::RestoreEnv(prev)) => {
                machine.env = prev;
                continue;
            }
            None => return Unwound::Done(RawExit::Failure(error)),
        }
    }
}

// ============================================================================
// Fiber state
// ============================================================================

pub(crate) enum Status {
    Pending,
    Done(RawExit),
}

impl Status {
    fn is_terminal(&self) -> bool {
        matches!(self, Status::Done(_))
    }
}

struct FiberCore {
    status: Status,
    /// Callbacks invoked exactly once with the final outcome, in
    /// registration order.
    waiters: Vec<Box<dyn FnOnce(&RawExit)>>,
    /// The single outstanding scheduler cancellation, if suspended.
    cancel: Option<CancelHandle>,
}

/// The untyped running fiber shared between the interpreter, handles and
/// waiter registrations.
pub(crate) struct FiberInner {
    id: u64,
    runtime: Runtime,
    core: RefCell<FiberCore>,
    machine: RefCell<Machine>,
}

impl FiberInner {
    pub(crate) fn spawn(runtime: Runtime, env: Dyn) -> Rc<Self> {
        let id = next_fiber_id();
        trace!(fiber = id, "fiber spawned");
        Rc::new(Self {
            id,
            runtime,
            core: RefCell::new(FiberCore {
                status: Status::Pending,
                waiters: Vec::new(),
                cancel: None,
            }),
            machine: RefCell::new(Machine {
                stack: Vec::new(),
                env,
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn is_terminal(&self) -> bool {
        self.core.borrow().status.is_terminal()
    }

    pub(crate) fn status_tag(&self) -> &'static str {
        match &self.core.borrow().status {
            Status::Pending => "pending",
            Status::Done(exit) => exit.tag(),
        }
    }

    /// Schedule the fiber's first tick.
    pub(crate) fn start(this: &Rc<Self>, eff: RawEff) {
        Self::schedule_resume(this, Step::Eval(eff));
    }

    /// Re-enter the loop on the next scheduler tick. The tick's handle
    /// becomes the fiber's current cancellation.
    fn schedule_resume(this: &Rc<Self>, step: Step) {
        let fiber = Rc::clone(this);
        let handle = this
            .runtime
            .scheduler()
            .asap(Box::new(move || Self::run(&fiber, step)));
        let mut core = this.core.borrow_mut();
        if core.status.is_terminal() {
            drop(core);
            handle.cancel();
        } else {
            core.cancel = Some(handle);
        }
    }

    /// The evaluation loop.
    fn run(this: &Rc<Self>, step: Step) {
        {
            let mut core = this.core.borrow_mut();
            core.cancel = None;
            if core.status.is_terminal() {
                drop(core);
                if let Ok(mut machine) = this.machine.try_borrow_mut() {
                    machine.stack.clear();
                }
                return;
            }
        }

        let mut machine = this.machine.borrow_mut();
        let mut step = step;
        loop {
            // an effect we just ran may have aborted this fiber
            if this.is_terminal() {
                machine.stack.clear();
                return;
            }
            let unwound = match step {
                Step::Eval(eff) => match Self::dispatch(this, eff, &mut machine) {
                    Control::Next(next) => {
                        step = next;
                        continue;
                    }
                    Control::Suspend => return,
                },
                Step::Succeed(value) => unwind_success(&mut machine, value),
                Step::Fail(error) => unwind_failure(&mut machine, error),
            };
            match unwound {
                Unwound::Next(next) => step = next,
                Unwound::Done(exit) => {
                    machine.stack.clear();
                    drop(machine);
                    this.complete(exit);
                    return;
                }
            }
        }
    }

    /// One reduction. Pure constructors return `Control::Next`; `Async`,
    /// `Never` suspend.
    fn dispatch(this: &Rc<Self>, eff: RawEff, machine: &mut Machine) -> Control {
        match eff {
            RawEff::Succeed(value) => Control::Next(Step::Succeed(value)),
            RawEff::Fail(error) => Control::Next(Step::Fail(error)),
            RawEff::Sync(thunk) => Control::Next(match thunk() {
                Ok(value) => Step::Succeed(value),
                Err(error) => Step::Fail(error),
            }),
            RawEff::Suspend(thunk) => Control::Next(Step::Eval(thunk())),
            RawEff::Map(source, f) => {
                machine.stack.push(Frame::Map(f));
                Control::Next(Step::Eval((*source).clone()))
            }
            RawEff::AndThen(source, k) => {
                machine.stack.push(Frame::Apply(k));
                Control::Next(Step::Eval((*source).clone()))
            }
            RawEff::Catch(source, h) => {
                machine.stack.push(Frame::Recover(h));
                Control::Next(Step::Eval((*source).clone()))
            }
            RawEff::Access(f) => Control::Next(Step::Succeed(f(&machine.env))),
            RawEff::Provide(source, env) => {
                let previous = std::mem::replace(&mut machine.env, env);
                machine.stack.push(Frame::RestoreEnv(previous));
                Control::Next(Step::Eval((*source).clone()))
            }
            RawEff::GetRuntime => Control::Next(Step::Succeed(wrap(this.runtime.clone()))),
            RawEff::Fork(source) => {
                let child = FiberInner::spawn(this.runtime.clone(), machine.env.clone());
                FiberInner::start(&child, (*source).clone());
                Control::Next(Step::Succeed(wrap(child)))
            }
            RawEff::Async(register) => {
                let fiber = Rc::clone(this);
                let handle = this.runtime.scheduler().asap(Box::new(move || {
                    if fiber.is_terminal() {
                        return;
                    }
                    let resolver = RawResolver::new({
                        let fiber = Rc::clone(&fiber);
                        move |exit: RawExit| {
                            if fiber.is_terminal() {
                                return;
                            }
                            match exit {
                                RawExit::Success(value) => {
                                    Self::schedule_resume(&fiber, Step::Succeed(value))
                                }
                                RawExit::Failure(error) => {
                                    Self::schedule_resume(&fiber, Step::Fail(error))
                                }
                                RawExit::Interrupted => fiber.abort_now(),
                            }
                        }
                    });
                    let probe = resolver.clone();
                    let registered = register(resolver);
                    // if the registration resolved synchronously, the resume
                    // tick's handle is already installed; keep it
                    if !probe.fired() && !fiber.is_terminal() {
                        fiber.core.borrow_mut().cancel = Some(registered);
                    }
                }));
                this.core.borrow_mut().cancel = Some(handle);
                Control::Suspend
            }
            RawEff::Never => Control::Suspend,
        }
    }

    fn complete(&self, exit: RawExit) {
        let waiters = {
            let mut core = self.core.borrow_mut();
            if core.status.is_terminal() {
                return;
            }
            core.status = Status::Done(exit.clone());
            core.cancel = None;
            std::mem::take(&mut core.waiters)
        };
        trace!(fiber = self.id, outcome = exit.tag(), "fiber completed");
        for waiter in waiters {
            waiter(&exit);
        }
    }

    /// Abort: terminal statuses are untouched; otherwise mark interrupted,
    /// cancel the outstanding handle, drop the remaining stack and notify
    /// every waiter exactly once.
    pub(crate) fn abort_now(&self) {
        let (cancel, waiters) = {
            let mut core = self.core.borrow_mut();
            if core.status.is_terminal() {
                return;
            }
            core.status = Status::Done(RawExit::Interrupted);
            (core.cancel.take(), std::mem::take(&mut core.waiters))
        };
        debug!(fiber = self.id, "fiber aborted");
        if let Some(handle) = cancel {
            handle.cancel();
        }
        // the machine is borrowed when a fiber aborts itself mid-loop;
        // the loop clears its own stack in that case
        if let Ok(mut machine) = self.machine.try_borrow_mut() {
            machine.stack.clear();
        }
        let exit = RawExit::Interrupted;
        for waiter in waiters {
            waiter(&exit);
        }
    }

    /// Register a completion callback; fires immediately if the fiber is
    /// already terminal.
    pub(crate) fn on_exit(&self, callback: Box<dyn FnOnce(&RawExit)>) {
        let mut callback = Some(callback);
        let exit = {
            let mut core = self.core.borrow_mut();
            match &core.status {
                Status::Pending => {
                    core.waiters.push(callback.take().expect("callback taken once"));
                    None
                }
                Status::Done(exit) => Some(exit.clone()),
            }
        };
        if let Some(exit) = exit {
            (callback.take().expect("callback taken once"))(&exit);
        }
    }
}

// ============================================================================
// Async resolution plumbing
// ============================================================================

/// Erased resume callback: first resolve wins, later calls are ignored.
#[derive(Clone)]
pub(crate) struct RawResolver {
    state: Rc<ResolverState>,
}

struct ResolverState {
    fired: Cell<bool>,
    deliver: Box<dyn Fn(RawExit)>,
}

impl RawResolver {
    pub(crate) fn new(deliver: impl Fn(RawExit) + 'static) -> Self {
        Self {
            state: Rc::new(ResolverState {
                fired: Cell::new(false),
                deliver: Box::new(deliver),
            }),
        }
    }

    pub(crate) fn resolve(&self, exit: RawExit) {
        if self.state.fired.get() {
            return;
        }
        self.state.fired.set(true);
        (self.state.deliver)(exit);
    }

    pub(crate) fn fired(&self) -> bool {
        self.state.fired.get()
    }
}

// ============================================================================
// The typed fiber handle
// ============================================================================

/// External reference to a running (or finished) evaluation.
pub struct Fiber<A, E = Infallible> {
    inner: Rc<FiberInner>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber(id={}, {})", self.inner.id(), self.inner.status_tag())
    }
}

impl<A, E> Fiber<A, E>
where
    A: Clone + 'static,
    E: Clone + 'static,
{
    pub(crate) fn from_inner(inner: Rc<FiberInner>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    pub(crate) fn inner(&self) -> &Rc<FiberInner> {
        &self.inner
    }

    /// Unique fiber id, for diagnostics.
    pub fn id(&self) -> u64 {
        self.inner.id()
    }

    /// Resume with the fiber's exit: `Some(Ok)` / `Some(Err)` on
    /// completion, `None` if it was aborted.
    pub fn await_exit<E2, R>(&self) -> Eff<Option<Result<A, E>>, E2, R>
    where
        E2: Clone + 'static,
        R: 'static,
    {
        let inner = self.inner.clone();
        Eff::from_raw(RawEff::Async(Rc::new(move |resolver: RawResolver| {
            inner.on_exit(Box::new(move |exit: &RawExit| {
                let value: Option<Result<A, E>> = match exit {
                    RawExit::Success(v) => Some(Ok(peek::<A>(v))),
                    RawExit::Failure(e) => Some(Err(peek::<E>(e))),
                    RawExit::Interrupted => None,
                };
                resolver.resolve(RawExit::Success(wrap(value)));
            }));
            CancelHandle::noop()
        })))
    }

    /// Await the fiber and propagate its success or failure into the
    /// current fiber. If the target was aborted, `join` never resumes;
    /// use [`Fiber::await_exit`] to observe aborts.
    pub fn join<R>(&self) -> Eff<A, E, R>
    where
        R: 'static,
    {
        self.await_exit().and_then(|exit| match exit {
            Some(Ok(a)) => Eff::succeed(a),
            Some(Err(e)) => Eff::fail(e),
            None => Eff::never(),
        })
    }

    /// Abort the fiber: a no-op on terminal fibers, otherwise interrupts
    /// the outstanding cancellation, marks the fiber interrupted and
    /// notifies its waiters once.
    pub fn abort<E2, R>(&self) -> Eff<(), E2, R>
    where
        E2: Clone + 'static,
        R: 'static,
    {
        let inner = self.inner.clone();
        Eff::from_raw(RawEff::Sync(Rc::new(move || {
            inner.abort_now();
            Ok(wrap(()))
        })))
    }
}
