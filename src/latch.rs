//! One-shot latch: a single-assignment cell carrying an effect
//!
//! The first [`set`](Latch::set) wins: it stores the effect, evaluates it
//! once on its own fiber, caches the exit, and flushes current and future
//! waiters with that exit. Later sets return `false` without evaluating
//! their argument. [`get`](Latch::get) suspends until the exit is
//! available; every observer shares it.
//!
//! The latch is the synchronization primitive under `race_with`, `once`,
//! `Managed` and `Queue`.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::effect::{wrap, Eff, RawEff};
use crate::fiber::{FiberInner, RawResolver};
use crate::outcome::RawExit;
use crate::runtime::Runtime;
use crate::scheduler::CancelHandle;

// ============================================================================
// Erased core
// ============================================================================

struct RawLatchState {
    /// The stored effect; set at most once.
    cell: Option<RawEff>,
    /// The stored effect's exit, once its fiber finishes.
    exit: Option<RawExit>,
    /// Resumers parked until the exit arrives.
    waiters: Vec<RawResolver>,
}

#[derive(Clone)]
pub(crate) struct RawLatch {
    state: Rc<RefCell<RawLatchState>>,
}

impl RawLatch {
    pub(crate) fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(RawLatchState {
                cell: None,
                exit: None,
                waiters: Vec::new(),
            })),
        }
    }

    /// First set wins: store `eff`, evaluate it once on a fresh fiber,
    /// flush waiters with its exit. Returns false (and evaluates nothing)
    /// if already set.
    pub(crate) fn set_now(&self, eff: RawEff, runtime: &Runtime) -> bool {
        {
            let mut state = self.state.borrow_mut();
            if state.cell.is_some() {
                return false;
            }
            state.cell = Some(eff.clone());
        }
        let fiber = FiberInner::spawn(runtime.clone(), wrap(()));
        let state = self.state.clone();
        fiber.on_exit(Box::new(move |exit: &RawExit| {
            let waiters = {
                let mut state = state.borrow_mut();
                state.exit = Some(exit.clone());
                std::mem::take(&mut state.waiters)
            };
            for waiter in waiters {
                waiter.resolve(exit.clone());
            }
        }));
        FiberInner::start(&fiber, eff);
        true
    }

    /// Suspend the caller until the exit is available.
    pub(crate) fn get_raw(&self) -> RawEff {
        let state = self.state.clone();
        RawEff::Async(Rc::new(move |resolver: RawResolver| {
            let ready = { state.borrow().exit.clone() };
            match ready {
                Some(exit) => resolver.resolve(exit),
                None => state.borrow_mut().waiters.push(resolver),
            }
            CancelHandle::noop()
        }))
    }

    #[cfg(test)]
    fn is_set(&self) -> bool {
        self.state.borrow().cell.is_some()
    }
}

// ============================================================================
// Typed surface
// ============================================================================

/// A one-shot effect cell.
pub struct Latch<A, E = std::convert::Infallible> {
    raw: RawLatch,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Latch<A, E> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> Latch<A, E>
where
    A: Clone + 'static,
    E: Clone + 'static,
{
    /// Construct an empty latch directly.
    pub fn new() -> Self {
        Self {
            raw: RawLatch::new(),
            _marker: PhantomData,
        }
    }

    /// Construct an empty latch as an effect.
    pub fn make<E2, R>() -> Eff<Latch<A, E>, E2, R>
    where
        E2: Clone + 'static,
        R: 'static,
    {
        Eff::from_fn(Latch::new)
    }

    /// Store `eff` if the latch is empty, evaluating it once and sharing
    /// its exit with every observer. Returns whether this call won.
    pub fn set<E2, R>(&self, eff: Eff<A, E, ()>) -> Eff<bool, E2, R>
    where
        E2: Clone + 'static,
        R: 'static,
    {
        let raw = self.raw.clone();
        Eff::runtime().and_then(move |rt: Runtime| {
            let raw = raw.clone();
            let eff = eff.clone();
            Eff::from_fn(move || raw.set_now(eff.raw.clone(), &rt))
        })
    }

    /// Suspend until the stored effect's exit is available, then share it.
    pub fn get<R>(&self) -> Eff<A, E, R>
    where
        R: 'static,
    {
        Eff::from_raw(self.raw.get_raw())
    }
}

impl<A, E> Default for Latch<A, E>
where
    A: Clone + 'static,
    E: Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
