//! Runtime: pairs a scheduler with the interpreter loop

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::effect::{wrap, Eff};
use crate::fiber::FiberInner;
use crate::outcome::Exit;
use crate::scheduler::{CancelHandle, EventLoop, Scheduler};

/// Entry point for running effects. Cheap to clone; all clones share the
/// same scheduler.
#[derive(Clone)]
pub struct Runtime {
    scheduler: Rc<dyn Scheduler>,
}

impl Runtime {
    /// A runtime on a fresh wall-clock event loop.
    pub fn new() -> Self {
        Self {
            scheduler: Rc::new(EventLoop::new()),
        }
    }

    /// A runtime on the given scheduler.
    pub fn with_scheduler(scheduler: Rc<dyn Scheduler>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Rc<dyn Scheduler> {
        &self.scheduler
    }

    /// Root a fiber for `eff`. `on_exit` receives the final outcome once;
    /// the returned handle aborts the fiber.
    ///
    /// The effect must be fully provided (`R = ()`); use
    /// [`Eff::provide`](crate::effect::Eff::provide) first otherwise.
    pub fn unsafe_run<A, E>(
        &self,
        eff: Eff<A, E, ()>,
        on_exit: impl FnOnce(Exit<A, E>) + 'static,
    ) -> CancelHandle
    where
        A: Clone + 'static,
        E: Clone + 'static,
    {
        let fiber = FiberInner::spawn(self.clone(), wrap(()));
        fiber.on_exit(Box::new(move |raw| on_exit(Exit::from_raw(raw))));
        FiberInner::start(&fiber, eff.raw);
        let root = fiber.clone();
        CancelHandle::new(move || root.abort_now())
    }

    /// Run `eff`, driving the scheduler until it is idle. Returns `None`
    /// if the fiber never terminated (e.g. it is suspended on `never`).
    pub fn unsafe_run_sync<A, E>(&self, eff: Eff<A, E, ()>) -> Option<Exit<A, E>>
    where
        A: Clone + 'static,
        E: Clone + 'static,
    {
        let slot: Rc<RefCell<Option<Exit<A, E>>>> = Rc::new(RefCell::new(None));
        let sink = slot.clone();
        self.unsafe_run(eff, move |exit| {
            *sink.borrow_mut() = Some(exit);
        });
        self.scheduler.run_until_idle();
        let result = slot.borrow_mut().take();
        result
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Runtime")
    }
}
