//! Cooperative schedulers: the host contract the interpreter runs on
//!
//! The core only ever asks a scheduler for two things: run a thunk on the
//! next tick (`asap`) and run a thunk after a delay (`delay`). Both return
//! an idempotent [`CancelHandle`]. All thunks execute on a single thread of
//! control, one at a time, FIFO at equal readiness.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// A unit of work handed to a scheduler.
pub type Thunk = Box<dyn FnOnce()>;

/// An idempotent cancellation for a scheduled thunk or a running fiber.
///
/// Cancelling twice, or cancelling after the work already ran, is a no-op.
#[derive(Clone)]
pub struct CancelHandle {
    op: Rc<RefCell<Option<Thunk>>>,
}

impl CancelHandle {
    /// Wrap a cancellation action. The action runs at most once.
    pub fn new(op: impl FnOnce() + 'static) -> Self {
        Self {
            op: Rc::new(RefCell::new(Some(Box::new(op)))),
        }
    }

    /// A handle whose cancel does nothing (uncancellable registration).
    pub fn noop() -> Self {
        Self {
            op: Rc::new(RefCell::new(None)),
        }
    }

    /// Invoke the cancellation action if it has not run yet.
    pub fn cancel(&self) {
        let op = self.op.borrow_mut().take();
        if let Some(op) = op {
            op();
        }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.op.borrow().is_some() {
            "armed"
        } else {
            "spent"
        };
        write!(f, "CancelHandle({state})")
    }
}

/// The contract the interpreter assumes of its host.
pub trait Scheduler {
    /// Run `thunk` on the next scheduler tick.
    fn asap(&self, thunk: Thunk) -> CancelHandle;

    /// Run `thunk` after at least `wait` has elapsed.
    fn delay(&self, thunk: Thunk, wait: Duration) -> CancelHandle;

    /// Drive the scheduler until no runnable work and no pending timers
    /// remain. Used by `Runtime::unsafe_run_sync` and by tests.
    fn run_until_idle(&self);
}

/// A scheduled thunk plus its cancellation flag.
struct Scheduled {
    run: Thunk,
    cancelled: Rc<Cell<bool>>,
}

impl Scheduled {
    fn new(run: Thunk) -> (Self, CancelHandle) {
        let cancelled = Rc::new(Cell::new(false));
        let flag = cancelled.clone();
        let handle = CancelHandle::new(move || flag.set(true));
        (Self { run, cancelled }, handle)
    }

    fn fire(self) {
        if !self.cancelled.get() {
            (self.run)();
        }
    }
}

// ============================================================================
// Wall-clock event loop
// ============================================================================

/// Single-threaded wall-clock scheduler.
///
/// Ready thunks run FIFO; when the ready queue drains, the loop sleeps
/// until the earliest timer deadline, moves due timers onto the ready
/// queue, and continues.
pub struct EventLoop {
    ready: RefCell<VecDeque<Scheduled>>,
    /// Timers sorted by deadline; equal deadlines keep insertion order.
    timers: RefCell<Vec<(Instant, Scheduled)>>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            ready: RefCell::new(VecDeque::new()),
            timers: RefCell::new(Vec::new()),
        }
    }

    fn pop_ready(&self) -> Option<Scheduled> {
        self.ready.borrow_mut().pop_front()
    }

    /// Move timers whose deadline has passed onto the ready queue.
    /// Returns true if any moved.
    fn promote_due(&self, now: Instant) -> bool {
        let mut timers = self.timers.borrow_mut();
        let mut moved = false;
        while let Some((deadline, _)) = timers.first() {
            if *deadline <= now {
                let (_, task) = timers.remove(0);
                self.ready.borrow_mut().push_back(task);
                moved = true;
            } else {
                break;
            }
        }
        moved
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut timers = self.timers.borrow_mut();
        timers.retain(|(_, t)| !t.cancelled.get());
        timers.first().map(|(d, _)| *d)
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for EventLoop {
    fn asap(&self, thunk: Thunk) -> CancelHandle {
        let (task, handle) = Scheduled::new(thunk);
        self.ready.borrow_mut().push_back(task);
        handle
    }

    fn delay(&self, thunk: Thunk, wait: Duration) -> CancelHandle {
        let (task, handle) = Scheduled::new(thunk);
        let deadline = Instant::now() + wait;
        let mut timers = self.timers.borrow_mut();
        let pos = timers
            .iter()
            .position(|(d, _)| *d > deadline)
            .unwrap_or(timers.len());
        timers.insert(pos, (deadline, task));
        handle
    }

    fn run_until_idle(&self) {
        loop {
            while let Some(task) = self.pop_ready() {
                task.fire();
            }
            if self.promote_due(Instant::now()) {
                continue;
            }
            match self.next_deadline() {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        std::thread::sleep(deadline - now);
                    }
                    self.promote_due(Instant::now());
                }
                None => break,
            }
        }
    }
}

// ============================================================================
// Virtual-clock scheduler
// ============================================================================

/// Deterministic scheduler with a virtual millisecond clock.
///
/// Behaves like [`EventLoop`] except that time never passes on its own:
/// when the ready queue drains, the clock jumps to the earliest pending
/// deadline. Delays of equal length fire in submission order, so every
/// run of a program is identical. Intended for tests.
pub struct VirtualScheduler {
    ready: RefCell<VecDeque<Scheduled>>,
    timers: RefCell<Vec<(u64, Scheduled)>>,
    clock: Cell<u64>,
}

impl VirtualScheduler {
    pub fn new() -> Self {
        Self {
            ready: RefCell::new(VecDeque::new()),
            timers: RefCell::new(Vec::new()),
            clock: Cell::new(0),
        }
    }

    /// Current virtual time in milliseconds.
    pub fn now_millis(&self) -> u64 {
        self.clock.get()
    }

    fn promote_due(&self) -> bool {
        let now = self.clock.get();
        let mut timers = self.timers.borrow_mut();
        let mut moved = false;
        while let Some((due, _)) = timers.first() {
            if *due <= now {
                let (_, task) = timers.remove(0);
                self.ready.borrow_mut().push_back(task);
                moved = true;
            } else {
                break;
            }
        }
        moved
    }
}

impl Default for VirtualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for VirtualScheduler {
    fn asap(&self, thunk: Thunk) -> CancelHandle {
        let (task, handle) = Scheduled::new(thunk);
        self.ready.borrow_mut().push_back(task);
        handle
    }

    fn delay(&self, thunk: Thunk, wait: Duration) -> CancelHandle {
        let (task, handle) = Scheduled::new(thunk);
        let due = self.clock.get() + wait.as_millis() as u64;
        let mut timers = self.timers.borrow_mut();
        let pos = timers
            .iter()
            .position(|(d, _)| *d > due)
            .unwrap_or(timers.len());
        timers.insert(pos, (due, task));
        handle
    }

    fn run_until_idle(&self) {
        loop {
            while let Some(task) = {
                let popped = self.ready.borrow_mut().pop_front();
                popped
            } {
                task.fire();
            }
            let next = {
                let mut timers = self.timers.borrow_mut();
                timers.retain(|(_, t)| !t.cancelled.get());
                timers.first().map(|(d, _)| *d)
            };
            match next {
                Some(due) => {
                    self.clock.set(due.max(self.clock.get()));
                    self.promote_due();
                }
                None => break,
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
