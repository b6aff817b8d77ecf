//! Tephra - a pure-effect runtime: typed effect descriptions interpreted
//! on single-threaded cooperative fibers, with racing, cancellation and
//! scoped resources

pub mod effect;
pub mod fiber;
pub mod latch;
pub mod managed;
pub mod outcome;
pub mod queue;
pub mod runtime;
pub mod scheduler;

pub use effect::{Eff, Resolver, Task, UIO};
pub use fiber::Fiber;
pub use latch::Latch;
pub use managed::Managed;
pub use outcome::{Exit, Panicked};
pub use queue::Queue;
pub use runtime::Runtime;
pub use scheduler::{CancelHandle, EventLoop, Scheduler, VirtualScheduler};
