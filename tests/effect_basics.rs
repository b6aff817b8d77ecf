//! Basic effect construction and sequencing
//!
//! These tests cover the synchronous core of the algebra: constructors,
//! map/and_then/catch chains, the environment reader, async adapters and
//! the runtime entry points.

use std::cell::Cell;
use std::convert::Infallible;
use std::rc::Rc;
use std::time::Duration;

use tephra::{CancelHandle, Eff, Exit, Panicked, Runtime, Task, VirtualScheduler, UIO};

fn runtime() -> Runtime {
    Runtime::with_scheduler(Rc::new(VirtualScheduler::new()))
}

fn run<A, E>(eff: Eff<A, E, ()>) -> Option<Exit<A, E>>
where
    A: Clone + 'static,
    E: Clone + 'static,
{
    runtime().unsafe_run_sync(eff)
}

// ============================================================================
// Constructors
// ============================================================================

mod constructors {
    use super::*;

    #[test]
    fn succeed_produces_success() {
        assert_eq!(run(Eff::<i32, String>::succeed(42)), Some(Exit::Success(42)));
    }

    #[test]
    fn fail_produces_failure() {
        assert_eq!(
            run(Eff::<i32, String>::fail("boom".into())),
            Some(Exit::Failure("boom".into()))
        );
    }

    #[test]
    fn from_fn_runs_the_thunk() {
        assert_eq!(run(Eff::<i32, String>::from_fn(|| 40 + 2)), Some(Exit::Success(42)));
    }

    #[test]
    fn from_fn_runs_lazily() {
        // constructing the effect must not run the thunk
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let eff: UIO<()> = Eff::from_fn(move || flag.set(true));
        assert!(!ran.get());

        run(eff);
        assert!(ran.get());
    }

    #[test]
    fn attempt_success() {
        // S1: a plain thunk succeeds with its value
        assert_eq!(run(Task::attempt(|| 42)), Some(Exit::Success(42)));
    }

    #[test]
    fn attempt_reifies_panics() {
        // S2: a panicking thunk fails with the reified message
        let result = run(Task::<i32>::attempt(|| panic!("FAILED")));
        assert_eq!(result, Some(Exit::Failure(Panicked("FAILED".into()))));
    }

    #[test]
    fn try_fn_maps_result_onto_channels() {
        assert_eq!(
            run(Eff::<i32, String>::try_fn(|| Ok(7))),
            Some(Exit::Success(7))
        );
        assert_eq!(
            run(Eff::<i32, String>::try_fn(|| Err("nope".to_string()))),
            Some(Exit::Failure("nope".into()))
        );
    }

    #[test]
    fn from_result_matches_either() {
        assert_eq!(run(Eff::<i32, i32>::from_result(Ok(1))), Some(Exit::Success(1)));
        assert_eq!(run(Eff::<i32, i32>::from_result(Err(2))), Some(Exit::Failure(2)));
    }

    #[test]
    fn suspend_substitutes_the_returned_effect() {
        let eff: Eff<i32, String> = Eff::suspend(|| Eff::succeed(5));
        assert_eq!(run(eff), Some(Exit::Success(5)));
    }

    #[test]
    fn never_does_not_terminate() {
        assert_eq!(run(Eff::<i32, String>::never()), None);
    }
}

// ============================================================================
// Sequencing and error handling
// ============================================================================

mod sequencing {
    use super::*;

    #[test]
    fn map_transforms_success() {
        let eff = Eff::<i32, String>::succeed(21).map(|n| n * 2);
        assert_eq!(run(eff), Some(Exit::Success(42)));
    }

    #[test]
    fn map_skips_failure() {
        let eff = Eff::<i32, String>::fail("e".into()).map(|n| n * 2);
        assert_eq!(run(eff), Some(Exit::Failure("e".into())));
    }

    #[test]
    fn and_then_chains_left_to_right() {
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());
        let eff: UIO<i32> = Eff::from_fn(move || {
            o1.borrow_mut().push("first");
            1
        })
        .and_then(move |n| {
            let o2 = o2.clone();
            Eff::from_fn(move || {
                o2.borrow_mut().push("second");
                n + 1
            })
        });

        assert_eq!(run(eff), Some(Exit::Success(2)));
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn failure_short_circuits_and_then() {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let eff = Eff::<i32, String>::fail("stop".into()).and_then(move |n| {
            flag.set(true);
            Eff::succeed(n)
        });

        assert_eq!(run(eff), Some(Exit::Failure("stop".into())));
        assert!(!ran.get());
    }

    #[test]
    fn catch_recovers_failure() {
        let eff = Eff::<i32, String>::fail("e".into()).catch(|_| Eff::<i32, String>::succeed(0));
        assert_eq!(run(eff), Some(Exit::Success(0)));
    }

    #[test]
    fn catch_passes_success_through() {
        let eff = Eff::<i32, String>::succeed(9).catch(|_| Eff::<i32, String>::succeed(0));
        assert_eq!(run(eff), Some(Exit::Success(9)));
    }

    #[test]
    fn map_err_rewrites_the_error() {
        let eff = Eff::<i32, i32>::fail(5).map_err(|e| e * 10);
        assert_eq!(run(eff), Some(Exit::Failure(50)));
    }

    #[test]
    fn and_runs_both_and_keeps_the_second_result() {
        let first_ran = Rc::new(Cell::new(false));
        let flag = first_ran.clone();
        let eff = Eff::<i32, String>::from_fn(move || {
            flag.set(true);
            1
        })
        .and(Eff::succeed(2));

        assert_eq!(run(eff), Some(Exit::Success(2)));
        assert!(first_ran.get());
    }

    #[test]
    fn and_short_circuits_on_the_first_failure() {
        let second_ran = Rc::new(Cell::new(false));
        let flag = second_ran.clone();
        let eff = Eff::<i32, String>::fail("stop".into()).and(Eff::from_fn(move || {
            flag.set(true);
            2
        }));

        assert_eq!(run(eff), Some(Exit::Failure("stop".into())));
        assert!(!second_ran.get());
    }

    #[test]
    fn widen_err_lifts_an_infallible_effect_into_a_fallible_chain() {
        let reliable: Eff<i32, Infallible> = Eff::from_fn(|| 21);
        let eff: Eff<i32, String> = reliable.widen_err::<String>().and_then(|n| {
            if n == 21 {
                Eff::succeed(n * 2)
            } else {
                Eff::fail("unexpected".into())
            }
        });
        assert_eq!(run(eff), Some(Exit::Success(42)));
    }

    #[test]
    fn widened_effect_still_carries_later_failures() {
        let eff: Eff<i32, String> = Eff::<i32, Infallible>::succeed(1)
            .widen_err::<String>()
            .and_then(|_| Eff::fail("later".into()));
        assert_eq!(run(eff), Some(Exit::Failure("later".into())));
    }

    #[test]
    fn zip_pairs_in_declared_order() {
        let eff = Eff::<i32, String>::succeed(1).zip(Eff::succeed(2));
        assert_eq!(run(eff), Some(Exit::Success((1, 2))));
    }

    #[test]
    fn sequence_collects_in_order() {
        let eff = Eff::<i32, String>::sequence(vec![
            Eff::succeed(1),
            Eff::succeed(2),
            Eff::succeed(3),
        ]);
        assert_eq!(run(eff), Some(Exit::Success(vec![1, 2, 3])));
    }

    #[test]
    fn sequence_stops_at_the_first_failure() {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let eff = Eff::<i32, String>::sequence(vec![
            Eff::succeed(1),
            Eff::fail("halt".into()),
            Eff::from_fn(move || {
                flag.set(true);
                3
            }),
        ]);

        assert_eq!(run(eff), Some(Exit::Failure("halt".into())));
        assert!(!ran.get());
    }
}

// ============================================================================
// Environment
// ============================================================================

mod environment {
    use super::*;

    #[derive(Clone)]
    struct Config {
        scale: i32,
    }

    #[test]
    fn access_reads_the_provided_environment() {
        let eff = Eff::<i32, String, Config>::access(|c| c.scale * 2).provide(Config { scale: 21 });
        assert_eq!(run(eff), Some(Exit::Success(42)));
    }

    #[test]
    fn inner_provide_shadows_and_restores() {
        let inner: Eff<i32, String, Config> = Eff::access(|c: &Config| c.scale);
        let shadowed: Eff<i32, String, Config> = inner.provide(Config { scale: 2 });
        let eff = shadowed
            .zip(Eff::access(|c: &Config| c.scale))
            .provide(Config { scale: 7 });

        // the inner effect sees its own environment, the outer read sees
        // the original again
        assert_eq!(run(eff), Some(Exit::Success((2, 7))));
    }

    #[test]
    fn environment_is_restored_on_failure_unwind() {
        let failing: Eff<i32, String, Config> =
            Eff::<i32, String, Config>::fail("e".into()).provide(Config { scale: 1 });
        let eff = failing
            .catch(|_| Eff::<i32, String, Config>::access(|c: &Config| c.scale))
            .provide(Config { scale: 3 });

        assert_eq!(run(eff), Some(Exit::Success(3)));
    }

    #[test]
    fn access_eff_flattens() {
        let eff = Eff::<i32, String, Config>::access_eff(|c| Eff::succeed(c.scale + 1))
            .provide(Config { scale: 4 });
        assert_eq!(run(eff), Some(Exit::Success(5)));
    }

    #[test]
    fn widen_env_runs_an_environment_free_effect_under_an_environment() {
        let plain: Eff<i32, String, ()> = Eff::succeed(2);
        let eff = plain
            .widen_env::<Config>()
            .zip_with(Eff::access(|c: &Config| c.scale), |a, b| a * b)
            .provide(Config { scale: 21 });
        assert_eq!(run(eff), Some(Exit::Success(42)));
    }
}

// ============================================================================
// Async adapters and timers
// ============================================================================

mod asynchronous {
    use super::*;

    #[test]
    fn from_async_resumes_with_success() {
        let eff = Eff::<i32, String>::from_async(|resolver| {
            resolver.succeed(5);
            CancelHandle::noop()
        });
        assert_eq!(run(eff), Some(Exit::Success(5)));
    }

    #[test]
    fn from_async_resumes_with_failure() {
        let eff = Eff::<i32, String>::from_async(|resolver| {
            resolver.fail("late".into());
            CancelHandle::noop()
        });
        assert_eq!(run(eff), Some(Exit::Failure("late".into())));
    }

    #[test]
    fn only_the_first_resolution_counts() {
        let eff = Eff::<i32, String>::from_async(|resolver| {
            resolver.succeed(1);
            resolver.succeed(2);
            resolver.fail("ignored".into());
            CancelHandle::noop()
        });
        assert_eq!(run(eff), Some(Exit::Success(1)));
    }

    #[test]
    fn from_async_uninterruptible_resolves() {
        let eff = Eff::<i32, String>::from_async_uninterruptible(|resolver| resolver.succeed(3));
        assert_eq!(run(eff), Some(Exit::Success(3)));
    }

    #[test]
    fn after_resolves_with_the_value() {
        let eff = Eff::<i32, String>::after(9, Duration::from_millis(50));
        assert_eq!(run(eff), Some(Exit::Success(9)));
    }

    #[test]
    fn sleep_orders_against_other_timers() {
        let scheduler = Rc::new(VirtualScheduler::new());
        let rt = Runtime::with_scheduler(scheduler.clone());
        let eff = Eff::<(), String>::sleep(Duration::from_millis(30))
            .and_then(|_| Eff::sleep(Duration::from_millis(20)));

        assert_eq!(rt.unsafe_run_sync(eff), Some(Exit::Success(())));
        assert_eq!(scheduler.now_millis(), 50);
    }

    #[test]
    fn delay_postpones_the_wrapped_effect() {
        let scheduler = Rc::new(VirtualScheduler::new());
        let rt = Runtime::with_scheduler(scheduler.clone());
        let eff = Eff::<i32, String>::succeed(4).delay(Duration::from_millis(25));

        assert_eq!(rt.unsafe_run_sync(eff), Some(Exit::Success(4)));
        assert_eq!(scheduler.now_millis(), 25);
    }
}

// ============================================================================
// Runtime entry points
// ============================================================================

mod runtime_surface {
    use super::*;

    #[test]
    fn unsafe_run_delivers_the_exit_once() {
        let rt = runtime();
        let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = seen.clone();

        rt.unsafe_run(Eff::<i32, String>::succeed(1), move |exit| {
            sink.borrow_mut().push(exit);
        });
        rt.scheduler().run_until_idle();

        assert_eq!(*seen.borrow(), vec![Exit::Success(1)]);
    }

    #[test]
    fn unsafe_run_handle_aborts_the_root_fiber() {
        let rt = runtime();
        let seen = Rc::new(std::cell::RefCell::new(None));
        let sink = seen.clone();

        let handle = rt.unsafe_run(
            Eff::<i32, String>::after(1, Duration::from_millis(100)),
            move |exit| {
                *sink.borrow_mut() = Some(exit);
            },
        );
        handle.cancel();
        rt.scheduler().run_until_idle();

        assert_eq!(*seen.borrow(), Some(Exit::Interrupted));
    }

    #[test]
    fn run_sync_on_the_wall_clock_loop() {
        // the default runtime drives a real event loop
        let rt = Runtime::new();
        let eff = Eff::<i32, Infallible>::succeed(10).delay(Duration::from_millis(1));
        assert_eq!(rt.unsafe_run_sync(eff), Some(Exit::Success(10)));
    }
}
