//! `kill` in every reachable task state, and `reset` restarting a
//! parked task from the top.

use pt_core::{Channel, Context, Poll, Resume, Scheduler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_trace() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default()
}

struct Parked;

impl Resume for Parked {
    fn resume(&mut self, cx: &Context<'_>) -> Poll {
        cx.wait(Channel::from_bits(0xdead0), ());
        Poll::Wait
    }
}

#[test]
fn kill_waiting_task_removes_it_and_fires_exit_hook() {
    let _trace = init_trace();
    let scheduler = Scheduler::new(0);
    let fired = Arc::new(AtomicBool::new(false));
    let handle = scheduler.create_task(Parked, "parked").unwrap();
    handle.set_exit_hook({
        let fired = fired.clone();
        move || fired.store(true, Ordering::SeqCst)
    });

    // First activation parks it on a wait channel.
    scheduler.run_once();

    assert!(handle.kill());
    assert!(fired.load(Ordering::SeqCst));
    assert_eq!(scheduler.task_count(), 0);
    // A second kill is a documented no-op, not an error.
    assert!(!handle.kill());
    scheduler.shutdown();
}

struct Never;

impl Resume for Never {
    fn resume(&mut self, _cx: &Context<'_>) -> Poll {
        panic!("a killed-while-ready task must never be resumed");
    }
}

#[test]
fn kill_ready_task_prevents_it_from_ever_running() {
    let _trace = init_trace();
    let scheduler = Scheduler::new(0);
    let handle = scheduler.create_task(Never, "never").unwrap();

    assert!(handle.kill());
    assert_eq!(scheduler.task_count(), 0);
    while scheduler.run_once() {}
    scheduler.shutdown();
}

struct Immediate;

impl Resume for Immediate {
    fn resume(&mut self, _cx: &Context<'_>) -> Poll {
        Poll::Done
    }
}

#[test]
fn kill_after_completion_is_a_no_op() {
    let _trace = init_trace();
    let scheduler = Scheduler::new(0);
    let handle = scheduler.create_task(Immediate, "immediate").unwrap();
    while scheduler.run_once() {}

    assert_eq!(scheduler.task_count(), 0);
    assert!(!handle.kill());
    scheduler.shutdown();
}

struct Restartable {
    ticks: u32,
    log: Arc<Mutex<Vec<u32>>>,
}

impl Resume for Restartable {
    fn resume(&mut self, cx: &Context<'_>) -> Poll {
        self.log.lock().unwrap().push(self.ticks);
        if self.ticks >= 2 {
            return Poll::Done;
        }
        self.ticks += 1;
        cx.yield_now();
        Poll::Wait
    }

    fn reset(&mut self) {
        self.ticks = 0;
    }
}

#[test]
fn reset_restarts_a_ready_task_from_the_top() {
    let _trace = init_trace();
    let scheduler = Scheduler::new(0);
    let log = Arc::new(Mutex::new(Vec::new()));
    let handle = scheduler
        .create_task(
            Restartable {
                ticks: 0,
                log: log.clone(),
            },
            "restartable",
        )
        .unwrap();

    scheduler.run_once(); // logs 0, ticks -> 1
    scheduler.run_once(); // logs 1, ticks -> 2

    handle.reset(); // task is sitting `Ready` between activations here.
    while scheduler.run_once() {}

    assert_eq!(*log.lock().unwrap(), vec![0, 1, 0, 1, 2]);
    scheduler.shutdown();
}

#[test]
#[should_panic(expected = "currently resuming")]
fn reset_during_resume_panics() {
    struct SelfResetting {
        handle: Arc<Mutex<Option<pt_core::TaskHandle>>>,
    }

    impl Resume for SelfResetting {
        fn resume(&mut self, _cx: &Context<'_>) -> Poll {
            self.handle.lock().unwrap().as_ref().unwrap().reset();
            Poll::Done
        }
    }

    let scheduler = Scheduler::new(0);
    let handle_slot = Arc::new(Mutex::new(None));
    let handle = scheduler
        .create_task(
            SelfResetting {
                handle: handle_slot.clone(),
            },
            "self-resetting",
        )
        .unwrap();
    *handle_slot.lock().unwrap() = Some(handle);

    scheduler.run_once();
}
