//! Broadcast correctness across many channels and many waiters per
//! channel: every waiter on a broadcast channel wakes, and no waiter on
//! a different channel is disturbed.

use pt_core::{Channel, Context, Poll, Resume, Scheduler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

struct Waiter {
    channel: Channel,
    parked: bool,
    woken: Arc<AtomicUsize>,
}

impl Resume for Waiter {
    fn resume(&mut self, cx: &Context<'_>) -> Poll {
        if self.parked {
            self.woken.fetch_add(1, Ordering::SeqCst);
            return Poll::Done;
        }
        self.parked = true;
        cx.wait(self.channel, ());
        Poll::Wait
    }
}

#[test]
fn broadcast_wakes_every_waiter_on_its_channel_only() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    const CHANNEL_COUNT: usize = 64;
    const TASKS_PER_CHANNEL: usize = 20;

    let scheduler = Scheduler::new(4);
    let channels: Vec<Channel> = (0..CHANNEL_COUNT)
        .map(|i| Channel::from_bits((i + 1) * 16))
        .collect();
    let woken = Arc::new(AtomicUsize::new(0));

    for &channel in &channels {
        for _ in 0..TASKS_PER_CHANNEL {
            scheduler
                .create_task(
                    Waiter {
                        channel,
                        parked: false,
                        woken: woken.clone(),
                    },
                    "waiter",
                )
                .unwrap();
        }
    }

    // Let every task reach its first suspension point before broadcasting.
    scheduler.quiesce();
    assert_eq!(woken.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.task_count(), CHANNEL_COUNT * TASKS_PER_CHANNEL);

    for &channel in &channels {
        scheduler.broadcast(channel);
    }
    scheduler.quiesce();

    assert_eq!(
        woken.load(Ordering::SeqCst),
        CHANNEL_COUNT * TASKS_PER_CHANNEL
    );
    assert_eq!(scheduler.task_count(), 0);
    scheduler.shutdown();
}

#[test]
fn signal_wakes_only_the_oldest_waiter() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let scheduler = Scheduler::new(0);
    let channel = Channel::from_bits(0xabc0);
    let woken = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        scheduler
            .create_task(
                Waiter {
                    channel,
                    parked: false,
                    woken: woken.clone(),
                },
                "waiter",
            )
            .unwrap();
    }
    while scheduler.run_once() {}
    assert_eq!(scheduler.task_count(), 3);

    scheduler.signal(channel);
    while scheduler.run_once() {}
    assert_eq!(woken.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.task_count(), 2);

    scheduler.signal(channel);
    scheduler.signal(channel);
    while scheduler.run_once() {}
    assert_eq!(woken.load(Ordering::SeqCst), 3);
    assert_eq!(scheduler.task_count(), 0);
    scheduler.shutdown();
}
