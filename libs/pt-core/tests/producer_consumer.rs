//! A producer and a consumer rendezvousing over a shared mailbox,
//! driven by the multi-worker variant, exercising `wait`/`signal`
//! together with an embedder-level mutex.

use pt_core::{Channel, Context, Poll, Resume, Scheduler};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

struct Mailbox {
    queue: Mutex<VecDeque<i32>>,
}

struct Producer {
    mailbox: Arc<Mailbox>,
    channel: Channel,
    remaining: i32,
}

impl Resume for Producer {
    fn resume(&mut self, cx: &Context<'_>) -> Poll {
        if self.remaining == 0 {
            return Poll::Done;
        }
        self.mailbox.queue.lock().unwrap().push_back(self.remaining);
        self.remaining -= 1;
        cx.signal(self.channel);
        cx.yield_now();
        Poll::Wait
    }
}

struct Consumer {
    mailbox: Arc<Mailbox>,
    channel: Channel,
    received: Arc<Mutex<Vec<i32>>>,
    expect: usize,
}

impl Resume for Consumer {
    fn resume(&mut self, cx: &Context<'_>) -> Poll {
        loop {
            let mut guard = self.mailbox.queue.lock().unwrap();
            let Some(item) = guard.pop_front() else {
                // Still holding `guard`: the scheduler mutex is taken
                // before it is released, so a producer that has already
                // locked the queue to push can't finish its `signal`
                // before we're parked to receive it.
                cx.wait(self.channel, guard);
                return Poll::Wait;
            };
            drop(guard);
            let mut received = self.received.lock().unwrap();
            received.push(item);
            if received.len() == self.expect {
                return Poll::Done;
            }
        }
    }
}

#[test]
fn producer_consumer_over_shared_mailbox() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let scheduler = Scheduler::new(4);
    let mailbox = Arc::new(Mailbox {
        queue: Mutex::new(VecDeque::new()),
    });
    let channel = Channel::from_ref(&*mailbox);
    let received = Arc::new(Mutex::new(Vec::new()));

    scheduler
        .create_task(
            Producer {
                mailbox: mailbox.clone(),
                channel,
                remaining: 50,
            },
            "producer",
        )
        .unwrap();
    scheduler
        .create_task(
            Consumer {
                mailbox,
                channel,
                received: received.clone(),
                expect: 50,
            },
            "consumer",
        )
        .unwrap();

    scheduler.quiesce();

    assert_eq!(received.lock().unwrap().len(), 50);
    scheduler.shutdown();
}
