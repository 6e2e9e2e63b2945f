// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::Mutex;
use pt_core::{Channel, Context, Scheduler};
use std::sync::Arc;
use tracing::trace;

/// A counting semaphore.
///
/// Unlike [`crate::RwLock`], acquisition here is deliberately unfair: a
/// release wakes *every* waiter, and they all race to recheck the count,
/// so a task parked well before another can still lose out to it. This
/// matches the semaphore this crate's wait/signal primitives were
/// modeled on, which used the same broadcast-and-race release.
pub struct Semaphore {
    scheduler: Scheduler,
    count: Mutex<u64>,
}

impl Semaphore {
    /// Creates a semaphore with `initial` permits available.
    #[must_use]
    pub fn new(scheduler: Scheduler, initial: u64) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            count: Mutex::new(initial),
        })
    }

    fn channel(&self) -> Channel {
        Channel::from_ref(&self.count)
    }

    /// The current number of available permits. Racy the instant it's
    /// observed; useful for tests and diagnostics, not for control flow.
    pub fn available(&self) -> u64 {
        *self.count.lock().unwrap()
    }

    /// One step of acquisition, meant to be called from within a task's
    /// own [`pt_core::Resume::resume`].
    ///
    /// Returns `Some(permit)` immediately if a permit was free. Otherwise
    /// parks the current task on this semaphore's channel and returns
    /// `None` — the caller must propagate this as [`pt_core::Poll::Wait`]
    /// and call `try_acquire` again (not assume it will still need to
    /// wait) the next time it's resumed.
    pub fn try_acquire(self: &Arc<Self>, cx: &Context<'_>) -> Option<Permit> {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            trace!(remaining = *count, "semaphore acquired");
            Some(Permit { sem: self.clone() })
        } else {
            trace!("semaphore exhausted, parking");
            cx.wait(self.channel(), count);
            None
        }
    }
}

/// A held permit. Returns it to the semaphore (and wakes every waiter to
/// recheck) when dropped.
#[must_use = "a Permit is released when dropped; holding it briefly just to drop it immediately defeats the point of acquiring it"]
pub struct Permit {
    sem: Arc<Semaphore>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let count = {
            let mut count = self.sem.count.lock().unwrap();
            *count += 1;
            *count
        };
        trace!(available = count, "semaphore released");
        self.sem.scheduler.broadcast(self.sem.channel());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pt_core::{Poll, Resume};
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Step {
        Acquiring,
        Holding(Permit),
    }

    struct Worker {
        sem: Arc<Semaphore>,
        step: Option<Step>,
        iterations: u32,
        completions: Arc<AtomicUsize>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    impl Resume for Worker {
        fn resume(&mut self, cx: &Context<'_>) -> Poll {
            loop {
                match self.step.take() {
                    None => {
                        if self.iterations == 0 {
                            return Poll::Done;
                        }
                        self.iterations -= 1;
                        self.step = Some(Step::Acquiring);
                    }
                    Some(Step::Acquiring) => match self.sem.try_acquire(cx) {
                        Some(permit) => self.step = Some(Step::Holding(permit)),
                        None => {
                            self.step = Some(Step::Acquiring);
                            return Poll::Wait;
                        }
                    },
                    Some(Step::Holding(permit)) => {
                        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                        self.max_active.fetch_max(now_active, Ordering::SeqCst);
                        self.active.fetch_sub(1, Ordering::SeqCst);
                        self.completions.fetch_add(1, Ordering::SeqCst);
                        drop(permit);
                        cx.yield_now();
                        return Poll::Wait;
                    }
                }
            }
        }
    }

    #[test]
    fn only_one_holder_at_a_time_single_permit() {
        let scheduler = Scheduler::new(4);
        let sem = Semaphore::new(scheduler.clone(), 1);
        let completions = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            scheduler
                .create_task(
                    Worker {
                        sem: sem.clone(),
                        step: None,
                        iterations: 20,
                        completions: completions.clone(),
                        active: active.clone(),
                        max_active: max_active.clone(),
                    },
                    "worker",
                )
                .unwrap();
        }

        scheduler.quiesce();

        assert_eq!(completions.load(Ordering::SeqCst), 60);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(sem.available(), 1);
        scheduler.shutdown();
    }
}
