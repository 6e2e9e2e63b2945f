// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::{AtomicBool, Mutex};
use pt_core::{Channel, Context, Scheduler};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::trace;

/// One task's place in the admission queue: created the first time it's
/// polled, then handed back on every subsequent poll until `admitted`
/// flips.
pub struct Ticket {
    write: bool,
    admitted: AtomicBool,
}

struct State {
    queue: VecDeque<Arc<Ticket>>,
    active_readers: usize,
    active_writer: bool,
}

impl State {
    /// Admits as many leading tickets as current occupancy allows.
    ///
    /// Readers at the front admit together, possibly several at once.
    /// A pending writer at the front blocks every ticket behind it
    /// (including further readers) until it is itself admitted and
    /// later releases — this is what keeps the lock writer-starvation-free.
    fn advance(&mut self) {
        while let Some(front) = self.queue.front() {
            if front.write {
                if self.active_readers == 0 && !self.active_writer {
                    self.active_writer = true;
                    front.admitted.store(true, Ordering::Release);
                    self.queue.pop_front();
                }
                break;
            }
            if self.active_writer {
                break;
            }
            self.active_readers += 1;
            front.admitted.store(true, Ordering::Release);
            self.queue.pop_front();
        }
        trace!(
            active_readers = self.active_readers,
            active_writer = self.active_writer,
            queued = self.queue.len(),
            "rwlock admission pass"
        );
    }
}

/// Either `poll_read`/`poll_write` resolved with a guard, or the caller
/// must propagate [`pt_core::Poll::Wait`] and poll again on the next
/// activation (passing back the same `ticket`).
pub enum LockPoll<G> {
    Ready(G),
    Pending,
}

/// A reader/writer lock whose admission queue is strictly FIFO: a
/// pending writer can never be skipped over by readers that arrive
/// after it, so neither readers nor the writer can starve.
///
/// Unlike [`crate::Semaphore`], this does not use broadcast-and-race:
/// every waiter recomputes nothing on its own, admission decisions are
/// made once, centrally, in [`State::advance`], and each waiting task
/// just rechecks its own ticket.
pub struct RwLock<T> {
    scheduler: Scheduler,
    value: UnsafeCell<T>,
    state: Mutex<State>,
}

// Safety: `value` is only ever accessed through a `ReadGuard`/`WriteGuard`,
// whose existence implies this task won admission under `state`'s queue
// discipline, which is the only thing that hands out concurrent `&T` (to
// readers) or exclusive `&mut T` (to the one writer).
unsafe impl<T: Send> Send for RwLock<T> {}
// Safety: see above; shared `&RwLock<T>` access only ever reaches `value`
// through the same admission-checked guards.
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    #[must_use]
    pub fn new(scheduler: Scheduler, value: T) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            value: UnsafeCell::new(value),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                active_readers: 0,
                active_writer: false,
            }),
        })
    }

    fn channel(&self) -> Channel {
        Channel::from_ref(&self.value)
    }

    /// One step of read acquisition. `ticket` is the caller's own slot:
    /// start each fresh acquisition with `None`, and keep passing back
    /// whatever this leaves it as until it returns `Ready`.
    pub fn poll_read(self: &Arc<Self>, cx: &Context<'_>, ticket: &mut Option<Arc<Ticket>>) -> LockPoll<ReadGuard<T>> {
        let mut state = self.state.lock().unwrap();
        if let Some(t) = ticket {
            debug_assert!(!t.write, "poll_read called with a write ticket");
            if t.admitted.load(Ordering::Acquire) {
                *ticket = None;
                return LockPoll::Ready(ReadGuard { lock: self.clone() });
            }
            cx.wait(self.channel(), state);
            return LockPoll::Pending;
        }

        let fresh = Arc::new(Ticket {
            write: false,
            admitted: AtomicBool::new(false),
        });
        state.queue.push_back(fresh.clone());
        state.advance();
        if fresh.admitted.load(Ordering::Acquire) {
            return LockPoll::Ready(ReadGuard { lock: self.clone() });
        }
        *ticket = Some(fresh);
        cx.wait(self.channel(), state);
        LockPoll::Pending
    }

    /// One step of write acquisition; see [`RwLock::poll_read`].
    pub fn poll_write(self: &Arc<Self>, cx: &Context<'_>, ticket: &mut Option<Arc<Ticket>>) -> LockPoll<WriteGuard<T>> {
        let mut state = self.state.lock().unwrap();
        if let Some(t) = ticket {
            debug_assert!(t.write, "poll_write called with a read ticket");
            if t.admitted.load(Ordering::Acquire) {
                *ticket = None;
                return LockPoll::Ready(WriteGuard { lock: self.clone() });
            }
            cx.wait(self.channel(), state);
            return LockPoll::Pending;
        }

        let fresh = Arc::new(Ticket {
            write: true,
            admitted: AtomicBool::new(false),
        });
        state.queue.push_back(fresh.clone());
        state.advance();
        if fresh.admitted.load(Ordering::Acquire) {
            return LockPoll::Ready(WriteGuard { lock: self.clone() });
        }
        *ticket = Some(fresh);
        cx.wait(self.channel(), state);
        LockPoll::Pending
    }
}

/// A held read lock. Releases (and wakes every waiter to recheck its
/// ticket) when dropped.
#[must_use = "a ReadGuard releases the lock when dropped"]
pub struct ReadGuard<T> {
    lock: Arc<RwLock<T>>,
}

impl<T> Deref for ReadGuard<T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: holding this guard means `state.advance()` admitted us
        // as a reader; no writer can be admitted until every outstanding
        // reader (us included) drops, so no `&mut T` can alias this `&T`.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> Drop for ReadGuard<T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.active_readers -= 1;
        state.advance();
        drop(state);
        self.lock.scheduler.broadcast(self.lock.channel());
    }
}

/// A held write lock. Releases (and wakes every waiter) when dropped.
#[must_use = "a WriteGuard releases the lock when dropped"]
pub struct WriteGuard<T> {
    lock: Arc<RwLock<T>>,
}

impl<T> Deref for WriteGuard<T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: holding this guard means we are the sole admitted writer.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for WriteGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: see `Deref`; exclusivity makes `&mut` sound too.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for WriteGuard<T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.active_writer = false;
        state.advance();
        drop(state);
        self.lock.scheduler.broadcast(self.lock.channel());
    }
}
