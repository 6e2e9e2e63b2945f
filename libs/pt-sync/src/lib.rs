// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization primitives for tasks running on a [`pt_core::Scheduler`],
//! built entirely out of `wait`/`signal`/`broadcast` — neither of these
//! types spins or busy-polls; every non-immediate acquisition parks the
//! calling task until the channel it's waiting on is woken.
//!
//! Both primitives expose a `poll_*` step rather than a blocking
//! `acquire()` call: a task's own [`pt_core::Resume::resume`] has no
//! stack to suspend mid-function, so acquisition has to be a step the
//! task's own state machine calls and reacts to, the same way it would
//! call [`pt_core::Context::wait`] directly.

mod loom;
mod rwlock;
mod semaphore;

pub use rwlock::{LockPoll, ReadGuard, RwLock, Ticket, WriteGuard};
pub use semaphore::{Permit, Semaphore};
