// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::channel::Channel;
use pt_list::{Linked, Links};
use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// What a task's resume function returns: it either wants to be suspended
/// (having arranged its own wakeup via `wait` or `yield_now`) or it is
/// finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// The task suspended itself; it will be resumed later.
    Wait,
    /// The task has run to completion and will never be resumed again.
    Done,
}

/// A resumable computation.
///
/// This is the opaque `(fn, ctx) -> {WAIT, DONE}` contract: the runtime
/// never assumes anything about how a task advances internally. A resume
/// function is expected to pick up exactly where it last suspended — in
/// practice, implementors encode this as an explicit state machine (an
/// enum of suspension points) or a Rust generator, never by relying on
/// values that live only on the Rust call stack across a `resume()` call,
/// since nothing survives across suspension except what the `Resume`
/// implementor stores in `self`.
///
/// A child task can be driven to completion as a sub-step of a parent's
/// `resume()` by simply polling it first and forwarding `Poll::Wait` — the
/// idiomatic Rust replacement for the label/goto `pt_call` macro:
///
/// ```
/// use pt_core::{Context, Poll, Resume};
///
/// struct Parent<C> { child: C, child_done: bool }
///
/// impl<C: Resume> Resume for Parent<C> {
///     fn resume(&mut self, cx: &Context<'_>) -> Poll {
///         if !self.child_done {
///             match self.child.resume(cx) {
///                 Poll::Wait => return Poll::Wait,
///                 Poll::Done => self.child_done = true,
///             }
///         }
///         Poll::Done
///     }
/// }
/// ```
pub trait Resume: Send {
    /// Advances the task from its last suspension point.
    ///
    /// `cx` is this task's handle back into the owning scheduler; use it
    /// to call [`Context::wait`], [`Context::yield_now`], or to spawn and
    /// signal other tasks from within a resume function.
    fn resume(&mut self, cx: &crate::Context<'_>) -> Poll;

    /// Clears this task's saved resume point so the next `resume()` call
    /// restarts it from the top, per [`crate::TaskHandle::reset`].
    ///
    /// The default implementation panics; override it if this task is
    /// ever the target of a `reset`.
    fn reset(&mut self) {
        panic!("Resume::reset() not implemented for this task");
    }
}

/// Where a task currently lives, tracked purely for debug assertions (the
/// spec's "a task is on at most one list at any moment" invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Location {
    Ready,
    Waiting,
    Resuming,
    /// Terminated (by `Done` or `kill`) or never yet linked.
    Detached,
}

pub(crate) struct Inner {
    pub(crate) resume: Option<Box<dyn Resume>>,
    pub(crate) channel: Option<Channel>,
    pub(crate) exit_hook: Option<Box<dyn FnOnce() + Send>>,
    pub(crate) location: Location,
    pub(crate) name: &'static str,
}

/// A task's control block.
///
/// Tasks are reference-counted ([`Arc`]) so that a [`crate::TaskHandle`]
/// returned from [`crate::Scheduler::create_task`] can outlive the task's
/// time on the scheduler's internal lists.
///
/// # Safety invariant
///
/// [`Inner`]'s fields are mutated only while the owning scheduler's mutex
/// is held, *except* for the resume box, which is mutated only by the one
/// worker currently resuming this task — a task is linked into at most one
/// list (ready, one wait bucket) or held as "currently resuming" at a
/// time, so that worker has exclusive access. This mirrors the
/// `Links<Waiter>` discipline used for `WaitQueue` in this workspace's
/// async layer: the mutex must be held to touch the list, and the
/// (briefly) unlinked node may be touched without it.
pub struct Task {
    links: Links<Task>,
    inner: UnsafeCell<Inner>,
}

// Safety: see the struct-level safety invariant. `Task: Send` requires the
// boxed resume function to be `Send`, which the constructor enforces.
unsafe impl Send for Task {}
// Safety: see the struct-level safety invariant.
unsafe impl Sync for Task {}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Safety: debug formatting only reads; racing with a mutation
        // would at worst print a stale value, never UB, since all writes
        // go through the same `UnsafeCell` discipline described above.
        let inner = unsafe { &*self.inner.get() };
        f.debug_struct("Task")
            .field("name", &inner.name)
            .field("location", &inner.location)
            .field("channel", &inner.channel)
            .finish()
    }
}

impl Task {
    pub(crate) fn new(resume: Box<dyn Resume>, name: &'static str) -> Arc<Task> {
        Arc::new(Task {
            links: Links::new(),
            inner: UnsafeCell::new(Inner {
                resume: Some(resume),
                channel: None,
                exit_hook: None,
                location: Location::Detached,
                name,
            }),
        })
    }

    /// # Safety
    /// Caller must hold the owning scheduler's mutex, or know this task is
    /// not currently linked into any of the scheduler's lists.
    #[allow(clippy::mut_from_ref, reason = "see safety invariant documented above")]
    pub(crate) unsafe fn inner_mut(&self) -> &mut Inner {
        // Safety: caller's obligation, see doc above.
        unsafe { &mut *self.inner.get() }
    }

    pub(crate) fn channel(&self) -> Option<Channel> {
        // Safety: reading `channel` is only meaningful while the task is
        // parked on a wait bucket, which is always under the scheduler
        // mutex; racy reads otherwise are the caller's problem to avoid.
        unsafe { (*self.inner.get()).channel }
    }

    pub(crate) fn location(&self) -> Location {
        // Safety: see `channel`.
        unsafe { (*self.inner.get()).location }
    }

    pub fn name(&self) -> &'static str {
        // Safety: `name` is set once at construction and never mutated again.
        unsafe { (*self.inner.get()).name }
    }
}

// Safety: `Task` embeds exactly one `Links<Task>` field and it is never
// moved out from under a live pointer (it's heap-allocated behind `Arc`).
unsafe impl Linked for Task {
    type Handle = Arc<Task>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        let raw = Arc::into_raw(handle).cast_mut();
        // Safety: `Arc::into_raw` never returns null.
        unsafe { NonNull::new_unchecked(raw) }
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        // Safety: caller's obligation: `ptr` came from `into_ptr` and is
        // being converted back exactly once.
        unsafe { Arc::from_raw(ptr.as_ptr().cast_const()) }
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<Links<Self>> {
        // Safety: caller guarantees `ptr` is a live `Task`; `links` is a
        // plain field projection.
        unsafe { NonNull::new_unchecked(std::ptr::addr_of_mut!((*ptr.as_ptr()).links)) }
    }
}
