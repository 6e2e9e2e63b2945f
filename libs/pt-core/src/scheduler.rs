// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::channel::Channel;
use crate::error::SchedulerError;
use crate::loom::{Condvar, Mutex};
use crate::task::{Location, Poll as TaskPoll, Resume, Task};
use pt_list::List;
use static_assertions::const_assert;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// The larger of the two bucket counts `original_source` was observed
/// using; see [`Scheduler::with_bucket_count`] for the smaller one.
pub const DEFAULT_BUCKET_COUNT: usize = 4096;

const_assert!(DEFAULT_BUCKET_COUNT.is_power_of_two());

struct Locked {
    ready: List<Task>,
    wait: Vec<List<Task>>,
    nthread: usize,
    nrunning: usize,
    quiescing: bool,
    closing: bool,
    workers_running: usize,
    workers_total: usize,
    worker_handles: Vec<JoinHandle<()>>,
    ready_hook: Option<Arc<dyn Fn() + Send + Sync>>,
}

struct Shared {
    state: Mutex<Locked>,
    condvar: Condvar,
    max_workers: usize,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let locked = self.state.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert_eq!(
            locked.nthread, 0,
            "scheduler dropped with live tasks; call Scheduler::shutdown() first"
        );
        debug_assert_eq!(locked.nrunning, 0);
        debug_assert!(
            locked.worker_handles.is_empty(),
            "scheduler dropped without shutdown() joining its workers"
        );
    }
}

/// The scheduler: owns the ready list, the wait-channel hash, and (when
/// `max_workers > 0`) a pool of OS worker threads.
///
/// Cloning a `Scheduler` is cheap (it's a handle around an [`Arc`]); every
/// clone refers to the same underlying engine. Worker threads each hold
/// one such clone so they can keep resuming tasks after the handle that
/// created the scheduler goes out of scope.
#[derive(Clone)]
pub struct Scheduler(Arc<Shared>);

enum Growth {
    None,
    NotifyOne,
    Spawn,
}

impl Scheduler {
    /// Creates a scheduler with the default 4096-bucket wait-channel hash.
    ///
    /// `max_workers == 0` selects the single-worker variant: no OS thread
    /// is ever spawned, and the embedder drives progress by calling
    /// [`Scheduler::run_once`] itself. `max_workers >= 1` selects the
    /// multi-worker variant, growing a pool of OS threads on demand up to
    /// `max_workers`.
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        Self::with_bucket_count(max_workers, DEFAULT_BUCKET_COUNT)
    }

    /// Like [`Scheduler::new`], but with an explicitly chosen wait-channel
    /// bucket count (the smaller configuration `original_source` was seen
    /// using was 16).
    ///
    /// # Panics
    ///
    /// Panics if `bucket_count` is not a power of two.
    #[must_use]
    pub fn with_bucket_count(max_workers: usize, bucket_count: usize) -> Self {
        assert!(
            bucket_count.is_power_of_two(),
            "wait-channel bucket count must be a power of two, got {bucket_count}"
        );
        let wait = (0..bucket_count).map(|_| List::new()).collect();
        Self(Arc::new(Shared {
            state: Mutex::new(Locked {
                ready: List::new(),
                wait,
                nthread: 0,
                nrunning: 0,
                quiescing: false,
                closing: false,
                workers_running: 0,
                workers_total: 0,
                worker_handles: Vec::new(),
                ready_hook: None,
            }),
            condvar: Condvar::new(),
            max_workers,
        }))
    }

    /// Registers a callback fired when the scheduler transitions from
    /// empty to having work, or wakes a waiter. Typically used by a
    /// single-worker embedder to know when to call [`Scheduler::run_once`]
    /// again.
    pub fn set_ready_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.0.state.lock().unwrap().ready_hook = Some(Arc::new(hook));
    }

    /// The number of live tasks (ready, waiting, or currently resuming).
    pub fn task_count(&self) -> usize {
        self.0.state.lock().unwrap().nthread
    }

    /// Creates a new task and enqueues it on the ready list.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Spawn`] if the pool needed to grow to
    /// keep up with demand and the OS refused to create a new thread. The
    /// task itself is still created and enqueued; a smaller pool (or the
    /// caller driving `run_once` itself) will still make progress on it.
    pub fn create_task<R>(&self, resume: R, name: &'static str) -> Result<TaskHandle, SchedulerError>
    where
        R: Resume + 'static,
    {
        let task = Task::new(Box::new(resume), name);
        let handle = TaskHandle {
            scheduler: self.clone(),
            task: task.clone(),
        };

        let (growth, was_empty) = {
            let mut locked = self.0.state.lock().unwrap();
            locked.nthread += 1;
            let was_empty = locked.ready.is_empty() && locked.nrunning == 0;
            // Safety: freshly created, not linked into any list yet.
            unsafe { task.inner_mut().location = Location::Ready };
            locked.ready.push_back(task);
            let growth = self.decide_growth(&mut locked);
            (growth, was_empty)
        };
        trace!(name, "task created");
        self.apply_growth(growth)?;
        if was_empty {
            self.fire_ready_hook();
        }
        Ok(handle)
    }

    /// Runs one ready task to completion of its current activation.
    ///
    /// This is the single-worker variant's entry point: the embedder
    /// calls it repeatedly (directly, or from an external event loop
    /// woken by the ready hook) to pump the scheduler. Returns `true` if
    /// more ready work remains.
    pub fn run_once(&self) -> bool {
        let task = {
            let mut locked = self.0.state.lock().unwrap();
            let Some(task) = locked.ready.pop_front() else {
                return false;
            };
            // Safety: just unlinked from ready, not resuming yet, so we
            // have exclusive access to mutate its location.
            unsafe { task.inner_mut().location = Location::Resuming };
            locked.nrunning += 1;
            task
        };

        let cx = Context {
            scheduler: self,
            task: task.clone(),
        };
        let poll = {
            // Safety: the task is in the `Resuming` location, unlinked
            // from every list; this worker has exclusive access to its
            // resume box for the duration of this call.
            let resume = unsafe { task.inner_mut() }
                .resume
                .as_mut()
                .expect("resume() called on a task that already returned Done");
            resume.resume(&cx)
        };

        let mut locked = self.0.state.lock().unwrap();
        locked.nrunning -= 1;
        match poll {
            TaskPoll::Done => {
                locked.nthread -= 1;
                // Safety: resume returned, task is unlinked and idle.
                unsafe { task.inner_mut().location = Location::Detached };
                let hook = unsafe { task.inner_mut() }.exit_hook.take();
                drop(locked);
                debug!(name = task.name(), "task done");
                if let Some(hook) = hook {
                    hook();
                }
                locked = self.0.state.lock().unwrap();
            }
            TaskPoll::Wait => {
                debug_assert_ne!(
                    task.location(),
                    Location::Resuming,
                    "a resume function returned Wait without calling \
                     Context::wait or Context::yield_now first"
                );
            }
        }
        !locked.ready.is_empty()
    }

    /// Wakes the single oldest task waiting on `channel`, if any.
    pub fn signal(&self, channel: Channel) {
        self.wake(channel, false);
    }

    /// Wakes every task waiting on `channel`.
    pub fn broadcast(&self, channel: Channel) {
        self.wake(channel, true);
    }

    fn wake(&self, channel: Channel, wake_all: bool) {
        let (growth, woke_any) = {
            let mut locked = self.0.state.lock().unwrap();
            let bucket = channel.bucket(locked.wait.len());
            let mut woke_any = false;
            loop {
                let found = locked.wait[bucket]
                    .iter()
                    // Safety: every pointer `iter` yields is a live node
                    // currently linked into this bucket's list.
                    .find(|ptr| unsafe { ptr.as_ref().channel() } == Some(channel));
                let Some(ptr) = found else { break };
                // Safety: `ptr` was just found linked into this exact bucket.
                let task = unsafe { locked.wait[bucket].remove(ptr) }
                    .expect("node found by iteration must be removable");
                // Safety: just unlinked, not yet relinked.
                unsafe { task.inner_mut().location = Location::Ready };
                locked.ready.push_back(task);
                woke_any = true;
                if !wake_all {
                    break;
                }
            }
            let growth = if woke_any {
                self.decide_growth(&mut locked)
            } else {
                Growth::None
            };
            (growth, woke_any)
        };

        if let Err(err) = self.apply_growth(growth) {
            warn!(%err, "failed to grow worker pool after signal/broadcast");
        }
        if woke_any {
            self.fire_ready_hook();
        }
    }

    /// Blocks until the ready list is empty and no resume is in flight.
    ///
    /// Tasks parked on wait buckets do not prevent quiescence: the
    /// guarantee is "no more forward progress will occur until an
    /// external `signal`/`broadcast` arrives", not "no tasks exist".
    pub fn quiesce(&self) {
        let mut locked = self.0.state.lock().unwrap();
        locked.quiescing = true;
        if self.0.max_workers > 0 {
            while !locked.ready.is_empty() || locked.nrunning > 0 {
                locked = self.0.condvar.wait(locked).unwrap();
                // In case this wakeup wasn't meant for us, pass it on.
                self.0.condvar.notify_one();
            }
        } else {
            drop(locked);
            while self.run_once() {}
            locked = self.0.state.lock().unwrap();
        }
        locked.quiescing = false;
    }

    /// Tears the scheduler down: stops accepting new worker growth,
    /// wakes and joins every worker thread, and asserts the scheduler is
    /// fully empty.
    ///
    /// # Panics
    ///
    /// Panics (via assertion) if any task is still alive. Embedders must
    /// `kill` or drain all tasks before calling this.
    pub fn shutdown(&self) {
        let handles = {
            let mut locked = self.0.state.lock().unwrap();
            locked.closing = true;
            self.0.condvar.notify_all();
            std::mem::take(&mut locked.worker_handles)
        };
        for handle in handles {
            let _ = handle.join();
        }
        let locked = self.0.state.lock().unwrap();
        assert_eq!(locked.nthread, 0, "scheduler torn down with live tasks");
        assert_eq!(locked.nrunning, 0, "scheduler torn down mid-resume");
        for bucket in &locked.wait {
            assert!(bucket.is_empty(), "scheduler torn down with waiting tasks");
        }
        assert!(locked.ready.is_empty());
    }

    pub(crate) fn kill_task(&self, task: &Arc<Task>) -> bool {
        let (removed, hook) = {
            let mut locked = self.0.state.lock().unwrap();
            let ptr = NonNull::from(task.as_ref());
            let removed = match task.location() {
                Location::Ready => unsafe { locked.ready.remove(ptr) },
                Location::Waiting => {
                    let channel = task
                        .channel()
                        .expect("a Waiting task always has a channel");
                    let bucket = channel.bucket(locked.wait.len());
                    unsafe { locked.wait[bucket].remove(ptr) }
                }
                // Already gone, or currently resuming: killing an
                // in-flight resume is not supported.
                Location::Resuming | Location::Detached => None,
            };
            let hook = if removed.is_some() {
                locked.nthread -= 1;
                // Safety: just unlinked by the removal above.
                unsafe { task.inner_mut().location = Location::Detached };
                unsafe { task.inner_mut() }.exit_hook.take()
            } else {
                None
            };
            (removed.is_some(), hook)
        };
        if removed {
            debug!(name = task.name(), "task killed");
            if let Some(hook) = hook {
                hook();
            }
        }
        removed
    }

    pub(crate) fn reset_task(&self, task: &Arc<Task>) {
        let _locked = self.0.state.lock().unwrap();
        assert!(
            matches!(task.location(), Location::Ready | Location::Waiting),
            "reset() called on a task that is currently resuming or already done"
        );
        // Safety: the scheduler mutex is held and the task is not
        // currently resuming, so we have exclusive access to its resume box.
        unsafe { task.inner_mut() }
            .resume
            .as_mut()
            .expect("resume box present on a live task")
            .reset();
    }

    pub(crate) fn set_exit_hook(&self, task: &Arc<Task>, hook: Box<dyn FnOnce() + Send>) {
        let _locked = self.0.state.lock().unwrap();
        // Safety: mutating `exit_hook` is synchronized by the scheduler mutex.
        unsafe { task.inner_mut() }.exit_hook = Some(hook);
    }

    fn decide_growth(&self, locked: &mut Locked) -> Growth {
        if self.0.max_workers == 0 {
            return Growth::None;
        }
        if locked.workers_running < locked.workers_total {
            Growth::NotifyOne
        } else if locked.workers_total < self.0.max_workers {
            locked.workers_total += 1;
            Growth::Spawn
        } else {
            Growth::None
        }
    }

    fn apply_growth(&self, growth: Growth) -> Result<(), SchedulerError> {
        match growth {
            Growth::None => Ok(()),
            Growth::NotifyOne => {
                self.0.condvar.notify_one();
                Ok(())
            }
            // Deliberately spawned outside the scheduler mutex: growing the
            // pool under the lock is fine, but blocking on `thread::spawn`
            // while holding it would stall every other scheduler operation.
            Growth::Spawn => match self.spawn_worker() {
                Ok(handle) => {
                    self.0.state.lock().unwrap().worker_handles.push(handle);
                    Ok(())
                }
                Err(err) => {
                    self.0.state.lock().unwrap().workers_total -= 1;
                    Err(err)
                }
            },
        }
    }

    fn spawn_worker(&self) -> Result<JoinHandle<()>, SchedulerError> {
        let scheduler = self.clone();
        thread::Builder::new()
            .name("pt-worker".into())
            .spawn(move || scheduler.worker_loop())
            .map_err(SchedulerError::Spawn)
    }

    fn worker_loop(self) {
        let mut locked = self.0.state.lock().unwrap();
        locked.workers_running += 1;
        loop {
            drop(locked);
            while self.run_once() {}

            locked = self.0.state.lock().unwrap();
            if locked.closing {
                break;
            }
            // Re-check under the same lock we just observed `ready` empty
            // with: a signal/broadcast/create_task from outside any worker
            // can land in the window between `run_once`'s last unlock and
            // here. Looping back (without ever dropping the lock in
            // between a `ready` check and parking) is what the C
            // original's `protothread_run`-returns-locked, continuously
            // held mutex gives for free; re-checking here restores the
            // same observe-empty-and-park atomicity.
            if !locked.ready.is_empty() {
                continue;
            }
            locked.workers_running -= 1;
            if locked.quiescing {
                self.0.condvar.notify_all();
            }
            locked = self.0.condvar.wait(locked).unwrap();
            locked.workers_running += 1;
        }
        locked.workers_running -= 1;
    }

    fn fire_ready_hook(&self) {
        let hook = self.0.state.lock().unwrap().ready_hook.clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// A handle to a task created via [`Scheduler::create_task`].
///
/// Cloning a `TaskHandle` is cheap; all clones refer to the same task.
/// Once the task terminates (by returning [`crate::Poll::Done`] or by
/// [`TaskHandle::kill`]), the handle is still valid to hold (and drop) —
/// per the spec, the descriptor becomes the caller's to free, which in
/// this crate simply means the last `TaskHandle` clone being dropped.
#[derive(Clone)]
pub struct TaskHandle {
    scheduler: Scheduler,
    task: Arc<Task>,
}

impl TaskHandle {
    /// The scheduler this task belongs to.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// This task's debug name.
    pub fn name(&self) -> &'static str {
        self.task.name()
    }

    /// Cancels the task if it is ready or parked on a wait channel.
    ///
    /// Returns `false` (a no-op) if the task already terminated or is
    /// currently resuming — cancelling an in-flight resume is not
    /// supported and must be encoded by the task itself.
    pub fn kill(&self) -> bool {
        self.scheduler.kill_task(&self.task)
    }

    /// Clears the task's saved resume point so its next activation
    /// restarts from the top.
    ///
    /// # Panics
    ///
    /// Panics if the task is currently resuming or already terminated.
    pub fn reset(&self) {
        self.scheduler.reset_task(&self.task);
    }

    /// Registers a hook invoked exactly once when this task terminates
    /// (by `Done`, by `kill`, or during scheduler teardown).
    pub fn set_exit_hook(&self, hook: impl FnOnce() + Send + 'static) {
        self.scheduler.set_exit_hook(&self.task, Box::new(hook));
    }
}

/// A task's handle back into the scheduler that owns it, passed to
/// [`Resume::resume`] on every activation.
pub struct Context<'a> {
    scheduler: &'a Scheduler,
    task: Arc<Task>,
}

impl<'a> Context<'a> {
    /// The scheduler this task is running on.
    pub fn scheduler(&self) -> &Scheduler {
        self.scheduler
    }

    /// Parks the current task on `channel` and arranges for the resume
    /// function to return [`crate::Poll::Wait`] next.
    ///
    /// `app_guard` is the embedder's own lock guard, held across the
    /// check of whatever condition this task is waiting for. It is
    /// dropped only *after* this call has taken the scheduler's internal
    /// lock, which is what makes the check-then-wait pattern race-free:
    /// any concurrent `signal`/`broadcast` for this channel must also
    /// take the scheduler lock before it can move this task, so it can
    /// never run between the embedder's check and this enqueue. Pass
    /// `()` if there is no embedder-level lock (e.g. the single-worker
    /// variant, which is already fully serialized).
    ///
    /// # Panics
    ///
    /// Caller must not have already called [`Context::wait`] or
    /// [`Context::yield_now`] during this activation.
    pub fn wait<G>(&self, channel: Channel, app_guard: G) {
        let mut locked = self.scheduler.0.state.lock().unwrap();
        // Acquire our lock, *then* release the caller's — this ordering
        // is what prevents lost wakeups.
        drop(app_guard);

        debug_assert_eq!(
            self.task.location(),
            Location::Resuming,
            "Context::wait called outside of this task's own resume()"
        );
        // Safety: this task is in the `Resuming` location and unlinked,
        // so we have exclusive access, and the scheduler mutex above
        // synchronizes this write with readers in `signal`/`broadcast`/`kill`.
        unsafe {
            self.task.inner_mut().channel = Some(channel);
            self.task.inner_mut().location = Location::Waiting;
        }
        let bucket = channel.bucket(locked.wait.len());
        locked.wait[bucket].push_back(self.task.clone());
    }

    /// Re-enqueues the current task onto the ready list, letting other
    /// ready tasks run before this one is resumed again.
    pub fn yield_now(&self) {
        let mut locked = self.scheduler.0.state.lock().unwrap();
        debug_assert_eq!(
            self.task.location(),
            Location::Resuming,
            "Context::yield_now called outside of this task's own resume()"
        );
        // Safety: see `wait`.
        unsafe { self.task.inner_mut().location = Location::Ready };
        locked.ready.push_back(self.task.clone());
    }

    /// Creates a new task on the same scheduler.
    ///
    /// # Errors
    ///
    /// See [`Scheduler::create_task`].
    pub fn create_task<R>(&self, resume: R, name: &'static str) -> Result<TaskHandle, SchedulerError>
    where
        R: Resume + 'static,
    {
        self.scheduler.create_task(resume, name)
    }

    /// Wakes the single oldest task waiting on `channel`.
    pub fn signal(&self, channel: Channel) {
        self.scheduler.signal(channel);
    }

    /// Wakes every task waiting on `channel`.
    pub fn broadcast(&self, channel: Channel) {
        self.scheduler.broadcast(channel);
    }
}
