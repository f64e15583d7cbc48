// Copyright 2026 taskmaster contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The `Master`: the object embedding applications actually hold (§2,
//! §6). This file covers lifecycle and the submission API (§4.6); the
//! fetch engine, cancellation, and synchronous execute live in their own
//! modules (`fetch.rs`, `cancel.rs`, `execute.rs`) and extend `Master`
//! with further `impl` blocks, the way `libs/async-exec` splits
//! `executor.rs` from `scheduler.rs` from `task/builder.rs` rather than
//! putting everything on one type in one file.

use crate::accounting::{self, AccountingKey, AccountingSnapshot, AccountingTable, TaskClassSet};
use crate::error::Result;
use crate::handle::{Handle, TaskArg};
use crate::io::{self, IoRegistry};
use crate::ready::TaskList;
use crate::table::{TaskId, TaskTable};
use crate::task::{SubmissionSite, Task, TaskClass, TaskFn, WakeCondition};
use crate::timer_heap::TimerHeap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Default threshold past which `call` logs a slow-task warning (§4.10).
/// Not named by the distilled spec's fixed constants; `original_source/`
/// exposes this as a tunable, carried forward as a `Master` config field
/// rather than a hardcoded value (see SPEC_FULL.md §6).
pub const DEFAULT_SLOW_TASK_THRESHOLD: Duration = Duration::from_millis(500);

pub(crate) struct MasterInner {
    pub(crate) table: TaskTable,
    pub(crate) io: IoRegistry,
    pub(crate) timers: TimerHeap,
    pub(crate) background: TimerHeap,
    pub(crate) ready: TaskList,
    pub(crate) events: TaskList,
}

/// Owns every pending task for one owner thread. See SPEC_FULL.md §2 and
/// §6 for the full external contract.
pub struct Master {
    pub(crate) owner: ThreadId,
    pub(crate) inner: Mutex<MasterInner>,
    pub(crate) self_weak: Weak<Master>,
    pub(crate) spin: AtomicBool,
    pub(crate) handle_signals: AtomicBool,
    pub(crate) selectpoll_timeout: AtomicI32,
    pub(crate) slow_task_threshold: Mutex<Duration>,
    pub(crate) signal_drain_hook: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    pub(crate) accounting: Arc<AccountingTable>,
    pub(crate) wake_read: RawFd,
    pub(crate) wake_write: RawFd,
}

impl Master {
    /// Create a new `Master` bound to the calling thread as its owner.
    ///
    /// Sizes the descriptor-indexed arrays from the process's open-file
    /// soft limit and opens the wake self-pipe.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ResourceLimit`] if `getrlimit` or the pipe
    /// creation syscalls fail.
    pub fn try_new() -> Result<Arc<Self>> {
        let fd_limit = io::fd_soft_limit()?;
        let (wake_read, wake_write) = io::wake_pipe()?;

        let master = Arc::new_cyclic(|self_weak| Master {
            owner: thread::current().id(),
            inner: Mutex::new(MasterInner {
                table: TaskTable::new(),
                io: IoRegistry::new(fd_limit),
                timers: TimerHeap::new(),
                background: TimerHeap::new(),
                ready: TaskList::new(),
                events: TaskList::new(),
            }),
            self_weak: self_weak.clone(),
            spin: AtomicBool::new(true),
            handle_signals: AtomicBool::new(false),
            selectpoll_timeout: AtomicI32::new(0),
            slow_task_threshold: Mutex::new(DEFAULT_SLOW_TASK_THRESHOLD),
            signal_drain_hook: Mutex::new(None),
            accounting: accounting::global(),
            wake_read,
            wake_write,
        });

        tracing::debug!(fd_limit, owner = ?master.owner, "master created");
        Ok(master)
    }

    /// Like [`Master::try_new`], but panics on failure. Most embedders
    /// call this once at startup, where a failed `getrlimit`/`pipe` is
    /// unrecoverable anyway.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::try_new().expect("failed to create Master")
    }

    /// Shrink the free list's backing storage. Does not affect any live
    /// task.
    pub fn free_unused(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.table.shrink_to_fit();
    }

    /// Whether `fetch` loops until something is ready (`true`, the
    /// default) or returns `None` immediately when idle (`false`).
    pub fn set_spin(&self, spin: bool) {
        self.spin.store(spin, Ordering::Release);
    }

    #[must_use]
    pub fn spin(&self) -> bool {
        self.spin.load(Ordering::Acquire)
    }

    /// Gate the signal-drain hook (§4.7 step 1).
    pub fn set_handle_signals(&self, handle_signals: bool) {
        self.handle_signals.store(handle_signals, Ordering::Release);
    }

    #[must_use]
    pub fn handle_signals(&self) -> bool {
        self.handle_signals.load(Ordering::Acquire)
    }

    /// Override the poll timeout computed in §4.7 step 4: positive = hard
    /// cap in milliseconds, negative = zero wait, zero = no override (use
    /// the computed value).
    pub fn set_selectpoll_timeout(&self, timeout_ms: i32) {
        self.selectpoll_timeout.store(timeout_ms, Ordering::Release);
    }

    #[must_use]
    pub fn selectpoll_timeout(&self) -> i32 {
        self.selectpoll_timeout.load(Ordering::Acquire)
    }

    pub fn set_slow_task_threshold(&self, threshold: Duration) {
        *self.slow_task_threshold.lock().unwrap() = threshold;
    }

    #[must_use]
    pub fn slow_task_threshold(&self) -> Duration {
        *self.slow_task_threshold.lock().unwrap()
    }

    /// Install the caller-supplied "drain pending signals" hook, invoked
    /// at the top of every fetch round when `handle_signals` is set
    /// (§4.7 step 1). The hook must be safe to call re-entrantly with
    /// respect to the scheduler (it may itself submit or cancel tasks).
    pub fn set_signal_drain_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.signal_drain_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    pub(crate) fn assert_owner(&self) {
        let current = thread::current().id();
        if current != self.owner {
            tracing::error!(?current, owner = ?self.owner, "called from a non-owner thread");
            debug_assert!(false, "fetch/cancel must only be called from the owner thread");
        }
    }

    fn wake(&self) {
        io::wake(self.wake_write);
    }

    /// Shared tail of every submission entry point: allocate a task
    /// record, bind it to `handle`, and register it for accounting.
    /// Callers still need to link the new id into the right structure
    /// (ready/event list, a heap, or the I/O registry) themselves, since
    /// that differs per class.
    fn finish_submit(
        &self,
        inner: &mut MasterInner,
        handle: &Handle,
        class: TaskClass,
        func: TaskFn,
        name: &'static str,
        arg: TaskArg,
        wake: WakeCondition,
        site: SubmissionSite,
    ) -> TaskId {
        let key = AccountingKey::new(func);
        self.accounting.lookup_or_insert(key, name);
        self.accounting.adjust_active(key, 1);

        let handle_clone = handle.clone();
        let owner = self.self_weak.clone();
        let id = inner.table.insert(move |id| {
            let mut task = Task::new(id, class, func, name, arg, wake, key, site);
            task.owner = owner;
            task.handle = Some(handle_clone);
            task
        });
        handle.set(Some(id));
        id
    }

    /// Register a read-readiness task for `fd`.
    ///
    /// Returns `true` if a new task was submitted, `false` if `handle`
    /// already named a live task (the idempotence contract, §4.6).
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DescriptorOutOfRange`] if `fd` is outside
    /// the range this `Master` was sized for.
    #[track_caller]
    pub fn try_add_read(
        &self,
        handle: &Handle,
        fd: RawFd,
        func: TaskFn,
        name: &'static str,
        arg: TaskArg,
    ) -> Result<bool> {
        let site = SubmissionSite::here(name);
        let mut inner = self.inner.lock().unwrap();
        if handle.is_live() {
            return Ok(false);
        }
        inner.io.check_range(fd)?;
        let id = self.finish_submit(&mut inner, handle, TaskClass::Read, func, name, arg, WakeCondition::Fd(fd), site);
        inner.io.register_read(fd, id).expect("range was already checked");
        drop(inner);
        self.wake();
        Ok(true)
    }

    /// Panicking convenience wrapper over [`Master::try_add_read`].
    ///
    /// # Panics
    ///
    /// Panics if `fd` is out of range for this `Master`.
    #[track_caller]
    pub fn add_read(&self, handle: &Handle, fd: RawFd, func: TaskFn, name: &'static str, arg: TaskArg) -> bool {
        self.try_add_read(handle, fd, func, name, arg)
            .expect("fd out of range for this Master")
    }

    /// Register a write-readiness task for `fd`. See [`Master::try_add_read`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DescriptorOutOfRange`] if `fd` is outside
    /// the range this `Master` was sized for.
    #[track_caller]
    pub fn try_add_write(
        &self,
        handle: &Handle,
        fd: RawFd,
        func: TaskFn,
        name: &'static str,
        arg: TaskArg,
    ) -> Result<bool> {
        let site = SubmissionSite::here(name);
        let mut inner = self.inner.lock().unwrap();
        if handle.is_live() {
            return Ok(false);
        }
        inner.io.check_range(fd)?;
        let id = self.finish_submit(&mut inner, handle, TaskClass::Write, func, name, arg, WakeCondition::Fd(fd), site);
        inner.io.register_write(fd, id).expect("range was already checked");
        drop(inner);
        self.wake();
        Ok(true)
    }

    /// Panicking convenience wrapper over [`Master::try_add_write`].
    ///
    /// # Panics
    ///
    /// Panics if `fd` is out of range for this `Master`.
    #[track_caller]
    pub fn add_write(&self, handle: &Handle, fd: RawFd, func: TaskFn, name: &'static str, arg: TaskArg) -> bool {
        self.try_add_write(handle, fd, func, name, arg)
            .expect("fd out of range for this Master")
    }

    /// Fire `func` once `delay` has elapsed (an absolute deadline computed
    /// as `now + delay` at submission time, §4.6).
    #[track_caller]
    pub fn add_timer(&self, handle: &Handle, delay: Duration, func: TaskFn, name: &'static str, arg: TaskArg) -> bool {
        self.add_timer_at(handle, Instant::now() + delay, func, name, arg)
    }

    /// Millisecond-delay convenience wrapper over [`Master::add_timer`].
    #[track_caller]
    pub fn add_timer_msec(
        &self,
        handle: &Handle,
        delay_ms: u64,
        func: TaskFn,
        name: &'static str,
        arg: TaskArg,
    ) -> bool {
        self.add_timer(handle, Duration::from_millis(delay_ms), func, name, arg)
    }

    #[track_caller]
    fn add_timer_at(&self, handle: &Handle, deadline: Instant, func: TaskFn, name: &'static str, arg: TaskArg) -> bool {
        let site = SubmissionSite::here(name);
        let mut inner = self.inner.lock().unwrap();
        if handle.is_live() {
            return false;
        }
        let id = self.finish_submit(
            &mut inner,
            handle,
            TaskClass::Timer,
            func,
            name,
            arg,
            WakeCondition::Deadline(deadline),
            site,
        );
        let MasterInner { table, timers, .. } = &mut *inner;
        timers.push(table, id);
        drop(inner);
        self.wake();
        true
    }

    /// Fire `func` in the background priority class (§4.7: dispatched
    /// after foreground I/O and timers). `delay` of `None` means "as soon
    /// as nothing higher-priority is pending".
    #[track_caller]
    pub fn add_background(
        &self,
        handle: &Handle,
        delay: Option<Duration>,
        func: TaskFn,
        name: &'static str,
        arg: TaskArg,
    ) -> bool {
        let deadline = Instant::now() + delay.unwrap_or_default();
        let site = SubmissionSite::here(name);
        let mut inner = self.inner.lock().unwrap();
        if handle.is_live() {
            return false;
        }
        let id = self.finish_submit(
            &mut inner,
            handle,
            TaskClass::Background,
            func,
            name,
            arg,
            WakeCondition::Deadline(deadline),
            site,
        );
        let MasterInner { table, background, .. } = &mut *inner;
        background.push(table, id);
        drop(inner);
        self.wake();
        true
    }

    /// Queue `func` for immediate dispatch, promoted ahead of timers and
    /// I/O the next time `fetch` runs a round (§4.7 step 3).
    #[track_caller]
    pub fn add_event(&self, handle: &Handle, value: i64, func: TaskFn, name: &'static str, arg: TaskArg) -> bool {
        let site = SubmissionSite::here(name);
        let mut inner = self.inner.lock().unwrap();
        if handle.is_live() {
            return false;
        }
        let id = self.finish_submit(
            &mut inner,
            handle,
            TaskClass::Event,
            func,
            name,
            arg,
            WakeCondition::Value(value),
            site,
        );
        let MasterInner { table, events, .. } = &mut *inner;
        events.append(table, id);
        drop(inner);
        self.wake();
        true
    }

    /// Time remaining until `handle`'s task fires, saturating to zero if
    /// the deadline has already passed (§6: `timer_remain`).
    ///
    /// `None` if `handle` does not currently name a pending task, or names
    /// one that isn't a `Timer`/`Background` task (I/O and event tasks
    /// have no deadline to report).
    #[must_use]
    pub fn timer_remain(&self, handle: &Handle) -> Option<Duration> {
        let id = handle.get()?;
        let inner = self.inner.lock().unwrap();
        let task = inner.table.get(id)?;
        match task.class {
            TaskClass::Timer | TaskClass::Background => {
                Some(task.deadline().saturating_duration_since(Instant::now()))
            }
            _ => None,
        }
    }

    /// Whole seconds remaining until `handle`'s task fires; zero once the
    /// deadline has passed or `handle` names no pending timer (§6:
    /// `timer_remain_seconds`).
    #[must_use]
    pub fn timer_remain_secs(&self, handle: &Handle) -> u64 {
        self.timer_remain(handle).unwrap_or_default().as_secs()
    }

    /// Snapshot the process-wide accounting table, filtered to entries
    /// whose class bitmap intersects `filter` (an empty filter matches
    /// everything). §6: `accounting_entries`.
    #[must_use]
    pub fn accounting_entries(&self, filter: TaskClassSet) -> Vec<AccountingSnapshot> {
        self.accounting.snapshot(filter)
    }

    /// Reset call/time statistics for entries matching `filter`, leaving
    /// `total_active` untouched. §6: `accounting_clear`.
    pub fn accounting_clear(&self, filter: TaskClassSet) {
        self.accounting.clear(filter);
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        // Safety: `wake_read`/`wake_write` were opened by this `Master`
        // in `try_new` and are not shared with anything else.
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

// `Master` is `Send + Sync`: `inner` is behind a `Mutex`, the config
// knobs are atomics, and the raw fds are only ever touched through `io::`
// helpers that don't assume thread affinity. Only `fetch`/`cancel`/`call`
// additionally assert they run on the owner thread (`assert_owner`).
