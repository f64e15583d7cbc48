// Copyright 2026 taskmaster contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The fetch engine (§4.7): the twelve-step algorithm that decides what
//! runs next and the `call` helper that actually runs it.
//!
//! Grounded on `libs/async-exec/src/executor.rs`'s run loop (poll →
//! process completions → park), generalized from a single Future-ready
//! queue into the spec's five-way priority order (ready, event, I/O,
//! timer, background).

use crate::io::{self, PollOutcome};
use crate::master::{Master, MasterInner};
use crate::table::TaskId;
use crate::task::{TaskClass, TaskSnapshot};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

/// Cap a duration to what `poll(2)`'s `i32` millisecond timeout can
/// express, rather than overflow or panic on an absurdly distant
/// deadline.
fn clamp_to_poll_timeout(remaining: Duration) -> i32 {
    let ms = remaining.as_millis();
    if ms > i32::MAX as u128 {
        i32::MAX
    } else {
        ms as i32
    }
}

impl Master {
    /// Run one round of the fetch algorithm and return the next task to
    /// run, or `None` if nothing is ready and `spin` is `false` (§4.7).
    ///
    /// Must only be called from the owner thread.
    pub fn fetch(&self) -> Option<TaskSnapshot> {
        self.assert_owner();

        loop {
            // Step 1: give the embedder a chance to turn pending signals
            // into submissions before we decide what's ready.
            if self.handle_signals.load(Ordering::Acquire) {
                let hook = self.signal_drain_hook.lock().unwrap().clone();
                if let Some(hook) = hook {
                    (hook)();
                }
            }

            let mut inner = self.inner.lock().unwrap();

            // Step 2: anything already on the ready list wins outright.
            if let Some(id) = inner.ready.pop_front(&mut inner.table) {
                return Some(self.finish_dispatch(&mut inner, id));
            }

            // Step 3: promote every pending event ahead of I/O and timers.
            while let Some(id) = inner.events.pop_front(&mut inner.table) {
                promote(&mut inner, id);
            }
            if let Some(id) = inner.ready.pop_front(&mut inner.table) {
                return Some(self.finish_dispatch(&mut inner, id));
            }

            // Step 4: compute how long we can afford to block in poll(2).
            let now = Instant::now();
            let nearest_deadline = nearest(&inner);
            let spin = self.spin.load(Ordering::Acquire);
            let override_ms = self.selectpoll_timeout.load(Ordering::Acquire);

            let timeout_ms = if override_ms > 0 {
                override_ms
            } else if override_ms < 0 {
                0
            } else {
                match nearest_deadline {
                    Some(deadline) => clamp_to_poll_timeout(deadline.saturating_duration_since(now)),
                    None if spin => -1,
                    None => 0,
                }
            };

            // Steps 5-6: poll, with the lock released for the syscall
            // itself. The I/O registry is swapped out for an empty
            // placeholder rather than cloned — `poll` only touches the
            // dense descriptor array, which doesn't need the task table.
            let mut io_registry = std::mem::replace(&mut inner.io, crate::io::IoRegistry::new(0));
            drop(inner);
            let outcome = io_registry.poll(timeout_ms, self.wake_read);
            let mut inner = self.inner.lock().unwrap();
            inner.io = io_registry;

            // Step 7: a signal interrupted poll(2); restart the round.
            if matches!(outcome, PollOutcome::Interrupted) {
                continue;
            }

            // Step 8: drain every timer whose deadline has passed.
            let now = Instant::now();
            while due(inner.timers.peek_deadline(&inner.table), now) {
                let id = inner.timers.pop(&mut inner.table).expect("checked non-empty above");
                promote(&mut inner, id);
            }

            // Step 9: process whatever poll(2) actually reported.
            match outcome {
                PollOutcome::Ready { wake_readable, events } => {
                    for event in events {
                        if event.readable {
                            if let Some(id) = inner.io.read_task(event.fd) {
                                inner.io.clear_read(event.fd);
                                promote(&mut inner, id);
                            }
                        }
                        if event.writable {
                            if let Some(id) = inner.io.write_task(event.fd) {
                                inner.io.clear_write(event.fd);
                                promote(&mut inner, id);
                            }
                        }
                    }
                    if wake_readable {
                        io::drain_wake(self.wake_read);
                    }
                }
                PollOutcome::Error(err) => {
                    tracing::warn!(error = %err, "poll(2) failed; treating this round as idle");
                    return None;
                }
                PollOutcome::Interrupted => unreachable!("handled in step 7"),
            }

            // Step 10: background tasks whose deadline has passed join the
            // ready list last, after every foreground source.
            while due(inner.background.peek_deadline(&inner.table), now) {
                let id = inner.background.pop(&mut inner.table).expect("checked non-empty above");
                promote(&mut inner, id);
            }

            // Step 11: dispatch whatever just got promoted.
            if let Some(id) = inner.ready.pop_front(&mut inner.table) {
                return Some(self.finish_dispatch(&mut inner, id));
            }

            // Step 12: nothing ready this round.
            if !spin {
                return None;
            }
        }
    }

    /// Run a dispatched task, timing its wall-clock and CPU duration and
    /// crediting both to its accounting entry (§4.2, §4.10).
    ///
    /// Must only be called from the owner thread.
    pub fn call(&self, snapshot: &TaskSnapshot) {
        self.assert_owner();

        let wall_start = Instant::now();
        let cpu_start = thread_cpu_time();
        let mut ctx = crate::task::TaskContext::new(snapshot);

        CURRENT_TASK.with(|cell| *cell.borrow_mut() = Some(snapshot.id));
        (snapshot.func)(&mut ctx);
        CURRENT_TASK.with(|cell| *cell.borrow_mut() = None);

        let wall = wall_start.elapsed();
        let cpu = thread_cpu_time().checked_sub(cpu_start).unwrap_or_default();

        self.accounting.record_call(snapshot.accounting_key, snapshot.original_class, wall, cpu);

        let threshold = *self.slow_task_threshold.lock().unwrap();
        if wall > threshold {
            tracing::warn!(
                task.name = snapshot.func_name,
                wall_ms = wall.as_millis() as u64,
                cpu_ms = cpu.as_millis() as u64,
                "task ran past the slow-task threshold",
            );
        }
    }

    fn finish_dispatch(&self, inner: &mut MasterInner, id: TaskId) -> TaskSnapshot {
        let task = inner
            .table
            .remove(id)
            .expect("ready list referenced a task no longer in the table");
        if let Some(handle) = &task.handle {
            handle.set(None);
        }
        self.accounting.adjust_active(task.accounting_key, -1);
        task.snapshot()
    }
}

/// Move `id` from whatever waiting structure it was in onto the ready
/// list, relabeling its class (§4.7 steps 3, 8, 9, 10 all do this).
fn promote(inner: &mut MasterInner, id: TaskId) {
    if let Some(task) = inner.table.get_mut(id) {
        task.class = TaskClass::Ready;
    }
    inner.ready.append(&mut inner.table, id);
}

fn nearest(inner: &MasterInner) -> Option<Instant> {
    match (inner.timers.peek_deadline(&inner.table), inner.background.peek_deadline(&inner.table)) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) | (None, Some(a)) => Some(a),
        (None, None) => None,
    }
}

fn due(deadline: Option<Instant>, now: Instant) -> bool {
    matches!(deadline, Some(deadline) if deadline <= now)
}

fn thread_cpu_time() -> Duration {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // Safety: `ts` is a valid, exclusively-owned out-parameter;
    // `CLOCK_THREAD_CPUTIME_ID` is supported on every platform this crate
    // targets.
    unsafe {
        libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts);
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

thread_local! {
    static CURRENT_TASK: std::cell::RefCell<Option<TaskId>> = const { std::cell::RefCell::new(None) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{Handle, TaskArg};
    use std::sync::Arc;

    fn noop(_: &mut crate::task::TaskContext) {}

    fn pipe() -> (std::os::unix::io::RawFd, std::os::unix::io::RawFd) {
        crate::io::wake_pipe().expect("failed to open test pipe")
    }

    fn close(fd: std::os::unix::io::RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    /// E1: a timer due now outranks a descriptor that is already readable.
    #[test]
    fn timer_fires_before_ready_io() {
        let master = Master::new();
        master.set_spin(false);
        let (read_fd, write_fd) = pipe();
        unsafe {
            libc::write(write_fd, b"x".as_ptr().cast(), 1);
        }

        let read_handle = Handle::new();
        master.add_read(&read_handle, read_fd, noop, "read_task", Arc::new(()));
        let timer_handle = Handle::new();
        master.add_timer(&timer_handle, Duration::from_millis(0), noop, "timer_task", Arc::new(()));

        let first = master.fetch().expect("something should be ready");
        assert_eq!(first.func_name, "timer_task");
        master.call(&first);

        let second = master.fetch().expect("the read task should follow");
        assert_eq!(second.func_name, "read_task");
        master.call(&second);

        close(read_fd);
        close(write_fd);
    }

    /// E2: an event queued ahead of time is promoted before I/O is polled.
    #[test]
    fn event_fires_before_io() {
        let master = Master::new();
        master.set_spin(false);
        let (read_fd, write_fd) = pipe();
        unsafe {
            libc::write(write_fd, b"x".as_ptr().cast(), 1);
        }

        let read_handle = Handle::new();
        master.add_read(&read_handle, read_fd, noop, "read_task", Arc::new(()));
        let event_handle = Handle::new();
        master.add_event(&event_handle, 42, noop, "event_task", Arc::new(()));

        let first = master.fetch().expect("something should be ready");
        assert_eq!(first.func_name, "event_task");
        master.call(&first);

        let second = master.fetch().expect("the read task should follow");
        assert_eq!(second.func_name, "read_task");
        master.call(&second);

        close(read_fd);
        close(write_fd);
    }

    /// E3: a handle reads null once its task has been dispatched.
    #[test]
    fn handle_clears_after_dispatch() {
        let master = Master::new();
        let handle = Handle::new();
        master.add_timer(&handle, Duration::from_millis(10), noop, "timer_task", Arc::new(()));
        assert!(handle.is_live());

        std::thread::sleep(Duration::from_millis(20));
        master.set_spin(false);
        let task = master.fetch().expect("the timer should have fired by now");
        assert_eq!(task.func_name, "timer_task");
        master.call(&task);

        assert!(!handle.is_live(), "the handle must clear once its task dispatches");
    }

    /// E4: cancelling a write registration removes it from the poll array;
    /// a subsequent idle fetch reports nothing ready.
    #[test]
    fn cancel_removes_write_registration() {
        let master = Master::new();
        let (read_fd, write_fd) = pipe();

        let handle = Handle::new();
        master.add_write(&handle, write_fd, noop, "write_task", Arc::new(()));
        master.cancel(&handle);
        assert!(!handle.is_live());

        master.set_spin(false);
        assert!(master.fetch().is_none(), "the cancelled write task must not fire");

        close(read_fd);
        close(write_fd);
    }

    /// E5: `cancel_event_by_arg` removes every task sharing the given
    /// argument allocation and leaves the rest untouched.
    #[test]
    fn cancel_event_by_arg_removes_matching_tasks() {
        let master = Master::new();
        let arg_a: TaskArg = Arc::new(1u32);
        let arg_b: TaskArg = Arc::new(2u32);

        let h1 = Handle::new();
        let h2 = Handle::new();
        let h3 = Handle::new();
        master.add_event(&h1, 1, noop, "event_a1", arg_a.clone());
        master.add_event(&h2, 2, noop, "event_a2", arg_a.clone());
        master.add_event(&h3, 3, noop, "event_b", arg_b);

        assert_eq!(master.cancel_event_by_arg(&arg_a), 2);

        master.set_spin(false);
        let remaining = master.fetch().expect("the unrelated event should remain");
        assert_eq!(remaining.func_name, "event_b");
        master.call(&remaining);
        assert!(master.fetch().is_none());
    }

    /// E6: a background task due now still yields to a foreground timer
    /// due later but before the background task is drained.
    #[test]
    fn background_yields_to_foreground_timer() {
        let master = Master::new();
        let bg_handle = Handle::new();
        master.add_background(&bg_handle, None, noop, "background_task", Arc::new(()));
        let timer_handle = Handle::new();
        master.add_timer(&timer_handle, Duration::from_millis(5), noop, "timer_task", Arc::new(()));

        std::thread::sleep(Duration::from_millis(10));
        master.set_spin(false);

        let first = master.fetch().expect("the timer should fire first");
        assert_eq!(first.func_name, "timer_task");
        master.call(&first);

        let second = master.fetch().expect("the background task should fire second");
        assert_eq!(second.func_name, "background_task");
        master.call(&second);
    }

    /// Property 7: resubmitting through a live handle is a no-op.
    #[test]
    fn resubmission_through_live_handle_is_idempotent() {
        let master = Master::new();
        let handle = Handle::new();
        assert!(master.add_event(&handle, 1, noop, "event_task", Arc::new(())));
        let first_id = handle.get();

        assert!(!master.add_event(&handle, 2, noop, "event_task", Arc::new(())));
        assert_eq!(handle.get(), first_id, "a rejected resubmission must not mutate the handle");
    }

    /// Property 8 (idle half): with `spin` false and nothing pending,
    /// `fetch` returns immediately rather than blocking.
    #[test]
    fn fetch_returns_none_when_idle_and_not_spinning() {
        let master = Master::new();
        master.set_spin(false);
        assert!(master.fetch().is_none());
    }

    #[test]
    fn timer_remain_reports_time_to_deadline() {
        let master = Master::new();
        let handle = Handle::new();
        master.add_timer(&handle, Duration::from_millis(50), noop, "timer_task", Arc::new(()));

        let remaining = master.timer_remain(&handle).expect("the handle should still be live");
        assert!(remaining <= Duration::from_millis(50));
        assert!(master.timer_remain_secs(&handle) <= 1);
    }

    /// Property 7 (race): concurrent submissions through the same handle
    /// from different threads must still only let one through — the
    /// `is_live` check and the submission it guards have to happen inside
    /// one critical section.
    #[test]
    fn concurrent_submission_through_same_handle_is_idempotent() {
        let master = Master::new();
        let handle = Handle::new();

        let results: Vec<bool> = std::thread::scope(|scope| {
            let joins: Vec<_> = (0..8)
                .map(|i| {
                    let master = &master;
                    let handle = handle.clone();
                    scope.spawn(move || master.add_event(&handle, i, noop, "race_task", Arc::new(())))
                })
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).collect()
        });

        assert_eq!(
            results.iter().filter(|&&submitted| submitted).count(),
            1,
            "exactly one concurrent submission through the same handle must succeed"
        );
    }

    /// `cancel_event_by_arg` must reach a task whose *original* class
    /// isn't `Event` once it has been promoted onto the ready list — here,
    /// two timers race to the same deadline, only one is dispatched per
    /// `fetch`, and the other must still be cancellable by its argument.
    #[test]
    fn cancel_event_by_arg_removes_promoted_non_event_task() {
        let master = Master::new();
        let arg: TaskArg = Arc::new(9u32);

        let h1 = Handle::new();
        let h2 = Handle::new();
        master.add_timer(&h1, Duration::from_millis(0), noop, "timer_a", arg.clone());
        master.add_timer(&h2, Duration::from_millis(0), noop, "timer_b", arg.clone());

        std::thread::sleep(Duration::from_millis(5));
        master.set_spin(false);

        let first = master.fetch().expect("one of the two due timers should dispatch");
        master.call(&first);

        assert_eq!(
            master.cancel_event_by_arg(&arg),
            1,
            "the other timer, now sitting on the ready list, must still match by argument"
        );
        assert!(master.fetch().is_none(), "the cancelled timer must not fire");
    }
}
