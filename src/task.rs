// Copyright 2026 taskmaster contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::accounting::AccountingKey;
use crate::handle::{Handle, TaskArg};
use crate::table::TaskId;
use crate::Master;
use std::os::unix::io::RawFd;
use std::panic::Location;
use std::sync::Weak;
use std::time::{Duration, Instant};

/// The default yield budget: one "time slot" (§ Glossary).
pub const DEFAULT_YIELD_BUDGET: Duration = Duration::from_millis(10);

/// A task's entry point.
///
/// Deliberately a non-capturing function pointer rather than a boxed
/// closure — see DESIGN.md, Open Question 1. The accounting table keys on
/// `func as usize`, which only gives pointer-equality semantics for a
/// non-capturing `fn`. Per-invocation state travels through [`TaskArg`]
/// instead.
pub type TaskFn = fn(&mut TaskContext);

/// The class a task record currently belongs to.
///
/// `Unused` means the record sits on the free list; every other variant
/// names the one structure the task is linked into, per §3 invariant 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
    Read,
    Write,
    Timer,
    Event,
    Ready,
    Background,
    /// Synthetic class used only by [`crate::Master::execute`] for tasks
    /// that never enter any scheduler structure (§4.9).
    Execute,
    Unused,
}

/// The condition under which a task becomes runnable.
#[derive(Debug, Clone, Copy)]
pub enum WakeCondition {
    /// Not yet waiting on anything (used transiently for `Ready`/`Event`
    /// tasks, whose condition has already fired by construction).
    None,
    /// A descriptor to watch for readability or writability, matching the
    /// task's class (`Read` or `Write`).
    Fd(RawFd),
    /// An absolute monotonic deadline (`Timer` or `Background`).
    Deadline(Instant),
    /// An opaque application-chosen value (`Event`/`Execute`).
    Value(i64),
}

/// Where a task was submitted from, for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct SubmissionSite {
    pub file: &'static str,
    pub line: u32,
    pub func_name: &'static str,
}

impl SubmissionSite {
    pub(crate) fn new(file: &'static str, line: u32, func_name: &'static str) -> Self {
        Self {
            file,
            line,
            func_name,
        }
    }

    #[track_caller]
    pub(crate) fn here(func_name: &'static str) -> Self {
        let loc = Location::caller();
        Self::new(loc.file(), loc.line(), func_name)
    }
}

/// One pending or recently-completed unit of scheduled work.
///
/// See SPEC_FULL.md §3 for the full field-by-field rationale. `Task`
/// itself never appears outside `Master`'s internals — callers interact
/// with a [`TaskSnapshot`] (returned from `fetch`) and a [`Handle`]
/// (used to cancel).
pub(crate) struct Task {
    pub(crate) id: TaskId,
    pub(crate) class: TaskClass,
    pub(crate) original_class: TaskClass,
    pub(crate) func: TaskFn,
    pub(crate) func_name: &'static str,
    pub(crate) arg: TaskArg,
    pub(crate) wake: WakeCondition,
    pub(crate) owner: Weak<Master>,
    pub(crate) heap_index: Option<usize>,
    pub(crate) prev: Option<TaskId>,
    pub(crate) next: Option<TaskId>,
    pub(crate) handle: Option<Handle>,
    pub(crate) yield_budget: Duration,
    pub(crate) accounting_key: AccountingKey,
    pub(crate) site: SubmissionSite,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: TaskId,
        class: TaskClass,
        func: TaskFn,
        func_name: &'static str,
        arg: TaskArg,
        wake: WakeCondition,
        accounting_key: AccountingKey,
        site: SubmissionSite,
    ) -> Self {
        Self {
            id,
            original_class: class,
            class,
            func,
            func_name,
            arg,
            wake,
            owner: Weak::new(),
            heap_index: None,
            prev: None,
            next: None,
            handle: None,
            yield_budget: DEFAULT_YIELD_BUDGET,
            accounting_key,
            site,
        }
    }

    /// Deadline for a `Timer`/`Background` task. Panics if called on a
    /// task whose wake condition isn't a deadline — both timer heaps only
    /// ever hold such tasks, so this is an internal invariant, not a
    /// caller-facing one.
    pub(crate) fn deadline(&self) -> Instant {
        match self.wake {
            WakeCondition::Deadline(deadline) => deadline,
            _ => unreachable!("deadline() called on a non-timer task"),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        match self.wake {
            WakeCondition::Fd(fd) => fd,
            _ => unreachable!("fd() called on a non-I/O task"),
        }
    }

    /// Snapshot the fields `fetch` hands back to the caller, then this
    /// record is free to be recycled immediately (§4.7 step 2).
    pub(crate) fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            class: self.class,
            original_class: self.original_class,
            func: self.func,
            func_name: self.func_name,
            arg: self.arg.clone(),
            yield_budget: self.yield_budget,
            accounting_key: self.accounting_key,
            owner: self.owner.clone(),
        }
    }
}

/// A point-in-time copy of a dispatched task, returned by
/// [`crate::Master::fetch`] and consumed by [`crate::Master::call`].
///
/// Returning a snapshot by value (rather than a reference into the task
/// table) is what lets the underlying record return to the free list the
/// instant it is popped, instead of staying pinned until the caller is
/// done running it (§4.7 step 2).
#[derive(Clone)]
pub struct TaskSnapshot {
    pub(crate) id: TaskId,
    pub class: TaskClass,
    pub original_class: TaskClass,
    pub(crate) func: TaskFn,
    pub func_name: &'static str,
    pub arg: TaskArg,
    pub(crate) yield_budget: Duration,
    pub(crate) accounting_key: AccountingKey,
    pub(crate) owner: Weak<Master>,
}

/// The argument handed to a task function while it runs.
///
/// Lets a task introspect its own budget (`should_yield`) and, if it needs
/// to submit further work or cancel something, reach back to its owning
/// [`Master`].
pub struct TaskContext {
    arg: TaskArg,
    start_of_run: Instant,
    yield_budget: Duration,
    owner: Weak<Master>,
}

impl TaskContext {
    pub(crate) fn new(snapshot: &TaskSnapshot) -> Self {
        Self {
            arg: snapshot.arg.clone(),
            start_of_run: Instant::now(),
            yield_budget: snapshot.yield_budget,
            owner: snapshot.owner.clone(),
        }
    }

    /// Build a context for a task that was never linked into any
    /// scheduler structure (`Master::execute`, §4.9).
    pub(crate) fn new_detached(arg: TaskArg, owner: Weak<Master>) -> Self {
        Self {
            arg,
            start_of_run: Instant::now(),
            yield_budget: DEFAULT_YIELD_BUDGET,
            owner,
        }
    }

    /// The argument this task was submitted with.
    #[must_use]
    pub fn arg(&self) -> &TaskArg {
        &self.arg
    }

    /// `true` once this task has been running for at least its yield
    /// budget. Long-running tasks should check this periodically and
    /// re-submit themselves (e.g. as a `Background` or `Event` task)
    /// rather than monopolizing the owner stream.
    #[must_use]
    pub fn should_yield(&self) -> bool {
        self.start_of_run.elapsed() >= self.yield_budget
    }

    /// Override this task's yield budget for the remainder of its run.
    pub fn set_yield_time(&mut self, budget: Duration) {
        self.yield_budget = budget;
    }

    /// The `Master` that dispatched this task, if it still exists.
    #[must_use]
    pub fn master(&self) -> Option<std::sync::Arc<Master>> {
        self.owner.upgrade()
    }
}
