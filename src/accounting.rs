// Copyright 2026 taskmaster contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The process-wide accounting table (§4.2).
//!
//! Generalized from the teacher's per-tick, transient [`Tick`] counters
//! (`libs/async-exec/src/scheduler.rs`: `polled`, `completed`, `spawned`,
//! `woken_external`/`woken_internal`) into a persistent table keyed by task
//! entry point rather than accumulated per scheduler-tick. Shared across
//! every `Master` in the process, same as the original design (§4.2), via
//! an `Arc<AccountingTable>` each `Master` is constructed with rather than
//! a bare module-level singleton each call site reaches through directly.

use crate::task::{TaskClass, TaskFn};
use bitflags::bitflags;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

bitflags! {
    /// Which [`TaskClass`]es a given entry point has ever been invoked
    /// under. `Unused` has no corresponding bit — it never describes a
    /// running task.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskClassSet: u16 {
        const READ       = 1 << 0;
        const WRITE      = 1 << 1;
        const TIMER      = 1 << 2;
        const EVENT      = 1 << 3;
        const READY      = 1 << 4;
        const BACKGROUND = 1 << 5;
        const EXECUTE    = 1 << 6;
    }
}

impl From<TaskClass> for TaskClassSet {
    fn from(class: TaskClass) -> Self {
        match class {
            TaskClass::Read => TaskClassSet::READ,
            TaskClass::Write => TaskClassSet::WRITE,
            TaskClass::Timer => TaskClassSet::TIMER,
            TaskClass::Event => TaskClassSet::EVENT,
            TaskClass::Ready => TaskClassSet::READY,
            TaskClass::Background => TaskClassSet::BACKGROUND,
            TaskClass::Execute => TaskClassSet::EXECUTE,
            TaskClass::Unused => TaskClassSet::empty(),
        }
    }
}

/// Identifies a task's entry point for accounting purposes: the function
/// pointer's address. Equality and hashing are pointer equality, matching
/// §4.2 exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountingKey(usize);

impl AccountingKey {
    #[must_use]
    pub fn new(func: TaskFn) -> Self {
        Self(func as usize)
    }
}

/// Aggregated call/time statistics for one task entry point.
#[derive(Debug, Clone)]
pub struct AccountingEntry {
    key: AccountingKey,
    name: &'static str,
    classes: TaskClassSet,
    total_calls: u64,
    total_active: i64,
    wall_sum: Duration,
    wall_max: Duration,
    cpu_sum: Duration,
    cpu_max: Duration,
}

impl AccountingEntry {
    fn new(key: AccountingKey, name: &'static str) -> Self {
        Self {
            key,
            name,
            classes: TaskClassSet::empty(),
            total_calls: 0,
            total_active: 0,
            wall_sum: Duration::ZERO,
            wall_max: Duration::ZERO,
            cpu_sum: Duration::ZERO,
            cpu_max: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn classes(&self) -> TaskClassSet {
        self.classes
    }

    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.total_calls
    }

    #[must_use]
    pub fn total_active(&self) -> i64 {
        self.total_active
    }

    #[must_use]
    pub fn wall_sum(&self) -> Duration {
        self.wall_sum
    }

    #[must_use]
    pub fn wall_max(&self) -> Duration {
        self.wall_max
    }

    #[must_use]
    pub fn cpu_sum(&self) -> Duration {
        self.cpu_sum
    }

    #[must_use]
    pub fn cpu_max(&self) -> Duration {
        self.cpu_max
    }
}

/// An owned, point-in-time copy of an [`AccountingEntry`] handed back to
/// embedders building their own "display accounting" command (§6 —
/// display/clear is explicitly an external collaborator's job, this crate
/// just exposes the data).
pub type AccountingSnapshot = AccountingEntry;

/// Process-wide mapping from task entry point to aggregated statistics
/// (§4.2). A single instance is shared by every [`crate::Master`] in the
/// process — each `Master` holds its own `Arc` clone, obtained from
/// [`global`] at construction, rather than every call site reaching
/// through a bare module-level `static` (DESIGN.md, "single process-wide
/// accounting table": inject the shared table into each `Master`, don't
/// reference a singleton inline).
pub(crate) struct AccountingTable {
    entries: Mutex<HashMap<AccountingKey, AccountingEntry>>,
}

impl AccountingTable {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up (inserting on miss) the entry for `key`, capturing `name`
    /// only the first time it is seen — matches §4.2's "function name
    /// captured from the first insertion".
    pub(crate) fn lookup_or_insert(&self, key: AccountingKey, name: &'static str) {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(key).or_insert_with(|| AccountingEntry::new(key, name));
    }

    pub(crate) fn adjust_active(&self, key: AccountingKey, delta: i64) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&key) {
            entry.total_active += delta;
        }
    }

    pub(crate) fn record_call(&self, key: AccountingKey, class: TaskClass, wall: Duration, cpu: Duration) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&key) {
            entry.total_calls += 1;
            entry.classes |= TaskClassSet::from(class);
            entry.wall_sum += wall;
            entry.wall_max = entry.wall_max.max(wall);
            entry.cpu_sum += cpu;
            entry.cpu_max = entry.cpu_max.max(cpu);
        }
    }

    /// Snapshot every accounting entry whose class bitmap intersects
    /// `filter` (an empty filter matches everything).
    pub(crate) fn snapshot(&self, filter: TaskClassSet) -> Vec<AccountingSnapshot> {
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .filter(|entry| filter.is_empty() || entry.classes.intersects(filter))
            .cloned()
            .collect()
    }

    /// Reset the call/time statistics (but not `total_active`, which
    /// tracks live tasks and isn't something a "clear stats" command
    /// should touch) for every entry matching `filter`.
    pub(crate) fn clear(&self, filter: TaskClassSet) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.values_mut() {
            if filter.is_empty() || entry.classes.intersects(filter) {
                entry.total_calls = 0;
                entry.wall_sum = Duration::ZERO;
                entry.wall_max = Duration::ZERO;
                entry.cpu_sum = Duration::ZERO;
                entry.cpu_max = Duration::ZERO;
            }
        }
    }
}

/// The process-wide accounting table every `Master` is constructed with a
/// shared handle to.
pub(crate) fn global() -> Arc<AccountingTable> {
    static TABLE: OnceLock<Arc<AccountingTable>> = OnceLock::new();
    TABLE.get_or_init(|| Arc::new(AccountingTable::new())).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskContext;
    use std::sync::Arc;
    use std::time::Duration;

    fn probe(_: &mut TaskContext) {}

    #[test]
    fn total_active_tracks_submission_and_release() {
        let table = AccountingTable::new();
        let key = AccountingKey::new(probe as TaskFn);
        table.lookup_or_insert(key, "probe");
        table.adjust_active(key, 1);
        table.adjust_active(key, 1);
        table.adjust_active(key, -1);
        let entries = table.snapshot(TaskClassSet::empty());
        let entry = entries.iter().find(|e| e.name() == "probe").unwrap();
        assert_eq!(entry.total_active(), 1);
    }

    #[test]
    fn record_call_accumulates_and_tracks_max() {
        let table = AccountingTable::new();
        let key = AccountingKey::new(probe as TaskFn);
        table.lookup_or_insert(key, "probe");
        table.record_call(key, TaskClass::Event, Duration::from_millis(5), Duration::from_millis(2));
        table.record_call(key, TaskClass::Event, Duration::from_millis(20), Duration::from_millis(1));
        let entries = table.snapshot(TaskClassSet::EVENT);
        let entry = entries.iter().find(|e| e.name() == "probe").unwrap();
        assert_eq!(entry.total_calls(), 2);
        assert_eq!(entry.wall_sum(), Duration::from_millis(25));
        assert_eq!(entry.wall_max(), Duration::from_millis(20));
        assert_eq!(entry.cpu_max(), Duration::from_millis(2));
        assert!(entry.classes().contains(TaskClassSet::EVENT));
    }

    #[test]
    fn clear_resets_stats_but_not_active_count() {
        let table = AccountingTable::new();
        let key = AccountingKey::new(probe as TaskFn);
        table.lookup_or_insert(key, "probe");
        table.adjust_active(key, 3);
        table.record_call(key, TaskClass::Timer, Duration::from_millis(5), Duration::from_millis(5));
        table.clear(TaskClassSet::empty());
        let entries = table.snapshot(TaskClassSet::empty());
        let entry = entries.iter().find(|e| e.name() == "probe").unwrap();
        assert_eq!(entry.total_calls(), 0);
        assert_eq!(entry.total_active(), 3);
    }

    #[test]
    fn global_returns_the_same_shared_instance() {
        assert!(Arc::ptr_eq(&global(), &global()));
    }
}
