// Copyright 2026 taskmaster contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task table: a generation-checked slab that backs every structure in
//! the scheduler (the ready/event lists, the two timer heaps, the I/O
//! registry) with a stable [`TaskId`] rather than a raw pointer.
//!
//! The teacher crate hands every task a monotonically increasing `Id` from
//! a global counter (see its `task.rs`), used purely for debug display.
//! Here the id additionally has to double as the *address* every container
//! uses to refer to a task record, so it is a slot index plus a generation
//! counter (the classic "slot map" shape) rather than a bare counter:
//! reusing a freed slot's index is intentional (§4.1, "free list vs. fresh
//! allocation"), and the generation lets us detect a stale id referring to
//! a slot that has since been recycled for a different task.

use crate::task::Task;

/// A stable reference to a task record.
///
/// Remains valid (in the sense that [`TaskTable::get`] returns `Some`) for
/// as long as the task it names has not been released back to the free
/// list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    index: u32,
    generation: u32,
}

enum Slot {
    /// `generation` is the generation the *next* occupant of this slot
    /// will be assigned.
    Free { next_free: Option<u32>, generation: u32 },
    Occupied { generation: u32, task: Task },
}

/// Backing storage for every task record a [`crate::Master`] owns.
pub(crate) struct TaskTable {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    occupied: usize,
}

impl TaskTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            occupied: 0,
        }
    }

    /// Acquire a slot for a new task, reusing a freed one if available.
    /// `build` receives the id the task is about to be filed under, so the
    /// task can store its own id without a chicken-and-egg problem.
    pub(crate) fn insert(&mut self, build: impl FnOnce(TaskId) -> Task) -> TaskId {
        self.occupied += 1;

        if let Some(index) = self.free_head {
            let (next_free, generation) = match self.slots[index as usize] {
                Slot::Free {
                    next_free,
                    generation,
                } => (next_free, generation),
                Slot::Occupied { .. } => unreachable!("free_head did not point at a free slot"),
            };
            self.free_head = next_free;
            let id = TaskId { index, generation };
            self.slots[index as usize] = Slot::Occupied {
                generation,
                task: build(id),
            };
            id
        } else {
            let index = u32::try_from(self.slots.len()).expect("task table overflowed u32");
            let id = TaskId {
                index,
                generation: 0,
            };
            self.slots.push(Slot::Occupied {
                generation: 0,
                task: build(id),
            });
            id
        }
    }

    /// Remove a task from the table, returning it to the caller and
    /// marking its slot free for reuse. Returns `None` if `id` is stale
    /// (its slot has since been recycled for a different task).
    pub(crate) fn remove(&mut self, id: TaskId) -> Option<Task> {
        let slot = self.slots.get_mut(id.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {
                let next_generation = generation.wrapping_add(1);
                let prev_free_head = self.free_head;
                let old = std::mem::replace(
                    slot,
                    Slot::Free {
                        next_free: prev_free_head,
                        generation: next_generation,
                    },
                );
                let Slot::Occupied { task, .. } = old else {
                    unreachable!()
                };
                self.free_head = Some(id.index);
                self.occupied -= 1;
                Some(task)
            }
            _ => None,
        }
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<&Task> {
        match self.slots.get(id.index as usize) {
            Some(Slot::Occupied { generation, task }) if *generation == id.generation => {
                Some(task)
            }
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        match self.slots.get_mut(id.index as usize) {
            Some(Slot::Occupied { generation, task }) if *generation == id.generation => {
                Some(task)
            }
            _ => None,
        }
    }

    /// Number of occupied (non-free) slots — the live-task count used by
    /// the `total_active` accounting invariant (§3 invariant 5).
    pub(crate) fn len(&self) -> usize {
        self.occupied
    }

    /// Release any spare backing capacity. Never touches occupied slots or
    /// the free list's contents — `Master::free_unused` is a memory-return
    /// hint, not a structural change (§4.1, "free list vs. fresh
    /// allocation").
    pub(crate) fn shrink_to_fit(&mut self) {
        self.slots.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::AccountingKey;
    use crate::handle::TaskArg;
    use crate::task::{SubmissionSite, TaskClass, WakeCondition};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn dummy_task(id: TaskId) -> Task {
        Task::new(
            id,
            TaskClass::Event,
            dummy as crate::task::TaskFn,
            "dummy",
            Arc::new(()) as TaskArg,
            WakeCondition::Value(0),
            AccountingKey::new(dummy as crate::task::TaskFn),
            SubmissionSite::new("test.rs", 1, "test"),
        )
    }

    fn dummy(_: &mut crate::task::TaskContext) {}

    #[test]
    fn reused_slot_gets_new_generation() {
        let mut table = TaskTable::new();
        let a = table.insert(dummy_task);
        let removed = table.remove(a);
        assert!(removed.is_some());
        assert!(table.get(a).is_none(), "stale id must not resolve");

        let b = table.insert(dummy_task);
        assert!(table.get(b).is_some());
        assert!(
            table.get(a).is_none(),
            "old id for a recycled slot must stay invalid"
        );
    }

    #[test]
    fn len_tracks_occupied_slots() {
        let mut table = TaskTable::new();
        assert_eq!(table.len(), 0);
        let a = table.insert(dummy_task);
        let _b = table.insert(dummy_task);
        assert_eq!(table.len(), 2);
        table.remove(a);
        assert_eq!(table.len(), 1);
    }

    proptest! {
        /// For an arbitrary interleaving of inserts and removes-by-index,
        /// `len()` always matches the number of ids not yet removed, and a
        /// removed id never resolves again even after its slot is reused.
        #[test]
        fn insert_remove_sequence_keeps_len_and_ids_consistent(
            ops in proptest::collection::vec(any::<bool>(), 1..80),
        ) {
            let mut table = TaskTable::new();
            let mut live: Vec<TaskId> = Vec::new();
            let mut dead: Vec<TaskId> = Vec::new();

            for insert in ops {
                if insert || live.is_empty() {
                    live.push(table.insert(dummy_task));
                } else {
                    let id = live.remove(0);
                    prop_assert!(table.remove(id).is_some());
                    dead.push(id);
                }
                prop_assert_eq!(table.len(), live.len());
            }

            for id in &live {
                prop_assert!(table.get(*id).is_some());
            }
            for id in &dead {
                prop_assert!(table.get(*id).is_none());
            }
        }
    }
}
