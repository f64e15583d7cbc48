// Copyright 2026 taskmaster contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The timer and background min-heaps (§4.4).
//!
//! The teacher's own timer module (`libs/async-exec/src/time`) is a
//! tick-based timer wheel built for a `Future`-polling executor; it has no
//! heap-with-swap-callback analog, so this module is built directly from
//! SPEC_FULL.md §4.4 rather than adapted from teacher code (recorded in
//! DESIGN.md — an intentional gap, not an oversight). The `Instant`
//! arithmetic style (saturating, never panicking on an already-passed
//! deadline) follows `libs/async-exec/src/time/instant.rs`.

use crate::table::{TaskId, TaskTable};
use std::time::Instant;

/// An indexed binary min-heap of task ids, ordered by each task's
/// deadline. Every swap writes the moved task's new position back into
/// its `heap_index` field (§4.4's "swap callback"), which is what makes
/// `remove` able to find and extract an arbitrary element in O(log n)
/// during cancellation instead of needing a linear scan.
#[derive(Default)]
pub(crate) struct TimerHeap {
    data: Vec<TaskId>,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn peek_deadline(&self, table: &TaskTable) -> Option<Instant> {
        self.data.first().map(|id| self.deadline_at(table, *id))
    }

    pub(crate) fn push(&mut self, table: &mut TaskTable, id: TaskId) {
        let index = self.data.len();
        self.data.push(id);
        table.get_mut(id).expect("push of unknown task id").heap_index = Some(index);
        self.sift_up(table, index);
    }

    pub(crate) fn pop(&mut self, table: &mut TaskTable) -> Option<TaskId> {
        if self.data.is_empty() {
            return None;
        }
        let last = self.data.len() - 1;
        self.swap(table, 0, last);
        let id = self.data.pop().expect("checked non-empty above");
        table.get_mut(id).expect("pop of unknown task id").heap_index = None;
        if !self.data.is_empty() {
            self.sift_down(table, 0);
        }
        Some(id)
    }

    /// Remove an arbitrary element by its recorded heap index (§4.8:
    /// cancellation of a `Timer`/`Background` task).
    pub(crate) fn remove(&mut self, table: &mut TaskTable, id: TaskId) {
        let index = table
            .get(id)
            .and_then(|task| task.heap_index)
            .expect("remove of a task not currently in this heap");
        let last = self.data.len() - 1;
        if index != last {
            self.swap(table, index, last);
        }
        self.data.pop();
        table.get_mut(id).expect("remove of unknown task id").heap_index = None;

        if index < self.data.len() {
            // the element that took `index`'s place may need to move
            // either direction to restore heap order.
            self.sift_down(table, index);
            self.sift_up(table, index);
        }
    }

    fn swap(&mut self, table: &mut TaskTable, a: usize, b: usize) {
        self.data.swap(a, b);
        table.get_mut(self.data[a]).expect("swap of unknown task id").heap_index = Some(a);
        table.get_mut(self.data[b]).expect("swap of unknown task id").heap_index = Some(b);
    }

    fn deadline_at(&self, table: &TaskTable, id: TaskId) -> Instant {
        table.get(id).expect("heap entry missing from table").deadline()
    }

    fn sift_up(&mut self, table: &mut TaskTable, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.deadline_at(table, self.data[parent]) <= self.deadline_at(table, self.data[index]) {
                break;
            }
            self.swap(table, parent, index);
            index = parent;
        }
    }

    fn sift_down(&mut self, table: &mut TaskTable, mut index: usize) {
        loop {
            let left = index * 2 + 1;
            let right = index * 2 + 2;
            let mut smallest = index;

            if left < self.data.len()
                && self.deadline_at(table, self.data[left]) < self.deadline_at(table, self.data[smallest])
            {
                smallest = left;
            }
            if right < self.data.len()
                && self.deadline_at(table, self.data[right]) < self.deadline_at(table, self.data[smallest])
            {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.swap(table, index, smallest);
            index = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::AccountingKey;
    use crate::handle::TaskArg;
    use crate::task::{SubmissionSite, Task, TaskClass, WakeCondition};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn probe(_: &mut crate::task::TaskContext) {}

    fn push_deadline(table: &mut TaskTable, heap: &mut TimerHeap, deadline: Instant) -> TaskId {
        let id = table.insert(|id| {
            Task::new(
                id,
                TaskClass::Timer,
                probe as crate::task::TaskFn,
                "probe",
                Arc::new(()) as TaskArg,
                WakeCondition::Deadline(deadline),
                AccountingKey::new(probe as crate::task::TaskFn),
                SubmissionSite::new("test.rs", 1, "probe"),
            )
        });
        heap.push(table, id);
        id
    }

    #[test]
    fn pops_in_deadline_order() {
        let mut table = TaskTable::new();
        let mut heap = TimerHeap::new();
        let base = Instant::now();

        let late = push_deadline(&mut table, &mut heap, base + Duration::from_secs(10));
        let soon = push_deadline(&mut table, &mut heap, base + Duration::from_millis(1));
        let mid = push_deadline(&mut table, &mut heap, base + Duration::from_secs(1));

        assert_eq!(heap.pop(&mut table), Some(soon));
        assert_eq!(heap.pop(&mut table), Some(mid));
        assert_eq!(heap.pop(&mut table), Some(late));
        assert!(heap.is_empty());
    }

    #[test]
    fn remove_arbitrary_element_preserves_heap_order() {
        let mut table = TaskTable::new();
        let mut heap = TimerHeap::new();
        let base = Instant::now();

        let a = push_deadline(&mut table, &mut heap, base + Duration::from_millis(5));
        let b = push_deadline(&mut table, &mut heap, base + Duration::from_millis(1));
        let c = push_deadline(&mut table, &mut heap, base + Duration::from_millis(3));
        let d = push_deadline(&mut table, &mut heap, base + Duration::from_millis(2));

        heap.remove(&mut table, c);

        let mut popped = Vec::new();
        while let Some(id) = heap.pop(&mut table) {
            popped.push(id);
        }
        assert_eq!(popped, vec![b, d, a]);
    }

    #[test]
    fn heap_index_matches_actual_slot_after_churn() {
        let mut table = TaskTable::new();
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        let mut ids = Vec::new();
        for i in 0..20u64 {
            ids.push(push_deadline(
                &mut table,
                &mut heap,
                base + Duration::from_millis(20 - i),
            ));
        }

        for (slot, id) in heap.data.iter().enumerate() {
            assert_eq!(table.get(*id).unwrap().heap_index, Some(slot));
        }

        heap.remove(&mut table, ids[10]);
        for (slot, id) in heap.data.iter().enumerate() {
            assert_eq!(table.get(*id).unwrap().heap_index, Some(slot));
        }
    }

    proptest! {
        /// §3 invariant 4 and §8 property 3: for an arbitrary sequence of
        /// pushes, every element's stored `heap_index` matches its actual
        /// slot, and popping drains in non-decreasing deadline order.
        #[test]
        fn heap_index_matches_slot_for_arbitrary_pushes(delays_ms in proptest::collection::vec(0u64..1000, 0..60)) {
            let mut table = TaskTable::new();
            let mut heap = TimerHeap::new();
            let base = Instant::now();

            for ms in &delays_ms {
                push_deadline(&mut table, &mut heap, base + Duration::from_millis(*ms));
            }

            for (slot, id) in heap.data.iter().enumerate() {
                prop_assert_eq!(table.get(*id).unwrap().heap_index, Some(slot));
            }

            let mut last = None;
            while let Some(id) = heap.pop(&mut table) {
                let deadline = table.get(id).unwrap().deadline();
                if let Some(last) = last {
                    prop_assert!(last <= deadline);
                }
                last = Some(deadline);
            }
        }

        /// Removing an arbitrary subset mid-stream must leave the
        /// remaining elements' `heap_index` fields consistent and must not
        /// disturb deadline ordering among what's left.
        #[test]
        fn remove_subset_preserves_invariants(
            delays_ms in proptest::collection::vec(0u64..1000, 1..40),
            remove_every_nth in 2usize..5,
        ) {
            let mut table = TaskTable::new();
            let mut heap = TimerHeap::new();
            let base = Instant::now();

            let ids: Vec<_> = delays_ms
                .iter()
                .map(|ms| push_deadline(&mut table, &mut heap, base + Duration::from_millis(*ms)))
                .collect();

            for (i, id) in ids.iter().enumerate() {
                if i % remove_every_nth == 0 {
                    heap.remove(&mut table, *id);
                }
            }

            for (slot, id) in heap.data.iter().enumerate() {
                prop_assert_eq!(table.get(*id).unwrap().heap_index, Some(slot));
            }

            let mut last = None;
            while let Some(id) = heap.pop(&mut table) {
                let deadline = table.get(id).unwrap().deadline();
                if let Some(last) = last {
                    prop_assert!(last <= deadline);
                }
                last = Some(deadline);
            }
        }
    }
}
