// Copyright 2026 taskmaster contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The ready and event lists (§4.3): plain FIFO doubly-linked lists, here
//! threaded through [`TaskId`]s and the shared [`TaskTable`] rather than
//! raw intrusive pointers (the container itself is explicitly out of
//! scope per SPEC_FULL.md §1 — this is a from-scratch, safe
//! reimplementation of the shape the distilled spec describes, not a port
//! of the teacher's unsafe intrusive list).

use crate::table::{TaskId, TaskTable};

/// A FIFO list of task ids, intrusively linked through `prev`/`next`
/// fields on the [`crate::task::Task`] records themselves.
#[derive(Default)]
pub(crate) struct TaskList {
    head: Option<TaskId>,
    tail: Option<TaskId>,
    count: usize,
}

impl TaskList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    /// Append `id` to the tail. `id` must not already be linked into any
    /// structure (§3 invariant 1).
    pub(crate) fn append(&mut self, table: &mut TaskTable, id: TaskId) {
        let task = table.get_mut(id).expect("append of unknown task id");
        debug_assert!(task.prev.is_none() && task.next.is_none());
        task.prev = self.tail;
        task.next = None;

        match self.tail {
            Some(tail) => table.get_mut(tail).expect("tail missing from table").next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.count += 1;
    }

    pub(crate) fn pop_front(&mut self, table: &mut TaskTable) -> Option<TaskId> {
        let id = self.head?;
        self.unlink(table, id);
        Some(id)
    }

    /// Remove `id` from wherever it sits in the list, in O(1).
    pub(crate) fn unlink(&mut self, table: &mut TaskTable, id: TaskId) {
        let (prev, next) = {
            let task = table.get(id).expect("unlink of unknown task id");
            (task.prev, task.next)
        };

        match prev {
            Some(prev) => table.get_mut(prev).expect("prev missing from table").next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => table.get_mut(next).expect("next missing from table").prev = prev,
            None => self.tail = prev,
        }

        let task = table.get_mut(id).expect("unlink of unknown task id");
        task.prev = None;
        task.next = None;
        self.count -= 1;
    }

    /// Every id currently linked, head to tail — used by
    /// `cancel_event_by_arg` (§4.8), which must walk the whole list.
    pub(crate) fn iter(&self, table: &TaskTable) -> impl Iterator<Item = TaskId> + '_ {
        let mut next = self.head;
        std::iter::from_fn(move || {
            let id = next?;
            next = table.get(id).expect("iter over unknown task id").next;
            Some(id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::AccountingKey;
    use crate::handle::TaskArg;
    use crate::task::{SubmissionSite, Task, TaskClass, WakeCondition};
    use std::sync::Arc;

    fn probe(_: &mut crate::task::TaskContext) {}

    fn push_new(table: &mut TaskTable, list: &mut TaskList) -> TaskId {
        let id = table.insert(|id| {
            Task::new(
                id,
                TaskClass::Event,
                probe as crate::task::TaskFn,
                "probe",
                Arc::new(()) as TaskArg,
                WakeCondition::Value(0),
                AccountingKey::new(probe as crate::task::TaskFn),
                SubmissionSite::new("test.rs", 1, "probe"),
            )
        });
        list.append(table, id);
        id
    }

    #[test]
    fn fifo_order() {
        let mut table = TaskTable::new();
        let mut list = TaskList::new();
        let a = push_new(&mut table, &mut list);
        let b = push_new(&mut table, &mut list);
        let c = push_new(&mut table, &mut list);

        assert_eq!(list.len(), 3);
        assert_eq!(list.pop_front(&mut table), Some(a));
        assert_eq!(list.pop_front(&mut table), Some(b));
        assert_eq!(list.pop_front(&mut table), Some(c));
        assert!(list.is_empty());
    }

    #[test]
    fn unlink_middle_preserves_order() {
        let mut table = TaskTable::new();
        let mut list = TaskList::new();
        let a = push_new(&mut table, &mut list);
        let b = push_new(&mut table, &mut list);
        let c = push_new(&mut table, &mut list);

        list.unlink(&mut table, b);
        assert_eq!(list.len(), 2);
        assert_eq!(list.iter(&table).collect::<Vec<_>>(), vec![a, c]);
    }
}
