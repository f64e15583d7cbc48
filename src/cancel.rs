// Copyright 2026 taskmaster contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cancellation (§4.8): unlinking a still-pending task from whichever
//! structure currently holds it, wherever that is.

use crate::accounting::AccountingTable;
use crate::handle::{Handle, TaskArg};
use crate::master::{Master, MasterInner};
use crate::table::TaskId;
use crate::task::TaskClass;
use std::sync::Arc;

impl Master {
    /// Cancel the task named by `handle`, if it is still pending. A no-op
    /// if `handle` is empty (§4.8: cancelling an already-fired or
    /// already-cancelled handle is always safe).
    ///
    /// Must only be called from the owner thread.
    pub fn cancel(&self, handle: &Handle) {
        self.assert_owner();
        let Some(id) = handle.get() else {
            return;
        };
        let mut inner = self.inner.lock().unwrap();
        cancel_id(&mut inner, &self.accounting, id);
        handle.set(None);
    }

    /// Cancel every still-pending event or already-promoted-to-`Ready`
    /// task whose argument is the same `Arc` allocation as `arg`, per
    /// `Arc::ptr_eq` (§4.8) — not restricted to tasks originally submitted
    /// as `Event`; a `Timer` or I/O task that has since been promoted onto
    /// the ready list matches too. Returns the number of tasks cancelled.
    ///
    /// Intended for embedders that track their own correlation ids inside
    /// the argument instead of keeping a `Handle` around for every event.
    ///
    /// Must only be called from the owner thread.
    pub fn cancel_event_by_arg(&self, arg: &TaskArg) -> usize {
        self.assert_owner();
        let mut inner = self.inner.lock().unwrap();

        // A task lives in exactly one structure at a time (§3 invariant
        // 1), so a promoted-to-`Ready` event and a still-waiting one can
        // never both match the same id.
        let matches: Vec<TaskId> = inner
            .events
            .iter(&inner.table)
            .chain(inner.ready.iter(&inner.table))
            .filter(|id| inner.table.get(*id).is_some_and(|task| Arc::ptr_eq(&task.arg, arg)))
            .collect();

        let count = matches.len();
        for id in matches {
            cancel_id(&mut inner, &self.accounting, id);
        }
        count
    }
}

/// Unlink `id` from whatever structure currently holds it, release its
/// table slot, and clear its handle. Shared by both cancellation entry
/// points above.
fn cancel_id(inner: &mut MasterInner, accounting: &AccountingTable, id: TaskId) {
    let Some(task) = inner.table.get(id) else {
        tracing::error!("cancel called for a task no longer in the table");
        debug_assert!(false, "cancel called for a task no longer in the table");
        return;
    };

    match task.class {
        TaskClass::Read => {
            let fd = task.fd();
            inner.io.clear_read(fd);
        }
        TaskClass::Write => {
            let fd = task.fd();
            inner.io.clear_write(fd);
        }
        TaskClass::Timer => inner.timers.remove(&mut inner.table, id),
        TaskClass::Background => inner.background.remove(&mut inner.table, id),
        TaskClass::Event => inner.events.unlink(&mut inner.table, id),
        TaskClass::Ready => inner.ready.unlink(&mut inner.table, id),
        TaskClass::Execute | TaskClass::Unused => {
            tracing::error!(class = ?task.class, "cancel called for a task not linked into any structure");
            debug_assert!(false, "cancel called for a task not linked into any structure");
            return;
        }
    }

    if let Some(task) = inner.table.remove(id) {
        accounting.adjust_active(task.accounting_key, -1);
        if let Some(handle) = &task.handle {
            handle.set(None);
        }
    }
}
