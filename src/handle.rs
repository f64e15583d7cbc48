// Copyright 2026 taskmaster contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::table::TaskId;
use std::any::Any;
use std::sync::{Arc, Mutex};

/// Per-invocation payload carried alongside a task's entry point.
///
/// Compared by [`Arc::ptr_eq`] in [`crate::Master::cancel_event_by_arg`],
/// mirroring the original design's "argument pointer equality" semantics
/// (see DESIGN.md, Open Question 1).
pub type TaskArg = Arc<dyn Any + Send + Sync>;

/// Caller-owned storage naming a submitted task.
///
/// This is the Rust rendition of the "handle slot" in SPEC_FULL.md §3: a
/// slot the scheduler clears to empty the instant the task it names fires
/// or is cancelled (§3 invariant 2). Unlike the original's raw pointer
/// pair, the slot here is an `Arc<Mutex<Option<TaskId>>>` shared between
/// the caller's `Handle` and the task record living in the `Master`'s
/// table — see DESIGN.md §9 for why.
///
/// A fresh `Handle` is empty and may be passed to any submission entry
/// point; reusing the same live `Handle` in a second submission call is a
/// no-op (the idempotence contract, §4.6).
#[derive(Clone)]
pub struct Handle {
    slot: Arc<Mutex<Option<TaskId>>>,
}

impl Handle {
    /// A fresh, empty handle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// `true` if this handle currently names a pending task.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    pub(crate) fn get(&self) -> Option<TaskId> {
        *self.slot.lock().unwrap()
    }

    pub(crate) fn set(&self, id: Option<TaskId>) {
        *self.slot.lock().unwrap() = id;
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("live", &self.is_live()).finish()
    }
}
