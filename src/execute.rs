// Copyright 2026 taskmaster contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronous execute (§4.9): run a function immediately, on the calling
//! thread, crediting it to the accounting table under the `Execute` class
//! without ever entering any scheduler structure.

use crate::accounting::AccountingKey;
use crate::handle::TaskArg;
use crate::master::Master;
use crate::task::{TaskContext, TaskFn};
use std::time::Instant;

impl Master {
    /// Run `func(arg)` immediately and synchronously, crediting its wall
    /// and CPU time to `name`'s accounting entry under [`crate::TaskClass::Execute`].
    ///
    /// `value` is carried for parity with the other submission entry
    /// points (a caller-chosen correlation value) but plays no role in
    /// dispatch — `execute` never waits on anything.
    ///
    /// Unlike every other entry point this has no `Handle` and nothing to
    /// cancel: by the time it returns, the task has already run to
    /// completion.
    pub fn execute(&self, func: TaskFn, name: &'static str, arg: TaskArg, value: i64) {
        let key = AccountingKey::new(func);
        self.accounting.lookup_or_insert(key, name);
        tracing::trace!(task.name = name, value, "synchronous execute");

        let wall_start = Instant::now();
        let cpu_start = thread_cpu_time();

        let mut ctx = TaskContext::new_detached(arg, self.self_weak.clone());
        func(&mut ctx);

        let wall = wall_start.elapsed();
        let cpu = thread_cpu_time().checked_sub(cpu_start).unwrap_or_default();
        self.accounting.record_call(key, crate::task::TaskClass::Execute, wall, cpu);
    }
}

fn thread_cpu_time() -> std::time::Duration {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // Safety: `ts` is a valid, exclusively-owned out-parameter.
    unsafe {
        libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts);
    }
    std::time::Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}
