// Copyright 2026 taskmaster contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The I/O registry: descriptor-indexed arrays plus the dense
//! poll-descriptor array handed to `poll(2)` (§4.5).
//!
//! Grounded on `libs/fiber`, the one teacher crate that talks to raw OS
//! facilities from a hosted `std` build (there via `libc` behind
//! `cfg(unix)`, here the same way).

use crate::error::{Error, Result};
use crate::table::TaskId;
use std::io;
use std::os::unix::io::RawFd;

/// One descriptor's readiness as reported by a completed `poll(2)` round.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IoEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

/// Outcome of a single `poll(2)` round (§4.7 steps 6-9).
pub(crate) enum PollOutcome {
    /// Interrupted by a signal; the fetch round restarts from the top.
    Interrupted,
    /// The wake pipe had bytes; drain it.
    Ready { wake_readable: bool, events: Vec<IoEvent> },
    /// Any other failure; logged by the caller and treated as idle.
    Error(io::Error),
}

/// Descriptor-indexed arrays and the dense poll-descriptor array that
/// mirrors them.
pub(crate) struct IoRegistry {
    read: Vec<Option<TaskId>>,
    write: Vec<Option<TaskId>>,
    pfds: Vec<libc::pollfd>,
    fd_limit: usize,
}

impl IoRegistry {
    pub(crate) fn new(fd_limit: usize) -> Self {
        Self {
            read: vec![None; fd_limit],
            write: vec![None; fd_limit],
            pfds: Vec::new(),
            fd_limit,
        }
    }

    pub(crate) fn fd_limit(&self) -> usize {
        self.fd_limit
    }

    pub(crate) fn check_range(&self, fd: RawFd) -> Result<()> {
        if fd < 0 || fd as usize >= self.fd_limit {
            return Err(Error::DescriptorOutOfRange {
                fd,
                limit: self.fd_limit,
            });
        }
        Ok(())
    }

    /// Find (or create) the poll-descriptor slot for `fd`, per §4.5 step 1:
    /// a linear scan, because the common case is that the descriptor is
    /// already present and daemons rarely register more than a few
    /// thousand of them.
    fn slot_for(&mut self, fd: RawFd) -> usize {
        if let Some(slot) = self.pfds.iter().position(|pfd| pfd.fd == fd) {
            return slot;
        }
        self.pfds.push(libc::pollfd {
            fd,
            events: 0,
            revents: 0,
        });
        self.pfds.len() - 1
    }

    pub(crate) fn register_read(&mut self, fd: RawFd, id: TaskId) -> Result<()> {
        self.check_range(fd)?;
        if let Some(existing) = self.read[fd as usize] {
            tracing::warn!(fd, ?existing, "overwriting a live read registration for this fd");
        }
        let slot = self.slot_for(fd);
        self.pfds[slot].events |= libc::POLLIN;
        self.read[fd as usize] = Some(id);
        Ok(())
    }

    pub(crate) fn register_write(&mut self, fd: RawFd, id: TaskId) -> Result<()> {
        self.check_range(fd)?;
        if let Some(existing) = self.write[fd as usize] {
            tracing::warn!(fd, ?existing, "overwriting a live write registration for this fd");
        }
        let slot = self.slot_for(fd);
        self.pfds[slot].events |= libc::POLLOUT;
        self.write[fd as usize] = Some(id);
        Ok(())
    }

    pub(crate) fn read_task(&self, fd: RawFd) -> Option<TaskId> {
        self.read.get(fd as usize).copied().flatten()
    }

    pub(crate) fn write_task(&self, fd: RawFd) -> Option<TaskId> {
        self.write.get(fd as usize).copied().flatten()
    }

    /// Clear the read registration for `fd`, compacting the poll-descriptor
    /// array if this was the last direction armed on it (§4.5, §4.8).
    pub(crate) fn clear_read(&mut self, fd: RawFd) {
        self.read[fd as usize] = None;
        self.clear_bit(fd, libc::POLLIN);
    }

    pub(crate) fn clear_write(&mut self, fd: RawFd) {
        self.write[fd as usize] = None;
        self.clear_bit(fd, libc::POLLOUT);
    }

    fn clear_bit(&mut self, fd: RawFd, bit: libc::c_short) {
        if let Some(slot) = self.pfds.iter().position(|pfd| pfd.fd == fd) {
            self.pfds[slot].events &= !bit;
            if self.pfds[slot].events == 0 {
                self.purge_slot(slot);
            }
        }
    }

    fn purge_slot(&mut self, slot: usize) {
        self.pfds.remove(slot);
    }

    fn purge_fd(&mut self, fd: RawFd) {
        if let Some(slot) = self.pfds.iter().position(|pfd| pfd.fd == fd) {
            self.purge_slot(slot);
        }
    }

    /// Run one blocking (or zero-timeout) `poll(2)` round over the
    /// registered descriptors plus `wake_fd`, per §4.7 steps 5-9. The
    /// caller is responsible for releasing/reacquiring whatever lock
    /// guards `self` around this call (§4.7 step 6) — this method itself
    /// does no locking.
    pub(crate) fn poll(&mut self, timeout_ms: i32, wake_fd: RawFd) -> PollOutcome {
        let mut batch: Vec<libc::pollfd> = self.pfds.clone();
        batch.push(libc::pollfd {
            fd: wake_fd,
            events: libc::POLLIN,
            revents: 0,
        });

        // Safety: `batch` is a valid, exclusively-owned buffer of
        // `libc::pollfd` of the length passed.
        let rc = unsafe { libc::poll(batch.as_mut_ptr(), batch.len() as libc::nfds_t, timeout_ms) };

        if rc < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::Interrupted {
                PollOutcome::Interrupted
            } else {
                PollOutcome::Error(err)
            };
        }

        let wake_entry = batch.len() - 1;
        let wake_readable = batch[wake_entry].revents & libc::POLLIN != 0;

        let mut events = Vec::new();
        let mut invalid = Vec::new();
        for pfd in &batch[..wake_entry] {
            if pfd.revents == 0 {
                continue;
            }
            if pfd.revents & libc::POLLNVAL != 0 {
                invalid.push(pfd.fd);
                continue;
            }
            let readable = pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0;
            let writable = pfd.revents & (libc::POLLOUT | libc::POLLERR) != 0;
            if readable || writable {
                events.push(IoEvent {
                    fd: pfd.fd,
                    readable,
                    writable,
                });
            }
        }

        for fd in invalid {
            tracing::warn!(fd, "poll reported an invalid descriptor; purging its slot");
            self.purge_fd(fd);
        }

        PollOutcome::Ready { wake_readable, events }
    }
}

/// Query the process's open-file soft limit (`RLIMIT_NOFILE`), used to
/// size every fd-indexed array in the `Master` (§3, §5).
pub(crate) fn fd_soft_limit() -> Result<usize> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // Safety: `limit` is a valid, exclusively-owned `rlimit` out-parameter.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 {
        return Err(Error::ResourceLimit(io::Error::last_os_error()));
    }
    Ok(limit.rlim_cur as usize)
}

/// Create a non-blocking self-pipe: `(read_fd, write_fd)`.
pub(crate) fn wake_pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    // Safety: `fds` is a valid, exclusively-owned 2-element out-parameter.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(Error::ResourceLimit(io::Error::last_os_error()));
    }
    for fd in fds {
        // Safety: `fd` was just returned by a successful `pipe(2)`.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        // Safety: same.
        unsafe {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
    Ok((fds[0], fds[1]))
}

/// Write one byte to the wake pipe, tolerating `EAGAIN` (§5: the only
/// blocking-I/O-adjacent call inside a critical section, made safe by a
/// non-blocking descriptor).
pub(crate) fn wake(write_fd: RawFd) {
    let byte: u8 = 1;
    // Safety: `write_fd` is a valid fd owned by this `Master` for its
    // entire lifetime; the buffer is a single live byte.
    let rc = unsafe { libc::write(write_fd, std::ptr::addr_of!(byte).cast(), 1) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            tracing::warn!(error = %err, "failed to write to wake pipe");
        }
    }
}

/// Drain every byte currently buffered in the wake pipe's read end.
pub(crate) fn drain_wake(read_fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        // Safety: `read_fd` is a valid fd owned by this `Master`; `buf` is
        // a valid, exclusively-owned buffer of the given length.
        let rc = unsafe { libc::read(read_fd, buf.as_mut_ptr().cast(), buf.len()) };
        if rc <= 0 {
            break;
        }
        if (rc as usize) < buf.len() {
            break;
        }
    }
}
