// Copyright 2026 taskmaster contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::os::unix::io::RawFd;

/// Errors surfaced at the edges of the scheduler's API.
///
/// The fetch loop itself never returns an error — a failed `poll` is logged
/// and treated as "nothing ready" (see [`crate::Master::fetch`]). This type
/// only covers failures a caller can act on: resource exhaustion at
/// construction time, and out-of-range descriptors at registration time.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Creating the `Master` failed because a required OS resource
    /// (the open-file limit query, or the wake self-pipe) could not be
    /// obtained.
    #[error("failed to acquire a scheduler resource: {0}")]
    ResourceLimit(#[source] io::Error),

    /// An I/O task was registered with a descriptor outside the range the
    /// `Master` was sized for at creation (the process's open-file soft
    /// limit at the time).
    #[error("descriptor {fd} is out of range for a master sized for {limit} descriptors")]
    DescriptorOutOfRange { fd: RawFd, limit: usize },

    /// The underlying `poll(2)` call failed for a reason other than being
    /// interrupted by a signal (`EINTR` is swallowed and never surfaces
    /// here).
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
