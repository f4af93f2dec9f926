// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The readiness backend: bridges kqueue (BSD/Darwin) and epoll (Linux)
//! behind one trait so the cycle engine never branches on `cfg(target_os)`
//! itself.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "dragonfly", target_os = "openbsd", target_os = "netbsd"))]
pub mod kqueue;
#[cfg(target_os = "linux")]
pub mod epoll;

/// A cheaply cloneable, `Send + Sync` capability to wake a Junction's
/// blocked `collect()` from any thread, independent of the `&mut Junction`
/// the cycle engine itself needs: rather than requiring shared mutable
/// access to the whole Junction, only this narrow wake-capability plus the
/// shared "currently waiting" flag are handed out.
///
/// Only valid while the originating backend is alive; a Junction that has
/// rebuilt its backend (e.g. after `reinitialize_after_fork`) invalidates
/// Wakers obtained before the rebuild, since a raw fd does not survive a
/// fork unscathed either.
#[derive(Clone)]
pub struct Waker {
    fd: RawFd,
    trigger: fn(RawFd) -> std::io::Result<()>,
    waiting: Arc<AtomicBool>,
}

// SAFETY: `fd` is a plain, `Copy` descriptor value (not an owning handle);
// `trigger` is a stateless function pointer; `waiting` is already `Send +
// Sync`. Nothing here aliases non-atomic state across threads.
unsafe impl Send for Waker {}
unsafe impl Sync for Waker {}

impl Waker {
    pub(crate) fn new(fd: RawFd, trigger: fn(RawFd) -> std::io::Result<()>, waiting: Arc<AtomicBool>) -> Self {
        Waker { fd, trigger, waiting }
    }

    /// Writes the wakeup token. Returns whether the Junction was observed in
    /// the waiting state at the moment of the call.
    pub fn wake(&self) -> bool {
        let was_waiting = self.waiting.load(Ordering::Acquire);
        let _ = (self.trigger)(self.fd);
        was_waiting
    }
}

/// Which directions a descriptor is watched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest { readable: true, writable: false };
    pub const WRITABLE: Interest = Interest { readable: false, writable: true };
    pub const BOTH: Interest = Interest { readable: true, writable: true };
}

/// One readiness notification, tagged with the opaque `user_data` token the
/// caller installed the watch with (a Channel's arena index, packed into a
/// `u64` by the cycle engine).
#[derive(Debug, Clone, Copy)]
pub struct ReadinessEvent {
    pub user_data: u64,
    pub readable: bool,
    pub writable: bool,
    /// Set on `EV_ERROR`/`EPOLLERR`: the descriptor itself faulted,
    /// independent of polarity. Always terminates immediately.
    pub error: bool,
    /// Set on `EV_EOF`/`EPOLLHUP`/`EPOLLRDHUP`: the peer (or our own write
    /// side) has shut down. On the output polarity this terminates
    /// immediately; on the input polarity it is deferred to the transfer
    /// phase so any bytes still buffered in the kernel are delivered first:
    /// input-side zero-read defers to the transfer phase.
    pub hup: bool,
}

/// Bridges the OS-specific readiness facility. One instance per Junction,
/// owning exactly one kqueue descriptor, or one pair of epoll descriptors
/// plus an eventfd.
pub trait Backend {
    /// Starts (or updates) watching `fd` for `interest`, tagged `user_data`.
    fn install(&mut self, fd: RawFd, interest: Interest, user_data: u64) -> std::io::Result<()>;

    /// Stops watching `fd`, tagged `user_data` so a backend that reports
    /// per-change failures (kqueue) can attribute one back to the
    /// originating Channel. A no-op if `fd` was never installed.
    fn remove(&mut self, fd: RawFd, user_data: u64) -> std::io::Result<()>;

    /// Blocks (respecting `timeout_ms`, `None` for indefinite, `Some(0)` for
    /// a non-blocking poll) until at least one event is ready or the
    /// self-wakeup fires, appending ready events to `out`.
    fn collect(&mut self, timeout_ms: Option<i32>, out: &mut Vec<ReadinessEvent>) -> std::io::Result<()>;

    /// Unblocks a concurrent `collect()` call from another thread. Must be
    /// safe to call from any thread.
    fn wake(&self) -> std::io::Result<()>;

    /// Re-creates the backend's kernel resources after `fork()`: a forked
    /// child's kqueue/epoll descriptors refer to a readiness object that
    /// only the parent will ever see events for.
    fn reinitialize_after_fork(&mut self) -> std::io::Result<()>;

    /// Builds a [`Waker`] bound to this backend's wakeup primitive, sharing
    /// `waiting` so the waker can report whether the wake was useful.
    fn make_waker(&self, waiting: Arc<AtomicBool>) -> Waker;

    /// Resizes the per-`collect()` readiness event buffer.
    fn set_capacity(&mut self, max_events: usize);

    /// Flushes any readiness-layer changes queued but not yet sent to the
    /// kernel, unless the Junction is terminating. A no-op for backends that
    /// apply every change as an immediate syscall (epoll).
    fn flush_changes(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    /// Drains `(user_data, errno)` pairs for changes the kernel rejected
    /// since the last call. Only kqueue's `EV_RECEIPT` batching produces
    /// these; epoll applies every change as an immediate syscall and has
    /// nothing to report here.
    fn take_change_errors(&mut self) -> Vec<(u64, i32)> {
        Vec::new()
    }
}

#[cfg(target_os = "linux")]
pub fn new_backend() -> std::io::Result<Box<dyn Backend>> {
    Ok(Box::new(epoll::EpollBackend::new()?))
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "dragonfly", target_os = "openbsd", target_os = "netbsd"))]
pub fn new_backend() -> std::io::Result<Box<dyn Backend>> {
    Ok(Box::new(kqueue::KqueueBackend::new()?))
}
