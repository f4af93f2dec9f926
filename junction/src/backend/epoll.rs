// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Linux backend: two `epoll` instances (epoll needs separate fds to
//! distinguish read vs write readiness under edge-triggered semantics), with
//! the writer epoll and an `eventfd` both nested into the reader epoll so a
//! single blocking `epoll_wait` on the reader covers read readiness, write
//! readiness, and self-wakeup all at once.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use super::{Backend, Interest, ReadinessEvent, Waker};

const WAKE_TOKEN: u64 = u64::MAX;
const WRITER_NEST_TOKEN: u64 = u64::MAX - 1;

pub struct EpollBackend {
    reader: Epoll,
    writer: Epoll,
    wake_fd: OwnedFd,
    capacity: usize,
}

const DEFAULT_CAPACITY: usize = 64;

impl EpollBackend {
    pub fn new() -> std::io::Result<Self> {
        let reader = Epoll::new(EpollCreateFlags::empty())?;
        let writer = Epoll::new(EpollCreateFlags::empty())?;

        // SAFETY: eventfd(2) with no initial value and EFD_NONBLOCK|EFD_CLOEXEC;
        // the returned fd is owned exclusively by this call.
        let wake_raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_raw < 0 {
            return Err(std::io::Error::last_os_error());
        }
        // SAFETY: wake_raw was just returned by a successful eventfd(2) call
        // and is not owned anywhere else.
        let wake_fd = unsafe { OwnedFd::from_raw_fd(wake_raw) };

        reader.add(&wake_fd, EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN))?;
        // Nesting an epoll fd inside another reports EPOLLIN on the outer
        // wait whenever the inner one has events pending, without saying
        // which; `collect` drains `writer` itself once notified.
        reader.add(&writer, EpollEvent::new(EpollFlags::EPOLLIN, WRITER_NEST_TOKEN))?;

        Ok(EpollBackend { reader, writer, wake_fd, capacity: DEFAULT_CAPACITY })
    }

    fn epoll_for(&self, interest: Interest) -> &Epoll {
        if interest.writable && !interest.readable {
            &self.writer
        } else {
            &self.reader
        }
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 8];
        // SAFETY: wake_fd is a valid eventfd; a failed nonblocking read (no
        // pending wakeup) is expected and ignored.
        unsafe {
            libc::read(self.wake_fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }

    /// Polls one epoll instance and appends its events to `out`, swallowing
    /// the self-wakeup and writer-nesting tokens rather than surfacing them
    /// as [`ReadinessEvent`]s.
    fn collect_one(
        epoll: &Epoll,
        timeout: EpollTimeout,
        capacity: usize,
        out: &mut Vec<ReadinessEvent>,
        saw_wake: &mut bool,
    ) -> std::io::Result<usize> {
        let mut buf = vec![EpollEvent::empty(); capacity];
        let n = epoll.wait(&mut buf, timeout)?;

        for ev in &buf[..n] {
            if ev.data() == WAKE_TOKEN {
                *saw_wake = true;
                continue;
            }
            if ev.data() == WRITER_NEST_TOKEN {
                continue;
            }
            let flags = ev.events();
            out.push(ReadinessEvent {
                user_data: ev.data(),
                readable: flags.contains(EpollFlags::EPOLLIN),
                writable: flags.contains(EpollFlags::EPOLLOUT),
                error: flags.contains(EpollFlags::EPOLLERR),
                hup: flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP),
            });
        }

        Ok(n)
    }
}

impl Backend for EpollBackend {
    fn install(&mut self, fd: RawFd, interest: Interest, user_data: u64) -> std::io::Result<()> {
        let mut flags = EpollFlags::EPOLLET;
        if interest.readable {
            flags |= EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
        }
        if interest.writable {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags |= EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP;

        let epoll = self.epoll_for(interest);
        let event = EpollEvent::new(flags, user_data);

        // `add` fails with EEXIST on a re-install (e.g. requeue); fall back
        // to `modify` so callers don't need to track first-vs-subsequent.
        if epoll.add(BorrowedByFd(fd), event).is_err() {
            epoll.modify(BorrowedByFd(fd), &mut EpollEvent::new(flags, user_data))?;
        }
        Ok(())
    }

    fn remove(&mut self, fd: RawFd, _user_data: u64) -> std::io::Result<()> {
        let _ = self.reader.delete(BorrowedByFd(fd));
        let _ = self.writer.delete(BorrowedByFd(fd));
        Ok(())
    }

    fn collect(&mut self, timeout_ms: Option<i32>, out: &mut Vec<ReadinessEvent>) -> std::io::Result<()> {
        let timeout = match timeout_ms {
            None => EpollTimeout::NONE,
            Some(ms) => EpollTimeout::try_from(ms).unwrap_or(EpollTimeout::ZERO),
        };

        let mut saw_wake = false;
        let before = out.len();

        // Block (if requested) on the reader epoll alone: the writer epoll
        // and the wakeup eventfd are both nested into it, so this single
        // wait unblocks on read readiness, write readiness, or a force().
        Self::collect_one(&self.reader, timeout, self.capacity, out, &mut saw_wake)?;
        // Drain the writer epoll without waiting — the nesting only told us
        // it has something, not what.
        Self::collect_one(&self.writer, EpollTimeout::ZERO, self.capacity, out, &mut saw_wake)?;

        // Re-collect up to twice more per side if the first pass came back
        // completely full, since more may be pending.
        for _ in 0..2 {
            if out.len() - before < self.capacity {
                break;
            }
            Self::collect_one(&self.reader, EpollTimeout::ZERO, self.capacity, out, &mut saw_wake)?;
            Self::collect_one(&self.writer, EpollTimeout::ZERO, self.capacity, out, &mut saw_wake)?;
        }

        if saw_wake {
            self.drain_wake();
        }

        Ok(())
    }

    fn wake(&self) -> std::io::Result<()> {
        eventfd_trigger(self.wake_fd.as_raw_fd())
    }

    fn reinitialize_after_fork(&mut self) -> std::io::Result<()> {
        *self = EpollBackend::new()?;
        Ok(())
    }

    fn make_waker(&self, waiting: Arc<AtomicBool>) -> Waker {
        Waker::new(self.wake_fd.as_raw_fd(), eventfd_trigger, waiting)
    }

    fn set_capacity(&mut self, max_events: usize) {
        self.capacity = max_events.max(1);
    }
}

fn eventfd_trigger(fd: RawFd) -> std::io::Result<()> {
    let one: u64 = 1;
    // SAFETY: fd is a valid eventfd for the lifetime of the owning backend;
    // writing 8 bytes increments its counter and wakes epoll_wait(2).
    let rc = unsafe { libc::write(fd, &one as *const u64 as *const libc::c_void, 8) };
    if rc < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// `nix::sys::epoll::Epoll`'s methods take anything implementing
/// `AsFd`; channels here only ever carry a bare `RawFd` (the descriptor
/// lives on [`crate::port::Port`], which intentionally does not expose an
/// owned fd type it doesn't actually own exclusively). This newtype bridges
/// that gap without claiming ownership.
struct BorrowedByFd(RawFd);

impl AsRawFd for BorrowedByFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl std::os::fd::AsFd for BorrowedByFd {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        // SAFETY: the fd is valid for the duration of this borrow, which
        // does not outlive the `install`/`remove` call that constructed it.
        unsafe { std::os::fd::BorrowedFd::borrow_raw(self.0) }
    }
}
