// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! BSD/Darwin backend: a single `kqueue` descriptor serves both read and
//! write readiness via the `EVFILT_READ`/`EVFILT_WRITE` filters, plus
//! `EVFILT_USER` with `NOTE_TRIGGER` for self-wakeup.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use nix::libc::intptr_t;
use nix::sys::event::{kevent_ts, kqueue, EventFilter, EventFlag, FilterFlag, KEvent};
use nix::sys::time::{TimeSpec, TimeValLike};

use super::{Backend, Interest, ReadinessEvent, Waker};

const WAKE_IDENT: intptr_t = 0;

/// Fixed-size change batch, flushed to the kernel when full.
const CHANGE_BATCH: usize = 64;

const DEFAULT_CAPACITY: usize = 64;

pub struct KqueueBackend {
    kq: OwnedFd,
    changes: Vec<KEvent>,
    capacity: usize,
    /// `(user_data, errno)` pairs collected from `EV_ERROR` receipts the last
    /// time `flush()` ran, drained by `take_change_errors()`.
    change_errors: Vec<(u64, i32)>,
}

impl KqueueBackend {
    pub fn new() -> std::io::Result<Self> {
        let kq = kqueue().map_err(nix_to_io)?;
        let mut backend = KqueueBackend {
            kq,
            changes: Vec::with_capacity(CHANGE_BATCH),
            capacity: DEFAULT_CAPACITY,
            change_errors: Vec::new(),
        };
        backend.queue_change(KEvent::new(
            WAKE_IDENT as usize,
            EventFilter::EVFILT_USER,
            EventFlag::EV_ADD | EventFlag::EV_CLEAR | EventFlag::EV_RECEIPT,
            FilterFlag::empty(),
            0,
            0,
        ));
        backend.flush()?;
        Ok(backend)
    }

    fn queue_change(&mut self, change: KEvent) {
        self.changes.push(change);
    }

    /// Flushes the queued change batch with `EV_RECEIPT` set on every entry,
    /// so the kernel echoes back one output event per input change instead of
    /// aborting the whole batch at the first rejected one. A change's
    /// `EV_ERROR` receipt with a nonzero `data()` is recorded in
    /// `change_errors` keyed by that change's `udata`, rather than failing
    /// this call — a single bad fd in a batch must not keep every other
    /// change in the same batch from taking effect.
    fn flush(&mut self) -> std::io::Result<()> {
        if self.changes.is_empty() {
            return Ok(());
        }
        let changes = std::mem::take(&mut self.changes);
        let mut receipts = vec![
            KEvent::new(0, EventFilter::EVFILT_READ, EventFlag::empty(), FilterFlag::empty(), 0, 0);
            changes.len()
        ];
        let n = kevent_ts(self.kq.as_raw_fd(), &changes, &mut receipts, Some(TimeSpec::zero()))
            .map_err(nix_to_io)?;

        for ev in &receipts[..n] {
            if !ev.flags().contains(EventFlag::EV_ERROR) {
                continue;
            }
            let errno = ev.data() as i32;
            // ENOENT on an EV_DELETE receipt just means the filter was never
            // installed (e.g. a remove() for a polarity that was never
            // watched) — expected, not a Channel-level failure.
            if errno != 0 && errno != libc::ENOENT {
                self.change_errors.push((ev.udata() as u64, errno));
            }
        }
        Ok(())
    }

    fn flush_if_full(&mut self) -> std::io::Result<()> {
        if self.changes.len() >= CHANGE_BATCH {
            self.flush()?;
        }
        Ok(())
    }
}

impl Backend for KqueueBackend {
    fn install(&mut self, fd: RawFd, interest: Interest, user_data: u64) -> std::io::Result<()> {
        if interest.readable {
            self.queue_change(KEvent::new(
                fd as usize,
                EventFilter::EVFILT_READ,
                EventFlag::EV_ADD | EventFlag::EV_CLEAR | EventFlag::EV_RECEIPT,
                FilterFlag::empty(),
                0,
                user_data as intptr_t,
            ));
        }
        if interest.writable {
            self.queue_change(KEvent::new(
                fd as usize,
                EventFilter::EVFILT_WRITE,
                EventFlag::EV_ADD | EventFlag::EV_CLEAR | EventFlag::EV_RECEIPT,
                FilterFlag::empty(),
                0,
                user_data as intptr_t,
            ));
        }
        self.flush_if_full()
    }

    fn remove(&mut self, fd: RawFd, user_data: u64) -> std::io::Result<()> {
        for filter in [EventFilter::EVFILT_READ, EventFilter::EVFILT_WRITE] {
            self.queue_change(KEvent::new(
                fd as usize,
                filter,
                EventFlag::EV_DELETE | EventFlag::EV_RECEIPT,
                FilterFlag::empty(),
                0,
                user_data as intptr_t,
            ));
        }
        self.flush_if_full()
    }

    fn collect(&mut self, timeout_ms: Option<i32>, out: &mut Vec<ReadinessEvent>) -> std::io::Result<()> {
        self.flush()?;

        let timeout = timeout_ms.map(|ms| TimeSpec::milliseconds(i64::from(ms)));
        let mut buf = vec![
            KEvent::new(0, EventFilter::EVFILT_READ, EventFlag::empty(), FilterFlag::empty(), 0, 0);
            self.capacity
        ];

        let mut remaining = 3;
        loop {
            let n = kevent_ts(self.kq.as_raw_fd(), &[], &mut buf, timeout).map_err(nix_to_io)?;

            for ev in &buf[..n] {
                if ev.filter().ok() == Some(EventFilter::EVFILT_USER) {
                    continue;
                }
                let is_read = ev.filter().ok() == Some(EventFilter::EVFILT_READ);
                let flags = ev.flags();
                out.push(ReadinessEvent {
                    user_data: ev.udata() as u64,
                    readable: is_read,
                    writable: !is_read,
                    error: flags.contains(EventFlag::EV_ERROR),
                    hup: flags.contains(EventFlag::EV_EOF),
                });
            }

            // A full buffer may mean more is pending; re-collect without
            // waiting, up to 3 times total.
            if n < buf.len() || remaining == 0 {
                break;
            }
            remaining -= 1;
        }

        Ok(())
    }

    fn wake(&self) -> std::io::Result<()> {
        kqueue_trigger(self.kq.as_raw_fd())
    }

    fn reinitialize_after_fork(&mut self) -> std::io::Result<()> {
        *self = KqueueBackend::new()?;
        Ok(())
    }

    fn make_waker(&self, waiting: Arc<AtomicBool>) -> Waker {
        Waker::new(self.kq.as_raw_fd(), kqueue_trigger, waiting)
    }

    fn set_capacity(&mut self, max_events: usize) {
        self.capacity = max_events.max(1);
    }

    fn flush_changes(&mut self) -> std::io::Result<()> {
        self.flush()
    }

    fn take_change_errors(&mut self) -> Vec<(u64, i32)> {
        std::mem::take(&mut self.change_errors)
    }
}

fn kqueue_trigger(fd: RawFd) -> std::io::Result<()> {
    let trigger = KEvent::new(
        WAKE_IDENT as usize,
        EventFilter::EVFILT_USER,
        EventFlag::empty(),
        FilterFlag::NOTE_TRIGGER,
        0,
        0,
    );
    let mut none: [KEvent; 0] = [];
    kevent_ts(fd, &[trigger], &mut none, Some(TimeSpec::zero())).map_err(nix_to_io)
}

fn nix_to_io(err: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(err as i32)
}
