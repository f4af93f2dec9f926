// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A Port is a handle to one kernel resource, shared between up to two
//! sibling Channels (one per polarity).

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;

use log::{trace, warn};

use crate::errno;

/// What kind of kernel object backs a Port's descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Unknown,
    Socket,
    Pipe,
    Fifo,
    Tty,
    Device,
    File,
    Readiness,
    Bad,
}

/// What flows over a Channel attached to this Port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freight {
    Octets,
    Sockets,
    Ports,
    Datagrams,
    Transits,
}

/// Which polarity (or polarities) a Channel represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Input,
    Output,
}

/// Which syscall last recorded an error on this Port, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastCall {
    None,
    Open,
    Connect,
    Bind,
    Listen,
    Accept,
    Read,
    Write,
    Sendmsg,
    Recvmsg,
    Close,
    Socketpair,
    Pipe,
    Setsockopt,
    /// A kqueue/epoll change (install or remove) the kernel rejected,
    /// reported back to the owning Channel as a terminate event rather than
    /// aborting the whole readiness-layer change batch.
    Subscribe,
    /// Recorded by `Junction::void()` — not a failed syscall, but a
    /// diagnostic marker that this Port's latches were disclaimed rather
    /// than released through the normal unlatch/close path.
    Voided,
}

/// Low/high nibble latch bits: input side latched in the low nibble, output
/// side in the high nibble. A Port closes only once both nibbles are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Latches(u8);

const INPUT_LATCH: u8 = 0x0f;
const OUTPUT_LATCH: u8 = 0xf0;

impl Latches {
    fn is_latched(self, polarity: Polarity) -> bool {
        match polarity {
            Polarity::Input => self.0 & INPUT_LATCH != 0,
            Polarity::Output => self.0 & OUTPUT_LATCH != 0,
        }
    }

    fn set(&mut self, polarity: Polarity) {
        match polarity {
            Polarity::Input => self.0 |= 0x01,
            Polarity::Output => self.0 |= 0x10,
        }
    }

    fn clear(&mut self, polarity: Polarity) {
        match polarity {
            Polarity::Input => self.0 &= !INPUT_LATCH,
            Polarity::Output => self.0 &= !OUTPUT_LATCH,
        }
    }

    fn is_empty(self) -> bool {
        self.0 == 0
    }
}

struct PortInner {
    descriptor: RawFd,
    resource_kind: ResourceKind,
    last_error: i32,
    last_call: LastCall,
    freight: Freight,
    latches: Latches,
}

/// A handle to one kernel resource. Cheaply `Clone`, shared between sibling
/// Channels via an `Rc`. Not `Send`/`Sync`: Ports only ever live inside the
/// single-threaded non-I/O phases of a Junction cycle.
#[derive(Clone)]
pub struct Port(Rc<RefCell<PortInner>>);

impl Port {
    /// Creates a Port for a descriptor that was just opened successfully
    /// (latched for `polarity`), or born invalid (`descriptor == -1`) if
    /// `descriptor` is negative — in which case the owning Channel will be
    /// born terminated.
    pub fn new(descriptor: RawFd, resource_kind: ResourceKind, freight: Freight) -> Self {
        Port(Rc::new(RefCell::new(PortInner {
            descriptor,
            resource_kind,
            last_error: 0,
            last_call: LastCall::None,
            freight,
            latches: Latches::default(),
        })))
    }

    /// Convenience: build an already-failed Port, recording `errno` against
    /// `last_call` — a failed open/connect/bind leaves the Port unlatched
    /// with the failing errno recorded rather than closing anything.
    pub fn failed(last_call: LastCall, errno: i32, freight: Freight) -> Self {
        let port = Port::new(-1, ResourceKind::Bad, freight);
        port.0.borrow_mut().last_error = errno;
        port.0.borrow_mut().last_call = last_call;
        port
    }

    pub fn descriptor(&self) -> RawFd {
        self.0.borrow().descriptor
    }

    pub fn resource_kind(&self) -> ResourceKind {
        self.0.borrow().resource_kind
    }

    pub fn freight(&self) -> Freight {
        self.0.borrow().freight
    }

    pub fn last_error(&self) -> i32 {
        self.0.borrow().last_error
    }

    pub fn last_call(&self) -> LastCall {
        self.0.borrow().last_call
    }

    pub fn last_error_description(&self) -> String {
        errno::describe(self.last_error())
    }

    pub fn is_latched(&self, polarity: Polarity) -> bool {
        self.0.borrow().latches.is_latched(polarity)
    }

    pub fn is_valid(&self) -> bool {
        self.descriptor() != -1
    }

    /// Latches `polarity`, recording that this Channel's syscall succeeded.
    pub fn latch(&self, polarity: Polarity) {
        self.0.borrow_mut().latches.set(polarity);
    }

    /// Records a kernel failure against this Port without touching latches.
    pub fn record_error(&self, last_call: LastCall, errno: i32) {
        let mut inner = self.0.borrow_mut();
        inner.last_call = last_call;
        inner.last_error = errno;
    }

    /// Clears the `polarity` nibble; when both nibbles are empty, performs
    /// the actual `close(2)` and invalidates the descriptor. Invariant 6:
    /// two sibling Channels sharing a Port may be independently terminated,
    /// the Port closes only when both polarities are unlatched.
    pub fn unlatch(&self, polarity: Polarity) {
        let mut inner = self.0.borrow_mut();
        inner.latches.clear(polarity);

        if inner.latches.is_empty() && inner.descriptor != -1 {
            trace!("closing fd {} (last latch released)", inner.descriptor);
            // SAFETY: `descriptor` is only ever a valid, owned fd once
            // latched; both latching polarities have just been cleared so no
            // other Channel still claims ownership of it.
            let rc = unsafe { libc::close(inner.descriptor) };
            if rc != 0 {
                warn!(
                    "close({}) failed: {}",
                    inner.descriptor,
                    std::io::Error::last_os_error()
                );
            }
            inner.descriptor = -1;
            inner.resource_kind = ResourceKind::Bad;
        }
    }

    /// Zeroes latches without closing the descriptor, handing ownership of
    /// the fd to the caller.
    pub fn leak(&self) {
        let mut inner = self.0.borrow_mut();
        inner.latches = Latches::default();
    }

    /// `leak()`, plus recording `LastCall::Voided` for diagnostics. Used by a
    /// forked child to disclaim every inherited Port without closing its
    /// descriptor.
    pub fn leak_voided(&self) {
        let mut inner = self.0.borrow_mut();
        inner.latches = Latches::default();
        inner.last_call = LastCall::Voided;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlatch_closes_only_after_both_polarities_release() {
        // Use a dup of stdin so close() has something harmless to act on.
        let fd = unsafe { libc::dup(0) };
        assert!(fd >= 0);

        let port = Port::new(fd, ResourceKind::Pipe, Freight::Octets);
        port.latch(Polarity::Input);
        port.latch(Polarity::Output);

        assert!(port.is_valid());
        port.unlatch(Polarity::Input);
        assert!(port.is_valid(), "still latched on output");

        port.unlatch(Polarity::Output);
        assert!(!port.is_valid(), "both polarities released, should close");
    }

    #[test]
    fn failed_port_is_invalid_and_records_cause() {
        let port = Port::failed(LastCall::Connect, libc::ECONNREFUSED, Freight::Octets);
        assert!(!port.is_valid());
        assert_eq!(port.last_call(), LastCall::Connect);
        assert_eq!(port.last_error(), libc::ECONNREFUSED);
    }

    #[test]
    fn leak_does_not_close() {
        let fd = unsafe { libc::dup(0) };
        let port = Port::new(fd, ResourceKind::Pipe, Freight::Octets);
        port.latch(Polarity::Input);
        port.leak();
        assert!(port.is_valid(), "leak must not close the descriptor");
        // clean up the fd ourselves since leak() disclaimed it.
        unsafe { libc::close(fd) };
    }
}
