// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The Channel state machine: the qualification lattice (I/X/D), the window
//! over a caller-supplied resource, and the control flags that drive the
//! cycle engine.

use std::any::Any;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::ResourceError;
pub use crate::port::Polarity;
use crate::port::{LastCall, Port};
use crate::transfer::{Resource, TransferFns, TransferOutcome};

const I_TRANSFER: u8 = 0b0000_0001;
const X_TRANSFER: u8 = 0b0000_0010;
const I_TERMINATE: u8 = 0b0000_0100;
const X_TERMINATE: u8 = 0b0000_1000;

const D_TRANSFER: u8 = 0b0000_0001;
const D_TERMINATE: u8 = 0b0000_0010;
/// Set by [`crate::cycle::Junction::acquire`] purely to get a freshly
/// attached Channel onto the next delta flush's transfer list so its
/// `connect` control flag gets processed — the ring itself carries no other
/// "this Channel is new" signal once the Channel has no resource-transfer
/// delta of its own yet.
const D_CONNECT: u8 = 0b0000_0100;
/// Set by [`ChannelHandle::publish_force`] / [`crate::cycle::Junction::force_channel`]
/// to get a Channel onto the next flush's transfer list so its `force`
/// control bit (set independently) gets applied.
const D_FORCE: u8 = 0b0000_1000;

const TEV_TRANSFER: u8 = 0b0000_0001;
const TEV_TERMINATE: u8 = 0b0000_0010;

const CTRL_CONNECT: u8 = 0b0000_0001;
const CTRL_FORCE: u8 = 0b0000_0010;
const CTRL_REQUEUE: u8 = 0b0000_0100;

/// What [`Channel::endpoint`] reports: a concrete `SocketAddr` for `AF_INET`/
/// `AF_INET6`, or the peer's credentials for a local anonymous `AF_UNIX`
/// socket, which has no address to report in the first place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Inet(std::net::SocketAddr),
    UnixPeer { uid: u32, gid: u32 },
}

impl Endpoint {
    /// Convenience accessor for callers that only ever deal in `AF_INET`/
    /// `AF_INET6` Channels and want the `SocketAddr` directly.
    pub fn as_socket_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            Endpoint::Inet(addr) => Some(*addr),
            Endpoint::UnixPeer { .. } => None,
        }
    }
}

/// The `(start, stop)` byte interval of a resource buffer transferred this
/// cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct Window {
    pub start: usize,
    pub stop: usize,
}

/// One polarized endpoint of a kernel-backed data flow. Lives either
/// standalone (not yet acquired by any Junction) or inside a
/// [`crate::arena::ChannelArena`] slot once acquired.
pub struct Channel {
    polarity: Polarity,
    port: Port,
    resource: Option<Box<dyn Resource>>,
    window: Window,
    state: u8,
    control: u8,
    events: u8,
    link: Option<Box<dyn Any>>,
    transfer_fns: &'static TransferFns,
    /// Set once this Channel has been handed to a Junction; cleared only by
    /// termination. Distinguishes "detached" vs "attached" for `terminate()`.
    attached: bool,
}

impl Channel {
    /// Creates a freestanding (detached) Channel. `port` may already be
    /// invalid (`last_error` set) — a Channel born on a failed syscall is
    /// born terminated and will deliver exactly one terminate event on first
    /// acquisition.
    pub fn new(polarity: Polarity, port: Port, transfer_fns: &'static TransferFns) -> Self {
        let mut state = 0u8;
        if !port.is_valid() {
            state |= I_TERMINATE;
        }

        Channel {
            polarity,
            port,
            resource: None,
            window: Window::default(),
            state,
            control: 0,
            events: 0,
            link: None,
            transfer_fns,
            attached: false,
        }
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    pub fn port(&self) -> &Port {
        &self.port
    }

    pub fn link(&self) -> Option<&(dyn Any)> {
        self.link.as_deref()
    }

    pub fn set_link(&mut self, link: Box<dyn Any>) {
        self.link = Some(link);
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn terminated(&self) -> bool {
        self.state & (I_TERMINATE | X_TERMINATE) != 0
    }

    pub fn should_terminate(&self) -> bool {
        self.terminated()
    }

    pub fn transfer_ready(&self) -> bool {
        self.state & I_TRANSFER != 0 && self.state & X_TRANSFER != 0
    }

    /// The internal transfer qualification alone, independent of readiness:
    /// the resource side wants to move data, regardless of whether the
    /// kernel/peer side is ready yet. The cycle's transform-readiness step
    /// computes X from the backend and leaves I untouched.
    pub fn internal_transfer(&self) -> bool {
        self.state & I_TRANSFER != 0
    }

    pub fn exhausted(&self) -> bool {
        self.resource.is_none()
    }

    pub fn window(&self) -> Window {
        self.window
    }

    /// `slice() → (start, stop)`.
    pub fn slice(&self) -> (usize, usize) {
        (self.window.start, self.window.stop)
    }

    /// `sizeof_transfer()`: bytes moved this cycle if a transfer event
    /// fired, else 0.
    pub fn sizeof_transfer(&self) -> usize {
        if self.events & TEV_TRANSFER != 0 {
            self.window.stop - self.window.start
        } else {
            0
        }
    }

    /// `transfer() → view`: the slice of the resource transferred this
    /// cycle, sliced at unit granularity, or `None` if no transfer event
    /// fired.
    pub fn transfer(&self) -> Option<&[u8]> {
        if self.events & TEV_TRANSFER == 0 {
            return None;
        }
        let resource = self.resource.as_ref()?;
        Some(&resource.as_bytes()[self.window.start..self.window.stop])
    }

    /// Downcasts the acquired resource to a concrete `Resource` type, gated
    /// on a transfer event having fired this cycle — the same gating as
    /// [`Channel::transfer`], for subtypes (e.g. datagrams) whose payload
    /// isn't a flat byte window.
    pub fn resource_as<T: 'static>(&self) -> Option<&T> {
        if self.events & TEV_TRANSFER == 0 {
            return None;
        }
        self.resource.as_deref()?.as_any().downcast_ref::<T>()
    }

    pub fn events_word(&self) -> u8 {
        self.events
    }

    pub fn tev_transfer(&self) -> bool {
        self.events & TEV_TRANSFER != 0
    }

    pub fn tev_terminate(&self) -> bool {
        self.events & TEV_TERMINATE != 0
    }

    pub fn control_connect(&self) -> bool {
        self.control & CTRL_CONNECT != 0
    }

    pub fn clear_connect(&mut self) {
        self.control &= !CTRL_CONNECT;
    }

    pub fn control_force(&self) -> bool {
        self.control & CTRL_FORCE != 0
    }

    pub fn clear_force_control(&mut self) {
        self.control &= !CTRL_FORCE;
    }

    pub fn requeue(&self) -> bool {
        self.control & CTRL_REQUEUE != 0
    }

    pub fn set_requeue(&mut self, requeue: bool) {
        if requeue {
            self.control |= CTRL_REQUEUE;
        } else {
            self.control &= !CTRL_REQUEUE;
        }
    }

    pub fn set_attached(&mut self) {
        self.attached = true;
        self.control |= CTRL_CONNECT;
    }

    /// Re-arms the backend-subscription control bit without touching
    /// `attached` — used when a forked child must resubscribe every
    /// already-attached Channel's descriptor on the rebuilt backend.
    /// Distinct from `set_attached()`, which is only valid on first
    /// acquisition.
    pub fn request_reconnect(&mut self) {
        self.control |= CTRL_CONNECT;
    }

    /// `acquire(resource)`: borrow `resource`'s memory, reset the window,
    /// and set the transfer delta qualification.
    ///
    /// Only meaningful for a freestanding (not yet attached) Channel: there
    /// is no arena-level delta byte to publish here, so the internal
    /// transfer qualification is set directly, to be picked up on first
    /// acquisition by a Junction. An already-attached Channel's resource
    /// replacement must go through
    /// [`crate::cycle::Junction::acquire_resource`] instead, which publishes
    /// the arena delta this method has no access to; calling this directly
    /// on an attached Channel only stores the resource without marking it
    /// dirty for the next flush.
    pub fn acquire(&mut self, resource: Box<dyn Resource>) -> Result<(), ResourceError> {
        if self.terminated() {
            // "If the Channel is terminating, the call is a no-op".
            return Ok(());
        }

        if self.state & I_TRANSFER != 0 && self.resource.is_some() {
            return Err(ResourceError::NotExhausted);
        }

        self.set_resource(resource);

        if !self.attached {
            self.state |= I_TRANSFER;
        }

        Ok(())
    }

    /// Stores `resource` and resets the window without touching any
    /// qualification bits — the half of `acquire()` that is safe regardless
    /// of attachment; an attached caller still needs to publish the
    /// transfer delta separately.
    pub(crate) fn set_resource(&mut self, resource: Box<dyn Resource>) {
        self.resource = Some(resource);
        self.window = Window::default();
    }

    /// Applies a delta merge for the transfer qualification (used by the
    /// cycle's flush phase when it sees `D_TRANSFER` set, and directly by
    /// `acquire()` when the channel is already attached).
    pub fn merge_transfer_delta(&mut self) {
        self.state |= I_TRANSFER;
    }

    pub fn merge_terminate_delta(&mut self) {
        self.state |= I_TERMINATE;
    }

    /// `force()`: arm the control-latch path so the next cycle synthesizes a
    /// zero-length transfer event.
    pub fn request_force(&mut self) {
        self.control |= CTRL_FORCE;
    }

    /// Applies the synthetic readiness the apply-deltas phase grants a
    /// forced Channel: sets `X.transfer`.
    pub fn apply_force(&mut self) {
        self.state |= X_TRANSFER;
    }

    pub fn set_x_transfer(&mut self) {
        self.state |= X_TRANSFER;
    }

    pub fn clear_x_transfer(&mut self) {
        self.state &= !X_TRANSFER;
    }

    pub fn clear_i_transfer(&mut self) {
        self.state &= !I_TRANSFER;
    }

    pub fn set_x_terminate(&mut self) {
        self.state |= X_TERMINATE;
    }

    pub fn set_tev_transfer(&mut self) {
        self.events |= TEV_TRANSFER;
    }

    pub fn set_tev_terminate(&mut self) {
        self.events |= TEV_TERMINATE;
    }

    pub fn clear_events(&mut self) {
        self.events = 0;
    }

    /// Collapses the window at end-of-cycle: `window.start = window.stop`.
    pub fn collapse_window(&mut self) {
        self.window.start = self.window.stop;
    }

    /// Releases the resource borrow (exhaustion or termination).
    pub fn release_resource(&mut self) -> Option<Box<dyn Resource>> {
        self.resource.take()
    }

    pub fn release_link(&mut self) -> Option<Box<dyn Any>> {
        self.link.take()
    }

    /// Runs this Channel's subtype transfer function against
    /// `resource[stop..]`, expanding the window by the moved byte count.
    pub fn run_transfer(&mut self) -> TransferOutcome {
        let Some(resource) = self.resource.as_mut() else {
            return TransferOutcome::Flow(0);
        };

        let transfer_fn = self.transfer_fns.dispatch(self.polarity);
        let outcome = transfer_fn(
            &self.port,
            self.polarity,
            resource.as_mut(),
            self.window.start,
            self.window.stop,
        );

        match outcome {
            TransferOutcome::Flow(moved) | TransferOutcome::Stop(moved) => {
                self.window.stop += moved;
            }
            TransferOutcome::Terminate(_) => {}
        }

        outcome
    }

    /// `terminate()` on a detached Channel: runs synchronously.
    pub fn terminate_detached(&mut self) {
        self.port.unlatch(self.polarity);
        self.resource = None;
        self.link = None;
        self.state |= I_TERMINATE;
    }

    /// `terminate()` on an attached Channel: publish the terminate
    /// qualification so the next delta flush picks it up. The actual ring
    /// detachment happens in the cycle's drain phase.
    pub fn publish_terminate(&mut self) {
        self.state |= I_TERMINATE;
    }

    /// Commits termination during the cycle's drain phase: releases the
    /// resource and link, unlatches the port for this polarity. Unlike
    /// `terminate_detached()`, `I_TERMINATE` is already set by the time this
    /// runs — the drain phase only needs to release the borrow and the
    /// port latch.
    pub(crate) fn commit_terminate(&mut self) {
        self.port.unlatch(self.polarity);
        self.resource = None;
        self.link = None;
    }

    /// `endpoint()`: the address a socket Channel's descriptor is bound to
    /// (Input polarity) or connected to (Output polarity). A local anonymous
    /// `AF_UNIX` peer has no `sockaddr_un` path to report, so it reports the
    /// credentials of the process on the other end instead of `None`.
    pub fn endpoint(&self) -> Option<Endpoint> {
        let fd = self.port.descriptor();
        if fd < 0 {
            return None;
        }

        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        // SAFETY: fd is a valid descriptor; storage/len describe a stack
        // buffer sized for any sockaddr variant.
        let rc = unsafe {
            match self.polarity {
                Polarity::Input => {
                    libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
                }
                Polarity::Output => {
                    libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
                }
            }
        };

        if rc != 0 {
            return None;
        }

        if storage.ss_family as i32 == libc::AF_UNIX {
            return crate::transfer::unix_peer_credentials(fd).map(|(uid, gid)| Endpoint::UnixPeer { uid, gid });
        }

        crate::transfer::sockaddr_to_std(&storage).map(Endpoint::Inet)
    }

    pub fn resize_exoresource(&self, n: i32) {
        crate::transfer::resize_exoresource(&self.port, self.port.freight(), n);
    }

    pub fn record_kernel_error(&self, call: LastCall, errno: i32) {
        self.port.record_error(call, errno);
    }
}

/// A thread-safe, cloneable capability for publishing a delta bit on a
/// Channel without holding the exclusive access token — the delta byte is
/// the only field legally mutated by other callers during the I/O phase.
/// Distinct from `&mut Channel`, which only the token holder (or the
/// cycle's worker phase) may obtain.
#[derive(Clone)]
pub struct ChannelHandle {
    delta: Arc<AtomicU8>,
}

impl ChannelHandle {
    pub fn new(delta: Arc<AtomicU8>) -> Self {
        ChannelHandle { delta }
    }

    pub fn publish_transfer(&self) {
        self.delta.fetch_or(D_TRANSFER, Ordering::Release);
    }

    pub fn publish_terminate(&self) {
        self.delta.fetch_or(D_TERMINATE, Ordering::Release);
    }

    /// Publishes the `force` delta bit, callable from any thread since the
    /// delta byte is the only field other callers may touch during the I/O
    /// phase. The actual `CTRL_FORCE` control bit is set by the cycle
    /// engine's flush phase once it observes this delta under the exclusive
    /// token, not here.
    pub fn publish_force(&self) {
        self.delta.fetch_or(D_FORCE, Ordering::Release);
    }

    pub(crate) fn take(&self) -> u8 {
        self.delta.swap(0, Ordering::AcqRel)
    }
}

pub(crate) const DELTA_TRANSFER: u8 = D_TRANSFER;
pub(crate) const DELTA_TERMINATE: u8 = D_TERMINATE;
pub(crate) const DELTA_CONNECT: u8 = D_CONNECT;
pub(crate) const DELTA_FORCE: u8 = D_FORCE;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{Freight, ResourceKind};
    use crate::transfer::{OctetBuffer, OCTETS};

    fn test_channel() -> Channel {
        let port = Port::new(unsafe { libc::dup(0) }, ResourceKind::Pipe, Freight::Octets);
        port.latch(Polarity::Input);
        Channel::new(Polarity::Input, port, &OCTETS)
    }

    #[test]
    fn acquire_resets_window_and_sets_internal_qualification_when_detached() {
        let mut c = test_channel();
        c.acquire(Box::new(OctetBuffer(vec![0; 4]))).unwrap();
        assert_eq!(c.slice(), (0, 0));
        assert!(c.state & I_TRANSFER != 0);
    }

    #[test]
    fn acquire_twice_without_exhaust_fails() {
        let mut c = test_channel();
        c.acquire(Box::new(OctetBuffer(vec![0; 4]))).unwrap();
        // Still has I_TRANSFER set and the resource is present: a second
        // acquire before exhaustion must fail.
        let err = c.acquire(Box::new(OctetBuffer(vec![0; 4])));
        assert!(err.is_err());
    }

    #[test]
    fn terminate_on_terminated_channel_is_noop_acquire() {
        let mut c = test_channel();
        c.terminate_detached();
        assert!(c.terminated());
        // acquire() after termination is a silent no-op success.
        assert!(c.acquire(Box::new(OctetBuffer(vec![0; 4]))).is_ok());
        assert!(c.exhausted());
    }

    #[test]
    fn sizeof_transfer_zero_without_event() {
        let c = test_channel();
        assert_eq!(c.sizeof_transfer(), 0);
    }
}
