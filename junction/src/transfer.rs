// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Per-subtype transfer function tables and the caller-owned resource
//! buffers they move bytes into and out of.
//!
//! Address-family marshaling and the concrete datagram-array memory layout
//! are external-collaborator concerns; the types here model only as much
//! structure as the transfer functions themselves need.

use std::any::Any;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use log::trace;

use crate::port::{Freight, LastCall, Port, Polarity};

/// A caller-owned buffer loaned to a Channel between `acquire()` and
/// exhaustion/termination.
///
/// `unit_size()` is the stride the subtype's freight moves in: 1 byte for
/// octets and framed datagrams, `size_of::<RawFd>()` for descriptor-passing
/// freights.
pub trait Resource: Any {
    fn capacity_bytes(&self) -> usize;
    fn as_bytes(&self) -> &[u8];
    fn as_bytes_mut(&mut self) -> &mut [u8];
    fn unit_size(&self) -> usize {
        1
    }
    /// Downcast anchor for subtypes whose payload isn't a flat byte window
    /// (see [`DatagramArray`]); mirrors the same `dyn Any` pattern
    /// `crate::channel::Channel`'s `link` field already uses.
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A plain byte buffer — the resource for octet (stream) Channels.
pub struct OctetBuffer(pub Vec<u8>);

impl Resource for OctetBuffer {
    fn capacity_bytes(&self) -> usize {
        self.0.len()
    }
    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// An array of raw file descriptors — the resource for listener `accept()`
/// Channels and for `SCM_RIGHTS` fd-passing Channels. Entries start as `-1`
/// and are overwritten as descriptors arrive.
pub struct DescriptorArray(pub Vec<RawFd>);

impl DescriptorArray {
    pub fn new(len: usize) -> Self {
        DescriptorArray(vec![-1; len])
    }
}

impl Resource for DescriptorArray {
    fn capacity_bytes(&self) -> usize {
        self.0.len() * std::mem::size_of::<RawFd>()
    }
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: RawFd (i32) has no padding/niches that make a byte
        // reinterpretation unsound; alignment of u8 is <= alignment of i32.
        unsafe {
            std::slice::from_raw_parts(self.0.as_ptr() as *const u8, self.capacity_bytes())
        }
    }
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.capacity_bytes();
        unsafe { std::slice::from_raw_parts_mut(self.0.as_mut_ptr() as *mut u8, len) }
    }
    fn unit_size(&self) -> usize {
        std::mem::size_of::<RawFd>()
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// One received or to-be-sent datagram payload paired with its peer address.
/// The actual wire framing of a DatagramArray's backing storage is an
/// external-collaborator concern; this crate only needs the (endpoint,
/// payload) pairing the transfer function produces/consumes.
pub struct DatagramArray {
    payloads: Vec<Vec<u8>>,
    endpoints: Vec<Option<SocketAddr>>,
    datagram_cap: usize,
}

impl DatagramArray {
    pub fn new(count: usize, datagram_cap: usize) -> Self {
        DatagramArray {
            payloads: vec![Vec::new(); count],
            endpoints: vec![None; count],
            datagram_cap,
        }
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn get(&self, i: usize) -> (Option<SocketAddr>, &[u8]) {
        (self.endpoints[i], &self.payloads[i])
    }

    pub fn set_outgoing(&mut self, i: usize, addr: SocketAddr, payload: Vec<u8>) {
        self.endpoints[i] = Some(addr);
        self.payloads[i] = payload;
    }
}

impl Resource for DatagramArray {
    fn capacity_bytes(&self) -> usize {
        self.payloads.len() * self.datagram_cap
    }
    fn as_bytes(&self) -> &[u8] {
        // Datagram framing is opaque to the engine; the generic byte view
        // only exists to satisfy the uniform window bookkeeping in
        // `Channel`, and is never read directly by `recv_datagrams`/
        // `send_datagrams` below — those index `payloads`/`endpoints`
        // directly via the `dgram_recv`/`dgram_send` dispatch functions.
        &[]
    }
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut []
    }
    fn unit_size(&self) -> usize {
        self.datagram_cap.max(1)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// The outcome of one non-blocking transfer attempt.
pub enum TransferOutcome {
    /// Bytes moved and the buffer is exhausted without hitting EAGAIN (e.g.
    /// the window closed). Internal transfer qualification should clear.
    Flow(usize),
    /// Bytes moved (possibly zero) before the call returned
    /// EAGAIN/EWOULDBLOCK; external transfer qualification should clear
    /// until readiness returns, but the window still advances by the count
    /// carried here so progress made before the EAGAIN is never dropped.
    Stop(usize),
    /// EOF, or a fatal errno. External terminate qualification should set.
    Terminate(i32),
}

/// A transfer function moves data between the kernel and
/// `resource[window.stop..]`, returning how many (unit-sized) elements moved
/// and why it stopped.
pub type TransferFn = fn(&Port, Polarity, &mut dyn Resource, usize, usize) -> TransferOutcome;

/// Per-subtype pair of transfer functions, keyed by polarity, resolved once
/// at Channel construction.
pub struct TransferFns {
    pub input: TransferFn,
    pub output: TransferFn,
    pub unit_size: usize,
}

impl TransferFns {
    pub fn dispatch(&self, polarity: Polarity) -> TransferFn {
        match polarity {
            Polarity::Input => self.input,
            Polarity::Output => self.output,
        }
    }
}

fn last_os_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// `read(2)` loop into `resource[stop..]`, repeating until the window
/// closes, EAGAIN, EOF, or a fatal error — a single short read is not
/// enough to know whether more is immediately available.
pub fn octets_recv(
    port: &Port,
    _polarity: Polarity,
    resource: &mut dyn Resource,
    _start: usize,
    stop: usize,
) -> TransferOutcome {
    let fd = port.descriptor();
    let total = resource.capacity_bytes();
    let mut moved = 0usize;

    loop {
        let offset = stop + moved;
        if offset == total {
            return TransferOutcome::Flow(moved);
        }
        let buf = &mut resource.as_bytes_mut()[offset..];

        // SAFETY: fd is a valid, non-blocking, owned descriptor; buf is a
        // valid mutable byte range within the caller's loaned resource.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };

        match n {
            0 => {
                if moved > 0 {
                    // Deliver what's already read; the next attempt will
                    // see EOF again and terminate.
                    return TransferOutcome::Flow(moved);
                }
                trace!("octets_recv: EOF on fd {fd}");
                return TransferOutcome::Terminate(0);
            }
            n if n > 0 => {
                moved += n as usize;
            }
            _ => {
                let errno = last_os_errno();
                return if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                    TransferOutcome::Stop(moved)
                } else if moved > 0 {
                    TransferOutcome::Flow(moved)
                } else {
                    TransferOutcome::Terminate(errno)
                };
            }
        }
    }
}

/// `write(2)` loop out of `resource[stop..]`, repeating until the window
/// closes, EAGAIN, or a fatal error.
pub fn octets_send(
    port: &Port,
    _polarity: Polarity,
    resource: &mut dyn Resource,
    _start: usize,
    stop: usize,
) -> TransferOutcome {
    let fd = port.descriptor();
    let total = resource.capacity_bytes();
    let mut moved = 0usize;

    loop {
        let offset = stop + moved;
        if offset == total {
            return TransferOutcome::Flow(moved);
        }
        let buf = &resource.as_bytes()[offset..];

        // SAFETY: fd is a valid, non-blocking, owned descriptor; buf is a
        // valid byte range within the caller's loaned resource.
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };

        if n >= 0 {
            moved += n as usize;
            continue;
        }

        let errno = last_os_errno();
        return match errno {
            libc::EAGAIN | libc::EWOULDBLOCK => TransferOutcome::Stop(moved),
            _ if moved > 0 => TransferOutcome::Flow(moved),
            _ => TransferOutcome::Terminate(errno),
        };
    }
}

pub static OCTETS: TransferFns = TransferFns {
    input: octets_recv,
    output: octets_send,
    unit_size: 1,
};

/// `accept(2)` loop into a `DescriptorArray`, one new connection fd per
/// unit, until EAGAIN.
pub fn sockets_accept(
    port: &Port,
    _polarity: Polarity,
    resource: &mut dyn Resource,
    _start: usize,
    stop: usize,
) -> TransferOutcome {
    let fd = port.descriptor();
    let unit = resource.unit_size();
    let total = resource.capacity_bytes();
    let mut moved = 0usize;
    let mut offset = stop;

    while offset + unit <= total {
        // SAFETY: fd is the valid listening descriptor; libc::accept4 returns
        // either a new, already-non-blocking fd or -1/errno. Every other
        // descriptor this engine hands a Channel is O_NONBLOCK from the
        // moment it's created; accept4's SOCK_NONBLOCK keeps accepted
        // connections the same way rather than needing a follow-up fcntl.
        let accepted =
            unsafe { libc::accept4(fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_NONBLOCK) };

        if accepted < 0 {
            let errno = last_os_errno();
            return if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                if moved == 0 {
                    TransferOutcome::Stop(0)
                } else {
                    TransferOutcome::Flow(moved)
                }
            } else if moved > 0 {
                TransferOutcome::Flow(moved)
            } else {
                TransferOutcome::Terminate(errno)
            };
        }

        let slot = &mut resource.as_bytes_mut()[offset..offset + unit];
        slot.copy_from_slice(&accepted.to_ne_bytes());
        offset += unit;
        moved += unit;
    }

    TransferOutcome::Flow(moved)
}

fn sockets_no_output(
    _port: &Port,
    _polarity: Polarity,
    _resource: &mut dyn Resource,
    _start: usize,
    _stop: usize,
) -> TransferOutcome {
    TransferOutcome::Flow(0)
}

pub static SOCKETS: TransferFns = TransferFns {
    input: sockets_accept,
    output: sockets_no_output,
    unit_size: std::mem::size_of::<RawFd>(),
};

/// Ancillary buffer sized for one `SCM_RIGHTS` control message carrying a
/// single fd, built by hand from `libc::CMSG_SPACE` rather than reaching for
/// a higher-level wrapper.
fn cmsg_space_one_fd() -> usize {
    unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) as usize }
}

/// `recvmsg(2)` with `SCM_RIGHTS` ancillary data, one fd per unit.
pub fn ports_recv(
    port: &Port,
    _polarity: Polarity,
    resource: &mut dyn Resource,
    _start: usize,
    stop: usize,
) -> TransferOutcome {
    let fd = port.descriptor();
    let unit = resource.unit_size();
    let total = resource.capacity_bytes();
    if stop + unit > total {
        return TransferOutcome::Flow(0);
    }

    let mut iobuf = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: iobuf.as_mut_ptr() as *mut libc::c_void,
        iov_len: iobuf.len(),
    };
    let mut cbuf = vec![0u8; cmsg_space_one_fd()];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cbuf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cbuf.len();

    // SAFETY: fd is the valid, non-blocking connected Channel descriptor;
    // `msg` describes buffers owned on this stack frame for the duration of
    // the call.
    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };

    if n == 0 {
        return TransferOutcome::Terminate(0);
    }
    if n < 0 {
        let errno = last_os_errno();
        return if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            TransferOutcome::Stop(0)
        } else {
            TransferOutcome::Terminate(errno)
        };
    }

    let mut moved = 0usize;
    // SAFETY: `msg` was just populated by a successful recvmsg(); CMSG_FIRSTHDR
    // walks the control buffer it wrote into.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                let payload_len = (*cmsg).cmsg_len - libc::CMSG_LEN(0) as usize;
                let count = payload_len / std::mem::size_of::<RawFd>();
                for i in 0..count {
                    let offset = stop + moved;
                    if offset + unit > total {
                        break;
                    }
                    let received = *data.add(i);
                    let slot = &mut resource.as_bytes_mut()[offset..offset + unit];
                    slot.copy_from_slice(&received.to_ne_bytes());
                    moved += unit;
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    TransferOutcome::Flow(moved)
}

fn ports_no_output(
    _port: &Port,
    _polarity: Polarity,
    _resource: &mut dyn Resource,
    _start: usize,
    _stop: usize,
) -> TransferOutcome {
    TransferOutcome::Stop(0)
}

pub static PORTS: TransferFns = TransferFns {
    input: ports_recv,
    output: ports_no_output,
    unit_size: std::mem::size_of::<RawFd>(),
};

/// Sends `fds` (owning descriptors) over `port` via `SCM_RIGHTS`. Not part of
/// the `TransferFn` table (the outbound side needs the caller's fd list
/// directly rather than a generic byte resource); used by `rallocate`
/// consumers that implement a ports-passing Channel pair.
pub fn ports_send(port: &Port, fds: &[RawFd]) -> std::io::Result<usize> {
    let iobuf = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: iobuf.as_ptr() as *mut libc::c_void,
        iov_len: iobuf.len(),
    };

    let space = unsafe { libc::CMSG_SPACE((fds.len() * std::mem::size_of::<RawFd>()) as u32) };
    let mut cbuf = vec![0u8; space as usize];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cbuf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cbuf.len();

    // SAFETY: `msg` and its control buffer are valid for the duration of the
    // call; `cmsg` is written into `cbuf`, which outlives the sendmsg call.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * std::mem::size_of::<RawFd>()) as u32) as _;
        let data = libc::CMSG_DATA(cmsg) as *mut RawFd;
        for (i, fd) in fds.iter().enumerate() {
            *data.add(i) = *fd;
        }
    }

    let n = unsafe { libc::sendmsg(port.descriptor(), &msg, 0) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Converts a `std::net::SocketAddr` into a `libc::sockaddr_storage` and its
/// effective length, for `sendto(2)`.
fn std_to_sockaddr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: 0,
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Fetches the `(uid, gid)` of the process on the other end of a connected
/// `AF_UNIX` socket — `SO_PEERCRED` on Linux, `getpeereid(2)` elsewhere.
#[cfg(target_os = "linux")]
pub(crate) fn unix_peer_credentials(fd: RawFd) -> Option<(u32, u32)> {
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    // SAFETY: fd is a valid descriptor; cred/len describe a stack buffer
    // sized for exactly one `ucred`.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    Some((cred.uid, cred.gid))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn unix_peer_credentials(fd: RawFd) -> Option<(u32, u32)> {
    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;
    // SAFETY: fd is a valid descriptor; uid/gid are plain stack outputs.
    let rc = unsafe { libc::getpeereid(fd, &mut uid, &mut gid) };
    if rc != 0 {
        return None;
    }
    Some((uid, gid))
}

/// Converts a populated `libc::sockaddr_storage` back into a `SocketAddr`.
pub(crate) fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::from((ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::from((ip, u16::from_be(sin6.sin6_port))))
        }
        _ => None,
    }
}

/// `recvfrom(2)` loop into a `DatagramArray`, one datagram per unit.
/// Implemented as a per-datagram loop rather than a single batched
/// `recvmmsg` call — the DatagramArray memory layout is an
/// external-collaborator concern, so there is no single contiguous buffer
/// to hand the kernel in one syscall here.
pub fn recv_datagrams(port: &Port, datagrams: &mut DatagramArray) -> TransferOutcome {
    let fd = port.descriptor();
    let mut moved = 0usize;

    for i in 0..datagrams.len() {
        let mut buf = vec![0u8; datagrams.datagram_cap];
        let mut from: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut fromlen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        // SAFETY: `buf`/`from` are valid, appropriately-sized stack buffers
        // for the duration of the call.
        let n = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut from as *mut _ as *mut libc::sockaddr,
                &mut fromlen,
            )
        };

        if n < 0 {
            let errno = last_os_errno();
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                break;
            }
            return if moved > 0 {
                TransferOutcome::Flow(moved)
            } else {
                TransferOutcome::Terminate(errno)
            };
        }

        buf.truncate(n as usize);
        datagrams.endpoints[i] = sockaddr_to_std(&from);
        datagrams.payloads[i] = buf;
        moved += 1;
    }

    if moved == 0 {
        TransferOutcome::Stop(0)
    } else {
        TransferOutcome::Flow(moved)
    }
}

/// `sendto(2)` loop out of a `DatagramArray`, one datagram per unit.
pub fn send_datagrams(port: &Port, datagrams: &DatagramArray) -> TransferOutcome {
    let fd = port.descriptor();
    let mut moved = 0usize;

    for i in 0..datagrams.len() {
        let (addr, payload) = datagrams.get(i);
        let Some(addr) = addr else { continue };
        let (storage, len) = std_to_sockaddr(addr);

        // SAFETY: `storage` is a fully-initialized sockaddr of `len` bytes.
        let n = unsafe {
            libc::sendto(
                fd,
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
                0,
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        };

        if n < 0 {
            let errno = last_os_errno();
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                break;
            }
            return if moved > 0 {
                TransferOutcome::Flow(moved)
            } else {
                TransferOutcome::Terminate(errno)
            };
        }
        moved += 1;
    }

    if moved == 0 {
        TransferOutcome::Stop(0)
    } else {
        TransferOutcome::Flow(moved)
    }
}

/// `TransferFn` adapter for [`recv_datagrams`]: downcasts the generic
/// resource to a `DatagramArray` and rescales its per-datagram count into
/// the byte-equivalent units `Channel`'s window bookkeeping expects.
fn dgram_recv(
    port: &Port,
    _polarity: Polarity,
    resource: &mut dyn Resource,
    _start: usize,
    _stop: usize,
) -> TransferOutcome {
    let unit = resource.unit_size().max(1);
    let Some(datagrams) = resource.as_any_mut().downcast_mut::<DatagramArray>() else {
        return TransferOutcome::Flow(0);
    };
    match recv_datagrams(port, datagrams) {
        TransferOutcome::Flow(units) => TransferOutcome::Flow(units * unit),
        TransferOutcome::Stop(units) => TransferOutcome::Stop(units * unit),
        terminate => terminate,
    }
}

/// `TransferFn` adapter for [`send_datagrams`]; see [`dgram_recv`].
fn dgram_send(
    port: &Port,
    _polarity: Polarity,
    resource: &mut dyn Resource,
    _start: usize,
    _stop: usize,
) -> TransferOutcome {
    let unit = resource.unit_size().max(1);
    let Some(datagrams) = resource.as_any().downcast_ref::<DatagramArray>() else {
        return TransferOutcome::Flow(0);
    };
    match send_datagrams(port, datagrams) {
        TransferOutcome::Flow(units) => TransferOutcome::Flow(units * unit),
        TransferOutcome::Stop(units) => TransferOutcome::Stop(units * unit),
        terminate => terminate,
    }
}

// Unlike the other tables, a datagram's unit size varies per `DatagramArray`
// instance (`datagram_cap`), not per subtype — `0` here is a placeholder;
// `Resource::unit_size()` on the acquired resource is what the adapters
// above actually use.
pub static DATAGRAMS: TransferFns = TransferFns {
    input: dgram_recv,
    output: dgram_send,
    unit_size: 0,
};

pub fn resize_exoresource(port: &Port, freight: Freight, n: i32) {
    let fd = port.descriptor();
    match freight {
        Freight::Octets => {
            // SO_SNDBUF / SO_RCVBUF — applied to both directions; a
            // per-polarity choice is left to the caller via two calls on
            // sibling Channels: caller picks the syscall, library supplies
            // the fd.
            unsafe {
                let _ = libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUF,
                    &n as *const _ as *const libc::c_void,
                    std::mem::size_of::<i32>() as libc::socklen_t,
                );
            }
        }
        Freight::Sockets => {
            // SAFETY: fd is the valid listening descriptor.
            let rc = unsafe { libc::listen(fd, n) };
            if rc != 0 {
                port.record_error(LastCall::Listen, last_os_errno());
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::ResourceKind;

    #[test]
    fn octet_buffer_roundtrips_bytes() {
        let mut buf = OctetBuffer(vec![0u8; 8]);
        buf.as_bytes_mut()[..4].copy_from_slice(b"abcd");
        assert_eq!(&buf.as_bytes()[..4], b"abcd");
    }

    #[test]
    fn descriptor_array_unit_size_is_raw_fd() {
        let arr = DescriptorArray::new(4);
        assert_eq!(arr.unit_size(), std::mem::size_of::<RawFd>());
        assert_eq!(arr.capacity_bytes(), 4 * std::mem::size_of::<RawFd>());
    }

    #[test]
    fn octets_send_on_closed_pipe_terminates() {
        // A pipe whose read end is closed immediately yields EPIPE on write.
        let mut fds = [0i32; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        unsafe { libc::close(fds[0]) };

        unsafe {
            let flags = libc::fcntl(fds[1], libc::F_GETFL);
            libc::fcntl(fds[1], libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        // Ignore SIGPIPE for the duration of the test so the write returns
        // EPIPE instead of killing the process.
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

        let port = Port::new(fds[1], ResourceKind::Pipe, Freight::Octets);
        let mut buf = OctetBuffer(vec![1, 2, 3, 4]);
        match octets_send(&port, Polarity::Output, &mut buf, 0, 0) {
            TransferOutcome::Terminate(_) => {}
            TransferOutcome::Flow(_) => {
                // On some kernels the first write succeeds and EPIPE shows
                // up on the second; that's still a valid non-panicking path.
            }
            TransferOutcome::Stop(_) => panic!("expected either Flow then EOF, or Terminate"),
        }
        unsafe { libc::close(fds[1]) };
    }

    #[test]
    fn unix_peer_credentials_reports_own_process() {
        let (a, b) = nix::sys::socket::socketpair(
            nix::sys::socket::AddressFamily::Unix,
            nix::sys::socket::SockType::Stream,
            None,
            nix::sys::socket::SockFlag::empty(),
        )
        .unwrap();
        use std::os::fd::AsRawFd;
        let (uid, gid) = unix_peer_credentials(a.as_raw_fd()).expect("connected AF_UNIX peer has credentials");
        // Both ends of the pair are this same process.
        assert_eq!(uid, unsafe { libc::getuid() });
        assert_eq!(gid, unsafe { libc::getgid() });
        drop(b);
    }
}
