// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The `rallocate` resource-allocation request directory: concrete
//! allocators that turn a request for a kind of kernel resource into
//! ready-made Channel(s) with their freight tag and transfer-function table
//! already set.
//!
//! Address-family marshaling remains an external collaborator's job: every
//! function here takes an already-parsed `std::net::SocketAddr` or `Path`,
//! never a string to parse, and nothing here interprets the contents of
//! what it moves.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::path::Path;

use nix::sys::socket::{
    bind, connect, listen, socket, socketpair, AddressFamily, Backlog, SockFlag, SockType,
    SockaddrIn, SockaddrIn6, SockaddrStorage,
};

use crate::channel::{Channel, Polarity};
use crate::port::{Freight, LastCall, Port, ResourceKind};
use crate::transfer::{DATAGRAMS, OCTETS, PORTS, SOCKETS};

fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: raw is a valid, exclusively-owned descriptor for the
    // duration of this call.
    unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFL);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn to_nix_addr(addr: SocketAddr) -> SockaddrStorage {
    match addr {
        SocketAddr::V4(v4) => SockaddrStorage::from(SockaddrIn::from(v4)),
        SocketAddr::V6(v6) => SockaddrStorage::from(SockaddrIn6::from(v6)),
    }
}

/// Builds an (input, output) bidirectional Channel pair sharing one Port
/// over `fd`, the shape every connected-stream request produces.
fn octets_pair_from_fd(fd: OwnedFd) -> (Channel, Channel) {
    let raw = fd.into_raw_fd();
    let port = Port::new(raw, ResourceKind::Socket, Freight::Octets);
    port.latch(Polarity::Input);
    port.latch(Polarity::Output);
    (
        Channel::new(Polarity::Input, port.clone(), &OCTETS),
        Channel::new(Polarity::Output, port, &OCTETS),
    )
}

/// `("octets", "ip4"|"ip6", "tcp")`: opens a non-blocking TCP socket and
/// begins connecting to `addr`. The connect is non-blocking (`EINPROGRESS`
/// is expected, not an error); the engine's own cycle discovers completion
/// the normal way — a writable event on the output Channel.
pub fn octets_tcp_connect(addr: SocketAddr) -> Result<(Channel, Channel), std::io::Error> {
    let family = if addr.is_ipv4() { AddressFamily::Inet } else { AddressFamily::Inet6 };
    let fd = socket(family, SockType::Stream, SockFlag::SOCK_NONBLOCK, None)?;

    match connect(fd.as_raw_fd(), &to_nix_addr(addr)) {
        Ok(()) => {}
        Err(nix::Error::EINPROGRESS) => {}
        Err(err) => return Err(std::io::Error::from_raw_os_error(err as i32)),
    }

    Ok(octets_pair_from_fd(fd))
}

/// `("octets", "ip4"|"ip6", "tcp", "bind")`: opens a non-blocking TCP socket
/// bound to `addr` without connecting — e.g. to pin a source port ahead of
/// a later connect the caller drives itself.
pub fn octets_tcp_bind(addr: SocketAddr) -> Result<(Channel, Channel), std::io::Error> {
    let family = if addr.is_ipv4() { AddressFamily::Inet } else { AddressFamily::Inet6 };
    let fd = socket(family, SockType::Stream, SockFlag::SOCK_NONBLOCK, None)?;
    bind(fd.as_raw_fd(), &to_nix_addr(addr))?;
    Ok(octets_pair_from_fd(fd))
}

/// `("sockets", "ip4"|"ip6")`: a listening socket, input-only, whose
/// transfer function `accept`s connections into a `DescriptorArray`.
pub fn sockets_listener(addr: SocketAddr, backlog: i32) -> Result<Channel, std::io::Error> {
    let family = if addr.is_ipv4() { AddressFamily::Inet } else { AddressFamily::Inet6 };
    let fd = socket(family, SockType::Stream, SockFlag::SOCK_NONBLOCK, None)?;
    bind(fd.as_raw_fd(), &to_nix_addr(addr))?;
    let backlog = Backlog::new(backlog).unwrap_or(Backlog::DEFAULT);
    listen(&fd, backlog)?;

    let port = Port::new(fd.into_raw_fd(), ResourceKind::Socket, Freight::Sockets);
    port.latch(Polarity::Input);
    Ok(Channel::new(Polarity::Input, port, &SOCKETS))
}

/// `("datagrams", "ip4"|"ip6", "udp")`: a bound UDP socket, bidirectional,
/// whose resource is a `DatagramArray` rather than a plain byte buffer.
pub fn datagrams_udp(addr: SocketAddr) -> Result<(Channel, Channel), std::io::Error> {
    let family = if addr.is_ipv4() { AddressFamily::Inet } else { AddressFamily::Inet6 };
    let fd = socket(family, SockType::Datagram, SockFlag::SOCK_NONBLOCK, None)?;
    bind(fd.as_raw_fd(), &to_nix_addr(addr))?;

    let port = Port::new(fd.into_raw_fd(), ResourceKind::Socket, Freight::Datagrams);
    port.latch(Polarity::Input);
    port.latch(Polarity::Output);

    Ok((
        Channel::new(Polarity::Input, port.clone(), &DATAGRAMS),
        Channel::new(Polarity::Output, port, &DATAGRAMS),
    ))
}

/// `("octets", "spawn", "bidirectional")`: a connected `AF_UNIX` socketpair,
/// each endpoint bidirectional.
pub fn octets_spawn_bidirectional() -> Result<((Channel, Channel), (Channel, Channel)), std::io::Error> {
    let (a, b) = socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::SOCK_NONBLOCK)?;
    Ok((octets_pair_from_fd(a), octets_pair_from_fd(b)))
}

/// `("octets", "spawn", "unidirectional")`: a `pipe(2)` pair — a read-only
/// Channel and a write-only Channel, each over its own Port since the two
/// fds are independent descriptors.
pub fn octets_spawn_unidirectional() -> Result<(Channel, Channel), std::io::Error> {
    let mut fds = [0i32; 2];
    // SAFETY: fds is a valid 2-element stack array for pipe(2) to fill.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let read_port = Port::new(fds[0], ResourceKind::Pipe, Freight::Octets);
    let write_port = Port::new(fds[1], ResourceKind::Pipe, Freight::Octets);
    read_port.latch(Polarity::Input);
    write_port.latch(Polarity::Output);

    // SAFETY: set_nonblocking only touches the fd's O_NONBLOCK flag.
    for &fd in &fds {
        // `OwnedFd` is only used transiently to reuse `set_nonblocking`;
        // the underlying descriptor is still owned by the Port constructed
        // above, so forget the temporary wrapper rather than letting it close.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        let _ = set_nonblocking(&owned);
        std::mem::forget(owned);
    }

    Ok((
        Channel::new(Polarity::Input, read_port, &OCTETS),
        Channel::new(Polarity::Output, write_port, &OCTETS),
    ))
}

/// `("octets", "file", "read")`: a read-only Channel over an already-open
/// file, with `requeue` set so the transfer function stays subscribed after
/// hitting EOF rather than being treated as a terminating stream.
pub fn octets_file_read(path: &Path) -> Result<Channel, std::io::Error> {
    let file = std::fs::File::open(path)?;
    let raw = file.into_raw_fd();

    // SAFETY: raw was just obtained by consuming a valid, exclusively owned
    // `File`.
    unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFL);
        libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }

    let port = Port::new(raw, ResourceKind::File, Freight::Octets);
    port.latch(Polarity::Input);
    let mut channel = Channel::new(Polarity::Input, port, &OCTETS);
    channel.set_requeue(true);
    Ok(channel)
}

/// `("ports", "acquire", "socket")`: a connected `AF_UNIX` socketpair
/// dedicated to `SCM_RIGHTS` descriptor passing, input-only on each side.
pub fn ports_acquire_socket() -> Result<((Channel, Channel), (Channel, Channel)), std::io::Error> {
    let (a, b) = socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::SOCK_NONBLOCK)?;

    let build = |fd: OwnedFd| -> (Channel, Channel) {
        let port = Port::new(fd.into_raw_fd(), ResourceKind::Socket, Freight::Ports);
        port.latch(Polarity::Input);
        port.latch(Polarity::Output);
        (
            Channel::new(Polarity::Input, port.clone(), &PORTS),
            Channel::new(Polarity::Output, port, &PORTS),
        )
    };

    Ok((build(a), build(b)))
}

/// A Channel born terminated: the requested syscall failed, so the Channel
/// is born already in the terminate state and will deliver exactly one
/// terminate event on first acquisition, rather than `rallocate` itself
/// surfacing the kernel failure as a `Result::Err`.
pub fn born_terminated(polarity: Polarity, last_call: LastCall, errno: i32, freight: Freight) -> Channel {
    let port = Port::failed(last_call, errno, freight);
    Channel::new(polarity, port, &OCTETS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unidirectional_pipe_yields_independent_ports() {
        let (reader, writer) = octets_spawn_unidirectional().unwrap();
        assert_eq!(reader.polarity(), Polarity::Input);
        assert_eq!(writer.polarity(), Polarity::Output);
        assert_ne!(reader.port().descriptor(), writer.port().descriptor());
    }

    #[test]
    fn bidirectional_socketpair_shares_one_port_per_endpoint() {
        let ((a_in, a_out), (b_in, b_out)) = octets_spawn_bidirectional().unwrap();
        assert_eq!(a_in.port().descriptor(), a_out.port().descriptor());
        assert_eq!(b_in.port().descriptor(), b_out.port().descriptor());
        assert_ne!(a_in.port().descriptor(), b_in.port().descriptor());
    }

    #[test]
    fn born_terminated_channel_is_terminated_immediately() {
        let channel = born_terminated(Polarity::Input, LastCall::Connect, libc::ECONNREFUSED, Freight::Octets);
        assert!(channel.terminated());
    }
}
