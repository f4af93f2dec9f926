// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! End-to-end scenarios driven against the real `Junction` cycle engine
//! rather than unit-level fixtures.

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use junction::alloc::{datagrams_udp, octets_spawn_unidirectional, sockets_listener};
use junction::transfer::{DatagramArray, DescriptorArray, OctetBuffer, OCTETS};
use junction::{Channel, ChannelId, Freight, Junction, Polarity, Port, ResourceKind};

/// Runs cycles on `junction`, accepting through `listener_id` and handing
/// the first accepted descriptor back as a raw fd. Shared by scenarios that
/// need a live, kernel-backed connected stream rather than a local pipe.
fn accept_one(junction: &mut Junction, listener_id: ChannelId, max_cycles: usize) -> i32 {
    for _ in 0..max_cycles {
        junction.begin_cycle().unwrap();
        let mut accepted = None;
        for id in junction.transfer().unwrap() {
            if id == listener_id {
                if let Some(bytes) = junction.channel(id).unwrap().transfer() {
                    for chunk in bytes.chunks_exact(std::mem::size_of::<i32>()) {
                        let fd = i32::from_ne_bytes(chunk.try_into().unwrap());
                        if fd >= 0 {
                            accepted = Some(fd);
                        }
                    }
                }
            }
        }
        junction.end_cycle().unwrap();
        if let Some(fd) = accepted {
            return fd;
        }
    }
    panic!("no connection accepted within {max_cycles} cycles");
}

#[test]
fn scenario_1_pipe_echo() {
    let (mut reader, mut writer) = octets_spawn_unidirectional().unwrap();
    reader.acquire(Box::new(OctetBuffer(vec![0u8; 4]))).unwrap();
    writer.acquire(Box::new(OctetBuffer(b"abcd".to_vec()))).unwrap();

    let mut junction = Junction::new(8).unwrap();
    let reader_id = junction.acquire(reader);
    let writer_id = junction.acquire(writer);

    let mut received: Option<Vec<u8>> = None;
    for _ in 0..5 {
        junction.begin_cycle().unwrap();
        for id in junction.transfer().unwrap() {
            if id == reader_id {
                if let Some(bytes) = junction.channel(id).unwrap().transfer() {
                    if !bytes.is_empty() {
                        received = Some(bytes.to_vec());
                    }
                }
            }
        }
        junction.end_cycle().unwrap();
        if received.is_some() {
            break;
        }
    }

    assert_eq!(received.as_deref(), Some(&b"abcd"[..]));
    assert!(junction.contains(writer_id));
}

#[test]
fn scenario_2_listener_and_accept() {
    let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
    let mut listener = sockets_listener(addr, 8).unwrap();
    listener.acquire(Box::new(DescriptorArray::new(4))).unwrap();
    let bound = listener.endpoint().and_then(|e| e.as_socket_addr()).expect("listener must be bound");

    let mut junction = Junction::new(8).unwrap();
    let listener_id = junction.acquire(listener);

    // First cycle just installs the subscription; connect only afterwards
    // so the kernel has a listening socket to connect to.
    junction.begin_cycle().unwrap();
    junction.end_cycle().unwrap();

    let _client = TcpStream::connect(bound).expect("client connect");
    std::thread::sleep(Duration::from_millis(20));

    let fd = accept_one(&mut junction, listener_id, 10);
    assert!(fd >= 0);
    assert!(junction.contains(listener_id), "listener stays on the ring");

    // SAFETY: the accepted fd is ours to close; nothing else references it.
    unsafe {
        libc::close(fd);
    }
}

#[test]
fn scenario_3_eof_propagation() {
    let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
    let mut listener = sockets_listener(addr, 8).unwrap();
    listener.acquire(Box::new(DescriptorArray::new(4))).unwrap();
    let bound = listener.endpoint().and_then(|e| e.as_socket_addr()).expect("listener must be bound");

    let mut junction = Junction::new(8).unwrap();
    let listener_id = junction.acquire(listener);

    let client = TcpStream::connect(bound).expect("client connect");
    std::thread::sleep(Duration::from_millis(20));
    let accepted_fd = accept_one(&mut junction, listener_id, 10);

    let port = Port::new(accepted_fd, ResourceKind::Socket, Freight::Octets);
    port.latch(Polarity::Input);
    let mut reader = Channel::new(Polarity::Input, port, &OCTETS);
    reader.acquire(Box::new(OctetBuffer(vec![0u8; 4]))).unwrap();
    let reader_id = junction.acquire(reader);

    // The peer closes its end.
    drop(client);

    let mut terminated = false;
    for _ in 0..5 {
        junction.begin_cycle().unwrap();
        for id in junction.transfer().unwrap() {
            if id == reader_id && junction.channel(id).unwrap().terminated() {
                terminated = true;
            }
        }
        junction.end_cycle().unwrap();
        if terminated || !junction.contains(reader_id) {
            break;
        }
    }

    assert!(!junction.contains(reader_id), "terminated channel is removed from the ring");
}

#[test]
fn scenario_4_force_wake() {
    let mut junction = Junction::new(4).unwrap();
    let waker = junction.make_waker();

    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        waker.wake();
    });

    junction.begin_cycle().unwrap();
    let ids: Vec<ChannelId> = junction.transfer().unwrap().collect();
    junction.end_cycle().unwrap();

    assert!(ids.is_empty(), "nothing attached, transfer list must be empty");
    handle.join().unwrap();

    // Junction remains usable after a forced wake.
    junction.begin_cycle().unwrap();
    junction.end_cycle().unwrap();
}

#[test]
fn scenario_5_backpressure() {
    const READER_CHUNK: usize = 8 * 1024;

    let (mut reader, mut writer) = octets_spawn_unidirectional().unwrap();
    // A reader slower than the writer, so the pipe's kernel buffer fills and
    // the writer sees EAGAIN well before the payload is exhausted.
    reader.acquire(Box::new(OctetBuffer(vec![0u8; READER_CHUNK]))).unwrap();

    let payload = vec![0x61u8; 1024 * 1024];
    writer.acquire(Box::new(OctetBuffer(payload.clone()))).unwrap();

    let mut junction = Junction::new(8).unwrap();
    let reader_id = junction.acquire(reader);
    let writer_id = junction.acquire(writer);

    let mut total_sent = 0usize;
    let mut total_received = 0usize;
    for _ in 0..512 {
        junction.begin_cycle().unwrap();
        for id in junction.transfer().unwrap() {
            if id == writer_id {
                let moved = junction.channel(id).unwrap().sizeof_transfer();
                assert!(
                    moved > 0,
                    "writer was scheduled for transfer but moved zero bytes"
                );
                total_sent += moved;
            }
            if id == reader_id {
                if let Some(bytes) = junction.channel(id).unwrap().transfer() {
                    total_received += bytes.len();
                }
            }
        }
        junction.end_cycle().unwrap();
        if junction.contains(reader_id) {
            let _ = junction.acquire_resource(reader_id, Box::new(OctetBuffer(vec![0u8; READER_CHUNK])));
        }
        if total_received >= payload.len() {
            break;
        }
    }

    assert_eq!(total_sent, payload.len(), "the full payload is eventually written across cycles");
    assert_eq!(total_received, payload.len(), "the full payload is eventually read across cycles");
}

#[test]
fn scenario_6_void_after_fork() {
    let (mut reader, writer) = octets_spawn_unidirectional().unwrap();
    reader.acquire(Box::new(OctetBuffer(vec![0u8; 4]))).unwrap();
    let fd = reader.port().descriptor();
    let writer_fd = writer.port().descriptor();

    let mut junction = Junction::new(4).unwrap();
    junction.acquire(reader);

    // void() stands in for the child side of a simulated fork: no cycle
    // needs to actually run for the readiness object to be torn down.
    junction.void();

    assert_eq!(junction.len(), 0, "every member detached without delivering events");

    // SAFETY: checking the fd is still a valid descriptor (not closed),
    // then closing it ourselves since void() disclaimed but did not close it.
    let rc = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    assert!(rc >= 0, "void() must not close inherited descriptors");
    unsafe {
        libc::close(fd);
        libc::close(writer_fd);
    }
}

#[test]
fn scenario_7_datagram_round_trip() {
    let any_local: SocketAddr = ([127, 0, 0, 1], 0).into();
    let (mut recv_reader, recv_writer) = datagrams_udp(any_local).unwrap();
    let (sender_reader, mut sender_writer) = datagrams_udp(any_local).unwrap();

    recv_reader.acquire(Box::new(DatagramArray::new(4, 256))).unwrap();
    let recv_addr = recv_reader
        .endpoint()
        .and_then(|e| e.as_socket_addr())
        .expect("bound datagram socket has a local address");

    let mut outgoing = DatagramArray::new(1, 256);
    outgoing.set_outgoing(0, recv_addr, b"hello over udp".to_vec());
    sender_writer.acquire(Box::new(outgoing)).unwrap();

    let mut junction = Junction::new(8).unwrap();
    let recv_id = junction.acquire(recv_reader);
    let _sender_id = junction.acquire(sender_writer);

    let mut delivered: Option<Vec<u8>> = None;
    for _ in 0..10 {
        junction.begin_cycle().unwrap();
        for id in junction.transfer().unwrap() {
            if id == recv_id {
                if let Some(datagrams) = junction.channel(id).unwrap().resource_as::<DatagramArray>() {
                    if !datagrams.is_empty() {
                        let (_, payload) = datagrams.get(0);
                        if !payload.is_empty() {
                            delivered = Some(payload.to_vec());
                        }
                    }
                }
            }
        }
        junction.end_cycle().unwrap();
        if delivered.is_some() {
            break;
        }
    }

    assert_eq!(delivered.as_deref(), Some(&b"hello over udp"[..]));

    // Keep the other halves of both bound sockets alive for the duration of
    // the exchange; drop them explicitly here rather than leaking.
    drop(recv_writer);
    drop(sender_reader);
}
