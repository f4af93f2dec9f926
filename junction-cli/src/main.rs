// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::collections::HashMap;
use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use log::info;

use junction::alloc::{octets_spawn_unidirectional, sockets_listener};
use junction::transfer::{DescriptorArray, OctetBuffer, OCTETS};
use junction::{Channel, ChannelId, Freight, Junction, Polarity, Port, ResourceKind};

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Echoes a fixed line through an internal pipe, driven entirely by a
    /// Junction cycle loop.
    PipeEcho,
    /// Accepts TCP connections on `--port` and echoes each one back,
    /// demonstrating `sockets_listener` plus per-connection octet Channels.
    Echo {
        #[arg(long, default_value_t = 7)]
        port: u16,
    },
}

const READ_BUF: usize = 4096;
const ACCEPT_BATCH: usize = 8;

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Command::PipeEcho => pipe_echo(),
        Command::Echo { port } => tcp_echo(port),
    }
}

fn pipe_echo() {
    let (mut reader, mut writer) = octets_spawn_unidirectional().expect("pipe");
    reader.acquire(Box::new(OctetBuffer(vec![0u8; 64]))).unwrap();
    writer.acquire(Box::new(OctetBuffer(b"hello junction\n".to_vec()))).unwrap();

    let mut junction = Junction::new(16).expect("junction");
    let reader_id = junction.acquire(reader);
    let _writer_id = junction.acquire(writer);

    loop {
        junction.begin_cycle().expect("begin_cycle");
        let mut delivered = None;
        for id in junction.transfer().expect("transfer") {
            if id == reader_id {
                if let Some(bytes) = junction.channel(id).unwrap().transfer() {
                    if !bytes.is_empty() {
                        delivered = Some(String::from_utf8_lossy(bytes).into_owned());
                    }
                }
            }
        }
        junction.end_cycle().expect("end_cycle");

        if let Some(line) = delivered {
            info!("pipe-echo: received {line:?}");
            break;
        }
    }
}

/// A connected TCP echo session: its reader and writer Channel ids plus
/// whatever the reader last received and the writer hasn't yet sent.
struct Session {
    reader: ChannelId,
    writer: ChannelId,
    pending: Option<Vec<u8>>,
}

fn tcp_echo(port: u16) {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let mut listener = sockets_listener(addr, 16).expect("listener");
    listener.acquire(Box::new(DescriptorArray::new(ACCEPT_BATCH))).unwrap();

    let mut junction = Junction::new(64).expect("junction");
    let listener_id = junction.acquire(listener);

    let mut sessions: HashMap<ChannelId, Session> = HashMap::new();
    let mut writer_to_reader: HashMap<ChannelId, ChannelId> = HashMap::new();

    info!("junction-cli: echoing on {addr}");

    loop {
        junction.begin_cycle().expect("begin_cycle");
        let ready: Vec<ChannelId> = junction.transfer().expect("transfer").collect();

        for id in ready {
            if id == listener_id {
                accept_connections(&mut junction, listener_id, &mut sessions, &mut writer_to_reader);
            } else if let Some(&reader_id) = writer_to_reader.get(&id) {
                // A writer Channel finished flushing; nothing further to do
                // until its reader produces more bytes.
                let _ = reader_id;
            } else if let Some(session) = sessions.get_mut(&id) {
                if let Some(bytes) = junction.channel(id).unwrap().transfer() {
                    if !bytes.is_empty() {
                        session.pending = Some(bytes.to_vec());
                    }
                }
            }
        }

        for session in sessions.values_mut() {
            if let Some(bytes) = session.pending.take() {
                info!("junction-cli: echoing {} byte(s)", bytes.len());
                let _ = junction.acquire_resource(session.writer, Box::new(OctetBuffer(bytes)));
                let _ = junction.acquire_resource(session.reader, Box::new(OctetBuffer(vec![0u8; READ_BUF])));
            }
        }

        junction.end_cycle().expect("end_cycle");
    }
}

fn accept_connections(
    junction: &mut Junction,
    listener_id: ChannelId,
    sessions: &mut HashMap<ChannelId, Session>,
    writer_to_reader: &mut HashMap<ChannelId, ChannelId>,
) {
    let accepted: Vec<i32> = match junction.channel(listener_id).unwrap().transfer() {
        Some(bytes) => bytes
            .chunks_exact(std::mem::size_of::<i32>())
            .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
            .filter(|&fd| fd >= 0)
            .collect(),
        None => Vec::new(),
    };

    for fd in accepted {
        let port = Port::new(fd, ResourceKind::Socket, Freight::Octets);
        port.latch(Polarity::Input);
        port.latch(Polarity::Output);

        let mut reader = Channel::new(Polarity::Input, port.clone(), &OCTETS);
        reader.acquire(Box::new(OctetBuffer(vec![0u8; READ_BUF]))).unwrap();
        let writer = Channel::new(Polarity::Output, port, &OCTETS);

        let reader_id = junction.acquire(reader);
        let writer_id = junction.acquire(writer);

        writer_to_reader.insert(writer_id, reader_id);
        sessions.insert(
            reader_id,
            Session { reader: reader_id, writer: writer_id, pending: None },
        );
    }

    let _ = junction.acquire_resource(listener_id, Box::new(DescriptorArray::new(ACCEPT_BATCH)));
}
