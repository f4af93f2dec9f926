// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A cooperative-scheduler event-multiplexing engine, wrapping `kqueue(2)`
//! on BSD/Darwin and `epoll(2)` on Linux behind one non-blocking,
//! zero-copy Channel abstraction.
//!
//! Callers drive a [`cycle::Junction`] through a fixed per-cycle contract:
//! `begin_cycle()`, then [`cycle::Junction::transfer`] to find which
//! Channels produced an event, then `end_cycle()`.

pub mod alloc;
pub mod arena;
pub mod backend;
pub mod channel;
pub mod cycle;
pub mod errno;
pub mod error;
pub mod iter;
pub mod port;
pub mod transfer;

pub use arena::{ChannelArena, ChannelId, JunctionId};
pub use channel::{Channel, ChannelHandle, Endpoint, Polarity};
pub use cycle::Junction;
pub use error::{Error, ResourceError, RuntimeError};
pub use port::{Freight, LastCall, Port, ResourceKind};
