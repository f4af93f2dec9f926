// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Error taxonomy for the junction engine.
//!
//! Kernel failures are never propagated through these types — they are
//! recorded on the owning [`crate::port::Port`] and surfaced as a terminate
//! event on the next cycle. Only protocol misuse (`RuntimeError`) and
//! resource conflicts (`ResourceError`) are ever returned synchronously.

use std::fmt;

/// Protocol misuse: nested cycles, using an iterator outside its cycle,
/// resizing mid-cycle, or acquiring a resource before the previous one
/// exhausted.
#[derive(Debug)]
pub enum RuntimeError {
    /// `begin_cycle()` was called while a cycle was already open on this Junction.
    NestedCycle,

    /// `resize_exoresource` was called while a cycle was in progress.
    MidCycleResize,

    /// `acquire()` was called on a Channel whose previous resource has not
    /// yet been exhausted.
    ResourceNotExhausted,

    /// `end_cycle()` or `transfer()` was called with no cycle open.
    NoActiveCycle,

    /// The readiness backend itself failed (`epoll_wait`/`kevent` returned an
    /// error unrelated to any individual Channel).
    Backend(std::io::Error),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NestedCycle => f.write_str("begin_cycle() called while a cycle is already open"),
            Self::MidCycleResize => f.write_str("resize_exoresource() called mid-cycle"),
            Self::ResourceNotExhausted => {
                f.write_str("acquire() called before the previous resource exhausted")
            }
            Self::NoActiveCycle => f.write_str("called with no cycle open"),
            Self::Backend(err) => write!(f, "readiness backend error: {err}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Resource conflicts: acquiring a Channel that belongs to a different
/// Junction, or acquiring a Channel that has already terminated.
#[derive(Debug)]
pub enum ResourceError {
    /// The Channel is already owned by a different Junction.
    CrossJunction,

    /// Replacing a buffer on a Channel before the previous one has been
    /// exhausted.
    NotExhausted,

    /// The Channel has already terminated and cannot be re-acquired into a
    /// Junction. `acquire_resource` on a terminated Channel that is not yet
    /// detached from its previous Junction is an error, not a silent no-op —
    /// only the detached-Channel path gets that leniency.
    Terminated,
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CrossJunction => "channel is already owned by a different junction",
            Self::NotExhausted => "previous resource has not been exhausted",
            Self::Terminated => "channel has already terminated",
        })
    }
}

impl std::error::Error for ResourceError {}

/// Top-level error type covering construction failures alongside the two
/// synchronous error classes: a plain enum, manual `Display`, a
/// `From<io::Error>` impl for the single-cause variant. Per-cycle kernel
/// failures never appear here — they are recorded on `Port` and surfaced as
/// terminate events.
#[derive(Debug)]
pub enum Error {
    /// A backend syscall failed outside of any one Channel's transfer path
    /// — e.g. `kqueue(2)`/`epoll_create1(2)` itself during construction.
    Io(std::io::Error),
    Runtime(RuntimeError),
    Resource(ResourceError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Runtime(e) => write!(f, "runtime error: {e}"),
            Self::Resource(e) => write!(f, "resource error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<RuntimeError> for Error {
    fn from(e: RuntimeError) -> Self {
        Error::Runtime(e)
    }
}

impl From<ResourceError> for Error {
    fn from(e: ResourceError) -> Self {
        Error::Resource(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_non_empty() {
        assert!(!RuntimeError::NestedCycle.to_string().is_empty());
        assert!(!ResourceError::CrossJunction.to_string().is_empty());
    }
}
