// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Symbolic name and human description for errno values, enumerated from the
//! host's POSIX errno table. Unknown errnos are reported by numeric value
//! with an "unrecognized" description; the engine never treats an unknown
//! errno as fatal to the whole process, only to the Channel that raised it.

/// Returns the symbolic name of `errno` (e.g. `"EAGAIN"`), or `None` if this
/// build doesn't recognize the value.
pub fn name(errno: i32) -> Option<&'static str> {
    Some(match errno {
        libc::EAGAIN => "EAGAIN",
        libc::EINTR => "EINTR",
        libc::EBADF => "EBADF",
        libc::EFAULT => "EFAULT",
        libc::EINVAL => "EINVAL",
        libc::ECONNRESET => "ECONNRESET",
        libc::ECONNREFUSED => "ECONNREFUSED",
        libc::ECONNABORTED => "ECONNABORTED",
        libc::ENOTCONN => "ENOTCONN",
        libc::EPIPE => "EPIPE",
        libc::ENOMEM => "ENOMEM",
        libc::EMFILE => "EMFILE",
        libc::ENFILE => "ENFILE",
        libc::ENOBUFS => "ENOBUFS",
        libc::ETIMEDOUT => "ETIMEDOUT",
        libc::ENOSPC => "ENOSPC",
        libc::EACCES => "EACCES",
        libc::EPERM => "EPERM",
        libc::EADDRINUSE => "EADDRINUSE",
        libc::EADDRNOTAVAIL => "EADDRNOTAVAIL",
        libc::ENETDOWN => "ENETDOWN",
        libc::ENETUNREACH => "ENETUNREACH",
        libc::EHOSTUNREACH => "EHOSTUNREACH",
        0 => "OK",
        _ => return None,
    })
}

/// Returns a short human description of `errno`, falling back to an
/// "unrecognized errno <n>" message.
pub fn describe(errno: i32) -> String {
    match name(errno) {
        Some("OK") => "success".to_string(),
        Some(sym) => format!("{sym}: {}", std::io::Error::from_raw_os_error(errno)),
        None => format!("unrecognized errno {errno}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_errno_has_symbolic_name() {
        assert_eq!(name(libc::EAGAIN), Some("EAGAIN"));
        assert!(describe(libc::EAGAIN).starts_with("EAGAIN"));
    }

    #[test]
    fn unknown_errno_is_reported_numerically() {
        assert_eq!(name(i32::MAX), None);
        assert!(describe(i32::MAX).contains("unrecognized"));
    }

    #[test]
    fn zero_is_success() {
        assert_eq!(describe(0), "success");
    }
}
