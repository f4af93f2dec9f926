// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The transfer iterator: a single-use iterator over Channels that produced
//! an event during the just-completed cycle.

use crate::arena::ChannelId;
use crate::cycle::Junction;

/// Yields the [`ChannelId`] of each Channel on the current cycle's transfer
/// list whose `events` word is non-zero. Produced by [`Junction::transfer`].
///
/// Borrows the Junction immutably for its whole lifetime, which is what
/// makes "using the iterator outside its originating cycle" a compile error
/// rather than a runtime one: [`Junction::end_cycle`] needs `&mut Junction`,
/// so the borrow checker refuses to let it run while any `TransferIterator`
/// from this cycle is still in scope.
pub struct TransferIterator<'a> {
    junction: &'a Junction,
    ids: &'a [ChannelId],
    cursor: usize,
}

impl<'a> TransferIterator<'a> {
    pub(crate) fn new(junction: &'a Junction, ids: &'a [ChannelId]) -> Self {
        TransferIterator { junction, ids, cursor: 0 }
    }
}

impl<'a> Iterator for TransferIterator<'a> {
    type Item = ChannelId;

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor < self.ids.len() {
            let id = self.ids[self.cursor];
            self.cursor += 1;
            let events = self
                .junction
                .channel(id)
                .expect("ids on a Junction's own transfer list always belong to it")
                .events_word();
            if events != 0 {
                return Some(id);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, Polarity};
    use crate::port::{Freight, Port, ResourceKind};
    use crate::transfer::{OctetBuffer, OCTETS};

    #[test]
    fn empty_cycle_yields_empty_iterator() {
        let mut junction = Junction::new(4).unwrap();
        junction.begin_cycle().unwrap();
        let ids: Vec<_> = junction.transfer().unwrap().collect();
        assert!(ids.is_empty());
        junction.end_cycle().unwrap();
    }

    #[test]
    fn transfer_outside_cycle_is_a_runtime_error() {
        let junction = Junction::new(4).unwrap();
        assert!(junction.transfer().is_err());
    }

    #[test]
    fn forced_channel_surfaces_in_the_iterator() {
        let mut fds = [0i32; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        let read_port = Port::new(fds[0], ResourceKind::Pipe, Freight::Octets);
        read_port.latch(Polarity::Input);
        let mut reader = Channel::new(Polarity::Input, read_port, &OCTETS);
        reader.acquire(Box::new(OctetBuffer(vec![0; 4]))).unwrap();

        let mut junction = Junction::new(4).unwrap();
        let id = junction.acquire(reader);

        // First cycle just installs the subscription.
        junction.begin_cycle().unwrap();
        junction.end_cycle().unwrap();

        junction.force_channel(id).unwrap();
        junction.begin_cycle().unwrap();
        let ids: Vec<_> = junction.transfer().unwrap().collect();
        assert!(ids.contains(&id));
        junction.end_cycle().unwrap();

        unsafe {
            libc::close(fds[1]);
        }
    }
}
