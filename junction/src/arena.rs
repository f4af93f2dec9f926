// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The Junction ring as a generational-index slab, chosen over an intrusive
//! raw-pointer linked list: the Junction owns the slab, Channels hand out
//! stable `(index, generation)` handles, and termination frees the slot and
//! bumps the generation so stale handles fail safely rather than dangle.

use std::sync::atomic::{AtomicU64, AtomicU8};
use std::sync::Arc;

use crate::channel::Channel;
use crate::error::ResourceError;

/// Process-unique tag stamped onto every [`ChannelId`] a Junction hands out,
/// so a handle minted by one Junction can be rejected by another rather than
/// silently aliasing whatever happens to live at the same slab index — a weak
/// handle back to the owning Junction rather than a strong owning reference,
/// checked on every slot access and surfaced as `ResourceError::CrossJunction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JunctionId(u64);

impl JunctionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        JunctionId(NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }
}

/// A stable handle to a Channel living in a [`crate::cycle::Junction`]'s
/// slab. Valid only against the Junction that produced it; using one against
/// a different Junction is a `ResourceError::CrossJunction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    junction: JunctionId,
    index: u32,
    generation: u32,
}

impl ChannelId {
    pub fn junction(self) -> JunctionId {
        self.junction
    }

    /// Packs the slab-local part of this handle into a `u64` suitable for a
    /// kevent `udata` field or an epoll `data.u64`. The `JunctionId` tag is
    /// deliberately left out: these bits only ever round-trip through a
    /// readiness backend owned by the very Junction that installed them, so
    /// re-attaching the tag on the way back in (`with_slot`) is always
    /// correct and saves 8 bytes of kernel-visible state.
    pub(crate) fn pack(self) -> u64 {
        (u64::from(self.index) << 32) | u64::from(self.generation)
    }

    pub(crate) fn with_slot(junction: JunctionId, bits: u64) -> Self {
        ChannelId {
            junction,
            index: (bits >> 32) as u32,
            generation: bits as u32,
        }
    }
}

struct Slot {
    generation: u32,
    occupied: bool,
    channel: Option<Channel>,
    prev: Option<ChannelId>,
    next: Option<ChannelId>,
    /// Whether this Channel is currently on the Junction's per-cycle transfer
    /// list: non-NULL only during a cycle, and set iff the Channel has an
    /// event to deliver. The ordering of the list itself is kept by the
    /// cycle engine as a `Vec` rather than as intrusive pointers on the slot;
    /// this flag is what lets the engine avoid double-enqueueing a Channel
    /// that readiness transform and delta flush both want to add.
    queued: bool,
    /// Published cross-thread without holding the exclusive access token: an
    /// atomic byte, set by any caller holding only a
    /// [`crate::channel::ChannelHandle`].
    delta: Arc<AtomicU8>,
}

/// Generational slab of Channels plus their intrusive ring/transfer-list
/// links. Ring order is insertion order behind the (implicit) Junction
/// sentinel: `head`/`tail` stand in for the Junction itself acting as the
/// sentinel node of its ring.
pub struct ChannelArena {
    junction: JunctionId,
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<ChannelId>,
    tail: Option<ChannelId>,
    len: usize,
}

impl ChannelArena {
    pub fn new(junction: JunctionId) -> Self {
        ChannelArena {
            junction,
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> Option<ChannelId> {
        self.head
    }

    pub fn tail(&self) -> Option<ChannelId> {
        self.tail
    }

    fn slot(&self, id: ChannelId) -> &Slot {
        assert_eq!(id.junction, self.junction, "ChannelId used against the wrong Junction");
        let slot = &self.slots[id.index as usize];
        assert_eq!(slot.generation, id.generation, "stale ChannelId used");
        slot
    }

    fn slot_mut(&mut self, id: ChannelId) -> &mut Slot {
        assert_eq!(id.junction, self.junction, "ChannelId used against the wrong Junction");
        let slot = &mut self.slots[id.index as usize];
        assert_eq!(slot.generation, id.generation, "stale ChannelId used");
        slot
    }

    /// Checks that `id` was minted by this arena's Junction, without
    /// touching the slot itself. The synchronous error path for a caller
    /// mixing up handles across two Junctions; a stale (already-removed)
    /// id from this same Junction is a distinct programmer error and still
    /// panics in `slot`/`slot_mut`.
    pub fn check_junction(&self, id: ChannelId) -> Result<(), ResourceError> {
        if id.junction == self.junction {
            Ok(())
        } else {
            Err(ResourceError::CrossJunction)
        }
    }

    /// Whether `id` still refers to a live slot (false once the generation
    /// has moved on past a termination).
    pub fn contains(&self, id: ChannelId) -> bool {
        if id.junction != self.junction {
            return false;
        }
        let slot = &self.slots[id.index as usize];
        slot.occupied && slot.generation == id.generation
    }

    pub fn get(&self, id: ChannelId) -> &Channel {
        self.slot(id).channel.as_ref().expect("occupied slot must hold a Channel")
    }

    pub fn get_mut(&mut self, id: ChannelId) -> &mut Channel {
        self.slot_mut(id).channel.as_mut().expect("occupied slot must hold a Channel")
    }

    pub fn delta_handle(&self, id: ChannelId) -> Arc<AtomicU8> {
        Arc::clone(&self.slot(id).delta)
    }

    /// ORs `bits` into `id`'s delta byte. Used by the exclusive-token holder
    /// (e.g. `Junction::acquire_resource`, `force_channel`, `terminate_channel`)
    /// as a same-thread shortcut for what a cross-thread caller would do via
    /// [`crate::channel::ChannelHandle`].
    pub fn publish_delta(&self, id: ChannelId, bits: u8) {
        self.slot(id).delta.fetch_or(bits, std::sync::atomic::Ordering::Release);
    }

    /// Atomically reads and clears `id`'s delta byte.
    pub fn take_delta(&self, id: ChannelId) -> u8 {
        self.slot(id).delta.swap(0, std::sync::atomic::Ordering::AcqRel)
    }

    /// Inserts `channel` behind the ring sentinel (at the tail), taking O(1).
    pub fn insert(&mut self, channel: Channel) -> ChannelId {
        let index = if let Some(index) = self.free.pop() {
            index
        } else {
            self.slots.push(Slot {
                generation: 0,
                occupied: false,
                channel: None,
                prev: None,
                next: None,
                queued: false,
                delta: Arc::new(AtomicU8::new(0)),
            });
            self.slots.len() as u32 - 1
        };

        let generation = self.slots[index as usize].generation;
        let id = ChannelId { junction: self.junction, index, generation };

        {
            let slot = &mut self.slots[index as usize];
            slot.occupied = true;
            slot.channel = Some(channel);
            slot.prev = self.tail;
            slot.next = None;
            slot.queued = false;
            slot.delta.store(0, std::sync::atomic::Ordering::Relaxed);
        }

        match self.tail {
            Some(tail) => self.slot_mut(tail).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;

        id
    }

    /// Splices `id` out of the ring and frees its slot, bumping the
    /// generation so any surviving handle fails the `contains()`/assert
    /// check rather than aliasing a reused slot.
    pub fn remove(&mut self, id: ChannelId) -> Channel {
        let (prev, next) = {
            let slot = self.slot(id);
            (slot.prev, slot.next)
        };

        match prev {
            Some(prev) => self.slot_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slot_mut(next).prev = prev,
            None => self.tail = prev,
        }

        let slot = &mut self.slots[id.index as usize];
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.prev = None;
        slot.next = None;
        slot.queued = false;
        self.len -= 1;

        slot.channel.take().expect("occupied slot must hold a Channel")
    }

    pub fn next(&self, id: ChannelId) -> Option<ChannelId> {
        self.slot(id).next
    }

    pub fn iter_ids(&self) -> Vec<ChannelId> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while let Some(id) = cur {
            out.push(id);
            cur = self.slot(id).next;
        }
        out
    }

    /// Whether `id` is currently on the Junction's per-cycle transfer list.
    pub fn is_queued(&self, id: ChannelId) -> bool {
        self.slot(id).queued
    }

    pub fn set_queued(&mut self, id: ChannelId, queued: bool) {
        self.slot_mut(id).queued = queued;
    }

    /// Reads the currently published cross-thread delta without consuming
    /// it, used by `end_cycle()`'s exhaustion check: a cycle may not end
    /// while a delta is pending merge.
    pub fn peek_delta(&self, id: ChannelId) -> u8 {
        self.slot(id).delta.load(std::sync::atomic::Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::port::{Freight, Port, Polarity, ResourceKind};
    use crate::transfer::OCTETS;

    fn dummy_channel() -> Channel {
        let port = Port::new(-1, ResourceKind::Pipe, Freight::Octets);
        Channel::new(Polarity::Input, port, &OCTETS)
    }

    #[test]
    fn insert_and_remove_maintains_ring_order() {
        let mut arena = ChannelArena::new(JunctionId::next());
        let a = arena.insert(dummy_channel());
        let b = arena.insert(dummy_channel());
        let c = arena.insert(dummy_channel());

        assert_eq!(arena.iter_ids(), vec![a, b, c]);

        arena.remove(b);
        assert_eq!(arena.iter_ids(), vec![a, c]);
        assert!(!arena.contains(b));
    }

    #[test]
    #[should_panic(expected = "stale ChannelId used")]
    fn reusing_a_stale_id_panics() {
        let mut arena = ChannelArena::new(JunctionId::next());
        let a = arena.insert(dummy_channel());
        arena.remove(a);
        let _ = arena.insert(dummy_channel());
        arena.get(a);
    }
}
