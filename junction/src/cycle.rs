// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The Junction: owner of the readiness backend and the ring of attached
//! Channels, and home of the cycle engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::arena::{ChannelArena, ChannelId, JunctionId};
use crate::backend::{self, Backend, Interest, Waker};
use crate::channel::{self, Channel, ChannelHandle, Polarity};
use crate::error::{Error, ResourceError, RuntimeError};
use crate::iter::TransferIterator;
use crate::transfer::Resource;

/// Event-driven I/O multiplexing engine owning a readiness facility (kqueue
/// or epoll) and a ring of attached Channels.
pub struct Junction {
    id: JunctionId,
    arena: ChannelArena,
    backend: Box<dyn Backend>,
    waiting: Arc<AtomicBool>,
    events: Vec<backend::ReadinessEvent>,
    /// Channels with an event to deliver this cycle, in the order they were
    /// enqueued. Stands in for an intrusive `next_transfer` singly-linked
    /// list: a Channel is on this list iff it has an event to deliver.
    transfer_list: Vec<ChannelId>,
    cycle_open: bool,
    terminating: bool,
    /// PID at backend-construction time, used by the Start phase to detect
    /// a fork the cheap way real event-loop libraries do: compare the
    /// current PID against the one recorded at creation, and rebuild the
    /// readiness backend if they differ.
    created_pid: libc::pid_t,
}

impl Junction {
    /// Creates a Junction with a freshly built readiness backend sized for
    /// `max_events` readiness events per `collect()` call.
    pub fn new(max_events: usize) -> Result<Self, Error> {
        let mut backend = backend::new_backend()?;
        backend.set_capacity(max_events.max(1));
        let id = JunctionId::next();

        Ok(Junction {
            id,
            arena: ChannelArena::new(id),
            backend,
            waiting: Arc::new(AtomicBool::new(false)),
            events: Vec::with_capacity(max_events.max(1)),
            transfer_list: Vec::new(),
            cycle_open: false,
            terminating: false,
            created_pid: unsafe { libc::getpid() },
        })
    }

    pub fn id(&self) -> JunctionId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// `Junction.acquire(channel)`: inserts `channel` behind the ring
    /// sentinel, marks it attached (sets the `connect` control flag), and
    /// returns a stable [`ChannelId`] handle.
    pub fn acquire(&mut self, mut channel: Channel) -> ChannelId {
        channel.set_attached();
        let id = self.arena.insert(channel);
        // Get the freshly attached Channel onto the next flush's transfer
        // list so its `connect` flag gets processed even though it has no
        // transfer/terminate delta of its own yet.
        self.arena.publish_delta(id, channel::DELTA_CONNECT);
        id
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.arena.contains(id)
    }

    pub fn channel(&self, id: ChannelId) -> Result<&Channel, ResourceError> {
        self.arena.check_junction(id)?;
        Ok(self.arena.get(id))
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> Result<&mut Channel, ResourceError> {
        self.arena.check_junction(id)?;
        Ok(self.arena.get_mut(id))
    }

    /// A cheaply cloneable, `Send + Sync` capability for publishing delta
    /// bits on `id` from any thread without the exclusive access token.
    pub fn channel_handle(&self, id: ChannelId) -> Result<ChannelHandle, ResourceError> {
        self.arena.check_junction(id)?;
        Ok(ChannelHandle::new(self.arena.delta_handle(id)))
    }

    /// Base Channel op `acquire(resource)`, realized for an already-attached
    /// Channel: an attached Channel has no direct route to the arena-level
    /// delta byte, so the Junction performs the assignment and publishes the
    /// transfer delta on its behalf.
    pub fn acquire_resource(
        &mut self,
        id: ChannelId,
        resource: Box<dyn Resource>,
    ) -> Result<(), ResourceError> {
        self.arena.check_junction(id)?;
        let channel = self.arena.get_mut(id);

        if channel.terminated() {
            // Unlike the freestanding `Channel::acquire()`, this Channel is
            // still attached to this Junction's ring and hasn't yet been
            // removed by `end_cycle`'s termination commit — re-acquiring
            // onto it is a caller error, not a no-op.
            return Err(ResourceError::Terminated);
        }
        if channel.internal_transfer() && !channel.exhausted() {
            return Err(ResourceError::NotExhausted);
        }

        channel.set_resource(resource);
        self.arena.publish_delta(id, channel::DELTA_TRANSFER);
        Ok(())
    }

    /// Base Channel op `terminate()` for an attached Channel: publishes the
    /// terminate delta so the next flush merges it and enqueues the Channel.
    pub fn terminate_channel(&mut self, id: ChannelId) -> Result<(), ResourceError> {
        self.arena.check_junction(id)?;
        self.arena.publish_delta(id, channel::DELTA_TERMINATE);
        Ok(())
    }

    /// Base Channel op `force()` for an attached Channel.
    pub fn force_channel(&mut self, id: ChannelId) -> Result<(), ResourceError> {
        self.arena.check_junction(id)?;
        self.arena.publish_delta(id, channel::DELTA_FORCE);
        Ok(())
    }

    /// `Junction.force()`: writes the backend's self-wakeup token. Returns
    /// whether the Junction was observed blocked in `collect()` at the
    /// moment of the call.
    pub fn force(&self) -> bool {
        let waker = self.make_waker();
        waker.wake()
    }

    /// Builds a [`Waker`] bound to this Junction's current backend, usable
    /// from any thread to unblock a concurrent `begin_cycle()`.
    pub fn make_waker(&self) -> Waker {
        self.backend.make_waker(Arc::clone(&self.waiting))
    }

    /// Schedules termination of every attached Channel: the next
    /// `begin_cycle()` Start phase publishes a terminate delta on each ring
    /// member.
    pub fn terminate(&mut self) {
        self.terminating = true;
    }

    /// `Junction.resize_exoresource(max_events)`: resizes the per-`collect()`
    /// readiness event buffer. Forbidden mid-cycle.
    pub fn resize_exoresource(&mut self, max_events: usize) -> Result<(), RuntimeError> {
        if self.cycle_open {
            return Err(RuntimeError::MidCycleResize);
        }
        self.backend.set_capacity(max_events.max(1));
        self.events = Vec::with_capacity(max_events.max(1));
        Ok(())
    }

    /// `void()`: destructive, event-less teardown used by a forked child to
    /// disclaim the parent's kernel resources without closing them.
    pub fn void(&mut self) {
        debug!("junction {:?}: void() — disclaiming {} channel(s)", self.id, self.arena.len());

        for id in self.arena.iter_ids() {
            let channel = self.arena.get_mut(id);
            channel.release_resource();
            channel.release_link();
            channel.port().leak_voided();
        }
        while let Some(id) = self.arena.head() {
            self.arena.remove(id);
        }

        self.transfer_list.clear();
        self.cycle_open = false;
        self.terminating = false;

        match self.backend.reinitialize_after_fork() {
            Ok(()) => {
                self.backend.set_capacity(self.events.capacity().max(1));
                self.waiting = Arc::new(AtomicBool::new(false));
                self.created_pid = unsafe { libc::getpid() };
            }
            Err(err) => warn!("junction {:?}: failed to rebuild backend after void(): {err}", self.id),
        }
    }

    fn reinitialize_backend(&mut self) {
        warn!("junction {:?}: pid changed since backend creation, rebuilding (fork detected)", self.id);
        match self.backend.reinitialize_after_fork() {
            Ok(()) => {
                self.backend.set_capacity(self.events.capacity().max(1));
                self.waiting = Arc::new(AtomicBool::new(false));
                self.created_pid = unsafe { libc::getpid() };
                for id in self.arena.iter_ids() {
                    self.arena.get_mut(id).request_reconnect();
                    self.arena.publish_delta(id, channel::DELTA_CONNECT);
                }
            }
            Err(err) => warn!("junction {:?}: failed to rebuild backend: {err}", self.id),
        }
    }

    /// Drains per-change kernel failures the backend collected since the
    /// last call (only kqueue's `EV_RECEIPT` batching ever produces any) and
    /// terminates each originating Channel immediately — the same outcome a
    /// failed `install()` already gets in step 5, rather than letting a
    /// single bad change abort the whole cycle with a `RuntimeError`
    /// (spec.md §7 class 1 errors never propagate out of the cycle as a
    /// `Result`). Self-contained rather than just re-queuing: this can run
    /// after step 9's own termination handling has already passed over the
    /// transfer list for this cycle, so nothing else is left to pick these
    /// back up before `end_cycle()`.
    fn apply_change_errors(&mut self) {
        for (user_data, errno) in self.backend.take_change_errors() {
            let id = ChannelId::with_slot(self.id, user_data);
            if !self.arena.contains(id) {
                continue;
            }
            let channel = self.arena.get_mut(id);
            channel.record_kernel_error(crate::port::LastCall::Subscribe, errno);
            channel.set_x_terminate();

            if !channel.requeue() {
                let fd = channel.port().descriptor();
                if fd >= 0 {
                    let _ = self.backend.remove(fd, id.pack());
                }
            }
            channel.set_tev_terminate();

            if !self.arena.is_queued(id) {
                self.arena.set_queued(id, true);
                self.transfer_list.push(id);
            }
        }
    }

    fn interest_for(polarity: Polarity) -> Interest {
        match polarity {
            Polarity::Input => Interest::READABLE,
            Polarity::Output => Interest::WRITABLE,
        }
    }

    /// Runs one full cycle: delta flush, subscription install, readiness
    /// collection, event transform, and transfer dispatch. Must be paired
    /// with [`Junction::end_cycle`]; nesting is a `RuntimeError`.
    pub fn begin_cycle(&mut self) -> Result<(), RuntimeError> {
        if self.cycle_open {
            return Err(RuntimeError::NestedCycle);
        }
        self.cycle_open = true;
        self.transfer_list.clear();

        // --- Step 1: Start ---
        if unsafe { libc::getpid() } != self.created_pid {
            self.reinitialize_backend();
        }
        if self.terminating {
            for id in self.arena.iter_ids() {
                self.arena.publish_delta(id, channel::DELTA_TERMINATE);
            }
        }

        // --- Step 2: delta flush ---
        // The ring isn't kept in modified-recency order, so rather than
        // relying on "stop at the first clean Channel" we scan every member
        // each cycle; this preserves the flush's correctness (every dirty
        // Channel is always found) at the cost of an early-exit optimization
        // an ordered list would allow.
        for id in self.arena.iter_ids() {
            let delta = self.arena.take_delta(id);
            if delta == 0 {
                continue;
            }
            let channel = self.arena.get_mut(id);
            if delta & channel::DELTA_TRANSFER != 0 {
                channel.merge_transfer_delta();
            }
            if delta & channel::DELTA_TERMINATE != 0 {
                channel.merge_terminate_delta();
            }
            if delta & channel::DELTA_FORCE != 0 {
                channel.request_force();
            }
            if !self.arena.is_queued(id) {
                self.arena.set_queued(id, true);
                self.transfer_list.push(id);
            }
        }

        // --- Step 3: decide wait ---
        let pending_subscriptions = self
            .transfer_list
            .iter()
            .any(|&id| self.arena.get(id).control_connect());
        let will_wait = self.transfer_list.is_empty() && !pending_subscriptions;

        // --- Step 4: release exclusive access ---
        // Modeled implicitly: nothing below this point mutates ring
        // pointers, preserving the phase discipline that ring membership is
        // only ever touched under exclusive access.

        // --- Step 5: apply deltas to the readiness layer ---
        let mut i = 0;
        while i < self.transfer_list.len() {
            let id = self.transfer_list[i];
            let channel = self.arena.get_mut(id);

            if channel.control_connect() {
                if !channel.port().is_valid() {
                    channel.set_x_terminate();
                } else if !channel.requeue() {
                    let fd = channel.port().descriptor();
                    let interest = Self::interest_for(channel.polarity());
                    if let Err(err) = self.backend.install(fd, interest, id.pack()) {
                        warn!("junction {:?}: backend install failed for fd {fd}: {err}", self.id);
                        self.arena.get_mut(id).set_x_terminate();
                    }
                }
                self.arena.get_mut(id).clear_connect();
            }

            let channel = self.arena.get_mut(id);
            if channel.control_force() {
                channel.clear_force_control();
                channel.apply_force();
            }

            let channel = self.arena.get(id);
            if channel.should_terminate() || channel.transfer_ready() {
                i += 1;
            } else {
                self.arena.set_queued(id, false);
                self.transfer_list.swap_remove(i);
            }
        }

        // --- Step 6: collect readiness ---
        self.events.clear();
        self.waiting.store(will_wait, Ordering::Release);
        let timeout_ms = if will_wait { None } else { Some(0) };
        let collect_result = self.backend.collect(timeout_ms, &mut self.events);
        self.waiting.store(false, Ordering::Release);
        collect_result.map_err(RuntimeError::Backend)?;
        self.apply_change_errors();

        // --- Step 7: transform readiness ---
        for event in std::mem::take(&mut self.events) {
            let id = ChannelId::with_slot(self.id, event.user_data);
            if !self.arena.contains(id) {
                continue;
            }

            let polarity = self.arena.get(id).polarity();
            let channel = self.arena.get_mut(id);

            if event.error {
                channel.set_x_terminate();
            } else if event.hup {
                match polarity {
                    Polarity::Output => channel.set_x_terminate(),
                    // Input-side EOF/HUP is deferred: set X.transfer so the
                    // transfer phase still runs and delivers any bytes
                    // still buffered in the kernel before EOF is observed.
                    Polarity::Input => channel.set_x_transfer(),
                }
            } else if event.readable || event.writable {
                channel.set_x_transfer();
            }

            if !self.arena.is_queued(id) {
                self.arena.set_queued(id, true);
                self.transfer_list.push(id);
            }
        }

        // --- Step 8: possible continuation ---
        // Handled inside the backend's own `collect()` (kqueue re-collects
        // up to 3 times on a full buffer; epoll's writer epoll and wake
        // eventfd are both nested into the reader epoll, so one blocking
        // wait on the reader already observes both).

        // --- Step 9: run transfers ---
        for &id in &self.transfer_list {
            let channel = self.arena.get_mut(id);

            if channel.should_terminate() {
                if !channel.requeue() {
                    let fd = channel.port().descriptor();
                    if fd >= 0 {
                        let _ = self.backend.remove(fd, id.pack());
                    }
                }
                channel.set_tev_terminate();
                continue;
            }

            if channel.transfer_ready() {
                match channel.run_transfer() {
                    crate::transfer::TransferOutcome::Flow(moved) => {
                        if moved > 0 {
                            channel.set_tev_transfer();
                        }
                        channel.clear_i_transfer();
                    }
                    crate::transfer::TransferOutcome::Stop(moved) => {
                        if moved > 0 {
                            channel.set_tev_transfer();
                        }
                        channel.clear_x_transfer();
                    }
                    crate::transfer::TransferOutcome::Terminate(errno) => {
                        channel.record_kernel_error(crate::port::LastCall::Read, errno);
                        channel.set_x_terminate();
                        channel.set_tev_terminate();
                        if !channel.requeue() {
                            let fd = channel.port().descriptor();
                            if fd >= 0 {
                                let _ = self.backend.remove(fd, id.pack());
                            }
                        }
                    }
                }
            }
        }

        // --- Step 10: flush remaining changes ---
        if !self.terminating {
            if let Err(err) = self.backend.flush_changes() {
                warn!("junction {:?}: failed to flush readiness changes: {err}", self.id);
            }
            self.apply_change_errors();
        }

        Ok(())
    }

    /// Produces an iterator over Channels with an event to deliver this
    /// cycle. Borrowing `&self` for the iterator's lifetime means the borrow
    /// checker itself enforces "using the iterator outside its originating
    /// cycle is a RuntimeError" — the compiler refuses to let `end_cycle()`
    /// (which needs `&mut self`) run while the iterator is still alive, so a
    /// runtime check for this case is never needed in the first place.
    pub fn transfer(&self) -> Result<TransferIterator<'_>, RuntimeError> {
        if !self.cycle_open {
            return Err(RuntimeError::NoActiveCycle);
        }
        Ok(TransferIterator::new(self, &self.transfer_list))
    }

    /// Drains the just-completed cycle: collapses windows, commits
    /// terminations, releases exhausted resources, and clears per-cycle
    /// event state.
    pub fn end_cycle(&mut self) -> Result<(), RuntimeError> {
        if !self.cycle_open {
            return Err(RuntimeError::NoActiveCycle);
        }

        for id in std::mem::take(&mut self.transfer_list) {
            let channel = self.arena.get_mut(id);
            channel.collapse_window();

            if channel.tev_terminate() {
                channel.commit_terminate();
                channel.clear_events();
                self.arena.set_queued(id, false);
                trace!("junction {:?}: channel {:?} terminated, removed from ring", self.id, id);
                self.arena.remove(id);
                continue;
            }

            if !channel.internal_transfer() {
                let pending = self.arena.peek_delta(id) & channel::DELTA_TRANSFER != 0;
                if !pending {
                    channel.release_resource();
                }
            }

            channel.clear_events();
            self.arena.set_queued(id, false);
        }

        self.cycle_open = false;
        Ok(())
    }

    pub fn is_cycle_open(&self) -> bool {
        self.cycle_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{Freight, Port, ResourceKind};
    use crate::transfer::{OctetBuffer, OCTETS};

    fn pipe_pair() -> (Port, Port, i32, i32) {
        let mut fds = [0i32; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        let read_port = Port::new(fds[0], ResourceKind::Pipe, Freight::Octets);
        let write_port = Port::new(fds[1], ResourceKind::Pipe, Freight::Octets);
        read_port.latch(Polarity::Input);
        write_port.latch(Polarity::Output);
        (read_port, write_port, fds[0], fds[1])
    }

    #[test]
    fn pipe_echo_delivers_bytes_in_order() {
        let (read_port, write_port, _, _) = pipe_pair();
        let mut junction = Junction::new(8).unwrap();

        let mut reader = Channel::new(Polarity::Input, read_port, &OCTETS);
        reader.acquire(Box::new(OctetBuffer(vec![0; 4]))).unwrap();
        let reader_id = junction.acquire(reader);

        let mut writer = Channel::new(Polarity::Output, write_port, &OCTETS);
        writer.acquire(Box::new(OctetBuffer(b"abcd".to_vec()))).unwrap();
        let writer_id = junction.acquire(writer);

        // First cycle installs subscriptions; on Linux the writer is
        // immediately writable so the write may already land this cycle,
        // but allow up to a few cycles for both sides to complete.
        let mut reader_bytes: Option<Vec<u8>> = None;
        for _ in 0..5 {
            junction.begin_cycle().unwrap();
            {
                let iter = junction.transfer().unwrap();
                for id in iter {
                    if id == reader_id {
                        if let Some(bytes) = junction.channel(id).unwrap().transfer() {
                            if !bytes.is_empty() {
                                reader_bytes = Some(bytes.to_vec());
                            }
                        }
                    }
                }
            }
            junction.end_cycle().unwrap();
            if reader_bytes.is_some() {
                break;
            }
        }

        assert_eq!(reader_bytes.as_deref(), Some(&b"abcd"[..]));
        let _ = writer_id;
    }

    #[test]
    fn nested_cycle_is_a_runtime_error() {
        let mut junction = Junction::new(4).unwrap();
        junction.begin_cycle().unwrap();
        let err = junction.begin_cycle();
        assert!(matches!(err, Err(RuntimeError::NestedCycle)));
        junction.end_cycle().unwrap();
    }

    #[test]
    fn end_cycle_without_begin_is_a_runtime_error() {
        let mut junction = Junction::new(4).unwrap();
        assert!(matches!(junction.end_cycle(), Err(RuntimeError::NoActiveCycle)));
    }

    #[test]
    fn after_cycle_events_and_transfer_list_are_clear() {
        let (read_port, _write_port, _, _) = pipe_pair();
        let mut junction = Junction::new(4).unwrap();
        let mut reader = Channel::new(Polarity::Input, read_port, &OCTETS);
        reader.acquire(Box::new(OctetBuffer(vec![0; 4]))).unwrap();
        let id = junction.acquire(reader);

        junction.begin_cycle().unwrap();
        junction.end_cycle().unwrap();

        assert_eq!(junction.channel(id).unwrap().events_word(), 0);
    }

    #[test]
    fn force_returns_without_blocking() {
        let mut junction = Junction::new(4).unwrap();
        // Nothing attached: force() must still return promptly and report
        // whether the (non-existent) wait was interrupted usefully.
        let _ = junction.force();
    }

    #[test]
    fn void_detaches_every_member_without_closing_descriptors() {
        let (read_port, _write_port, read_fd, _write_fd) = pipe_pair();
        let mut junction = Junction::new(4).unwrap();
        let reader = Channel::new(Polarity::Input, read_port, &OCTETS);
        junction.acquire(reader);

        junction.void();

        assert_eq!(junction.len(), 0);
        // The descriptor must still be valid (not closed) since void()
        // disclaims ownership rather than tearing resources down.
        let rc = unsafe { libc::fcntl(read_fd, libc::F_GETFD) };
        assert!(rc >= 0, "void() must not close inherited descriptors");
        unsafe { libc::close(read_fd) };
    }
}
