// Copyright (c) 2024 The Ruby Link Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! C4: bounded packet queues between the RX engine and the router.
//!
//! `Semaphore` is a counting, blocking semaphore in the shape of the
//! teacher's `synch::semaphore::Semaphore`, reimplemented on
//! `std::sync::{Mutex, Condvar}` instead of a scheduler-integrated wait
//! queue. `PacketQueue` pairs one with a bounded ring buffer to give the RX
//! engine a drop-when-full high-priority queue and a drop-when-full regular
//! queue, per `SPEC_FULL.md` §4.4.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::packet::Packet;

/// Default capacity of the high-priority queue (pings, control, retransmit
/// requests).
pub const DEFAULT_HIGH_PRIORITY_CAPACITY: usize = 150;
/// Default capacity of the regular queue (video, telemetry, data).
pub const DEFAULT_REGULAR_CAPACITY: usize = 500;

struct SemaphoreState {
    count: isize,
}

/// A counting, blocking semaphore. See `synch::semaphore::Semaphore` in the
/// teacher's kernel for the originating interface; `acquire`/`try_acquire`/
/// `release` keep the same names and meaning here.
pub struct Semaphore {
    state: Mutex<SemaphoreState>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new(count: isize) -> Self {
        Self {
            state: Mutex::new(SemaphoreState { count }),
            condvar: Condvar::new(),
        }
    }

    /// Blocks until a resource is available or `timeout` elapses. Returns
    /// `false` on timeout, matching the teacher's `acquire(time)` contract.
    pub fn acquire(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock().unwrap();
        let deadline = timeout.map(|d| Instant::now() + d);

        loop {
            if state.count > 0 {
                state.count -= 1;
                return true;
            }
            match deadline {
                None => state = self.condvar.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (next, timed_out) = self
                        .condvar
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = next;
                    if timed_out.timed_out() && state.count <= 0 {
                        return false;
                    }
                }
            }
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.count > 0 {
            state.count -= 1;
            true
        } else {
            false
        }
    }

    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.count += 1;
        drop(state);
        self.condvar.notify_one();
    }
}

/// A bounded FIFO of decoded packets, gated by a [`Semaphore`] counting the
/// number of entries currently queued. Pushing past capacity drops the
/// oldest entry rather than blocking the RX worker: a stalled consumer must
/// never back-pressure packet capture.
pub struct PacketQueue {
    capacity: usize,
    items: Mutex<VecDeque<Packet>>,
    available: Semaphore,
    dropped: std::sync::atomic::AtomicU64,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Semaphore::new(0),
            dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Pushes `packet`, dropping the oldest queued entry if the queue is at
    /// capacity. Returns `true` if an entry had to be dropped to make room.
    pub fn push(&self, packet: Packet) -> bool {
        let mut items = self.items.lock().unwrap();
        let dropped = if items.len() >= self.capacity {
            items.pop_front();
            self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            // The queue did not grow, so the semaphore count must not either.
            true
        } else {
            false
        };
        items.push_back(packet);
        drop(items);
        if !dropped {
            self.available.release();
        }
        dropped
    }

    /// Blocks up to `timeout` for a packet to become available.
    pub fn pop(&self, timeout: Duration) -> Option<Packet> {
        if !self.available.acquire(Some(timeout)) {
            return None;
        }
        self.items.lock().unwrap().pop_front()
    }

    pub fn try_pop(&self) -> Option<Packet> {
        if !self.available.try_acquire() {
            return None;
        }
        self.items.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// The two priority lanes the RX engine dispatches decoded packets into,
/// per `SPEC_FULL.md` §4.4: high-priority packets (pings, control,
/// retransmit requests) always drain before regular traffic.
pub struct RxQueues {
    pub high_priority: PacketQueue,
    pub regular: PacketQueue,
}

impl Default for RxQueues {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_PRIORITY_CAPACITY, DEFAULT_REGULAR_CAPACITY)
    }
}

impl RxQueues {
    pub fn new(high_priority_capacity: usize, regular_capacity: usize) -> Self {
        Self {
            high_priority: PacketQueue::new(high_priority_capacity),
            regular: PacketQueue::new(regular_capacity),
        }
    }

    /// Pops the next packet to deliver, always preferring the high-priority
    /// lane when both have entries ready.
    pub fn pop_next(&self, timeout: Duration) -> Option<Packet> {
        if let Some(packet) = self.high_priority.try_pop() {
            return Some(packet);
        }
        if let Some(packet) = self.regular.try_pop() {
            return Some(packet);
        }
        // Nothing ready on either lane: wait on whichever wakes first by
        // polling the high-priority lane with the full timeout budget, then
        // giving the regular lane a last non-blocking check.
        if let Some(packet) = self.high_priority.pop(timeout) {
            return Some(packet);
        }
        self.regular.try_pop()
    }
}
