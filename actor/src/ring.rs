// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Ring buffer
//!
//! Fixed-capacity queue shared between the producers of a pipe and the single inbox that
//! drains it. Slots live in a circular array addressed by monotonically increasing `head` and
//! `tail` cursors; a full buffer refuses new values instead of overwriting the oldest one.
//!
//! Producers race for the slot lock: the first to take it wins, so offers from different
//! producers have no defined order, but the offers of one producer land in issue order.
//!

use parking_lot::Mutex;

/// Capacity used when none is given.
pub const DEFAULT_CAPACITY: usize = 32;

struct Slots<T> {
    buffer: Box<[Option<T>]>,
    /// Position of the next value to poll.
    head: u64,
    /// Position of the next free slot.
    tail: u64,
}

impl<T> Slots<T> {
    fn len(&self) -> usize {
        (self.tail - self.head) as usize
    }

    fn index(&self, position: u64) -> usize {
        (position % self.buffer.len() as u64) as usize
    }
}

/// Bounded multi-producer, single-consumer queue.
pub struct RingBuffer<T> {
    slots: Mutex<Slots<T>>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Creates a buffer holding at most `capacity` values.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        let buffer = (0..capacity).map(|_| None).collect::<Vec<_>>();
        Self {
            slots: Mutex::new(Slots {
                buffer: buffer.into_boxed_slice(),
                head: 0,
                tail: 0,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Inserts at the tail. A full buffer hands the value back untouched.
    pub fn offer(&self, value: T) -> Result<(), T> {
        let mut slots = self.slots.lock();
        if slots.len() == self.capacity {
            return Err(value);
        }
        let index = slots.index(slots.tail);
        slots.buffer[index] = Some(value);
        slots.tail += 1;
        Ok(())
    }

    /// Removes the head value.
    pub fn poll(&self) -> Option<T> {
        let mut slots = self.slots.lock();
        if slots.len() == 0 {
            return None;
        }
        let index = slots.index(slots.head);
        slots.head += 1;
        slots.buffer[index].take()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Drops every buffered value, returning how many were discarded.
    pub fn clear(&self) -> usize {
        let mut slots = self.slots.lock();
        let discarded = slots.len();
        while slots.head < slots.tail {
            let index = slots.index(slots.head);
            slots.buffer[index] = None;
            slots.head += 1;
        }
        discarded
    }
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
