// SPDX-License-Identifier: MPL-2.0

//! An id allocator implemented by the bitmap.
//!
//! The allocator always hands out the lowest free id, so an id that has
//! just been freed is the first candidate of the next allocation.

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

use core::fmt::Debug;

use bitvec::prelude::BitVec;

/// An id allocator implemented by the bitmap.
/// The true bit implies that the id is allocated, and vice versa.
#[derive(Clone)]
pub struct IdAlloc {
    bitset: BitVec<u8>,
    first_available_id: usize,
}

impl IdAlloc {
    /// Constructs a new id allocator with a maximum capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let bitset = BitVec::repeat(false, capacity);

        Self {
            bitset,
            first_available_id: 0,
        }
    }

    /// Allocates and returns a new `id`.
    ///
    /// If allocation is not possible, it returns `None`.
    pub fn alloc(&mut self) -> Option<usize> {
        if self.first_available_id >= self.bitset.len() {
            return None;
        }

        let id = self.first_available_id;
        self.bitset.set(id, true);
        self.first_available_id = self.next_free_from(id + 1);
        Some(id)
    }

    /// Releases the allocated `id`.
    ///
    /// # Panics
    ///
    /// If the `id` is out of bounds or has not been allocated, this method will panic.
    pub fn free(&mut self, id: usize) {
        assert!(id < self.bitset.len(), "id {} is out of bounds", id);
        assert!(self.bitset[id], "id {} has not been allocated", id);

        self.bitset.set(id, false);
        if id < self.first_available_id {
            self.first_available_id = id;
        }
    }

    /// Returns true if the `id` is allocated.
    ///
    /// # Panics
    ///
    /// If the `id` is out of bounds, this method will panic.
    pub fn is_allocated(&self, id: usize) -> bool {
        self.bitset[id]
    }

    /// Returns the number of ids that are currently allocated.
    pub fn allocated(&self) -> usize {
        self.bitset.count_ones()
    }

    /// Returns the maximum number of ids the allocator can hand out.
    pub fn capacity(&self) -> usize {
        self.bitset.len()
    }

    fn next_free_from(&self, start: usize) -> usize {
        if start >= self.bitset.len() {
            return self.bitset.len();
        }
        match self.bitset[start..].first_zero() {
            Some(offset) => start + offset,
            None => self.bitset.len(),
        }
    }
}

impl Debug for IdAlloc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdAlloc")
            .field("len", &self.bitset.len())
            .field("first_available_id", &self.first_available_id)
            .finish()
    }
}
