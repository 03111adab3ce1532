// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Bounded identifier allocation.
//!
//! Packet identifiers and subscription identifiers are both small integers
//! drawn from a fixed inclusive range. An identifier is held from the moment
//! an exchange is sent until its acknowledgement has been processed, and may
//! be handed out again after release.

const WORD_BITS: u32 = u64::BITS;

/// Allocates the lowest free identifier of an inclusive range `[min, max]`.
///
/// Held identifiers are tracked in a two-level bitset. The leaf level keeps one
/// bit per identifier, the summary level one bit per leaf word that still has a
/// free bit. Leaf words are only materialised up to the highest identifier ever
/// held at once, so a large nominal range (e.g. subscription identifiers up to
/// 268,435,455) costs memory proportional to the live window, not to the range.
///
/// # Examples
///
/// ```
/// use mqtt_session_tokio::mqtt_cs::id_allocator::IdAllocator;
///
/// let mut ids = IdAllocator::new(1, 3);
/// assert_eq!(ids.acquire(), Some(1));
/// assert_eq!(ids.acquire(), Some(2));
/// ids.release(1);
/// assert_eq!(ids.acquire(), Some(1));
/// assert_eq!(ids.acquire(), Some(3));
/// assert_eq!(ids.acquire(), None);
/// ```
#[derive(Debug, Clone)]
pub struct IdAllocator {
    min: u32,
    capacity: u32,
    /// One bit per identifier offset, set while held.
    held: Vec<u64>,
    /// One bit per `held` word, set while that word has at least one clear bit.
    vacant: Vec<u64>,
    count: u32,
}

impl IdAllocator {
    /// Create an allocator for `[min, max]`. An inverted range (`max < min`)
    /// yields an allocator that never hands out an identifier.
    pub fn new(min: u32, max: u32) -> Self {
        let capacity = if max >= min { max - min + 1 } else { 0 };
        Self {
            min,
            capacity,
            held: Vec::new(),
            vacant: Vec::new(),
            count: 0,
        }
    }

    /// Lowest identifier of the range.
    pub fn min(&self) -> u32 {
        self.min
    }

    /// Number of identifiers the range can hold.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of identifiers currently held.
    pub fn held_count(&self) -> u32 {
        self.count
    }

    /// Acquire the lowest free identifier.
    ///
    /// Returns `None` when every identifier in the range is held. This is not
    /// an error: callers queue their request and retry after a release.
    pub fn acquire(&mut self) -> Option<u32> {
        let offset = match self.first_vacant_word() {
            Some(word) => word as u32 * WORD_BITS + (!self.held[word]).trailing_zeros(),
            None => self.held.len() as u32 * WORD_BITS,
        };
        if offset >= self.capacity {
            return None;
        }
        self.set(offset);
        Some(self.min + offset)
    }

    /// Mark a specific identifier as held, e.g. when restoring stored exchanges.
    ///
    /// Returns `false` if the identifier is out of range or already held.
    pub fn register(&mut self, id: u32) -> bool {
        match self.offset(id) {
            Some(offset) if !self.is_set(offset) => {
                self.set(offset);
                true
            }
            _ => false,
        }
    }

    /// Release a held identifier.
    ///
    /// Releasing an identifier that is not held is a caller bug; it trips a
    /// debug assertion and is otherwise ignored.
    pub fn release(&mut self, id: u32) {
        let offset = self.offset(id).filter(|offset| self.is_set(*offset));
        debug_assert!(offset.is_some(), "release of identifier {id} that is not held");
        let Some(offset) = offset else {
            tracing::error!(id, "release of identifier that is not held");
            return;
        };

        let word = (offset / WORD_BITS) as usize;
        self.held[word] &= !(1u64 << (offset % WORD_BITS));
        self.mark_vacant(word, true);
        self.count -= 1;

        // Drop trailing empty words so memory follows the live window.
        while self.held.last() == Some(&0) {
            self.held.pop();
            let popped = self.held.len();
            self.mark_vacant(popped, false);
        }
        self.vacant
            .truncate(self.held.len().div_ceil(WORD_BITS as usize));
    }

    /// Check whether an identifier is currently held.
    pub fn is_held(&self, id: u32) -> bool {
        self.offset(id).is_some_and(|offset| self.is_set(offset))
    }

    /// Release every identifier.
    pub fn clear(&mut self) {
        self.held.clear();
        self.vacant.clear();
        self.count = 0;
    }

    fn offset(&self, id: u32) -> Option<u32> {
        id.checked_sub(self.min)
            .filter(|offset| *offset < self.capacity)
    }

    fn is_set(&self, offset: u32) -> bool {
        self.held
            .get((offset / WORD_BITS) as usize)
            .is_some_and(|word| word & (1u64 << (offset % WORD_BITS)) != 0)
    }

    fn set(&mut self, offset: u32) {
        let word = (offset / WORD_BITS) as usize;
        while self.held.len() <= word {
            self.held.push(0);
            let added = self.held.len() - 1;
            if self.vacant.len() <= added / WORD_BITS as usize {
                self.vacant.push(0);
            }
            self.mark_vacant(added, true);
        }
        self.held[word] |= 1u64 << (offset % WORD_BITS);
        let full = self.held[word] == u64::MAX;
        self.mark_vacant(word, !full);
        self.count += 1;
    }

    fn mark_vacant(&mut self, word: usize, vacant: bool) {
        let index = word / WORD_BITS as usize;
        let bit = 1u64 << (word % WORD_BITS as usize);
        if let Some(summary) = self.vacant.get_mut(index) {
            if vacant {
                *summary |= bit;
            } else {
                *summary &= !bit;
            }
        }
    }

    fn first_vacant_word(&self) -> Option<usize> {
        self.vacant
            .iter()
            .enumerate()
            .find(|(_, summary)| **summary != 0)
            .map(|(index, summary)| index * WORD_BITS as usize + summary.trailing_zeros() as usize)
            .filter(|word| *word < self.held.len())
    }
}
