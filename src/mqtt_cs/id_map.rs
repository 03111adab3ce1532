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

//! Dense map keyed by bounded integer identifiers.

/// Map from a bounded integer key to a value with O(1) operations.
///
/// The key space `[0, max_key]` is rounded up to a power of two and split into
/// equally sized chunks (roughly the square root of the key space each). A
/// chunk's slot storage is allocated on the first insertion into it and
/// returned when its last entry is removed. The most recently emptied chunk is
/// kept as a spare and reused by the next chunk allocation, which keeps a small
/// in-flight window that wanders across a large identifier space from
/// reallocating on every step.
///
/// The map never resizes or rehashes. It is single-writer; it lives inside the
/// protocol task and is never shared.
#[derive(Debug)]
pub struct IdMap<V> {
    max_key: u32,
    chunk_shift: u32,
    chunk_mask: u32,
    chunks: Vec<Option<Box<Chunk<V>>>>,
    spare: Option<Box<Chunk<V>>>,
    len: usize,
}

#[derive(Debug)]
struct Chunk<V> {
    slots: Box<[Option<V>]>,
    count: usize,
}

impl<V> Chunk<V> {
    fn new(size: usize) -> Box<Self> {
        Box::new(Self {
            slots: (0..size).map(|_| None).collect(),
            count: 0,
        })
    }
}

impl<V> IdMap<V> {
    /// Create a map accepting keys in `[0, max_key]`.
    pub fn new(max_key: u32) -> Self {
        let capacity_bits = u32::BITS - max_key.leading_zeros();
        let chunk_shift = (capacity_bits + 1) / 2;
        let chunk_count = 1usize << (capacity_bits - chunk_shift);
        Self {
            max_key,
            chunk_shift,
            chunk_mask: (1u32 << chunk_shift) - 1,
            chunks: (0..chunk_count).map(|_| None).collect(),
            spare: None,
            len: 0,
        }
    }

    /// Largest accepted key.
    pub fn max_key(&self) -> u32 {
        self.max_key
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a value, returning the previous value for the key.
    ///
    /// # Panics
    ///
    /// Panics if `key` exceeds `max_key`. Keys come from an identifier
    /// allocator over the same range, so this is a caller bug.
    pub fn put(&mut self, key: u32, value: V) -> Option<V> {
        assert!(
            key <= self.max_key,
            "key {key} out of range 0..={}",
            self.max_key
        );
        let (index, slot) = self.locate(key);
        let chunk_size = 1usize << self.chunk_shift;
        let spare = &mut self.spare;
        let chunk = self.chunks[index].get_or_insert_with(|| {
            spare.take().unwrap_or_else(|| Chunk::new(chunk_size))
        });
        let previous = chunk.slots[slot].replace(value);
        if previous.is_none() {
            chunk.count += 1;
            self.len += 1;
        }
        previous
    }

    /// Look up a key. Out-of-range keys are simply absent.
    pub fn get(&self, key: u32) -> Option<&V> {
        if key > self.max_key {
            return None;
        }
        let (index, slot) = self.locate(key);
        self.chunks[index].as_ref()?.slots[slot].as_ref()
    }

    pub fn get_mut(&mut self, key: u32) -> Option<&mut V> {
        if key > self.max_key {
            return None;
        }
        let (index, slot) = self.locate(key);
        self.chunks[index].as_mut()?.slots[slot].as_mut()
    }

    pub fn contains_key(&self, key: u32) -> bool {
        self.get(key).is_some()
    }

    /// Remove a key. Out-of-range keys are simply absent.
    pub fn remove(&mut self, key: u32) -> Option<V> {
        if key > self.max_key {
            return None;
        }
        let (index, slot) = self.locate(key);
        let chunk = self.chunks[index].as_mut()?;
        let value = chunk.slots[slot].take()?;
        chunk.count -= 1;
        self.len -= 1;
        if chunk.count == 0 {
            self.spare = self.chunks[index].take();
        }
        Some(value)
    }

    /// Iterate entries in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &V)> + '_ {
        let shift = self.chunk_shift;
        self.chunks
            .iter()
            .enumerate()
            .filter_map(|(index, chunk)| chunk.as_ref().map(|chunk| (index, chunk)))
            .flat_map(move |(index, chunk)| {
                chunk.slots.iter().enumerate().filter_map(move |(slot, value)| {
                    value
                        .as_ref()
                        .map(|value| (((index as u32) << shift) | slot as u32, value))
                })
            })
    }

    /// Remove every entry, returning them in ascending key order.
    pub fn drain(&mut self) -> Vec<(u32, V)> {
        let mut entries = Vec::with_capacity(self.len);
        let shift = self.chunk_shift;
        for (index, chunk) in self.chunks.iter_mut().enumerate() {
            if let Some(mut chunk) = chunk.take() {
                for (slot, value) in chunk.slots.iter_mut().enumerate() {
                    if let Some(value) = value.take() {
                        entries.push((((index as u32) << shift) | slot as u32, value));
                    }
                }
                chunk.count = 0;
                self.spare = Some(chunk);
            }
        }
        self.len = 0;
        entries
    }

    fn locate(&self, key: u32) -> (usize, usize) {
        (
            (key >> self.chunk_shift) as usize,
            (key & self.chunk_mask) as usize,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove() {
        let mut map = IdMap::new(65535);
        assert_eq!(map.put(1, "a"), None);
        assert_eq!(map.put(65535, "z"), None);
        assert_eq!(map.put(1, "b"), Some("a"));
        assert_eq!(map.get(1), Some(&"b"));
        assert_eq!(map.get(2), None);
        assert_eq!(map.len(), 2);
        assert_eq!(map.remove(1), Some("b"));
        assert_eq!(map.remove(1), None);
        assert_eq!(map.get(65535), Some(&"z"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn out_of_range_lookups_are_absent() {
        let mut map: IdMap<u8> = IdMap::new(9);
        assert_eq!(map.get(10), None);
        assert_eq!(map.remove(1000), None);
        assert!(!map.contains_key(u32::MAX));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_put_panics() {
        let mut map = IdMap::new(9);
        map.put(10, ());
    }

    #[test]
    fn chunk_geometry_covers_key_space() {
        for max_key in [0u32, 1, 9, 10, 16, 255, 256, 65535] {
            let mut map = IdMap::new(max_key);
            for key in 0..=max_key {
                map.put(key, key);
            }
            for key in 0..=max_key {
                assert_eq!(map.get(key), Some(&key), "max_key {max_key}");
            }
            assert_eq!(map.len(), max_key as usize + 1);
        }
    }

    #[test]
    fn emptied_chunk_is_kept_as_spare() {
        let mut map = IdMap::new(65535);
        map.put(3, 3);
        assert!(map.spare.is_none());
        map.remove(3);
        assert!(map.spare.is_some());
        // A different chunk reuses the spare instead of allocating.
        map.put(60000, 1);
        assert!(map.spare.is_none());
        assert_eq!(map.get(60000), Some(&1));
        assert_eq!(map.get(3), None);
    }

    #[test]
    fn iter_and_drain_are_key_ordered() {
        let mut map = IdMap::new(1000);
        for key in [700, 3, 512, 4, 999] {
            map.put(key, key * 10);
        }
        let keys: Vec<u32> = map.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec![3, 4, 512, 700, 999]);
        let drained = map.drain();
        assert_eq!(drained[2], (512, 5120));
        assert!(map.is_empty());
        assert_eq!(map.get(700), None);
    }
}
