//! Unique table: hash-consed storage of values addressed by index.
//!
//! Entries live in a plain vector. Equal values are chained per hash bucket,
//! so `put` returns the index of an existing equal value instead of storing
//! a duplicate. Index `0` is a sentinel and is never handed out.

use std::cmp::{max, min};
use std::ops::Index;

use crate::utils::BucketHash;

#[derive(Clone)]
struct Entry<T> {
    value: T,
    next: usize,
    occupied: bool,
}

impl<T: Default> Default for Entry<T> {
    fn default() -> Self {
        Self {
            value: T::default(),
            next: 0,
            occupied: false,
        }
    }
}

pub struct Table<T> {
    data: Vec<Entry<T>>,

    buckets: Vec<usize>,
    bitmask: u64,

    /// Index of the first *possibly* free (non-occupied) cell.
    min_free: usize,
    /// Index of the last used cell.
    last_index: usize,
    /// Number of occupied cells.
    real_size: usize,
}

impl<T: Default> Table<T> {
    /// Create a new table with initial room for `2^bits` values.
    ///
    /// The table grows on demand; `bits` only sizes the initial allocation.
    pub fn new(bits: usize) -> Self {
        assert!(bits <= 31, "Storage bits should be in the range 0..=31");

        let mut data: Vec<Entry<T>> = Vec::with_capacity(1 << bits);
        data.push(Entry::default());
        data[0].occupied = true; // sentry

        let buckets_bits = max(min(bits, 16), 1);
        let buckets = vec![0; 1 << buckets_bits];
        let bitmask = (buckets.len() - 1) as u64;

        Self {
            data,
            buckets,
            bitmask,
            min_free: 1,
            last_index: 0,
            real_size: 0,
        }
    }

    /// Allocate a new cell and return its index.
    fn alloc(&mut self) -> usize {
        let index = (self.min_free..=self.last_index)
            .find(|&i| !self.data[i].occupied)
            .unwrap_or_else(|| {
                self.last_index += 1;
                if self.last_index == self.data.len() {
                    self.data.push(Entry::default());
                }
                self.last_index
            });

        self.data[index].occupied = true;
        self.min_free = index + 1;
        self.real_size += 1;

        index
    }
}

impl<T> Table<T> {
    /// Number of allocated cells, including free ones.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
    /// Index of the last used cell.
    pub fn size(&self) -> usize {
        self.last_index
    }
    /// Number of occupied cells.
    pub fn real_size(&self) -> usize {
        self.real_size
    }
    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn value(&self, index: usize) -> &T {
        assert_ne!(index, 0, "Index is 0");
        &self.data[index].value
    }

    pub fn is_occupied(&self, index: usize) -> bool {
        assert_ne!(index, 0, "Index is 0");
        self.data[index].occupied
    }

    /// Free the cell at the given index.
    ///
    /// Bucket chains are not relinked here; call [`Table::rebuild`] after a
    /// batch of drops.
    pub fn drop(&mut self, index: usize) {
        assert_ne!(index, 0, "Index is 0");
        assert!(self.data[index].occupied, "Cell {} is not occupied", index);

        self.data[index].occupied = false;
        self.min_free = min(self.min_free, index);
        self.real_size -= 1;
    }
}

impl<T> Table<T>
where
    T: BucketHash,
{
    fn bucket_index(&self, value: &T) -> usize {
        (value.bucket_hash() & self.bitmask) as usize
    }

    /// Relink all bucket chains over the occupied cells.
    pub fn rebuild(&mut self) {
        self.buckets.fill(0);
        for i in 1..=self.last_index {
            if !self.data[i].occupied {
                continue;
            }
            let b = self.bucket_index(&self.data[i].value);
            self.data[i].next = self.buckets[b];
            self.buckets[b] = i;
        }
    }

    fn grow_buckets(&mut self) {
        let n = self.buckets.len() * 2;
        self.buckets = vec![0; n];
        self.bitmask = (n - 1) as u64;
        self.rebuild();
    }
}

impl<T> Table<T>
where
    T: BucketHash + Eq + Default,
{
    /// Put a value into the table and return its index.
    ///
    /// If an equal value is already stored, its index is returned.
    pub fn put(&mut self, value: T) -> usize {
        let bucket_index = self.bucket_index(&value);
        let mut index = self.buckets[bucket_index];

        while index != 0 {
            if self.data[index].value == value {
                return index;
            }
            index = self.data[index].next;
        }

        let i = self.alloc();
        self.data[i].value = value;
        self.data[i].next = self.buckets[bucket_index];
        self.buckets[bucket_index] = i;

        if self.real_size > 2 * self.buckets.len() {
            self.grow_buckets();
        }

        i
    }
}

impl<T> Index<usize> for Table<T> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        self.value(index)
    }
}
