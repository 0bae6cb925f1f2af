use log::debug;
use std::fmt;
use std::iter;
use std::mem;
use std::slice;

/// Bucket count of a freshly created table.
pub const INITIAL_BUCKETS: usize = 3;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Key not found")]
    KeyNotFound,
}

/// djb2 string hash: `hash * 33 + byte`, seeded with 5381.
///
/// Used both for bucket selection (modulo bucket count) and, truncated to 16
/// bits, for placing keys on the ring.
pub fn string_hash(bytes: &[u8]) -> u64 {
    bytes.iter().fold(5381u64, |hash, &b| {
        (hash << 5).wrapping_add(hash).wrapping_add(b as u64)
    })
}

struct Entry {
    key: Vec<u8>,
    value: Vec<u8>,
    next: Option<Box<Entry>>,
}

/// Chained hash table from byte-string keys to byte-string values.
///
/// Each bucket holds a singly linked chain. The table doubles its bucket count
/// and rehashes every entry once the population exceeds 3/4 of the bucket
/// count.
pub struct HashTable {
    buckets: Vec<Option<Box<Entry>>>,
    len: usize,
}

impl fmt::Debug for HashTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTable")
            .field("len", &self.len)
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

impl Default for HashTable {
    fn default() -> Self {
        Self::new()
    }
}

fn empty_buckets(count: usize) -> Vec<Option<Box<Entry>>> {
    iter::repeat_with(|| None).take(count).collect()
}

fn bucket_for(key: &[u8], bucket_count: usize) -> usize {
    (string_hash(key) % bucket_count as u64) as usize
}

impl HashTable {
    pub fn new() -> Self {
        Self::with_buckets(INITIAL_BUCKETS)
    }

    pub fn with_buckets(count: usize) -> Self {
        HashTable {
            buckets: empty_buckets(count.max(1)),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of entries chained in bucket `index`.
    pub fn chain_len(&self, index: usize) -> usize {
        let mut count = 0;
        let mut cursor = self.buckets.get(index).and_then(|b| b.as_deref());
        while let Some(entry) = cursor {
            count += 1;
            cursor = entry.next.as_deref();
        }
        count
    }

    pub fn bucket_index(&self, key: &[u8]) -> usize {
        bucket_for(key, self.buckets.len())
    }

    pub fn get(&self, key: &[u8]) -> Result<&[u8], StorageError> {
        let mut cursor = self.buckets[self.bucket_index(key)].as_deref();
        while let Some(entry) = cursor {
            if entry.key == key {
                return Ok(&entry.value);
            }
            cursor = entry.next.as_deref();
        }
        Err(StorageError::KeyNotFound)
    }

    /// Inserts or replaces the value stored under `key`.
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        if 4 * self.len > 3 * self.buckets.len() {
            self.resize();
        }

        let index = self.bucket_index(key);
        let mut cursor = self.buckets[index].as_deref_mut();
        while let Some(entry) = cursor {
            if entry.key == key {
                entry.value = value.to_vec();
                return;
            }
            cursor = entry.next.as_deref_mut();
        }

        let head = self.buckets[index].take();
        self.buckets[index] = Some(Box::new(Entry {
            key: key.to_vec(),
            value: value.to_vec(),
            next: head,
        }));
        self.len += 1;
    }

    /// Unlinks the entry for `key`, keeping the rest of its chain in order.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), StorageError> {
        let index = self.bucket_index(key);
        let bucket = &mut self.buckets[index];

        if bucket.as_ref().map_or(false, |head| head.key == key) {
            let head = bucket.take();
            *bucket = head.and_then(|entry| entry.next);
            self.len -= 1;
            return Ok(());
        }

        let mut prev = match bucket.as_deref_mut() {
            Some(entry) => entry,
            None => return Err(StorageError::KeyNotFound),
        };
        loop {
            let found = match prev.next.as_deref() {
                Some(next) => next.key == key,
                None => return Err(StorageError::KeyNotFound),
            };
            if found {
                break;
            }
            match prev.next.as_deref_mut() {
                Some(next) => prev = next,
                None => return Err(StorageError::KeyNotFound),
            }
        }

        let removed = prev.next.take();
        prev.next = removed.and_then(|entry| entry.next);
        self.len -= 1;
        Ok(())
    }

    /// Drops every entry, leaving the bucket array at its current size.
    pub fn clear(&mut self) {
        for bucket in self.buckets.iter_mut() {
            let mut chain = bucket.take();
            while let Some(mut entry) = chain {
                chain = entry.next.take();
            }
        }
        self.len = 0;
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            buckets: self.buckets.iter(),
            current: None,
        }
    }

    fn resize(&mut self) {
        let new_count = self.buckets.len() * 2;
        debug!(
            "HashTable: resizing from {} to {} buckets ({} entries)",
            self.buckets.len(),
            new_count,
            self.len
        );
        let old = mem::replace(&mut self.buckets, empty_buckets(new_count));
        for mut chain in old {
            while let Some(mut entry) = chain {
                chain = entry.next.take();
                let index = bucket_for(&entry.key, new_count);
                entry.next = self.buckets[index].take();
                self.buckets[index] = Some(entry);
            }
        }
    }
}

// Chains are unlinked one entry at a time so a long chain never recurses
// through nested Box drops.
impl Drop for HashTable {
    fn drop(&mut self) {
        self.clear();
    }
}

pub struct Iter<'a> {
    buckets: slice::Iter<'a, Option<Box<Entry>>>,
    current: Option<&'a Entry>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.current {
                self.current = entry.next.as_deref();
                return Some((&entry.key, &entry.value));
            }
            self.current = self.buckets.next()?.as_deref();
        }
    }
}
