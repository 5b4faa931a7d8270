//! The bucketed in-memory store.
//!
//! Keys are routed to one of 26 buckets by their first letter. Each entry
//! carries its own `RwLock`ed value, and a table-level `RwLock` covers
//! operations that need a consistent view of the bucket structure (SHOW,
//! backup capture, entry creation and removal).
//!
//! Multi-key batches acquire their per-entry locks in byte-lexicographic
//! key order with non-blocking attempts: on any failure all locks acquired
//! so far are released and the whole set is retried after a bounded
//! back-off. Disjoint batches proceed in parallel; overlapping batches
//! cannot deadlock.

use std::io::Write;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;
use std::time::Duration;

use crate::{KvsError, Result};

/// Number of buckets in the table, one per letter.
const NUM_BUCKETS: usize = 26;

/// Pause between failed multi-key acquisition rounds.
const LOCK_BACKOFF: Duration = Duration::from_micros(50);

/// One (key, value) pair and the lock guarding its value.
///
/// The key is immutable after creation; only the value mutates.
struct KeyEntry {
    key: String,
    value: RwLock<String>,
}

/// Outcome of a DELETE batch.
#[derive(Debug, Default)]
pub struct DeleteOutcome {
    /// Keys that were present and have been removed, in command order.
    pub deleted: Vec<String>,
    /// Keys that were absent (or invalid), in command order.
    pub missing: Vec<String>,
}

/// The concurrent key-value store.
pub struct Store {
    buckets: [RwLock<Vec<Arc<KeyEntry>>>; NUM_BUCKETS],
    /// Read-held by SHOW, backup capture and value-only writes;
    /// write-held while entries are created or removed.
    table: RwLock<()>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| RwLock::new(Vec::new())),
            table: RwLock::new(()),
        }
    }

    /// Returns the bucket index for a key, or `InvalidKey` if the first
    /// character is not an ASCII letter.
    ///
    /// Digit-initial keys are refused: the table has no digit buckets and
    /// silently aliasing them onto letter buckets is not acceptable.
    fn bucket_index(key: &str) -> Result<usize> {
        match key.as_bytes().first() {
            Some(c) if c.is_ascii_alphabetic() => {
                Ok((c.to_ascii_lowercase() - b'a') as usize)
            }
            _ => Err(KvsError::InvalidKey(key.to_owned())),
        }
    }

    /// Looks up an entry without touching the table lock. Callers hold it.
    fn lookup(&self, key: &str) -> Option<Arc<KeyEntry>> {
        let index = Self::bucket_index(key).ok()?;
        let bucket = self.buckets[index].read().unwrap();
        bucket.iter().find(|e| e.key == key).cloned()
    }

    /// Whether the key currently exists. Used by SUBSCRIBE.
    pub fn contains(&self, key: &str) -> bool {
        let _table = self.table.read().unwrap();
        self.lookup(key).is_some()
    }

    /// Stores every pair of the batch.
    ///
    /// Later pairs win for duplicate keys. The whole batch is refused if
    /// any key falls outside the bucket scheme. Pure value updates run
    /// under the table read lock plus ordered per-entry write locks; a
    /// batch that has to create entries takes the table write lock
    /// instead.
    pub fn write(&self, pairs: &[(String, String)]) -> Result<()> {
        for (key, _) in pairs {
            Self::bucket_index(key)?;
        }
        let keys = sorted_unique(pairs.iter().map(|(k, _)| k.as_str()));

        let table = self.table.read().unwrap();
        if let Some(entries) = self.resolve_all(&keys) {
            let mut guards = lock_all_write(&entries);
            apply_pairs(pairs, &keys, &mut guards);
            return Ok(());
        }
        drop(table);

        // Some keys are new: create them under the table write lock.
        let _table = self.table.write().unwrap();
        let entries: Vec<Arc<KeyEntry>> = keys
            .iter()
            .map(|key| self.lookup(key).unwrap_or_else(|| self.insert_entry(key)))
            .collect();
        let mut guards = lock_all_write(&entries);
        apply_pairs(pairs, &keys, &mut guards);
        Ok(())
    }

    /// Reads the batch, returning `(key, value)` in sorted, deduplicated
    /// key order; absent (or invalid) keys read as `None`.
    ///
    /// Holds the table read lock for the duration so the entry set is
    /// stable, and all per-entry read locks simultaneously so the batch
    /// observes a consistent cut.
    pub fn read(&self, keys: &[String]) -> Vec<(String, Option<String>)> {
        let keys = sorted_unique(keys.iter().map(String::as_str));
        let _table = self.table.read().unwrap();

        let entries: Vec<Option<Arc<KeyEntry>>> =
            keys.iter().map(|key| self.lookup(key)).collect();
        let present: Vec<Arc<KeyEntry>> =
            entries.iter().flatten().cloned().collect();
        let guards = lock_all_read(&present);

        let mut results = Vec::with_capacity(keys.len());
        let mut next_guard = 0;
        for (key, entry) in keys.iter().zip(&entries) {
            let value = entry.as_ref().map(|_| {
                let value = guards[next_guard].clone();
                next_guard += 1;
                value
            });
            results.push(((*key).to_owned(), value));
        }
        results
    }

    /// Removes the batch's keys, reporting which were deleted and which
    /// were missing. Runs under the table write lock: unlinking is a
    /// structural mutation.
    pub fn delete(&self, keys: &[String]) -> DeleteOutcome {
        let _table = self.table.write().unwrap();
        let mut outcome = DeleteOutcome::default();

        for key in keys {
            let Ok(index) = Self::bucket_index(key) else {
                outcome.missing.push(key.clone());
                continue;
            };
            let mut bucket = self.buckets[index].write().unwrap();
            match bucket.iter().position(|e| e.key == *key) {
                Some(pos) => {
                    let entry = bucket[pos].clone();
                    // Unlink under the entry's write lock; with the table
                    // write lock held no reader can still be inside.
                    let _value = entry.value.write().unwrap();
                    bucket.remove(pos);
                    outcome.deleted.push(key.clone());
                }
                None => outcome.missing.push(key.clone()),
            }
        }
        outcome
    }

    /// Writes every `(key, value)` pair as `(k, v)\n` lines, buckets in
    /// index order, entries in list order.
    pub fn show(&self, out: &mut impl Write) -> Result<()> {
        let _table = self.table.read().unwrap();
        for bucket in &self.buckets {
            for entry in bucket.read().unwrap().iter() {
                let value = entry.value.read().unwrap();
                writeln!(out, "({}, {})", entry.key, value)?;
            }
        }
        Ok(())
    }

    /// Captures a point-in-time copy of the whole table in SHOW order.
    ///
    /// The table read lock is held only while the copy is taken; callers
    /// serialize the result without blocking writers.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let _table = self.table.read().unwrap();
        let mut pairs = Vec::new();
        for bucket in &self.buckets {
            for entry in bucket.read().unwrap().iter() {
                let value = entry.value.read().unwrap();
                pairs.push((entry.key.clone(), value.clone()));
            }
        }
        pairs
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let _table = self.table.read().unwrap();
        self.buckets
            .iter()
            .map(|b| b.read().unwrap().len())
            .sum()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves every key to its entry, or `None` if any key is absent.
    /// Callers hold the table lock.
    fn resolve_all(&self, keys: &[&str]) -> Option<Vec<Arc<KeyEntry>>> {
        keys.iter().map(|key| self.lookup(key)).collect()
    }

    /// Inserts a fresh entry at the head of its bucket. Callers hold the
    /// table write lock and have checked the key is absent.
    fn insert_entry(&self, key: &str) -> Arc<KeyEntry> {
        let index = Self::bucket_index(key).expect("validated before insert");
        let entry = Arc::new(KeyEntry {
            key: key.to_owned(),
            value: RwLock::new(String::new()),
        });
        self.buckets[index].write().unwrap().insert(0, entry.clone());
        entry
    }
}

/// Sorts and deduplicates a key set; the resulting order is the lock
/// acquisition order.
fn sorted_unique<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut keys: Vec<&str> = keys.collect();
    keys.sort_unstable();
    keys.dedup();
    keys
}

/// Acquires write locks on every entry, in the callers' sorted order,
/// retrying the whole set after a back-off whenever one attempt fails.
fn lock_all_write(entries: &[Arc<KeyEntry>]) -> Vec<RwLockWriteGuard<'_, String>> {
    loop {
        let mut guards = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.value.try_write() {
                Ok(guard) => guards.push(guard),
                Err(_) => break,
            }
        }
        if guards.len() == entries.len() {
            return guards;
        }
        drop(guards);
        thread::sleep(LOCK_BACKOFF);
    }
}

/// Read-mode counterpart of [`lock_all_write`].
fn lock_all_read(entries: &[Arc<KeyEntry>]) -> Vec<RwLockReadGuard<'_, String>> {
    loop {
        let mut guards = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.value.try_read() {
                Ok(guard) => guards.push(guard),
                Err(_) => break,
            }
        }
        if guards.len() == entries.len() {
            return guards;
        }
        drop(guards);
        thread::sleep(LOCK_BACKOFF);
    }
}

/// Applies the batch's pairs through the sorted guards; later duplicate
/// pairs overwrite earlier ones.
fn apply_pairs(
    pairs: &[(String, String)],
    sorted_keys: &[&str],
    guards: &mut [RwLockWriteGuard<'_, String>],
) {
    for (key, value) in pairs {
        let index = sorted_keys
            .binary_search(&key.as_str())
            .expect("every pair key is in the sorted set");
        *guards[index] = value.clone();
    }
}
