use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Key, Position};

/// Interface the learned index consumes from the durable key-value store.
///
/// The store owns durability and value bytes; the index only learns the
/// key → position mapping from `scan_sorted`.
pub trait BackingStore: Send {
    /// Every committed, non-tombstoned entry, ascending by key.
    fn scan_sorted(&self) -> anyhow::Result<Box<dyn Iterator<Item = (Key, Position)> + '_>>;

    fn append(&mut self, key: Key, position: Position) -> anyhow::Result<()>;

    /// Returns whether a live entry was tombstoned.
    fn tombstone(&mut self, key: Key) -> anyhow::Result<bool>;

    /// Value bytes stored at a resolved position.
    fn get(&self, position: Position) -> anyhow::Result<Option<Vec<u8>>>;

    /// Live entries, used to validate cached models on open.
    fn row_count(&self) -> anyhow::Result<u64>;
}

/// In-memory ordered store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<Key, Position>,
    values: HashMap<Position, Vec<u8>>,
    tombstones: u64,
    scans: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach value bytes to a position for later `get` calls.
    pub fn put_value(&mut self, position: Position, value: Vec<u8>) {
        self.values.insert(position, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tombstone_count(&self) -> u64 {
        self.tombstones
    }

    /// Number of `scan_sorted` calls served, i.e. rebuild attempts.
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }
}

impl BackingStore for MemoryStore {
    fn scan_sorted(&self) -> anyhow::Result<Box<dyn Iterator<Item = (Key, Position)> + '_>> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(self.entries.iter().map(|(&k, &p)| (k, p))))
    }

    fn append(&mut self, key: Key, position: Position) -> anyhow::Result<()> {
        self.entries.insert(key, position);
        Ok(())
    }

    fn tombstone(&mut self, key: Key) -> anyhow::Result<bool> {
        match self.entries.remove(&key) {
            Some(position) => {
                self.values.remove(&position);
                self.tombstones += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn get(&self, position: Position) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.values.get(&position).cloned())
    }

    fn row_count(&self) -> anyhow::Result<u64> {
        Ok(self.entries.len() as u64)
    }
}
