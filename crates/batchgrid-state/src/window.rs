//! Append-only history shared between control loops.
//!
//! A window is a deque of entries addressed by a monotonically increasing
//! sequence number. Bounded windows evict the oldest entry on append once
//! full; that is how each cluster keeps its recent metrics. Unbounded
//! windows back per-cluster job lists, where finished jobs are removed in
//! two steps: [`ConcurrentWindow::mark_for_removal`] sets an atomic
//! tombstone under the shared lock, and [`ConcurrentWindow::compact`]
//! drops tombstoned entries under the exclusive lock.
//!
//! Readers work on a [`WindowView`], a point-in-time copy of the entry
//! handles. Values are reference counted, so taking a view never clones
//! the payloads.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use crate::types::{Job, MetricsSnapshot};

/// Number of metrics snapshots a cluster keeps unless configured otherwise.
pub const DEFAULT_METRICS_CAPACITY: usize = 6;

/// Bounded history of a cluster's telemetry.
pub type MetricsWindow = ConcurrentWindow<MetricsSnapshot>;

/// Jobs attached to a cluster.
pub type JobList = ConcurrentWindow<Job>;

struct Slot<T> {
    seq: u64,
    item: Arc<T>,
    tombstone: AtomicBool,
}

struct Inner<T> {
    slots: VecDeque<Slot<T>>,
    next_seq: u64,
}

/// Concurrency-safe FIFO window with tombstone removal.
pub struct ConcurrentWindow<T> {
    inner: RwLock<Inner<T>>,
    capacity: Option<usize>,
}

impl<T> ConcurrentWindow<T> {
    /// A window holding at most `capacity` entries (at least one).
    pub fn bounded(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: RwLock::new(Inner {
                slots: VecDeque::with_capacity(capacity),
                next_seq: 0,
            }),
            capacity: Some(capacity),
        }
    }

    /// A window that never evicts.
    pub fn unbounded() -> Self {
        Self {
            inner: RwLock::new(Inner {
                slots: VecDeque::new(),
                next_seq: 0,
            }),
            capacity: None,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Append an item, evicting the oldest entry if the window is full.
    /// Returns the sequence number assigned to the item.
    pub async fn append(&self, item: T) -> u64 {
        let mut inner = self.inner.write().await;
        if let Some(cap) = self.capacity {
            while inner.slots.len() >= cap {
                inner.slots.pop_front();
            }
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.slots.push_back(Slot {
            seq,
            item: Arc::new(item),
            tombstone: AtomicBool::new(false),
        });
        seq
    }

    /// Point-in-time view of every held entry, oldest first.
    pub async fn snapshot(&self) -> WindowView<T> {
        let inner = self.inner.read().await;
        let entries = inner
            .slots
            .iter()
            .map(|slot| WindowEntry {
                seq: slot.seq,
                value: Arc::clone(&slot.item),
                tombstone: slot.tombstone.load(Ordering::Acquire),
            })
            .collect();
        WindowView { entries }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.slots.is_empty()
    }

    /// Most recently appended entry still held.
    pub async fn latest(&self) -> Option<Arc<T>> {
        self.inner
            .read()
            .await
            .slots
            .back()
            .map(|slot| Arc::clone(&slot.item))
    }

    /// Tombstone the entry with sequence number `seq`.
    ///
    /// Returns false when the entry is no longer held (already compacted or
    /// evicted). Only the shared lock is taken.
    pub async fn mark_for_removal(&self, seq: u64) -> bool {
        let inner = self.inner.read().await;
        match inner.slots.binary_search_by_key(&seq, |slot| slot.seq) {
            Ok(idx) => {
                inner.slots[idx].tombstone.store(true, Ordering::Release);
                true
            }
            Err(_) => false,
        }
    }

    /// Drop all tombstoned entries. Returns how many were removed.
    pub async fn compact(&self) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.slots.len();
        inner
            .slots
            .retain(|slot| !slot.tombstone.load(Ordering::Acquire));
        before - inner.slots.len()
    }
}

/// One entry of a [`WindowView`].
#[derive(Debug)]
pub struct WindowEntry<T> {
    pub seq: u64,
    pub value: Arc<T>,
    /// Whether the entry was marked for removal when the view was taken.
    pub tombstone: bool,
}

impl<T> Clone for WindowEntry<T> {
    fn clone(&self) -> Self {
        Self {
            seq: self.seq,
            value: Arc::clone(&self.value),
            tombstone: self.tombstone,
        }
    }
}

/// Immutable, restartable view over a window's entries.
#[derive(Debug)]
pub struct WindowView<T> {
    entries: Vec<WindowEntry<T>>,
}

impl<T> Clone for WindowView<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<T> WindowView<T> {
    /// Build a view directly from values, sequenced from zero.
    pub fn from_values(values: impl IntoIterator<Item = T>) -> Self {
        let entries = values
            .into_iter()
            .enumerate()
            .map(|(seq, value)| WindowEntry {
                seq: seq as u64,
                value: Arc::new(value),
                tombstone: false,
            })
            .collect();
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &WindowEntry<T>> {
        self.entries.iter()
    }

    /// Entries not marked for removal.
    pub fn live(&self) -> impl Iterator<Item = &WindowEntry<T>> {
        self.entries.iter().filter(|entry| !entry.tombstone)
    }

    /// Values oldest first.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|entry| entry.value.as_ref())
    }

    pub fn last(&self) -> Option<&T> {
        self.entries.last().map(|entry| entry.value.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
