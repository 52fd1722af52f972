//! Recycling of per-context slot arrays
//!
//! One pool exists per pipeline layout. The slot count and the filename of
//! every slot are fixed by the layout, so a recycled array only needs its
//! state cleared before it is handed to the next context.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;

use super::{ContextData, ContextDataBase, ContextId};
use crate::inbound::InboundRef;

type Slots = Box<[Mutex<ContextDataBase>]>;

/// Pool counters
#[derive(Debug, Default)]
pub struct ContextPoolStats {
    pub allocated: AtomicU64,
    pub reused: AtomicU64,
    pub recycled: AtomicU64,
    pub discarded: AtomicU64,
}

/// Point-in-time copy of [`ContextPoolStats`]
#[derive(Debug, Clone, PartialEq)]
pub struct ContextPoolStatsSnapshot {
    pub allocated: u64,
    pub reused: u64,
    pub recycled: u64,
    pub discarded: u64,
    pub hit_rate: f64,
}

impl ContextPoolStats {
    pub fn snapshot(&self) -> ContextPoolStatsSnapshot {
        let allocated = self.allocated.load(Ordering::Relaxed);
        let reused = self.reused.load(Ordering::Relaxed);
        let total = allocated + reused;
        ContextPoolStatsSnapshot {
            allocated,
            reused,
            recycled: self.recycled.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                reused as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Lock-free cache of slot arrays for one pipeline layout
pub struct ContextDataPool {
    filenames: Box<[Arc<str>]>,
    free: SegQueue<Slots>,
    capacity: usize,
    stats: ContextPoolStats,
}

impl ContextDataPool {
    /// `filenames[i]` names the filter owning slot `i`; at most `capacity`
    /// released arrays are kept for reuse
    pub fn new(filenames: Vec<Arc<str>>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            filenames: filenames.into_boxed_slice(),
            free: SegQueue::new(),
            capacity,
            stats: ContextPoolStats::default(),
        })
    }

    pub fn slot_count(&self) -> usize {
        self.filenames.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Arrays currently waiting for reuse
    pub fn cached(&self) -> usize {
        self.free.len()
    }

    pub fn stats(&self) -> ContextPoolStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn acquire(self: &Arc<Self>, id: ContextId, inbound: Option<InboundRef>) -> Arc<ContextData> {
        let slots = match self.free.pop() {
            Some(slots) => {
                self.stats.reused.fetch_add(1, Ordering::Relaxed);
                for slot in slots.iter() {
                    slot.lock().attach(id, inbound.clone());
                }
                slots
            }
            None => {
                self.stats.allocated.fetch_add(1, Ordering::Relaxed);
                self.filenames
                    .iter()
                    .map(|name| Mutex::new(ContextDataBase::new(name.clone(), id, inbound.clone())))
                    .collect()
            }
        };

        Arc::new(ContextData {
            slots,
            pool: Arc::downgrade(self),
        })
    }

    pub(super) fn recycle(&self, slots: Slots) {
        if slots.len() != self.filenames.len() {
            return;
        }
        if self.free.len() >= self.capacity {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        for slot in slots.iter() {
            slot.lock().reset();
        }
        self.free.push(slots);
        self.stats.recycled.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ContextDataPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextDataPool")
            .field("slots", &self.filenames.len())
            .field("cached", &self.free.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
