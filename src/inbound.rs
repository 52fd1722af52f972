//! Inbound connections as seen from the data plane
//!
//! The accept path owns an [`Inbound`]; everything else holds an
//! [`InboundRef`], a (slot, generation) pair checked against the registry on
//! every access. Once the inbound is closed every outstanding ref reads as
//! empty, even if its slab slot has been reused.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slab::Slab;

/// What the data plane may learn about an inbound connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundInfo {
    pub protocol: crate::config::Protocol,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    /// Listener label, e.g. `"0.0.0.0:8080"`
    pub label: String,
}

impl InboundInfo {
    pub fn new(protocol: crate::config::Protocol, label: impl Into<String>) -> Self {
        Self {
            protocol,
            local_addr: None,
            peer_addr: None,
            label: label.into(),
        }
    }

    pub fn with_addrs(mut self, local: SocketAddr, peer: SocketAddr) -> Self {
        self.local_addr = Some(local);
        self.peer_addr = Some(peer);
        self
    }
}

struct Entry {
    generation: u64,
    info: Arc<InboundInfo>,
}

/// Worker-scoped table of live inbounds
#[derive(Default)]
pub struct InboundRegistry {
    entries: Mutex<Slab<Entry>>,
    generation: AtomicU64,
}

impl InboundRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a live inbound; the returned guard unregisters on drop
    pub fn register(self: &Arc<Self>, info: InboundInfo) -> Inbound {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let info = Arc::new(info);
        let key = self.entries.lock().insert(Entry {
            generation,
            info: info.clone(),
        });
        tracing::debug!("inbound registered (slot {}, generation {})", key, generation);

        Inbound {
            registry: self.clone(),
            key,
            generation,
            info,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn lookup(&self, key: usize, generation: u64) -> Option<Arc<InboundInfo>> {
        let entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.generation == generation => Some(entry.info.clone()),
            _ => None,
        }
    }

    fn remove(&self, key: usize, generation: u64) {
        let mut entries = self.entries.lock();
        if entries.get(key).map(|e| e.generation) == Some(generation) {
            entries.remove(key);
            tracing::debug!("inbound unregistered (slot {}, generation {})", key, generation);
        }
    }
}

impl std::fmt::Debug for InboundRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundRegistry")
            .field("live", &self.len())
            .finish()
    }
}

/// Owning handle held by the accept path
#[derive(Debug)]
pub struct Inbound {
    registry: Arc<InboundRegistry>,
    key: usize,
    generation: u64,
    info: Arc<InboundInfo>,
}

impl Inbound {
    /// Non-owning reference suitable for storing in a context
    pub fn downgrade(&self) -> InboundRef {
        InboundRef {
            registry: Arc::downgrade(&self.registry),
            key: self.key,
            generation: self.generation,
        }
    }

    pub fn info(&self) -> Arc<InboundInfo> {
        self.info.clone()
    }

    /// Close the inbound; outstanding refs become empty
    pub fn close(self) {}
}

impl Drop for Inbound {
    fn drop(&mut self) {
        self.registry.remove(self.key, self.generation);
    }
}

/// Liveness-checked, non-owning reference to an inbound
#[derive(Debug, Clone)]
pub struct InboundRef {
    registry: Weak<InboundRegistry>,
    key: usize,
    generation: u64,
}

impl InboundRef {
    /// `None` once the inbound (or its whole registry) is gone
    pub fn get(&self) -> Option<Arc<InboundInfo>> {
        self.registry.upgrade()?.lookup(self.key, self.generation)
    }

    pub fn is_alive(&self) -> bool {
        self.get().is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl PartialEq for InboundRef {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.registry, &other.registry)
            && self.key == other.key
            && self.generation == other.generation
    }
}

impl Eq for InboundRef {}
