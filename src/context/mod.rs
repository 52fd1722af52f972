//! Per-stream execution context
//!
//! A [`Context`] is created when a pipeline starts handling a logical stream
//! and is shared (`Arc`) by every filter instance of that pipeline. It owns an
//! array of per-filter [`ContextDataBase`] slots whose length is fixed by the
//! pipeline layout. Slot arrays come from a [`ContextDataPool`] and go back to
//! it, reset, when the last context sharing them is released.

mod pool;

pub use pool::{ContextDataPool, ContextPoolStats, ContextPoolStatsSnapshot};

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;

use crate::inbound::{InboundInfo, InboundRef};
use crate::worker::Worker;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Process-wide unique, monotonically increasing context id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

impl From<ContextId> for u64 {
    fn from(id: ContextId) -> Self {
        id.0
    }
}

/// One filter's slot in a context
///
/// Written only by the filter that owns the slot index; any filter holding the
/// context may read it.
pub struct ContextDataBase {
    filename: Arc<str>,
    context: ContextId,
    inbound: Option<InboundRef>,
    state: Option<Box<dyn Any + Send>>,
}

impl ContextDataBase {
    pub(crate) fn new(filename: Arc<str>, context: ContextId, inbound: Option<InboundRef>) -> Self {
        Self {
            filename,
            context,
            inbound,
            state: None,
        }
    }

    /// Script or config unit that defined the owning filter
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Context this slot array was allocated for
    pub fn context_id(&self) -> ContextId {
        self.context
    }

    /// Inbound of the owning context, if it is still alive
    pub fn inbound(&self) -> Option<Arc<InboundInfo>> {
        self.inbound.as_ref().and_then(InboundRef::get)
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none()
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.state.as_ref()?.downcast_ref()
    }

    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.state.as_mut()?.downcast_mut()
    }

    pub fn set<T: Any + Send>(&mut self, value: T) {
        self.state = Some(Box::new(value));
    }

    pub fn take<T: Any>(&mut self) -> Option<T> {
        match self.state.take()?.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.state = Some(other);
                None
            }
        }
    }

    fn attach(&mut self, context: ContextId, inbound: Option<InboundRef>) {
        self.context = context;
        self.inbound = inbound;
    }

    fn reset(&mut self) {
        self.state = None;
        self.inbound = None;
    }
}

impl fmt::Debug for ContextDataBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextDataBase")
            .field("filename", &self.filename)
            .field("context", &self.context)
            .field("occupied", &self.state.is_some())
            .finish()
    }
}

/// Fixed-size slot array, shared by a context and the sub-contexts derived from it
pub struct ContextData {
    slots: Box<[Mutex<ContextDataBase>]>,
    pool: Weak<ContextDataPool>,
}

impl ContextData {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Drop for ContextData {
    fn drop(&mut self) {
        let slots = std::mem::take(&mut self.slots);
        if let Some(pool) = self.pool.upgrade() {
            pool.recycle(slots);
        }
    }
}

impl fmt::Debug for ContextData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextData").field("slots", &self.slots.len()).finish()
    }
}

/// Where a new context gets its slot array from
pub enum ContextSource<'a> {
    /// Fresh slots from a layout's pool
    Pool(&'a Arc<ContextDataPool>),
    /// Share the parent's slots (nested sub-stream)
    Inherit(&'a Context),
}

/// Per-stream state shared by the filters of one pipeline instance
pub struct Context {
    id: ContextId,
    worker: Weak<Worker>,
    global: Arc<Value>,
    data: Arc<ContextData>,
    inbound: Option<InboundRef>,
    parent: Option<ContextId>,
    registration: usize,
}

impl Context {
    /// Create a context with a fresh id and register it on `worker`.
    ///
    /// With [`ContextSource::Inherit`] the new context shares the parent's slot
    /// array and, unless `inbound` is given, the parent's inbound.
    pub fn create(
        worker: &Arc<Worker>,
        global: Arc<Value>,
        source: ContextSource<'_>,
        inbound: Option<InboundRef>,
    ) -> Arc<Context> {
        let id = ContextId::next();
        let (data, inbound, parent) = match source {
            ContextSource::Pool(pool) => (pool.acquire(id, inbound.clone()), inbound, None),
            ContextSource::Inherit(parent) => (
                parent.data.clone(),
                inbound.or_else(|| parent.inbound.clone()),
                Some(parent.id),
            ),
        };
        let registration = worker.register_context(id);
        tracing::trace!("{} created ({} slots, parent {:?})", id, data.len(), parent);

        Arc::new(Context {
            id,
            worker: Arc::downgrade(worker),
            global,
            data,
            inbound,
            parent,
            registration,
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Owning worker, if it is still running
    pub fn worker(&self) -> Option<Arc<Worker>> {
        self.worker.upgrade()
    }

    pub fn global(&self) -> &Value {
        &self.global
    }

    /// Originating inbound; `None` if there was none or it has closed
    pub fn inbound(&self) -> Option<Arc<InboundInfo>> {
        self.inbound.as_ref().and_then(InboundRef::get)
    }

    pub fn inbound_ref(&self) -> Option<&InboundRef> {
        self.inbound.as_ref()
    }

    /// Context this one was derived from
    pub fn parent(&self) -> Option<ContextId> {
        self.parent
    }

    pub fn slot_count(&self) -> usize {
        self.data.len()
    }

    /// Lock the slot of filter `slot`.
    ///
    /// # Panics
    ///
    /// If `slot` is outside the array fixed at construction; that is a wiring
    /// bug in the pipeline, not a runtime condition.
    pub fn data(&self, slot: usize) -> MutexGuard<'_, ContextDataBase> {
        self.data.slots[slot].lock()
    }

    pub fn shares_data_with(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Give up this owner's reference; the last one out recycles the slots
    pub fn finalize(self: Arc<Self>) {
        tracing::trace!("{} finalize ({} owners left)", self.id, Arc::strong_count(&self) - 1);
        drop(self);
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.upgrade() {
            worker.unregister_context(self.registration, self.id);
        }
        tracing::trace!("{} released", self.id);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("slots", &self.data.len())
            .field("parent", &self.parent)
            .field("inbound_alive", &self.inbound.as_ref().map(InboundRef::is_alive))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Protocol, WorkerConfig};
    use crate::inbound::InboundInfo;
    use std::collections::HashSet;

    fn setup(slots: usize) -> (Arc<Worker>, Arc<ContextDataPool>) {
        let worker = Worker::new(WorkerConfig::default());
        let filenames = (0..slots).map(|i| Arc::from(format!("filter-{}.js", i))).collect();
        let pool = worker.context_pool(filenames);
        (worker, pool)
    }

    #[test]
    fn test_ids_unique_and_increasing() {
        let (worker, pool) = setup(1);
        let mut seen = HashSet::new();
        let mut last = 0;
        for _ in 0..100 {
            let ctx = worker.new_context(&pool, None);
            let id = ctx.id().as_u64();
            assert!(id > last);
            assert!(seen.insert(id));
            last = id;
        }
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let (worker, pool) = setup(1);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let worker = worker.clone();
                let pool = pool.clone();
                std::thread::spawn(move || {
                    (0..200)
                        .map(|_| worker.new_context(&pool, None).id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id));
            }
        }
        assert_eq!(all.len(), 1600);
    }

    #[test]
    fn test_slot_count_and_filenames() {
        let (worker, pool) = setup(3);
        let ctx = worker.new_context(&pool, None);
        assert_eq!(ctx.slot_count(), 3);
        assert_eq!(ctx.data(2).filename(), "filter-2.js");
        assert_eq!(ctx.data(0).context_id(), ctx.id());
    }

    #[test]
    #[should_panic]
    fn test_out_of_bounds_slot_panics() {
        let (worker, pool) = setup(2);
        let ctx = worker.new_context(&pool, None);
        let _ = ctx.data(2);
    }

    #[test]
    fn test_slot_state() {
        let (worker, pool) = setup(1);
        let ctx = worker.new_context(&pool, None);

        assert!(ctx.data(0).is_empty());
        ctx.data(0).set(41u32);
        *ctx.data(0).get_mut::<u32>().unwrap() += 1;
        assert_eq!(ctx.data(0).get::<u32>(), Some(&42));
        assert_eq!(ctx.data(0).get::<String>(), None);
        assert_eq!(ctx.data(0).take::<String>(), None);
        assert_eq!(ctx.data(0).take::<u32>(), Some(42));
        assert!(ctx.data(0).is_empty());
    }

    #[test]
    fn test_derived_context_shares_slots() {
        let (worker, pool) = setup(2);
        let parent = worker.new_context(&pool, None);
        let child = worker.derive_context(&parent);

        assert_ne!(parent.id(), child.id());
        assert_eq!(child.parent(), Some(parent.id()));
        assert!(child.shares_data_with(&parent));

        parent.data(1).set("shared".to_string());
        assert_eq!(child.data(1).get::<String>().map(String::as_str), Some("shared"));
    }

    #[test]
    fn test_finalize_recycles_and_resets() {
        let (worker, pool) = setup(2);
        let ctx = worker.new_context(&pool, None);
        ctx.data(0).set(1u8);
        ctx.data(1).set(2u8);
        assert_eq!(worker.context_count(), 1);

        ctx.finalize();
        assert_eq!(worker.context_count(), 0);
        assert_eq!(pool.cached(), 1);

        let reused = worker.new_context(&pool, None);
        assert_eq!(pool.stats().reused, 1);
        assert!(reused.data(0).is_empty());
        assert!(reused.data(1).is_empty());
        assert_eq!(reused.data(0).context_id(), reused.id());
    }

    #[test]
    fn test_slots_recycled_after_last_sharer() {
        let (worker, pool) = setup(1);
        let parent = worker.new_context(&pool, None);
        let child = worker.derive_context(&parent);

        parent.finalize();
        assert_eq!(pool.cached(), 0);
        assert_eq!(worker.context_count(), 1);

        child.finalize();
        assert_eq!(pool.cached(), 1);
        assert_eq!(worker.context_count(), 0);
    }

    #[test]
    fn test_inbound_is_weak() {
        let (worker, pool) = setup(1);
        let inbound = worker
            .inbounds()
            .register(InboundInfo::new(Protocol::Tcp, "listener"));
        let ctx = worker.new_context(&pool, Some(inbound.downgrade()));
        let child = worker.derive_context(&ctx);

        assert_eq!(ctx.inbound().unwrap().label, "listener");
        assert_eq!(ctx.data(0).inbound().unwrap().label, "listener");
        assert!(child.inbound().is_some());

        inbound.close();
        assert!(ctx.inbound().is_none());
        assert!(child.inbound().is_none());
        assert!(ctx.data(0).inbound().is_none());
    }

    #[test]
    fn test_context_without_inbound() {
        let (worker, pool) = setup(1);
        let ctx = worker.new_context(&pool, None);
        assert!(ctx.inbound().is_none());
        assert!(ctx.inbound_ref().is_none());
    }

    #[test]
    fn test_context_outliving_worker() {
        let (worker, pool) = setup(1);
        let ctx = worker.new_context(&pool, None);
        drop(worker);
        assert!(ctx.worker().is_none());
        drop(ctx);
        assert_eq!(pool.cached(), 1);
    }
}
