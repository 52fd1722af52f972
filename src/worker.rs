//! Worker: owner of contexts, inbounds and pipeline layouts for one event loop

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use slab::Slab;

use crate::config::WorkerConfig;
use crate::context::{Context, ContextDataPool, ContextId, ContextSource};
use crate::error::{ErrorStats, ProxyError};
use crate::inbound::{InboundRef, InboundRegistry};

static NEXT_WORKER_ID: AtomicUsize = AtomicUsize::new(0);

pub struct Worker {
    id: usize,
    config: WorkerConfig,
    global: Arc<Value>,
    contexts: Mutex<Slab<ContextId>>,
    inbounds: Arc<InboundRegistry>,
    errors: Mutex<ErrorStats>,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Arc<Self> {
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!("🚀 worker {} ({}) started", id, config.name);

        Arc::new(Self {
            id,
            global: Arc::new(config.global.clone()),
            config,
            contexts: Mutex::new(Slab::new()),
            inbounds: InboundRegistry::new(),
            errors: Mutex::new(ErrorStats::default()),
        })
    }

    /// Validate `config` before starting the worker
    pub fn from_config(config: WorkerConfig) -> Result<Arc<Self>, ProxyError> {
        config.validate()?;
        Ok(Self::new(config))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn global(&self) -> &Arc<Value> {
        &self.global
    }

    pub fn inbounds(&self) -> &Arc<InboundRegistry> {
        &self.inbounds
    }

    /// Slot-array pool for a layout whose filters come from `filenames`
    pub fn context_pool(&self, filenames: Vec<Arc<str>>) -> Arc<ContextDataPool> {
        ContextDataPool::new(filenames, self.config.context_pool_capacity)
    }

    pub fn new_context(
        self: &Arc<Self>,
        pool: &Arc<ContextDataPool>,
        inbound: Option<InboundRef>,
    ) -> Arc<Context> {
        Context::create(self, self.global.clone(), ContextSource::Pool(pool), inbound)
    }

    /// Sub-context sharing `parent`'s slots and inbound
    pub fn derive_context(self: &Arc<Self>, parent: &Context) -> Arc<Context> {
        Context::create(self, self.global.clone(), ContextSource::Inherit(parent), None)
    }

    /// Number of contexts not yet released
    pub fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn context_ids(&self) -> Vec<ContextId> {
        let mut ids: Vec<_> = self.contexts.lock().iter().map(|(_, id)| *id).collect();
        ids.sort();
        ids
    }

    pub(crate) fn register_context(&self, id: ContextId) -> usize {
        self.contexts.lock().insert(id)
    }

    pub(crate) fn unregister_context(&self, key: usize, id: ContextId) {
        let mut contexts = self.contexts.lock();
        if contexts.get(key) == Some(&id) {
            contexts.remove(key);
        } else {
            tracing::warn!("{} was not registered on worker {}", id, self.id);
        }
    }

    pub fn record_error(&self, error: &ProxyError) {
        self.errors.lock().record_error(error);
    }

    pub fn record_retry(&self) {
        self.errors.lock().record_retry();
    }

    pub fn error_stats(&self) -> ErrorStats {
        self.errors.lock().clone()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let live = self.contexts.get_mut().len();
        if live > 0 {
            tracing::debug!("worker {} stopped with {} live contexts", self.id, live);
        } else {
            tracing::info!("worker {} stopped", self.id);
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("contexts", &self.context_count())
            .field("inbounds", &self.inbounds.len())
            .finish()
    }
}
