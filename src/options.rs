//! Late-bound configuration
//!
//! A [`Setting`] is either a static value or a deferred computation run
//! against the current [`Context`]. Resolution produces an owned snapshot that
//! the rest of a connection attempt consumes; nothing is re-evaluated midway.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::config::ConnectOptions;
use crate::context::Context;
use crate::error::ProxyError;

/// Callback evaluated at connection time; may suspend
pub type Evaluator<T> =
    Arc<dyn Fn(Arc<Context>) -> BoxFuture<'static, Result<T, ProxyError>> + Send + Sync>;

/// Static value or deferred computation
pub enum Setting<T> {
    Static(T),
    Dynamic(Evaluator<T>),
}

impl<T> Clone for Setting<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        match self {
            Setting::Static(v) => Setting::Static(v.clone()),
            Setting::Dynamic(f) => Setting::Dynamic(f.clone()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Setting<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Setting::Static(v) => f.debug_tuple("Static").field(v).finish(),
            Setting::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl<T> From<T> for Setting<T> {
    fn from(value: T) -> Self {
        Setting::Static(value)
    }
}

impl<T> Setting<T>
where
    T: Clone + Send + 'static,
{
    /// Wrap an async closure as a dynamic setting
    pub fn dynamic<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ProxyError>> + Send + 'static,
    {
        Setting::Dynamic(Arc::new(move |ctx| f(ctx).boxed()))
    }

    /// Wrap a synchronous closure as a dynamic setting
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&Context) -> Result<T, ProxyError> + Send + Sync + 'static,
    {
        Setting::Dynamic(Arc::new(move |ctx| {
            let result = f(&ctx);
            async move { result }.boxed()
        }))
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Setting::Dynamic(_))
    }

    /// Produce the value for this attempt.
    ///
    /// Callback failures surface as configuration errors; the attempt is
    /// aborted before any socket is touched.
    pub async fn resolve(&self, ctx: &Arc<Context>) -> Result<T, ProxyError> {
        match self {
            Setting::Static(v) => Ok(v.clone()),
            Setting::Dynamic(f) => f(ctx.clone()).await.map_err(into_config_error),
        }
    }
}

fn into_config_error(err: ProxyError) -> ProxyError {
    match err {
        err @ ProxyError::Config { .. } => err,
        other => ProxyError::config_error(format!("callback failed: {}", other)),
    }
}

/// Where a Connect filter gets its options from
#[derive(Clone)]
pub enum OptionsSource {
    /// Snapshot parsed once at configuration time
    Static(ConnectOptions),
    /// Callback returning an options object, overlaid on `base` per attempt
    Dynamic {
        base: ConnectOptions,
        eval: Evaluator<Value>,
    },
}

impl OptionsSource {
    pub fn dynamic<F, Fut>(base: ConnectOptions, f: F) -> Self
    where
        F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ProxyError>> + Send + 'static,
    {
        OptionsSource::Dynamic {
            base,
            eval: Arc::new(move |ctx| f(ctx).boxed()),
        }
    }

    /// Resolve the snapshot for one connection attempt
    pub async fn resolve(&self, ctx: &Arc<Context>) -> Result<ConnectOptions, ProxyError> {
        match self {
            OptionsSource::Static(options) => Ok(options.clone()),
            OptionsSource::Dynamic { base, eval } => {
                let value = eval(ctx.clone()).await.map_err(into_config_error)?;
                if !value.is_object() {
                    return Err(ProxyError::config_error(
                        "callback did not return an object for options",
                    ));
                }
                Ok(base.clone().merge_value(&value)?)
            }
        }
    }
}

impl Default for OptionsSource {
    fn default() -> Self {
        OptionsSource::Static(ConnectOptions::default())
    }
}

impl fmt::Debug for OptionsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionsSource::Static(options) => f.debug_tuple("Static").field(options).finish(),
            OptionsSource::Dynamic { base, .. } => f.debug_struct("Dynamic").field("base", base).finish(),
        }
    }
}

/// Resolve the bind setting of `options`; `null` means "no bind"
pub async fn resolve_bind(
    options: &ConnectOptions,
    ctx: &Arc<Context>,
) -> Result<Option<String>, ProxyError> {
    let Some(setting) = &options.bind else {
        return Ok(None);
    };
    match setting.resolve(ctx).await? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        _ => Err(ProxyError::config_error("bind expected to be or return a string")),
    }
}
