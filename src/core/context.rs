//! The per-run carrier passed to every node invocation.
//!
//! Carries cancellation, a tracing span, an opaque parameter map, an
//! error-reporting sink, and concurrent-safe shared state.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::error::ConduitError;

/// Receives a summary of every terminal item-level failure the run
/// produces, regardless of whether it was recovered via retry/DLQ. Used
/// for cross-cutting observability; never in the hot item path itself.
///
/// Deliberately coarse — a run-wide tap, reached only through the
/// [`Context`], never a global singleton.
pub trait ErrorSink: Send + Sync {
    fn report(&self, node_id: &str, error: &ConduitError);
}

/// An [`ErrorSink`] that forwards everything to `tracing::error!`. The
/// default when a run doesn't configure one explicitly.
#[derive(Debug, Default)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, node_id: &str, error: &ConduitError) {
        tracing::error!(node_id, %error, "node reported a terminal failure");
    }
}

/// Concurrent-safe, type-erased key/value store shared across every node
/// in a run — e.g. a metrics collector a handful of nodes publish into.
/// Backed by an `RwLock<HashMap<..>>`.
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<RwLock<HashMap<String, (TypeId, Arc<dyn Any + Send + Sync>)>>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the value stored under `key`.
    pub async fn insert<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        let mut map = self.inner.write().await;
        map.insert(key.into(), (TypeId::of::<T>(), Arc::new(value)));
    }

    /// Fetches the value stored under `key`, if present and of type `T`.
    pub async fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let map = self.inner.read().await;
        let (type_id, value) = map.get(key)?;
        if *type_id != TypeId::of::<T>() {
            return None;
        }
        Arc::downcast::<T>(Arc::clone(value)).ok()
    }
}

/// Well-known, typed parameter read out of the opaque string-keyed map. See
/// [`crate::params`] for the well-known key constants.
#[derive(Debug, Clone, Default)]
pub struct Parameters {
    values: HashMap<String, Value>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Typed extraction with a default: deserialises the raw value if
    /// present and well-formed, else falls back to `default`.
    pub fn get_or<T: serde::de::DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(default)
    }

    /// Merges `other` over `self`; keys in `other` win. Used to layer a
    /// per-node parameter override on top of the run's defaults.
    pub fn layered_over(&self, other: &Parameters) -> Parameters {
        let mut merged = self.clone();
        for (k, v) in &other.values {
            merged.values.insert(k.clone(), v.clone());
        }
        merged
    }
}

/// The per-run value passed to every node invocation. Immutable in
/// structure once a run starts; `shared_state` is the only place further
/// mutation happens, and it is concurrency-safe by construction.
#[derive(Clone)]
pub struct Context {
    cancel: CancellationToken,
    parameters: Parameters,
    error_sink: Arc<dyn ErrorSink>,
    shared_state: SharedState,
    span: Span,
    node_id: Option<Arc<str>>,
}

impl Context {
    pub fn new(parameters: Parameters) -> Self {
        Self {
            cancel: CancellationToken::new(),
            parameters,
            error_sink: Arc::new(TracingErrorSink),
            shared_state: SharedState::new(),
            span: tracing::info_span!("conduit.run"),
            node_id: None,
        }
    }

    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Raises the run's shared cancellation signal. Cascades to every pipe
    /// a driver is currently awaiting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn error_sink(&self) -> &Arc<dyn ErrorSink> {
        &self.error_sink
    }

    pub fn shared_state(&self) -> &SharedState {
        &self.shared_state
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// The id of the node this context is scoped to, set by [`Context::for_node`].
    /// `None` for the run-level context.
    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    /// A child context scoped to one node, carrying parameters already
    /// layered with that node's overrides.
    pub fn for_node(&self, node_id: &str, overrides: Option<&Parameters>) -> Context {
        let parameters = match overrides {
            Some(over) => self.parameters.layered_over(over),
            None => self.parameters.clone(),
        };
        Context {
            cancel: self.cancel.clone(),
            parameters,
            error_sink: Arc::clone(&self.error_sink),
            shared_state: self.shared_state.clone(),
            span: tracing::info_span!(parent: &self.span, "conduit.node", node_id),
            node_id: Some(Arc::from(node_id)),
        }
    }
}
