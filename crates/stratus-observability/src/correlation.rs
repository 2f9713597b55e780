//! Correlation context propagation
//!
//! Every logical request gets a correlation context at the edge; every unit
//! of work spawned for it inherits a child context. Contexts travel across
//! process boundaries via W3C `traceparent` plus the `X-Correlation-ID`
//! family of headers, and are kept in a bounded process-wide store for the
//! correlation-chain lookup endpoint.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::propagation::{self, TraceParent, FLAG_SAMPLED, TRACEPARENT, TRACESTATE};

/// How the work unit carrying this context entered the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Http,
    WebSocket,
    AsyncTask,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Http => "http",
            RequestType::WebSocket => "websocket",
            RequestType::AsyncTask => "async_task",
        }
    }
}

/// Correlation context carried by every request and spawned task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationContext {
    pub correlation_id: String,
    pub trace_id: String,
    pub span_id: String,
    pub trace_flags: u8,
    pub user_id: Option<String>,
    pub request_type: RequestType,
    pub parent_correlation_id: Option<String>,
    pub session_id: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

fn new_correlation_id() -> String {
    format!("corr_{}", &Uuid::new_v4().simple().to_string()[..16])
}

impl CorrelationContext {
    /// Mint a fresh root context
    pub fn root(request_type: RequestType) -> Self {
        Self {
            correlation_id: new_correlation_id(),
            trace_id: propagation::new_trace_id(),
            span_id: propagation::new_span_id(),
            trace_flags: 0,
            user_id: None,
            request_type,
            parent_correlation_id: None,
            session_id: None,
            client_ip: None,
            user_agent: None,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Build a context from inbound request headers (lowercased keys).
    ///
    /// Missing or malformed identifiers are replaced with freshly generated
    /// ones; extraction never fails.
    pub fn extract(headers: &HashMap<String, String>) -> Self {
        let trace = headers.get(TRACEPARENT).and_then(|v| TraceParent::parse(v));

        let correlation_id = headers
            .get("x-correlation-id")
            .or_else(|| headers.get("x-request-id"))
            .cloned()
            .unwrap_or_else(new_correlation_id);

        let (trace_id, span_id, trace_flags) = match trace {
            Some(tp) => (tp.trace_id, tp.span_id, tp.flags),
            None => (propagation::new_trace_id(), propagation::new_span_id(), 0),
        };

        let mut metadata = HashMap::new();
        if let Some(state) = headers.get(TRACESTATE) {
            metadata.insert(TRACESTATE.to_string(), state.clone());
        }

        Self {
            correlation_id,
            trace_id,
            span_id,
            trace_flags,
            user_id: headers.get("x-user-id").cloned(),
            request_type: RequestType::Http,
            parent_correlation_id: headers.get("x-parent-correlation-id").cloned(),
            session_id: headers.get("x-session-id").cloned(),
            client_ip: None,
            user_agent: headers.get("user-agent").cloned(),
            created_at: Utc::now(),
            metadata,
        }
    }

    /// Write correlation and W3C trace headers into an outbound header map
    pub fn inject(&self, headers: &mut HashMap<String, String>) {
        headers.insert("x-correlation-id".to_string(), self.correlation_id.clone());
        headers.insert("x-trace-id".to_string(), self.trace_id.clone());
        headers.insert("x-request-type".to_string(), self.request_type.as_str().to_string());
        if let Some(user_id) = &self.user_id {
            headers.insert("x-user-id".to_string(), user_id.clone());
        }
        if let Some(session_id) = &self.session_id {
            headers.insert("x-session-id".to_string(), session_id.clone());
        }
        if let Some(parent) = &self.parent_correlation_id {
            headers.insert("x-parent-correlation-id".to_string(), parent.clone());
        }

        let traceparent = TraceParent {
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
            flags: self.trace_flags,
        };
        headers.insert(TRACEPARENT.to_string(), traceparent.format());
        if let Some(state) = self.metadata.get(TRACESTATE) {
            headers.insert(TRACESTATE.to_string(), state.clone());
        }
    }

    /// Derive a child context for a spawned unit of work.
    ///
    /// The child keeps the trace id, gets a fresh correlation and span id,
    /// and records this context as its parent.
    pub fn child(&self, operation: &str) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("operation".to_string(), operation.to_string());
        metadata.insert("parent_type".to_string(), self.request_type.as_str().to_string());
        if let Some(state) = self.metadata.get(TRACESTATE) {
            metadata.insert(TRACESTATE.to_string(), state.clone());
        }

        Self {
            correlation_id: new_correlation_id(),
            trace_id: self.trace_id.clone(),
            span_id: propagation::new_span_id(),
            trace_flags: self.trace_flags,
            user_id: self.user_id.clone(),
            request_type: RequestType::AsyncTask,
            parent_correlation_id: Some(self.correlation_id.clone()),
            session_id: self.session_id.clone(),
            client_ip: self.client_ip.clone(),
            user_agent: self.user_agent.clone(),
            created_at: Utc::now(),
            metadata,
        }
    }

    pub fn sampled(&self) -> bool {
        self.trace_flags & FLAG_SAMPLED != 0
    }

    pub fn mark_sampled(&mut self) {
        self.trace_flags |= FLAG_SAMPLED;
    }
}

tokio::task_local! {
    static CURRENT_CONTEXT: CorrelationContext;
}

/// Run a future with `ctx` as the ambient correlation context
pub async fn with_context<F>(ctx: CorrelationContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_CONTEXT.scope(ctx, fut).await
}

/// Fetch the ambient correlation context, if any.
///
/// Work running without one is permitted but logs as orphaned.
pub fn current_context() -> Option<CorrelationContext> {
    CURRENT_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

struct StoredContext {
    context: CorrelationContext,
    last_access: Instant,
}

/// Bounded process-wide store of correlation contexts.
///
/// Capacity 10k with one-hour TTL by default. Insertion never blocks the
/// request path; on overflow the oldest entry is evicted synchronously.
pub struct CorrelationStore {
    inner: RwLock<HashMap<String, StoredContext>>,
    max_size: usize,
    ttl: Duration,
}

impl Default for CorrelationStore {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(3600))
    }
}

impl CorrelationStore {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self { inner: RwLock::new(HashMap::new()), max_size, ttl }
    }

    pub fn store(&self, context: CorrelationContext) {
        let mut inner = self.inner.write();
        if inner.len() >= self.max_size && !inner.contains_key(&context.correlation_id) {
            // Evict the least recently touched entry to stay bounded.
            if let Some(oldest) = inner
                .iter()
                .min_by_key(|(_, stored)| stored.last_access)
                .map(|(id, _)| id.clone())
            {
                inner.remove(&oldest);
            }
        }
        inner.insert(
            context.correlation_id.clone(),
            StoredContext { context, last_access: Instant::now() },
        );
    }

    pub fn get(&self, correlation_id: &str) -> Option<CorrelationContext> {
        let mut inner = self.inner.write();
        let stored = inner.get_mut(correlation_id)?;
        if stored.last_access.elapsed() > self.ttl {
            inner.remove(correlation_id);
            return None;
        }
        stored.last_access = Instant::now();
        Some(stored.context.clone())
    }

    /// All contexts recorded for a trace
    pub fn for_trace(&self, trace_id: &str) -> Vec<CorrelationContext> {
        let inner = self.inner.read();
        inner
            .values()
            .filter(|stored| stored.context.trace_id == trace_id)
            .map(|stored| stored.context.clone())
            .collect()
    }

    fn children_of(&self, correlation_id: &str) -> Vec<CorrelationContext> {
        let inner = self.inner.read();
        inner
            .values()
            .filter(|stored| {
                stored.context.parent_correlation_id.as_deref() == Some(correlation_id)
            })
            .map(|stored| stored.context.clone())
            .collect()
    }

    /// Full correlation chain: ancestors first, then the context, then children
    pub fn chain(&self, correlation_id: &str) -> Vec<CorrelationContext> {
        let Some(context) = self.get(correlation_id) else {
            return Vec::new();
        };

        let mut chain = vec![context.clone()];
        let mut cursor = context;
        while let Some(parent_id) = cursor.parent_correlation_id.clone() {
            match self.get(&parent_id) {
                Some(parent) => {
                    chain.insert(0, parent.clone());
                    cursor = parent;
                }
                None => break,
            }
        }
        chain.extend(self.children_of(correlation_id));
        chain
    }

    /// Drop expired entries; called opportunistically from a background task
    pub fn sweep(&self) {
        let mut inner = self.inner.write();
        inner.retain(|_, stored| stored.last_access.elapsed() <= self.ttl);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
