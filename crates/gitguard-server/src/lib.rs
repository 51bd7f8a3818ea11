//! HTTP surfaces for GitGuard: the webhook ingress gateway and the
//! read-only graph query API.
//!
//! Both are thin layers over [`gitguard::Pipeline`]. Ingress owns the raw
//! request until the signature verifies; after the stream publish is
//! acknowledged the request is done, and everything else happens in the
//! workflow. The graph API never writes.

pub mod api;
pub mod ingress;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use gitguard::Pipeline;
use gitguard_stream::Consumer;
use serde_json::Value;

/// Shared state behind both routers.
pub struct ServerState {
    pub pipeline: Arc<Pipeline>,
    pub consumer: Consumer,
    /// Last-good responses served with `X-Stale: true` when the graph store
    /// is unavailable.
    last_good: Mutex<HashMap<String, Value>>,
}

impl ServerState {
    pub fn new(pipeline: Arc<Pipeline>) -> Result<Self> {
        let consumer = pipeline.consumer()?;
        Ok(Self {
            pipeline,
            consumer,
            last_good: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn remember(&self, key: &str, value: &Value) {
        self.last_good
            .lock()
            .expect("cache lock poisoned")
            .insert(key.to_string(), value.clone());
    }

    pub(crate) fn recall(&self, key: &str) -> Option<Value> {
        self.last_good
            .lock()
            .expect("cache lock poisoned")
            .get(key)
            .cloned()
    }
}

/// Serve the ingress gateway until the task is cancelled.
pub async fn run_ingress(state: Arc<ServerState>, bind: &str) -> Result<()> {
    let app = ingress::router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind ingress on {}", bind))?;
    tracing::info!(%bind, "ingress gateway listening");
    axum::serve(listener, app).await.context("ingress server failed")
}

/// Serve the graph API until the task is cancelled.
pub async fn run_api(state: Arc<ServerState>, bind: &str) -> Result<()> {
    let app = api::router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind graph api on {}", bind))?;
    tracing::info!(%bind, "graph api listening");
    axum::serve(listener, app).await.context("graph api server failed")
}
