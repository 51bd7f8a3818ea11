//! # GitGuard
//!
//! An autonomous repository steward: it admits signed Git-host webhooks,
//! scores every change for risk, evaluates declarative governance policies,
//! maintains a knowledge graph, and publishes a self-explaining portal of
//! PR digests, relationship graphs, and an owners index.
//!
//! ## Pipeline
//!
//! The flow is **ingress → dedup → stream → workflow → portal**:
//!
//! 1. The ingress gateway verifies the webhook signature, reserves the
//!    delivery id in the dedup ledger, and publishes the raw event to the
//!    durable stream on `gh.<kind>.<action>`.
//! 2. The `CODEX` consumer drives one workflow per delivery through eight
//!    ordered, idempotent activities: normalize, derive_facts, score_risk,
//!    evaluate_policies, update_graph, recompute_owners, publish_portal,
//!    record_slo_sample.
//! 3. Failures retry on the stream's bounded backoff ladder; events that
//!    exhaust retries or violate graph constraints move to `gh.dlq.*` with
//!    the failure reason attached.
//!
//! Every policy evaluation returns receipts: the verbatim rule source and
//! the exact input fields each rule read. Every emitted string passes the
//! secret redactor last.
//!
//! ## Key types
//!
//! - `Event` / `ChangeFacts` / `RiskScore` / `PolicyDecision` — the record
//!   types flowing through a workflow (re-exported from `gitguard-types`)
//! - [`workflow::Pipeline`] — everything a workflow needs, built once from
//!   [`config::Config`]
//! - [`portal::PortalSink`] — the pluggable page output contract
//!
//! ## Modules
//!
//! - [`config`] — `gitguard.toml` loading, env overrides, validation
//! - [`normalize`] — host payloads into canonical events and change facts
//! - [`workflow`] — the orchestrator: activities, worker pool, maintenance
//! - [`portal`] — digest/owners/index rendering and output sinks

pub mod config;
pub mod normalize;
pub mod portal;
pub mod workflow;

pub use config::Config;
pub use normalize::{Normalizer, NormalizerConfig};
pub use portal::{FileSink, HttpSink, MemorySink, PortalPublisher, PortalSink};
pub use workflow::{
    ACTIVITIES, CONSUMER_NAME, EVENT_FILTER, Pipeline, WorkflowOutcome, drain, handle_delivery,
    run_scheduler, run_workers,
};

pub use gitguard_types as types;
