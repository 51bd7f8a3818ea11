//! The workflow orchestrator.
//!
//! Every admitted delivery becomes one workflow instance running the eight
//! activities in order: normalize, derive_facts, score_risk,
//! evaluate_policies, update_graph, recompute_owners, publish_portal,
//! record_slo_sample. Activities are idempotent; progress persists between
//! them so a restarted worker resumes a workflow instead of restarting it.
//!
//! Retries ride the stream's redelivery policy: a retryable failure nacks
//! the message and the backoff ladder takes over. Fatal failures are
//! annotated and moved to the dead-letter subject directly. Workflows for
//! the same `(repo, pr)` or `(repo, tag)` key run serially in stream order;
//! unrelated keys run in parallel across the worker pool.

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use gitguard_dedup::DedupStore;
use gitguard_graph::{GraphStore, OwnershipPatterns, is_constraint_violation};
use gitguard_metrics::{
    ACTIVITY_SECONDS, DOC_FRESH_SECONDS, EVENTS_TOTAL, FaultInjector, MetricsRegistry, SloMonitor,
    STREAM_CONSUMER_PENDING,
};
use gitguard_policy::PolicyEngine;
use gitguard_redact::Redactor;
use gitguard_stream::{Consumer, Delivery, Message, RedeliveryPolicy, Stream, dlq_subject};
use gitguard_types::{
    ChangeFacts, DeadLetter, Event, EventKind, EventPayload, GuardError, MaintenanceReport,
    NodeType, OwnersIndex, RelKind, RiskScore, WorkflowState,
};
use serde_json::{Value, json};

use crate::config::Config;
use crate::normalize::{Normalizer, NormalizerConfig};
use crate::portal::{FileSink, HttpSink, PortalPublisher, PortalSink};

/// Durable consumer driving the orchestrator.
pub const CONSUMER_NAME: &str = "CODEX";
/// Subject filter for admitted events. The stream hides `gh.dlq.*` from
/// consumers whose filter does not target the dead-letter hierarchy.
pub const EVENT_FILTER: &str = "gh.>";

/// Activity names, in execution order.
pub const ACTIVITIES: [&str; 8] = [
    "normalize",
    "derive_facts",
    "score_risk",
    "evaluate_policies",
    "update_graph",
    "recompute_owners",
    "publish_portal",
    "record_slo_sample",
];

/// Outcome of one workflow run.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome {
    Completed,
    /// Nothing to do (ping events, publishing disabled).
    Skipped(String),
}

/// Per-repo debounce for owners recomputation: triggers inside the window
/// coalesce into the run that already happened.
pub struct OwnersDebounce {
    window: Duration,
    last_run: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

impl OwnersDebounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_run: Mutex::new(BTreeMap::new()),
        }
    }

    /// True when the caller should recompute now; false when a recent run
    /// already covers this trigger.
    pub fn should_run(&self, repo: &str, now: DateTime<Utc>) -> bool {
        let mut last_run = self.last_run.lock().expect("debounce lock poisoned");
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero());
        match last_run.get(repo) {
            Some(last) if now - *last < window => false,
            _ => {
                last_run.insert(repo.to_string(), now);
                true
            }
        }
    }
}

/// Everything a workflow needs, assembled once per process.
pub struct Pipeline {
    pub config: Config,
    pub normalizer: Normalizer,
    pub policy: PolicyEngine,
    pub graph: GraphStore,
    pub dedup: DedupStore,
    pub stream: Stream,
    pub sink: Box<dyn PortalSink>,
    pub publisher: PortalPublisher,
    pub redactor: Arc<Redactor>,
    pub metrics: Arc<MetricsRegistry>,
    pub slo: SloMonitor,
    pub faults: FaultInjector,
    pub patterns: OwnershipPatterns,
    debounce: OwnersDebounce,
    owners_cache: Mutex<Option<OwnersIndex>>,
    state_dir: PathBuf,
}

impl Pipeline {
    /// Build the pipeline from configuration, opening every store.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let redactor = Arc::new(
            Redactor::with_extra_patterns(&config.redact_patterns)
                .context("invalid redact_patterns")?,
        );
        let normalizer = Normalizer::new(&NormalizerConfig {
            truncate_files_at: config.truncate_files_at,
            security_patterns: config.security_patterns.clone(),
        })?;
        let policy = PolicyEngine::load(&config.policy_bundle_dir)
            .context("failed to load policy bundle")?;
        let graph = GraphStore::open(&config.db_path)?;
        let dedup = DedupStore::open(&config.dedup_db_path)?;
        let stream = Stream::open(&config.stream_dir)?;
        let patterns = OwnershipPatterns::load(&config.ownership_patterns)?;

        let sink: Box<dyn PortalSink> = if config.sink_is_http() {
            Box::new(HttpSink::new(config.sink.target.clone(), config.sink.timeout)?)
        } else {
            Box::new(FileSink::new(config.sink.target.clone()))
        };
        let publisher = PortalPublisher::new(
            Arc::clone(&redactor),
            config.flags.mermaid_graphs_enabled,
            config.flags.policy_transparency_enabled,
        );

        Ok(Self {
            normalizer,
            policy,
            graph,
            dedup,
            stream,
            sink,
            publisher,
            redactor,
            metrics: Arc::new(MetricsRegistry::new()),
            slo: SloMonitor::default(),
            faults: FaultInjector::new(config.flags.chaos_hooks_enabled),
            patterns,
            debounce: OwnersDebounce::new(config.owners_debounce),
            owners_cache: Mutex::new(None),
            state_dir: config.state_dir.clone(),
            config,
        })
    }

    /// Same as [`Pipeline::new`] but with an explicit sink (tests, dry runs).
    pub fn with_sink(config: Config, sink: Box<dyn PortalSink>) -> Result<Self> {
        let mut pipeline = Self::new(config)?;
        pipeline.sink = sink;
        Ok(pipeline)
    }

    /// Bind the orchestrator's durable consumer.
    pub fn consumer(&self) -> Result<Consumer> {
        self.stream
            .durable_consumer(CONSUMER_NAME, EVENT_FILTER, RedeliveryPolicy::default())
    }

    /// Latest derived owners index, recomputing if never built.
    pub fn owners_index(&self) -> Result<OwnersIndex> {
        let cached = self.owners_cache.lock().expect("owners lock poisoned").clone();
        match cached {
            Some(index) => Ok(index),
            None => {
                let index = self.graph.derive_owners(&self.patterns, Utc::now())?;
                *self.owners_cache.lock().expect("owners lock poisoned") = Some(index.clone());
                Ok(index)
            }
        }
    }

    /// Execute one workflow for a pulled message.
    pub fn process_message(&self, message: &Message) -> Result<WorkflowOutcome, GuardError> {
        let delivery_id = message
            .payload
            .get("delivery_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let received_at: DateTime<Utc> = message
            .payload
            .get("received_at")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(message.published_at);

        let mut state = self.load_state(&delivery_id, message.seq);
        let workflow_started = Instant::now();

        // Activity 1: normalize.
        let event: Event = match state.artifact("normalize") {
            Some(event) => event,
            None => {
                self.check_deadline(received_at)?;
                let event = self.activity("normalize", &delivery_id, || {
                    let kind: EventKind = message
                        .payload
                        .get("kind")
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| GuardError::InputMalformed("unknown event kind".into()))?;
                    let action = message
                        .payload
                        .get("action")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let raw = message
                        .payload
                        .get("raw")
                        .ok_or_else(|| GuardError::InputMalformed("missing raw payload".into()))?;
                    self.normalizer.normalize(kind, action, raw, received_at)
                })?;
                state.workflow_key = event.workflow_key();
                state.complete("normalize", &event)?;
                self.save_state(&state);
                event
            }
        };

        if matches!(event.payload, EventPayload::Ping {}) {
            self.clear_state(&delivery_id);
            return Ok(WorkflowOutcome::Skipped("ping".to_string()));
        }

        // Activity 2: derive_facts.
        let facts: ChangeFacts = match state.artifact("derive_facts") {
            Some(facts) => facts,
            None => {
                self.check_deadline(received_at)?;
                let facts = self.activity("derive_facts", &delivery_id, || {
                    Ok(self.normalizer.derive_facts(&event))
                })?;
                state.complete("derive_facts", &facts)?;
                self.save_state(&state);
                facts
            }
        };

        // Activity 3: score_risk.
        let score: RiskScore = match state.artifact("score_risk") {
            Some(score) => score,
            None => {
                self.check_deadline(received_at)?;
                let score = self.activity("score_risk", &delivery_id, || {
                    Ok(gitguard_risk::score(&facts, &self.config.risk))
                })?;
                state.complete("score_risk", &score)?;
                self.save_state(&state);
                score
            }
        };

        // Activity 4: evaluate_policies.
        let decision: gitguard_types::PolicyDecision = match state.artifact("evaluate_policies") {
            Some(decision) => decision,
            None => {
                self.check_deadline(received_at)?;
                let input = self.policy_input(&event, &facts, &score, received_at);
                let decision = self.activity("evaluate_policies", &delivery_id, || {
                    Ok(self.policy.evaluate(&input))
                })?;
                state.complete("evaluate_policies", &decision)?;
                self.save_state(&state);
                decision
            }
        };

        // Activity 5: update_graph.
        let touched: Vec<(NodeType, String)> = match state.artifact("update_graph") {
            Some(touched) => touched,
            None => {
                self.check_deadline(received_at)?;
                let touched = self.activity("update_graph", &delivery_id, || {
                    self.update_graph(&event, &facts, &decision).map_err(|e| {
                        if is_constraint_violation(&e) {
                            GuardError::GraphConsistency(e.to_string())
                        } else {
                            GuardError::Transient(e.to_string())
                        }
                    })
                })?;
                state.complete("update_graph", &touched)?;
                self.save_state(&state);
                touched
            }
        };

        // Activity 6: recompute_owners (debounced per repo).
        if state.artifact::<bool>("recompute_owners").is_none() {
            self.check_deadline(received_at)?;
            let repo = event.repo.full_name();
            self.activity("recompute_owners", &delivery_id, || {
                if self.debounce.should_run(&repo, Utc::now()) {
                    let index = self
                        .graph
                        .derive_owners(&self.patterns, Utc::now())
                        .map_err(|e| GuardError::Transient(e.to_string()))?;
                    *self.owners_cache.lock().expect("owners lock poisoned") = Some(index);
                }
                Ok(())
            })?;
            state.complete("recompute_owners", &true)?;
            self.save_state(&state);
        }

        // Activity 7: publish_portal.
        if state.artifact::<bool>("publish_portal").is_none() {
            self.check_deadline(received_at)?;
            if self.config.flags.core_publish_enabled {
                self.activity("publish_portal", &delivery_id, || {
                    self.publish_portal(&event, &facts, &score, &decision, &delivery_id)
                        .map_err(|e| match e.downcast::<GuardError>() {
                            Ok(guard) => guard,
                            Err(other) => GuardError::SinkUnavailable(other.to_string()),
                        })
                })?;
            }
            state.complete("publish_portal", &true)?;
            self.save_state(&state);
        }

        // Activity 8: record_slo_sample.
        let publish_completed_at = Utc::now();
        let fresh_seconds = (publish_completed_at - received_at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        if self.config.flags.slo_monitoring_enabled {
            self.slo.record(publish_completed_at, fresh_seconds);
            self.metrics.observe(DOC_FRESH_SECONDS, &[], fresh_seconds);
        }

        tracing::info!(
            delivery_id = %delivery_id,
            workflow_key = %state.workflow_key,
            elapsed_ms = workflow_started.elapsed().as_millis() as u64,
            fresh_seconds,
            "workflow completed"
        );
        self.clear_state(&delivery_id);
        Ok(WorkflowOutcome::Completed)
    }

    /// Wrap an activity: chaos fault check, timing, timeout accounting.
    fn activity<T>(
        &self,
        name: &str,
        delivery_id: &str,
        f: impl FnOnce() -> Result<T, GuardError>,
    ) -> Result<T, GuardError> {
        if self.faults.take(name, delivery_id) {
            self.metrics
                .inc_counter(gitguard_metrics::CHAOS_DRILL_TOTAL, &[], 1.0);
            return Err(GuardError::Transient(format!(
                "fault injected at {}",
                name
            )));
        }

        let timeout = if name == "publish_portal" {
            self.config.publish_timeout
        } else {
            self.config.activity_timeout
        };
        let started = Instant::now();
        let result = f();
        let elapsed = started.elapsed();
        self.metrics
            .observe(ACTIVITY_SECONDS, &[("name", name)], elapsed.as_secs_f64());
        if elapsed > timeout {
            tracing::warn!(
                activity = name,
                elapsed_ms = elapsed.as_millis() as u64,
                timeout_ms = timeout.as_millis() as u64,
                "activity exceeded its timeout"
            );
            if result.is_ok() {
                // The work finished but past its budget; treat as transient
                // so redelivery gets a fresh, faster attempt.
                return Err(GuardError::Transient(format!(
                    "activity {} timed out",
                    name
                )));
            }
        }
        result
    }

    fn check_deadline(&self, received_at: DateTime<Utc>) -> Result<(), GuardError> {
        let deadline = chrono::Duration::from_std(self.config.workflow_deadline)
            .unwrap_or(chrono::Duration::zero());
        if Utc::now() - received_at > deadline {
            return Err(GuardError::Fatal("workflow deadline exceeded".into()));
        }
        Ok(())
    }

    /// Build the policy input document. `now` is split ahead of time so the
    /// engine stays clock-free; weekday/hour are in the configured zone.
    pub fn policy_input(
        &self,
        event: &Event,
        facts: &ChangeFacts,
        score: &RiskScore,
        now: DateTime<Utc>,
    ) -> Value {
        let offset = chrono::FixedOffset::east_opt(self.config.utc_offset_minutes * 60)
            .unwrap_or_else(|| chrono::FixedOffset::east_opt(0).expect("zero offset"));
        let local = now.with_timezone(&offset);

        let (pr, approvals, files, checks) = match &event.payload {
            EventPayload::PullRequest {
                number,
                title,
                approvals,
                files,
                checks,
                ..
            } => (
                json!({"number": number, "title": title, "lines_changed": facts.lines_changed}),
                json!(approvals),
                json!(files),
                json!(checks
                    .iter()
                    .map(|c| json!({"name": c.name, "passed": c.passed}))
                    .collect::<Vec<_>>()),
            ),
            _ => (Value::Null, json!([]), json!([]), json!([])),
        };

        let tag = event.release_tag().map(Value::from).unwrap_or(Value::Null);
        let push = match &event.payload {
            EventPayload::Push {
                git_ref,
                head_sha,
                commit_count,
            } => json!({"ref": git_ref, "head_sha": head_sha, "commit_count": commit_count}),
            _ => Value::Null,
        };

        json!({
            "action": event.action,
            "pr": pr,
            "repo": {
                "owner": event.repo.owner,
                "name": event.repo.name,
                "full_name": event.repo.full_name(),
            },
            "actor": event.actor,
            "tag": tag,
            "push": push,
            "approvals": approvals,
            "files": files,
            "checks": checks,
            "now": {
                "rfc3339": local.to_rfc3339(),
                "weekday": local.format("%a").to_string(),
                "hour": local.hour(),
                "tz": self.config.timezone,
            },
            "score": {"value": score.value, "breakdown": score.breakdown},
            "facts": serde_json::to_value(facts).unwrap_or(Value::Null),
            "thresholds": {
                "auto_merge": self.config.thresholds.auto_merge,
                "require_review": self.config.thresholds.require_review,
                "block": self.config.thresholds.block,
            },
        })
    }

    /// Upsert the event's neighborhood into the knowledge graph. Returns the
    /// `(ntype, nkey)` pairs touched.
    fn update_graph(
        &self,
        event: &Event,
        facts: &ChangeFacts,
        decision: &gitguard_types::PolicyDecision,
    ) -> Result<Vec<(NodeType, String)>> {
        let mut touched = Vec::new();
        let repo = event.repo.full_name();

        let actor_id = self
            .graph
            .upsert_node(NodeType::Owner, &event.actor, &event.actor, json!({}))?;
        touched.push((NodeType::Owner, event.actor.clone()));

        match &event.payload {
            EventPayload::PullRequest { number, title, .. } => {
                let pr_key = format!("{}#{}", repo, number);
                let pr_id = self.graph.upsert_node(
                    NodeType::Pr,
                    &pr_key,
                    title,
                    json!({
                        "number": number,
                        "repo": repo,
                        "risk": facts.size_category.as_str(),
                        "allow": decision.allow,
                    }),
                )?;
                touched.push((NodeType::Pr, pr_key.clone()));
                self.graph
                    .upsert_edge(actor_id, pr_id, RelKind::Authored, json!({}))?;

                for file in &facts.files_touched {
                    let file_id =
                        self.graph
                            .upsert_node(NodeType::File, file, file, json!({}))?;
                    touched.push((NodeType::File, file.clone()));
                    self.graph
                        .upsert_edge(pr_id, file_id, RelKind::Touches, json!({}))?;
                }

                for receipt in decision.receipts.iter().filter(|r| r.fired) {
                    let policy_id = self.graph.upsert_node(
                        NodeType::Policy,
                        &receipt.rule_name,
                        &receipt.rule_name,
                        json!({"source": receipt.source_snippet}),
                    )?;
                    touched.push((NodeType::Policy, receipt.rule_name.clone()));
                    self.graph
                        .upsert_edge(pr_id, policy_id, RelKind::GovernedBy, json!({}))?;
                }
            }
            EventPayload::Release { tag, prerelease } => {
                let release_key = format!("{}@{}", repo, tag);
                let release_id = self.graph.upsert_node(
                    NodeType::Release,
                    &release_key,
                    tag,
                    json!({"prerelease": prerelease, "allow": decision.allow}),
                )?;
                touched.push((NodeType::Release, release_key));
                self.graph
                    .upsert_edge(actor_id, release_id, RelKind::Authored, json!({}))?;
            }
            EventPayload::Push { head_sha, .. } => {
                if !head_sha.is_empty() {
                    let commit_id = self.graph.upsert_node(
                        NodeType::Commit,
                        head_sha,
                        head_sha,
                        json!({"repo": repo}),
                    )?;
                    touched.push((NodeType::Commit, head_sha.clone()));
                    self.graph
                        .upsert_edge(actor_id, commit_id, RelKind::Authored, json!({}))?;
                }
            }
            _ => {}
        }

        Ok(touched)
    }

    /// Assemble and emit the portal pages for this event.
    fn publish_portal(
        &self,
        event: &Event,
        facts: &ChangeFacts,
        score: &RiskScore,
        decision: &gitguard_types::PolicyDecision,
        delivery_id: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let sample_id = format!("fs-{}", delivery_id);

        if let Some(number) = event.pr_number() {
            let pr_key = format!("{}#{}", event.repo.full_name(), number);
            let (nodes, edges) = match self.graph.get_node(NodeType::Pr, &pr_key)? {
                Some(pr_node) => self.graph.neighbors(pr_node.id, None, 2, Some(20))?,
                None => (Vec::new(), Vec::new()),
            };
            let digest =
                self.publisher
                    .pr_digest(event, facts, score, decision, &nodes, &edges, now, &sample_id);
            self.write_page(&digest)?;
        }

        let owners = self.owners_index()?;
        let owners_page = self.publisher.owners_page(&owners, now, &sample_id);
        self.write_page(&owners_page)?;

        let recent = self.recent_digests(now)?;
        let index_page = self.publisher.index_page(&recent, now, &sample_id);
        self.write_page(&index_page)?;

        Ok(())
    }

    fn write_page(&self, page: &gitguard_types::PortalPage) -> Result<()> {
        let metadata = json!({
            "kind": page.kind,
            "generated_at": page.generated_at.to_rfc3339(),
            "freshness_sample_id": page.freshness_sample_id,
        });
        self.sink
            .write(&page.key, &page.body_markdown, &page.attachments, &metadata)?;
        self.graph
            .record_page(&page.key, page.generated_at, &page.freshness_sample_id)?;
        Ok(())
    }

    fn recent_digests(&self, now: DateTime<Utc>) -> Result<Vec<(String, DateTime<Utc>)>> {
        // Catalog keys newer than the compaction horizon, PR pages only.
        let stale = self.graph.pages_older_than(now)?;
        Ok(stale
            .into_iter()
            .filter(|key| key.starts_with("prs/"))
            .map(|key| (key, now))
            .collect())
    }

    // -- workflow state persistence -----------------------------------------

    fn state_path(&self, delivery_id: &str) -> PathBuf {
        let safe: String = delivery_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.state_dir.join(format!("{}.json", safe))
    }

    fn load_state(&self, delivery_id: &str, seq: u64) -> WorkflowState {
        let path = self.state_path(delivery_id);
        if let Ok(text) = std::fs::read_to_string(&path)
            && let Ok(state) = serde_json::from_str::<WorkflowState>(&text)
        {
            return state;
        }
        WorkflowState {
            workflow_key: String::new(),
            delivery_id: delivery_id.to_string(),
            stream_seq: seq,
            completed: Vec::new(),
            artifacts: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    fn save_state(&self, state: &WorkflowState) {
        let path = self.state_path(&state.delivery_id);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        // Best-effort: losing workflow state costs a re-run of idempotent
        // activities, never correctness.
        if let Ok(text) = serde_json::to_string_pretty(state) {
            let _ = std::fs::write(&path, text);
        }
    }

    fn clear_state(&self, delivery_id: &str) {
        let _ = std::fs::remove_file(self.state_path(delivery_id));
    }

    // -- maintenance --------------------------------------------------------

    /// One scheduled maintenance pass: dedup prune, portal compaction,
    /// governed_by vacuum, stream retention.
    pub fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let now = Utc::now();
        let pruned_deliveries = self.dedup.prune(self.config.dedup_retention)?;

        let page_cutoff = now
            - chrono::Duration::from_std(self.config.page_max_age)
                .unwrap_or(chrono::Duration::zero());
        let stale_pages = self.graph.pages_older_than(page_cutoff)?;
        let compacted_pages = stale_pages.len() as u64;
        for key in &stale_pages {
            self.graph.forget_page(key)?;
        }

        let active_rules: Vec<String> = self
            .policy
            .snapshot()
            .rules
            .iter()
            .map(|r| r.name.clone())
            .collect();
        let vacuumed_edges = self.graph.vacuum_governed_by(&active_rules)?;

        let pruned_stream_msgs = self
            .stream
            .enforce_retention(&self.config.stream_retention.to_policy(), now)?;

        let report = MaintenanceReport {
            pruned_deliveries,
            compacted_pages,
            vacuumed_edges,
            pruned_stream_msgs,
            ran_at: Some(now),
        };
        tracing::info!(?report, "maintenance pass completed");
        Ok(report)
    }
}

/// Handle one delivery end to end: run the workflow, then ack, nack, or
/// dead-letter. Returns the outcome for observability.
pub fn handle_delivery(
    pipeline: &Pipeline,
    consumer: &Consumer,
    delivery: &Delivery,
) -> Result<()> {
    let seq = delivery.message.seq;
    match pipeline.process_message(&delivery.message) {
        Ok(outcome) => {
            consumer.ack(seq)?;
            if matches!(outcome, WorkflowOutcome::Completed) {
                pipeline
                    .metrics
                    .inc_counter(EVENTS_TOTAL, &[("result", "ok")], 1.0);
                let delivery_id = delivery
                    .message
                    .payload
                    .get("delivery_id")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                if pipeline.faults.finish_drill(delivery_id) {
                    pipeline.metrics.inc_counter(
                        gitguard_metrics::CHAOS_DRILL_SUCCESS_TOTAL,
                        &[],
                        1.0,
                    );
                }
            }
        }
        Err(err) if err.is_dead_letter() => {
            let delivery_id = delivery
                .message
                .payload
                .get("delivery_id")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let dead = DeadLetter {
                reason: err.to_string(),
                delivery_id: delivery_id.to_string(),
                policy_version: pipeline.policy.version(),
                workflow_key: pipeline
                    .load_state(delivery_id, seq)
                    .workflow_key
                    .clone(),
                original: delivery.message.payload.clone(),
            };
            pipeline.stream.publish(
                &dlq_subject(&delivery.message.subject),
                serde_json::to_value(&dead).unwrap_or(Value::Null),
            )?;
            consumer.ack(seq)?;
            pipeline
                .metrics
                .inc_counter(EVENTS_TOTAL, &[("result", "dlq")], 1.0);
            pipeline.clear_state(delivery_id);
            tracing::error!(delivery_id, reason = %dead.reason, "event dead-lettered");
        }
        Err(err) => {
            pipeline
                .metrics
                .inc_counter(EVENTS_TOTAL, &[("result", "error")], 1.0);
            let outcome = consumer.nack(seq, &err.to_string(), Utc::now())?;
            tracing::warn!(seq, error = %err, ?outcome, "workflow attempt failed");
        }
    }
    pipeline.metrics.set_gauge(
        STREAM_CONSUMER_PENDING,
        &[("consumer", CONSUMER_NAME)],
        consumer.pending() as f64,
    );
    Ok(())
}

/// Drain every currently deliverable message, serially. Used by tests and
/// the one-shot CLI mode.
pub fn drain(pipeline: &Pipeline, consumer: &Consumer) -> Result<u32> {
    let mut processed = 0;
    while let Some(delivery) = consumer.pull(Utc::now())? {
        handle_delivery(pipeline, consumer, &delivery)?;
        processed += 1;
    }
    Ok(processed)
}

/// Run the worker pool until `shutdown` flips.
///
/// A dispatcher thread pulls deliveries and routes them to workers by
/// workflow-key hash, so identical keys land on the same worker in stream
/// order (per-key FIFO) while distinct keys spread across the pool.
pub fn run_workers(
    pipeline: Arc<Pipeline>,
    workers: usize,
    shutdown: Arc<AtomicBool>,
) -> Result<Vec<JoinHandle<()>>> {
    let workers = workers.max(1);
    let consumer = pipeline.consumer()?;
    let mut handles = Vec::with_capacity(workers + 1);
    let mut senders: Vec<SyncSender<Delivery>> = Vec::with_capacity(workers);

    for _ in 0..workers {
        let (tx, rx): (SyncSender<Delivery>, Receiver<Delivery>) = sync_channel(64);
        senders.push(tx);
        let pipeline = Arc::clone(&pipeline);
        let consumer = consumer.clone();
        handles.push(std::thread::spawn(move || {
            while let Ok(delivery) = rx.recv() {
                if let Err(err) = handle_delivery(&pipeline, &consumer, &delivery) {
                    tracing::error!(error = %err, "worker failed to settle delivery");
                }
            }
        }));
    }

    let dispatcher_shutdown = Arc::clone(&shutdown);
    handles.push(std::thread::spawn(move || {
        while !dispatcher_shutdown.load(Ordering::Relaxed) {
            match consumer.pull(Utc::now()) {
                Ok(Some(delivery)) => {
                    let key = routing_key(&delivery.message);
                    let mut hasher = DefaultHasher::new();
                    key.hash(&mut hasher);
                    let idx = (hasher.finish() % senders.len() as u64) as usize;
                    if senders[idx].send(delivery).is_err() {
                        break;
                    }
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(err) => {
                    tracing::error!(error = %err, "dispatcher pull failed");
                    std::thread::sleep(Duration::from_millis(500));
                }
            }
        }
        drop(senders);
    }));

    Ok(handles)
}

/// Best-effort workflow key straight from the raw payload, available before
/// normalization: repo plus PR number or tag.
fn routing_key(message: &Message) -> String {
    let raw = message.payload.get("raw").unwrap_or(&Value::Null);
    let repo = raw
        .pointer("/repository/owner/login")
        .and_then(Value::as_str)
        .map(|owner| {
            format!(
                "{}/{}",
                owner,
                raw.pointer("/repository/name").and_then(Value::as_str).unwrap_or("")
            )
        })
        .unwrap_or_default();
    if let Some(number) = raw.pointer("/pull_request/number").and_then(Value::as_u64) {
        format!("{}#pr{}", repo, number)
    } else if let Some(tag) = raw.pointer("/release/tag_name").and_then(Value::as_str) {
        format!("{}@{}", repo, tag)
    } else {
        repo
    }
}

/// Run scheduled maintenance every `interval` until `shutdown` flips.
pub fn run_scheduler(
    pipeline: Arc<Pipeline>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut last_run = Instant::now();
        while !shutdown.load(Ordering::Relaxed) {
            if last_run.elapsed() >= interval {
                if let Err(err) = pipeline.run_maintenance() {
                    tracing::error!(error = %err, "maintenance pass failed");
                }
                last_run = Instant::now();
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    })
}

trait StateExt {
    fn artifact<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T>;
    fn complete<T: serde::Serialize>(&mut self, name: &str, artifact: &T) -> Result<(), GuardError>;
}

impl StateExt for WorkflowState {
    fn artifact<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        if !self.completed.iter().any(|done| done == name) {
            return None;
        }
        self.artifacts
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    fn complete<T: serde::Serialize>(&mut self, name: &str, artifact: &T) -> Result<(), GuardError> {
        let value = serde_json::to_value(artifact)
            .map_err(|e| GuardError::Transient(format!("state serialization: {}", e)))?;
        self.artifacts.insert(name.to_string(), value);
        self.completed.push(name.to_string());
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owners_debounce_coalesces_within_window() {
        let debounce = OwnersDebounce::new(Duration::from_secs(10));
        let start = Utc::now();

        assert!(debounce.should_run("acme/widgets", start));
        assert!(!debounce.should_run("acme/widgets", start + chrono::Duration::seconds(3)));
        assert!(!debounce.should_run("acme/widgets", start + chrono::Duration::seconds(9)));
        assert!(debounce.should_run("acme/widgets", start + chrono::Duration::seconds(10)));
    }

    #[test]
    fn owners_debounce_is_per_repo() {
        let debounce = OwnersDebounce::new(Duration::from_secs(10));
        let now = Utc::now();
        assert!(debounce.should_run("acme/widgets", now));
        assert!(debounce.should_run("acme/gadgets", now));
    }

    #[test]
    fn routing_key_groups_by_pr() {
        let message = Message {
            seq: 1,
            subject: "gh.pull_request.opened".to_string(),
            published_at: Utc::now(),
            payload: json!({
                "raw": {
                    "repository": {"owner": {"login": "acme"}, "name": "widgets"},
                    "pull_request": {"number": 7},
                }
            }),
        };
        assert_eq!(routing_key(&message), "acme/widgets#pr7");
    }

    #[test]
    fn routing_key_groups_by_tag() {
        let message = Message {
            seq: 1,
            subject: "gh.release.published".to_string(),
            published_at: Utc::now(),
            payload: json!({
                "raw": {
                    "repository": {"owner": {"login": "acme"}, "name": "widgets"},
                    "release": {"tag_name": "v1.0.0"},
                }
            }),
        };
        assert_eq!(routing_key(&message), "acme/widgets@v1.0.0");
    }

    #[test]
    fn workflow_state_artifacts_round_trip() {
        let mut state = WorkflowState {
            workflow_key: "k".to_string(),
            delivery_id: "d-1".to_string(),
            stream_seq: 1,
            completed: Vec::new(),
            artifacts: BTreeMap::new(),
            updated_at: Utc::now(),
        };
        assert!(state.artifact::<ChangeFacts>("derive_facts").is_none());

        let facts = ChangeFacts::default();
        state.complete("derive_facts", &facts).expect("complete");
        let loaded: ChangeFacts = state.artifact("derive_facts").expect("present");
        assert_eq!(loaded, facts);
    }

    #[test]
    fn activities_are_ordered_as_specified() {
        assert_eq!(
            ACTIVITIES,
            [
                "normalize",
                "derive_facts",
                "score_risk",
                "evaluate_policies",
                "update_graph",
                "recompute_owners",
                "publish_portal",
                "record_slo_sample",
            ]
        );
    }
}
