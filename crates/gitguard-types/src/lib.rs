//! # Types
//!
//! Core domain types for GitGuard, shared by every stage of the pipeline:
//!
//! - [`Event`] - A normalized Git-host event, immutable once admitted
//! - [`ChangeFacts`] - Numeric/boolean summary of a change, derived from an event
//! - [`RiskScore`] - Transparent weighted risk with a per-factor breakdown
//! - [`PolicyDecision`] - Allow/deny verdict plus per-rule receipts
//! - [`KgNode`] / [`KgEdge`] - Knowledge-graph rows
//! - [`PortalPage`] - A rendered portal page ready for the output sink
//! - [`GuardError`] - The error taxonomy shared by ingress and the workflow
//!
//! ## Serialization
//!
//! Every persisted type implements `Serialize`/`Deserialize`. Timestamps are
//! RFC 3339 via `chrono`. Enums that cross a storage or wire boundary carry
//! explicit string forms (`as_str`/`FromStr`) so rows stay readable.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A repository reference: `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoRef {
    /// Repository owner (user or organization).
    pub owner: String,
    /// Repository name.
    pub name: String,
}

impl RepoRef {
    /// Create a repo reference from owner and name.
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// The `owner/name` form used in page keys and workflow keys.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Kinds of host events the pipeline admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PullRequest,
    Push,
    Review,
    CheckRun,
    Release,
    Ping,
}

impl EventKind {
    /// Stable string form, used in stream subjects and the dedup ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PullRequest => "pull_request",
            EventKind::Push => "push",
            EventKind::Review => "review",
            EventKind::CheckRun => "check_run",
            EventKind::Release => "release",
            EventKind::Ping => "ping",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pull_request" => Ok(EventKind::PullRequest),
            "push" => Ok(EventKind::Push),
            "review" => Ok(EventKind::Review),
            "check_run" => Ok(EventKind::CheckRun),
            "release" => Ok(EventKind::Release),
            "ping" => Ok(EventKind::Ping),
            _ => Err(()),
        }
    }
}

/// Outcome of a CI check attached to a pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check name as reported by the host.
    pub name: String,
    /// Whether the check concluded successfully.
    pub passed: bool,
}

/// Kind-specific payload of a normalized event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    PullRequest {
        number: u64,
        title: String,
        lines_added: u64,
        lines_deleted: u64,
        /// Changed file paths, possibly truncated at the configured bound.
        files: Vec<String>,
        /// Coverage change in absolute fraction (e.g. -0.05 = five points lost).
        coverage_delta: f64,
        /// Performance change; positive means a regression.
        perf_delta: f64,
        new_tests: bool,
        /// Failing-rubric item counts from the host's quality checks.
        rubric_failures: Vec<u32>,
        /// Reviewers who approved the change.
        approvals: Vec<String>,
        checks: Vec<CheckResult>,
        /// Leading diff lines kept for security-pattern scanning.
        diff_lines: Vec<String>,
    },
    Push {
        git_ref: String,
        head_sha: String,
        commit_count: u64,
    },
    Review {
        number: u64,
        state: String,
        reviewer: String,
    },
    CheckRun {
        name: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        conclusion: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        number: Option<u64>,
    },
    Release {
        tag: String,
        prerelease: bool,
    },
    Ping {},
}

/// A normalized Git-host event. Immutable once admitted to the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    /// Host action qualifier (`opened`, `synchronize`, `published`, ...).
    pub action: String,
    pub repo: RepoRef,
    pub actor: String,
    pub created_at: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    /// The pull-request number carried by this event, if any.
    pub fn pr_number(&self) -> Option<u64> {
        match &self.payload {
            EventPayload::PullRequest { number, .. } => Some(*number),
            EventPayload::Review { number, .. } => Some(*number),
            EventPayload::CheckRun { number, .. } => *number,
            _ => None,
        }
    }

    /// The release tag carried by this event, if any.
    pub fn release_tag(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Release { tag, .. } => Some(tag),
            _ => None,
        }
    }

    /// Serialization key for per-key FIFO ordering: events that share a key
    /// execute serially, everything else runs in parallel.
    pub fn workflow_key(&self) -> String {
        if let Some(n) = self.pr_number() {
            format!("{}#pr{}", self.repo.full_name(), n)
        } else if let Some(tag) = self.release_tag() {
            format!("{}@{}", self.repo.full_name(), tag)
        } else {
            self.repo.full_name()
        }
    }
}

/// Conventional-commit change classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Docs,
    /// Fallback for unknown or missing prefixes.
    #[default]
    Chore,
    Fix,
    Feat,
    Refactor,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Docs => "docs",
            ChangeType::Chore => "chore",
            ChangeType::Fix => "fix",
            ChangeType::Feat => "feat",
            ChangeType::Refactor => "refactor",
        }
    }
}

/// T-shirt sizing derived from `lines_changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeCategory {
    XS,
    S,
    M,
    L,
    XL,
}

impl SizeCategory {
    /// Classify a line count: XS<20, S<80, M<250, L<800, else XL.
    pub fn from_lines(lines_changed: u64) -> Self {
        match lines_changed {
            0..20 => SizeCategory::XS,
            20..80 => SizeCategory::S,
            80..250 => SizeCategory::M,
            250..800 => SizeCategory::L,
            _ => SizeCategory::XL,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SizeCategory::XS => "XS",
            SizeCategory::S => "S",
            SizeCategory::M => "M",
            SizeCategory::L => "L",
            SizeCategory::XL => "XL",
        }
    }
}

/// Normalized, numeric/boolean summary of a change, derived from an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFacts {
    pub lines_changed: u64,
    pub files_touched: Vec<String>,
    /// True when the file list was cut at the configured bound.
    #[serde(default)]
    pub truncated: bool,
    pub coverage_delta: f64,
    pub perf_delta: f64,
    pub change_type: ChangeType,
    pub security_flags: bool,
    pub rubric_failures: Vec<u32>,
    pub new_tests: bool,
    pub size_category: SizeCategory,
}

impl Default for ChangeFacts {
    fn default() -> Self {
        Self {
            lines_changed: 0,
            files_touched: Vec::new(),
            truncated: false,
            coverage_delta: 0.0,
            perf_delta: 0.0,
            change_type: ChangeType::Chore,
            security_flags: false,
            rubric_failures: Vec::new(),
            new_tests: false,
            size_category: SizeCategory::XS,
        }
    }
}

/// A transparent risk score: the clamped, rounded sum of the breakdown map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    /// Final score in `[0.0, 1.0]`, rounded to 3 decimals.
    pub value: f64,
    /// Per-factor contributions; `value == clamp(sum, 0, 1)` rounded.
    pub breakdown: BTreeMap<String, f64>,
}

/// A deny emitted by a policy rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDeny {
    pub rule: String,
    pub msg: String,
}

/// Structured explanation for one evaluated rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyReceipt {
    pub rule_name: String,
    /// Verbatim text of the rule body.
    pub source_snippet: String,
    /// Input fields the rule dereferenced (superset of actual reads).
    pub inputs_used: Vec<String>,
    pub fired: bool,
}

/// Outcome of evaluating a rule bundle against an input document.
///
/// Invariant: `allow == (denies.is_empty() && at least one allow rule fired)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    pub denies: Vec<PolicyDeny>,
    pub receipts: Vec<PolicyReceipt>,
}

/// Node types in the knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeType {
    #[serde(rename = "PR")]
    Pr,
    Commit,
    Symbol,
    File,
    #[serde(rename = "ADR")]
    Adr,
    Policy,
    Incident,
    Owner,
    Release,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Pr => "PR",
            NodeType::Commit => "Commit",
            NodeType::Symbol => "Symbol",
            NodeType::File => "File",
            NodeType::Adr => "ADR",
            NodeType::Policy => "Policy",
            NodeType::Incident => "Incident",
            NodeType::Owner => "Owner",
            NodeType::Release => "Release",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PR" => Ok(NodeType::Pr),
            "Commit" => Ok(NodeType::Commit),
            "Symbol" => Ok(NodeType::Symbol),
            "File" => Ok(NodeType::File),
            "ADR" => Ok(NodeType::Adr),
            "Policy" => Ok(NodeType::Policy),
            "Incident" => Ok(NodeType::Incident),
            "Owner" => Ok(NodeType::Owner),
            "Release" => Ok(NodeType::Release),
            _ => Err(()),
        }
    }
}

/// Edge relations in the knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelKind {
    Defines,
    Touches,
    TestedBy,
    GovernedBy,
    Implements,
    AffectsPerf,
    Caused,
    MitigatedBy,
    Owns,
    Authored,
}

impl RelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelKind::Defines => "defines",
            RelKind::Touches => "touches",
            RelKind::TestedBy => "tested_by",
            RelKind::GovernedBy => "governed_by",
            RelKind::Implements => "implements",
            RelKind::AffectsPerf => "affects_perf",
            RelKind::Caused => "caused",
            RelKind::MitigatedBy => "mitigated_by",
            RelKind::Owns => "owns",
            RelKind::Authored => "authored",
        }
    }
}

impl fmt::Display for RelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "defines" => Ok(RelKind::Defines),
            "touches" => Ok(RelKind::Touches),
            "tested_by" => Ok(RelKind::TestedBy),
            "governed_by" => Ok(RelKind::GovernedBy),
            "implements" => Ok(RelKind::Implements),
            "affects_perf" => Ok(RelKind::AffectsPerf),
            "caused" => Ok(RelKind::Caused),
            "mitigated_by" => Ok(RelKind::MitigatedBy),
            "owns" => Ok(RelKind::Owns),
            "authored" => Ok(RelKind::Authored),
            _ => Err(()),
        }
    }
}

/// A typed node row. Unique per `(ntype, nkey)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KgNode {
    pub id: i64,
    pub ntype: NodeType,
    pub nkey: String,
    pub title: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A typed edge row. Unique per `(src, dst, rel)`; multi-edges of different
/// relations between the same pair are allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KgEdge {
    pub src: i64,
    pub dst: i64,
    pub rel: RelKind,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Whether an owner entry refers to a team or an individual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    Team,
    User,
}

/// One ranked owner for a path prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerEntry {
    pub owner: String,
    pub kind: OwnerKind,
    pub activity_score: f64,
    pub last_activity: DateTime<Utc>,
}

/// Derived path-prefix → ranked-owners view, recomputed from `owns` and
/// `authored` edges plus the declarative ownership-pattern file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnersIndex {
    /// Path prefix → owners, best first.
    pub entries: BTreeMap<String, Vec<OwnerEntry>>,
    pub generated_at: Option<DateTime<Utc>>,
}

impl OwnersIndex {
    /// Longest-prefix match over the index patterns.
    pub fn lookup(&self, path: &str) -> Option<(&str, &[OwnerEntry])> {
        self.entries
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(prefix, owners)| (prefix.as_str(), owners.as_slice()))
    }
}

/// Page kinds the portal publisher emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    Pr,
    Owners,
    Index,
}

/// A rendered portal page. Regenerated whole; never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortalPage {
    pub kind: PageKind,
    /// Output key, e.g. `prs/42.md`.
    pub key: String,
    pub body_markdown: String,
    /// Non-markdown attachments keyed by output path, e.g. `mermaid/42.mmd`.
    #[serde(default)]
    pub attachments: BTreeMap<String, Vec<u8>>,
    pub generated_at: DateTime<Utc>,
    /// Correlates the page with its freshness SLO sample.
    pub freshness_sample_id: String,
}

/// Ledger row for webhook deduplication. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub delivery_id: String,
    pub received_at: DateTime<Utc>,
    pub event_kind: String,
    /// Hex SHA-256 of the raw request body.
    pub raw_digest: String,
}

/// Persisted per-workflow progress so a restarted worker resumes, not
/// restarts, a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_key: String,
    pub delivery_id: String,
    pub stream_seq: u64,
    /// Names of activities that already completed, in execution order.
    pub completed: Vec<String>,
    /// Activity outputs carried across a resume, keyed by activity name.
    pub artifacts: BTreeMap<String, serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

/// Annotation attached to a message routed to the dead-letter subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub reason: String,
    pub delivery_id: String,
    pub policy_version: String,
    pub workflow_key: String,
    /// The original message payload, carried verbatim.
    pub original: serde_json::Value,
}

/// Result of one scheduled maintenance run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub pruned_deliveries: u64,
    pub compacted_pages: u64,
    pub vacuumed_edges: u64,
    pub pruned_stream_msgs: u64,
    pub ran_at: Option<DateTime<Utc>>,
}

/// The error taxonomy shared by ingress and the workflow.
///
/// Ingress kinds map to deterministic HTTP statuses and never enter the
/// workflow; workflow kinds split into retryable and dead-letter classes.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Body not parseable or a required header missing. HTTP 400.
    #[error("malformed input: {0}")]
    InputMalformed(String),
    /// Signature mismatch. HTTP 401.
    #[error("unauthorized")]
    Unauthorized,
    /// Body exceeds the configured limit. HTTP 413.
    #[error("body too large: {actual} bytes (limit {limit})")]
    TooLarge { limit: usize, actual: usize },
    /// Delivery id already seen. HTTP 200 duplicate.
    #[error("duplicate delivery: {0}")]
    Duplicate(String),
    /// Network blips, lock contention. Retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// A rule errored; becomes a fired deny, workflow continues.
    #[error("rule_error: {0}")]
    PolicyEvaluation(String),
    /// Constraint violation on upsert. Dead-lettered.
    #[error("graph consistency: {0}")]
    GraphConsistency(String),
    /// Portal writer failing. Retried within the activity timeout.
    #[error("sink unavailable: {0}")]
    SinkUnavailable(String),
    /// Configuration missing at startup. Process exits non-zero.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl GuardError {
    /// Errors the orchestrator retries transparently via stream redelivery.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GuardError::Transient(_) | GuardError::SinkUnavailable(_)
        )
    }

    /// Errors that route the event to the dead-letter subject.
    pub fn is_dead_letter(&self) -> bool {
        matches!(
            self,
            GuardError::InputMalformed(_) | GuardError::GraphConsistency(_) | GuardError::Fatal(_)
        )
    }
}
