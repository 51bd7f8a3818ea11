//! Configuration file support for GitGuard (`gitguard.toml`).
//!
//! Configuration merges three layers: serde defaults, the TOML file, and
//! environment overrides (`GITGUARD_*`, which win). Validation is fail-fast:
//! a missing signing secret stops the process at startup rather than
//! admitting unsigned webhooks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use gitguard_redact::ExtraPattern;
use gitguard_risk::RiskConfig;
use gitguard_stream::RetentionPolicy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Deserialize a Duration from either a human-readable string ("30s") or a
/// millisecond count.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds so it round-trips with
/// [`deserialize_duration`].
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Decision thresholds read by policy rules, not by the scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    /// Risk at or below this may auto-merge.
    #[serde(default = "default_auto_merge")]
    pub auto_merge: f64,
    /// Risk at or above this requires review.
    #[serde(default = "default_require_review")]
    pub require_review: f64,
    /// Risk at or above this blocks outright.
    #[serde(default = "default_block")]
    pub block: f64,
}

fn default_auto_merge() -> f64 {
    0.30
}
fn default_require_review() -> f64 {
    0.70
}
fn default_block() -> f64 {
    0.85
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            auto_merge: default_auto_merge(),
            require_review: default_require_review(),
            block: default_block(),
        }
    }
}

/// Ingress admission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    #[serde(default = "default_ingress_bind")]
    pub bind: String,
    /// Reject with 503 when stream publish takes longer than this.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_backpressure")]
    pub backpressure: Duration,
    /// Reject with 503 when consumer pending exceeds this.
    #[serde(default = "default_max_pending")]
    pub max_pending: u64,
}

fn default_ingress_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_backpressure() -> Duration {
    Duration::from_millis(250)
}
fn default_max_pending() -> u64 {
    10_000
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            bind: default_ingress_bind(),
            backpressure: default_backpressure(),
            max_pending: default_max_pending(),
        }
    }
}

/// Graph API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_bind")]
    pub bind: String,
    /// CORS origin allowlist; empty means same-origin only.
    #[serde(default)]
    pub cors_allowlist: Vec<String>,
}

fn default_api_bind() -> String {
    "127.0.0.1:8081".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_api_bind(),
            cors_allowlist: Vec::new(),
        }
    }
}

/// Feature flags. Everything governance-critical defaults on; chaos hooks
/// default off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub core_publish_enabled: bool,
    pub policy_transparency_enabled: bool,
    pub mermaid_graphs_enabled: bool,
    pub graph_api_enabled: bool,
    pub slo_monitoring_enabled: bool,
    pub chaos_hooks_enabled: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            core_publish_enabled: true,
            policy_transparency_enabled: true,
            mermaid_graphs_enabled: true,
            graph_api_enabled: true,
            slo_monitoring_enabled: true,
            chaos_hooks_enabled: false,
        }
    }
}

/// Where portal pages go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Directory path, or an `http(s)://` URL.
    #[serde(default = "default_sink")]
    pub target: String,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_sink_timeout")]
    pub timeout: Duration,
}

fn default_sink() -> String {
    ".gitguard/portal".to_string()
}
fn default_sink_timeout() -> Duration {
    Duration::from_secs(120)
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            target: default_sink(),
            timeout: default_sink_timeout(),
        }
    }
}

/// Stream retention knobs, mirrored into [`RetentionPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamRetentionConfig {
    #[serde(
        deserialize_with = "deserialize_opt_duration",
        serialize_with = "serialize_opt_duration"
    )]
    pub max_age: Option<Duration>,
    pub max_msgs: Option<u64>,
    pub max_bytes: Option<u64>,
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Helper {
        String(String),
        U64(u64),
    }

    let value: Option<Helper> = Option::deserialize(deserializer)?;
    match value {
        None => Ok(None),
        Some(Helper::String(s)) => humantime::parse_duration(&s)
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        Some(Helper::U64(ms)) => Ok(Some(Duration::from_millis(ms))),
    }
}

fn serialize_opt_duration<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}

impl Default for StreamRetentionConfig {
    fn default() -> Self {
        let policy = RetentionPolicy::steady_state();
        Self {
            max_age: policy.max_age,
            max_msgs: policy.max_msgs,
            max_bytes: policy.max_bytes,
        }
    }
}

impl StreamRetentionConfig {
    pub fn to_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age: self.max_age,
            max_msgs: self.max_msgs,
            max_bytes: self.max_bytes,
        }
    }
}

/// Top-level configuration.
///
/// Field order matters for serialization: every scalar value comes before
/// the table-typed sections, the only ordering the TOML writer accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HMAC shared secret for webhook signatures. Required.
    pub signing_secret: String,
    /// Ingress body cap in bytes.
    pub body_max_bytes: usize,
    /// Rule bundle directory.
    pub policy_bundle_dir: PathBuf,
    /// Declarative ownership-pattern file.
    pub ownership_patterns: PathBuf,
    /// Durable stream directory.
    pub stream_dir: PathBuf,
    /// Knowledge graph SQLite file.
    pub db_path: PathBuf,
    /// Dedup ledger SQLite file.
    pub dedup_db_path: PathBuf,
    /// Workflow state directory.
    pub state_dir: PathBuf,
    /// IANA zone label put into `input.now.tz`.
    pub timezone: String,
    /// UTC offset minutes used to derive local weekday/hour for rules.
    pub utc_offset_minutes: i32,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub owners_debounce: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub maint_interval: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub activity_timeout: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub publish_timeout: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub workflow_deadline: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub dedup_retention: Duration,
    /// Portal pages last generated before this age are compacted.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub page_max_age: Duration,
    /// Workflow worker count; 0 means CPU count × 4.
    pub workers: usize,
    /// File-list truncation bound for normalization.
    pub truncate_files_at: usize,
    /// Security-pattern regex set for change facts.
    pub security_patterns: Vec<String>,
    /// Risk scorer thresholds.
    pub risk: RiskConfig,
    /// Decision thresholds handed to policy rules as input.
    pub thresholds: Thresholds,
    /// Portal sink target.
    pub sink: SinkConfig,
    pub ingress: IngressConfig,
    pub api: ApiConfig,
    pub stream_retention: StreamRetentionConfig,
    pub flags: FeatureFlags,
    /// Extra redaction patterns.
    pub redact_patterns: Vec<ExtraPattern>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            body_max_bytes: 1024 * 1024,
            policy_bundle_dir: PathBuf::from("policies"),
            ownership_patterns: PathBuf::from("policies/ownership.toml"),
            stream_dir: PathBuf::from(".gitguard/stream"),
            db_path: PathBuf::from(".gitguard/graph.db"),
            dedup_db_path: PathBuf::from(".gitguard/ledger.db"),
            state_dir: PathBuf::from(".gitguard/workflows"),
            timezone: "UTC".to_string(),
            utc_offset_minutes: 0,
            owners_debounce: Duration::from_secs(10),
            maint_interval: Duration::from_secs(3600),
            activity_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(120),
            workflow_deadline: Duration::from_secs(600),
            dedup_retention: Duration::from_secs(14 * 24 * 3600),
            page_max_age: Duration::from_secs(30 * 24 * 3600),
            workers: 0,
            truncate_files_at: 200,
            security_patterns: default_security_patterns(),
            risk: RiskConfig::default(),
            thresholds: Thresholds::default(),
            sink: SinkConfig::default(),
            ingress: IngressConfig::default(),
            api: ApiConfig::default(),
            stream_retention: StreamRetentionConfig::default(),
            flags: FeatureFlags::default(),
            redact_patterns: Vec::new(),
        }
    }
}

fn default_security_patterns() -> Vec<String> {
    vec![
        r"(?i)(auth|secret|token|password|credential)".to_string(),
        r"(?i)crypt".to_string(),
        r"\.pem$".to_string(),
        r"(?i)security".to_string(),
    ]
}

impl Config {
    /// Load configuration: file (if present) + environment overrides,
    /// then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                toml::from_str(&text)
                    .with_context(|| format!("failed to parse config {}", path.display()))?
            }
            Some(path) => bail!("config file not found: {}", path.display()),
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `GITGUARD_*` environment overrides. Environment wins over file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var("GITGUARD_SIGNING_SECRET") {
            self.signing_secret = secret;
        }
        if let Ok(bytes) = std::env::var("GITGUARD_BODY_MAX_BYTES")
            && let Ok(bytes) = bytes.parse()
        {
            self.body_max_bytes = bytes;
        }
        if let Ok(dir) = std::env::var("GITGUARD_POLICY_BUNDLE_DIR") {
            self.policy_bundle_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("GITGUARD_STREAM_DIR") {
            self.stream_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("GITGUARD_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Ok(target) = std::env::var("GITGUARD_SINK") {
            self.sink.target = target;
        }
    }

    /// Fail-fast validation. Called at startup; a failure exits non-zero.
    pub fn validate(&self) -> Result<()> {
        if self.signing_secret.is_empty() {
            bail!("signing_secret is required (set GITGUARD_SIGNING_SECRET or [signing_secret] in gitguard.toml)");
        }
        if self.body_max_bytes == 0 {
            bail!("body_max_bytes must be positive");
        }
        if self.thresholds.auto_merge > self.thresholds.require_review
            || self.thresholds.require_review > self.thresholds.block
        {
            bail!(
                "thresholds must be ordered: auto_merge <= require_review <= block (got {} / {} / {})",
                self.thresholds.auto_merge,
                self.thresholds.require_review,
                self.thresholds.block
            );
        }
        Ok(())
    }

    /// Effective worker count.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get() * 4)
                .unwrap_or(4)
        }
    }

    /// True when the sink target is an HTTP endpoint.
    pub fn sink_is_http(&self) -> bool {
        self.sink.target.starts_with("http://") || self.sink.target.starts_with("https://")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.body_max_bytes, 1024 * 1024);
        assert_eq!(config.owners_debounce, Duration::from_secs(10));
        assert_eq!(config.activity_timeout, Duration::from_secs(30));
        assert_eq!(config.publish_timeout, Duration::from_secs(120));
        assert_eq!(config.workflow_deadline, Duration::from_secs(600));
        assert_eq!(config.ingress.backpressure, Duration::from_millis(250));
        assert_eq!(config.ingress.max_pending, 10_000);
        assert!(config.flags.core_publish_enabled);
        assert!(!config.flags.chaos_hooks_enabled);
    }

    #[test]
    fn missing_secret_fails_validation() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_full_toml() {
        let text = r#"
signing_secret = "shh"
body_max_bytes = 2048
timezone = "America/New_York"
utc_offset_minutes = -300
owners_debounce = "10s"
maint_interval = "1h"
activity_timeout = 30000

[risk]
size_threshold = 800.0
max_files = 50.0
perf_budget = 40.0

[thresholds]
auto_merge = 0.3
require_review = 0.7
block = 0.85

[ingress]
bind = "0.0.0.0:9000"
backpressure = "250ms"
max_pending = 500

[api]
bind = "0.0.0.0:9001"
cors_allowlist = ["https://portal.example.com"]

[sink]
target = "https://sink.example.com/pages"
timeout = "2m"

[stream_retention]
max_age = "24h"
max_msgs = 1000000

[flags]
chaos_hooks_enabled = true
"#;
        let config: Config = toml::from_str(text).expect("parse");
        assert_eq!(config.signing_secret, "shh");
        assert_eq!(config.body_max_bytes, 2048);
        assert_eq!(config.utc_offset_minutes, -300);
        assert_eq!(config.owners_debounce, Duration::from_secs(10));
        assert_eq!(config.maint_interval, Duration::from_secs(3600));
        assert_eq!(config.activity_timeout, Duration::from_secs(30));
        assert_eq!(config.ingress.max_pending, 500);
        assert_eq!(config.api.cors_allowlist.len(), 1);
        assert!(config.sink_is_http());
        assert_eq!(
            config.stream_retention.max_age,
            Some(Duration::from_secs(24 * 3600))
        );
        assert!(config.flags.chaos_hooks_enabled);
        config.validate().expect("valid");
    }

    #[test]
    fn misordered_thresholds_rejected() {
        let mut config = Config {
            signing_secret: "s".to_string(),
            ..Default::default()
        };
        config.thresholds.auto_merge = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duration_round_trips_through_serialization() {
        let config = Config {
            signing_secret: "s".to_string(),
            ..Default::default()
        };
        let text = toml::to_string(&config).expect("serialize");
        let parsed: Config = toml::from_str(&text).expect("parse");
        assert_eq!(parsed.owners_debounce, config.owners_debounce);
        assert_eq!(parsed.workflow_deadline, config.workflow_deadline);
    }

    #[test]
    fn effective_workers_defaults_to_cpu_multiple() {
        let config = Config::default();
        assert!(config.effective_workers() >= 4);

        let config = Config {
            workers: 2,
            ..Default::default()
        };
        assert_eq!(config.effective_workers(), 2);
    }
}
