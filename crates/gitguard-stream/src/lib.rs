//! Durable subject-based message log.
//!
//! The stream is an append-only JSONL file of messages with server-assigned
//! monotonic sequences, plus one JSON state file per named durable consumer.
//! Consumers pull, then explicitly ack; a nack schedules redelivery on the
//! bounded backoff ladder, and the delivery that would exceed
//! `max_deliveries` routes the message to the matching `gh.dlq.*` subject
//! instead.
//!
//! Time is passed into `pull`/`nack` rather than read from the wall clock,
//! so redelivery windows are exact under test.
//!
//! # Example
//!
//! ```
//! use gitguard_stream::{Stream, RedeliveryPolicy};
//! use chrono::Utc;
//! use serde_json::json;
//!
//! let td = tempfile::tempdir().expect("tempdir");
//! let stream = Stream::open(td.path()).expect("open");
//!
//! stream.publish("gh.pull_request.opened", json!({"n": 1})).expect("publish");
//!
//! let consumer = stream.durable_consumer("CODEX", "gh.>", RedeliveryPolicy::default()).expect("consumer");
//! let delivery = consumer.pull(Utc::now()).expect("pull").expect("message");
//! assert_eq!(delivery.message.seq, 1);
//! consumer.ack(delivery.message.seq).expect("ack");
//! ```

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// On-disk log file name.
pub const MESSAGES_FILE: &str = "messages.jsonl";
/// Consumer state directory name.
pub const CONSUMERS_DIR: &str = "consumers";
/// Prefix that rewrites a subject onto the dead-letter hierarchy.
pub const DLQ_PREFIX: &str = "gh.dlq.";

/// One message in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned monotonic sequence, starting at 1.
    pub seq: u64,
    pub subject: String,
    pub published_at: DateTime<Utc>,
    pub payload: Value,
}

/// A pulled message plus its delivery attempt number (1-based).
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: Message,
    pub deliveries: u32,
}

/// Outcome of a nack.
#[derive(Debug, Clone, PartialEq)]
pub enum NackOutcome {
    /// Redelivery scheduled; the message becomes pullable again at this time.
    Retry { not_before: DateTime<Utc> },
    /// Retries exhausted; the message moved to the dead-letter subject.
    DeadLettered { dlq_seq: u64 },
}

/// Bounded-retry redelivery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeliveryPolicy {
    pub max_deliveries: u32,
    /// Backoff ladder indexed by failed attempt; the last step repeats.
    pub backoff: Vec<Duration>,
    /// Redelivery window for pulled-but-never-acked messages.
    #[serde(with = "humantime_serde")]
    pub ack_wait: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_deliveries: 5,
            backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(20),
                Duration::from_secs(60),
                Duration::from_secs(300),
            ],
            ack_wait: Duration::from_secs(30),
        }
    }
}

impl RedeliveryPolicy {
    /// Backoff before redelivering after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let idx = (attempt.max(1) as usize - 1).min(self.backoff.len().saturating_sub(1));
        self.backoff.get(idx).copied().unwrap_or(Duration::ZERO)
    }
}

/// Retention limits enforced during maintenance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default, with = "humantime_serde")]
    pub max_age: Option<Duration>,
    pub max_msgs: Option<u64>,
    pub max_bytes: Option<u64>,
}

impl RetentionPolicy {
    /// Rollout default: keep 72h, no count/size bound.
    pub fn rollout() -> Self {
        Self {
            max_age: Some(Duration::from_secs(72 * 3600)),
            max_msgs: None,
            max_bytes: None,
        }
    }

    /// Steady-state limits: 24h, one million messages, 10 GiB.
    pub fn steady_state() -> Self {
        Self {
            max_age: Some(Duration::from_secs(24 * 3600)),
            max_msgs: Some(1_000_000),
            max_bytes: Some(10 * 1024 * 1024 * 1024),
        }
    }
}

/// True when `subject` matches `filter`. A filter is either an exact
/// subject or a prefix ending in `>`, which matches any remainder.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    match filter.strip_suffix('>') {
        Some(prefix) => subject.starts_with(prefix),
        None => filter == subject,
    }
}

/// Consumption-time matching: dead-letter subjects are invisible to
/// consumers unless the filter itself targets the dead-letter hierarchy.
/// Dead letters await operator action; a broad `gh.>` worker must never
/// loop on them.
fn consumable(filter: &str, subject: &str) -> bool {
    if subject.starts_with(DLQ_PREFIX) && !filter.starts_with(DLQ_PREFIX) {
        return false;
    }
    subject_matches(filter, subject)
}

/// Rewrite a subject onto the dead-letter hierarchy:
/// `gh.pull_request.opened` → `gh.dlq.pull_request.opened`.
pub fn dlq_subject(subject: &str) -> String {
    match subject.strip_prefix("gh.") {
        Some(rest) => format!("{}{}", DLQ_PREFIX, rest),
        None => format!("{}{}", DLQ_PREFIX, subject),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingState {
    deliveries: u32,
    not_before: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConsumerState {
    filter: String,
    /// Sequences fully processed (or dead-lettered).
    acked: Vec<u64>,
    /// Sequences delivered at least once and not yet acked.
    pending: BTreeMap<u64, PendingState>,
}

struct Inner {
    messages: Vec<Message>,
    next_seq: u64,
    consumers: BTreeMap<String, ConsumerState>,
}

/// The durable stream: shared by publishers and consumers.
#[derive(Clone)]
pub struct Stream {
    dir: PathBuf,
    inner: Arc<Mutex<Inner>>,
}

impl Stream {
    /// Open (and recover) a stream rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(CONSUMERS_DIR))
            .with_context(|| format!("failed to create stream dir {}", dir.display()))?;

        let messages = read_log(&dir.join(MESSAGES_FILE))?;
        let next_seq = messages.last().map(|m| m.seq + 1).unwrap_or(1);

        let mut consumers = BTreeMap::new();
        for entry in fs::read_dir(dir.join(CONSUMERS_DIR)).context("failed to list consumers")? {
            let entry = entry.context("failed to read consumer entry")?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(name) = path.file_stem().and_then(|s| s.to_str())
            {
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read consumer state {}", path.display()))?;
                let state: ConsumerState = serde_json::from_str(&text)
                    .with_context(|| format!("failed to parse consumer state {}", path.display()))?;
                consumers.insert(name.to_string(), state);
            }
        }

        Ok(Self {
            dir,
            inner: Arc::new(Mutex::new(Inner {
                messages,
                next_seq,
                consumers,
            })),
        })
    }

    /// Append a message; returns its sequence.
    pub fn publish(&self, subject: &str, payload: Value) -> Result<u64> {
        let mut inner = self.inner.lock().expect("stream lock poisoned");
        let message = Message {
            seq: inner.next_seq,
            subject: subject.to_string(),
            published_at: Utc::now(),
            payload,
        };
        append_log(&self.dir.join(MESSAGES_FILE), &message)?;
        inner.next_seq += 1;
        let seq = message.seq;
        inner.messages.push(message);
        Ok(seq)
    }

    /// Bind (or rebind) a named durable consumer to a subject filter.
    pub fn durable_consumer(
        &self,
        name: &str,
        filter: &str,
        policy: RedeliveryPolicy,
    ) -> Result<Consumer> {
        {
            let mut inner = self.inner.lock().expect("stream lock poisoned");
            let state = inner.consumers.entry(name.to_string()).or_default();
            state.filter = filter.to_string();
            persist_consumer(&self.dir, name, state)?;
        }
        Ok(Consumer {
            name: name.to_string(),
            policy,
            stream: self.clone(),
        })
    }

    /// Messages with `seq >= from`, optionally filtered by subject.
    pub fn replay(&self, from: u64, filter: Option<&str>) -> Vec<Message> {
        let inner = self.inner.lock().expect("stream lock poisoned");
        inner
            .messages
            .iter()
            .filter(|m| m.seq >= from)
            .filter(|m| filter.is_none_or(|f| subject_matches(f, &m.subject)))
            .cloned()
            .collect()
    }

    /// Highest assigned sequence, 0 when empty.
    pub fn last_seq(&self) -> u64 {
        let inner = self.inner.lock().expect("stream lock poisoned");
        inner.next_seq - 1
    }

    /// Unacked message count for a consumer (delivered or not).
    pub fn pending_count(&self, consumer: &str) -> u64 {
        let inner = self.inner.lock().expect("stream lock poisoned");
        let Some(state) = inner.consumers.get(consumer) else {
            return 0;
        };
        inner
            .messages
            .iter()
            .filter(|m| consumable(&state.filter, &m.subject))
            .filter(|m| !state.acked.contains(&m.seq))
            .count() as u64
    }

    /// Drop messages beyond the retention limits. Returns the count removed.
    ///
    /// The surviving log is rewritten atomically (write-then-rename), the
    /// way every other durable file here is produced.
    pub fn enforce_retention(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().expect("stream lock poisoned");

        let mut keep: Vec<Message> = inner.messages.clone();
        if let Some(max_age) = policy.max_age {
            let cutoff = now - chrono::Duration::from_std(max_age).context("max_age out of range")?;
            keep.retain(|m| m.published_at >= cutoff);
        }
        if let Some(max_msgs) = policy.max_msgs
            && keep.len() as u64 > max_msgs
        {
            let drop = keep.len() - max_msgs as usize;
            keep.drain(..drop);
        }
        if let Some(max_bytes) = policy.max_bytes {
            let mut total: u64 = keep
                .iter()
                .map(|m| serde_json::to_string(m).map(|s| s.len() as u64 + 1).unwrap_or(0))
                .sum();
            while total > max_bytes && !keep.is_empty() {
                let dropped = keep.remove(0);
                total -= serde_json::to_string(&dropped)
                    .map(|s| s.len() as u64 + 1)
                    .unwrap_or(0);
            }
        }

        let removed = (inner.messages.len() - keep.len()) as u64;
        if removed > 0 {
            rewrite_log(&self.dir.join(MESSAGES_FILE), &keep)?;
            inner.messages = keep;
        }
        Ok(removed)
    }

    fn with_consumer<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Inner, &PathBuf) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner.lock().expect("stream lock poisoned");
        if !inner.consumers.contains_key(name) {
            bail!("unknown consumer: {}", name);
        }
        f(&mut inner, &self.dir)
    }
}

/// A named durable consumer bound to one stream.
#[derive(Clone)]
pub struct Consumer {
    name: String,
    policy: RedeliveryPolicy,
    stream: Stream,
}

impl Consumer {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pull the next deliverable message, oldest first.
    ///
    /// Pulling marks the message outstanding until `ack` or `nack`; a
    /// worker that dies silently gets the message back after `ack_wait`.
    pub fn pull(&self, now: DateTime<Utc>) -> Result<Option<Delivery>> {
        self.stream.with_consumer(&self.name, |inner, dir| {
            let state = inner
                .consumers
                .get_mut(&self.name)
                .expect("consumer checked above");

            let mut picked: Option<(usize, u32)> = None;
            for (idx, message) in inner.messages.iter().enumerate() {
                if !consumable(&state.filter, &message.subject)
                    || state.acked.contains(&message.seq)
                {
                    continue;
                }
                match state.pending.get(&message.seq) {
                    Some(pending) if pending.not_before > now => continue,
                    Some(pending) if pending.deliveries >= self.policy.max_deliveries => continue,
                    Some(pending) => {
                        picked = Some((idx, pending.deliveries + 1));
                        break;
                    }
                    None => {
                        picked = Some((idx, 1));
                        break;
                    }
                }
            }

            let Some((idx, deliveries)) = picked else {
                return Ok(None);
            };
            let message = inner.messages[idx].clone();
            state.pending.insert(
                message.seq,
                PendingState {
                    deliveries,
                    not_before: now
                        + chrono::Duration::from_std(self.policy.ack_wait)
                            .context("ack_wait out of range")?,
                },
            );
            persist_consumer(dir, &self.name, state)?;
            Ok(Some(Delivery {
                message,
                deliveries,
            }))
        })
    }

    /// Acknowledge successful processing.
    pub fn ack(&self, seq: u64) -> Result<()> {
        self.stream.with_consumer(&self.name, |inner, dir| {
            let state = inner
                .consumers
                .get_mut(&self.name)
                .expect("consumer checked above");
            state.pending.remove(&seq);
            if !state.acked.contains(&seq) {
                state.acked.push(seq);
            }
            persist_consumer(dir, &self.name, state)
        })
    }

    /// Report failed processing.
    ///
    /// Schedules redelivery on the backoff ladder, or routes the message to
    /// the dead-letter subject once `max_deliveries` is exhausted (the
    /// original is then acked so it never redelivers).
    pub fn nack(&self, seq: u64, reason: &str, now: DateTime<Utc>) -> Result<NackOutcome> {
        // Decide and update consumer state first, then publish any DLQ
        // message outside the closure so the lock is not held re-entrantly.
        enum Verdict {
            Retry(DateTime<Utc>),
            DeadLetter(Message),
        }

        let verdict = self.stream.with_consumer(&self.name, |inner, dir| {
            let Some(pos) = inner.messages.iter().position(|m| m.seq == seq) else {
                bail!("nack for unknown seq {}", seq);
            };
            let message = inner.messages[pos].clone();
            let state = inner
                .consumers
                .get_mut(&self.name)
                .expect("consumer checked above");
            let deliveries = state.pending.get(&seq).map(|p| p.deliveries).unwrap_or(1);

            if deliveries >= self.policy.max_deliveries {
                state.pending.remove(&seq);
                if !state.acked.contains(&seq) {
                    state.acked.push(seq);
                }
                persist_consumer(dir, &self.name, state)?;
                Ok(Verdict::DeadLetter(message))
            } else {
                let not_before = now
                    + chrono::Duration::from_std(self.policy.delay_for(deliveries))
                        .context("backoff out of range")?;
                state.pending.insert(
                    seq,
                    PendingState {
                        deliveries,
                        not_before,
                    },
                );
                persist_consumer(dir, &self.name, state)?;
                Ok(Verdict::Retry(not_before))
            }
        })?;

        match verdict {
            Verdict::Retry(not_before) => Ok(NackOutcome::Retry { not_before }),
            Verdict::DeadLetter(message) => {
                let payload = serde_json::json!({
                    "reason": reason,
                    "original_seq": message.seq,
                    "original": message.payload,
                });
                let dlq_seq = self.stream.publish(&dlq_subject(&message.subject), payload)?;
                Ok(NackOutcome::DeadLettered { dlq_seq })
            }
        }
    }

    /// Unacked message count for this consumer.
    pub fn pending(&self) -> u64 {
        self.stream.pending_count(&self.name)
    }
}

fn read_log(path: &Path) -> Result<Vec<Message>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open stream log {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut messages = Vec::new();
    for line in reader.lines() {
        let line = line.context("failed to read stream log line")?;
        if line.trim().is_empty() {
            continue;
        }
        let message: Message = serde_json::from_str(&line)
            .with_context(|| format!("failed to parse stream log line: {}", line))?;
        messages.push(message);
    }
    Ok(messages)
}

fn append_log(path: &Path, message: &Message) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open stream log {}", path.display()))?;
    let mut writer = std::io::BufWriter::new(file);
    let line = serde_json::to_string(message).context("failed to serialize message")?;
    writeln!(writer, "{}", line).context("failed to append message")?;
    writer.flush().context("failed to flush stream log")?;
    Ok(())
}

fn rewrite_log(path: &Path, messages: &[Message]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut content = String::new();
    for message in messages {
        content.push_str(&serde_json::to_string(message).context("failed to serialize message")?);
        content.push('\n');
    }
    fs::write(&tmp, content)
        .with_context(|| format!("failed to write stream log {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace stream log {}", path.display()))?;
    Ok(())
}

fn persist_consumer(dir: &Path, name: &str, state: &ConsumerState) -> Result<()> {
    let path = dir.join(CONSUMERS_DIR).join(format!("{}.json", name));
    let tmp = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(state).context("failed to serialize consumer")?;
    fs::write(&tmp, content)
        .with_context(|| format!("failed to write consumer state {}", tmp.display()))?;
    fs::rename(&tmp, &path)
        .with_context(|| format!("failed to replace consumer state {}", path.display()))?;
    Ok(())
}
