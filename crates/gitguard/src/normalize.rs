//! Event normalization: host payloads into canonical [`Event`] records.
//!
//! The normalizer is the only place host-specific JSON shapes are read.
//! Downstream stages see [`Event`] and [`ChangeFacts`] and nothing else.
//! Normalization is pure (the admission timestamp is passed in, never read
//! from the clock) and idempotent: re-normalizing the canonical form of an
//! event yields the same event.

use anyhow::Result;
use chrono::{DateTime, Utc};
use gitguard_types::{
    ChangeFacts, ChangeType, CheckResult, Event, EventKind, EventPayload, GuardError, RepoRef,
    SizeCategory,
};
use regex::Regex;
use serde_json::{Value, json};

/// Normalizer settings derived from configuration.
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// File lists longer than this are cut, with `truncated` flagged.
    pub truncate_files_at: usize,
    /// Regex set marking security-sensitive paths and diff lines.
    pub security_patterns: Vec<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            truncate_files_at: 200,
            security_patterns: vec![
                r"(?i)(auth|secret|token|password|credential)".to_string(),
                r"(?i)crypt".to_string(),
                r"\.pem$".to_string(),
                r"(?i)security".to_string(),
            ],
        }
    }
}

/// Parses and canonicalizes host events.
pub struct Normalizer {
    truncate_files_at: usize,
    security: Vec<Regex>,
}

impl Normalizer {
    pub fn new(config: &NormalizerConfig) -> Result<Self> {
        let mut security = Vec::with_capacity(config.security_patterns.len());
        for pattern in &config.security_patterns {
            security.push(
                Regex::new(pattern)
                    .map_err(|e| GuardError::Fatal(format!("bad security pattern: {}", e)))?,
            );
        }
        Ok(Self {
            truncate_files_at: config.truncate_files_at,
            security,
        })
    }

    /// Convert a host payload into the internal event record.
    ///
    /// `received_at` is the ingress admission time and becomes the event's
    /// `created_at` when the payload carries no timestamp of its own.
    pub fn normalize(
        &self,
        kind: EventKind,
        action: &str,
        raw: &Value,
        received_at: DateTime<Utc>,
    ) -> Result<Event, GuardError> {
        let repo = parse_repo(raw)?;
        let actor = raw
            .pointer("/sender/login")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let created_at = raw
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(received_at);

        let payload = match kind {
            EventKind::PullRequest => self.parse_pull_request(raw)?,
            EventKind::Push => parse_push(raw)?,
            EventKind::Review => parse_review(raw)?,
            EventKind::CheckRun => parse_check_run(raw)?,
            EventKind::Release => parse_release(raw)?,
            EventKind::Ping => EventPayload::Ping {},
        };

        Ok(Event {
            kind,
            action: action.to_string(),
            repo,
            actor,
            created_at,
            payload,
        })
    }

    /// Render an event back into its canonical host-payload form.
    ///
    /// `normalize(canonicalize(e)) == normalize(e)`: feeding the canonical
    /// form back through [`Self::normalize`] reproduces the event exactly.
    pub fn canonicalize(&self, event: &Event) -> Value {
        let mut root = json!({
            "repository": {
                "owner": {"login": event.repo.owner},
                "name": event.repo.name,
            },
            "sender": {"login": event.actor},
            "created_at": event.created_at.to_rfc3339(),
        });
        let extra = match &event.payload {
            EventPayload::PullRequest {
                number,
                title,
                lines_added,
                lines_deleted,
                files,
                coverage_delta,
                perf_delta,
                new_tests,
                rubric_failures,
                approvals,
                checks,
                diff_lines,
            } => json!({
                "pull_request": {
                    "number": number,
                    "title": title,
                    "additions": lines_added,
                    "deletions": lines_deleted,
                },
                "files": files,
                "coverage_delta": coverage_delta,
                "perf_delta": perf_delta,
                "new_tests": new_tests,
                "rubric_failures": rubric_failures,
                "approvals": approvals,
                "checks": checks.iter()
                    .map(|c| json!({"name": c.name, "passed": c.passed}))
                    .collect::<Vec<_>>(),
                "diff_lines": diff_lines,
            }),
            EventPayload::Push {
                git_ref,
                head_sha,
                commit_count,
            } => json!({
                "ref": git_ref,
                "after": head_sha,
                "commits": (0..*commit_count).map(|_| json!({})).collect::<Vec<_>>(),
            }),
            EventPayload::Review {
                number,
                state,
                reviewer,
            } => json!({
                "pull_request": {"number": number},
                "review": {"state": state, "user": {"login": reviewer}},
            }),
            EventPayload::CheckRun {
                name,
                status,
                conclusion,
                number,
            } => json!({
                "check_run": {
                    "name": name,
                    "status": status,
                    "conclusion": conclusion,
                    "pull_request_number": number,
                },
            }),
            EventPayload::Release { tag, prerelease } => json!({
                "release": {"tag_name": tag, "prerelease": prerelease},
            }),
            EventPayload::Ping {} => json!({}),
        };
        merge(&mut root, extra);
        root
    }

    /// Derive change facts from a normalized event.
    ///
    /// Non-PR events produce empty facts: only pull requests carry a diff.
    pub fn derive_facts(&self, event: &Event) -> ChangeFacts {
        let EventPayload::PullRequest {
            title,
            lines_added,
            lines_deleted,
            files,
            coverage_delta,
            perf_delta,
            new_tests,
            rubric_failures,
            diff_lines,
            ..
        } = &event.payload
        else {
            return ChangeFacts::default();
        };

        let mut files_touched = files.clone();
        let truncated = files_touched.len() > self.truncate_files_at;
        if truncated {
            files_touched.truncate(self.truncate_files_at);
        }

        let lines_changed = lines_added + lines_deleted;
        let security_flags = files_touched
            .iter()
            .chain(diff_lines.iter())
            .any(|text| self.security.iter().any(|re| re.is_match(text)));

        ChangeFacts {
            lines_changed,
            files_touched,
            truncated,
            coverage_delta: *coverage_delta,
            perf_delta: *perf_delta,
            change_type: change_type_from_title(title),
            security_flags,
            rubric_failures: rubric_failures.clone(),
            new_tests: *new_tests,
            size_category: SizeCategory::from_lines(lines_changed),
        }
    }
}

/// Conventional-commit prefix of a PR title; unknown prefixes are `chore`.
pub fn change_type_from_title(title: &str) -> ChangeType {
    let Some(prefix) = title.split(':').next() else {
        return ChangeType::Chore;
    };
    if prefix.len() == title.len() {
        // No colon at all.
        return ChangeType::Chore;
    }
    // Strip "(scope)" and the breaking-change marker.
    let prefix = prefix.split('(').next().unwrap_or(prefix);
    let prefix = prefix.trim_end_matches('!').trim().to_ascii_lowercase();
    match prefix.as_str() {
        "docs" => ChangeType::Docs,
        "fix" => ChangeType::Fix,
        "feat" => ChangeType::Feat,
        "refactor" => ChangeType::Refactor,
        "chore" => ChangeType::Chore,
        _ => ChangeType::Chore,
    }
}

fn parse_repo(raw: &Value) -> Result<RepoRef, GuardError> {
    let owner = raw
        .pointer("/repository/owner/login")
        .and_then(Value::as_str)
        .ok_or_else(|| GuardError::InputMalformed("missing repository.owner.login".into()))?;
    let name = raw
        .pointer("/repository/name")
        .and_then(Value::as_str)
        .ok_or_else(|| GuardError::InputMalformed("missing repository.name".into()))?;
    Ok(RepoRef::new(owner, name))
}

impl Normalizer {
    fn parse_pull_request(&self, raw: &Value) -> Result<EventPayload, GuardError> {
        let pr = raw
            .get("pull_request")
            .ok_or_else(|| GuardError::InputMalformed("missing pull_request".into()))?;
        let number = pr
            .get("number")
            .and_then(Value::as_u64)
            .ok_or_else(|| GuardError::InputMalformed("missing pull_request.number".into()))?;
        let title = pr
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let files = string_list(raw.get("files"));
        let checks = raw
            .get("checks")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|c| {
                        Some(CheckResult {
                            name: c.get("name")?.as_str()?.to_string(),
                            passed: c.get("passed")?.as_bool()?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(EventPayload::PullRequest {
            number,
            title,
            lines_added: pr.get("additions").and_then(Value::as_u64).unwrap_or(0),
            lines_deleted: pr.get("deletions").and_then(Value::as_u64).unwrap_or(0),
            files,
            coverage_delta: raw
                .get("coverage_delta")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            perf_delta: raw.get("perf_delta").and_then(Value::as_f64).unwrap_or(0.0),
            new_tests: raw.get("new_tests").and_then(Value::as_bool).unwrap_or(false),
            rubric_failures: raw
                .get("rubric_failures")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(|v| v.as_u64().map(|n| n as u32))
                        .collect()
                })
                .unwrap_or_default(),
            approvals: string_list(raw.get("approvals")),
            checks,
            diff_lines: string_list(raw.get("diff_lines")),
        })
    }
}

fn parse_push(raw: &Value) -> Result<EventPayload, GuardError> {
    let git_ref = raw
        .get("ref")
        .and_then(Value::as_str)
        .ok_or_else(|| GuardError::InputMalformed("missing ref".into()))?
        .to_string();
    Ok(EventPayload::Push {
        git_ref,
        head_sha: raw
            .get("after")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        commit_count: raw
            .get("commits")
            .and_then(Value::as_array)
            .map(|c| c.len() as u64)
            .unwrap_or(0),
    })
}

fn parse_review(raw: &Value) -> Result<EventPayload, GuardError> {
    let number = raw
        .pointer("/pull_request/number")
        .and_then(Value::as_u64)
        .ok_or_else(|| GuardError::InputMalformed("missing pull_request.number".into()))?;
    Ok(EventPayload::Review {
        number,
        state: raw
            .pointer("/review/state")
            .and_then(Value::as_str)
            .unwrap_or("commented")
            .to_string(),
        reviewer: raw
            .pointer("/review/user/login")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
    })
}

fn parse_check_run(raw: &Value) -> Result<EventPayload, GuardError> {
    let check = raw
        .get("check_run")
        .ok_or_else(|| GuardError::InputMalformed("missing check_run".into()))?;
    Ok(EventPayload::CheckRun {
        name: check
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        status: check
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("completed")
            .to_string(),
        conclusion: check
            .get("conclusion")
            .and_then(Value::as_str)
            .map(str::to_string),
        number: check.get("pull_request_number").and_then(Value::as_u64),
    })
}

fn parse_release(raw: &Value) -> Result<EventPayload, GuardError> {
    let release = raw
        .get("release")
        .ok_or_else(|| GuardError::InputMalformed("missing release".into()))?;
    let tag = release
        .get("tag_name")
        .and_then(Value::as_str)
        .ok_or_else(|| GuardError::InputMalformed("missing release.tag_name".into()))?
        .to_string();
    Ok(EventPayload::Release {
        tag,
        prerelease: release
            .get("prerelease")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    // GitHub file entries are objects with a filename.
                    Value::Object(map) => map
                        .get("filename")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn merge(base: &mut Value, extra: Value) {
    if let (Value::Object(base), Value::Object(extra)) = (base, extra) {
        for (k, v) in extra {
            base.insert(k, v);
        }
    }
}
