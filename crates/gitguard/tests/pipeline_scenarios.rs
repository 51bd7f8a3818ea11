//! End-to-end pipeline scenarios: events go in through the stream, the
//! workflow runs every activity, and pages come out of a memory sink.
//! Timestamps that matter (freeze windows) ride in on the message itself,
//! so the suite is hermetic.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gitguard::workflow::{Pipeline, drain};
use gitguard::{Config, MemorySink};
use gitguard_dedup::Reservation;
use gitguard_metrics::EVENTS_TOTAL;
use gitguard_types::NodeType;
use serde_json::{Value, json};
use tempfile::TempDir;

const POLICIES: &str = r#"
version = "2026.1"

[[rule]]
name = "event_admitted"
class = "allow"
when = 'action != ""'

[[rule]]
name = "auto_merge_low_risk"
class = "allow"
when = "score.value <= thresholds.auto_merge"

[[rule]]
name = "require_review"
class = "deny"
msg = "Risk exceeds the auto-merge threshold; review required"
when = "pr.number >= 1 && score.value > thresholds.auto_merge && count(approvals) == 0"

[[rule]]
name = "block_high_risk"
class = "deny"
msg = "Risk exceeds the block threshold"
when = "score.value >= thresholds.block"

[[rule]]
name = "security_review_required"
class = "deny"
msg = "Security-sensitive change requires an approving review"
when = "facts.security_flags == true && count(approvals) == 0"

[[rule]]
name = "weekend_freeze"
class = "deny"
msg = "Weekend deployment freeze active"
when = """
(action == "create_tag" || action == "published" || count(tag) > 0)
&& ((now.weekday == "Fri" && now.hour >= 16)
    || now.weekday == "Sat"
    || now.weekday == "Sun"
    || (now.weekday == "Mon" && now.hour < 8))
"""
"#;

struct Harness {
    _td: TempDir,
    pipeline: Pipeline,
    sink: Arc<MemorySink>,
}

fn harness() -> Harness {
    harness_with(|_| {})
}

fn harness_with(tweak: impl FnOnce(&mut Config)) -> Harness {
    let td = tempfile::tempdir().expect("tempdir");
    let policy_dir = td.path().join("policies");
    std::fs::create_dir_all(&policy_dir).expect("mkdir");
    std::fs::write(policy_dir.join("rules.toml"), POLICIES).expect("write policies");

    let mut config = Config {
        signing_secret: "test-secret".to_string(),
        policy_bundle_dir: policy_dir,
        ownership_patterns: td.path().join("ownership.toml"),
        stream_dir: td.path().join("stream"),
        db_path: td.path().join("graph.db"),
        dedup_db_path: td.path().join("ledger.db"),
        state_dir: td.path().join("workflows"),
        // Scenario events carry fixed historical timestamps.
        workflow_deadline: Duration::from_secs(3600 * 24 * 365 * 100),
        ..Config::default()
    };
    tweak(&mut config);

    let sink = Arc::new(MemorySink::new());
    let pipeline =
        Pipeline::with_sink(config, Box::new(Arc::clone(&sink))).expect("build pipeline");
    Harness {
        _td: td,
        pipeline,
        sink,
    }
}

fn admit(
    harness: &Harness,
    delivery_id: &str,
    kind: &str,
    action: &str,
    received_at: DateTime<Utc>,
    raw: Value,
) -> u64 {
    let reservation = harness
        .pipeline
        .dedup
        .reserve(delivery_id, kind, "digest")
        .expect("reserve");
    assert_eq!(reservation, Reservation::New, "delivery already seen");
    harness
        .pipeline
        .stream
        .publish(
            &format!("gh.{}.{}", kind, action),
            json!({
                "delivery_id": delivery_id,
                "kind": kind,
                "action": action,
                "received_at": received_at.to_rfc3339(),
                "raw": raw,
            }),
        )
        .expect("publish")
}

fn docs_pr_raw() -> Value {
    json!({
        "repository": {"owner": {"login": "acme"}, "name": "widgets"},
        "sender": {"login": "alice"},
        "pull_request": {
            "number": 1,
            "title": "docs: add install",
            "additions": 20,
            "deletions": 5,
        },
        "files": ["README.md"],
        "coverage_delta": 0.0,
        "perf_delta": 0.0,
        "new_tests": false,
        "rubric_failures": [0, 0, 0],
        "approvals": [],
        "checks": [{"name": "ci", "passed": true}],
        "diff_lines": [],
    })
}

// Tuesday 2026-03-03, 10:00 UTC.
fn tuesday_morning() -> DateTime<Utc> {
    "2026-03-03T10:00:00Z".parse().expect("timestamp")
}

// Friday 2026-03-06, 17:30 UTC.
fn friday_evening() -> DateTime<Utc> {
    "2026-03-06T17:30:00Z".parse().expect("timestamp")
}

#[test]
fn s1_docs_only_pr_auto_merges() {
    let h = harness();
    admit(&h, "d-1", "pull_request", "opened", tuesday_morning(), docs_pr_raw());

    let consumer = h.pipeline.consumer().expect("consumer");
    let processed = drain(&h.pipeline, &consumer).expect("drain");
    assert_eq!(processed, 1);

    let digest = h.sink.page("prs/1.md").expect("digest emitted");
    assert!(digest.contains("**Total: 0.101**"), "digest:\n{}", digest);
    assert!(digest.contains("**Decision: ALLOW**"));
    // The allow rule's receipt cites its source.
    assert!(digest.contains("score.value <= thresholds.auto_merge"));
    assert!(h.sink.page("owners.md").is_some());
    assert!(h.sink.page("index.md").is_some());

    // The author is credited for the touched file.
    let owners = h.pipeline.owners_index().expect("owners");
    let (_, entries) = owners.lookup("README.md").expect("entry for README.md");
    assert!(entries.iter().any(|o| o.owner == "alice"));

    assert_eq!(
        h.pipeline.metrics.counter(EVENTS_TOTAL, &[("result", "ok")]),
        1.0
    );
}

#[test]
fn s2_feature_with_regressions_requires_review() {
    let h = harness();
    let raw = json!({
        "repository": {"owner": {"login": "acme"}, "name": "widgets"},
        "sender": {"login": "bob"},
        "pull_request": {
            "number": 2,
            "title": "feat: streaming uploads",
            "additions": 250,
            "deletions": 50,
        },
        "files": ["src/a.rs", "src/b.rs", "src/c.rs", "src/d.rs",
                  "src/e.rs", "src/f.rs", "src/g.rs", "src/h.rs"],
        "coverage_delta": -0.05,
        "perf_delta": 2.0,
        "new_tests": true,
        "rubric_failures": [],
        "approvals": [],
        "checks": [],
        "diff_lines": [],
    });
    admit(&h, "d-2", "pull_request", "opened", tuesday_morning(), raw);

    let consumer = h.pipeline.consumer().expect("consumer");
    drain(&h.pipeline, &consumer).expect("drain");

    let digest = h.sink.page("prs/2.md").expect("digest emitted");
    assert!(digest.contains("**Total: 0.550**"), "digest:\n{}", digest);
    assert!(digest.contains("**Decision: DENY**"));
    assert!(digest.contains("`require_review` — Risk exceeds the auto-merge threshold"));
    // The deny receipt cites the threshold rule source.
    assert!(digest.contains("score.value > thresholds.auto_merge"));
}

#[test]
fn s3_security_flagged_fix_blocks() {
    let h = harness();
    let files: Vec<String> = (0..50).map(|i| format!("src/auth/mod{}.rs", i)).collect();
    let raw = json!({
        "repository": {"owner": {"login": "acme"}, "name": "widgets"},
        "sender": {"login": "carol"},
        "pull_request": {
            "number": 3,
            "title": "fix: patch token validation",
            "additions": 700,
            "deletions": 100,
        },
        "files": files,
        "coverage_delta": 0.0,
        "perf_delta": 0.0,
        "new_tests": false,
        "rubric_failures": [1, 2],
        "approvals": [],
        "checks": [],
        "diff_lines": ["-        verify(token)?;"],
    });
    admit(&h, "d-3", "pull_request", "opened", tuesday_morning(), raw);

    let consumer = h.pipeline.consumer().expect("consumer");
    drain(&h.pipeline, &consumer).expect("drain");

    let digest = h.sink.page("prs/3.md").expect("digest emitted");
    assert!(digest.contains("**Decision: DENY**"));
    assert!(digest.contains("block_high_risk"));
    assert!(digest.contains("security_review_required"));
    assert!(digest.contains("| security_risk | +0.300 |"));

    // Risk crossed the block threshold: 0.20 + 0.25 + 0.10 + 0.30 + 0.10.
    assert!(digest.contains("**Total: 0.950**"), "digest:\n{}", digest);

    // Nothing was dead-lettered; this is a clean deny.
    assert_eq!(
        h.pipeline.metrics.counter(EVENTS_TOTAL, &[("result", "dlq")]),
        0.0
    );
    assert!(h.pipeline.stream.replay(1, Some("gh.dlq.>")).is_empty());
}

#[test]
fn s4_weekend_freeze_denies_friday_allows_tuesday() {
    let h = harness();
    let release_raw = |tag: &str| {
        json!({
            "repository": {"owner": {"login": "acme"}, "name": "widgets"},
            "sender": {"login": "dave"},
            "release": {"tag_name": tag, "prerelease": false},
        })
    };

    admit(&h, "d-4a", "release", "create_tag", friday_evening(), release_raw("v1.2.0"));
    admit(&h, "d-4b", "release", "create_tag", tuesday_morning(), release_raw("v1.2.1"));

    let consumer = h.pipeline.consumer().expect("consumer");
    drain(&h.pipeline, &consumer).expect("drain");

    let frozen = h
        .pipeline
        .graph
        .get_node(NodeType::Release, "acme/widgets@v1.2.0")
        .expect("query")
        .expect("release node");
    assert_eq!(frozen.data["allow"], json!(false));

    let open = h
        .pipeline
        .graph
        .get_node(NodeType::Release, "acme/widgets@v1.2.1")
        .expect("query")
        .expect("release node");
    assert_eq!(open.data["allow"], json!(true));
}

#[test]
fn s5_duplicate_delivery_runs_one_workflow() {
    let h = harness();
    admit(&h, "d-5", "pull_request", "opened", tuesday_morning(), docs_pr_raw());

    // The retry presents the same delivery id; the ledger refuses it and
    // nothing new reaches the stream.
    let second = h
        .pipeline
        .dedup
        .reserve("d-5", "pull_request", "digest")
        .expect("reserve");
    assert_eq!(second, Reservation::Seen);

    let consumer = h.pipeline.consumer().expect("consumer");
    let processed = drain(&h.pipeline, &consumer).expect("drain");
    assert_eq!(processed, 1);

    assert_eq!(
        h.pipeline.metrics.counter(EVENTS_TOTAL, &[("result", "ok")]),
        1.0
    );
    assert_eq!(
        h.pipeline.graph.nodes_of_type(NodeType::Pr).expect("scan").len(),
        1
    );
}

#[test]
fn s6_chaos_fault_redelivers_without_duplicates() {
    let h = harness_with(|config| {
        config.flags.chaos_hooks_enabled = true;
    });
    h.pipeline.faults.fault_once("publish_portal", "d-6");

    admit(&h, "d-6", "pull_request", "opened", Utc::now(), docs_pr_raw());

    let consumer = h.pipeline.consumer().expect("consumer");
    drain(&h.pipeline, &consumer).expect("drain");

    // The forced fault consumed the first attempt: no page yet, one error.
    assert!(h.sink.page("prs/1.md").is_none());
    assert_eq!(
        h.pipeline.metrics.counter(EVENTS_TOTAL, &[("result", "error")]),
        1.0
    );

    // Redelivery opens after the first backoff step (1s).
    std::thread::sleep(Duration::from_millis(1100));
    drain(&h.pipeline, &consumer).expect("drain");

    assert!(h.sink.page("prs/1.md").is_some());
    assert_eq!(
        h.pipeline.metrics.counter(EVENTS_TOTAL, &[("result", "ok")]),
        1.0
    );
    // No duplicate rows in the graph.
    assert_eq!(
        h.pipeline.graph.nodes_of_type(NodeType::Pr).expect("scan").len(),
        1
    );
    // The drill is accounted for.
    assert_eq!(
        h.pipeline
            .metrics
            .counter(gitguard_metrics::CHAOS_DRILL_TOTAL, &[]),
        1.0
    );
    assert_eq!(
        h.pipeline
            .metrics
            .counter(gitguard_metrics::CHAOS_DRILL_SUCCESS_TOTAL, &[]),
        1.0
    );
}

#[test]
fn malformed_event_dead_letters_with_annotation() {
    let h = harness();
    // Reaches the workflow with a payload the normalizer must reject.
    h.pipeline
        .stream
        .publish(
            "gh.pull_request.opened",
            json!({
                "delivery_id": "d-bad",
                "kind": "pull_request",
                "action": "opened",
                "received_at": Utc::now().to_rfc3339(),
                "raw": {"not": "a webhook"},
            }),
        )
        .expect("publish");

    let consumer = h.pipeline.consumer().expect("consumer");
    drain(&h.pipeline, &consumer).expect("drain");

    let dlq = h.pipeline.stream.replay(1, Some("gh.dlq.>"));
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].subject, "gh.dlq.pull_request.opened");
    assert_eq!(dlq[0].payload["delivery_id"], "d-bad");
    assert!(
        dlq[0].payload["reason"]
            .as_str()
            .expect("reason")
            .contains("malformed")
    );
    assert_eq!(
        h.pipeline.metrics.counter(EVENTS_TOTAL, &[("result", "dlq")]),
        1.0
    );

    // Dead letters stay parked: another drain must not touch them.
    let processed = drain(&h.pipeline, &consumer).expect("drain");
    assert_eq!(processed, 0);
}

#[test]
fn ping_events_are_skipped() {
    let h = harness();
    let raw = json!({
        "repository": {"owner": {"login": "acme"}, "name": "widgets"},
        "sender": {"login": "gh"},
    });
    admit(&h, "d-ping", "ping", "ping", Utc::now(), raw);

    let consumer = h.pipeline.consumer().expect("consumer");
    let processed = drain(&h.pipeline, &consumer).expect("drain");
    assert_eq!(processed, 1);
    assert!(h.sink.keys().is_empty());
    assert_eq!(
        h.pipeline.metrics.counter(EVENTS_TOTAL, &[("result", "ok")]),
        0.0
    );
}

#[test]
fn same_pr_events_execute_in_stream_order() {
    let h = harness();
    let mut raw = docs_pr_raw();
    raw["pull_request"]["title"] = json!("docs: first pass");
    admit(&h, "d-o1", "pull_request", "opened", tuesday_morning(), raw);

    let mut raw = docs_pr_raw();
    raw["pull_request"]["title"] = json!("docs: second pass");
    admit(&h, "d-o2", "pull_request", "synchronize", tuesday_morning(), raw);

    let consumer = h.pipeline.consumer().expect("consumer");
    drain(&h.pipeline, &consumer).expect("drain");

    // FIFO per key: the node reflects the later event.
    let node = h
        .pipeline
        .graph
        .get_node(NodeType::Pr, "acme/widgets#1")
        .expect("query")
        .expect("node");
    assert_eq!(node.title, "docs: second pass");
}

#[test]
fn workflow_resumes_from_persisted_state() {
    let h = harness_with(|config| {
        config.flags.chaos_hooks_enabled = true;
    });
    // Fail late, after the graph was updated.
    h.pipeline.faults.fault_once("publish_portal", "d-r1");
    admit(&h, "d-r1", "pull_request", "opened", Utc::now(), docs_pr_raw());

    let consumer = h.pipeline.consumer().expect("consumer");
    drain(&h.pipeline, &consumer).expect("drain");

    // First attempt got through update_graph before failing.
    assert_eq!(
        h.pipeline.graph.nodes_of_type(NodeType::Pr).expect("scan").len(),
        1
    );

    std::thread::sleep(Duration::from_millis(1100));
    drain(&h.pipeline, &consumer).expect("drain");

    // Second attempt resumed and finished; still exactly one PR row.
    assert!(h.sink.page("prs/1.md").is_some());
    assert_eq!(
        h.pipeline.graph.nodes_of_type(NodeType::Pr).expect("scan").len(),
        1
    );
}

#[test]
fn maintenance_prunes_and_reports() {
    let h = harness();
    admit(&h, "d-m1", "pull_request", "opened", tuesday_morning(), docs_pr_raw());
    let consumer = h.pipeline.consumer().expect("consumer");
    drain(&h.pipeline, &consumer).expect("drain");

    let report = h.pipeline.run_maintenance().expect("maintenance");
    // Fresh data: nothing to prune yet, but the pass itself succeeds.
    assert_eq!(report.pruned_deliveries, 0);
    assert_eq!(report.compacted_pages, 0);
    assert!(report.ran_at.is_some());
}
