//! Metrics instruments, SLO recording, and chaos hooks.
//!
//! A thread-safe registry of counters, gauges, and fixed-bucket histograms
//! with labels, a rolling-window freshness SLO evaluator, and the
//! `fault_once` hook chaos drills use to force a single failure at a named
//! point. The registry renders Prometheus text exposition for scraping.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Instrument names emitted by the pipeline.
pub const ACTIVITY_SECONDS: &str = "activity_seconds";
pub const DOC_FRESH_SECONDS: &str = "doc_fresh_seconds";
pub const EVENTS_TOTAL: &str = "events_total";
pub const STREAM_CONSUMER_PENDING: &str = "stream_consumer_pending";
pub const GRAPH_API_RESPONSE_SECONDS: &str = "graph_api_response_seconds";
pub const CHAOS_DRILL_TOTAL: &str = "chaos_drill_total";
pub const CHAOS_DRILL_SUCCESS_TOTAL: &str = "chaos_drill_success_total";

/// Alert raised when the freshness SLO is violated for its full window.
pub const FRESHNESS_ALERT: &str = "CodexFreshnessSLOBreached";

/// Sorted label set, part of a series key.
pub type Labels = Vec<(String, String)>;

fn label_set(labels: &[(&str, &str)]) -> Labels {
    let mut set: Labels = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    set.sort();
    set
}

/// A histogram with fixed buckets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Histogram {
    buckets: Vec<Bucket>,
    sum: f64,
    count: u64,
    min: f64,
    max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    upper_bound: f64,
    count: u64,
}

impl Histogram {
    /// Histogram with the default latency buckets (5ms .. 10s, +Inf).
    pub fn new() -> Self {
        Self::with_buckets(vec![
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ])
    }

    /// Histogram with custom bucket boundaries; +Inf is appended.
    pub fn with_buckets(mut bounds: Vec<f64>) -> Self {
        bounds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mut buckets: Vec<Bucket> = bounds
            .into_iter()
            .map(|upper_bound| Bucket {
                upper_bound,
                count: 0,
            })
            .collect();
        buckets.push(Bucket {
            upper_bound: f64::INFINITY,
            count: 0,
        });
        Self {
            buckets,
            sum: 0.0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Record one observation.
    pub fn observe(&mut self, value: f64) {
        for bucket in &mut self.buckets {
            if value <= bucket.upper_bound {
                bucket.count += 1;
            }
        }
        self.sum += value;
        self.count += 1;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }
}

impl Bucket {
    pub fn upper_bound(&self) -> f64 {
        self.upper_bound
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    counters: BTreeMap<(String, Labels), f64>,
    gauges: BTreeMap<(String, Labels), f64>,
    histograms: BTreeMap<(String, Labels), Histogram>,
}

/// Thread-safe metrics registry shared across the process.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    inner: Mutex<RegistryInner>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by `value`.
    pub fn inc_counter(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        *inner
            .counters
            .entry((name.to_string(), label_set(labels)))
            .or_insert(0.0) += value;
    }

    /// Set a gauge to `value`.
    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner
            .gauges
            .insert((name.to_string(), label_set(labels)), value);
    }

    /// Record a histogram observation (default latency buckets).
    pub fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner
            .histograms
            .entry((name.to_string(), label_set(labels)))
            .or_default()
            .observe(value);
    }

    /// Current counter value, 0 when never incremented.
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        inner
            .counters
            .get(&(name.to_string(), label_set(labels)))
            .copied()
            .unwrap_or(0.0)
    }

    /// Current gauge value.
    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        inner
            .gauges
            .get(&(name.to_string(), label_set(labels)))
            .copied()
    }

    /// Snapshot of a histogram series.
    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> Option<Histogram> {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        inner
            .histograms
            .get(&(name.to_string(), label_set(labels)))
            .cloned()
    }

    /// Render every series in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        let mut out = String::new();

        for ((name, labels), value) in &inner.counters {
            out.push_str(&format!(
                "{}{} {}\n",
                name,
                format_labels(labels, None),
                value
            ));
        }
        for ((name, labels), value) in &inner.gauges {
            out.push_str(&format!(
                "{}{} {}\n",
                name,
                format_labels(labels, None),
                value
            ));
        }
        for ((name, labels), histogram) in &inner.histograms {
            for bucket in &histogram.buckets {
                let le = if bucket.upper_bound.is_infinite() {
                    "+Inf".to_string()
                } else {
                    format!("{}", bucket.upper_bound)
                };
                out.push_str(&format!(
                    "{}_bucket{} {}\n",
                    name,
                    format_labels(labels, Some(("le", &le))),
                    bucket.count
                ));
            }
            out.push_str(&format!(
                "{}_sum{} {}\n",
                name,
                format_labels(labels, None),
                histogram.sum
            ));
            out.push_str(&format!(
                "{}_count{} {}\n",
                name,
                format_labels(labels, None),
                histogram.count
            ));
        }
        out
    }
}

fn format_labels(labels: &Labels, extra: Option<(&str, &str)>) -> String {
    let mut parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v))
        .collect();
    if let Some((k, v)) = extra {
        parts.push(format!("{}=\"{}\"", k, v));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", parts.join(","))
    }
}

/// Freshness SLO state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloStatus {
    /// P99 of the samples inside the window, None when empty.
    pub p99: Option<f64>,
    /// True when the current window's P99 exceeds the target.
    pub breached: bool,
    /// True when the breach has been sustained for the full alert window.
    pub alert_active: bool,
}

/// Rolling-window P99 evaluator for `doc_fresh_seconds`.
///
/// The recording rule: P99 over 10 minutes must stay ≤ 180 s; a breach
/// sustained for 10 minutes raises [`FRESHNESS_ALERT`].
#[derive(Debug)]
pub struct SloMonitor {
    window: Duration,
    target_p99: f64,
    alert_after: Duration,
    state: Mutex<SloState>,
}

#[derive(Debug, Default)]
struct SloState {
    samples: VecDeque<(DateTime<Utc>, f64)>,
    breach_since: Option<DateTime<Utc>>,
}

impl Default for SloMonitor {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(600),
            180.0,
            Duration::from_secs(600),
        )
    }
}

impl SloMonitor {
    pub fn new(window: Duration, target_p99: f64, alert_after: Duration) -> Self {
        Self {
            window,
            target_p99,
            alert_after,
            state: Mutex::new(SloState::default()),
        }
    }

    /// Record one freshness sample.
    pub fn record(&self, at: DateTime<Utc>, seconds: f64) {
        let mut state = self.state.lock().expect("slo lock poisoned");
        state.samples.push_back((at, seconds));
    }

    /// Evaluate the SLO at `now`, trimming samples that left the window.
    pub fn evaluate(&self, now: DateTime<Utc>) -> SloStatus {
        let mut state = self.state.lock().expect("slo lock poisoned");
        let cutoff =
            now - chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero());
        while state
            .samples
            .front()
            .is_some_and(|(at, _)| *at < cutoff)
        {
            state.samples.pop_front();
        }

        let p99 = percentile(state.samples.iter().map(|(_, v)| *v), 0.99);
        let breached = p99.is_some_and(|p| p > self.target_p99);

        if breached {
            if state.breach_since.is_none() {
                state.breach_since = Some(now);
            }
        } else {
            state.breach_since = None;
        }

        let alert_active = state.breach_since.is_some_and(|since| {
            now - since
                >= chrono::Duration::from_std(self.alert_after).unwrap_or(chrono::Duration::zero())
        });

        SloStatus {
            p99,
            breached,
            alert_active,
        }
    }
}

/// Nearest-rank percentile; `q` in (0, 1].
pub fn percentile(values: impl Iterator<Item = f64>, q: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((q * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    Some(sorted[rank - 1])
}

/// One-shot fault injection for chaos drills.
///
/// A drill arms `(point, delivery_id)`; the first matching [`take`] call
/// consumes the arm and reports that the caller should fail. Disabled
/// injectors never fire regardless of what was armed.
///
/// [`take`]: FaultInjector::take
#[derive(Debug)]
pub struct FaultInjector {
    enabled: bool,
    armed: Mutex<BTreeSet<(String, String)>>,
    triggered: Mutex<BTreeSet<String>>,
}

impl FaultInjector {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            armed: Mutex::new(BTreeSet::new()),
            triggered: Mutex::new(BTreeSet::new()),
        }
    }

    /// Arm a single forced failure at `point` for `delivery_id`.
    pub fn fault_once(&self, point: &str, delivery_id: &str) {
        if !self.enabled {
            return;
        }
        self.armed
            .lock()
            .expect("fault lock poisoned")
            .insert((point.to_string(), delivery_id.to_string()));
    }

    /// Consume an armed fault. True means "fail now, once".
    pub fn take(&self, point: &str, delivery_id: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let fired = self
            .armed
            .lock()
            .expect("fault lock poisoned")
            .remove(&(point.to_string(), delivery_id.to_string()));
        if fired {
            self.triggered
                .lock()
                .expect("fault lock poisoned")
                .insert(delivery_id.to_string());
        }
        fired
    }

    /// Consume the drill-in-progress marker for a delivery. True means a
    /// fault fired earlier in this delivery's life; the caller records the
    /// drill's outcome.
    pub fn finish_drill(&self, delivery_id: &str) -> bool {
        self.triggered
            .lock()
            .expect("fault lock poisoned")
            .remove(delivery_id)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates_per_label_set() {
        let registry = MetricsRegistry::new();
        registry.inc_counter(EVENTS_TOTAL, &[("result", "ok")], 1.0);
        registry.inc_counter(EVENTS_TOTAL, &[("result", "ok")], 1.0);
        registry.inc_counter(EVENTS_TOTAL, &[("result", "dlq")], 1.0);

        assert_eq!(registry.counter(EVENTS_TOTAL, &[("result", "ok")]), 2.0);
        assert_eq!(registry.counter(EVENTS_TOTAL, &[("result", "dlq")]), 1.0);
        assert_eq!(registry.counter(EVENTS_TOTAL, &[("result", "error")]), 0.0);
    }

    #[test]
    fn gauge_keeps_last_value() {
        let registry = MetricsRegistry::new();
        registry.set_gauge(STREAM_CONSUMER_PENDING, &[("consumer", "CODEX")], 3.0);
        registry.set_gauge(STREAM_CONSUMER_PENDING, &[("consumer", "CODEX")], 7.0);
        assert_eq!(
            registry.gauge(STREAM_CONSUMER_PENDING, &[("consumer", "CODEX")]),
            Some(7.0)
        );
    }

    #[test]
    fn histogram_counts_buckets_cumulatively() {
        let mut histogram = Histogram::with_buckets(vec![1.0, 5.0]);
        histogram.observe(0.5);
        histogram.observe(3.0);
        histogram.observe(100.0);

        let buckets = histogram.buckets();
        assert_eq!(buckets[0].count(), 1); // ≤ 1.0
        assert_eq!(buckets[1].count(), 2); // ≤ 5.0
        assert_eq!(buckets[2].count(), 3); // ≤ +Inf
        assert_eq!(histogram.count(), 3);
        assert_eq!(histogram.sum(), 103.5);
    }

    #[test]
    fn histogram_mean_handles_empty() {
        let histogram = Histogram::new();
        assert_eq!(histogram.mean(), 0.0);
    }

    #[test]
    fn registry_observe_creates_series_per_labels() {
        let registry = MetricsRegistry::new();
        registry.observe(ACTIVITY_SECONDS, &[("name", "score_risk")], 0.02);
        registry.observe(ACTIVITY_SECONDS, &[("name", "publish_portal")], 1.2);

        let score = registry
            .histogram(ACTIVITY_SECONDS, &[("name", "score_risk")])
            .expect("series");
        assert_eq!(score.count(), 1);
    }

    #[test]
    fn prometheus_rendering_includes_all_series() {
        let registry = MetricsRegistry::new();
        registry.inc_counter(EVENTS_TOTAL, &[("result", "ok")], 2.0);
        registry.set_gauge(STREAM_CONSUMER_PENDING, &[("consumer", "CODEX")], 4.0);
        registry.observe(DOC_FRESH_SECONDS, &[], 12.0);

        let text = registry.render_prometheus();
        assert!(text.contains("events_total{result=\"ok\"} 2"));
        assert!(text.contains("stream_consumer_pending{consumer=\"CODEX\"} 4"));
        assert!(text.contains("doc_fresh_seconds_count 1"));
        assert!(text.contains("doc_fresh_seconds_bucket{le=\"+Inf\"} 1"));
    }

    #[test]
    fn percentile_nearest_rank() {
        let values = (1..=100).map(|n| n as f64);
        assert_eq!(percentile(values, 0.99), Some(99.0));
        assert_eq!(percentile([5.0].into_iter(), 0.99), Some(5.0));
        assert_eq!(percentile(std::iter::empty(), 0.99), None);
    }

    #[test]
    fn slo_healthy_under_target() {
        let monitor = SloMonitor::default();
        let now = Utc::now();
        for i in 0..50 {
            monitor.record(now, 10.0 + i as f64);
        }
        let status = monitor.evaluate(now);
        assert!(!status.breached);
        assert!(!status.alert_active);
        assert!(status.p99.expect("p99") <= 180.0);
    }

    #[test]
    fn slo_breach_needs_sustained_window_for_alert() {
        let monitor = SloMonitor::new(Duration::from_secs(600), 180.0, Duration::from_secs(600));
        let start = Utc::now();

        monitor.record(start, 500.0);
        let status = monitor.evaluate(start);
        assert!(status.breached);
        assert!(!status.alert_active, "alert must wait for the full window");

        // Keep the breach alive past the alert window.
        let later = start + chrono::Duration::seconds(601);
        monitor.record(later, 500.0);
        let status = monitor.evaluate(later);
        assert!(status.breached);
        assert!(status.alert_active);
    }

    #[test]
    fn slo_recovery_clears_breach() {
        let monitor = SloMonitor::new(Duration::from_secs(600), 180.0, Duration::from_secs(600));
        let start = Utc::now();
        monitor.record(start, 500.0);
        assert!(monitor.evaluate(start).breached);

        // The bad sample ages out; fresh fast samples replace it.
        let later = start + chrono::Duration::seconds(700);
        monitor.record(later, 5.0);
        let status = monitor.evaluate(later);
        assert!(!status.breached);
        assert!(!status.alert_active);
    }

    #[test]
    fn slo_window_trims_old_samples() {
        let monitor = SloMonitor::default();
        let start = Utc::now();
        monitor.record(start, 500.0);
        let later = start + chrono::Duration::seconds(700);
        let status = monitor.evaluate(later);
        assert_eq!(status.p99, None);
    }

    #[test]
    fn fault_once_fires_exactly_once() {
        let injector = FaultInjector::new(true);
        injector.fault_once("publish_portal", "d-1");

        assert!(injector.take("publish_portal", "d-1"));
        assert!(!injector.take("publish_portal", "d-1"));
    }

    #[test]
    fn finish_drill_reports_fired_faults_once() {
        let injector = FaultInjector::new(true);
        injector.fault_once("publish_portal", "d-1");
        assert!(!injector.finish_drill("d-1"), "nothing fired yet");

        assert!(injector.take("publish_portal", "d-1"));
        assert!(injector.finish_drill("d-1"));
        assert!(!injector.finish_drill("d-1"), "marker is consumed");
    }

    #[test]
    fn fault_is_keyed_by_point_and_delivery() {
        let injector = FaultInjector::new(true);
        injector.fault_once("publish_portal", "d-1");

        assert!(!injector.take("update_graph", "d-1"));
        assert!(!injector.take("publish_portal", "d-2"));
        assert!(injector.take("publish_portal", "d-1"));
    }

    #[test]
    fn disabled_injector_never_fires() {
        let injector = FaultInjector::new(false);
        injector.fault_once("publish_portal", "d-1");
        assert!(!injector.take("publish_portal", "d-1"));
    }
}
