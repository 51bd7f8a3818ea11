//! Transparent risk scoring over change facts.
//!
//! The score is the clamped sum of eight factors, each capped and each
//! recorded in the breakdown map, so a digest reader can reconstruct the
//! number by hand. The scorer is pure: same facts, same score, on any host.
//! Decision thresholds (auto-merge, require-review, block) are configuration
//! read by the policy rules, never logic here.
//!
//! # Example
//!
//! ```
//! use gitguard_risk::{RiskConfig, score};
//! use gitguard_types::{ChangeFacts, ChangeType};
//!
//! let facts = ChangeFacts {
//!     lines_changed: 25,
//!     change_type: ChangeType::Docs,
//!     files_touched: vec!["README.md".to_string()],
//!     ..Default::default()
//! };
//! let risk = score(&facts, &RiskConfig::default());
//! assert_eq!(risk.value, 0.101);
//! ```

use std::collections::BTreeMap;

use gitguard_types::{ChangeFacts, ChangeType, RiskScore};
use serde::{Deserialize, Serialize};

/// Factor names in presentation order for digests and receipts.
pub const FACTORS: [&str; 8] = [
    "type_risk",
    "size_risk",
    "churn_risk",
    "coverage_risk",
    "perf_risk",
    "security_risk",
    "rubric_risk",
    "test_bonus",
];

/// Scorer thresholds. All three map 1:1 to configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Line count at which `size_risk` saturates.
    pub size_threshold: f64,
    /// File count at which `churn_risk` saturates.
    pub max_files: f64,
    /// Perf regression at which `perf_risk` saturates.
    pub perf_budget: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            size_threshold: 800.0,
            max_files: 50.0,
            perf_budget: 40.0,
        }
    }
}

/// Per-factor caps from the risk model.
const TYPE_CAP: f64 = 0.25;
const SIZE_CAP: f64 = 0.25;
const CHURN_CAP: f64 = 0.10;
const COVERAGE_CAP: f64 = 0.20;
const PERF_CAP: f64 = 0.20;
const SECURITY_WEIGHT: f64 = 0.30;
const RUBRIC_CAP: f64 = 0.25;
const RUBRIC_PER_ITEM: f64 = 0.05;
const TEST_BONUS: f64 = -0.15;

fn type_risk(change_type: ChangeType) -> f64 {
    match change_type {
        ChangeType::Docs => 0.05,
        ChangeType::Chore => 0.10,
        ChangeType::Fix => 0.20,
        ChangeType::Feat => 0.25,
        ChangeType::Refactor => 0.20,
    }
}

/// Compute the risk score for a set of change facts.
///
/// `value == round(clamp(sum(breakdown), 0, 1), 3)`; the breakdown map keeps
/// every factor's contribution for receipts and the PR digest.
pub fn score(facts: &ChangeFacts, config: &RiskConfig) -> RiskScore {
    let mut breakdown = BTreeMap::new();

    breakdown.insert(
        "type_risk".to_string(),
        type_risk(facts.change_type).min(TYPE_CAP),
    );
    breakdown.insert(
        "size_risk".to_string(),
        (facts.lines_changed as f64 / config.size_threshold).min(SIZE_CAP),
    );
    breakdown.insert(
        "churn_risk".to_string(),
        (facts.files_touched.len() as f64 / config.max_files).min(CHURN_CAP),
    );
    breakdown.insert(
        "coverage_risk".to_string(),
        (-facts.coverage_delta).max(0.0).min(COVERAGE_CAP),
    );
    breakdown.insert(
        "perf_risk".to_string(),
        (facts.perf_delta.max(0.0) / config.perf_budget).min(PERF_CAP),
    );
    breakdown.insert(
        "security_risk".to_string(),
        if facts.security_flags { SECURITY_WEIGHT } else { 0.0 },
    );
    let failing = facts.rubric_failures.iter().filter(|&&n| n > 0).count();
    breakdown.insert(
        "rubric_risk".to_string(),
        (RUBRIC_PER_ITEM * failing as f64).min(RUBRIC_CAP),
    );
    breakdown.insert(
        "test_bonus".to_string(),
        if facts.new_tests { TEST_BONUS } else { 0.0 },
    );

    let sum: f64 = breakdown.values().sum();
    let value = (sum.clamp(0.0, 1.0) * 1000.0).round() / 1000.0;

    RiskScore { value, breakdown }
}
