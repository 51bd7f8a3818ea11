#![no_main]

use gitguard_risk::{RiskConfig, score};
use gitguard_types::{ChangeFacts, ChangeType, SizeCategory};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u64, u16, f64, f64, u8, bool, bool)| {
    let (lines, files, coverage, perf, change_byte, security, new_tests) = data;
    if !coverage.is_finite() || !perf.is_finite() {
        return;
    }
    let change_type = match change_byte % 5 {
        0 => ChangeType::Docs,
        1 => ChangeType::Chore,
        2 => ChangeType::Fix,
        3 => ChangeType::Feat,
        _ => ChangeType::Refactor,
    };
    let facts = ChangeFacts {
        lines_changed: lines,
        size_category: SizeCategory::from_lines(lines),
        files_touched: (0..files % 512).map(|i| format!("f{}", i)).collect(),
        truncated: false,
        coverage_delta: coverage,
        perf_delta: perf,
        change_type,
        security_flags: security,
        rubric_failures: vec![1; (change_byte % 32) as usize],
        new_tests,
    };

    let risk = score(&facts, &RiskConfig::default());
    assert!(risk.value >= 0.0);
    assert!(risk.value <= 1.0);
    assert_eq!(risk.breakdown.len(), 8);
});
