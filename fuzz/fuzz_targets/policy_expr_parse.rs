#![no_main]

use gitguard_policy::{EvalCtx, eval_bool, parse};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parsing arbitrary input must never panic, and whatever parses must
    // evaluate without panicking against an arbitrary-ish document.
    if let Ok(expr) = parse(data) {
        let input = serde_json::json!({
            "action": "opened",
            "score": {"value": 0.5},
            "approvals": ["alice"],
            "now": {"weekday": "Fri", "hour": 17},
        });
        let ctx = EvalCtx::new(&input);
        let _ = eval_bool(&expr, &ctx);
    }
});
