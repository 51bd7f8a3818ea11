#![no_main]

use chrono::Utc;
use gitguard::{Normalizer, NormalizerConfig};
use gitguard_types::EventKind;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let normalizer = Normalizer::new(&NormalizerConfig::default()).expect("build");
    for kind in [
        EventKind::PullRequest,
        EventKind::Push,
        EventKind::Review,
        EventKind::CheckRun,
        EventKind::Release,
        EventKind::Ping,
    ] {
        // Errors are fine; panics are not. A successful normalize must
        // round-trip through its canonical form.
        if let Ok(event) = normalizer.normalize(kind, "opened", &raw, Utc::now()) {
            let canonical = normalizer.canonicalize(&event);
            let again = normalizer
                .normalize(kind, "opened", &canonical, Utc::now())
                .expect("canonical form must re-normalize");
            assert_eq!(event.payload, again.payload);
            let _ = normalizer.derive_facts(&event);
        }
    }
});
