#![no_main]

use gitguard_redact::Redactor;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let redactor = Redactor::new();
    let once = redactor.redact(data);
    let twice = redactor.redact(&once);

    // Redaction must be a fixpoint after one application.
    assert_eq!(once, twice);
});
