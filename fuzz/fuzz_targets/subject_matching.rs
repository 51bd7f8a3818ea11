#![no_main]

use gitguard_stream::{dlq_subject, subject_matches};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str)| {
    let (filter, subject) = data;
    let _ = subject_matches(filter, subject);

    // Dead-letter rewriting keeps the subject under the dlq hierarchy and
    // is stable on its own output's tail.
    let dlq = dlq_subject(subject);
    assert!(dlq.starts_with("gh.dlq."));
});
