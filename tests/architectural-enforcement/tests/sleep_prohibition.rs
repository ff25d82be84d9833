//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production relay code MUST NOT call sleep methods. A failed
//! attempt moves to the next channel immediately; waiting only ever happens on
//! I/O (upstream responses, inbound connections, shutdown signals).
//! **Exceptions**: test code

use architectural_enforcement::{code_part, production_sources, violation};

#[test]
fn test_no_sleep_in_production_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (idx, line) in file.lines.iter().enumerate() {
            let code = code_part(line);
            if code.contains("::sleep(") || code.contains(".sleep(") || code.contains("sleep_until(") {
                violations.push(violation(&file, idx, "Sleep call"));
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");
        for v in &violations {
            eprintln!("  ❌ {v}");
        }
        eprintln!("\n✅ Retry by selecting another channel, wait on I/O with tokio::time::timeout");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
