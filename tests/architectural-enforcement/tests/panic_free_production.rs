//! Integration Test: Panic-Free Production Code
//!
//! **Policy**: Production relay code propagates errors with `Result`; it does
//! not call `unwrap()` or `expect()`. Panics that still happen are caught at
//! the HTTP boundary, but none should originate from our own code.
//! **Exceptions**: test code, test utilities

use architectural_enforcement::{code_part, production_sources, violation};

#[test]
fn test_no_unwrap_or_expect_in_production_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (idx, line) in file.lines.iter().enumerate() {
            let code = code_part(line);
            if code.contains(".unwrap()") || code.contains(".expect(") {
                violations.push(violation(&file, idx, "Panicking unwrap"));
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ unwrap()/expect() found in production code!\n");
        for v in &violations {
            eprintln!("  ❌ {v}");
        }
        panic!(
            "\nFound {} unwrap/expect call(s) in production code.\nUse ? or an explicit fallback.",
            violations.len()
        );
    }
}
