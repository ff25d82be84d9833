//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async functions in the relay crates MUST NOT use blocking I/O.
//! **Required**: `tokio::net`, `tokio::fs`, async `reqwest`
//! **Acceptable**: blocking calls in non-async functions that run before the
//! server starts (configuration loading), test code

use architectural_enforcement::{code_part, in_async_fn, production_sources, violation};

#[test]
fn test_no_blocking_io_in_async_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (idx, line) in file.lines.iter().enumerate() {
            let code = code_part(line);

            if code.contains("reqwest::blocking") {
                violations.push(violation(&file, idx, "Blocking HTTP client"));
            }

            if code.contains("std::net::TcpStream") || code.contains("std::net::TcpListener") {
                violations.push(violation(&file, idx, "Blocking network I/O"));
            }

            if code.contains("std::thread::spawn") {
                violations.push(violation(&file, idx, "OS thread in async service"));
            }

            if (code.contains("std::fs::") || code.contains("std::process::Command"))
                && in_async_fn(&file.lines, idx)
            {
                violations.push(violation(&file, idx, "Blocking I/O in async fn"));
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O found in async production code!\n");
        for v in &violations {
            eprintln!("  ❌ {v}");
        }
        panic!(
            "\nFound {} blocking I/O violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
