//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! across the relay crates:
//! - No sleep() calls in production code (attempts retry immediately)
//! - No blocking I/O inside async functions
//! - No unwrap()/expect() in production code
//!
//! The helpers here locate production sources and strip test-only code so each
//! check only sees what ships.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source roots, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["relay/core/src", "relay/daemon/src"];

/// Files compiled only for tests
const TEST_ONLY_FILES: &[&str] = &["test_utils.rs"];

/// A production source file with test modules removed
#[derive(Debug)]
pub struct SourceFile {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

/// Workspace root (two levels above this crate)
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Load every production `.rs` file under [`PRODUCTION_DIRS`]
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }

        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let file = entry.path();
            if file.extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let name = file.file_name().and_then(|s| s.to_str()).unwrap_or("");
            if TEST_ONLY_FILES.contains(&name) {
                continue;
            }
            if let Ok(content) = fs::read_to_string(file) {
                files.push(SourceFile {
                    path: file.to_path_buf(),
                    lines: strip_test_code(&content),
                });
            }
        }
    }
    files
}

/// Drop everything from the first `#[cfg(test)]` onwards
///
/// Test modules sit at the bottom of each file in this workspace.
pub fn strip_test_code(content: &str) -> Vec<String> {
    content
        .lines()
        .take_while(|line| !line.trim_start().starts_with("#[cfg(test)]"))
        .map(str::to_string)
        .collect()
}

/// Code part of a line, without trailing `//` comments
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Whether the closest enclosing function above `idx` is `async`
pub fn in_async_fn(lines: &[String], idx: usize) -> bool {
    for line in lines[..=idx].iter().rev() {
        let code = code_part(line);
        if code.contains("fn ") {
            return code.contains("async fn ");
        }
    }
    false
}

/// Format a violation line
pub fn violation(file: &SourceFile, idx: usize, what: &str) -> String {
    format!(
        "{}:{} - {}: {}",
        file.path.display(),
        idx + 1,
        what,
        file.lines[idx].trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_test_code() {
        let lines = strip_test_code("fn a() {}\n#[cfg(test)]\nmod tests {}\n");
        assert_eq!(lines, vec!["fn a() {}".to_string()]);
    }

    #[test]
    fn test_in_async_fn() {
        let lines: Vec<String> = ["pub async fn run() {", "    x();", "}", "fn load() {", "    y();"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(in_async_fn(&lines, 1));
        assert!(!in_async_fn(&lines, 4));
    }

    #[test]
    fn test_production_dirs_exist() {
        let root = workspace_root();
        for dir in PRODUCTION_DIRS {
            assert!(root.join(dir).exists(), "missing {dir}");
        }
    }
}
