//! Compile-stage output classification.
//!
//! The ProvenCore build ends with a line of the form
//!
//! ```text
//! Check /path/to/some/build.log too
//! ```
//!
//! on stderr, whether it failed or merely produced warnings. The grammar is a
//! literal `Check `, one absolute path ending in `.log` (captured), and a
//! literal ` too`. The exit code decides which of the two it was.

use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::stage::{Stage, StageResult};

pub const COMPILATION_FAILED: &str = "Compilation failed";
pub const COMPILATION_SUCCESSFUL: &str = "Compilation successful";

fn log_reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"Check ((?:/[^/ ]*)+/?\.log) too").expect("log reference pattern is valid")
    })
}

/// First log path referenced in `text`, if any.
pub fn find_log_reference(text: &str) -> Option<PathBuf> {
    log_reference_pattern()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| PathBuf::from(m.as_str()))
}

/// Turn the compile command's exit code and stderr into a stage result.
pub fn classify_compile(exit_code: i32, stderr: &str) -> StageResult {
    let result = if exit_code == 0 {
        StageResult::success(Stage::Compiling)
    } else {
        StageResult::failure(Stage::Compiling, exit_code)
    };

    match find_log_reference(stderr) {
        Some(log) if exit_code == 0 => result
            .with_diagnostic(log)
            .with_message(COMPILATION_SUCCESSFUL),
        Some(log) => result.with_diagnostic(log).with_message(COMPILATION_FAILED),
        None => result,
    }
}
