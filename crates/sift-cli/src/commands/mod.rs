//! CLI command implementations
//!
//! Commands are organized by stage:
//! - `common` - Shared utilities (store, config and transcript loading)
//! - `extract` - Field extraction from a transcript
//! - `suggest` - Category suggestions for a vendor
//! - `check` - Duplicate check for an artifact and duplicate marking
//! - `process` - Full pipeline run that files an expense
//! - `stats` - Expense totals and duplicate-detection coverage
//! - `history` - Learned vendor/category counts

pub mod check;
pub mod common;
pub mod extract;
pub mod history;
pub mod process;
pub mod stats;
pub mod suggest;

// Re-export command functions for main.rs
pub use check::*;
pub use common::*;
pub use extract::*;
pub use history::*;
pub use process::*;
pub use stats::*;
pub use suggest::*;

/// Truncate a string to a maximum number of characters, adding "..." if truncated
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
