//! CLI argument definitions using clap
//!
//! This module contains all the clap structs and enums for parsing CLI arguments.
//! The actual command implementations are in the `commands` module.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sift_core::ExpenseId;

/// Sift - Turn scanned receipts and invoices into filed expenses
#[derive(Parser)]
#[command(name = "sift")]
#[command(about = "Receipt and invoice processing pipeline", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Expense store path (defaults to <data dir>/sift/expenses.json)
    #[arg(long, global = true)]
    pub data: Option<PathBuf>,

    /// Pipeline config file (defaults to the data dir override, then built-in)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// User whose history and expenses are used
    #[arg(long, default_value = "local", global = true)]
    pub user: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Extract fields from an OCR transcript
    Extract {
        /// Transcript file (.json token dump or plain text)
        #[arg(short, long)]
        file: PathBuf,

        /// Print the full extraction result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Suggest categories for a vendor
    Suggest {
        /// Vendor name
        #[arg(long)]
        vendor: String,

        /// Line-item description
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Check an artifact for duplicates, or mark filed expenses as duplicates
    Check {
        /// Original artifact (the bytes that get hashed)
        #[arg(short, long, required_unless_present_any = ["mark", "unmark", "list"])]
        file: Option<PathBuf>,

        /// Transcript for metadata matching (defaults to the artifact if it is text)
        #[arg(short, long, requires = "file")]
        transcript: Option<PathBuf>,

        /// Mark this filed expense as a duplicate (requires --of)
        #[arg(long, requires = "of", conflicts_with_all = ["file", "unmark", "list"])]
        mark: Option<ExpenseId>,

        /// The expense it duplicates
        #[arg(long, requires = "mark")]
        of: Option<ExpenseId>,

        /// Clear the duplicate mark on this expense
        #[arg(long, conflicts_with_all = ["file", "list"])]
        unmark: Option<ExpenseId>,

        /// List expenses marked as duplicates
        #[arg(long, conflicts_with = "file")]
        list: bool,
    },

    /// Run a document through extraction, review and categorization, then file it
    Process {
        /// Original artifact (the bytes that get hashed)
        #[arg(short, long)]
        file: PathBuf,

        /// Transcript to use instead of reading the artifact as text
        #[arg(short, long)]
        transcript: Option<PathBuf>,

        /// Category to file under (defaults to the top suggestion)
        #[arg(short, long)]
        category: Option<String>,

        /// File even when a blocking duplicate exists
        #[arg(long)]
        file_anyway: bool,
    },

    /// Show expense totals and duplicate-detection coverage
    Stats {
        /// Print the statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show learned vendor/category counts
    History {
        /// Only show this vendor
        #[arg(long)]
        vendor: Option<String>,
    },
}
