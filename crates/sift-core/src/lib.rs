//! Sift Core Library
//!
//! Document processing pipeline for scanned invoices and receipts:
//! - Confidence-scored field extraction (vendor, amount, date, invoice number,
//!   description) from OCR transcripts
//! - Adaptive category suggestions learned from each user's filing history
//! - Duplicate detection by content hash, perceptual hash and metadata, plus
//!   user-confirmed duplicate links and expense statistics
//! - Per-document state machine with a bounded background worker pool
//! - Pluggable OCR and storage collaborators
//! - TOML configuration with environment overrides

pub mod categorize;
pub mod config;
pub mod duplicate;
pub mod error;
pub mod extract;
pub mod history;
pub mod models;
pub mod ocr;
pub mod pipeline;
pub mod similarity;
pub mod storage;
pub mod validation;

/// Test utilities including fixture transcripts and seeded stores
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use categorize::{
    Categorizer, CategorizerConfig, ExpenseStatistics, GroupTotal, KeywordTable, DEFAULT_CATEGORY,
};
pub use config::{default_config_path, PipelineConfig};
pub use duplicate::{
    average_hash, content_hash, mark_as_duplicate, marked_duplicates, unmark_duplicate,
    DuplicateConfig, DuplicateDetector, DuplicateStats, SimilarExpense,
};
pub use error::{Error, Result};
pub use extract::{aggregate_confidence, ExtractionHints, ExtractorConfig, FieldExtractor};
pub use history::{CategoryUsage, HistoryRegistry, VendorCategoryHistory, VendorEntry};
pub use models::*;
pub use ocr::{parse_transcript, OcrEngine, PlainTextOcr, StaticTranscriptOcr};
pub use pipeline::{
    AuditEntry, DocumentStatus, ExtractionReport, Pipeline, TaskConfig, TaskId, TaskOutput,
    TaskStatus, Trigger,
};
pub use similarity::{normalize_vendor, LevenshteinRatio, SimilarityScorer};
pub use storage::{link_duplicate, ExpenseStore, MemoryStore};
pub use validation::{validate_reviewed, ValidationConfig};
