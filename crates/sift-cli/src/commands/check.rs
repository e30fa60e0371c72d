//! Duplicate check and duplicate marking commands

use std::path::Path;

use anyhow::{Context, Result};
use sift_core::{
    content_hash, mark_as_duplicate, marked_duplicates, unmark_duplicate, DocumentFingerprint,
    DocumentMetadata, DuplicateCandidate, DuplicateDetector, Expense, ExpenseFilter, ExpenseId,
    ExpenseStore, ExtractionHints, FieldExtractor, Transcript,
};

use super::common::{load_config, open_store, read_artifact, read_transcript};
use super::truncate;

/// Print duplicate candidates for an artifact and return them
pub async fn cmd_check(
    data: &Path,
    config: Option<&Path>,
    user: &str,
    file: &Path,
    transcript: Option<&Path>,
) -> Result<Vec<DuplicateCandidate>> {
    let config = load_config(config)?;
    let store = open_store(data)?;
    let bytes = read_artifact(file)?;

    let transcript = match transcript {
        Some(path) => Some(read_transcript(path)?),
        None => std::str::from_utf8(&bytes).ok().map(Transcript::from_text),
    };
    let incoming = match &transcript {
        Some(t) => {
            let extractor = FieldExtractor::with_config(config.extractor.clone());
            DocumentMetadata::from(&extractor.extract_with(t, &ExtractionHints::default()))
        }
        None => DocumentMetadata::default(),
    };

    let fingerprint = DocumentFingerprint {
        content_hash: content_hash(&bytes),
        perceptual_hash: None,
    };
    let existing = store
        .query(&ExpenseFilter::for_user(user))
        .await
        .context("Failed to query expenses")?;

    let detector = DuplicateDetector::with_config(config.duplicate);
    let candidates = detector.check(&fingerprint, &incoming, &existing);

    if candidates.is_empty() {
        println!("✅ No duplicates among {} expenses", existing.len());
    } else {
        println!("🔍 {} possible duplicate(s)", candidates.len());
        print_candidates(&candidates);
    }
    Ok(candidates)
}

pub fn print_candidates(candidates: &[DuplicateCandidate]) {
    for c in candidates {
        let marker = if c.is_blocking() { "⛔" } else { "⚠️ " };
        let signals: Vec<&str> = c.signals.iter().map(|s| s.as_str()).collect();
        println!(
            "   {} expense #{:<6} score {:>3}  [{}]",
            marker,
            c.expense_id,
            c.score,
            signals.join(", ")
        );
        for reason in &c.reasons {
            println!("        - {}", reason);
        }
    }
}

/// Record that `expense_id` double-files `original_id`
pub async fn cmd_mark_duplicate(
    data: &Path,
    user: &str,
    expense_id: ExpenseId,
    original_id: ExpenseId,
) -> Result<Expense> {
    let store = open_store(data)?;
    let marked = mark_as_duplicate(store.as_ref(), user, expense_id, original_id)
        .await
        .context("Failed to mark duplicate")?;
    println!(
        "🔗 Expense #{} ({}) marked as a duplicate of #{}",
        marked.id,
        marked.vendor,
        marked.duplicate_of.unwrap_or(original_id)
    );
    Ok(marked)
}

pub async fn cmd_unmark_duplicate(
    data: &Path,
    user: &str,
    expense_id: ExpenseId,
) -> Result<Expense> {
    let store = open_store(data)?;
    let cleared = unmark_duplicate(store.as_ref(), user, expense_id)
        .await
        .context("Failed to unmark duplicate")?;
    println!("✂️  Expense #{} is no longer marked as a duplicate", cleared.id);
    Ok(cleared)
}

pub async fn cmd_list_duplicates(data: &Path, user: &str) -> Result<Vec<Expense>> {
    let store = open_store(data)?;
    let duplicates = marked_duplicates(store.as_ref(), user, None)
        .await
        .context("Failed to query expenses")?;

    if duplicates.is_empty() {
        println!("No expenses marked as duplicates for {}", user);
    } else {
        println!("🔗 {} marked duplicate(s)", duplicates.len());
        for expense in &duplicates {
            println!(
                "   #{:<6} {:<24} {:>10.2}  {}  duplicate of #{}",
                expense.id,
                truncate(&expense.vendor, 24),
                expense.amount,
                expense.date,
                expense.duplicate_of.unwrap_or_default()
            );
        }
    }
    Ok(duplicates)
}
