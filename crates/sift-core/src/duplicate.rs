//! Duplicate detection
//!
//! Scores an incoming document against the user's existing expenses:
//! - identical content hash: score 100, and only exact matches are returned
//! - perceptual hash within 10 bits: up to 60 points
//! - metadata (invoice number, vendor, amount, date): up to 100 points
//!
//! Candidates at or above the blocking threshold need an explicit override
//! before filing; lower-scoring ones are shown as notices. The detector is
//! read-only.
//!
//! Users can also confirm after the fact that a filed expense double-files
//! another one; [`mark_as_duplicate`] records that link in the store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{
    DocumentFingerprint, DocumentMetadata, DuplicateCandidate, DuplicateSeverity, Expense,
    ExpenseFilter, ExpenseId, MatchSignal,
};
use crate::similarity::{normalize_vendor, LevenshteinRatio, SimilarityScorer};
use crate::storage::ExpenseStore;

pub const DEFAULT_BLOCKING_THRESHOLD: u8 = 85;
pub const DEFAULT_NOTICE_THRESHOLD: u8 = 50;

/// Duplicate scoring constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateConfig {
    pub blocking_threshold: u8,
    pub notice_threshold: u8,
    /// Hamming distances above this never count as a perceptual match
    pub perceptual_max_distance: u32,
    pub perceptual_points: f64,
    pub invoice_points: f64,
    pub vendor_points: f64,
    pub vendor_threshold: f64,
    pub amount_exact_points: f64,
    pub amount_near_points: f64,
    /// Relative difference considered "near" for amounts
    pub amount_near_fraction: f64,
    pub date_exact_points: f64,
    pub date_near_points: f64,
    pub date_near_days: i64,
    /// Minimum score for `similar_expenses`
    pub similar_min_score: f64,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            blocking_threshold: DEFAULT_BLOCKING_THRESHOLD,
            notice_threshold: DEFAULT_NOTICE_THRESHOLD,
            perceptual_max_distance: 10,
            perceptual_points: 60.0,
            invoice_points: 50.0,
            vendor_points: 20.0,
            vendor_threshold: 0.85,
            amount_exact_points: 20.0,
            amount_near_points: 10.0,
            amount_near_fraction: 0.05,
            date_exact_points: 15.0,
            date_near_points: 5.0,
            date_near_days: 7,
            similar_min_score: 50.0,
        }
    }
}

/// SHA-256 of the raw bytes, lowercase hex
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// 64-bit average hash of an 8-bit grayscale image.
///
/// The image is box-downsampled to 8×8; each bit is set when its cell is
/// brighter than the mean of all cells (row-major, most significant bit
/// first). Returns None for empty or truncated buffers.
pub fn average_hash(luma: &[u8], width: usize, height: usize) -> Option<u64> {
    if width == 0 || height == 0 || luma.len() < width.checked_mul(height)? {
        return None;
    }

    let mut cells = [0f64; 64];
    for cy in 0..8 {
        let y0 = cy * height / 8;
        let y1 = ((cy + 1) * height / 8).max(y0 + 1).min(height);
        for cx in 0..8 {
            let x0 = cx * width / 8;
            let x1 = ((cx + 1) * width / 8).max(x0 + 1).min(width);
            let mut sum = 0u64;
            let mut n = 0u64;
            for y in y0.min(height - 1)..y1 {
                for x in x0.min(width - 1)..x1 {
                    sum += luma[y * width + x] as u64;
                    n += 1;
                }
            }
            cells[cy * 8 + cx] = if n == 0 { 0.0 } else { sum as f64 / n as f64 };
        }
    }

    let mean = cells.iter().sum::<f64>() / 64.0;
    let hash = cells
        .iter()
        .fold(0u64, |acc, &cell| (acc << 1) | u64::from(cell > mean));
    Some(hash)
}

/// Render a perceptual hash as 16 hex digits
pub fn format_perceptual_hash(hash: u64) -> String {
    hex::encode(hash.to_be_bytes())
}

pub fn parse_perceptual_hash(text: &str) -> Option<u64> {
    let bytes = hex::decode(text.trim()).ok()?;
    let bytes: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// An expense related to (not necessarily a duplicate of) the incoming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarExpense {
    pub expense_id: ExpenseId,
    pub score: u8,
}

/// Duplicate detector with pluggable vendor similarity
#[derive(Clone)]
pub struct DuplicateDetector {
    config: DuplicateConfig,
    scorer: Arc<dyn SimilarityScorer>,
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl DuplicateDetector {
    pub fn new() -> Self {
        Self::with_config(DuplicateConfig::default())
    }

    pub fn with_config(config: DuplicateConfig) -> Self {
        Self {
            config,
            scorer: Arc::new(LevenshteinRatio),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn SimilarityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn config(&self) -> &DuplicateConfig {
        &self.config
    }

    fn vendor_ratio(&self, a: &str, b: &str) -> f64 {
        self.scorer.ratio(&normalize_vendor(a), &normalize_vendor(b))
    }

    fn severity(&self, score: u8) -> DuplicateSeverity {
        if score >= self.config.blocking_threshold {
            DuplicateSeverity::Blocking
        } else {
            DuplicateSeverity::Notice
        }
    }

    /// Candidates scoring at least the notice threshold, best first
    pub fn check(
        &self,
        fingerprint: &DocumentFingerprint,
        incoming: &DocumentMetadata,
        existing: &[Expense],
    ) -> Vec<DuplicateCandidate> {
        let hash = fingerprint.content_hash.trim();
        if !hash.is_empty() {
            let mut exact: Vec<DuplicateCandidate> = existing
                .iter()
                .filter(|e| e.content_hash.as_deref() == Some(hash))
                .map(|e| DuplicateCandidate {
                    expense_id: e.id,
                    score: 100,
                    signals: vec![MatchSignal::ExactHash],
                    severity: DuplicateSeverity::Blocking,
                    reasons: vec!["Identical file content".to_string()],
                })
                .collect();
            if !exact.is_empty() {
                exact.sort_by_key(|c| c.expense_id);
                return exact;
            }
        }

        let mut candidates: Vec<DuplicateCandidate> = existing
            .iter()
            .filter_map(|expense| self.score_one(fingerprint, incoming, expense))
            .filter(|c| c.score >= self.config.notice_threshold)
            .collect();
        candidates.sort_by(|a, b| b.score.cmp(&a.score).then(a.expense_id.cmp(&b.expense_id)));
        candidates
    }

    fn score_one(
        &self,
        fingerprint: &DocumentFingerprint,
        incoming: &DocumentMetadata,
        expense: &Expense,
    ) -> Option<DuplicateCandidate> {
        let mut signals = Vec::new();
        let mut reasons = Vec::new();

        let mut perceptual: f64 = 0.0;
        if let (Some(a), Some(b)) = (fingerprint.perceptual_hash, expense.perceptual_hash) {
            let distance = hamming(a, b);
            if distance <= self.config.perceptual_max_distance {
                perceptual = self.config.perceptual_points * (1.0 - distance as f64 / 64.0);
                signals.push(MatchSignal::PerceptualHash);
                reasons.push(format!("Visually similar image (distance {})", distance));
            }
        }

        let (metadata, mut metadata_reasons) = self.metadata_score(incoming, expense);
        if metadata > 0.0 {
            signals.push(MatchSignal::Metadata);
            reasons.append(&mut metadata_reasons);
        }

        if signals.is_empty() {
            return None;
        }

        let score = (perceptual + metadata).min(100.0).round() as u8;
        Some(DuplicateCandidate {
            expense_id: expense.id,
            score,
            signals,
            severity: self.severity(score),
            reasons,
        })
    }

    fn metadata_score(&self, incoming: &DocumentMetadata, expense: &Expense) -> (f64, Vec<String>) {
        let config = &self.config;
        let mut score: f64 = 0.0;
        let mut reasons = Vec::new();

        let invoices = (incoming.invoice_number.as_deref(), expense.invoice_number.as_deref());
        if let (Some(a), Some(b)) = invoices {
            let (a, b) = (a.trim(), b.trim());
            if !a.is_empty() && a.eq_ignore_ascii_case(b) {
                score += config.invoice_points;
                reasons.push(format!("Same invoice number: {}", b));
            }
        }

        if let Some(vendor) = incoming.vendor.as_deref() {
            if !vendor.trim().is_empty()
                && self.vendor_ratio(vendor, &expense.vendor) >= config.vendor_threshold
            {
                score += config.vendor_points;
                reasons.push(format!("Similar vendor: {}", expense.vendor));
            }
        }

        if let Some(amount) = incoming.amount {
            let diff = (amount - expense.amount).abs();
            let largest = amount.abs().max(expense.amount.abs());
            if diff < 0.01 {
                score += config.amount_exact_points;
                reasons.push(format!("Same amount: {:.2}", expense.amount));
            } else if largest > 0.0 && diff / largest <= config.amount_near_fraction {
                score += config.amount_near_points;
                reasons.push(format!("Similar amount: {:.2}", expense.amount));
            }
        }

        if let Some(date) = incoming.date {
            let days = (date - expense.date).num_days().abs();
            if days == 0 {
                score += config.date_exact_points;
                reasons.push(format!("Same date: {}", expense.date));
            } else if days <= config.date_near_days {
                score += config.date_near_points;
                reasons.push(format!("Close date: {}", expense.date));
            }
        }

        (score.min(100.0), reasons)
    }

    /// Related expenses for context during review, best first.
    ///
    /// Score is vendor similarity × 40, same category +30, and amount
    /// closeness × 30; only scores of at least 50 are returned.
    pub fn similar_expenses(
        &self,
        incoming: &DocumentMetadata,
        category: Option<&str>,
        existing: &[Expense],
        limit: usize,
    ) -> Vec<SimilarExpense> {
        let mut similar: Vec<(f64, ExpenseId)> = existing
            .iter()
            .filter_map(|expense| {
                let mut score: f64 = 0.0;
                if let Some(vendor) = incoming.vendor.as_deref() {
                    if !vendor.trim().is_empty() && !expense.vendor.trim().is_empty() {
                        score += self.vendor_ratio(vendor, &expense.vendor) * 40.0;
                    }
                }
                if let Some(category) = category {
                    if !category.is_empty() && expense.category == category {
                        score += 30.0;
                    }
                }
                if let Some(amount) = incoming.amount {
                    let largest = amount.max(expense.amount);
                    if amount > 0.0 && expense.amount > 0.0 && largest > 0.0 {
                        let diff = (amount - expense.amount).abs();
                        score += (1.0 - (diff / largest).min(1.0)) * 30.0;
                    }
                }
                (score >= self.config.similar_min_score).then_some((score, expense.id))
            })
            .collect();

        similar.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        similar
            .into_iter()
            .take(limit)
            .map(|(score, expense_id)| SimilarExpense {
                expense_id,
                score: score.min(100.0).round() as u8,
            })
            .collect()
    }
}

// ============================================================================
// Confirmed duplicates
// ============================================================================

/// How much duplicate-detection signal a user's expenses carry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateStats {
    pub total_expenses: usize,
    pub with_content_hash: usize,
    pub with_perceptual_hash: usize,
    pub with_invoice_number: usize,
    pub marked_duplicates: usize,
}

impl DuplicateStats {
    pub fn from_expenses(expenses: &[Expense]) -> Self {
        let count = |f: fn(&Expense) -> bool| expenses.iter().filter(|e| f(e)).count();
        Self {
            total_expenses: expenses.len(),
            with_content_hash: count(|e| e.content_hash.is_some()),
            with_perceptual_hash: count(|e| e.perceptual_hash.is_some()),
            with_invoice_number: count(|e| {
                e.invoice_number
                    .as_deref()
                    .is_some_and(|n| !n.trim().is_empty())
            }),
            marked_duplicates: count(Expense::is_marked_duplicate),
        }
    }
}

fn find_expense(expenses: &[Expense], id: ExpenseId) -> Result<&Expense> {
    expenses
        .iter()
        .find(|e| e.id == id)
        .ok_or_else(|| Error::NotFound(format!("expense {}", id)))
}

/// Record that `expense_id` double-files `original_id`.
///
/// Both expenses must belong to `user_id`. Marking against an expense that
/// is itself a duplicate links to that expense's original instead, so links
/// are never chained.
pub async fn mark_as_duplicate(
    store: &dyn ExpenseStore,
    user_id: &str,
    expense_id: ExpenseId,
    original_id: ExpenseId,
) -> Result<Expense> {
    if expense_id == original_id {
        return Err(Error::InvalidData(format!(
            "expense {} cannot duplicate itself",
            expense_id
        )));
    }

    let expenses = store.query(&ExpenseFilter::for_user(user_id)).await?;
    find_expense(&expenses, expense_id)?;
    let original = find_expense(&expenses, original_id)?;
    let root = original.duplicate_of.unwrap_or(original.id);
    if root == expense_id {
        return Err(Error::InvalidData(format!(
            "expense {} is the original of {}",
            expense_id, original_id
        )));
    }
    if expenses.iter().any(|e| e.duplicate_of == Some(expense_id)) {
        return Err(Error::InvalidData(format!(
            "expense {} has duplicates of its own; unmark them first",
            expense_id
        )));
    }

    let marked = store.set_duplicate_of(expense_id, Some(root)).await?;
    info!(user = user_id, expense_id, duplicate_of = root, "Marked expense as duplicate");
    Ok(marked)
}

/// Clear a duplicate link. Unmarking an unmarked expense is a no-op.
pub async fn unmark_duplicate(
    store: &dyn ExpenseStore,
    user_id: &str,
    expense_id: ExpenseId,
) -> Result<Expense> {
    let expenses = store.query(&ExpenseFilter::for_user(user_id)).await?;
    let expense = find_expense(&expenses, expense_id)?;
    if !expense.is_marked_duplicate() {
        debug!(expense_id, "Expense is not marked as a duplicate");
        return Ok(expense.clone());
    }

    let cleared = store.set_duplicate_of(expense_id, None).await?;
    info!(user = user_id, expense_id, "Unmarked duplicate expense");
    Ok(cleared)
}

/// Expenses the user marked as duplicates, optionally only those of `original`
pub async fn marked_duplicates(
    store: &dyn ExpenseStore,
    user_id: &str,
    original: Option<ExpenseId>,
) -> Result<Vec<Expense>> {
    let expenses = store.query(&ExpenseFilter::for_user(user_id)).await?;
    Ok(expenses
        .into_iter()
        .filter(|e| match original {
            Some(id) => e.duplicate_of == Some(id),
            None => e.is_marked_duplicate(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    use crate::models::NewExpense;

    fn expense(id: ExpenseId, vendor: &str, amount: f64, date: (i32, u32, u32)) -> Expense {
        NewExpense {
            user_id: "alice".into(),
            vendor: vendor.into(),
            amount,
            currency: None,
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            category: "Office Supplies".into(),
            description: String::new(),
            invoice_number: None,
            notes: None,
            tags: vec![],
            document_id: None,
            original_filename: None,
            content_hash: None,
            perceptual_hash: None,
            confidence: 80,
            raw_text: None,
        }
        .into_expense(id, Utc::now())
    }

    fn incoming(vendor: &str, amount: f64, date: (i32, u32, u32)) -> DocumentMetadata {
        DocumentMetadata {
            vendor: Some(vendor.into()),
            amount: Some(amount),
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2),
            invoice_number: None,
        }
    }

    #[test]
    fn test_content_hash() {
        assert_eq!(
            content_hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_exact_hash_short_circuits() {
        let mut same = expense(7, "Other Vendor", 1.0, (2020, 1, 1));
        same.content_hash = Some(content_hash(b"file"));
        let lookalike = expense(3, "Staples", 42.0, (2024, 11, 5));
        let fingerprint = DocumentFingerprint {
            content_hash: content_hash(b"file"),
            perceptual_hash: None,
        };

        let candidates = DuplicateDetector::new().check(
            &fingerprint,
            &incoming("Staples", 42.0, (2024, 11, 5)),
            &[lookalike, same],
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].expense_id, 7);
        assert_eq!(candidates[0].score, 100);
        assert_eq!(candidates[0].signals, vec![MatchSignal::ExactHash]);
        assert!(candidates[0].is_blocking());
    }

    #[test]
    fn test_metadata_scoring() {
        let mut existing = expense(1, "Staples Inc", 42.99, (2024, 11, 5));
        existing.invoice_number = Some("INV-100".into());
        let mut p = incoming("Staples", 42.99, (2024, 11, 5));
        p.invoice_number = Some("inv-100".into());

        let candidates =
            DuplicateDetector::new().check(&DocumentFingerprint::default(), &p, &[existing]);
        // 50 + 20 + 20 + 15, capped
        assert_eq!(candidates[0].score, 100);
        assert_eq!(candidates[0].signals, vec![MatchSignal::Metadata]);
        assert_eq!(candidates[0].severity, DuplicateSeverity::Blocking);
    }

    #[test]
    fn test_notice_band() {
        // vendor 20 + near amount 10 + same date 15 = 45: hidden
        let existing = vec![expense(1, "Staples", 100.0, (2024, 11, 5))];
        let detector = DuplicateDetector::new();
        let candidates = detector.check(
            &DocumentFingerprint::default(),
            &incoming("Staples", 103.0, (2024, 11, 5)),
            &existing,
        );
        assert!(candidates.is_empty());

        // vendor 20 + same amount 20 + close date 5 + perceptual
        let mut existing = expense(2, "Staples", 100.0, (2024, 11, 1));
        existing.perceptual_hash = Some(0xFFFF_0000_FFFF_0000);
        let fingerprint = DocumentFingerprint {
            content_hash: "abc".into(),
            perceptual_hash: Some(0xFFFF_0000_FFFF_0001),
        };
        let candidates = detector.check(
            &fingerprint,
            &incoming("Staples", 100.0, (2024, 11, 5)),
            &[existing],
        );
        // 45 + 60 × 63/64 = 104 -> 100
        assert_eq!(candidates[0].score, 100);
        assert!(candidates[0].signals.contains(&MatchSignal::PerceptualHash));
    }

    #[test]
    fn test_notice_severity() {
        let existing = vec![expense(4, "Staples", 100.0, (2024, 11, 5))];
        let candidates = DuplicateDetector::new().check(
            &DocumentFingerprint::default(),
            &incoming("Staples", 100.0, (2024, 11, 5)),
            &existing,
        );
        // 20 + 20 + 15
        assert_eq!(candidates[0].score, 55);
        assert_eq!(candidates[0].severity, DuplicateSeverity::Notice);
    }

    #[test]
    fn test_perceptual_distance_limit() {
        let mut existing = expense(1, "Nobody", 1.0, (2001, 1, 1));
        existing.perceptual_hash = Some(0);
        let detector = DuplicateDetector::new();

        let near = DocumentFingerprint {
            content_hash: String::new(),
            perceptual_hash: Some(0b11),
        };
        let candidates = detector.check(&near, &DocumentMetadata::default(), &[existing.clone()]);
        // 60 × (1 - 2/64) = 58.1
        assert_eq!(candidates[0].score, 58);

        let far = DocumentFingerprint {
            content_hash: String::new(),
            perceptual_hash: Some(0x7FF),
        };
        assert!(detector.check(&far, &DocumentMetadata::default(), &[existing]).is_empty());
    }

    #[test]
    fn test_sorted_by_score_then_id() {
        let existing = vec![
            expense(9, "Staples", 100.0, (2024, 11, 5)),
            expense(2, "Staples", 100.0, (2024, 11, 5)),
            expense(5, "Staples", 100.0, (2024, 11, 2)),
        ];
        let candidates = DuplicateDetector::new().check(
            &DocumentFingerprint::default(),
            &incoming("Staples", 100.0, (2024, 11, 5)),
            &existing,
        );
        let ids: Vec<_> = candidates.iter().map(|c| c.expense_id).collect();
        assert_eq!(ids, vec![2, 9]);
    }

    #[test]
    fn test_average_hash() {
        let mut luma = vec![0u8; 16 * 16];
        for y in 0..16 {
            for x in 8..16 {
                luma[y * 16 + x] = 255;
            }
        }
        let hash = average_hash(&luma, 16, 16).unwrap();
        assert_eq!(hash, 0x0F0F_0F0F_0F0F_0F0F);

        let tiny = average_hash(&[10, 200, 30, 250], 2, 2).unwrap();
        assert_eq!(tiny.count_ones(), 32);

        assert!(average_hash(&[], 0, 0).is_none());
        assert!(average_hash(&[1, 2, 3], 2, 2).is_none());
    }

    #[test]
    fn test_perceptual_hash_hex() {
        let hash = 0x0123_4567_89AB_CDEF;
        assert_eq!(format_perceptual_hash(hash), "0123456789abcdef");
        assert_eq!(parse_perceptual_hash("0123456789abcdef"), Some(hash));
        assert_eq!(parse_perceptual_hash("xyz"), None);
        assert_eq!(parse_perceptual_hash("0123"), None);
    }

    #[test]
    fn test_similar_expenses() {
        let detector = DuplicateDetector::new();
        let mut existing = vec![
            expense(1, "Staples", 40.0, (2024, 1, 1)),
            expense(2, "Staples", 400.0, (2024, 1, 1)),
            expense(3, "Uber", 12.0, (2024, 1, 1)),
        ];
        existing[2].category = "Travel".into();
        let similar = detector.similar_expenses(
            &incoming("Staples", 40.0, (2024, 6, 1)),
            Some("Office Supplies"),
            &existing,
            5,
        );
        assert_eq!(similar[0].expense_id, 1);
        assert_eq!(similar[0].score, 100);
        // 40 + 30 + 3
        assert_eq!(similar[1].expense_id, 2);
        assert_eq!(similar[1].score, 73);
        assert_eq!(similar.len(), 2);
        assert!(detector
            .similar_expenses(&incoming("Staples", 40.0, (2024, 6, 1)), None, &existing, 1)
            .len()
            <= 1);
    }

    // ==================== Confirmed duplicate tests ====================

    fn filed_store() -> crate::storage::MemoryStore {
        let mut first = expense(1, "Staples", 42.99, (2024, 11, 5));
        first.content_hash = Some("abc".into());
        first.invoice_number = Some("A-1".into());
        let mut second = expense(2, "Staples", 42.99, (2024, 11, 5));
        second.perceptual_hash = Some(7);
        let third = expense(3, "Uber", 18.0, (2024, 11, 6));
        let mut other_user = expense(4, "Staples", 42.99, (2024, 11, 5));
        other_user.user_id = "bob".into();
        crate::storage::MemoryStore::with_expenses(vec![first, second, third, other_user])
    }

    #[tokio::test]
    async fn test_mark_and_unmark_duplicate() {
        let store = filed_store();

        let marked = mark_as_duplicate(&store, "alice", 2, 1).await.unwrap();
        assert_eq!(marked.duplicate_of, Some(1));
        let found = marked_duplicates(&store, "alice", None).await.unwrap();
        assert_eq!(found.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2]);
        assert!(marked_duplicates(&store, "alice", Some(3)).await.unwrap().is_empty());

        let cleared = unmark_duplicate(&store, "alice", 2).await.unwrap();
        assert!(!cleared.is_marked_duplicate());
        assert!(marked_duplicates(&store, "alice", None).await.unwrap().is_empty());

        // Unmarking again changes nothing
        assert!(!unmark_duplicate(&store, "alice", 2).await.unwrap().is_marked_duplicate());
    }

    #[tokio::test]
    async fn test_mark_links_to_root_original() {
        let store = filed_store();
        mark_as_duplicate(&store, "alice", 2, 1).await.unwrap();

        let marked = mark_as_duplicate(&store, "alice", 3, 2).await.unwrap();
        assert_eq!(marked.duplicate_of, Some(1));
        assert_eq!(marked_duplicates(&store, "alice", Some(1)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_mark_rejects_bad_links() {
        let store = filed_store();
        assert!(matches!(
            mark_as_duplicate(&store, "alice", 1, 1).await,
            Err(Error::InvalidData(_))
        ));
        assert!(matches!(
            mark_as_duplicate(&store, "alice", 2, 99).await,
            Err(Error::NotFound(_))
        ));
        // Another user's expense is invisible
        assert!(matches!(
            mark_as_duplicate(&store, "alice", 2, 4).await,
            Err(Error::NotFound(_))
        ));

        mark_as_duplicate(&store, "alice", 2, 1).await.unwrap();
        assert!(matches!(
            mark_as_duplicate(&store, "alice", 1, 2).await,
            Err(Error::InvalidData(_))
        ));
        assert!(matches!(
            mark_as_duplicate(&store, "alice", 1, 3).await,
            Err(Error::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_stats() {
        let store = filed_store();
        mark_as_duplicate(&store, "alice", 2, 1).await.unwrap();

        let expenses = store.query(&ExpenseFilter::for_user("alice")).await.unwrap();
        let stats = DuplicateStats::from_expenses(&expenses);
        assert_eq!(
            stats,
            DuplicateStats {
                total_expenses: 3,
                with_content_hash: 1,
                with_perceptual_hash: 1,
                with_invoice_number: 1,
                marked_duplicates: 1,
            }
        );
        assert_eq!(DuplicateStats::from_expenses(&[]), DuplicateStats::default());
    }
}
