//! Domain models for Sift

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier assigned to a filed expense by the storage collaborator
pub type ExpenseId = i64;

/// Opaque document identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DocumentId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| format!("Invalid document id '{}': {}", s, e))
    }
}

// =============================================================================
// Transcript
// =============================================================================

/// Region of the page a token was read from, in page units
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A single OCR token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrToken {
    pub text: String,
    #[serde(default)]
    pub bbox: BoundingBox,
    /// OCR engine confidence, 0-100
    pub confidence: f32,
    /// Zero-based line index assigned by the OCR engine
    pub line: usize,
}

/// Ordered OCR output for one document
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Transcript {
    pub tokens: Vec<OcrToken>,
}

/// A reconstructed line of text
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptLine {
    /// Position of the line among the non-empty lines of the transcript
    pub index: usize,
    pub text: String,
    /// Average token confidence on this line, 0-100
    pub confidence: f32,
}

impl Transcript {
    pub fn new(tokens: Vec<OcrToken>) -> Self {
        Self { tokens }
    }

    /// Build a synthetic transcript from plain text.
    ///
    /// One token per whitespace-separated word, confidence 100, with
    /// bounding boxes laid out on a fixed character grid.
    pub fn from_text(text: &str) -> Self {
        const CHAR_WIDTH: f32 = 8.0;
        const LINE_HEIGHT: f32 = 16.0;

        let mut tokens = Vec::new();
        for (line, raw) in text.lines().enumerate() {
            let mut column = 0usize;
            for word in raw.split_whitespace() {
                let offset = raw[column..].find(word).map(|o| o + column).unwrap_or(column);
                tokens.push(OcrToken {
                    text: word.to_string(),
                    bbox: BoundingBox {
                        x: offset as f32 * CHAR_WIDTH,
                        y: line as f32 * LINE_HEIGHT,
                        width: word.chars().count() as f32 * CHAR_WIDTH,
                        height: LINE_HEIGHT,
                    },
                    confidence: 100.0,
                    line,
                });
                column = offset + word.len();
            }
        }
        Self { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.iter().all(|t| t.text.trim().is_empty())
    }

    /// Non-empty lines in reading order
    pub fn lines(&self) -> Vec<TranscriptLine> {
        let mut grouped: BTreeMap<usize, Vec<&OcrToken>> = BTreeMap::new();
        for token in &self.tokens {
            if token.text.trim().is_empty() {
                continue;
            }
            grouped.entry(token.line).or_default().push(token);
        }

        grouped
            .into_values()
            .enumerate()
            .map(|(index, mut tokens)| {
                tokens.sort_by(|a, b| a.bbox.x.total_cmp(&b.bbox.x));
                let text = tokens
                    .iter()
                    .map(|t| t.text.trim())
                    .collect::<Vec<_>>()
                    .join(" ");
                let confidence =
                    tokens.iter().map(|t| t.confidence).sum::<f32>() / tokens.len() as f32;
                TranscriptLine {
                    index,
                    text,
                    confidence,
                }
            })
            .collect()
    }

    /// Full text, one line per transcript line
    pub fn text(&self) -> String {
        self.lines()
            .into_iter()
            .map(|l| l.text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Average confidence across all tokens (0 for an empty transcript)
    pub fn average_confidence(&self) -> f32 {
        if self.tokens.is_empty() {
            return 0.0;
        }
        self.tokens.iter().map(|t| t.confidence).sum::<f32>() / self.tokens.len() as f32
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// Which extraction strategy produced a field value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Explicit "Vendor:" / "From:" label
    VendorLabel,
    /// First plausible line in the letterhead region
    Letterhead,
    /// Letterhead text corrected to a vendor already in history
    KnownVendor,
    /// Amount on or next to a total keyword
    AmountKeyword,
    /// Amount adjacent to a currency symbol or code
    CurrencySymbol,
    /// Bare decimal amount
    DecimalPattern,
    /// Date on or next to a date keyword
    DateKeyword,
    /// Date matched by pattern alone
    DatePattern,
    /// Artifact creation/modification time
    FileTimestamp,
    /// Token following an invoice/receipt label
    InvoiceLabel,
    /// Joined line items
    LineItems,
    /// Description defaulted to the vendor name
    VendorFallback,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VendorLabel => "vendor_label",
            Self::Letterhead => "letterhead",
            Self::KnownVendor => "known_vendor",
            Self::AmountKeyword => "amount_keyword",
            Self::CurrencySymbol => "currency_symbol",
            Self::DecimalPattern => "decimal_pattern",
            Self::DateKeyword => "date_keyword",
            Self::DatePattern => "date_pattern",
            Self::FileTimestamp => "file_timestamp",
            Self::InvoiceLabel => "invoice_label",
            Self::LineItems => "line_items",
            Self::VendorFallback => "vendor_fallback",
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single extracted value with its confidence and origin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField<T> {
    pub value: T,
    /// 0-100
    pub confidence: u8,
    pub provenance: Provenance,
}

/// Immutable output of the field extractor for one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub vendor: Option<ExtractedField<String>>,
    pub amount: Option<ExtractedField<f64>>,
    /// ISO 4217 code detected next to the amount, if any
    pub currency: Option<String>,
    pub date: Option<ExtractedField<NaiveDate>>,
    pub invoice_number: Option<ExtractedField<String>>,
    pub description: Option<ExtractedField<String>>,
    /// Aggregate confidence, 0-100
    pub confidence: u8,
    pub raw_text: String,
    pub extracted_at: DateTime<Utc>,
}

impl ExtractionResult {
    /// A result with no fields and zero confidence
    pub fn empty() -> Self {
        Self {
            vendor: None,
            amount: None,
            currency: None,
            date: None,
            invoice_number: None,
            description: None,
            confidence: 0,
            raw_text: String::new(),
            extracted_at: Utc::now(),
        }
    }

    /// True when nothing usable was extracted and the user must type the fields
    pub fn manual_entry_required(&self) -> bool {
        self.confidence == 0
    }
}

/// Fields after human review. Built from, but never written back into,
/// an [`ExtractionResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewedFields {
    pub vendor: String,
    pub amount: f64,
    #[serde(default)]
    pub currency: Option<String>,
    pub date: NaiveDate,
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ReviewedFields {
    /// Accept the extracted values as-is.
    ///
    /// Returns None when vendor, amount or date is missing.
    pub fn from_extraction(result: &ExtractionResult) -> Option<Self> {
        let vendor = result.vendor.as_ref()?.value.clone();
        let amount = result.amount.as_ref()?.value;
        let date = result.date.as_ref()?.value;
        Some(Self {
            vendor,
            amount,
            currency: result.currency.clone(),
            date,
            invoice_number: result.invoice_number.as_ref().map(|f| f.value.clone()),
            description: result
                .description
                .as_ref()
                .map(|f| f.value.clone())
                .unwrap_or_default(),
            notes: None,
            tags: Vec::new(),
        })
    }
}

// =============================================================================
// Categorization
// =============================================================================

/// A ranked category suggestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySuggestion {
    pub category: String,
    /// 0-100
    pub confidence: u8,
    pub reason: String,
}

// =============================================================================
// Duplicate detection
// =============================================================================

/// Evidence that contributed to a duplicate score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSignal {
    ExactHash,
    PerceptualHash,
    Metadata,
}

impl MatchSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExactHash => "exact_hash",
            Self::PerceptualHash => "perceptual_hash",
            Self::Metadata => "metadata",
        }
    }
}

impl std::fmt::Display for MatchSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a duplicate candidate is surfaced during review
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateSeverity {
    /// Shown to the user, does not gate filing
    Notice,
    /// Filing requires an explicit "file anyway"
    Blocking,
}

/// An existing expense that may be the same document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCandidate {
    pub expense_id: ExpenseId,
    /// 0-100
    pub score: u8,
    pub signals: Vec<MatchSignal>,
    pub severity: DuplicateSeverity,
    pub reasons: Vec<String>,
}

impl DuplicateCandidate {
    pub fn is_blocking(&self) -> bool {
        self.severity == DuplicateSeverity::Blocking
    }
}

/// Hashes identifying the uploaded artifact
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DocumentFingerprint {
    /// SHA-256 of the raw bytes, lowercase hex
    pub content_hash: String,
    /// 64-bit perceptual hash of the page image, when the caller computed one
    pub perceptual_hash: Option<u64>,
}

/// Metadata fields compared by the duplicate detector
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub vendor: Option<String>,
    pub amount: Option<f64>,
    pub date: Option<NaiveDate>,
    pub invoice_number: Option<String>,
}

impl From<&ExtractionResult> for DocumentMetadata {
    fn from(result: &ExtractionResult) -> Self {
        Self {
            vendor: result.vendor.as_ref().map(|f| f.value.clone()),
            amount: result.amount.as_ref().map(|f| f.value),
            date: result.date.as_ref().map(|f| f.value),
            invoice_number: result.invoice_number.as_ref().map(|f| f.value.clone()),
        }
    }
}

impl From<&ReviewedFields> for DocumentMetadata {
    fn from(fields: &ReviewedFields) -> Self {
        Self {
            vendor: Some(fields.vendor.clone()),
            amount: Some(fields.amount),
            date: Some(fields.date),
            invoice_number: fields.invoice_number.clone(),
        }
    }
}

// =============================================================================
// Documents & expenses
// =============================================================================

/// Lifecycle state of a document in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Uploaded,
    Extracting,
    AwaitingReview,
    Categorizing,
    Complete,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Extracting => "extracting",
            Self::AwaitingReview => "awaiting_review",
            Self::Categorizing => "categorizing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pipeline stage a background task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Upload,
    Extract,
    Review,
    Categorize,
    Complete,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Extract => "extract",
            Self::Review => "review",
            Self::Categorize => "categorize",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reference to the stored raw artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub fingerprint: DocumentFingerprint,
    pub size_bytes: u64,
    /// Intrinsic creation/modification time of the uploaded file
    pub modified_at: Option<DateTime<Utc>>,
}

/// An uploaded document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub user_id: String,
    pub filename: String,
    pub uploaded_at: DateTime<Utc>,
    pub artifact: ArtifactRef,
    pub state: PipelineState,
    /// Filled in by OCR during extraction
    pub transcript: Option<Transcript>,
    #[serde(skip)]
    pub bytes: Arc<Vec<u8>>,
}

/// Input to the upload stage
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub user_id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub perceptual_hash: Option<u64>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl NewUpload {
    pub fn new(user_id: &str, filename: &str, bytes: Vec<u8>) -> Self {
        Self {
            user_id: user_id.to_string(),
            filename: filename.to_string(),
            bytes,
            perceptual_hash: None,
            modified_at: None,
        }
    }
}

/// A filed expense
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub id: ExpenseId,
    pub user_id: String,
    pub vendor: String,
    pub amount: f64,
    pub currency: Option<String>,
    pub date: NaiveDate,
    pub category: String,
    pub description: String,
    pub invoice_number: Option<String>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    pub document_id: Option<DocumentId>,
    pub original_filename: Option<String>,
    pub content_hash: Option<String>,
    pub perceptual_hash: Option<u64>,
    /// Extraction confidence at the time of filing, 0-100
    pub confidence: u8,
    pub raw_text: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set when the user confirms this expense double-files another
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<ExpenseId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_marked_at: Option<DateTime<Utc>>,
}

impl Expense {
    pub fn is_marked_duplicate(&self) -> bool {
        self.duplicate_of.is_some()
    }
}

/// An expense to be persisted (before the store assigns an id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExpense {
    pub user_id: String,
    pub vendor: String,
    pub amount: f64,
    pub currency: Option<String>,
    pub date: NaiveDate,
    pub category: String,
    pub description: String,
    pub invoice_number: Option<String>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    pub document_id: Option<DocumentId>,
    pub original_filename: Option<String>,
    pub content_hash: Option<String>,
    pub perceptual_hash: Option<u64>,
    pub confidence: u8,
    pub raw_text: Option<String>,
}

impl NewExpense {
    /// Attach a store-assigned id and creation time
    pub fn into_expense(self, id: ExpenseId, created_at: DateTime<Utc>) -> Expense {
        Expense {
            id,
            user_id: self.user_id,
            vendor: self.vendor,
            amount: self.amount,
            currency: self.currency,
            date: self.date,
            category: self.category,
            description: self.description,
            invoice_number: self.invoice_number,
            notes: self.notes,
            tags: self.tags,
            document_id: self.document_id,
            original_filename: self.original_filename,
            content_hash: self.content_hash,
            perceptual_hash: self.perceptual_hash,
            confidence: self.confidence,
            raw_text: self.raw_text,
            created_at,
            duplicate_of: None,
            duplicate_marked_at: None,
        }
    }
}

/// Filters for querying stored expenses. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpenseFilter {
    pub user_id: Option<String>,
    pub category: Option<String>,
    /// Case-insensitive substring match on vendor
    pub vendor: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub content_hash: Option<String>,
    /// Case-insensitive substring match on vendor, description and notes
    pub search: Option<String>,
}

impl ExpenseFilter {
    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, expense: &Expense) -> bool {
        if let Some(ref user) = self.user_id {
            if &expense.user_id != user {
                return false;
            }
        }
        if let Some(ref category) = self.category {
            if &expense.category != category {
                return false;
            }
        }
        if let Some(ref vendor) = self.vendor {
            if !expense
                .vendor
                .to_lowercase()
                .contains(&vendor.to_lowercase())
            {
                return false;
            }
        }
        if let Some(start) = self.start_date {
            if expense.date < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if expense.date > end {
                return false;
            }
        }
        if let Some(ref hash) = self.content_hash {
            if expense.content_hash.as_deref() != Some(hash.as_str()) {
                return false;
            }
        }
        if let Some(ref search) = self.search {
            let needle = search.to_lowercase();
            let hit = expense.vendor.to_lowercase().contains(&needle)
                || expense.description.to_lowercase().contains(&needle)
                || expense
                    .notes
                    .as_deref()
                    .map(|n| n.to_lowercase().contains(&needle))
                    .unwrap_or(false);
            if !hit {
                return false;
            }
        }
        true
    }
}
