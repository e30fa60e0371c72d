//! Confidence-scored field extraction
//!
//! Turns an OCR [`Transcript`] into typed candidate fields. Each field has
//! its own strategies, tried in priority order, and every value carries a
//! 0-100 confidence plus the [`Provenance`] of the strategy that produced it.
//!
//! Per-field confidence is the sum of four signals, capped at 100:
//! - contextual keyword match: +40
//! - pattern well-formedness: +30
//! - cross-validation (known vendor, corroborated amount, plausible date,
//!   explicit invoice marker): +20
//! - average OCR confidence of the source line, scaled to +10
//!
//! Extraction never fails. A transcript with nothing usable yields
//! [`ExtractionResult::empty`] (confidence 0, manual entry required).

pub mod amount;
pub mod currency;
pub mod date;
pub mod description;
pub mod invoice;
pub mod vendor;

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{ExtractedField, ExtractionResult, Provenance, Transcript};
use crate::similarity::{LevenshteinRatio, SimilarityScorer};

pub const KEYWORD_BONUS: u8 = 40;
pub const WELL_FORMED_BONUS: u8 = 30;
pub const CROSS_VALIDATION_BONUS: u8 = 20;
pub const OCR_MAX_BONUS: u8 = 10;

/// Tunables for the field extractor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Fraction of lines treated as the letterhead region
    pub letterhead_fraction: f64,
    /// The letterhead region is never smaller than this many lines
    pub letterhead_min_lines: usize,
    /// Minimum ratio for replacing OCR vendor text with a known vendor
    pub known_vendor_threshold: f64,
    /// Amounts must be strictly below this
    pub max_amount: f64,
    pub description_max_items: usize,
    pub description_max_chars: usize,
    /// Confidence cap for dates taken from the artifact timestamp
    pub fallback_date_cap: u8,
    /// Dates older than this many years are not considered plausible
    pub plausible_years: i32,
    pub amount_weight: u32,
    pub date_weight: u32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            letterhead_fraction: 0.25,
            letterhead_min_lines: 3,
            known_vendor_threshold: 0.8,
            max_amount: 1_000_000.0,
            description_max_items: 3,
            description_max_chars: 200,
            fallback_date_cap: 30,
            plausible_years: 10,
            amount_weight: 2,
            date_weight: 2,
        }
    }
}

/// Context the caller can supply to improve extraction
#[derive(Debug, Clone, Default)]
pub struct ExtractionHints {
    /// Vendor spellings from the user's history
    pub known_vendors: Vec<String>,
    /// Intrinsic creation/modification time of the artifact
    pub fallback_timestamp: Option<DateTime<Utc>>,
    /// "Today" for date plausibility checks (defaults to the current UTC date)
    pub reference_date: Option<NaiveDate>,
}

/// Confidence signals gathered by a strategy
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Signals {
    pub keyword: bool,
    pub well_formed: bool,
    pub cross_validated: bool,
    /// Average OCR confidence of the source, 0-100
    pub ocr_confidence: f32,
    /// Upper bound on the resulting confidence
    pub cap: Option<u8>,
}

impl Signals {
    pub fn score(&self) -> u8 {
        let mut total: u32 = 0;
        if self.keyword {
            total += KEYWORD_BONUS as u32;
        }
        if self.well_formed {
            total += WELL_FORMED_BONUS as u32;
        }
        if self.cross_validated {
            total += CROSS_VALIDATION_BONUS as u32;
        }
        let ocr = if self.ocr_confidence.is_finite() {
            self.ocr_confidence.clamp(0.0, 100.0)
        } else {
            0.0
        };
        total += (ocr / 100.0 * OCR_MAX_BONUS as f32).round() as u32;
        total.min(self.cap.unwrap_or(100) as u32).min(100) as u8
    }
}

/// A value found by one strategy, before it becomes an [`ExtractedField`]
#[derive(Debug, Clone, PartialEq)]
pub struct Found<T> {
    pub value: T,
    pub provenance: Provenance,
    pub signals: Signals,
    /// Index of the transcript line the value came from
    pub line: Option<usize>,
}

impl<T> Found<T> {
    fn into_field(self) -> ExtractedField<T> {
        ExtractedField {
            confidence: self.signals.score(),
            value: self.value,
            provenance: self.provenance,
        }
    }
}

/// Field extractor with injected similarity scorer
#[derive(Clone)]
pub struct FieldExtractor {
    config: ExtractorConfig,
    scorer: Arc<dyn SimilarityScorer>,
}

impl Default for FieldExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldExtractor {
    pub fn new() -> Self {
        Self::with_config(ExtractorConfig::default())
    }

    pub fn with_config(config: ExtractorConfig) -> Self {
        Self {
            config,
            scorer: Arc::new(LevenshteinRatio),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn SimilarityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Extract fields with no caller context
    pub fn extract(&self, transcript: &Transcript) -> ExtractionResult {
        self.extract_with(transcript, &ExtractionHints::default())
    }

    /// Extract fields using known vendors and the artifact timestamp
    pub fn extract_with(
        &self,
        transcript: &Transcript,
        hints: &ExtractionHints,
    ) -> ExtractionResult {
        let lines = transcript.lines();
        let raw_text = lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        if lines.is_empty() {
            debug!("Empty transcript, manual entry required");
            return ExtractionResult {
                raw_text,
                ..ExtractionResult::empty()
            };
        }

        let today = hints
            .reference_date
            .unwrap_or_else(|| Utc::now().date_naive());

        let vendor = vendor::find(&lines, &self.config, &hints.known_vendors, self.scorer.as_ref());
        let amount = amount::find(&lines, &self.config);
        let text_date = date::find(&lines, &self.config, today);
        let invoice_number = invoice::find(&lines);
        let description = description::find(
            &lines,
            &self.config,
            vendor.as_ref().map(|v| (v.value.as_str(), v.line, v.signals)),
        );

        let parsed_anything = vendor.is_some()
            || amount.is_some()
            || text_date.is_some()
            || invoice_number.is_some()
            || description.is_some();
        if !parsed_anything {
            warn!(
                lines = lines.len(),
                "No fields recognized in transcript, manual entry required"
            );
            return ExtractionResult {
                raw_text,
                ..ExtractionResult::empty()
            };
        }

        let date = text_date.or_else(|| {
            hints
                .fallback_timestamp
                .map(|ts| date::from_timestamp(ts, &self.config, today))
        });

        let currency = amount.as_ref().and_then(|(_, code)| code.clone());
        let amount = amount.map(|(found, _)| found);

        if let Some(ref v) = vendor {
            debug!(vendor = %v.value, provenance = %v.provenance, "Vendor extracted");
        }
        if let Some(ref a) = amount {
            debug!(amount = a.value, provenance = %a.provenance, "Amount extracted");
        }
        if let Some(ref d) = date {
            debug!(date = %d.value, provenance = %d.provenance, "Date extracted");
        }

        let mut result = ExtractionResult {
            vendor: vendor.map(Found::into_field),
            amount: amount.map(Found::into_field),
            currency,
            date: date.map(Found::into_field),
            invoice_number: invoice_number.map(Found::into_field),
            description: description.map(Found::into_field),
            confidence: 0,
            raw_text,
            extracted_at: Utc::now(),
        };
        result.confidence = aggregate_confidence(&result, &self.config);
        result
    }
}

/// Weighted mean of present-field confidences (0 when no field is present)
pub fn aggregate_confidence(result: &ExtractionResult, config: &ExtractorConfig) -> u8 {
    let weighted = [
        result.vendor.as_ref().map(|f| (f.confidence, 1)),
        result.amount.as_ref().map(|f| (f.confidence, config.amount_weight)),
        result.date.as_ref().map(|f| (f.confidence, config.date_weight)),
        result.invoice_number.as_ref().map(|f| (f.confidence, 1)),
        result.description.as_ref().map(|f| (f.confidence, 1)),
    ];

    let (sum, weights) = weighted
        .iter()
        .flatten()
        .fold((0u32, 0u32), |(sum, weights), (confidence, weight)| {
            (sum + *confidence as u32 * weight, weights + weight)
        });

    if weights == 0 {
        return 0;
    }
    ((sum as f64 / weights as f64).round() as u32).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoundingBox, OcrToken};

    const SAMPLE: &str = "Amazon.com\nInvoice #: 12345\nDate: November 5, 2024\nTotal: $42.99";

    fn reference() -> ExtractionHints {
        ExtractionHints {
            reference_date: NaiveDate::from_ymd_opt(2025, 1, 15),
            ..Default::default()
        }
    }

    #[test]
    fn test_signals_score() {
        let all = Signals {
            keyword: true,
            well_formed: true,
            cross_validated: true,
            ocr_confidence: 100.0,
            cap: None,
        };
        assert_eq!(all.score(), 100);

        let ocr_only = Signals {
            ocr_confidence: 55.0,
            ..Default::default()
        };
        assert_eq!(ocr_only.score(), 6);

        let garbage = Signals {
            ocr_confidence: f32::NAN,
            ..Default::default()
        };
        assert_eq!(garbage.score(), 0);
    }

    #[test]
    fn test_sample_receipt() {
        let extractor = FieldExtractor::new();
        let result = extractor.extract_with(&Transcript::from_text(SAMPLE), &reference());

        assert_eq!(result.vendor.as_ref().unwrap().value, "Amazon.com");
        assert_eq!(result.amount.as_ref().unwrap().value, 42.99);
        assert_eq!(
            result.date.as_ref().unwrap().value,
            NaiveDate::from_ymd_opt(2024, 11, 5).unwrap()
        );
        assert_eq!(result.invoice_number.as_ref().unwrap().value, "12345");
        assert_eq!(result.currency.as_deref(), Some("USD"));
        assert!(result.confidence >= 70, "confidence {}", result.confidence);
        assert!(!result.manual_entry_required());
    }

    #[test]
    fn test_empty_transcript() {
        let extractor = FieldExtractor::new();
        let result = extractor.extract(&Transcript::default());
        assert!(result.vendor.is_none());
        assert!(result.amount.is_none());
        assert!(result.date.is_none());
        assert!(result.invoice_number.is_none());
        assert!(result.description.is_none());
        assert_eq!(result.confidence, 0);
        assert!(result.manual_entry_required());
    }

    #[test]
    fn test_empty_transcript_ignores_fallback_timestamp() {
        let extractor = FieldExtractor::new();
        let hints = ExtractionHints {
            fallback_timestamp: Some(Utc::now()),
            ..Default::default()
        };
        let result = extractor.extract_with(&Transcript::from_text("\n\n"), &hints);
        assert!(result.date.is_none());
        assert_eq!(result.confidence, 0);
    }

    #[test]
    fn test_fallback_timestamp_capped() {
        let extractor = FieldExtractor::new();
        let ts = DateTime::parse_from_rfc3339("2024-06-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let hints = ExtractionHints {
            fallback_timestamp: Some(ts),
            reference_date: NaiveDate::from_ymd_opt(2024, 6, 2),
            ..Default::default()
        };
        let result =
            extractor.extract_with(&Transcript::from_text("Corner Bakery\nTotal 8.50"), &hints);
        let date = result.date.unwrap();
        assert_eq!(date.value, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        assert_eq!(date.provenance, Provenance::FileTimestamp);
        assert!(date.confidence <= 30);
    }

    #[test]
    fn test_low_ocr_confidence_lowers_scores() {
        let extractor = FieldExtractor::new();
        let clean = extractor.extract_with(&Transcript::from_text(SAMPLE), &reference());

        let mut noisy = Transcript::from_text(SAMPLE);
        for token in &mut noisy.tokens {
            token.confidence = 20.0;
        }
        let noisy = extractor.extract_with(&noisy, &reference());
        assert!(noisy.confidence < clean.confidence);
        assert_eq!(noisy.amount.unwrap().value, 42.99);
    }

    #[test]
    fn test_garbage_never_panics() {
        let extractor = FieldExtractor::new();
        let inputs = [
            "€€€ ¥¥ $$$ %%% ###",
            "99999999999999999999999.99",
            "Total: $",
            "31/31/2024 2024-13-45 Feb 30, 2023",
            "🙂 émoji façade ünïcödé 12,34,56.7.8",
            "Invoice #: ",
            ":::\n---\n...",
        ];
        for input in inputs {
            let result = extractor.extract(&Transcript::from_text(input));
            assert!(result.confidence <= 100);
        }

        let odd = Transcript::new(vec![OcrToken {
            text: "Total 12.00".into(),
            bbox: BoundingBox::default(),
            confidence: -5.0,
            line: usize::MAX,
        }]);
        let result = extractor.extract(&odd);
        assert!(result.confidence <= 100);
    }

    #[test]
    fn test_aggregate_weights_amount_and_date() {
        let config = ExtractorConfig::default();
        let mut result = ExtractionResult::empty();
        result.vendor = Some(ExtractedField {
            value: "A".into(),
            confidence: 40,
            provenance: Provenance::Letterhead,
        });
        result.amount = Some(ExtractedField {
            value: 1.0,
            confidence: 100,
            provenance: Provenance::AmountKeyword,
        });
        // (40 + 200) / 3 = 80
        assert_eq!(aggregate_confidence(&result, &config), 80);
        assert_eq!(aggregate_confidence(&ExtractionResult::empty(), &config), 0);
    }
}
