//! Vendor extraction

use std::sync::LazyLock;

use regex::Regex;

use super::{date, ExtractorConfig, Found, Signals};
use crate::models::{Provenance, TranscriptLine};
use crate::similarity::{normalize_vendor, SimilarityScorer};

static LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:vendor|from|sold\s+by|merchant|pay\s+to|seller)\s*:\s*(?P<name>.+?)\s*$")
        .expect("valid regex")
});

/// Labels for other fields; such lines are never the vendor
static OTHER_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:invoice|receipt|order|date|total|subtotal|amount|balance|tax|bill\s+to|ship\s+to|tel|phone|fax|page)\b",
    )
    .expect("valid regex")
});

static PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(?\d{3}\)?[\s.-]\d{3}[\s.-]\d{4}\b").expect("valid regex")
});

static URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:https?://|www\.|\S+@\S+\.\S+)").expect("valid regex")
});

const MIN_LEN: usize = 2;
const MAX_LEN: usize = 60;

fn clean(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn plausible_name(text: &str) -> bool {
    let len = text.chars().count();
    let letters = text.chars().filter(|c| c.is_alphabetic()).count();
    let digits = text.chars().filter(|c| c.is_ascii_digit()).count();
    (MIN_LEN..=MAX_LEN).contains(&len) && letters >= 2 && letters > digits
}

fn is_letterhead_candidate(text: &str) -> bool {
    plausible_name(text)
        && !OTHER_LABEL.is_match(text)
        && date::spans_in(text).is_empty()
        && !PHONE.is_match(text)
        && !URL.is_match(text)
}

/// Number of leading lines treated as the letterhead
pub fn letterhead_lines(total: usize, config: &ExtractorConfig) -> usize {
    let fraction = (total as f64 * config.letterhead_fraction).ceil() as usize;
    fraction.max(config.letterhead_min_lines).min(total)
}

pub(crate) fn find(
    lines: &[TranscriptLine],
    config: &ExtractorConfig,
    known_vendors: &[String],
    scorer: &dyn SimilarityScorer,
) -> Option<Found<String>> {
    let labeled = lines.iter().find_map(|line| {
        let caps = LABEL.captures(&line.text)?;
        let name = clean(caps.name("name")?.as_str());
        plausible_name(&name).then(|| (name, line, Provenance::VendorLabel))
    });

    let (name, line, provenance) = labeled.or_else(|| {
        lines
            .iter()
            .take(letterhead_lines(lines.len(), config))
            .find(|l| is_letterhead_candidate(&l.text))
            .map(|l| (clean(&l.text), l, Provenance::Letterhead))
    })?;

    let normalized = normalize_vendor(&name);
    let known = known_vendors
        .iter()
        .map(|k| (k, scorer.ratio(&normalized, &normalize_vendor(k))))
        .filter(|(_, ratio)| *ratio >= config.known_vendor_threshold)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(k, _)| k.as_str());

    let (value, provenance) = match known {
        Some(known) => (
            known.to_string(),
            if provenance == Provenance::Letterhead {
                Provenance::KnownVendor
            } else {
                provenance
            },
        ),
        None => (name, provenance),
    };

    Some(Found {
        value,
        provenance,
        signals: Signals {
            keyword: provenance == Provenance::VendorLabel,
            well_formed: true,
            cross_validated: known.is_some(),
            ocr_confidence: line.confidence,
            cap: None,
        },
        line: Some(line.index),
    })
}
