//! Description from line items

use std::sync::LazyLock;

use regex::Regex;

use super::{ExtractorConfig, Found, Signals};
use crate::models::{Provenance, TranscriptLine};

/// Text followed by a trailing price or quantity
static LINE_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<text>.*?[A-Za-z]{3,}.*?)[\s:@-]*(?:US\$|C\$|A\$|MX\$|[$€£¥₹])?\s*\d+(?:[.,]\d+)*\s*$")
        .expect("valid regex")
});

static NOT_AN_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:total|subtotal|sub-total|tax|vat|gst|date|invoice|receipt|balance|amount|change|cash|tender|visa|mastercard|amex|card|tip|due|order|ref|phone|tel)\b",
    )
    .expect("valid regex")
});

/// Descriptions copied from the vendor never score above this
const VENDOR_FALLBACK_CAP: u8 = 30;

fn item_text(line: &TranscriptLine) -> Option<String> {
    if NOT_AN_ITEM.is_match(&line.text) {
        return None;
    }
    let caps = LINE_ITEM.captures(&line.text)?;
    let text = caps
        .name("text")?
        .as_str()
        .trim_end_matches(|c: char| c.is_whitespace() || matches!(c, ':' | '-' | '@'))
        .trim();
    (text.chars().count() > 2).then(|| text.to_string())
}

/// Joined line items, or the vendor name when there are none.
///
/// `vendor` is the extracted vendor value, its line and its signals.
pub(crate) fn find(
    lines: &[TranscriptLine],
    config: &ExtractorConfig,
    vendor: Option<(&str, Option<usize>, Signals)>,
) -> Option<Found<String>> {
    let vendor_line = vendor.and_then(|(_, line, _)| line);

    let mut items: Vec<String> = Vec::new();
    let mut confidence = 0.0f32;
    let mut first_line = None;
    for line in lines {
        if items.len() >= config.description_max_items {
            break;
        }
        if Some(line.index) == vendor_line {
            continue;
        }
        let Some(text) = item_text(line) else { continue };

        let joined_len: usize = items.iter().map(|i| i.chars().count() + 2).sum::<usize>()
            + text.chars().count();
        if !items.is_empty() && joined_len > config.description_max_chars {
            break;
        }
        first_line.get_or_insert(line.index);
        confidence += line.confidence;
        items.push(text);
    }

    if !items.is_empty() {
        let count = items.len() as f32;
        let joined: String = items
            .join("; ")
            .chars()
            .take(config.description_max_chars)
            .collect();
        return Some(Found {
            value: joined,
            provenance: Provenance::LineItems,
            signals: Signals {
                well_formed: true,
                ocr_confidence: confidence / count,
                ..Default::default()
            },
            line: first_line,
        });
    }

    let (name, line, signals) = vendor?;
    Some(Found {
        value: name.to_string(),
        provenance: Provenance::VendorFallback,
        signals: Signals {
            keyword: false,
            cap: Some(VENDOR_FALLBACK_CAP),
            ..signals
        },
        line,
    })
}
