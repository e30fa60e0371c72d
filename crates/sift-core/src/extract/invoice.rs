//! Invoice / receipt number extraction

use std::sync::LazyLock;

use regex::Regex;

use super::{date, Found, Signals};
use crate::models::{Provenance, TranscriptLine};

static LABELED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?P<label>invoice\s*(?:#|no\.?|num(?:ber)?\.?)?|inv\.?\s*(?:#|no\.?)?|receipt\s*(?:#|no\.?|num(?:ber)?\.?)|order\s*(?:#|no\.?|num(?:ber)?\.?)|ref(?:erence)?\.?\s*(?:#|no\.?)?)\s*[:#-]?\s*(?P<id>[A-Za-z0-9][A-Za-z0-9\-/]*)",
    )
    .expect("valid regex")
});

static MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)#|\bno\b|\bnum(?:ber)?\b").expect("valid regex"));

const MAX_LEN: usize = 30;

pub(crate) fn find(lines: &[TranscriptLine]) -> Option<Found<String>> {
    for line in lines {
        let date_spans = date::spans_in(&line.text);
        for caps in LABELED.captures_iter(&line.text) {
            let (Some(label), Some(id)) = (caps.name("label"), caps.name("id")) else {
                continue;
            };
            let value = id.as_str().trim_end_matches(['-', '/']);
            // "INV-2024-0042" keeps its prefix
            let between = &line.text[label.end()..id.start()];
            let prefixed = between == "-"
                && ["inv", "ref"]
                    .iter()
                    .any(|p| label.as_str().eq_ignore_ascii_case(p));
            let value = if prefixed && !value.is_empty() {
                format!("{}-{}", label.as_str(), value)
            } else {
                value.to_string()
            };
            if value.is_empty()
                || value.len() > MAX_LEN
                || !value.chars().any(|c| c.is_ascii_digit())
            {
                continue;
            }
            let span = id.range();
            if date_spans
                .iter()
                .any(|s| s.start < span.end && span.start < s.end)
            {
                continue;
            }

            return Some(Found {
                provenance: Provenance::InvoiceLabel,
                signals: Signals {
                    keyword: true,
                    well_formed: value.len() >= 3,
                    cross_validated: MARKER.is_match(label.as_str())
                        || MARKER.is_match(&line.text),
                    ocr_confidence: line.confidence,
                    cap: None,
                },
                line: Some(line.index),
                value,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Transcript;

    fn find_in(text: &str) -> Option<Found<String>> {
        find(&Transcript::from_text(text).lines())
    }

    #[test]
    fn test_invoice_hash() {
        let found = find_in("Invoice #: 12345").unwrap();
        assert_eq!(found.value, "12345");
        assert!(found.signals.cross_validated);
    }

    #[test]
    fn test_label_variants() {
        assert_eq!(find_in("INV-2024-0042").unwrap().value, "INV-2024-0042");
        assert_eq!(find_in("Inv # 2024-0042").unwrap().value, "2024-0042");
        assert_eq!(find_in("Receipt No. A7731").unwrap().value, "A7731");
        assert_eq!(find_in("Order # 55-1023").unwrap().value, "55-1023");
        assert_eq!(find_in("Ref: PO88812").unwrap().value, "PO88812");
    }

    #[test]
    fn test_attached_prefix_kept() {
        let found = find_in("Total due for inv-77120").unwrap();
        assert_eq!(found.value, "inv-77120");
        assert_eq!(find_in("REF-A12").unwrap().value, "REF-A12");
        // A separate label is not part of the number
        assert_eq!(find_in("Invoice - 4410").unwrap().value, "4410");
    }

    #[test]
    fn test_requires_digit() {
        assert!(find_in("Invoice Date: November 5, 2024").is_none());
        assert!(find_in("Refund policy applies").is_none());
    }

    #[test]
    fn test_dates_are_not_invoice_numbers() {
        assert!(find_in("Invoice 2024-11-05").is_none());
    }

    #[test]
    fn test_no_marker() {
        let found = find_in("Invoice A-100").unwrap();
        assert_eq!(found.value, "A-100");
        assert!(!found.signals.cross_validated);
    }
}
