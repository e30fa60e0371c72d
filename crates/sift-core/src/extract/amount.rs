//! Amount extraction
//!
//! Candidates are numbers next to a currency marker, or bare numbers with
//! exactly two decimals. Pieces of dates, phone numbers and percentages are
//! excluded by span, since `regex` has no lookaround.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

use super::{currency, date, ExtractorConfig, Found, Signals};
use crate::models::{Provenance, TranscriptLine};

static AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    let codes = currency::ISO_CODES.join("|");
    Regex::new(&format!(
        r"(?P<pre>\b(?:US|C|A|MX)\$|[$€£¥₹]|\b(?:{codes})\b)?\s*(?P<num>\d{{1,3}}(?:,\d{{3}})+(?:\.\d+)?|\d+(?:\.\d+)?)(?:\s*(?P<post>\b(?:{codes})\b|€))?",
        codes = codes
    ))
    .expect("valid regex")
});

static PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+?\d{1,2}[\s.-]?)?\(?\d{3}\)?[\s.-]\d{3}[\s.-]\d{4}\b").expect("valid regex")
});

static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?\s*%").expect("valid regex"));

static TOTAL_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:grand\s+total|total(?:\s+due)?|amount\s+due|amount|balance(?:\s+due)?)\b")
        .expect("valid regex")
});

static SUBTOTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bsub[\s-]?total\b").expect("valid regex"));

/// A numeric amount seen on a line
#[derive(Debug, Clone, PartialEq)]
pub struct AmountCandidate {
    pub value: f64,
    pub line: usize,
    pub currency: Option<&'static str>,
    /// Exactly two decimal places
    pub two_decimals: bool,
    pub confidence: f32,
}

fn overlaps(a: &Range<usize>, spans: &[Range<usize>]) -> bool {
    spans.iter().any(|s| s.start < a.end && a.start < s.end)
}

fn excluded_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = date::spans_in(text);
    spans.extend(PHONE.find_iter(text).map(|m| m.range()));
    spans.extend(PERCENT.find_iter(text).map(|m| m.range()));
    spans
}

/// Amount candidates on one line
pub fn candidates_in(line: &TranscriptLine, max_amount: f64) -> Vec<AmountCandidate> {
    let excluded = excluded_spans(&line.text);
    let mut found = Vec::new();

    for caps in AMOUNT.captures_iter(&line.text) {
        let Some(num) = caps.name("num") else { continue };
        if overlaps(&num.range(), &excluded) {
            continue;
        }

        let marker = caps
            .name("pre")
            .or_else(|| caps.name("post"))
            .and_then(|m| currency::code_for(m.as_str()));
        let digits = num.as_str().replace(',', "");
        let two_decimals = digits
            .split_once('.')
            .map(|(_, frac)| frac.len() == 2)
            .unwrap_or(false);
        if marker.is_none() && !two_decimals {
            continue;
        }

        let Ok(value) = digits.parse::<f64>() else { continue };
        if !value.is_finite() || value <= 0.0 || value >= max_amount {
            continue;
        }

        found.push(AmountCandidate {
            value,
            line: line.index,
            currency: marker,
            two_decimals,
            confidence: line.confidence,
        });
    }
    found
}

pub fn is_total_line(text: &str) -> bool {
    TOTAL_KEYWORD.is_match(text) && !SUBTOTAL.is_match(text)
}

fn larger(a: &&AmountCandidate, b: &&AmountCandidate) -> std::cmp::Ordering {
    a.value.total_cmp(&b.value)
}

/// Best amount and its currency code.
///
/// Strategies in order: nearest to a total keyword (same line, then the
/// line below), then currency-marked, then bare two-decimal numbers. Ties
/// go to the larger value.
pub(crate) fn find(
    lines: &[TranscriptLine],
    config: &ExtractorConfig,
) -> Option<(Found<f64>, Option<String>)> {
    let candidates: Vec<AmountCandidate> = lines
        .iter()
        .flat_map(|l| candidates_in(l, config.max_amount))
        .collect();
    if candidates.is_empty() {
        return None;
    }

    let total_lines: Vec<usize> = lines
        .iter()
        .filter(|l| is_total_line(&l.text))
        .map(|l| l.index)
        .collect();

    let distance = |c: &AmountCandidate| -> Option<usize> {
        total_lines
            .iter()
            .filter(|&&k| k == c.line || k + 1 == c.line)
            .map(|&k| c.line - k)
            .min()
    };

    let near_keyword = candidates
        .iter()
        .filter_map(|c| distance(c).map(|d| (d, c)))
        .min_by(|(da, a), (db, b)| da.cmp(db).then_with(|| b.value.total_cmp(&a.value)))
        .map(|(_, c)| (c, Provenance::AmountKeyword));

    let (best, provenance) = near_keyword
        .or_else(|| {
            candidates
                .iter()
                .filter(|c| c.currency.is_some())
                .max_by(larger)
                .map(|c| (c, Provenance::CurrencySymbol))
        })
        .or_else(|| {
            candidates
                .iter()
                .max_by(larger)
                .map(|c| (c, Provenance::DecimalPattern))
        })?;

    let largest = candidates
        .iter()
        .map(|c| c.value)
        .fold(f64::MIN, f64::max);
    let repeated = candidates
        .iter()
        .filter(|c| (c.value - best.value).abs() < 0.005)
        .count()
        > 1;

    let currency = best
        .currency
        .or_else(|| candidates.iter().find_map(|c| c.currency))
        .map(str::to_string);

    let found = Found {
        value: best.value,
        provenance,
        signals: Signals {
            keyword: provenance == Provenance::AmountKeyword,
            well_formed: best.two_decimals,
            cross_validated: best.value >= largest || repeated,
            ocr_confidence: best.confidence,
            cap: None,
        },
        line: Some(best.line),
    };
    Some((found, currency))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Transcript;

    fn find_in(text: &str) -> Option<(Found<f64>, Option<String>)> {
        let lines = Transcript::from_text(text).lines();
        find(&lines, &ExtractorConfig::default())
    }

    fn values(text: &str) -> Vec<f64> {
        let lines = Transcript::from_text(text).lines();
        lines
            .iter()
            .flat_map(|l| candidates_in(l, 1_000_000.0))
            .map(|c| c.value)
            .collect()
    }

    #[test]
    fn test_total_keyword_wins() {
        let (found, currency) =
            find_in("Coffee 4.50\nMuffin 3.25\nSubtotal 7.75\nTax 0.62\nTotal 8.37").unwrap();
        assert_eq!(found.value, 8.37);
        assert_eq!(found.provenance, Provenance::AmountKeyword);
        assert!(currency.is_none());
    }

    #[test]
    fn test_keyword_on_previous_line() {
        let (found, _) = find_in("Amount Due\n$1,250.00\nThank you").unwrap();
        assert_eq!(found.value, 1250.0);
        assert!(found.signals.keyword);
    }

    #[test]
    fn test_subtotal_is_not_a_total() {
        assert!(!is_total_line("Subtotal: 7.75"));
        assert!(!is_total_line("Sub-total 7.75"));
        assert!(is_total_line("TOTAL DUE 9.00"));
        assert!(is_total_line("Balance: 12.00"));
    }

    #[test]
    fn test_currency_fallback_prefers_larger() {
        let (found, currency) = find_in("Deposit €20.00 and €35.50 later").unwrap();
        assert_eq!(found.value, 35.5);
        assert_eq!(found.provenance, Provenance::CurrencySymbol);
        assert_eq!(currency.as_deref(), Some("EUR"));
    }

    #[test]
    fn test_iso_code_suffix() {
        let (found, currency) = find_in("Paid 99.95 CHF").unwrap();
        assert_eq!(found.value, 99.95);
        assert_eq!(currency.as_deref(), Some("CHF"));
    }

    #[test]
    fn test_prefixed_dollar_variants() {
        let (_, currency) = find_in("Total C$ 15.00").unwrap();
        assert_eq!(currency.as_deref(), Some("CAD"));
        let (_, currency) = find_in("Total US$15.00").unwrap();
        assert_eq!(currency.as_deref(), Some("USD"));
    }

    #[test]
    fn test_dates_phones_percentages_excluded() {
        assert!(values("Date 11.05.2024").is_empty());
        assert!(values("Call (555) 123-4567").is_empty());
        assert!(values("Tax 8.25%").is_empty());
        assert_eq!(values("Tax 8.25% 3.30"), vec![3.3]);
    }

    #[test]
    fn test_integers_need_currency() {
        assert!(values("Invoice #: 12345").is_empty());
        assert_eq!(values("Total $42"), vec![42.0]);
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(values("Total $0.00").is_empty());
        assert!(values("Total $1,000,000.00").is_empty());
        assert_eq!(values("Total $999,999.99"), vec![999_999.99]);
    }

    #[test]
    fn test_corroboration() {
        let (found, _) = find_in("Balance 10.00\nItem 55.00").unwrap();
        assert_eq!(found.value, 10.0);
        assert!(!found.signals.cross_validated);

        let (found, _) = find_in("Item 10.00\nTotal 10.00").unwrap();
        assert!(found.signals.cross_validated);
    }
}
