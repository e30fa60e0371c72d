//! Date extraction
//!
//! Patterns are tried in order against every line. Dates on or right after
//! an "invoice date" / "date" / "issued" line win; dates on "due" lines are
//! only used when nothing else matched.

use std::ops::Range;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use regex::{Captures, Regex};

use super::{ExtractorConfig, Found, Signals};
use crate::models::{Provenance, TranscriptLine};

const MONTHS: &str = r"jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    YearMonthDay,
    MonthDayYear,
    DayMonthYear,
    MonthNameDayYear,
    DayMonthNameYear,
}

static PATTERNS: LazyLock<Vec<(Layout, Regex)>> = LazyLock::new(|| {
    vec![
        (
            Layout::YearMonthDay,
            Regex::new(r"\b(?P<y>\d{4})[-/](?P<m>\d{1,2})[-/](?P<d>\d{1,2})\b")
                .expect("valid regex"),
        ),
        (
            Layout::MonthDayYear,
            Regex::new(r"\b(?P<m>\d{1,2})/(?P<d>\d{1,2})/(?P<y>\d{4}|\d{2})\b")
                .expect("valid regex"),
        ),
        (
            Layout::MonthNameDayYear,
            Regex::new(&format!(
                r"(?i)\b(?P<mon>{})\.?\s+(?P<d>\d{{1,2}})(?:st|nd|rd|th)?,?\s+(?P<y>\d{{4}})\b",
                MONTHS
            ))
            .expect("valid regex"),
        ),
        (
            Layout::DayMonthNameYear,
            Regex::new(&format!(
                r"(?i)\b(?P<d>\d{{1,2}})(?:st|nd|rd|th)?\s+(?P<mon>{})\.?,?\s+(?P<y>\d{{4}})\b",
                MONTHS
            ))
            .expect("valid regex"),
        ),
        (
            Layout::DayMonthYear,
            Regex::new(r"\b(?P<d>\d{1,2})-(?P<m>\d{1,2})-(?P<y>\d{4})\b").expect("valid regex"),
        ),
        (
            Layout::DayMonthYear,
            Regex::new(r"\b(?P<d>\d{1,2})\.(?P<m>\d{1,2})\.(?P<y>\d{4})\b").expect("valid regex"),
        ),
    ]
});

static DATE_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:invoice\s+date|dated?|issued)\b").expect("valid regex")
});

static DUE_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bdue\b").expect("valid regex"));

/// A date found on a line
#[derive(Debug, Clone, PartialEq)]
pub struct DateMatch {
    pub date: NaiveDate,
    pub span: Range<usize>,
    /// Index into the pattern list (lower is preferred)
    pub rank: usize,
    /// Four-digit year, valid calendar date
    pub well_formed: bool,
}

fn month_number(name: &str) -> Option<u32> {
    let lower = name.to_lowercase();
    let month = match lower.get(..3)? {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// Expand two-digit years: 00-68 map to 2000s, 69-99 to 1900s
fn expand_year(raw: &str) -> Option<(i32, bool)> {
    let year: i32 = raw.parse().ok()?;
    if raw.len() == 2 {
        let full = if year <= 68 { 2000 + year } else { 1900 + year };
        Some((full, false))
    } else {
        Some((year, true))
    }
}

fn parse_captures(layout: Layout, caps: &Captures<'_>) -> Option<(NaiveDate, bool)> {
    let (year, four_digit) = expand_year(caps.name("y")?.as_str())?;
    let day: u32 = caps.name("d")?.as_str().parse().ok()?;
    let month: u32 = match layout {
        Layout::MonthNameDayYear | Layout::DayMonthNameYear => {
            month_number(caps.name("mon")?.as_str())?
        }
        _ => caps.name("m")?.as_str().parse().ok()?,
    };
    let date = match NaiveDate::from_ymd_opt(year, month, day) {
        // 25/12/2024 is day-first
        None if layout == Layout::MonthDayYear && month > 12 => {
            NaiveDate::from_ymd_opt(year, day, month)
        }
        date => date,
    };
    date.map(|d| (d, four_digit))
}

/// All valid dates on a line. Spans claimed by an earlier pattern are not
/// matched again by a later one.
pub fn matches_in(text: &str) -> Vec<DateMatch> {
    let mut found: Vec<DateMatch> = Vec::new();
    for (rank, (layout, re)) in PATTERNS.iter().enumerate() {
        for caps in re.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            let span = whole.range();
            if found
                .iter()
                .any(|m| m.span.start < span.end && span.start < m.span.end)
            {
                continue;
            }
            if let Some((date, four_digit)) = parse_captures(*layout, &caps) {
                found.push(DateMatch {
                    date,
                    span,
                    rank,
                    well_formed: four_digit,
                });
            }
        }
    }
    found
}

/// Byte ranges on a line that look like dates, valid or not.
///
/// Used to keep amount candidates from matching pieces of a date.
pub fn spans_in(text: &str) -> Vec<Range<usize>> {
    PATTERNS
        .iter()
        .flat_map(|(_, re)| re.find_iter(text).map(|m| m.range()))
        .collect()
}

pub fn is_plausible(date: NaiveDate, today: NaiveDate, years: i32) -> bool {
    let latest = today + Duration::days(1);
    let earliest = NaiveDate::from_ymd_opt(today.year() - years, today.month(), 1)
        .unwrap_or(NaiveDate::MIN);
    date <= latest && date >= earliest
}

#[derive(Debug)]
struct Candidate {
    m: DateMatch,
    line: usize,
    confidence: f32,
    distance: Option<usize>,
    due: bool,
}

pub(crate) fn find(
    lines: &[TranscriptLine],
    config: &ExtractorConfig,
    today: NaiveDate,
) -> Option<Found<NaiveDate>> {
    let keyword_lines: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| DATE_KEYWORD.is_match(&l.text) && !DUE_KEYWORD.is_match(&l.text))
        .map(|(i, _)| i)
        .collect();

    let mut candidates: Vec<Candidate> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let due = DUE_KEYWORD.is_match(&line.text);
        for m in matches_in(&line.text) {
            // Same line, or the line right below a keyword-only label
            let distance = keyword_lines
                .iter()
                .filter(|&&k| k == i || k + 1 == i)
                .map(|&k| i - k)
                .min();
            candidates.push(Candidate {
                m,
                line: i,
                confidence: line.confidence,
                distance: if due { None } else { distance },
                due,
            });
        }
    }

    let best = candidates
        .iter()
        .filter(|c| c.distance.is_some())
        .min_by_key(|c| (c.distance, c.m.rank, c.line))
        .or_else(|| {
            candidates
                .iter()
                .filter(|c| !c.due)
                .min_by_key(|c| (c.m.rank, c.line))
        })
        .or_else(|| candidates.iter().min_by_key(|c| (c.m.rank, c.line)))?;

    let keyword = best.distance.is_some();
    Some(Found {
        value: best.m.date,
        provenance: if keyword {
            Provenance::DateKeyword
        } else {
            Provenance::DatePattern
        },
        signals: Signals {
            keyword,
            well_formed: best.m.well_formed,
            cross_validated: is_plausible(best.m.date, today, config.plausible_years),
            ocr_confidence: best.confidence,
            cap: None,
        },
        line: Some(best.line),
    })
}

/// Fall back to the artifact timestamp, with capped confidence
pub(crate) fn from_timestamp(
    timestamp: DateTime<Utc>,
    config: &ExtractorConfig,
    today: NaiveDate,
) -> Found<NaiveDate> {
    let date = timestamp.date_naive();
    Found {
        value: date,
        provenance: Provenance::FileTimestamp,
        signals: Signals {
            well_formed: true,
            cross_validated: is_plausible(date, today, config.plausible_years),
            cap: Some(config.fallback_date_cap),
            ..Default::default()
        },
        line: None,
    }
}
