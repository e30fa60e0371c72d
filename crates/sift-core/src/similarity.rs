//! Fuzzy string matching for vendor names
//!
//! The categorizer and duplicate detector both compare vendor strings. The
//! comparison is behind [`SimilarityScorer`] so a different metric can be
//! swapped in without touching either engine.

/// Pairwise string similarity in [0.0, 1.0]
pub trait SimilarityScorer: Send + Sync {
    fn ratio(&self, a: &str, b: &str) -> f64;
}

/// Normalized Levenshtein ratio over lowercased input
#[derive(Debug, Clone, Copy, Default)]
pub struct LevenshteinRatio;

impl SimilarityScorer for LevenshteinRatio {
    fn ratio(&self, a: &str, b: &str) -> f64 {
        let a = a.trim().to_lowercase();
        let b = b.trim().to_lowercase();
        if a.is_empty() && b.is_empty() {
            return 1.0;
        }
        strsim::normalized_levenshtein(&a, &b)
    }
}

const CORPORATE_SUFFIXES: &[&str] = &["inc", "llc", "ltd", "corp", "co"];

/// Normalize a vendor name for history lookups.
///
/// Lowercases, replaces punctuation other than `&` and `.` with spaces,
/// collapses whitespace and strips trailing corporate suffixes
/// ("Staples, Inc." and "staples" normalize the same).
pub fn normalize_vendor(vendor: &str) -> String {
    let cleaned: String = vendor
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '&' || c == '.' {
                c
            } else {
                ' '
            }
        })
        .collect();

    let mut words: Vec<&str> = cleaned
        .split_whitespace()
        .map(|w| w.trim_matches('.'))
        .filter(|w| !w.is_empty())
        .collect();

    // Keep at least one word so "Co." alone does not vanish
    while words.len() > 1 {
        match words.last() {
            Some(last) if CORPORATE_SUFFIXES.contains(last) => {
                words.pop();
            }
            _ => break,
        }
    }

    words.join(" ")
}

/// Best candidate at or above `threshold`, with its ratio.
///
/// Ties keep the earliest candidate.
pub fn best_match<'a, I>(
    scorer: &dyn SimilarityScorer,
    needle: &str,
    candidates: I,
    threshold: f64,
) -> Option<(&'a str, f64)>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(&'a str, f64)> = None;
    for candidate in candidates {
        let ratio = scorer.ratio(needle, candidate);
        if ratio < threshold {
            continue;
        }
        match best {
            Some((_, r)) if r >= ratio => {}
            _ => best = Some((candidate, ratio)),
        }
    }
    best
}
