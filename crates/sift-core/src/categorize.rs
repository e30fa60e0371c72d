//! Adaptive category suggestions
//!
//! Suggestions combine three signals per category, added together and
//! clamped to 0-100:
//! 1. the vendor's own history (`min(95, 50 + 5 × count)`)
//! 2. a similar vendor's history when there is no exact entry (×0.8)
//! 3. keyword hits in the vendor and description text (+35 each, max 70)
//!
//! A vendor's own most-used category is never outranked by keyword evidence.
//! Learning is delegated to [`HistoryRegistry`], which serializes writers.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::history::{HistoryRegistry, VendorCategoryHistory};
use crate::models::{CategorySuggestion, Expense, ExpenseId};
use crate::similarity::{best_match, normalize_vendor, LevenshteinRatio, SimilarityScorer};

pub const DEFAULT_CATEGORY: &str = "Miscellaneous";

/// Immutable category → keywords table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeywordTable {
    categories: BTreeMap<String, Vec<String>>,
}

impl KeywordTable {
    pub fn new(categories: BTreeMap<String, Vec<String>>) -> Self {
        let categories = categories
            .into_iter()
            .map(|(category, keywords)| {
                let keywords = keywords
                    .iter()
                    .map(|k| normalize_text(k))
                    .filter(|k| !k.is_empty())
                    .collect();
                (category, keywords)
            })
            .collect();
        Self { categories }
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(|c| c.as_str())
    }

    pub fn keywords_for(&self, category: &str) -> Option<&[String]> {
        self.categories.get(category).map(|k| k.as_slice())
    }

    pub fn contains(&self, category: &str) -> bool {
        self.categories.contains_key(category)
    }

    /// Keywords of each category found in `text`, as whole words
    fn hits<'a>(&'a self, text: &str) -> Vec<(&'a str, Vec<&'a str>)> {
        let haystack = format!(" {} ", normalize_text(text));
        self.categories
            .iter()
            .filter_map(|(category, keywords)| {
                let found: Vec<&str> = keywords
                    .iter()
                    .filter(|k| haystack.contains(&format!(" {} ", k)))
                    .map(|k| k.as_str())
                    .collect();
                (!found.is_empty()).then_some((category.as_str(), found))
            })
            .collect()
    }
}

impl Default for KeywordTable {
    fn default() -> Self {
        let table: &[(&str, &[&str])] = &[
            (
                "Office Supplies",
                &["office", "staples", "paper", "pen", "desk", "supplies", "depot"],
            ),
            (
                "Software & Services",
                &[
                    "software",
                    "saas",
                    "subscription",
                    "cloud",
                    "hosting",
                    "adobe",
                    "microsoft",
                    "google",
                ],
            ),
            (
                "Travel",
                &["hotel", "airbnb", "flight", "airline", "uber", "lyft", "taxi", "rental", "car"],
            ),
            (
                "Meals & Entertainment",
                &["restaurant", "food", "coffee", "starbucks", "meal", "dining", "catering"],
            ),
            (
                "Utilities",
                &["electric", "gas", "water", "internet", "phone", "utility"],
            ),
            (
                "Marketing",
                &[
                    "advertising",
                    "marketing",
                    "facebook",
                    "google ads",
                    "social media",
                    "promotion",
                ],
            ),
            (
                "Equipment",
                &["computer", "laptop", "monitor", "equipment", "hardware", "machinery"],
            ),
            (
                "Professional Services",
                &["consulting", "legal", "accounting", "professional", "attorney", "cpa"],
            ),
            ("Insurance", &["insurance", "policy", "premium", "coverage"]),
            ("Rent & Lease", &["rent", "lease", "property", "landlord"]),
            ("Shipping", &["shipping", "fedex", "ups", "usps", "dhl", "postage"]),
            ("Maintenance", &["repair", "maintenance", "cleaning", "service"]),
            (
                "Training",
                &["training", "course", "education", "workshop", "seminar", "conference"],
            ),
            (DEFAULT_CATEGORY, &[]),
        ];

        Self::new(
            table
                .iter()
                .map(|(category, keywords)| {
                    (
                        category.to_string(),
                        keywords.iter().map(|k| k.to_string()).collect(),
                    )
                })
                .collect(),
        )
    }
}

/// Lowercase, alphanumerics only, single spaces
fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Scoring constants for the categorizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorizerConfig {
    pub keywords: KeywordTable,
    pub history_base: f64,
    pub history_step: f64,
    pub history_cap: f64,
    pub fuzzy_threshold: f64,
    pub fuzzy_factor: f64,
    pub keyword_hit: f64,
    pub keyword_cap: f64,
    pub max_suggestions: usize,
    pub default_category: String,
    pub default_confidence: u8,
}

impl Default for CategorizerConfig {
    fn default() -> Self {
        Self {
            keywords: KeywordTable::default(),
            history_base: 50.0,
            history_step: 5.0,
            history_cap: 95.0,
            fuzzy_threshold: 0.75,
            fuzzy_factor: 0.8,
            keyword_hit: 35.0,
            keyword_cap: 70.0,
            max_suggestions: 3,
            default_category: DEFAULT_CATEGORY.to_string(),
            default_confidence: 50,
        }
    }
}

#[derive(Debug, Default)]
struct Score {
    value: f64,
    count: u32,
    reasons: Vec<String>,
}

/// Ranks categories from history and keywords, and feeds choices back
#[derive(Clone)]
pub struct Categorizer {
    config: CategorizerConfig,
    scorer: Arc<dyn SimilarityScorer>,
}

impl Default for Categorizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Categorizer {
    pub fn new() -> Self {
        Self::with_config(CategorizerConfig::default())
    }

    pub fn with_config(config: CategorizerConfig) -> Self {
        Self {
            config,
            scorer: Arc::new(LevenshteinRatio),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn SimilarityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn config(&self) -> &CategorizerConfig {
        &self.config
    }

    fn history_score(&self, count: u32) -> f64 {
        (self.config.history_base + self.config.history_step * count as f64)
            .min(self.config.history_cap)
    }

    /// Up to `max_suggestions` categories, best first
    pub fn suggest(
        &self,
        history: &VendorCategoryHistory,
        vendor: &str,
        description: &str,
    ) -> Vec<CategorySuggestion> {
        let mut scores: BTreeMap<String, Score> = BTreeMap::new();
        let normalized = normalize_vendor(vendor);

        let exact = if normalized.is_empty() {
            None
        } else {
            history.get_normalized(&normalized)
        };

        if let Some(entry) = exact {
            for (category, usage) in &entry.categories {
                let score = scores.entry(category.clone()).or_default();
                score.value += self.history_score(usage.count);
                score.count = usage.count;
                score.reasons.push(format!(
                    "Used {} time{} for {}",
                    usage.count,
                    if usage.count == 1 { "" } else { "s" },
                    entry.display_name
                ));
            }
        } else if !normalized.is_empty() {
            let similar = best_match(
                self.scorer.as_ref(),
                &normalized,
                history.keys(),
                self.config.fuzzy_threshold,
            );
            if let Some((key, ratio)) = similar {
                if let Some(entry) = history.get_normalized(key) {
                    debug!(vendor, similar = key, ratio, "Fuzzy vendor match");
                    for (category, usage) in &entry.categories {
                        let score = scores.entry(category.clone()).or_default();
                        score.value += self.history_score(usage.count) * self.config.fuzzy_factor;
                        score.count = usage.count;
                        score.reasons.push(format!(
                            "Similar vendor '{}' used {} time{}",
                            entry.display_name,
                            usage.count,
                            if usage.count == 1 { "" } else { "s" }
                        ));
                    }
                }
            }
        }

        let text = format!("{} {}", vendor, description);
        for (category, keywords) in self.config.keywords.hits(&text) {
            let boost =
                (self.config.keyword_hit * keywords.len() as f64).min(self.config.keyword_cap);
            let score = scores.entry(category.to_string()).or_default();
            score.value += boost;
            score.reasons.push(format!("Matched keywords: {}", keywords.join(", ")));
        }

        for score in scores.values_mut() {
            score.value = score.value.clamp(0.0, 100.0);
        }

        // The vendor's own leader is never outranked by keyword evidence
        if let Some((leader, _)) = exact.and_then(|e| e.leader()) {
            let top = scores.values().map(|s| s.value).fold(0.0, f64::max);
            if let Some(score) = scores.get_mut(leader) {
                if score.value < top {
                    score.value = top;
                }
            }
        }

        if scores.is_empty() {
            return vec![CategorySuggestion {
                category: self.config.default_category.clone(),
                confidence: self.config.default_confidence,
                reason: "Default category".to_string(),
            }];
        }

        let mut ranked: Vec<(String, Score)> = scores.into_iter().collect();
        ranked.sort_by(|(a_name, a), (b_name, b)| {
            b.value
                .total_cmp(&a.value)
                .then_with(|| b.count.cmp(&a.count))
                .then_with(|| a_name.cmp(b_name))
        });

        ranked
            .into_iter()
            .take(self.config.max_suggestions)
            .map(|(category, score)| CategorySuggestion {
                category,
                confidence: score.value.round() as u8,
                reason: score.reasons.join("; "),
            })
            .collect()
    }

    /// Record the user's final choice, whether or not it was suggested
    pub fn learn(
        &self,
        registry: &HistoryRegistry,
        user_id: &str,
        vendor: &str,
        description: &str,
        chosen_category: &str,
        at: DateTime<Utc>,
    ) -> Arc<VendorCategoryHistory> {
        debug!(
            user = user_id,
            vendor,
            description,
            category = chosen_category,
            "Learning category choice"
        );
        registry.learn(user_id, vendor, chosen_category, at)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Vendors listed in [`ExpenseStatistics::by_vendor`]
pub const TOP_VENDORS: usize = 10;
/// Ids listed in [`ExpenseStatistics::recent`]
pub const RECENT_EXPENSES: usize = 10;

/// Count and amount for one group of expenses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupTotal {
    pub name: String,
    pub count: usize,
    pub total: f64,
}

/// Totals over a set of filed expenses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpenseStatistics {
    pub total_expenses: usize,
    pub total_amount: f64,
    /// Largest total first
    pub by_category: Vec<GroupTotal>,
    /// Top vendors by total
    pub by_vendor: Vec<GroupTotal>,
    /// Keyed `YYYY-MM`, newest first
    pub by_month: Vec<GroupTotal>,
    /// Most recently filed first
    pub recent: Vec<ExpenseId>,
}

impl ExpenseStatistics {
    pub fn from_expenses(expenses: &[Expense]) -> Self {
        let mut categories = BTreeMap::new();
        let mut vendors = BTreeMap::new();
        let mut months = BTreeMap::new();
        for expense in expenses {
            let category = match expense.category.trim() {
                "" => "Uncategorized",
                name => name,
            };
            let vendor = match expense.vendor.trim() {
                "" => "Unknown",
                name => name,
            };
            add_to(&mut categories, category, expense.amount);
            add_to(&mut vendors, vendor, expense.amount);
            add_to(&mut months, &expense.date.format("%Y-%m").to_string(), expense.amount);
        }

        let by_category = largest_first(categories);
        let mut by_vendor = largest_first(vendors);
        by_vendor.truncate(TOP_VENDORS);
        let mut by_month = into_totals(months);
        by_month.reverse();

        let mut recent: Vec<&Expense> = expenses.iter().collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Self {
            total_expenses: expenses.len(),
            total_amount: expenses.iter().map(|e| e.amount).sum(),
            by_category,
            by_vendor,
            by_month,
            recent: recent.into_iter().take(RECENT_EXPENSES).map(|e| e.id).collect(),
        }
    }
}

fn add_to(groups: &mut BTreeMap<String, (usize, f64)>, name: &str, amount: f64) {
    let entry = groups.entry(name.to_string()).or_insert((0, 0.0));
    entry.0 += 1;
    entry.1 += amount;
}

fn into_totals(groups: BTreeMap<String, (usize, f64)>) -> Vec<GroupTotal> {
    groups
        .into_iter()
        .map(|(name, (count, total))| GroupTotal { name, count, total })
        .collect()
}

/// Ties keep name order
fn largest_first(groups: BTreeMap<String, (usize, f64)>) -> Vec<GroupTotal> {
    let mut totals = into_totals(groups);
    totals.sort_by(|a, b| b.total.total_cmp(&a.total));
    totals
}
