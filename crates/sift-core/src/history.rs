//! Per-user vendor → category history
//!
//! History is append-only: learning increments a count and refreshes the
//! last-used timestamp, nothing ever decrements. Writers for one user are
//! serialized through [`HistoryRegistry`]; readers get an immutable
//! [`Arc`] snapshot and never block a writer for longer than a pointer swap.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::Expense;
use crate::similarity::normalize_vendor;

/// How often and how recently a category was chosen for a vendor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryUsage {
    pub count: u32,
    pub last_used: DateTime<Utc>,
}

/// History for one normalized vendor
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VendorEntry {
    /// Most recent spelling the user filed this vendor under
    pub display_name: String,
    pub categories: BTreeMap<String, CategoryUsage>,
}

impl VendorEntry {
    /// Most frequent category; ties go alphabetical
    pub fn leader(&self) -> Option<(&str, &CategoryUsage)> {
        self.categories
            .iter()
            .max_by(|(a_name, a), (b_name, b)| {
                a.count.cmp(&b.count).then_with(|| b_name.cmp(a_name))
            })
            .map(|(name, usage)| (name.as_str(), usage))
    }

    pub fn total(&self) -> u32 {
        self.categories.values().map(|u| u.count).sum()
    }
}

/// Normalized vendor → {category → usage}
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VendorCategoryHistory {
    vendors: BTreeMap<String, VendorEntry>,
}

impl VendorCategoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild history from filed expenses, oldest first
    pub fn from_expenses<'a, I>(expenses: I) -> Self
    where
        I: IntoIterator<Item = &'a Expense>,
    {
        let mut sorted: Vec<&Expense> = expenses.into_iter().collect();
        sorted.sort_by_key(|e| (e.created_at, e.id));

        let mut history = Self::new();
        for expense in sorted {
            history.record(&expense.vendor, &expense.category, expense.created_at);
        }
        history
    }

    /// Increment `category` for `vendor`.
    ///
    /// Returns false (and records nothing) when the vendor normalizes to an
    /// empty string or the category is blank.
    pub fn record(&mut self, vendor: &str, category: &str, at: DateTime<Utc>) -> bool {
        let key = normalize_vendor(vendor);
        let category = category.trim();
        if key.is_empty() || category.is_empty() {
            return false;
        }

        let entry = self.vendors.entry(key).or_default();
        entry.display_name = vendor.trim().to_string();
        let usage = entry
            .categories
            .entry(category.to_string())
            .or_insert(CategoryUsage {
                count: 0,
                last_used: at,
            });
        usage.count += 1;
        if at > usage.last_used {
            usage.last_used = at;
        }
        true
    }

    /// Entry for a raw (unnormalized) vendor name
    pub fn get(&self, vendor: &str) -> Option<&VendorEntry> {
        self.vendors.get(&normalize_vendor(vendor))
    }

    /// Entry for an already-normalized key
    pub fn get_normalized(&self, key: &str) -> Option<&VendorEntry> {
        self.vendors.get(key)
    }

    pub fn count(&self, vendor: &str, category: &str) -> u32 {
        self.get(vendor)
            .and_then(|e| e.categories.get(category))
            .map(|u| u.count)
            .unwrap_or(0)
    }

    /// Normalized vendor keys
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vendors.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VendorEntry)> {
        self.vendors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Display spellings of every known vendor
    pub fn known_vendors(&self) -> Vec<String> {
        self.vendors.values().map(|e| e.display_name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.vendors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vendors.is_empty()
    }
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Recovering poisoned {} lock", what);
        poisoned.into_inner()
    })
}

#[derive(Debug, Default)]
struct UserHistory {
    /// Held for the whole read-modify-swap of a write
    writer: Mutex<()>,
    snapshot: RwLock<Arc<VendorCategoryHistory>>,
}

impl UserHistory {
    fn read(&self) -> Arc<VendorCategoryHistory> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => {
                warn!("Recovering poisoned history snapshot lock");
                Arc::clone(&poisoned.into_inner())
            }
        }
    }

    fn swap(&self, next: Arc<VendorCategoryHistory>) {
        match self.snapshot.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => {
                warn!("Recovering poisoned history snapshot lock");
                *poisoned.into_inner() = next;
            }
        }
    }
}

/// Owner of every user's history.
///
/// Created by the caller (typically the pipeline) and passed explicitly;
/// there is no global history.
#[derive(Debug, Default)]
pub struct HistoryRegistry {
    users: Mutex<HashMap<String, Arc<UserHistory>>>,
}

impl HistoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn user(&self, user_id: &str) -> Arc<UserHistory> {
        let mut users = lock_or_recover(&self.users, "history registry");
        Arc::clone(users.entry(user_id.to_string()).or_default())
    }

    pub fn contains(&self, user_id: &str) -> bool {
        lock_or_recover(&self.users, "history registry").contains_key(user_id)
    }

    /// Seed a user's history (e.g. from the store) unless already present.
    ///
    /// Returns the snapshot now in effect.
    pub fn seed(
        &self,
        user_id: &str,
        history: VendorCategoryHistory,
    ) -> Arc<VendorCategoryHistory> {
        let mut users = lock_or_recover(&self.users, "history registry");
        if let Some(existing) = users.get(user_id) {
            return existing.read();
        }
        let entry = Arc::new(UserHistory {
            writer: Mutex::new(()),
            snapshot: RwLock::new(Arc::new(history)),
        });
        let snapshot = entry.read();
        users.insert(user_id.to_string(), entry);
        snapshot
    }

    /// Immutable snapshot of a user's history; `None` until the user is
    /// seeded or learns something. Never creates an entry.
    pub fn snapshot(&self, user_id: &str) -> Option<Arc<VendorCategoryHistory>> {
        lock_or_recover(&self.users, "history registry")
            .get(user_id)
            .map(|user| user.read())
    }

    /// Record one choice. Writes for the same user are serialized so no
    /// concurrent update is lost.
    pub fn learn(
        &self,
        user_id: &str,
        vendor: &str,
        category: &str,
        at: DateTime<Utc>,
    ) -> Arc<VendorCategoryHistory> {
        let user = self.user(user_id);
        let _writer = lock_or_recover(&user.writer, "history writer");

        let mut next = (*user.read()).clone();
        if next.record(vendor, category, at) {
            debug!(user = user_id, vendor, category, "Learned vendor category");
        } else {
            debug!(user = user_id, vendor, "Skipped learning for empty vendor");
        }
        let next = Arc::new(next);
        user.swap(Arc::clone(&next));
        next
    }
}
