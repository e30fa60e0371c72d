//! Storage collaborator
//!
//! The pipeline never owns a storage engine. It talks to whatever the
//! caller plugs in through [`ExpenseStore`]. [`MemoryStore`] is the
//! bundled in-process implementation used by tests and the CLI.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::history::VendorCategoryHistory;
use crate::models::{Expense, ExpenseFilter, ExpenseId, NewExpense};

/// Trait for persisting and querying filed expenses
///
/// Implementations must be Send + Sync so one store can be shared by every
/// worker in the pipeline.
#[async_trait]
pub trait ExpenseStore: Send + Sync {
    /// Persist a finished expense and return its assigned id
    async fn persist(&self, expense: NewExpense) -> Result<ExpenseId>;

    /// Expenses matching the filter, in id order
    async fn query(&self, filter: &ExpenseFilter) -> Result<Vec<Expense>>;

    /// Vendor/category history for one user
    async fn history_for(&self, user_id: &str) -> Result<VendorCategoryHistory>;

    /// Record (`Some`) or clear (`None`) the expense this one duplicates.
    ///
    /// Returns the updated expense, or [`Error::NotFound`] for an unknown id.
    async fn set_duplicate_of(
        &self,
        expense_id: ExpenseId,
        original: Option<ExpenseId>,
    ) -> Result<Expense>;
}

/// Apply a duplicate link to `expense` in place
pub fn link_duplicate(expense: &mut Expense, original: Option<ExpenseId>) {
    expense.duplicate_of = original;
    expense.duplicate_marked_at = original.map(|_| Utc::now());
}

#[derive(Debug, Default)]
struct MemoryInner {
    expenses: Vec<Expense>,
    next_id: ExpenseId,
}

/// In-memory store. History is rebuilt from the stored expenses.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from previously filed expenses (ids are kept)
    pub fn with_expenses(expenses: Vec<Expense>) -> Self {
        let next_id = expenses.iter().map(|e| e.id).max().unwrap_or(0);
        Self {
            inner: Mutex::new(MemoryInner { expenses, next_id }),
        }
    }

    /// Every stored expense, in id order
    pub fn expenses(&self) -> Vec<Expense> {
        self.lock().expenses.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().expenses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("Recovering poisoned memory store lock");
            poisoned.into_inner()
        })
    }
}

#[async_trait]
impl ExpenseStore for MemoryStore {
    async fn persist(&self, expense: NewExpense) -> Result<ExpenseId> {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        debug!(
            expense_id = id,
            user = %expense.user_id,
            vendor = %expense.vendor,
            "Persisted expense"
        );
        inner.expenses.push(expense.into_expense(id, Utc::now()));
        Ok(id)
    }

    async fn query(&self, filter: &ExpenseFilter) -> Result<Vec<Expense>> {
        let inner = self.lock();
        let mut found: Vec<Expense> = inner
            .expenses
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        found.sort_by_key(|e| e.id);
        Ok(found)
    }

    async fn history_for(&self, user_id: &str) -> Result<VendorCategoryHistory> {
        let inner = self.lock();
        Ok(VendorCategoryHistory::from_expenses(
            inner.expenses.iter().filter(|e| e.user_id == user_id),
        ))
    }

    async fn set_duplicate_of(
        &self,
        expense_id: ExpenseId,
        original: Option<ExpenseId>,
    ) -> Result<Expense> {
        let mut inner = self.lock();
        let expense = inner
            .expenses
            .iter_mut()
            .find(|e| e.id == expense_id)
            .ok_or_else(|| Error::NotFound(format!("expense {}", expense_id)))?;
        link_duplicate(expense, original);
        debug!(expense_id, duplicate_of = ?original, "Updated duplicate link");
        Ok(expense.clone())
    }
}
