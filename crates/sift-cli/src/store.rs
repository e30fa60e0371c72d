//! JSON file expense store
//!
//! Keeps every filed expense in a single JSON document. Writes go to a
//! temporary file in the same directory and are renamed into place, so a
//! crash mid-write leaves the previous store intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sift_core::{
    link_duplicate, Error, Expense, ExpenseFilter, ExpenseId, ExpenseStore, NewExpense, Result,
    VendorCategoryHistory,
};
use tracing::{debug, warn};

const STORE_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    next_id: ExpenseId,
    expenses: Vec<Expense>,
}

pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoreFile>,
}

impl JsonFileStore {
    /// Open the store at `path`; a missing file is an empty store
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let content = fs::read_to_string(path)?;
            let mut file: StoreFile = if content.trim().is_empty() {
                StoreFile::default()
            } else {
                serde_json::from_str(&content).map_err(|e| {
                    Error::Storage(format!("Invalid expense store {}: {}", path.display(), e))
                })?
            };
            let max_id = file.expenses.iter().map(|e| e.id).max().unwrap_or(0);
            file.next_id = file.next_id.max(max_id);
            debug!(path = %path.display(), expenses = file.expenses.len(), "Opened expense store");
            file
        } else {
            debug!(path = %path.display(), "Expense store does not exist yet");
            StoreFile::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.lock().expenses.len()
    }

    fn lock(&self) -> MutexGuard<'_, StoreFile> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Recovering poisoned expense store lock");
            poisoned.into_inner()
        })
    }

    fn write(&self, state: &StoreFile) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let json = serde_json::to_string_pretty(state)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| {
            Error::Storage(format!("Failed to write {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }
}

#[async_trait]
impl ExpenseStore for JsonFileStore {
    async fn persist(&self, expense: NewExpense) -> Result<ExpenseId> {
        let mut state = self.lock();
        let id = state.next_id + 1;
        state.version = STORE_VERSION;
        state.next_id = id;
        state.expenses.push(expense.into_expense(id, Utc::now()));

        if let Err(e) = self.write(&state) {
            state.expenses.pop();
            state.next_id = id - 1;
            return Err(e);
        }
        debug!(expense_id = id, path = %self.path.display(), "Persisted expense");
        Ok(id)
    }

    async fn query(&self, filter: &ExpenseFilter) -> Result<Vec<Expense>> {
        let state = self.lock();
        let mut found: Vec<Expense> = state
            .expenses
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        found.sort_by_key(|e| e.id);
        Ok(found)
    }

    async fn history_for(&self, user_id: &str) -> Result<VendorCategoryHistory> {
        let state = self.lock();
        Ok(VendorCategoryHistory::from_expenses(
            state.expenses.iter().filter(|e| e.user_id == user_id),
        ))
    }

    async fn set_duplicate_of(
        &self,
        expense_id: ExpenseId,
        original: Option<ExpenseId>,
    ) -> Result<Expense> {
        let mut state = self.lock();
        let index = state
            .expenses
            .iter()
            .position(|e| e.id == expense_id)
            .ok_or_else(|| Error::NotFound(format!("expense {}", expense_id)))?;

        let previous = state.expenses[index].clone();
        link_duplicate(&mut state.expenses[index], original);
        if let Err(e) = self.write(&state) {
            state.expenses[index] = previous;
            return Err(e);
        }
        debug!(expense_id, duplicate_of = ?original, "Updated duplicate link");
        Ok(state.expenses[index].clone())
    }
}
