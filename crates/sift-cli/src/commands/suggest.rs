//! Category suggestion command

use std::path::Path;

use anyhow::{Context, Result};
use sift_core::{Categorizer, CategorySuggestion, ExpenseStore};

use super::common::{load_config, open_store};

pub async fn cmd_suggest(
    data: &Path,
    config: Option<&Path>,
    user: &str,
    vendor: &str,
    description: &str,
) -> Result<()> {
    let config = load_config(config)?;
    let store = open_store(data)?;
    let history = store
        .history_for(user)
        .await
        .context("Failed to load vendor history")?;

    let categorizer = Categorizer::with_config(config.categorizer);
    let suggestions = categorizer.suggest(&history, vendor, description);

    println!("🏷️  Suggestions for {}", vendor);
    print_suggestions(&suggestions);
    Ok(())
}

pub fn print_suggestions(suggestions: &[CategorySuggestion]) {
    for (rank, s) in suggestions.iter().enumerate() {
        println!(
            "   {}. {:<24} {:>3}%  {}",
            rank + 1,
            s.category,
            s.confidence,
            s.reason
        );
    }
}
