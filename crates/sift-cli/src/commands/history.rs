//! Vendor history command

use std::path::Path;

use anyhow::{Context, Result};
use sift_core::{ExpenseStore, VendorEntry};

use super::common::open_store;

pub async fn cmd_history(data: &Path, user: &str, vendor: Option<&str>) -> Result<()> {
    let store = open_store(data)?;
    let history = store
        .history_for(user)
        .await
        .context("Failed to load vendor history")?;

    match vendor {
        Some(name) => match history.get(name) {
            Some(entry) => print_entry(entry),
            None => println!("No history for {}", name),
        },
        None => {
            if history.is_empty() {
                println!("No history yet for {} ({})", user, store.path().display());
                return Ok(());
            }
            println!("📚 {} vendors for {}", history.len(), user);
            for (_, entry) in history.iter() {
                print_entry(entry);
            }
        }
    }
    Ok(())
}

fn print_entry(entry: &VendorEntry) {
    println!("   {} ({} filed)", entry.display_name, entry.total());
    let mut categories: Vec<_> = entry.categories.iter().collect();
    categories.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(b.0)));
    for (category, usage) in categories {
        println!(
            "      {:<24} {:>4}  last {}",
            category,
            usage.count,
            usage.last_used.format("%Y-%m-%d")
        );
    }
}
