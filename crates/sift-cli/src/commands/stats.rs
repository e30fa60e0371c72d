//! Expense statistics command

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use sift_core::{DuplicateStats, ExpenseFilter, ExpenseStatistics, ExpenseStore, GroupTotal};

use super::common::open_store;
use super::truncate;

#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub expenses: ExpenseStatistics,
    pub duplicates: DuplicateStats,
}

pub async fn cmd_stats(data: &Path, user: &str, json: bool) -> Result<()> {
    let report = load_stats(data, user).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let expenses = &report.expenses;
    if expenses.total_expenses == 0 {
        println!("No expenses filed yet for {}", user);
        return Ok(());
    }
    println!(
        "📊 {} expenses for {}, {:.2} total",
        expenses.total_expenses, user, expenses.total_amount
    );
    print_groups("By category", &expenses.by_category);
    print_groups("Top vendors", &expenses.by_vendor);
    print_groups("By month", &expenses.by_month);

    let duplicates = &report.duplicates;
    println!();
    println!("🔍 Duplicate detection");
    println!("   content hash     {:>6}", duplicates.with_content_hash);
    println!("   perceptual hash  {:>6}", duplicates.with_perceptual_hash);
    println!("   invoice number   {:>6}", duplicates.with_invoice_number);
    println!("   marked duplicate {:>6}", duplicates.marked_duplicates);
    Ok(())
}

pub async fn load_stats(data: &Path, user: &str) -> Result<StatsReport> {
    let store = open_store(data)?;
    let expenses = store
        .query(&ExpenseFilter::for_user(user))
        .await
        .context("Failed to query expenses")?;
    Ok(StatsReport {
        expenses: ExpenseStatistics::from_expenses(&expenses),
        duplicates: DuplicateStats::from_expenses(&expenses),
    })
}

fn print_groups(title: &str, groups: &[GroupTotal]) {
    println!();
    println!("   {}", title);
    for group in groups {
        println!(
            "      {:<24} {:>4}  {:>10.2}",
            truncate(&group.name, 24),
            group.count,
            group.total
        );
    }
}
