//! CLI command tests
//!
//! This module contains all tests for the CLI commands and the JSON store.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use sift_core::test_utils::{hardware_receipt_text, new_expense, sample_receipt_text};
use sift_core::{ExpenseFilter, ExpenseStore};
use tempfile::TempDir;

use crate::cli::{Cli, Commands};
use crate::commands::{self, truncate, ProcessOptions};
use crate::store::JsonFileStore;

fn write_file(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

fn store_path(dir: &TempDir) -> PathBuf {
    dir.path().join("data").join("expenses.json")
}

async fn filed(data: &Path) -> Vec<sift_core::Expense> {
    JsonFileStore::open(data)
        .unwrap()
        .query(&ExpenseFilter::default())
        .await
        .unwrap()
}

fn with_category(category: &str) -> ProcessOptions {
    ProcessOptions {
        category: Some(category.to_string()),
        ..ProcessOptions::default()
    }
}

// ========== Helper Tests ==========

#[test]
fn test_truncate() {
    assert_eq!(truncate("short", 10), "short");
    assert_eq!(truncate("Hammer, Wood Screws, Sandpaper", 12), "Hammer, W...");
    assert_eq!(truncate("café au lait", 6), "caf...");
}

#[test]
fn test_default_data_path() {
    let path = commands::default_data_path();
    assert!(path.ends_with("expenses.json"));
}

#[test]
fn test_cli_parses_process_flags() {
    let cli = Cli::try_parse_from([
        "sift",
        "--user",
        "alice",
        "process",
        "--file",
        "scan.pdf",
        "--transcript",
        "scan.json",
        "--file-anyway",
    ])
    .unwrap();

    assert_eq!(cli.user, "alice");
    assert!(cli.data.is_none());
    match cli.command {
        Commands::Process {
            file,
            transcript,
            category,
            file_anyway,
        } => {
            assert_eq!(file, PathBuf::from("scan.pdf"));
            assert_eq!(transcript, Some(PathBuf::from("scan.json")));
            assert!(category.is_none());
            assert!(file_anyway);
        }
        _ => panic!("expected process command"),
    }
}

#[test]
fn test_cli_parses_duplicate_marking() {
    let cli = Cli::try_parse_from(["sift", "check", "--mark", "7", "--of", "3"]).unwrap();
    match cli.command {
        Commands::Check { file, mark, of, .. } => {
            assert!(file.is_none());
            assert_eq!((mark, of), (Some(7), Some(3)));
        }
        _ => panic!("expected check command"),
    }

    assert!(Cli::try_parse_from(["sift", "check", "--mark", "7"]).is_err());
    assert!(Cli::try_parse_from(["sift", "check"]).is_err());
    assert!(Cli::try_parse_from(["sift", "check", "--file", "a.pdf", "--unmark", "2"]).is_err());
    assert!(Cli::try_parse_from(["sift", "check", "--list"]).is_ok());
}

#[test]
fn test_format_amount_uses_currency_symbol() {
    assert_eq!(commands::format_amount(42.99, "USD"), "$42.99 USD");
    assert_eq!(commands::format_amount(8.5, "EUR"), "€8.50 EUR");
    assert_eq!(commands::format_amount(12.5, "CHF"), "12.50 CHF");
}

#[test]
fn test_cli_user_defaults_to_local() {
    let cli = Cli::try_parse_from(["sift", "history"]).unwrap();
    assert_eq!(cli.user, "local");
    assert!(!cli.verbose);
}

// ========== JSON Store Tests ==========

#[tokio::test]
async fn test_store_missing_file_is_empty() {
    let dir = TempDir::new().unwrap();
    let store = JsonFileStore::open(&store_path(&dir)).unwrap();

    assert_eq!(store.len(), 0);
    let history = store.history_for("local").await.unwrap();
    assert!(history.is_empty());
}

#[tokio::test]
async fn test_store_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir);

    let store = JsonFileStore::open(&path).unwrap();
    assert_eq!(store.persist(new_expense("alice", "Uber", "Travel")).await.unwrap(), 1);
    assert_eq!(store.persist(new_expense("bob", "Lyft", "Travel")).await.unwrap(), 2);
    drop(store);

    let reopened = JsonFileStore::open(&path).unwrap();
    assert_eq!(reopened.len(), 2);
    let alice = reopened.query(&ExpenseFilter::for_user("alice")).await.unwrap();
    assert_eq!(alice.len(), 1);
    assert_eq!(alice[0].vendor, "Uber");

    let id = reopened
        .persist(new_expense("alice", "Uber", "Travel"))
        .await
        .unwrap();
    assert_eq!(id, 3);
    let history = reopened.history_for("alice").await.unwrap();
    assert_eq!(history.count("Uber", "Travel"), 2);
}

#[tokio::test]
async fn test_store_duplicate_link_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir);

    let store = JsonFileStore::open(&path).unwrap();
    store.persist(new_expense("alice", "Uber", "Travel")).await.unwrap();
    store.persist(new_expense("alice", "Uber", "Travel")).await.unwrap();
    let marked = store.set_duplicate_of(2, Some(1)).await.unwrap();
    assert_eq!(marked.duplicate_of, Some(1));
    assert!(matches!(
        store.set_duplicate_of(5, Some(1)).await,
        Err(sift_core::Error::NotFound(_))
    ));
    drop(store);

    let reopened = JsonFileStore::open(&path).unwrap();
    let expenses = reopened.query(&ExpenseFilter::default()).await.unwrap();
    assert_eq!(expenses[1].duplicate_of, Some(1));
    assert!(expenses[1].duplicate_marked_at.is_some());
    assert!(expenses[0].duplicate_of.is_none());
}

#[test]
fn test_store_reads_expenses_without_duplicate_fields() {
    let dir = TempDir::new().unwrap();
    let seeded = serde_json::json!({
        "version": 1,
        "next_id": 1,
        "expenses": [new_expense("alice", "Uber", "Travel").into_expense(1, chrono::Utc::now())],
    });
    let mut raw = seeded.to_string();
    assert!(!raw.contains("duplicate_of"));
    raw.push('\n');
    let path = write_file(&dir, "expenses.json", raw.as_bytes());

    let store = JsonFileStore::open(&path).unwrap();
    assert_eq!(store.len(), 1);
}

#[test]
fn test_store_rejects_corrupt_file() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "expenses.json", b"{ not json");

    let result = JsonFileStore::open(&path);
    assert!(matches!(result, Err(sift_core::Error::Storage(_))));
}

// ========== Extract / Suggest / History Command Tests ==========

#[tokio::test]
async fn test_cmd_extract_text_and_json() {
    let dir = TempDir::new().unwrap();
    let data = store_path(&dir);
    let file = write_file(&dir, "receipt.txt", sample_receipt_text().as_bytes());

    assert!(commands::cmd_extract(&data, None, "local", &file, false).await.is_ok());
    assert!(commands::cmd_extract(&data, None, "local", &file, true).await.is_ok());
}

#[tokio::test]
async fn test_cmd_extract_missing_file() {
    let dir = TempDir::new().unwrap();
    let data = store_path(&dir);
    let missing = dir.path().join("nope.txt");

    let result = commands::cmd_extract(&data, None, "local", &missing, false).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_cmd_suggest_and_history() {
    let dir = TempDir::new().unwrap();
    let data = store_path(&dir);

    assert!(commands::cmd_history(&data, "local", None).await.is_ok());

    let store = JsonFileStore::open(&data).unwrap();
    for _ in 0..3 {
        store
            .persist(new_expense("local", "Staples", "Office Supplies"))
            .await
            .unwrap();
    }

    assert!(commands::cmd_suggest(&data, None, "local", "Staples", "").await.is_ok());
    assert!(commands::cmd_history(&data, "local", None).await.is_ok());
    assert!(commands::cmd_history(&data, "local", Some("staples")).await.is_ok());
    assert!(commands::cmd_history(&data, "local", Some("Unknown")).await.is_ok());
}

// ========== Process Command Tests ==========

#[tokio::test]
async fn test_cmd_process_files_expense() {
    let dir = TempDir::new().unwrap();
    let data = store_path(&dir);
    let file = write_file(&dir, "hardware.txt", hardware_receipt_text().as_bytes());

    let id = commands::cmd_process(&data, None, "local", &file, &with_category("Maintenance"))
        .await
        .unwrap();
    assert_eq!(id, 1);

    let expenses = filed(&data).await;
    assert_eq!(expenses.len(), 1);
    let expense = &expenses[0];
    assert_eq!(expense.vendor, "Corner Hardware");
    assert_eq!(expense.amount, 22.45);
    assert_eq!(expense.category, "Maintenance");
    assert_eq!(expense.invoice_number.as_deref(), Some("A7731"));
    assert_eq!(expense.original_filename.as_deref(), Some("hardware.txt"));
    assert!(expense.content_hash.is_some());
}

#[tokio::test]
async fn test_cmd_process_defaults_to_top_suggestion() {
    let dir = TempDir::new().unwrap();
    let data = store_path(&dir);
    let file = write_file(&dir, "hardware.txt", hardware_receipt_text().as_bytes());

    commands::cmd_process(&data, None, "local", &file, &ProcessOptions::default())
        .await
        .unwrap();

    let expenses = filed(&data).await;
    assert_eq!(expenses.len(), 1);
    assert!(!expenses[0].category.is_empty());
}

#[tokio::test]
async fn test_cmd_process_blocks_duplicate_reupload() {
    let dir = TempDir::new().unwrap();
    let data = store_path(&dir);
    let file = write_file(&dir, "hardware.txt", hardware_receipt_text().as_bytes());
    let options = with_category("Maintenance");

    commands::cmd_process(&data, None, "local", &file, &options)
        .await
        .unwrap();

    let blocked = commands::cmd_process(&data, None, "local", &file, &options).await;
    let message = blocked.unwrap_err().to_string();
    assert!(message.contains("--file-anyway"), "{}", message);
    assert_eq!(filed(&data).await.len(), 1);

    let forced = ProcessOptions {
        file_anyway: true,
        ..options
    };
    let id = commands::cmd_process(&data, None, "local", &file, &forced)
        .await
        .unwrap();
    assert_eq!(id, 2);
    assert_eq!(filed(&data).await.len(), 2);
}

#[tokio::test]
async fn test_cmd_process_uses_transcript_for_binary_artifact() {
    let dir = TempDir::new().unwrap();
    let data = store_path(&dir);
    let scan = write_file(&dir, "scan.jpg", &[0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10, 0x80]);
    let transcript = write_file(&dir, "scan.txt", sample_receipt_text().as_bytes());

    let options = ProcessOptions {
        transcript: Some(transcript),
        category: Some("Office Supplies".to_string()),
        file_anyway: false,
    };
    commands::cmd_process(&data, None, "local", &scan, &options)
        .await
        .unwrap();

    let expenses = filed(&data).await;
    assert_eq!(expenses[0].vendor, "Amazon.com");
    assert_eq!(expenses[0].amount, 42.99);
    assert_eq!(expenses[0].original_filename.as_deref(), Some("scan.jpg"));
}

#[tokio::test]
async fn test_cmd_process_binary_without_transcript_fails() {
    let dir = TempDir::new().unwrap();
    let data = store_path(&dir);
    let scan = write_file(&dir, "scan.jpg", &[0xff, 0xd8, 0xff, 0xe0, 0x80]);

    let options = ProcessOptions::default();
    let result = commands::cmd_process(&data, None, "local", &scan, &options).await;
    let message = result.unwrap_err().to_string();
    assert!(message.contains("Extraction failed"), "{}", message);
    assert!(filed(&data).await.is_empty());
}

#[tokio::test]
async fn test_cmd_process_requires_manual_entry() {
    let dir = TempDir::new().unwrap();
    let data = store_path(&dir);
    let file = write_file(&dir, "smudge.txt", b"~~~ ### ~~~");

    let options = ProcessOptions::default();
    let result = commands::cmd_process(&data, None, "local", &file, &options).await;
    let message = result.unwrap_err().to_string();
    assert!(message.contains("Manual entry required"), "{}", message);
}

// ========== Check Command Tests ==========

#[tokio::test]
async fn test_cmd_check_finds_exact_duplicate() {
    let dir = TempDir::new().unwrap();
    let data = store_path(&dir);
    let file = write_file(&dir, "hardware.txt", hardware_receipt_text().as_bytes());

    let before = commands::cmd_check(&data, None, "local", &file, None).await.unwrap();
    assert!(before.is_empty());

    commands::cmd_process(&data, None, "local", &file, &with_category("Maintenance"))
        .await
        .unwrap();

    let after = commands::cmd_check(&data, None, "local", &file, None).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].score, 100);
    assert!(after[0].is_blocking());

    let other_user = commands::cmd_check(&data, None, "bob", &file, None).await.unwrap();
    assert!(other_user.is_empty());
}

// ========== Duplicate Marking / Stats Command Tests ==========

#[tokio::test]
async fn test_cmd_mark_and_unmark_duplicate() {
    let dir = TempDir::new().unwrap();
    let data = store_path(&dir);
    let file = write_file(&dir, "hardware.txt", hardware_receipt_text().as_bytes());
    let forced = ProcessOptions {
        file_anyway: true,
        ..with_category("Maintenance")
    };
    commands::cmd_process(&data, None, "local", &file, &forced)
        .await
        .unwrap();
    commands::cmd_process(&data, None, "local", &file, &forced)
        .await
        .unwrap();

    let marked = commands::cmd_mark_duplicate(&data, "local", 2, 1).await.unwrap();
    assert_eq!(marked.duplicate_of, Some(1));
    let listed = commands::cmd_list_duplicates(&data, "local").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(filed(&data).await[1].duplicate_of, Some(1));

    assert!(commands::cmd_mark_duplicate(&data, "local", 2, 2).await.is_err());
    assert!(commands::cmd_mark_duplicate(&data, "bob", 2, 1).await.is_err());

    commands::cmd_unmark_duplicate(&data, "local", 2).await.unwrap();
    assert!(commands::cmd_list_duplicates(&data, "local").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cmd_stats() {
    let dir = TempDir::new().unwrap();
    let data = store_path(&dir);
    assert!(commands::cmd_stats(&data, "local", false).await.is_ok());

    let store = JsonFileStore::open(&data).unwrap();
    store
        .persist(new_expense("local", "Staples", "Office Supplies"))
        .await
        .unwrap();
    store
        .persist(new_expense("local", "Uber", "Travel"))
        .await
        .unwrap();
    store
        .persist(new_expense("bob", "Uber", "Travel"))
        .await
        .unwrap();
    store.set_duplicate_of(2, Some(1)).await.unwrap();
    drop(store);

    let report = commands::load_stats(&data, "local").await.unwrap();
    assert_eq!(report.expenses.total_expenses, 2);
    assert_eq!(report.expenses.total_amount, 20.0);
    assert_eq!(report.expenses.by_category.len(), 2);
    assert_eq!(report.duplicates.marked_duplicates, 1);

    assert!(commands::cmd_stats(&data, "local", false).await.is_ok());
    assert!(commands::cmd_stats(&data, "local", true).await.is_ok());
}
