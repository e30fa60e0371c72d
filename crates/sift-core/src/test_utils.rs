//! Test utilities for sift-core
//!
//! Fixture transcripts, expense builders, pre-seeded stores and OCR engines
//! that misbehave on purpose.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};

use crate::error::Result;
use crate::models::{Document, Expense, NewExpense, ReviewedFields, Transcript};
use crate::ocr::OcrEngine;
use crate::storage::MemoryStore;

/// The sample receipt used throughout the docs
pub fn sample_receipt_text() -> &'static str {
    "Amazon.com\nInvoice #: 12345\nDate: November 5, 2024\nTotal: $42.99"
}

pub fn sample_receipt() -> Transcript {
    Transcript::from_text(sample_receipt_text())
}

/// A longer hardware-store receipt with line items and a subtotal
pub fn hardware_receipt_text() -> &'static str {
    "Corner Hardware\n\
     412 Main St\n\
     Receipt No. A7731\n\
     03/14/2024\n\
     Hammer 12.99\n\
     Wood Screws 4.50\n\
     Sandpaper 3.25\n\
     Subtotal 20.74\n\
     Tax 1.71\n\
     Total $22.45"
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

/// Reviewed fields dated 2024-11-05
pub fn reviewed(vendor: &str, amount: f64) -> ReviewedFields {
    ReviewedFields {
        vendor: vendor.to_string(),
        amount,
        currency: Some("USD".to_string()),
        date: date(2024, 11, 5),
        invoice_number: None,
        description: String::new(),
        notes: None,
        tags: Vec::new(),
    }
}

/// A filed expense for `user` with sensible defaults
pub fn expense(id: i64, user: &str, vendor: &str, category: &str) -> Expense {
    new_expense(user, vendor, category).into_expense(id, Utc::now())
}

pub fn new_expense(user: &str, vendor: &str, category: &str) -> NewExpense {
    NewExpense {
        user_id: user.to_string(),
        vendor: vendor.to_string(),
        amount: 10.0,
        currency: Some("USD".to_string()),
        date: date(2024, 6, 1),
        category: category.to_string(),
        description: String::new(),
        invoice_number: None,
        notes: None,
        tags: Vec::new(),
        document_id: None,
        original_filename: None,
        content_hash: None,
        perceptual_hash: None,
        confidence: 90,
        raw_text: None,
    }
}

/// A store holding `count` expenses per (vendor, category) for `user`
pub fn seeded_store(user: &str, entries: &[(&str, &str, usize)]) -> Arc<MemoryStore> {
    let mut expenses = Vec::new();
    for (vendor, category, count) in entries {
        for _ in 0..*count {
            let id = expenses.len() as i64 + 1;
            expenses.push(expense(id, user, vendor, category));
        }
    }
    Arc::new(MemoryStore::with_expenses(expenses))
}

/// OCR engine that panics on every document
#[derive(Debug, Default)]
pub struct PanickingOcr;

impl OcrEngine for PanickingOcr {
    fn transcribe(&self, _document: &Document) -> Result<Transcript> {
        panic!("simulated OCR crash")
    }
}

/// OCR engine that blocks for a fixed time before returning plain text
#[derive(Debug)]
pub struct SlowOcr {
    pub delay: Duration,
}

impl OcrEngine for SlowOcr {
    fn transcribe(&self, document: &Document) -> Result<Transcript> {
        std::thread::sleep(self.delay);
        Ok(Transcript::from_text(&String::from_utf8_lossy(&document.bytes)))
    }
}
