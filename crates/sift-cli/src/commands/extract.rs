//! Field extraction command

use std::path::Path;

use anyhow::{Context, Result};
use sift_core::extract::currency::symbol_for;
use sift_core::{ExpenseStore, ExtractedField, ExtractionHints, ExtractionResult, FieldExtractor};

use super::common::{file_modified, load_config, open_store, read_transcript};

pub async fn cmd_extract(
    data: &Path,
    config: Option<&Path>,
    user: &str,
    file: &Path,
    json: bool,
) -> Result<()> {
    let config = load_config(config)?;
    let store = open_store(data)?;
    let transcript = read_transcript(file)?;

    let history = store
        .history_for(user)
        .await
        .context("Failed to load vendor history")?;
    let hints = ExtractionHints {
        known_vendors: history.known_vendors(),
        fallback_timestamp: file_modified(file),
        reference_date: None,
    };

    let extractor = FieldExtractor::with_config(config.extractor);
    let result = extractor.extract_with(&transcript, &hints);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_extraction(&result);
    }
    Ok(())
}

/// Human-readable field table
pub fn print_extraction(result: &ExtractionResult) {
    println!("📄 Extracted fields (confidence {}%)", result.confidence);
    print_field("Vendor", result.vendor.as_ref(), |v| v.clone());
    print_field("Amount", result.amount.as_ref(), |v| match result.currency.as_deref() {
        Some(code) => format_amount(*v, code),
        None => format!("{:.2}", v),
    });
    print_field("Date", result.date.as_ref(), |v| v.to_string());
    print_field("Invoice #", result.invoice_number.as_ref(), |v| v.clone());
    print_field("Description", result.description.as_ref(), |v| {
        super::truncate(v, 60)
    });

    if result.manual_entry_required() {
        println!();
        println!("⚠️  Confidence is low, enter the fields manually");
    }
}

/// "$42.99 USD", or "12.50 CHF" for codes without a symbol
pub fn format_amount(amount: f64, code: &str) -> String {
    let symbol = symbol_for(code);
    if symbol == code {
        format!("{:.2} {}", amount, code)
    } else {
        format!("{}{:.2} {}", symbol, amount, code)
    }
}

fn print_field<T>(label: &str, field: Option<&ExtractedField<T>>, render: impl Fn(&T) -> String) {
    match field {
        Some(f) => println!(
            "   {:<12} {:<40} {:>3}%  {}",
            label,
            render(&f.value),
            f.confidence,
            f.provenance
        ),
        None => println!("   {:<12} {:<40} {:>3}", label, "-", "-"),
    }
}
