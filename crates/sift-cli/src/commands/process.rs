//! Full pipeline run: upload, extract, review, categorize, file

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use sift_core::{
    DocumentId, ExpenseId, ExpenseStore, NewUpload, OcrEngine, Pipeline, PlainTextOcr,
    ReviewedFields, StaticTranscriptOcr, TaskId, TaskStatus, DEFAULT_CATEGORY,
};

use super::check::print_candidates;
use super::common::{
    file_modified, file_name, load_config, open_store, read_artifact, read_transcript,
};
use super::extract::print_extraction;
use super::suggest::print_suggestions;

#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Transcript to use instead of reading the artifact as text
    pub transcript: Option<PathBuf>,
    /// Category to file under; the top suggestion when unset
    pub category: Option<String>,
    /// Override a blocking duplicate
    pub file_anyway: bool,
}

/// Drive one artifact through every stage and return the filed expense id
pub async fn cmd_process(
    data: &Path,
    config: Option<&Path>,
    user: &str,
    file: &Path,
    options: &ProcessOptions,
) -> Result<ExpenseId> {
    let config = load_config(config)?;
    let store = open_store(data)?;
    let bytes = read_artifact(file)?;

    let ocr: Arc<dyn OcrEngine> = match &options.transcript {
        Some(path) => Arc::new(StaticTranscriptOcr::new(read_transcript(path)?)),
        None => Arc::new(PlainTextOcr),
    };
    let backing: Arc<dyn ExpenseStore> = store.clone();
    let pipeline = Pipeline::new(config, ocr, backing);

    let upload = NewUpload {
        modified_at: file_modified(file),
        ..NewUpload::new(user, &file_name(file), bytes)
    };
    let id = pipeline.upload(upload).context("Upload rejected")?;
    println!("📥 Uploaded {} as {}", file_name(file), id);

    let task = pipeline.request_extraction(id)?;
    wait_for(&pipeline, id, task, "Extraction").await?;

    let report = pipeline.review(id)?;
    print_extraction(&report.extraction);
    if !report.duplicates.is_empty() {
        println!();
        println!("🔍 Possible duplicates");
        print_candidates(&report.duplicates);
    }
    if let Some(blocking) = report.blocking_duplicate() {
        if !options.file_anyway {
            bail!(
                "Blocked by duplicate expense #{} (score {}); rerun with --file-anyway to file it",
                blocking.expense_id,
                blocking.score
            );
        }
    }

    let fields = ReviewedFields::from_extraction(&report.extraction).ok_or_else(|| {
        anyhow!("Manual entry required: the extraction is missing a vendor, amount or date")
    })?;
    let task = pipeline
        .submit_review(id, fields, options.file_anyway)
        .await
        .context("Review rejected")?;
    wait_for(&pipeline, id, task, "Categorization").await?;

    let suggestions = pipeline.suggestions(id)?;
    println!();
    println!("🏷️  Suggestions");
    print_suggestions(&suggestions);

    let category = options
        .category
        .clone()
        .or_else(|| suggestions.first().map(|s| s.category.clone()))
        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
    let expense_id = pipeline
        .confirm_category(id, &category)
        .await
        .context("Failed to file expense")?;

    println!();
    println!(
        "✅ Filed expense #{} under {} ({} expenses in {})",
        expense_id,
        category,
        store.len(),
        store.path().display()
    );
    Ok(expense_id)
}

async fn wait_for(pipeline: &Pipeline, id: DocumentId, task: TaskId, stage: &str) -> Result<()> {
    match pipeline.wait_task(task).await? {
        TaskStatus::Succeeded(_) => Ok(()),
        TaskStatus::Failed(reason) => {
            let failure = pipeline.status(id).ok().and_then(|s| s.failure);
            bail!("{} failed: {}", stage, failure.unwrap_or(reason))
        }
        other => bail!("{} task ended in unexpected state {}", stage, other.as_str()),
    }
}
