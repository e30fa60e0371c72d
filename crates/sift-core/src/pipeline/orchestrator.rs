//! Pipeline orchestrator
//!
//! Owns every in-flight [`Document`] from upload until its expense is
//! filed. State changes go through the pure [`transition`] function; the
//! orchestrator carries out the side effects it returns. Extraction and
//! categorization run on the [`TaskQueue`] and callers poll or await the
//! returned task ids.
//!
//! Once a document reaches COMPLETE or FAILED its artifact bytes and
//! transcript are released. The rest of the record stays queryable for the
//! task retention window and is then evicted; later lookups return
//! [`Error::NotFound`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state::{transition, AuditEntry, Guards, SideEffect, Transition, Trigger};
use super::tasks::{run_with_deadlines, TaskId, TaskQueue, TaskStatus};
use crate::categorize::Categorizer;
use crate::config::PipelineConfig;
use crate::duplicate::{content_hash, DuplicateDetector, SimilarExpense};
use crate::error::{Error, Result};
use crate::extract::{ExtractionHints, FieldExtractor};
use crate::history::{HistoryRegistry, VendorCategoryHistory};
use crate::models::{
    ArtifactRef, CategorySuggestion, Document, DocumentFingerprint, DocumentId, DocumentMetadata,
    DuplicateCandidate, ExpenseFilter, ExpenseId, ExtractionResult, NewExpense, NewUpload,
    PipelineStage, PipelineState, ReviewedFields,
};
use crate::ocr::OcrEngine;
use crate::storage::ExpenseStore;
use crate::validation::validate_reviewed;

/// Merged output of the extract stage, surfaced for review
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionReport {
    pub document_id: DocumentId,
    pub extraction: ExtractionResult,
    pub duplicates: Vec<DuplicateCandidate>,
}

impl ExtractionReport {
    /// Highest-scoring candidate that gates filing
    pub fn blocking_duplicate(&self) -> Option<&DuplicateCandidate> {
        self.duplicates.iter().find(|d| d.is_blocking())
    }

    pub fn manual_entry_required(&self) -> bool {
        self.extraction.manual_entry_required()
    }
}

/// Result carried by a finished task
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TaskOutput {
    Extraction(ExtractionReport),
    Suggestions(Vec<CategorySuggestion>),
}

/// Point-in-time view of a document
#[derive(Debug, Clone, Serialize)]
pub struct DocumentStatus {
    pub document_id: DocumentId,
    pub user_id: String,
    pub filename: String,
    pub state: PipelineState,
    pub failure: Option<String>,
    pub expense_id: Option<ExpenseId>,
    pub audit: Vec<AuditEntry>,
}

/// Progress of the persist behind a category confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Confirmation {
    Idle,
    InFlight,
    Filed(ExpenseId),
}

/// What `confirm_category` does after inspecting the record
enum ConfirmStep {
    Filed(ExpenseId),
    Wait(watch::Receiver<Confirmation>),
    Persist {
        user_id: String,
        fields: ReviewedFields,
        expense: NewExpense,
    },
}

struct DocumentRecord {
    document: Document,
    extraction: Option<ExtractionResult>,
    duplicates: Vec<DuplicateCandidate>,
    reviewed: Option<ReviewedFields>,
    suggestions: Option<Vec<CategorySuggestion>>,
    failure: Option<String>,
    expense_id: Option<ExpenseId>,
    extract_task: Option<TaskId>,
    categorize_task: Option<TaskId>,
    /// Retried confirmations wait on this while the persist is in flight
    confirmation: watch::Sender<Confirmation>,
    cancel: CancellationToken,
    audit: Vec<AuditEntry>,
    /// Set on entering COMPLETE or FAILED
    finished_at: Option<Instant>,
}

impl DocumentRecord {
    fn new(document: Document) -> Self {
        Self {
            document,
            extraction: None,
            duplicates: Vec::new(),
            reviewed: None,
            suggestions: None,
            failure: None,
            expense_id: None,
            extract_task: None,
            categorize_task: None,
            confirmation: watch::channel(Confirmation::Idle).0,
            cancel: CancellationToken::new(),
            audit: Vec::new(),
            finished_at: None,
        }
    }

    /// Persist is in flight; the document can no longer be cancelled
    fn confirming(&self) -> bool {
        *self.confirmation.borrow() == Confirmation::InFlight
    }

    /// Drop the artifact bytes and transcript of a finished document
    fn release_artifact(&mut self) {
        self.document.bytes = Arc::new(Vec::new());
        self.document.transcript = None;
        self.finished_at = Some(Instant::now());
        debug!(document_id = %self.id(), "Released document artifact");
    }

    fn id(&self) -> DocumentId {
        self.document.id
    }

    fn guards(&self) -> Guards {
        Guards {
            blocking_duplicate: self
                .duplicates
                .iter()
                .find(|d| d.is_blocking())
                .map(|d| (d.expense_id, d.score)),
            override_duplicate: false,
            failure_reason: self.failure.clone(),
        }
    }

    /// Apply `trigger` and the bookkeeping effects of the transition.
    ///
    /// Effects that start work are left to the caller.
    fn apply(&mut self, trigger: &Trigger, guards: &Guards) -> Result<Transition> {
        let t = transition(self.document.state, trigger, guards)?;
        if t.noop {
            debug!(
                document_id = %self.id(),
                state = %t.from,
                trigger = trigger.as_str(),
                "Trigger already applied"
            );
            return Ok(t);
        }

        for effect in &t.effects {
            match effect {
                SideEffect::RecordError(reason) => self.failure = Some(reason.clone()),
                SideEffect::CancelWork => self.cancel.cancel(),
                SideEffect::DiscardExtraction => {
                    self.extraction = None;
                    self.duplicates.clear();
                    self.document.transcript = None;
                }
                SideEffect::DispatchEngines
                | SideEffect::SurfaceResults
                | SideEffect::RequestSuggestions
                | SideEffect::PersistAndLearn => {}
            }
        }

        self.document.state = t.next;
        self.audit.push(AuditEntry::new(t.from, t.next, trigger));
        if t.next.is_terminal() {
            self.release_artifact();
        }
        info!(
            document_id = %self.id(),
            from = %t.from,
            to = %t.next,
            trigger = trigger.as_str(),
            "Document state changed"
        );
        Ok(t)
    }

    fn status(&self) -> DocumentStatus {
        DocumentStatus {
            document_id: self.id(),
            user_id: self.document.user_id.clone(),
            filename: self.document.filename.clone(),
            state: self.document.state,
            failure: self.failure.clone(),
            expense_id: self.expense_id,
            audit: self.audit.clone(),
        }
    }

    fn new_expense(&self, fields: &ReviewedFields, category: &str) -> NewExpense {
        let extraction = self.extraction.as_ref();
        let description = if fields.description.trim().is_empty() {
            fields.vendor.trim().to_string()
        } else {
            fields.description.trim().to_string()
        };
        NewExpense {
            user_id: self.document.user_id.clone(),
            vendor: fields.vendor.trim().to_string(),
            amount: fields.amount,
            currency: fields
                .currency
                .clone()
                .or_else(|| extraction.and_then(|e| e.currency.clone())),
            date: fields.date,
            category: category.to_string(),
            description,
            invoice_number: fields.invoice_number.clone(),
            notes: fields.notes.clone(),
            tags: fields.tags.clone(),
            document_id: Some(self.id()),
            original_filename: Some(self.document.filename.clone()),
            content_hash: Some(self.document.artifact.fingerprint.content_hash.clone()),
            perceptual_hash: self.document.artifact.fingerprint.perceptual_hash,
            confidence: extraction.map(|e| e.confidence).unwrap_or(0),
            raw_text: extraction
                .map(|e| e.raw_text.clone())
                .filter(|t| !t.is_empty()),
        }
    }
}

struct Inner {
    config: PipelineConfig,
    extractor: FieldExtractor,
    categorizer: Categorizer,
    detector: DuplicateDetector,
    ocr: Arc<dyn OcrEngine>,
    store: Arc<dyn ExpenseStore>,
    history: Arc<HistoryRegistry>,
    tasks: TaskQueue<TaskOutput>,
    documents: Mutex<HashMap<DocumentId, DocumentRecord>>,
}

/// Document processing pipeline
///
/// Cheap to clone; clones share documents, history and the worker pool.
/// Methods that start background work must be called from within a tokio
/// runtime.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        ocr: Arc<dyn OcrEngine>,
        store: Arc<dyn ExpenseStore>,
    ) -> Self {
        Self::with_history(config, ocr, store, Arc::new(HistoryRegistry::new()))
    }

    /// Share a history registry with other pipelines or callers
    pub fn with_history(
        config: PipelineConfig,
        ocr: Arc<dyn OcrEngine>,
        store: Arc<dyn ExpenseStore>,
        history: Arc<HistoryRegistry>,
    ) -> Self {
        let inner = Inner {
            extractor: FieldExtractor::with_config(config.extractor.clone()),
            categorizer: Categorizer::with_config(config.categorizer.clone()),
            detector: DuplicateDetector::with_config(config.duplicate.clone()),
            tasks: TaskQueue::with_config(&config.tasks),
            config,
            ocr,
            store,
            history,
            documents: Mutex::new(HashMap::new()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn history_registry(&self) -> &Arc<HistoryRegistry> {
        &self.inner.history
    }

    fn documents(&self) -> MutexGuard<'_, HashMap<DocumentId, DocumentRecord>> {
        let mut documents = self.inner.documents.lock().unwrap_or_else(|poisoned| {
            warn!("Recovering poisoned document table lock");
            poisoned.into_inner()
        });
        purge_finished(&mut documents, self.inner.config.tasks.retention());
        documents
    }

    /// Documents still tracked (in flight or within retention)
    pub fn document_count(&self) -> usize {
        self.documents().len()
    }

    fn with_record<R>(
        &self,
        id: DocumentId,
        f: impl FnOnce(&mut DocumentRecord) -> Result<R>,
    ) -> Result<R> {
        let mut documents = self.documents();
        let record = documents
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("document {}", id)))?;
        f(record)
    }

    // =========================================================================
    // Upload
    // =========================================================================

    /// Store the artifact and its identity
    pub fn upload(&self, upload: NewUpload) -> Result<DocumentId> {
        if upload.bytes.is_empty() {
            return Err(Error::InvalidData(format!("{} is empty", upload.filename)));
        }
        if upload.user_id.trim().is_empty() {
            return Err(Error::InvalidData("upload has no user".to_string()));
        }

        let fingerprint = DocumentFingerprint {
            content_hash: content_hash(&upload.bytes),
            perceptual_hash: upload.perceptual_hash,
        };
        let document = Document {
            id: DocumentId::new(),
            user_id: upload.user_id,
            filename: upload.filename,
            uploaded_at: Utc::now(),
            artifact: ArtifactRef {
                fingerprint,
                size_bytes: upload.bytes.len() as u64,
                modified_at: upload.modified_at,
            },
            state: PipelineState::Uploaded,
            transcript: None,
            bytes: Arc::new(upload.bytes),
        };
        let id = document.id;
        info!(
            document_id = %id,
            user = %document.user_id,
            filename = %document.filename,
            size_bytes = document.artifact.size_bytes,
            "Document uploaded"
        );
        self.documents().insert(id, DocumentRecord::new(document));
        Ok(id)
    }

    // =========================================================================
    // Extract
    // =========================================================================

    /// Start OCR and the extract stage. Re-requesting returns the first task.
    pub fn request_extraction(&self, id: DocumentId) -> Result<TaskId> {
        self.with_record(id, |record| {
            let guards = record.guards();
            let t = record.apply(&Trigger::ExtractionRequested, &guards)?;
            if t.noop {
                return record
                    .extract_task
                    .ok_or_else(|| Error::NotFound(format!("extract task for document {}", id)));
            }
            Ok(self.dispatch_extraction(record))
        })
    }

    /// Discard the current result and extract again
    pub fn request_reextract(&self, id: DocumentId) -> Result<TaskId> {
        self.with_record(id, |record| {
            let guards = record.guards();
            record.apply(&Trigger::ReextractRequested, &guards)?;
            Ok(self.dispatch_extraction(record))
        })
    }

    fn dispatch_extraction(&self, record: &mut DocumentRecord) -> TaskId {
        let document = record.document.clone();
        let token = record.cancel.clone();
        let id = document.id;
        let deadlines = &self.inner.config.tasks;
        let (soft, hard) = (deadlines.soft_timeout(), deadlines.hard_timeout());
        let pipeline = self.clone();

        let task_id = self.inner.tasks.submit(PipelineStage::Extract, id, async move {
            let result = run_with_deadlines(
                PipelineStage::Extract,
                id,
                soft,
                hard,
                pipeline.run_extraction(document, token),
            )
            .await;
            if let Err(ref e) = result {
                pipeline.fail_document(id, e);
            }
            result
        });
        record.extract_task = Some(task_id);
        task_id
    }

    async fn run_extraction(
        &self,
        document: Document,
        token: CancellationToken,
    ) -> Result<TaskOutput> {
        let id = document.id;

        let ocr = Arc::clone(&self.inner.ocr);
        let for_ocr = document.clone();
        let transcript = tokio::task::spawn_blocking(move || ocr.transcribe(&for_ocr))
            .await
            .map_err(|e| {
                Error::Ocr(if e.is_panic() {
                    "OCR engine crashed".to_string()
                } else {
                    "OCR task was aborted".to_string()
                })
            })??;
        debug!(document_id = %id, tokens = transcript.tokens.len(), "OCR complete");
        if token.is_cancelled() {
            return Err(Error::Cancelled(format!("document {} after OCR", id)));
        }

        let history = self.history(&document.user_id).await?;
        let hints = ExtractionHints {
            known_vendors: history.known_vendors(),
            fallback_timestamp: document.artifact.modified_at,
            reference_date: None,
        };

        // Extractor (blocking thread) and the duplicate lookup run together
        let extractor = self.inner.extractor.clone();
        let for_extractor = transcript.clone();
        let extraction = async move {
            tokio::task::spawn_blocking(move || extractor.extract_with(&for_extractor, &hints))
                .await
                .map_err(|e| {
                    Error::Extraction(if e.is_panic() {
                        "extractor crashed".to_string()
                    } else {
                        "extractor task was aborted".to_string()
                    })
                })
        };
        let filter = ExpenseFilter::for_user(&document.user_id);
        let existing = self.inner.store.query(&filter);
        let (extraction, existing) = tokio::try_join!(extraction, existing)?;

        let incoming = DocumentMetadata::from(&extraction);
        let duplicates =
            self.inner
                .detector
                .check(&document.artifact.fingerprint, &incoming, &existing);
        if token.is_cancelled() {
            return Err(Error::Cancelled(format!("document {} after extraction", id)));
        }

        if extraction.manual_entry_required() {
            warn!(document_id = %id, "Nothing usable extracted, manual entry required");
        }
        info!(
            document_id = %id,
            confidence = extraction.confidence,
            duplicates = duplicates.len(),
            "Extraction complete"
        );

        let report = ExtractionReport {
            document_id: id,
            extraction,
            duplicates,
        };
        self.with_record(id, |record| {
            let guards = record.guards();
            let t = record.apply(&Trigger::EnginesReturned, &guards)?;
            if !t.noop {
                record.document.transcript = Some(transcript);
                record.extraction = Some(report.extraction.clone());
                record.duplicates = report.duplicates.clone();
            }
            Ok(())
        })?;

        Ok(TaskOutput::Extraction(report))
    }

    /// Move a document to FAILED after its task errored
    fn fail_document(&self, id: DocumentId, err: &Error) {
        let result = self.with_record(id, |record| {
            if record.document.state.is_terminal() || record.confirming() {
                debug!(document_id = %id, error = %err, "Ignoring late task failure");
                return Ok(());
            }
            let reason = err.to_string();
            let trigger = match err {
                Error::Cancelled(_) => return Ok(()),
                Error::TaskTimeout { .. } => Trigger::Fail { reason },
                _ if record.document.state == PipelineState::Extracting => {
                    Trigger::ExtractorFailed { reason }
                }
                _ => Trigger::Fail { reason },
            };
            error!(
                document_id = %id,
                state = %record.document.state,
                error = %err,
                "Document failed"
            );
            let guards = record.guards();
            record.apply(&trigger, &guards).map(|_| ())
        });
        if let Err(e) = result {
            warn!(document_id = %id, error = %e, "Could not record document failure");
        }
    }

    // =========================================================================
    // Review
    // =========================================================================

    /// Extraction result and duplicate candidates awaiting review
    pub fn review(&self, id: DocumentId) -> Result<ExtractionReport> {
        self.with_record(id, |record| {
            let extraction = record
                .extraction
                .clone()
                .ok_or_else(|| Error::NotFound(format!("extraction result for document {}", id)))?;
            Ok(ExtractionReport {
                document_id: id,
                extraction,
                duplicates: record.duplicates.clone(),
            })
        })
    }

    /// Related expenses for context during review
    pub async fn related_expenses(
        &self,
        id: DocumentId,
        limit: usize,
    ) -> Result<Vec<SimilarExpense>> {
        let (user_id, incoming) = self.with_record(id, |record| {
            let incoming = match (&record.reviewed, &record.extraction) {
                (Some(fields), _) => DocumentMetadata::from(fields),
                (None, Some(extraction)) => DocumentMetadata::from(extraction),
                (None, None) => DocumentMetadata::default(),
            };
            Ok((record.document.user_id.clone(), incoming))
        })?;
        let filter = ExpenseFilter::for_user(&user_id);
        let existing = self.inner.store.query(&filter).await?;
        Ok(self
            .inner
            .detector
            .similar_expenses(&incoming, None, &existing, limit))
    }

    /// Submit corrected fields and start categorization.
    ///
    /// Invalid fields and un-overridden blocking duplicates are rejected and
    /// the document stays in review.
    pub async fn submit_review(
        &self,
        id: DocumentId,
        fields: ReviewedFields,
        override_duplicate: bool,
    ) -> Result<TaskId> {
        let (state, user_id, fingerprint) = self.with_record(id, |record| {
            Ok((
                record.document.state,
                record.document.user_id.clone(),
                record.document.artifact.fingerprint.clone(),
            ))
        })?;

        let mut rechecked = None;
        if state == PipelineState::AwaitingReview {
            validate_reviewed(
                &fields,
                Utc::now().date_naive(),
                &self.inner.config.validation,
            )?;
            let filter = ExpenseFilter::for_user(&user_id);
            let existing = self.inner.store.query(&filter).await?;
            rechecked = Some(self.inner.detector.check(
                &fingerprint,
                &DocumentMetadata::from(&fields),
                &existing,
            ));
        }

        self.with_record(id, |record| {
            if record.document.state == PipelineState::AwaitingReview {
                if let Some(duplicates) = rechecked {
                    record.duplicates = duplicates;
                }
            }
            let mut guards = record.guards();
            guards.override_duplicate = override_duplicate;
            let t = record.apply(&Trigger::SubmitReview, &guards)?;
            if t.noop {
                return record.categorize_task.ok_or_else(|| {
                    Error::NotFound(format!("categorize task for document {}", id))
                });
            }
            if override_duplicate && guards.blocking_duplicate.is_some() {
                info!(document_id = %id, "Filing despite likely duplicate");
            }
            record.reviewed = Some(fields);
            record.suggestions = None;
            Ok(self.dispatch_suggestions(record))
        })
    }

    // =========================================================================
    // Categorize
    // =========================================================================

    fn dispatch_suggestions(&self, record: &mut DocumentRecord) -> TaskId {
        let id = record.id();
        let user_id = record.document.user_id.clone();
        let fields = record.reviewed.clone();
        let token = record.cancel.clone();
        let deadlines = &self.inner.config.tasks;
        let (soft, hard) = (deadlines.soft_timeout(), deadlines.hard_timeout());
        let pipeline = self.clone();

        let task_id = self.inner.tasks.submit(PipelineStage::Categorize, id, async move {
            let result = run_with_deadlines(
                PipelineStage::Categorize,
                id,
                soft,
                hard,
                pipeline.run_categorization(id, user_id, fields, token),
            )
            .await;
            if let Err(ref e) = result {
                pipeline.fail_document(id, e);
            }
            result
        });
        record.categorize_task = Some(task_id);
        task_id
    }

    async fn run_categorization(
        &self,
        id: DocumentId,
        user_id: String,
        fields: Option<ReviewedFields>,
        token: CancellationToken,
    ) -> Result<TaskOutput> {
        let fields = fields
            .ok_or_else(|| Error::InvalidData(format!("document {} has no reviewed fields", id)))?;
        let history = self.history(&user_id).await?;
        let suggestions =
            self.inner
                .categorizer
                .suggest(&history, &fields.vendor, &fields.description);

        if token.is_cancelled() {
            return Err(Error::Cancelled(format!("document {} before suggestions", id)));
        }
        self.with_record(id, |record| {
            if record.document.state == PipelineState::Categorizing {
                record.suggestions = Some(suggestions.clone());
            }
            Ok(())
        })?;
        info!(
            document_id = %id,
            top = suggestions.first().map(|s| s.category.as_str()).unwrap_or(""),
            "Category suggestions ready"
        );
        Ok(TaskOutput::Suggestions(suggestions))
    }

    /// Ranked suggestions once the categorize task has finished
    pub fn suggestions(&self, id: DocumentId) -> Result<Vec<CategorySuggestion>> {
        self.with_record(id, |record| {
            record
                .suggestions
                .clone()
                .ok_or_else(|| Error::NotFound(format!("suggestions for document {}", id)))
        })
    }

    // =========================================================================
    // Complete
    // =========================================================================

    /// File the expense under `category` and learn the choice.
    ///
    /// The expense is persisted before history is updated. Confirming an
    /// already-complete document returns the existing expense id, and a
    /// confirmation sent while another is persisting waits for it and
    /// returns the same id.
    pub async fn confirm_category(&self, id: DocumentId, category: &str) -> Result<ExpenseId> {
        let category = category.trim();
        if category.is_empty() {
            return Err(Error::Validation("category is empty".to_string()));
        }

        let (user_id, fields, expense) = loop {
            match self.prepare_confirmation(id, category)? {
                ConfirmStep::Filed(expense_id) => return Ok(expense_id),
                ConfirmStep::Persist {
                    user_id,
                    fields,
                    expense,
                } => break (user_id, fields, expense),
                ConfirmStep::Wait(mut rx) => {
                    debug!(document_id = %id, "Waiting for in-flight confirmation");
                    let outcome = rx
                        .wait_for(|c| *c != Confirmation::InFlight)
                        .await
                        .map(|c| *c)
                        .map_err(|_| Error::NotFound(format!("document {}", id)))?;
                    if let Confirmation::Filed(expense_id) = outcome {
                        return Ok(expense_id);
                    }
                    // The other attempt failed; take over
                }
            }
        };

        // Seed history before persisting so the new expense is learned once
        let filed = match self.history(&user_id).await {
            Ok(_) => self.inner.store.persist(expense).await,
            Err(e) => Err(e),
        };
        let expense_id = match filed {
            Ok(expense_id) => expense_id,
            Err(e) => {
                error!(document_id = %id, error = %e, "Failed to persist expense");
                let cleared = self.with_record(id, |record| {
                    record.confirmation.send_replace(Confirmation::Idle);
                    Ok(())
                });
                if let Err(clear_err) = cleared {
                    warn!(
                        document_id = %id,
                        error = %clear_err,
                        "Could not clear confirmation state"
                    );
                }
                return Err(e);
            }
        };

        self.inner.categorizer.learn(
            &self.inner.history,
            &user_id,
            &fields.vendor,
            &fields.description,
            category,
            Utc::now(),
        );

        self.with_record(id, |record| {
            record.expense_id = Some(expense_id);
            record.confirmation.send_replace(Confirmation::Filed(expense_id));
            let guards = record.guards();
            record.apply(&Trigger::CategoryConfirmed, &guards)
        })?;
        info!(document_id = %id, expense_id, category, "Expense filed");
        Ok(expense_id)
    }

    fn prepare_confirmation(&self, id: DocumentId, category: &str) -> Result<ConfirmStep> {
        self.with_record(id, |record| {
            if record.confirming() {
                return Ok(ConfirmStep::Wait(record.confirmation.subscribe()));
            }
            let guards = record.guards();
            let t = transition(record.document.state, &Trigger::CategoryConfirmed, &guards)?;
            if t.noop {
                return record
                    .expense_id
                    .map(ConfirmStep::Filed)
                    .ok_or_else(|| Error::NotFound(format!("expense for document {}", id)));
            }
            let fields = record.reviewed.clone().ok_or_else(|| {
                Error::InvalidData(format!("document {} has no reviewed fields", id))
            })?;
            record.confirmation.send_replace(Confirmation::InFlight);
            Ok(ConfirmStep::Persist {
                user_id: record.document.user_id.clone(),
                expense: record.new_expense(&fields, category),
                fields,
            })
        })
    }

    // =========================================================================
    // Cancel & status
    // =========================================================================

    /// Cancel a document that is extracting or categorizing
    pub fn cancel(&self, id: DocumentId) -> Result<()> {
        self.with_record(id, |record| {
            if record.confirming() {
                return Err(Error::InvalidTransition {
                    state: record.document.state.as_str(),
                    trigger: Trigger::Cancel.as_str(),
                });
            }
            let guards = record.guards();
            let t = record.apply(&Trigger::Cancel, &guards)?;
            if !t.noop {
                warn!(document_id = %id, from = %t.from, "Document cancelled");
            }
            Ok(())
        })
    }

    pub fn state(&self, id: DocumentId) -> Result<PipelineState> {
        self.with_record(id, |record| Ok(record.document.state))
    }

    pub fn status(&self, id: DocumentId) -> Result<DocumentStatus> {
        self.with_record(id, |record| Ok(record.status()))
    }

    pub fn document(&self, id: DocumentId) -> Result<Document> {
        self.with_record(id, |record| Ok(record.document.clone()))
    }

    pub fn task_status(&self, task_id: TaskId) -> Result<TaskStatus<TaskOutput>> {
        self.inner.tasks.status(task_id)
    }

    pub async fn wait_task(&self, task_id: TaskId) -> Result<TaskStatus<TaskOutput>> {
        self.inner.tasks.wait(task_id).await
    }

    /// A user's history, loaded from storage the first time it is needed
    pub async fn history(&self, user_id: &str) -> Result<Arc<VendorCategoryHistory>> {
        if let Some(snapshot) = self.inner.history.snapshot(user_id) {
            return Ok(snapshot);
        }
        let loaded = self.inner.store.history_for(user_id).await?;
        debug!(user = user_id, vendors = loaded.len(), "Seeded vendor history from storage");
        Ok(self.inner.history.seed(user_id, loaded))
    }
}

/// Evict finished records older than `retention`
fn purge_finished(documents: &mut HashMap<DocumentId, DocumentRecord>, retention: Duration) {
    documents.retain(|id, record| match record.finished_at {
        Some(finished) if finished.elapsed() >= retention => {
            debug!(document_id = %id, "Evicted finished document");
            false
        }
        _ => true,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::models::Expense;
    use crate::ocr::{PlainTextOcr, StaticTranscriptOcr};
    use crate::storage::MemoryStore;
    use crate::test_utils::{reviewed, sample_receipt_text};

    fn pipeline_with(ocr: Arc<dyn OcrEngine>) -> (Pipeline, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new(PipelineConfig::default(), ocr, store.clone());
        (pipeline, store)
    }

    /// Memory store whose persist takes a while and can be told to fail
    #[derive(Default)]
    struct SlowStore {
        inner: MemoryStore,
        fail_next: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ExpenseStore for SlowStore {
        async fn persist(&self, expense: NewExpense) -> Result<ExpenseId> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::Storage("disk full".to_string()));
            }
            self.inner.persist(expense).await
        }

        async fn query(&self, filter: &ExpenseFilter) -> Result<Vec<Expense>> {
            self.inner.query(filter).await
        }

        async fn history_for(&self, user_id: &str) -> Result<VendorCategoryHistory> {
            self.inner.history_for(user_id).await
        }

        async fn set_duplicate_of(
            &self,
            expense_id: ExpenseId,
            original: Option<ExpenseId>,
        ) -> Result<Expense> {
            self.inner.set_duplicate_of(expense_id, original).await
        }
    }

    async fn categorized(pipeline: &Pipeline) -> DocumentId {
        let id = extracted(pipeline, sample_receipt_text()).await;
        let task = pipeline
            .submit_review(id, reviewed("Amazon.com", 42.99), false)
            .await
            .unwrap();
        pipeline.wait_task(task).await.unwrap();
        id
    }

    async fn extracted(pipeline: &Pipeline, text: &str) -> DocumentId {
        let id = pipeline
            .upload(NewUpload::new("alice", "receipt.txt", text.as_bytes().to_vec()))
            .unwrap();
        let task = pipeline.request_extraction(id).unwrap();
        assert!(matches!(
            pipeline.wait_task(task).await.unwrap(),
            TaskStatus::Succeeded(TaskOutput::Extraction(_))
        ));
        id
    }

    #[tokio::test]
    async fn test_upload_rejects_empty() {
        let (pipeline, _) = pipeline_with(Arc::new(PlainTextOcr));
        assert!(pipeline
            .upload(NewUpload::new("alice", "empty.pdf", Vec::new()))
            .is_err());
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let (pipeline, store) = pipeline_with(Arc::new(PlainTextOcr));
        let id = extracted(&pipeline, sample_receipt_text()).await;
        assert_eq!(pipeline.state(id).unwrap(), PipelineState::AwaitingReview);

        let report = pipeline.review(id).unwrap();
        let fields = ReviewedFields::from_extraction(&report.extraction).unwrap();
        let task = pipeline.submit_review(id, fields, false).await.unwrap();
        pipeline.wait_task(task).await.unwrap();
        assert_eq!(pipeline.state(id).unwrap(), PipelineState::Categorizing);
        assert!(!pipeline.suggestions(id).unwrap().is_empty());

        let expense_id = pipeline.confirm_category(id, "Office Supplies").await.unwrap();
        assert_eq!(pipeline.state(id).unwrap(), PipelineState::Complete);
        assert_eq!(store.len(), 1);
        assert_eq!(
            pipeline.history("alice").await.unwrap().count("Amazon.com", "Office Supplies"),
            1
        );

        // Confirming again is a no-op returning the same expense
        assert_eq!(
            pipeline.confirm_category(id, "Travel").await.unwrap(),
            expense_id
        );
        assert_eq!(store.len(), 1);

        let audit = pipeline.status(id).unwrap().audit;
        let path: Vec<PipelineState> = audit.iter().map(|a| a.to).collect();
        assert_eq!(
            path,
            vec![
                PipelineState::Extracting,
                PipelineState::AwaitingReview,
                PipelineState::Categorizing,
                PipelineState::Complete,
            ]
        );
    }

    #[tokio::test]
    async fn test_request_extraction_twice_returns_same_task() {
        let (pipeline, _) = pipeline_with(Arc::new(PlainTextOcr));
        let id = pipeline
            .upload(NewUpload::new("alice", "r.txt", b"Acme\nTotal $5.00".to_vec()))
            .unwrap();
        let first = pipeline.request_extraction(id).unwrap();
        let second = pipeline.request_extraction(id).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_validation_keeps_document_in_review() {
        let (pipeline, _) = pipeline_with(Arc::new(PlainTextOcr));
        let id = extracted(&pipeline, sample_receipt_text()).await;

        let mut fields = reviewed("Amazon.com", 42.99);
        fields.amount = -3.0;
        let err = pipeline.submit_review(id, fields, false).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(pipeline.state(id).unwrap(), PipelineState::AwaitingReview);
    }

    #[tokio::test]
    async fn test_reextract_from_review() {
        let (pipeline, _) = pipeline_with(Arc::new(PlainTextOcr));
        let id = extracted(&pipeline, sample_receipt_text()).await;

        let task = pipeline.request_reextract(id).unwrap();
        pipeline.wait_task(task).await.unwrap();
        assert_eq!(pipeline.state(id).unwrap(), PipelineState::AwaitingReview);
        assert!(pipeline.review(id).is_ok());
    }

    #[tokio::test]
    async fn test_ocr_failure_fails_document() {
        let (pipeline, _) = pipeline_with(Arc::new(PlainTextOcr));
        let id = pipeline
            .upload(NewUpload::new("alice", "scan.png", vec![0xff, 0xd8, 0xff]))
            .unwrap();
        let task = pipeline.request_extraction(id).unwrap();
        assert!(matches!(
            pipeline.wait_task(task).await.unwrap(),
            TaskStatus::Failed(_)
        ));

        let status = pipeline.status(id).unwrap();
        assert_eq!(status.state, PipelineState::Failed);
        assert!(status.failure.unwrap().contains("scan.png"));

        let err = pipeline.request_reextract(id).unwrap_err();
        assert!(matches!(err, Error::DocumentFailed(_)));
    }

    #[tokio::test]
    async fn test_cancel_only_while_working() {
        let (pipeline, _) = pipeline_with(Arc::new(StaticTranscriptOcr::from_text("Acme")));
        let id = pipeline
            .upload(NewUpload::new("alice", "r.txt", b"x".to_vec()))
            .unwrap();
        assert!(matches!(
            pipeline.cancel(id),
            Err(Error::InvalidTransition { .. })
        ));

        pipeline.request_extraction(id).unwrap();
        pipeline.cancel(id).unwrap();
        assert_eq!(pipeline.state(id).unwrap(), PipelineState::Failed);
        // Repeated cancel on a terminal document is a no-op
        pipeline.cancel(id).unwrap();
    }

    #[tokio::test]
    async fn test_unknown_document() {
        let (pipeline, _) = pipeline_with(Arc::new(PlainTextOcr));
        assert!(matches!(
            pipeline.state(DocumentId::new()),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retried_confirmation_waits_for_in_flight_persist() {
        let store = Arc::new(SlowStore::default());
        let pipeline = Pipeline::new(
            PipelineConfig::default(),
            Arc::new(PlainTextOcr),
            store.clone(),
        );
        let id = categorized(&pipeline).await;

        let first = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.confirm_category(id, "Office Supplies").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        // An in-flight confirmation cannot be cancelled
        assert!(pipeline.cancel(id).is_err());
        let retry = pipeline.confirm_category(id, "Office Supplies").await.unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(first, retry);
        assert_eq!(store.inner.len(), 1);
        assert_eq!(pipeline.state(id).unwrap(), PipelineState::Complete);
    }

    #[tokio::test]
    async fn test_retry_takes_over_after_failed_persist() {
        let store = Arc::new(SlowStore::default());
        store.fail_next.store(true, std::sync::atomic::Ordering::SeqCst);
        let pipeline = Pipeline::new(
            PipelineConfig::default(),
            Arc::new(PlainTextOcr),
            store.clone(),
        );
        let id = categorized(&pipeline).await;

        let first = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.confirm_category(id, "Office Supplies").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let retry = pipeline.confirm_category(id, "Office Supplies").await.unwrap();

        assert!(matches!(first.await.unwrap(), Err(Error::Storage(_))));
        assert_eq!(store.inner.len(), 1);
        assert_eq!(pipeline.status(id).unwrap().expense_id, Some(retry));
    }

    #[tokio::test]
    async fn test_persist_failure_leaves_document_confirmable() {
        let store = Arc::new(SlowStore::default());
        store.fail_next.store(true, std::sync::atomic::Ordering::SeqCst);
        let pipeline = Pipeline::new(
            PipelineConfig::default(),
            Arc::new(PlainTextOcr),
            store.clone(),
        );
        let id = categorized(&pipeline).await;

        assert!(pipeline.confirm_category(id, "Office Supplies").await.is_err());
        assert_eq!(pipeline.state(id).unwrap(), PipelineState::Categorizing);
        // No longer confirming, so cancel is allowed again
        pipeline.cancel(id).unwrap();
        assert_eq!(pipeline.state(id).unwrap(), PipelineState::Failed);
    }

    #[tokio::test]
    async fn test_finished_document_releases_artifact() {
        let (pipeline, _) = pipeline_with(Arc::new(PlainTextOcr));
        let id = categorized(&pipeline).await;
        assert!(!pipeline.document(id).unwrap().bytes.is_empty());
        assert!(pipeline.document(id).unwrap().transcript.is_some());

        pipeline.confirm_category(id, "Office Supplies").await.unwrap();
        let document = pipeline.document(id).unwrap();
        assert_eq!(document.state, PipelineState::Complete);
        assert!(document.bytes.is_empty());
        assert!(document.transcript.is_none());
        assert_eq!(document.artifact.size_bytes, sample_receipt_text().len() as u64);
        // Review data stays available until eviction
        assert!(pipeline.review(id).is_ok());
    }

    #[tokio::test]
    async fn test_finished_documents_evicted_after_retention() {
        let mut config = PipelineConfig::default();
        config.tasks.retention_secs = 1;
        let pipeline = Pipeline::new(
            config,
            Arc::new(PlainTextOcr),
            Arc::new(MemoryStore::new()),
        );

        let failed = pipeline
            .upload(NewUpload::new("alice", "scan.png", vec![0xff, 0xd8, 0xff]))
            .unwrap();
        let task = pipeline.request_extraction(failed).unwrap();
        pipeline.wait_task(task).await.unwrap();
        assert_eq!(pipeline.state(failed).unwrap(), PipelineState::Failed);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let pending = pipeline
            .upload(NewUpload::new("alice", "r.txt", b"Acme\nTotal $5.00".to_vec()))
            .unwrap();
        assert!(matches!(pipeline.status(failed), Err(Error::NotFound(_))));
        assert_eq!(pipeline.state(pending).unwrap(), PipelineState::Uploaded);
        assert_eq!(pipeline.document_count(), 1);
    }
}
