//! Document lifecycle state machine
//!
//! [`transition`] is pure: it maps the current state, a trigger and the
//! guard values to the next state plus the side effects the orchestrator
//! must carry out. It never touches the task queue or storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{ExpenseId, PipelineState};

/// Events that drive a document through the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum Trigger {
    ExtractionRequested,
    /// Extractor and duplicate detector both returned
    EnginesReturned,
    ExtractorFailed { reason: String },
    SubmitReview,
    ReextractRequested,
    CategoryConfirmed,
    Cancel,
    /// Unrecoverable error or hard timeout
    Fail { reason: String },
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExtractionRequested => "extraction_requested",
            Self::EnginesReturned => "engines_returned",
            Self::ExtractorFailed { .. } => "extractor_failed",
            Self::SubmitReview => "submit_review",
            Self::ReextractRequested => "reextract_requested",
            Self::CategoryConfirmed => "category_confirmed",
            Self::Cancel => "cancel",
            Self::Fail { .. } => "fail",
        }
    }

    /// The state a forward trigger moves a document out of
    fn leaves(&self) -> Option<PipelineState> {
        match self {
            Self::ExtractionRequested => Some(PipelineState::Uploaded),
            Self::EnginesReturned | Self::ExtractorFailed { .. } => Some(PipelineState::Extracting),
            Self::SubmitReview => Some(PipelineState::AwaitingReview),
            Self::CategoryConfirmed => Some(PipelineState::Categorizing),
            Self::ReextractRequested | Self::Cancel | Self::Fail { .. } => None,
        }
    }
}

/// Values the transition function consults but does not compute
#[derive(Debug, Clone, Default)]
pub struct Guards {
    /// Highest-scoring blocking duplicate, if any
    pub blocking_duplicate: Option<(ExpenseId, u8)>,
    /// The user chose "file anyway"
    pub override_duplicate: bool,
    /// Reason recorded when the document failed
    pub failure_reason: Option<String>,
}

/// Work the orchestrator performs after a transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    /// Run OCR, then the extractor and duplicate detector concurrently
    DispatchEngines,
    /// Drop the previous extraction result and duplicate candidates
    DiscardExtraction,
    /// Merge engine output and hand it to the caller for review
    SurfaceResults,
    /// Run the categorizer on the reviewed fields
    RequestSuggestions,
    /// Hand the expense to storage, then learn the chosen category
    PersistAndLearn,
    /// Signal running work to stop
    CancelWork,
    RecordError(String),
}

/// Outcome of applying a trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: PipelineState,
    pub next: PipelineState,
    pub effects: Vec<SideEffect>,
    /// The trigger had already been applied; nothing changes
    pub noop: bool,
}

impl Transition {
    fn to(from: PipelineState, next: PipelineState, effects: Vec<SideEffect>) -> Self {
        Self {
            from,
            next,
            effects,
            noop: false,
        }
    }

    fn noop(state: PipelineState) -> Self {
        Self {
            from: state,
            next: state,
            effects: Vec::new(),
            noop: true,
        }
    }
}

/// Position along the forward path; FAILED sits outside it
fn rank(state: PipelineState) -> Option<u8> {
    match state {
        PipelineState::Uploaded => Some(0),
        PipelineState::Extracting => Some(1),
        PipelineState::AwaitingReview => Some(2),
        PipelineState::Categorizing => Some(3),
        PipelineState::Complete => Some(4),
        PipelineState::Failed => None,
    }
}

fn reject(state: PipelineState, trigger: &Trigger) -> Error {
    Error::InvalidTransition {
        state: state.as_str(),
        trigger: trigger.as_str(),
    }
}

/// Apply `trigger` to a document in `state`
pub fn transition(state: PipelineState, trigger: &Trigger, guards: &Guards) -> Result<Transition> {
    use PipelineState::*;

    match (state, trigger) {
        // Late failures and repeated cancels against a finished document
        (
            Complete | Failed,
            Trigger::Cancel | Trigger::Fail { .. } | Trigger::ExtractorFailed { .. },
        ) => Ok(Transition::noop(state)),
        (Failed, _) => Err(Error::DocumentFailed(
            guards
                .failure_reason
                .clone()
                .unwrap_or_else(|| "document failed".to_string()),
        )),

        (Uploaded, Trigger::ExtractionRequested) => Ok(Transition::to(
            state,
            Extracting,
            vec![SideEffect::DispatchEngines],
        )),
        (Extracting, Trigger::EnginesReturned) => Ok(Transition::to(
            state,
            AwaitingReview,
            vec![SideEffect::SurfaceResults],
        )),
        (Extracting, Trigger::ExtractorFailed { reason }) => Ok(Transition::to(
            state,
            Failed,
            vec![SideEffect::RecordError(reason.clone())],
        )),
        (AwaitingReview, Trigger::SubmitReview) => {
            if let Some((expense_id, score)) = guards.blocking_duplicate {
                if !guards.override_duplicate {
                    return Err(Error::DuplicateBlock { expense_id, score });
                }
            }
            Ok(Transition::to(
                state,
                Categorizing,
                vec![SideEffect::RequestSuggestions],
            ))
        }
        (AwaitingReview, Trigger::ReextractRequested) => Ok(Transition::to(
            state,
            Extracting,
            vec![SideEffect::DiscardExtraction, SideEffect::DispatchEngines],
        )),
        (Categorizing, Trigger::CategoryConfirmed) => Ok(Transition::to(
            state,
            Complete,
            vec![SideEffect::PersistAndLearn],
        )),
        (Extracting | Categorizing, Trigger::Cancel) => Ok(Transition::to(
            state,
            Failed,
            vec![
                SideEffect::CancelWork,
                SideEffect::RecordError("cancelled".to_string()),
            ],
        )),
        (_, Trigger::Fail { reason }) => Ok(Transition::to(
            state,
            Failed,
            vec![
                SideEffect::CancelWork,
                SideEffect::RecordError(reason.clone()),
            ],
        )),

        _ => match (trigger.leaves().and_then(rank), rank(state)) {
            (Some(left), Some(current)) if current > left => Ok(Transition::noop(state)),
            _ => Err(reject(state, trigger)),
        },
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub from: PipelineState,
    pub to: PipelineState,
    pub trigger: String,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(from: PipelineState, to: PipelineState, trigger: &Trigger) -> Self {
        Self {
            from,
            to,
            trigger: trigger.as_str().to_string(),
            at: Utc::now(),
        }
    }
}
