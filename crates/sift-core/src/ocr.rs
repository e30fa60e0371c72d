//! OCR collaborator
//!
//! Image-to-text is outside the pipeline. Engines are synchronous and
//! the orchestrator runs them on a blocking thread.

use crate::error::{Error, Result};
use crate::models::{Document, Transcript};

/// Turns a stored artifact into a transcript
pub trait OcrEngine: Send + Sync {
    fn transcribe(&self, document: &Document) -> Result<Transcript>;
}

/// Treats the artifact bytes as UTF-8 text, one token per word
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextOcr;

impl OcrEngine for PlainTextOcr {
    fn transcribe(&self, document: &Document) -> Result<Transcript> {
        let text = std::str::from_utf8(&document.bytes).map_err(|e| {
            Error::Ocr(format!("{} is not readable text: {}", document.filename, e))
        })?;
        Ok(Transcript::from_text(text))
    }
}

/// Returns the same caller-supplied transcript for every document
#[derive(Debug, Clone, Default)]
pub struct StaticTranscriptOcr {
    transcript: Transcript,
}

impl StaticTranscriptOcr {
    pub fn new(transcript: Transcript) -> Self {
        Self { transcript }
    }

    pub fn from_text(text: &str) -> Self {
        Self::new(Transcript::from_text(text))
    }
}

impl OcrEngine for StaticTranscriptOcr {
    fn transcribe(&self, _document: &Document) -> Result<Transcript> {
        Ok(self.transcript.clone())
    }
}

/// Parse a transcript file: JSON when it looks like JSON, otherwise plain text
pub fn parse_transcript(content: &str) -> Result<Transcript> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('{') {
        Ok(serde_json::from_str(trimmed)?)
    } else {
        Ok(Transcript::from_text(content))
    }
}
