//! Metadata extraction wrappers.
//!
//! The actual extraction back ends (layout parsing, OCR, fallback model)
//! live outside this crate. [`CommandExtractor`] runs them as configured
//! external commands that print a FieldSet as JSON on stdout, and adds a
//! built-in identifier scan over the PDF text layer. A source that fails
//! is skipped with a warning; only zero usable field sets is an error.

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use crate::models::{ExtractionSource, FieldKey, FieldSet};

/// The extraction capability consumed by the orchestrator.
#[async_trait]
pub trait MetadataExtractionService: Send + Sync {
    /// Extract one field set per source. Returns an error only when no
    /// source produced anything usable.
    async fn extract(&self, document: &Path) -> Result<Vec<FieldSet>, ExtractError>;
}

/// Runs the configured extraction commands plus the built-in identifier
/// scan.
pub struct CommandExtractor {
    config: ExtractionConfig,
}

impl CommandExtractor {
    pub fn new(config: ExtractionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MetadataExtractionService for CommandExtractor {
    async fn extract(&self, document: &Path) -> Result<Vec<FieldSet>, ExtractError> {
        let mut sets = Vec::new();

        for cmd in &self.config.commands {
            match run_extraction_command(&cmd.command, document, cmd.timeout_secs).await {
                Ok(mut fs) => {
                    fs.source = match cmd.source.as_str() {
                        "structured" => ExtractionSource::Structured,
                        _ => ExtractionSource::FallbackModel,
                    };
                    sets.push(fs);
                }
                Err(e) => {
                    warn!(source = %cmd.source, error = %e, "extraction source failed");
                }
            }
        }

        if self.config.identifier_scan {
            match identifier_scan(document).await {
                Ok(Some(fs)) => sets.push(fs),
                Ok(None) => debug!("identifier scan found nothing"),
                Err(e) => warn!(error = %e, "identifier scan failed"),
            }
        }

        if sets.is_empty() {
            return Err(ExtractError::NoUsableFields);
        }
        Ok(sets)
    }
}

/// Spawn one extraction command with the document path appended, enforce
/// the timeout, and parse its stdout as a FieldSet.
async fn run_extraction_command(
    command: &[String],
    document: &Path,
    timeout_secs: u64,
) -> Result<FieldSet, ExtractError> {
    let program = command
        .first()
        .ok_or_else(|| ExtractError::CommandFailed {
            command: String::new(),
            reason: "empty command line".to_string(),
        })?;

    let mut cmd = Command::new(program);
    cmd.args(&command[1..])
        .arg(document)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let label = command.join(" ");

    let output = tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output())
        .await
        .map_err(|_| ExtractError::CommandFailed {
            command: label.clone(),
            reason: format!("timed out after {}s", timeout_secs),
        })?
        .map_err(|e| ExtractError::CommandFailed {
            command: label.clone(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ExtractError::CommandFailed {
            command: label,
            reason: format!("exit {}: {}", output.status, stderr.trim()),
        });
    }

    serde_json::from_slice(&output.stdout).map_err(|e| ExtractError::CommandFailed {
        command: label,
        reason: format!("invalid FieldSet JSON: {}", e),
    })
}

/// Scan the embedded PDF text layer for identifiers.
///
/// Only applies to PDFs; other formats (image scans) have no text layer
/// and return `None`. Runs on a blocking thread — pdf parsing is CPU
/// bound.
pub async fn identifier_scan(document: &Path) -> Result<Option<FieldSet>, ExtractError> {
    let is_pdf = document
        .extension()
        .map(|e| e.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false);
    if !is_pdf {
        return Ok(None);
    }

    let path: PathBuf = document.to_path_buf();
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ExtractError::Unreadable {
            path: path.clone(),
            source: e,
        })?;

    let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
        .await
        .map_err(|e| ExtractError::CommandFailed {
            command: "identifier-scan".to_string(),
            reason: e.to_string(),
        })?
        .map_err(|e| ExtractError::CommandFailed {
            command: "identifier-scan".to_string(),
            reason: e.to_string(),
        })?;

    Ok(scan_text_for_identifiers(&text))
}

fn doi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\b10\.\d{4,9}/[^\s"'<>]+"#).unwrap())
}

fn arxiv_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\barXiv:\s*(\d{4}\.\d{4,5}(v\d+)?)").unwrap())
}

fn isbn_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bISBN(?:-1[03])?:?\s*([\d][\d -]{8,16}[\dXx])").unwrap())
}

/// Pull DOI / arXiv / ISBN identifiers out of free text.
///
/// Returns `None` when nothing matched so callers can skip the source
/// entirely instead of feeding an empty set into reconciliation.
pub fn scan_text_for_identifiers(text: &str) -> Option<FieldSet> {
    let mut fs = FieldSet::empty(ExtractionSource::IdentifierScan);
    let mut found = false;

    if let Some(m) = doi_re().find(text) {
        let doi = m.as_str().trim_end_matches(['.', ',', ';', ')']);
        fs.doi = Some(doi.to_string());
        fs.confidence.insert(FieldKey::Doi, 0.95);
        found = true;
    }
    if let Some(c) = arxiv_re().captures(text) {
        fs.arxiv = Some(c[1].to_string());
        fs.confidence.insert(FieldKey::Arxiv, 0.95);
        found = true;
    }
    if let Some(c) = isbn_re().captures(text) {
        let digits: String = c[1]
            .chars()
            .filter(|ch| ch.is_ascii_digit() || *ch == 'X' || *ch == 'x')
            .collect();
        if digits.len() == 10 || digits.len() == 13 {
            fs.isbn = Some(digits);
            fs.confidence.insert(FieldKey::Isbn, 0.9);
            found = true;
        }
    }

    if found {
        Some(fs)
    } else {
        None
    }
}
