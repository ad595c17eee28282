//! Core data models used throughout Paperdock.
//!
//! These types represent the documents, extracted field sets, reconciled
//! records, and catalog candidates that flow through the ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// One scanned file moving through the pipeline.
///
/// Created when the watcher detects a new file; the file itself is only
/// ever moved into a terminal directory, never deleted.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub source_path: PathBuf,
    /// sha256 of the file content, hex-encoded. Used for dedup and for
    /// idempotence checks during lifecycle transitions.
    pub content_hash: String,
    pub language: Option<String>,
    pub state: DocState,
}

/// Lifecycle state of a [`Document`].
///
/// `Failed` is reachable from any state on an unrecoverable collaborator
/// error. `ManualReview` is reachable only from `InteractiveReview` via an
/// explicit quit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocState {
    Detected,
    Extracting,
    Reconciling,
    InteractiveReview,
    Attaching,
    Done,
    Skipped,
    ManualReview,
    Failed,
}

impl DocState {
    /// Terminal states map to the sibling directory the original file
    /// settles into.
    pub fn terminal_dir(&self) -> Option<&'static str> {
        match self {
            DocState::Done => Some("done"),
            DocState::Skipped => Some("skipped"),
            DocState::ManualReview => Some("manual-review"),
            DocState::Failed => Some("failed"),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_dir().is_some()
    }

    /// Whether a transition from `self` to `to` is allowed.
    pub fn can_transition_to(&self, to: DocState) -> bool {
        use DocState::*;
        if *self == to {
            // Re-running an already-applied transition is a no-op, not an error.
            return true;
        }
        match (self, to) {
            (_, Failed) => true,
            (InteractiveReview, ManualReview) => true,
            (Detected, Extracting) => true,
            (Extracting, Reconciling) => true,
            (Reconciling, InteractiveReview) => true,
            (InteractiveReview, Attaching) => true,
            (InteractiveReview, Skipped) => true,
            (Attaching, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DocState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocState::Detected => "detected",
            DocState::Extracting => "extracting",
            DocState::Reconciling => "reconciling",
            DocState::InteractiveReview => "interactive-review",
            DocState::Attaching => "attaching",
            DocState::Done => "done",
            DocState::Skipped => "skipped",
            DocState::ManualReview => "manual-review",
            DocState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Which extraction back end produced a [`FieldSet`].
///
/// The ordering encodes the fixed trust priority used when merging
/// identifiers: structured extraction beats the identifier scan, which
/// beats the fallback model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionSource {
    Structured,
    IdentifierScan,
    FallbackModel,
}

impl fmt::Display for ExtractionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExtractionSource::Structured => "structured",
            ExtractionSource::IdentifierScan => "identifier-scan",
            ExtractionSource::FallbackModel => "fallback-model",
        };
        write!(f, "{}", s)
    }
}

/// A bibliographic field name. Used to key conflicts, confidences, and
/// interactive edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldKey {
    Title,
    Authors,
    Year,
    Container,
    Doi,
    Isbn,
    Arxiv,
    Url,
    DocType,
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldKey::Title => "title",
            FieldKey::Authors => "authors",
            FieldKey::Year => "year",
            FieldKey::Container => "container",
            FieldKey::Doi => "doi",
            FieldKey::Isbn => "isbn",
            FieldKey::Arxiv => "arxiv",
            FieldKey::Url => "url",
            FieldKey::DocType => "document type",
        };
        write!(f, "{}", s)
    }
}

/// Document type, as far as the extraction sources could tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DocType {
    Article,
    Book,
    Chapter,
    Thesis,
    Report,
    #[default]
    Unknown,
}

impl DocType {
    pub const ALL: [DocType; 6] = [
        DocType::Article,
        DocType::Book,
        DocType::Chapter,
        DocType::Thesis,
        DocType::Report,
        DocType::Unknown,
    ];

    /// Whether this type of document is expected to carry a title.
    pub fn implies_title(&self) -> bool {
        !matches!(self, DocType::Unknown)
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocType::Article => "article",
            DocType::Book => "book",
            DocType::Chapter => "chapter",
            DocType::Thesis => "thesis",
            DocType::Report => "report",
            DocType::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// One extraction source's view of a document's bibliographic data.
///
/// Extraction commands emit this shape as JSON on stdout; the built-in
/// identifier scan constructs it directly. Missing confidences default to
/// 1.0 for present fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSet {
    pub source: ExtractionSource,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub isbn: Option<String>,
    #[serde(default)]
    pub arxiv: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub doc_type: Option<DocType>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub confidence: BTreeMap<FieldKey, f64>,
}

impl FieldSet {
    pub fn empty(source: ExtractionSource) -> Self {
        Self {
            source,
            title: None,
            authors: Vec::new(),
            year: None,
            container: None,
            doi: None,
            isbn: None,
            arxiv: None,
            url: None,
            doc_type: None,
            language: None,
            confidence: BTreeMap::new(),
        }
    }

    /// The declared confidence for a field, defaulting to 1.0.
    pub fn confidence_for(&self, field: FieldKey) -> f64 {
        self.confidence.get(&field).copied().unwrap_or(1.0)
    }
}

/// A field where extraction sources disagreed and no deterministic
/// tie-break applied. Unresolved conflicts block automatic progression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub field: FieldKey,
    pub candidates: Vec<String>,
    pub resolved: bool,
}

/// The merged, conflict-annotated result of all [`FieldSet`]s for one
/// document. Every field exposed downstream has exactly one winning value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciledRecord {
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub container: Option<String>,
    pub doi: Option<String>,
    pub isbn: Option<String>,
    pub arxiv: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub doc_type: DocType,
    #[serde(default)]
    pub confidence: BTreeMap<FieldKey, f64>,
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
}

impl ReconciledRecord {
    /// Fields still awaiting explicit human resolution.
    pub fn unresolved_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| !c.resolved)
    }

    pub fn has_unresolved_conflicts(&self) -> bool {
        self.unresolved_conflicts().next().is_some()
    }

    /// Resolve a conflict with the chosen value and apply it to the record.
    pub fn resolve(&mut self, field: FieldKey, value: &str) {
        if let Some(c) = self
            .conflicts
            .iter_mut()
            .find(|c| c.field == field && !c.resolved)
        {
            c.resolved = true;
        }
        self.apply_edit(field, value);
    }

    /// Apply a raw operator-supplied value to a field.
    ///
    /// Authors are split on `;`, the year must parse as an integer (an
    /// unparseable year clears the field rather than storing junk), and a
    /// doc type falls back to `Unknown` on an unrecognized name.
    pub fn apply_edit(&mut self, field: FieldKey, raw: &str) {
        let raw = raw.trim();
        let value = if raw.is_empty() {
            None
        } else {
            Some(raw.to_string())
        };
        match field {
            FieldKey::Title => self.title = value,
            FieldKey::Container => self.container = value,
            FieldKey::Doi => self.doi = value,
            FieldKey::Isbn => self.isbn = value,
            FieldKey::Arxiv => self.arxiv = value,
            FieldKey::Url => self.url = value,
            FieldKey::Authors => {
                self.authors = raw
                    .split(';')
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty())
                    .collect();
            }
            FieldKey::Year => self.year = raw.parse::<i32>().ok(),
            FieldKey::DocType => {
                self.doc_type = match raw.to_lowercase().as_str() {
                    "article" => DocType::Article,
                    "book" => DocType::Book,
                    "chapter" => DocType::Chapter,
                    "thesis" => DocType::Thesis,
                    "report" => DocType::Report,
                    _ => DocType::Unknown,
                };
            }
        }
        self.confidence.insert(field, 1.0);
    }

    /// View the record as a single field set (used when creating a new
    /// catalog entry from operator-confirmed data).
    pub fn as_field_set(&self) -> FieldSet {
        FieldSet {
            source: ExtractionSource::Structured,
            title: self.title.clone(),
            authors: self.authors.clone(),
            year: self.year,
            container: self.container.clone(),
            doi: self.doi.clone(),
            isbn: self.isbn.clone(),
            arxiv: self.arxiv.clone(),
            url: self.url.clone(),
            doc_type: Some(self.doc_type),
            language: None,
            confidence: self.confidence.clone(),
        }
    }

    /// Render a field's current value for display.
    pub fn display_value(&self, field: FieldKey) -> String {
        match field {
            FieldKey::Title => self.title.clone().unwrap_or_default(),
            FieldKey::Authors => self.authors.join("; "),
            FieldKey::Year => self.year.map(|y| y.to_string()).unwrap_or_default(),
            FieldKey::Container => self.container.clone().unwrap_or_default(),
            FieldKey::Doi => self.doi.clone().unwrap_or_default(),
            FieldKey::Isbn => self.isbn.clone().unwrap_or_default(),
            FieldKey::Arxiv => self.arxiv.clone().unwrap_or_default(),
            FieldKey::Url => self.url.clone().unwrap_or_default(),
            FieldKey::DocType => self.doc_type.to_string(),
        }
    }
}

/// A catalog entry as returned by the catalog service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub key: String,
    pub fields: FieldSet,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub has_attachment: bool,
}

/// A scored catalog entry, as presented for selection.
///
/// Candidates are always ordered by score descending, ties broken by more
/// recent catalog entry first.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub entry: CatalogEntry,
    pub score: f64,
}

/// The search parameters sent to the catalog.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub title: Option<String>,
}

impl SearchQuery {
    /// Build the initial query from a reconciled record.
    pub fn from_record(record: &ReconciledRecord) -> Self {
        Self {
            authors: record.authors.clone(),
            year: record.year,
            title: record.title.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_dirs() {
        assert_eq!(DocState::Done.terminal_dir(), Some("done"));
        assert_eq!(DocState::ManualReview.terminal_dir(), Some("manual-review"));
        assert_eq!(DocState::InteractiveReview.terminal_dir(), None);
        assert!(DocState::Failed.is_terminal());
    }

    #[test]
    fn test_failed_reachable_from_anywhere() {
        for s in [
            DocState::Detected,
            DocState::Extracting,
            DocState::Reconciling,
            DocState::InteractiveReview,
            DocState::Attaching,
        ] {
            assert!(s.can_transition_to(DocState::Failed), "{} -> failed", s);
        }
    }

    #[test]
    fn test_manual_review_only_from_interactive() {
        assert!(DocState::InteractiveReview.can_transition_to(DocState::ManualReview));
        assert!(!DocState::Extracting.can_transition_to(DocState::ManualReview));
        assert!(!DocState::Detected.can_transition_to(DocState::ManualReview));
    }

    #[test]
    fn test_repeat_transition_is_allowed() {
        assert!(DocState::Done.can_transition_to(DocState::Done));
    }

    #[test]
    fn test_apply_edit_authors_split() {
        let mut rec = ReconciledRecord::default();
        rec.apply_edit(FieldKey::Authors, "Smith, J.; Doe, A. ;");
        assert_eq!(rec.authors, vec!["Smith, J.", "Doe, A."]);
    }

    #[test]
    fn test_apply_edit_bad_year_clears() {
        let mut rec = ReconciledRecord {
            year: Some(2019),
            ..Default::default()
        };
        rec.apply_edit(FieldKey::Year, "twenty-nineteen");
        assert_eq!(rec.year, None);
    }

    #[test]
    fn test_resolve_marks_conflict() {
        let mut rec = ReconciledRecord {
            conflicts: vec![Conflict {
                field: FieldKey::Year,
                candidates: vec!["2019".into(), "2020".into()],
                resolved: false,
            }],
            ..Default::default()
        };
        assert!(rec.has_unresolved_conflicts());
        rec.resolve(FieldKey::Year, "2019");
        assert!(!rec.has_unresolved_conflicts());
        assert_eq!(rec.year, Some(2019));
    }

    #[test]
    fn test_fieldset_json_round() {
        let json = r#"{
            "source": "structured",
            "title": "Deep Learning",
            "authors": ["Goodfellow, I."],
            "year": 2016,
            "doc_type": "book",
            "confidence": { "title": 0.9 }
        }"#;
        let fs: FieldSet = serde_json::from_str(json).unwrap();
        assert_eq!(fs.source, ExtractionSource::Structured);
        assert_eq!(fs.year, Some(2016));
        assert_eq!(fs.doc_type, Some(DocType::Book));
        assert!((fs.confidence_for(FieldKey::Title) - 0.9).abs() < 1e-9);
        assert!((fs.confidence_for(FieldKey::Year) - 1.0).abs() < 1e-9);
    }
}
