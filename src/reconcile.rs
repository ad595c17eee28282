//! Merging multiple extraction results into one confident record.
//!
//! Each extraction source is imperfect in its own way, and the sources are
//! correlated (they all read the same document), so disagreement is never
//! settled by majority vote. Per-field policy:
//!
//! - identifiers: first non-empty value in fixed source-priority order
//! - year: unanimity or an unresolved conflict
//! - authors: most plausible name segmentation, then source priority
//! - free text: longest non-truncated candidate
//! - document type: unanimity or `Unknown` plus forced user selection

use std::collections::BTreeSet;

use crate::models::{Conflict, DocType, FieldKey, FieldSet, ReconciledRecord};

/// Free-text values shorter than this many whitespace tokens are treated
/// as low-confidence and surfaced for confirmation.
const MIN_TEXT_TOKENS: usize = 3;

const LOW_CONFIDENCE: f64 = 0.4;

/// Merge all source field sets for one document.
///
/// The result carries exactly one winning value per field plus a conflict
/// entry for every field where the sources disagreed and no deterministic
/// tie-break applied. If all inputs agree on a field, its confidence is 1
/// and no conflict is recorded.
pub fn reconcile(sets: &[FieldSet]) -> ReconciledRecord {
    // Fixed priority order for identifier-style merging.
    let mut ordered: Vec<&FieldSet> = sets.iter().collect();
    ordered.sort_by_key(|fs| fs.source);

    let mut record = ReconciledRecord::default();

    merge_identifier(&ordered, &mut record, FieldKey::Doi, |fs| fs.doi.as_deref());
    merge_identifier(&ordered, &mut record, FieldKey::Isbn, |fs| {
        fs.isbn.as_deref()
    });
    merge_identifier(&ordered, &mut record, FieldKey::Arxiv, |fs| {
        fs.arxiv.as_deref()
    });
    merge_identifier(&ordered, &mut record, FieldKey::Url, |fs| fs.url.as_deref());

    merge_year(&ordered, &mut record);
    merge_authors(&ordered, &mut record);
    merge_doc_type(&ordered, &mut record);

    merge_free_text(&ordered, &mut record, FieldKey::Title, |fs| {
        fs.title.as_deref()
    });
    merge_free_text(&ordered, &mut record, FieldKey::Container, |fs| {
        fs.container.as_deref()
    });

    // A short title still needs confirmation when the document type says
    // one should exist.
    if record.doc_type.implies_title() {
        let short = record
            .title
            .as_deref()
            .map(|t| t.split_whitespace().count() < MIN_TEXT_TOKENS)
            .unwrap_or(true);
        if short && !record.conflicts.iter().any(|c| c.field == FieldKey::Title) {
            record.conflicts.push(Conflict {
                field: FieldKey::Title,
                candidates: record.title.iter().cloned().collect(),
                resolved: false,
            });
        }
    }

    record
}

/// Identifiers are either present and trusted, or absent. First non-empty
/// value wins in source-priority order; no voting.
fn merge_identifier<'a>(
    ordered: &[&'a FieldSet],
    record: &mut ReconciledRecord,
    field: FieldKey,
    get: impl Fn(&'a FieldSet) -> Option<&'a str>,
) {
    for fs in ordered {
        if let Some(v) = get(fs) {
            let v = v.trim();
            if v.is_empty() {
                continue;
            }
            let value = v.to_string();
            match field {
                FieldKey::Doi => record.doi = Some(value),
                FieldKey::Isbn => record.isbn = Some(value),
                FieldKey::Arxiv => record.arxiv = Some(value),
                FieldKey::Url => record.url = Some(value),
                _ => unreachable!("merge_identifier called for non-identifier field"),
            }
            record.confidence.insert(field, fs.confidence_for(field));
            return;
        }
    }
}

/// All distinct non-empty years must agree; a split is recorded as a
/// conflict requiring explicit human resolution, never a majority pick.
fn merge_year(ordered: &[&FieldSet], record: &mut ReconciledRecord) {
    let distinct: BTreeSet<i32> = ordered.iter().filter_map(|fs| fs.year).collect();
    match distinct.len() {
        0 => {}
        1 => {
            record.year = distinct.into_iter().next();
            record.confidence.insert(FieldKey::Year, 1.0);
        }
        _ => {
            record.conflicts.push(Conflict {
                field: FieldKey::Year,
                candidates: distinct.into_iter().map(|y| y.to_string()).collect(),
                resolved: false,
            });
        }
    }
}

/// An author list is plausible when it segments into at least one name and
/// is not a single run-on string masquerading as a list.
fn plausible_authors(authors: &[String]) -> bool {
    if authors.is_empty() {
        return false;
    }
    if authors.len() == 1 {
        // A lone entry with many words is usually an unsegmented byline.
        if authors[0].split_whitespace().count() > 6 {
            return false;
        }
    }
    authors.iter().all(|a| !a.trim().is_empty())
}

fn merge_authors(ordered: &[&FieldSet], record: &mut ReconciledRecord) {
    let best = ordered
        .iter()
        .filter(|fs| plausible_authors(&fs.authors))
        .max_by(|a, b| {
            a.authors
                .len()
                .cmp(&b.authors.len())
                // Ties prefer higher-priority sources; `ordered` is sorted
                // by priority so pick the earlier one via reversed index.
                .then_with(|| b.source.cmp(&a.source))
        });

    if let Some(fs) = best {
        record.authors = fs.authors.clone();
        record
            .confidence
            .insert(FieldKey::Authors, fs.confidence_for(FieldKey::Authors));
    }
}

/// Sources must agree on the type; two disagreeing sources force an
/// explicit user selection instead of a silent guess.
fn merge_doc_type(ordered: &[&FieldSet], record: &mut ReconciledRecord) {
    let distinct: BTreeSet<String> = ordered
        .iter()
        .filter_map(|fs| fs.doc_type)
        .filter(|t| *t != DocType::Unknown)
        .map(|t| t.to_string())
        .collect();

    match distinct.len() {
        0 => record.doc_type = DocType::Unknown,
        1 => {
            let name = distinct.into_iter().next().unwrap();
            record.apply_edit(FieldKey::DocType, &name);
        }
        _ => {
            record.doc_type = DocType::Unknown;
            record.conflicts.push(Conflict {
                field: FieldKey::DocType,
                candidates: distinct.into_iter().collect(),
                resolved: false,
            });
        }
    }
}

/// Free-text fields prefer the longest non-truncated candidate. Candidates
/// ending in an ellipsis or a hyphen are treated as truncated.
fn truncated(text: &str) -> bool {
    let t = text.trim_end();
    t.ends_with("...") || t.ends_with('\u{2026}') || t.ends_with('-')
}

fn merge_free_text<'a>(
    ordered: &[&'a FieldSet],
    record: &mut ReconciledRecord,
    field: FieldKey,
    get: impl Fn(&'a FieldSet) -> Option<&'a str>,
) {
    let mut candidates: Vec<(&str, f64)> = ordered
        .iter()
        .filter_map(|fs| get(fs).map(|v| (v.trim(), fs.confidence_for(field))))
        .filter(|(v, _)| !v.is_empty())
        .collect();

    if candidates.is_empty() {
        return;
    }

    candidates.sort_by(|a, b| {
        let a_trunc = truncated(a.0);
        let b_trunc = truncated(b.0);
        a_trunc
            .cmp(&b_trunc)
            .then_with(|| b.0.len().cmp(&a.0.len()))
    });

    let (value, source_conf) = candidates[0];
    let tokens = value.split_whitespace().count();
    let conf = if tokens < MIN_TEXT_TOKENS {
        LOW_CONFIDENCE.min(source_conf)
    } else {
        source_conf
    };

    match field {
        FieldKey::Title => record.title = Some(value.to_string()),
        FieldKey::Container => record.container = Some(value.to_string()),
        _ => unreachable!("merge_free_text called for non-text field"),
    }
    record.confidence.insert(field, conf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractionSource;

    fn set(source: ExtractionSource) -> FieldSet {
        FieldSet::empty(source)
    }

    #[test]
    fn test_all_sources_agree_on_year() {
        let mut a = set(ExtractionSource::Structured);
        a.year = Some(2019);
        let mut b = set(ExtractionSource::IdentifierScan);
        b.year = Some(2019);
        let mut c = set(ExtractionSource::FallbackModel);
        c.year = Some(2019);

        let rec = reconcile(&[a, b, c]);
        assert_eq!(rec.year, Some(2019));
        assert!((rec.confidence[&FieldKey::Year] - 1.0).abs() < 1e-9);
        assert!(!rec.conflicts.iter().any(|c| c.field == FieldKey::Year));
    }

    #[test]
    fn test_year_split_records_conflict() {
        let mut a = set(ExtractionSource::Structured);
        a.year = Some(2019);
        let mut b = set(ExtractionSource::IdentifierScan);
        b.year = Some(2020);
        let mut c = set(ExtractionSource::FallbackModel);
        c.year = Some(2019);

        // 2 vs 1 must not be resolved by vote.
        let rec = reconcile(&[a, b, c]);
        assert_eq!(rec.year, None);
        let conflict = rec
            .conflicts
            .iter()
            .find(|c| c.field == FieldKey::Year)
            .unwrap();
        assert_eq!(conflict.candidates, vec!["2019", "2020"]);
        assert!(!conflict.resolved);
        assert!(rec.has_unresolved_conflicts());
    }

    #[test]
    fn test_identifier_priority_order() {
        let mut scan = set(ExtractionSource::IdentifierScan);
        scan.doi = Some("10.1000/scan".into());
        let mut structured = set(ExtractionSource::Structured);
        structured.doi = Some("10.1000/structured".into());
        let mut fallback = set(ExtractionSource::FallbackModel);
        fallback.doi = Some("10.1000/fallback".into());

        // Input order must not matter.
        let rec = reconcile(&[fallback, scan, structured]);
        assert_eq!(rec.doi.as_deref(), Some("10.1000/structured"));
    }

    #[test]
    fn test_identifier_absent_is_not_a_conflict() {
        let structured = set(ExtractionSource::Structured);
        let mut fallback = set(ExtractionSource::FallbackModel);
        fallback.doi = Some("10.1000/xyz".into());

        let rec = reconcile(&[structured, fallback]);
        assert_eq!(rec.doi.as_deref(), Some("10.1000/xyz"));
        assert!(!rec.conflicts.iter().any(|c| c.field == FieldKey::Doi));
    }

    #[test]
    fn test_authors_prefer_segmented() {
        let mut runon = set(ExtractionSource::Structured);
        runon.authors = vec!["John Smith and Alice Doe and Bob Roe together wrote".into()];
        let mut segmented = set(ExtractionSource::FallbackModel);
        segmented.authors = vec!["Smith, J.".into(), "Doe, A.".into()];

        let rec = reconcile(&[runon, segmented]);
        assert_eq!(rec.authors, vec!["Smith, J.", "Doe, A."]);
    }

    #[test]
    fn test_authors_tie_prefers_structured() {
        let mut a = set(ExtractionSource::Structured);
        a.authors = vec!["Smith, J.".into(), "Doe, A.".into()];
        let mut b = set(ExtractionSource::FallbackModel);
        b.authors = vec!["Smyth, J.".into(), "Doe, A.".into()];

        let rec = reconcile(&[b, a]);
        assert_eq!(rec.authors, vec!["Smith, J.", "Doe, A."]);
    }

    #[test]
    fn test_title_prefers_longest_non_truncated() {
        let mut a = set(ExtractionSource::Structured);
        a.title = Some("Attention Is All You Need and then some more wo-".into());
        let mut b = set(ExtractionSource::FallbackModel);
        b.title = Some("Attention Is All You Need".into());

        let rec = reconcile(&[a, b]);
        assert_eq!(rec.title.as_deref(), Some("Attention Is All You Need"));
    }

    #[test]
    fn test_short_title_flagged_when_type_implies_title() {
        let mut a = set(ExtractionSource::Structured);
        a.title = Some("Untitled".into());
        a.doc_type = Some(DocType::Article);

        let rec = reconcile(&[a]);
        assert!(rec
            .conflicts
            .iter()
            .any(|c| c.field == FieldKey::Title && !c.resolved));
        assert!(rec.confidence[&FieldKey::Title] < 0.5);
    }

    #[test]
    fn test_doc_type_disagreement_forces_unknown() {
        let mut a = set(ExtractionSource::Structured);
        a.doc_type = Some(DocType::Article);
        let mut b = set(ExtractionSource::FallbackModel);
        b.doc_type = Some(DocType::Report);

        let rec = reconcile(&[a, b]);
        assert_eq!(rec.doc_type, DocType::Unknown);
        assert!(rec.conflicts.iter().any(|c| c.field == FieldKey::DocType));
    }

    #[test]
    fn test_doc_type_agreement_accepted() {
        let mut a = set(ExtractionSource::Structured);
        a.doc_type = Some(DocType::Book);
        a.title = Some("A Reasonably Long Book Title".into());
        let mut b = set(ExtractionSource::FallbackModel);
        b.doc_type = Some(DocType::Book);

        let rec = reconcile(&[a, b]);
        assert_eq!(rec.doc_type, DocType::Book);
        assert!(!rec.has_unresolved_conflicts());
    }

    #[test]
    fn test_empty_input_yields_empty_record() {
        let rec = reconcile(&[]);
        assert_eq!(rec.year, None);
        assert!(rec.authors.is_empty());
        assert_eq!(rec.doc_type, DocType::Unknown);
    }
}
