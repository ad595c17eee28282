//! Scoring and ranking of catalog candidates.
//!
//! The catalog returns loosely filtered entries; this module scores them
//! against the query as a weighted sum of author-set overlap, year exact
//! match, and title token overlap, drops everything below the configured
//! minimum, and orders what remains by score descending with ties broken
//! by more recent catalog entry first.

use std::collections::BTreeSet;

use crate::config::MatchingConfig;
use crate::models::{CatalogEntry, MatchCandidate, SearchQuery};

/// Rank catalog entries against a query.
///
/// An empty result is a valid, expected outcome; the flow routes it to the
/// no-match page rather than treating it as an error.
pub fn rank(
    entries: Vec<CatalogEntry>,
    query: &SearchQuery,
    config: &MatchingConfig,
) -> Vec<MatchCandidate> {
    let mut candidates: Vec<MatchCandidate> = entries
        .into_iter()
        .map(|entry| {
            let score = score(&entry, query, config);
            MatchCandidate { entry, score }
        })
        .filter(|c| c.score >= config.min_score)
        .collect();

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.entry.added_at.cmp(&a.entry.added_at))
    });

    candidates
}

fn score(entry: &CatalogEntry, query: &SearchQuery, config: &MatchingConfig) -> f64 {
    let author_part = author_overlap(&query.authors, &entry.fields.authors);
    let year_part = match (query.year, entry.fields.year) {
        (Some(a), Some(b)) if a == b => 1.0,
        _ => 0.0,
    };
    let title_part = token_overlap(
        query.title.as_deref().unwrap_or(""),
        entry.fields.title.as_deref().unwrap_or(""),
    );

    config.author_weight * author_part
        + config.year_weight * year_part
        + config.title_weight * title_part
}

/// Overlap ratio between two author lists, compared on normalized family
/// names so "Smith, J." and "J. Smith" count as the same person.
fn author_overlap(a: &[String], b: &[String]) -> f64 {
    let set_a: BTreeSet<String> = a.iter().map(|n| family_name(n)).collect();
    let set_b: BTreeSet<String> = b.iter().map(|n| family_name(n)).collect();
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let shared = set_a.intersection(&set_b).count() as f64;
    shared / set_a.len().max(set_b.len()) as f64
}

/// Best-effort family name: the part before a comma, otherwise the longest
/// word (initials are short).
fn family_name(name: &str) -> String {
    let base = match name.split_once(',') {
        Some((family, _)) => family,
        None => name
            .split_whitespace()
            .max_by_key(|w| w.trim_end_matches('.').len())
            .unwrap_or(name),
    };
    base.trim()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Jaccard overlap of lowercased alphanumeric tokens.
fn token_overlap(a: &str, b: &str) -> f64 {
    let tok = |s: &str| -> BTreeSet<String> {
        s.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect()
    };
    let set_a = tok(a);
    let set_b = tok(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let shared = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    shared / union
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractionSource, FieldSet};
    use chrono::{TimeZone, Utc};

    fn entry(key: &str, authors: &[&str], year: i32, title: &str, added_secs: i64) -> CatalogEntry {
        let mut fields = FieldSet::empty(ExtractionSource::Structured);
        fields.authors = authors.iter().map(|a| a.to_string()).collect();
        fields.year = Some(year);
        fields.title = Some(title.to_string());
        CatalogEntry {
            key: key.to_string(),
            fields,
            added_at: Utc.timestamp_opt(added_secs, 0).unwrap(),
            has_attachment: false,
        }
    }

    fn query(authors: &[&str], year: Option<i32>, title: Option<&str>) -> SearchQuery {
        SearchQuery {
            authors: authors.iter().map(|a| a.to_string()).collect(),
            year,
            title: title.map(|t| t.to_string()),
        }
    }

    #[test]
    fn test_strong_and_weak_candidates_ordered() {
        let q = query(&["Smith, J."], Some(2019), Some("X"));
        let entries = vec![
            entry("weak", &["Jones, B."], 2019, "Y", 100),
            entry("strong", &["Smith, J."], 2019, "X", 50),
        ];
        let ranked = rank(entries, &q, &MatchingConfig::default());
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].entry.key, "strong");
        assert!(ranked[0].score > 0.79);
        assert_eq!(ranked[1].entry.key, "weak");
        assert!(ranked[1].score >= 0.15);
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn test_below_threshold_omitted() {
        let q = query(&["Smith, J."], Some(2019), Some("Deep Learning"));
        let entries = vec![entry("noise", &["Zhou, W."], 1987, "Gardening", 0)];
        let ranked = rank(entries, &q, &MatchingConfig::default());
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_tie_broken_by_recency() {
        let q = query(&["Smith, J."], Some(2019), None);
        let entries = vec![
            entry("old", &["Smith, J."], 2019, "", 100),
            entry("new", &["Smith, J."], 2019, "", 200),
        ];
        let ranked = rank(entries, &q, &MatchingConfig::default());
        assert_eq!(ranked[0].entry.key, "new");
        assert_eq!(ranked[1].entry.key, "old");
    }

    #[test]
    fn test_author_name_normalization() {
        assert_eq!(family_name("Smith, J."), "smith");
        assert_eq!(family_name("J. Smith"), "smith");
        assert!(author_overlap(&["Smith, J.".into()], &["John Smith".into()]) > 0.99);
    }

    #[test]
    fn test_partial_author_overlap() {
        let a = vec!["Smith, J.".to_string(), "Doe, A.".to_string()];
        let b = vec!["Smith, J.".to_string()];
        let overlap = author_overlap(&a, &b);
        assert!((overlap - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_catalog_is_empty_result() {
        let q = query(&["Smith, J."], Some(2019), Some("X"));
        let ranked = rank(Vec::new(), &q, &MatchingConfig::default());
        assert!(ranked.is_empty());
    }
}
