//! The concrete review flow: page definitions and handlers.
//!
//! Pages are immutable definitions registered once with the
//! [`NavigationEngine`]; all per-document state lives in [`Context`].
//! Handlers do the work (catalog calls, record mutation) and return where
//! to go next, so rendering stays a pure display of Context.

use async_trait::async_trait;
use chrono::Utc;

use crate::matcher;
use crate::models::{CatalogEntry, DocType, FieldKey, MatchCandidate, SearchQuery};
use crate::nav::{
    Context, InputSpec, NavigationEngine, NavigationResult, Outcome, Page, PageHandler, Services,
};

/// Which fields the summary shows, keyed declaratively by document type.
pub fn field_groups(doc_type: DocType) -> &'static [FieldKey] {
    use FieldKey::{Arxiv, Authors, Container, Doi, Isbn, Title, Url, Year};
    match doc_type {
        DocType::Article => &[Title, Authors, Year, Container, Doi, Arxiv, Url],
        DocType::Book => &[Title, Authors, Year, Isbn, Url],
        DocType::Chapter => &[Title, Authors, Year, Container, Isbn],
        DocType::Thesis => &[Title, Authors, Year, Url],
        DocType::Report => &[Title, Authors, Year, Container, Url],
        DocType::Unknown => &[Title, Authors, Year, Container, Doi, Isbn, Arxiv, Url],
    }
}

/// Fields offered by the editor menu, in menu order.
const EDITABLE: [FieldKey; 8] = [
    FieldKey::Title,
    FieldKey::Authors,
    FieldKey::Year,
    FieldKey::Container,
    FieldKey::Doi,
    FieldKey::Isbn,
    FieldKey::Arxiv,
    FieldKey::Url,
];

/// Build the full page table for the review flow.
pub fn build_pages() -> NavigationEngine {
    NavigationEngine::new(vec![
        Page {
            id: "summary",
            title: "Review",
            prompt: "[c]ontinue  [e]dit  [t]ype  [s]kip  (q quit, ^ restart):",
            input: InputSpec::Tokens {
                accepted: &["c", "e", "t", "s"],
                default: Some("c"),
            },
            back: None,
            handler: Box::new(SummaryPage),
        },
        Page {
            id: "conflict",
            title: "Resolve conflict",
            prompt: "pick a value, or [m] to type one (q quit, < back):",
            input: InputSpec::Tokens {
                accepted: &["1", "2", "3", "4", "5", "6", "7", "8", "9", "m"],
                default: None,
            },
            back: Some("summary"),
            handler: Box::new(ConflictPage),
        },
        Page {
            id: "conflict-entry",
            title: "Enter value",
            prompt: "value:",
            input: InputSpec::FreeText,
            back: Some("conflict"),
            handler: Box::new(ConflictEntryPage),
        },
        Page {
            id: "doc-type",
            title: "Document type",
            prompt: "type number (q quit, < back):",
            input: InputSpec::Tokens {
                accepted: &["1", "2", "3", "4", "5", "6"],
                default: None,
            },
            back: Some("summary"),
            handler: Box::new(DocTypePage),
        },
        Page {
            id: "edit",
            title: "Edit fields",
            prompt: "field number, or [d]one:",
            input: InputSpec::Tokens {
                accepted: &["1", "2", "3", "4", "5", "6", "7", "8", "d"],
                default: Some("d"),
            },
            back: Some("summary"),
            handler: Box::new(EditPage),
        },
        Page {
            id: "edit-value",
            title: "Edit value",
            prompt: "new value (empty clears):",
            input: InputSpec::FreeText,
            back: Some("edit"),
            handler: Box::new(EditValuePage),
        },
        Page {
            id: "match",
            title: "Catalog matches",
            prompt: "candidate number, [r]escan, [n]one of these:",
            input: InputSpec::Tokens {
                accepted: &["1", "2", "3", "4", "5", "6", "7", "8", "9", "r", "n"],
                default: Some("1"),
            },
            back: Some("summary"),
            handler: Box::new(MatchPage),
        },
        Page {
            id: "rescan",
            title: "Edit search",
            prompt: "authors | year | title (empty keeps current):",
            input: InputSpec::FreeText,
            back: Some("match"),
            handler: Box::new(RescanPage),
        },
        Page {
            id: "no-match",
            title: "No catalog match",
            prompt: "[c]reate new entry  [r]escan  [m]anual review:",
            input: InputSpec::Tokens {
                accepted: &["c", "r", "m"],
                default: Some("c"),
            },
            back: Some("summary"),
            handler: Box::new(NoMatchPage),
        },
        Page {
            id: "confirm",
            title: "Confirm",
            prompt: "[y]es archive  [n]o, back to matches:",
            input: InputSpec::Tokens {
                accepted: &["y", "n"],
                default: Some("y"),
            },
            back: Some("match"),
            handler: Box::new(ConfirmPage),
        },
        Page {
            id: "note",
            title: "Note",
            prompt: "optional note (empty for none):",
            input: InputSpec::FreeText,
            back: Some("confirm"),
            handler: Box::new(NotePage),
        },
        Page {
            id: "catalog-retry",
            title: "Catalog unavailable",
            prompt: "[r]etry  [m]anual review:",
            input: InputSpec::Tokens {
                accepted: &["r", "m"],
                default: Some("r"),
            },
            back: None,
            handler: Box::new(CatalogRetryPage),
        },
        Page {
            id: "manual-title",
            title: "Manual entry — title",
            prompt: "title:",
            input: InputSpec::FreeText,
            back: None,
            handler: Box::new(ManualFieldPage {
                field: FieldKey::Title,
                next: "manual-authors",
            }),
        },
        Page {
            id: "manual-authors",
            title: "Manual entry — authors",
            prompt: "authors (separate with ;):",
            input: InputSpec::FreeText,
            back: Some("manual-title"),
            handler: Box::new(ManualFieldPage {
                field: FieldKey::Authors,
                next: "manual-year",
            }),
        },
        Page {
            id: "manual-year",
            title: "Manual entry — year",
            prompt: "year (empty if unknown):",
            input: InputSpec::FreeText,
            back: Some("manual-authors"),
            handler: Box::new(ManualFieldPage {
                field: FieldKey::Year,
                next: "manual-doctype",
            }),
        },
        Page {
            id: "manual-doctype",
            title: "Manual entry — document type",
            prompt: "type number:",
            input: InputSpec::Tokens {
                accepted: &["1", "2", "3", "4", "5", "6"],
                default: None,
            },
            back: Some("manual-year"),
            handler: Box::new(ManualDocTypePage),
        },
        Page {
            id: "transfer-error",
            title: "Transfer failed",
            prompt: "[r]eplace and retry  [c]ancel to manual review:",
            input: InputSpec::Tokens {
                accepted: &["r", "c"],
                default: None,
            },
            back: None,
            handler: Box::new(TransferErrorPage),
        },
    ])
}

/// Run the catalog search for the current query and pick the next page.
///
/// A catalog failure becomes a page transition, never an error bubbling
/// out of the flow.
async fn run_search(services: &Services, ctx: &mut Context) -> NavigationResult {
    match services.catalog.search(&ctx.query).await {
        Ok(entries) => {
            ctx.catalog_error = None;
            ctx.candidates = matcher::rank(entries, &ctx.query, &services.config.matching);
            if ctx.candidates.is_empty() {
                NavigationResult::GoTo("no-match")
            } else {
                NavigationResult::GoTo("match")
            }
        }
        Err(e) => {
            ctx.catalog_error = Some(e.to_string());
            NavigationResult::GoTo("catalog-retry")
        }
    }
}

fn confidence_marker(ctx: &Context, field: FieldKey) -> &'static str {
    match ctx.record.confidence.get(&field) {
        Some(c) if *c >= 0.8 => "",
        Some(_) => "  (low confidence)",
        None => "",
    }
}

// ─── summary ────────────────────────────────────────────────────────

struct SummaryPage;

#[async_trait]
impl PageHandler for SummaryPage {
    fn render(&self, _services: &Services, ctx: &Context) -> Vec<String> {
        let doc = &ctx.document;
        let mut lines = vec![
            format!(
                "File: {}  [{}]",
                doc.source_path.display(),
                &doc.content_hash[..12.min(doc.content_hash.len())]
            ),
            format!(
                "Language: {}",
                doc.language.as_deref().unwrap_or("unknown")
            ),
            String::new(),
        ];
        for field in field_groups(ctx.record.doc_type) {
            let value = ctx.record.display_value(*field);
            let value = if value.is_empty() { "—".to_string() } else { value };
            lines.push(format!(
                "  {:<14} {}{}",
                format!("{}:", field),
                value,
                confidence_marker(ctx, *field)
            ));
        }
        lines.push(format!(
            "  {:<14} {}",
            "type:", ctx.record.doc_type
        ));
        let unresolved = ctx.record.unresolved_conflicts().count();
        if unresolved > 0 {
            lines.push(String::new());
            lines.push(format!(
                "{} unresolved conflict(s) — continue to resolve them.",
                unresolved
            ));
        }
        lines
    }

    async fn handle(
        &self,
        services: &Services,
        ctx: &mut Context,
        input: &str,
    ) -> anyhow::Result<NavigationResult> {
        match input {
            "e" => Ok(NavigationResult::GoTo("edit")),
            "t" => Ok(NavigationResult::GoTo("doc-type")),
            "s" => {
                ctx.outcome = Some(Outcome::Skip);
                Ok(NavigationResult::Complete)
            }
            _ => {
                if ctx.record.has_unresolved_conflicts() {
                    return Ok(NavigationResult::GoTo("conflict"));
                }
                if ctx.record.doc_type == DocType::Unknown {
                    return Ok(NavigationResult::GoTo("doc-type"));
                }
                ctx.query = SearchQuery::from_record(&ctx.record);
                Ok(run_search(services, ctx).await)
            }
        }
    }
}

// ─── conflict resolution ────────────────────────────────────────────

fn next_conflict(ctx: &Context) -> Option<(FieldKey, Vec<String>)> {
    ctx.record
        .unresolved_conflicts()
        .next()
        .map(|c| (c.field, c.candidates.clone()))
}

struct ConflictPage;

#[async_trait]
impl PageHandler for ConflictPage {
    fn render(&self, _services: &Services, ctx: &Context) -> Vec<String> {
        match next_conflict(ctx) {
            Some((field, candidates)) => {
                let mut lines = vec![format!("Sources disagree on {}:", field)];
                for (i, candidate) in candidates.iter().take(9).enumerate() {
                    let shown = if candidate.is_empty() {
                        "(empty)"
                    } else {
                        candidate.as_str()
                    };
                    lines.push(format!("  [{}] {}", i + 1, shown));
                }
                lines
            }
            None => vec!["No conflicts left.".to_string()],
        }
    }

    async fn handle(
        &self,
        _services: &Services,
        ctx: &mut Context,
        input: &str,
    ) -> anyhow::Result<NavigationResult> {
        let Some((field, candidates)) = next_conflict(ctx) else {
            return Ok(NavigationResult::GoTo("summary"));
        };

        if input == "m" {
            ctx.active_field = Some(field);
            return Ok(NavigationResult::GoTo("conflict-entry"));
        }

        let index: usize = input.parse().unwrap_or(0);
        match candidates.get(index.wrapping_sub(1)) {
            Some(value) => {
                let value = value.clone();
                ctx.record.resolve(field, &value);
                if ctx.record.has_unresolved_conflicts() {
                    Ok(NavigationResult::GoTo("conflict"))
                } else {
                    Ok(NavigationResult::GoTo("summary"))
                }
            }
            None => Ok(NavigationResult::GoTo("conflict")),
        }
    }
}

struct ConflictEntryPage;

#[async_trait]
impl PageHandler for ConflictEntryPage {
    fn render(&self, _services: &Services, ctx: &Context) -> Vec<String> {
        match ctx.active_field {
            Some(field) => vec![format!("Enter a value for {}.", field)],
            None => Vec::new(),
        }
    }

    async fn handle(
        &self,
        _services: &Services,
        ctx: &mut Context,
        input: &str,
    ) -> anyhow::Result<NavigationResult> {
        let Some(field) = ctx.active_field.take() else {
            return Ok(NavigationResult::GoTo("summary"));
        };
        ctx.record.resolve(field, input);
        if ctx.record.has_unresolved_conflicts() {
            Ok(NavigationResult::GoTo("conflict"))
        } else {
            Ok(NavigationResult::GoTo("summary"))
        }
    }
}

// ─── document type ──────────────────────────────────────────────────

struct DocTypePage;

#[async_trait]
impl PageHandler for DocTypePage {
    fn render(&self, _services: &Services, _ctx: &Context) -> Vec<String> {
        DocType::ALL
            .iter()
            .enumerate()
            .map(|(i, t)| format!("  [{}] {}", i + 1, t))
            .collect()
    }

    async fn handle(
        &self,
        _services: &Services,
        ctx: &mut Context,
        input: &str,
    ) -> anyhow::Result<NavigationResult> {
        let index: usize = input.parse().unwrap_or(0);
        if let Some(doc_type) = DocType::ALL.get(index.wrapping_sub(1)) {
            let name = doc_type.to_string();
            ctx.record.resolve(FieldKey::DocType, &name);
        }
        Ok(NavigationResult::GoTo("summary"))
    }
}

// ─── field editor ───────────────────────────────────────────────────

struct EditPage;

#[async_trait]
impl PageHandler for EditPage {
    fn render(&self, _services: &Services, ctx: &Context) -> Vec<String> {
        EDITABLE
            .iter()
            .enumerate()
            .map(|(i, field)| {
                let value = ctx.record.display_value(*field);
                let value = if value.is_empty() { "—".to_string() } else { value };
                format!("  [{}] {:<14} {}", i + 1, format!("{}:", field), value)
            })
            .collect()
    }

    async fn handle(
        &self,
        _services: &Services,
        ctx: &mut Context,
        input: &str,
    ) -> anyhow::Result<NavigationResult> {
        if input == "d" {
            return Ok(NavigationResult::ReturnToCaller);
        }
        let index: usize = input.parse().unwrap_or(0);
        match EDITABLE.get(index.wrapping_sub(1)) {
            Some(field) => {
                ctx.active_field = Some(*field);
                Ok(NavigationResult::GoTo("edit-value"))
            }
            None => Ok(NavigationResult::GoTo("edit")),
        }
    }
}

struct EditValuePage;

#[async_trait]
impl PageHandler for EditValuePage {
    fn render(&self, _services: &Services, ctx: &Context) -> Vec<String> {
        match ctx.active_field {
            Some(field) => vec![format!(
                "{}: {}",
                field,
                ctx.record.display_value(field)
            )],
            None => Vec::new(),
        }
    }

    async fn handle(
        &self,
        _services: &Services,
        ctx: &mut Context,
        input: &str,
    ) -> anyhow::Result<NavigationResult> {
        if let Some(field) = ctx.active_field.take() {
            ctx.record.apply_edit(field, input);
            ctx.edits.push(field);
        }
        Ok(NavigationResult::ReturnToCaller)
    }
}

// ─── catalog matching ───────────────────────────────────────────────

struct MatchPage;

fn candidate_line(index: usize, candidate: &MatchCandidate) -> String {
    let fields = &candidate.entry.fields;
    let attachment = if candidate.entry.has_attachment {
        "  [has file]"
    } else {
        ""
    };
    format!(
        "  [{}] {:.2}  {} ({}) — {}{}",
        index + 1,
        candidate.score,
        fields.title.as_deref().unwrap_or("untitled"),
        fields
            .year
            .map(|y| y.to_string())
            .unwrap_or_else(|| "n.d.".to_string()),
        fields.authors.join("; "),
        attachment
    )
}

#[async_trait]
impl PageHandler for MatchPage {
    fn render(&self, _services: &Services, ctx: &Context) -> Vec<String> {
        ctx.candidates
            .iter()
            .take(9)
            .enumerate()
            .map(|(i, c)| candidate_line(i, c))
            .collect()
    }

    async fn handle(
        &self,
        _services: &Services,
        ctx: &mut Context,
        input: &str,
    ) -> anyhow::Result<NavigationResult> {
        match input {
            "r" => Ok(NavigationResult::GoTo("rescan")),
            "n" => Ok(NavigationResult::GoTo("no-match")),
            _ => {
                let index: usize = input.parse().unwrap_or(0);
                match ctx.candidates.get(index.wrapping_sub(1)) {
                    Some(candidate) => {
                        ctx.selection = Some(candidate.clone());
                        Ok(NavigationResult::GoTo("confirm"))
                    }
                    None => Ok(NavigationResult::GoTo("match")),
                }
            }
        }
    }
}

struct RescanPage;

#[async_trait]
impl PageHandler for RescanPage {
    fn render(&self, _services: &Services, ctx: &Context) -> Vec<String> {
        vec![format!(
            "Current: {} | {} | {}",
            ctx.query.authors.join("; "),
            ctx.query
                .year
                .map(|y| y.to_string())
                .unwrap_or_default(),
            ctx.query.title.as_deref().unwrap_or("")
        )]
    }

    async fn handle(
        &self,
        services: &Services,
        ctx: &mut Context,
        input: &str,
    ) -> anyhow::Result<NavigationResult> {
        if !input.trim().is_empty() {
            let mut parts = input.splitn(3, '|');
            let authors = parts.next().unwrap_or("").trim();
            let year = parts.next().map(str::trim);
            let title = parts.next().unwrap_or("").trim();

            if !authors.is_empty() {
                ctx.query.authors = authors
                    .split(';')
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty())
                    .collect();
            }
            match year {
                // An explicit empty segment clears the year constraint.
                Some("") => ctx.query.year = None,
                Some(y) => {
                    if let Ok(parsed) = y.parse::<i32>() {
                        ctx.query.year = Some(parsed);
                    }
                }
                None => {}
            }
            if !title.is_empty() {
                ctx.query.title = Some(title.to_string());
            }
        }
        Ok(run_search(services, ctx).await)
    }
}

struct NoMatchPage;

#[async_trait]
impl PageHandler for NoMatchPage {
    fn render(&self, _services: &Services, _ctx: &Context) -> Vec<String> {
        vec!["No catalog entry matched this document.".to_string()]
    }

    async fn handle(
        &self,
        services: &Services,
        ctx: &mut Context,
        input: &str,
    ) -> anyhow::Result<NavigationResult> {
        match input {
            "r" => Ok(NavigationResult::GoTo("rescan")),
            "m" => Ok(NavigationResult::Quit),
            _ => match services.catalog.create(&ctx.record).await {
                Ok(key) => {
                    ctx.selection = Some(MatchCandidate {
                        entry: CatalogEntry {
                            key,
                            fields: ctx.record.as_field_set(),
                            added_at: Utc::now(),
                            has_attachment: false,
                        },
                        score: 1.0,
                    });
                    Ok(NavigationResult::GoTo("confirm"))
                }
                Err(e) => {
                    ctx.catalog_error = Some(e.to_string());
                    Ok(NavigationResult::GoTo("catalog-retry"))
                }
            },
        }
    }
}

struct ConfirmPage;

#[async_trait]
impl PageHandler for ConfirmPage {
    fn render(&self, services: &Services, ctx: &Context) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(selection) = &ctx.selection {
            lines.push(format!(
                "Catalog entry: {} ({:.2})",
                selection.entry.key, selection.score
            ));
        }
        let destination = services
            .lifecycle
            .destination_for(&ctx.document, &ctx.record);
        lines.push(format!("Archive to:    {}", destination.display()));
        lines
    }

    async fn handle(
        &self,
        _services: &Services,
        ctx: &mut Context,
        input: &str,
    ) -> anyhow::Result<NavigationResult> {
        if input == "n" {
            ctx.selection = None;
            if ctx.candidates.is_empty() {
                Ok(NavigationResult::GoTo("no-match"))
            } else {
                Ok(NavigationResult::GoTo("match"))
            }
        } else {
            Ok(NavigationResult::GoTo("note"))
        }
    }
}

struct NotePage;

#[async_trait]
impl PageHandler for NotePage {
    fn render(&self, _services: &Services, _ctx: &Context) -> Vec<String> {
        Vec::new()
    }

    async fn handle(
        &self,
        _services: &Services,
        ctx: &mut Context,
        input: &str,
    ) -> anyhow::Result<NavigationResult> {
        let trimmed = input.trim();
        if !trimmed.is_empty() {
            ctx.note = Some(trimmed.to_string());
        }
        ctx.outcome = Some(Outcome::Archive);
        Ok(NavigationResult::Complete)
    }
}

// ─── failure surfaces ───────────────────────────────────────────────

struct CatalogRetryPage;

#[async_trait]
impl PageHandler for CatalogRetryPage {
    fn render(&self, services: &Services, ctx: &Context) -> Vec<String> {
        vec![
            format!(
                "Catalog error: {}",
                ctx.catalog_error.as_deref().unwrap_or("unknown")
            ),
            format!(
                "Retries used: {}/{}",
                ctx.catalog_retries, services.config.catalog.retry_budget
            ),
        ]
    }

    async fn handle(
        &self,
        services: &Services,
        ctx: &mut Context,
        input: &str,
    ) -> anyhow::Result<NavigationResult> {
        if input == "m" {
            return Ok(NavigationResult::Quit);
        }
        ctx.catalog_retries += 1;
        if ctx.catalog_retries > services.config.catalog.retry_budget {
            return Ok(NavigationResult::Quit);
        }
        Ok(run_search(services, ctx).await)
    }
}

/// Shared shape for the guided manual-entry pages used when extraction
/// produced nothing usable.
struct ManualFieldPage {
    field: FieldKey,
    next: &'static str,
}

#[async_trait]
impl PageHandler for ManualFieldPage {
    fn render(&self, _services: &Services, ctx: &Context) -> Vec<String> {
        vec![format!(
            "File: {}",
            ctx.document.source_path.display()
        )]
    }

    async fn handle(
        &self,
        _services: &Services,
        ctx: &mut Context,
        input: &str,
    ) -> anyhow::Result<NavigationResult> {
        ctx.record.apply_edit(self.field, input);
        Ok(NavigationResult::GoTo(self.next))
    }
}

struct ManualDocTypePage;

#[async_trait]
impl PageHandler for ManualDocTypePage {
    fn render(&self, _services: &Services, _ctx: &Context) -> Vec<String> {
        DocType::ALL
            .iter()
            .enumerate()
            .map(|(i, t)| format!("  [{}] {}", i + 1, t))
            .collect()
    }

    async fn handle(
        &self,
        _services: &Services,
        ctx: &mut Context,
        input: &str,
    ) -> anyhow::Result<NavigationResult> {
        let index: usize = input.parse().unwrap_or(0);
        if let Some(doc_type) = DocType::ALL.get(index.wrapping_sub(1)) {
            let name = doc_type.to_string();
            ctx.record.apply_edit(FieldKey::DocType, &name);
        }
        Ok(NavigationResult::GoTo("summary"))
    }
}

struct TransferErrorPage;

#[async_trait]
impl PageHandler for TransferErrorPage {
    fn render(&self, _services: &Services, ctx: &Context) -> Vec<String> {
        vec![format!(
            "{}",
            ctx.transfer_error
                .as_deref()
                .unwrap_or("transfer failed for an unknown reason")
        )]
    }

    async fn handle(
        &self,
        _services: &Services,
        ctx: &mut Context,
        input: &str,
    ) -> anyhow::Result<NavigationResult> {
        if input == "r" {
            ctx.replace_existing = true;
            Ok(NavigationResult::Complete)
        } else {
            Ok(NavigationResult::Quit)
        }
    }
}
