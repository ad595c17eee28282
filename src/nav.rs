//! Generic page-based interactive navigation engine.
//!
//! A flow is a table of immutable [`Page`] definitions. The engine loops:
//! render the current page, read one line of operator input, dispatch to
//! the page handler, and follow the returned [`NavigationResult`]. All
//! mutation happens in the per-document [`Context`]; pages never hold
//! state. Every transition is a table lookup, not a branch buried in a
//! loop.
//!
//! Reserved tokens are uniform across every page and intercepted before
//! page dispatch, free-text pages included: quit ends the flow
//! immediately, back pops the navigation history, restart clears history
//! and edits while keeping the original extracted field sets.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::catalog::CatalogService;
use crate::config::Config;
use crate::error::NavError;
use crate::lifecycle::FileLifecycleManager;
use crate::models::{
    Document, FieldKey, FieldSet, MatchCandidate, ReconciledRecord, SearchQuery,
};
use crate::reconcile;

/// Universal quit: honored on every page, overriding page validation.
pub const QUIT_TOKEN: &str = "q";
/// Pop the navigation history.
pub const BACK_TOKEN: &str = "<";
/// Clear history and edits, keep the extracted field sets, start over.
pub const RESTART_TOKEN: &str = "^";

/// Fail-safe cap on page hops per document, guarding against handler bugs
/// creating cycles.
pub const MAX_HOPS: usize = 50;

/// Outcome of handling one page's input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationResult {
    GoTo(&'static str),
    /// Pop the history stack and resume there; ends the flow when the
    /// stack is empty.
    ReturnToCaller,
    Quit,
    Complete,
}

/// What the flow decided should happen to the document. Read by the
/// orchestrator after a `Complete` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Archive,
    Skip,
}

/// Collaborators available to page handlers.
pub struct Services {
    pub config: Config,
    pub catalog: Arc<dyn CatalogService>,
    pub lifecycle: FileLifecycleManager,
}

/// Per-document mutable state threaded through the whole flow. Owned
/// exclusively by the orchestrator for the lifetime of one document's
/// processing; never shared across documents.
pub struct Context {
    pub document: Document,
    /// Original extracted field sets; survive a restart.
    pub sources: Vec<FieldSet>,
    pub record: ReconciledRecord,
    pub query: SearchQuery,
    pub candidates: Vec<MatchCandidate>,
    pub selection: Option<MatchCandidate>,
    /// Fields touched by the interactive editor.
    pub edits: Vec<FieldKey>,
    pub note: Option<String>,
    pub outcome: Option<Outcome>,
    /// Stack of visited page ids, for back navigation.
    pub history: Vec<&'static str>,
    /// Field currently being edited or resolved.
    pub active_field: Option<FieldKey>,
    pub catalog_retries: u32,
    pub replace_existing: bool,
    /// Human-readable description of the last transfer failure, shown on
    /// the transfer-error page.
    pub transfer_error: Option<String>,
    /// Last catalog failure, shown on the retry page.
    pub catalog_error: Option<String>,
}

impl Context {
    pub fn new(document: Document, sources: Vec<FieldSet>) -> Self {
        let record = reconcile::reconcile(&sources);
        let query = SearchQuery::from_record(&record);
        Self {
            document,
            sources,
            record,
            query,
            candidates: Vec::new(),
            selection: None,
            edits: Vec::new(),
            note: None,
            outcome: None,
            history: Vec::new(),
            active_field: None,
            catalog_retries: 0,
            replace_existing: false,
            transfer_error: None,
            catalog_error: None,
        }
    }

    /// Restart: drop history, edits, and selections; recompute the record
    /// from the original field sets.
    pub fn restart(&mut self) {
        self.record = reconcile::reconcile(&self.sources);
        self.query = SearchQuery::from_record(&self.record);
        self.candidates.clear();
        self.selection = None;
        self.edits.clear();
        self.note = None;
        self.outcome = None;
        self.history.clear();
        self.active_field = None;
        self.replace_existing = false;
        self.transfer_error = None;
        self.catalog_error = None;
    }
}

/// What kind of input a page accepts.
#[derive(Debug, Clone)]
pub enum InputSpec {
    /// A fixed token set, with an optional default substituted for empty
    /// input.
    Tokens {
        accepted: &'static [&'static str],
        default: Option<&'static str>,
    },
    /// Arbitrary one-line text, handed to the handler as-is.
    FreeText,
}

/// Handles input for one page and renders its body.
#[async_trait]
pub trait PageHandler: Send + Sync {
    /// Lines to print above the prompt. Pure display of Context.
    fn render(&self, services: &Services, ctx: &Context) -> Vec<String>;

    /// Handle one accepted input token (or free-text line).
    async fn handle(
        &self,
        services: &Services,
        ctx: &mut Context,
        input: &str,
    ) -> anyhow::Result<NavigationResult>;
}

/// One navigation unit: immutable definition, all state in [`Context`].
pub struct Page {
    pub id: &'static str,
    pub title: &'static str,
    pub prompt: &'static str,
    pub input: InputSpec,
    /// Fallback back-target for pages reachable with an empty history.
    pub back: Option<&'static str>,
    pub handler: Box<dyn PageHandler>,
}

/// One line of operator input. Implementations block until input is
/// available; `None` means end of input and is treated as quit.
#[async_trait]
pub trait InputSource: Send {
    async fn read_line(&mut self, prompt: &str) -> anyhow::Result<Option<String>>;
}

/// Reads operator input from stdin.
pub struct StdinInput {
    lines: tokio::io::Lines<tokio::io::BufReader<tokio::io::Stdin>>,
}

impl StdinInput {
    pub fn new() -> Self {
        use tokio::io::AsyncBufReadExt;
        Self {
            lines: tokio::io::BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for StdinInput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InputSource for StdinInput {
    async fn read_line(&mut self, prompt: &str) -> anyhow::Result<Option<String>> {
        use std::io::Write;
        print!("{} ", prompt);
        std::io::stdout().flush()?;
        Ok(self.lines.next_line().await?)
    }
}

/// Scripted input for tests and non-interactive runs.
pub struct ScriptedInput {
    queue: std::collections::VecDeque<String>,
}

impl ScriptedInput {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue: lines.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl InputSource for ScriptedInput {
    async fn read_line(&mut self, _prompt: &str) -> anyhow::Result<Option<String>> {
        Ok(self.queue.pop_front())
    }
}

/// The page table plus the run loop.
pub struct NavigationEngine {
    pages: HashMap<&'static str, Page>,
    max_hops: usize,
}

impl NavigationEngine {
    pub fn new(pages: Vec<Page>) -> Self {
        let mut map = HashMap::new();
        for page in pages {
            if let InputSpec::Tokens { accepted, .. } = &page.input {
                for reserved in [QUIT_TOKEN, BACK_TOKEN, RESTART_TOKEN] {
                    debug_assert!(
                        !accepted.contains(&reserved),
                        "page `{}` declares reserved token `{}`",
                        page.id,
                        reserved
                    );
                }
            }
            map.insert(page.id, page);
        }
        Self {
            pages: map,
            max_hops: MAX_HOPS,
        }
    }

    #[cfg(test)]
    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn page(&self, id: &str) -> Option<&Page> {
        self.pages.get(id)
    }

    /// Run the flow from `start` until a terminal result.
    ///
    /// Invalid input re-prompts without mutating Context. An unmapped page
    /// id is a programming error and aborts the flow for this document.
    pub async fn run(
        &self,
        start: &'static str,
        services: &Services,
        ctx: &mut Context,
        input: &mut dyn InputSource,
    ) -> Result<NavigationResult, NavError> {
        let mut current: &'static str = start;
        let mut hops = 0usize;

        loop {
            hops += 1;
            if hops > self.max_hops {
                return Err(NavError::NavigationLoop {
                    page: current.to_string(),
                    max_hops: self.max_hops,
                });
            }

            let page = self
                .pages
                .get(current)
                .ok_or_else(|| NavError::UnknownPage(current.to_string()))?;

            println!();
            println!("── {} ──", page.title);
            for line in page.handler.render(services, ctx) {
                println!("{}", line);
            }

            let token = match self.read_token(page, input).await? {
                Token::Quit => return Ok(NavigationResult::Quit),
                Token::Restart => {
                    debug!(page = current, "flow restarted");
                    ctx.restart();
                    current = start;
                    continue;
                }
                Token::Back => {
                    match ctx.history.pop().or(page.back) {
                        Some(prev) => current = prev,
                        // Nowhere to go back to; re-show the page.
                        None => {}
                    }
                    continue;
                }
                Token::Input(t) => t,
            };

            ctx.history.push(current);
            let result = page
                .handler
                .handle(services, ctx, &token)
                .await
                .map_err(|source| NavError::Handler {
                    page: current.to_string(),
                    source,
                })?;

            match result {
                NavigationResult::GoTo(next) => {
                    current = next;
                }
                NavigationResult::ReturnToCaller => {
                    // The page we just left is on top of the stack; the
                    // caller is underneath it.
                    ctx.history.pop();
                    match ctx.history.pop() {
                        Some(prev) => current = prev,
                        None => return Ok(NavigationResult::ReturnToCaller),
                    }
                }
                terminal @ (NavigationResult::Quit | NavigationResult::Complete) => {
                    return Ok(terminal);
                }
            }
        }
    }

    /// Read one input token for a page, applying reserved-token handling,
    /// default substitution, and token-set validation. Re-prompts until
    /// the input is acceptable.
    async fn read_token(
        &self,
        page: &Page,
        input: &mut dyn InputSource,
    ) -> Result<Token, NavError> {
        loop {
            let line = input
                .read_line(page.prompt)
                .await
                .map_err(|source| NavError::Handler {
                    page: page.id.to_string(),
                    source,
                })?;

            let line = match line {
                // EOF: treat as quit so the document lands in manual
                // review instead of hanging or failing.
                None => return Ok(Token::Quit),
                Some(l) => l,
            };
            let trimmed = line.trim();

            match trimmed {
                QUIT_TOKEN => return Ok(Token::Quit),
                RESTART_TOKEN => return Ok(Token::Restart),
                BACK_TOKEN => return Ok(Token::Back),
                _ => {}
            }

            match &page.input {
                InputSpec::FreeText => return Ok(Token::Input(trimmed.to_string())),
                InputSpec::Tokens { accepted, default } => {
                    if trimmed.is_empty() {
                        if let Some(d) = default {
                            return Ok(Token::Input((*d).to_string()));
                        }
                        println!("Please choose one of: {}", accepted.join(", "));
                        continue;
                    }
                    if accepted.contains(&trimmed) {
                        return Ok(Token::Input(trimmed.to_string()));
                    }
                    println!(
                        "Unrecognized input `{}`. Choose one of: {} (or {} to quit)",
                        trimmed,
                        accepted.join(", "),
                        QUIT_TOKEN
                    );
                }
            }
        }
    }
}

enum Token {
    Input(String),
    Quit,
    Back,
    Restart,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NativeBridge;
    use crate::config;
    use crate::error::CatalogError;
    use crate::models::{CatalogEntry, DocState};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct NullCatalog;

    #[async_trait]
    impl CatalogService for NullCatalog {
        async fn search(&self, _q: &SearchQuery) -> Result<Vec<CatalogEntry>, CatalogError> {
            Ok(Vec::new())
        }
        async fn create(&self, _r: &ReconciledRecord) -> Result<String, CatalogError> {
            Ok("k".to_string())
        }
        async fn attachments(&self, _k: &str) -> Result<Vec<String>, CatalogError> {
            Ok(Vec::new())
        }
        async fn attach(
            &self,
            _k: &str,
            _f: &Path,
            _r: bool,
        ) -> Result<crate::catalog::AttachResult, CatalogError> {
            Ok(crate::catalog::AttachResult::Attached)
        }
    }

    fn test_services(tmp: &TempDir) -> Services {
        let cfg: config::Config = toml::from_str(&format!(
            r#"[watch]
root = "{root}/inbox"

[archive]
root = "{root}/archive"

[catalog]
base_url = "http://localhost:1"
"#,
            root = tmp.path().display()
        ))
        .unwrap();
        let lifecycle = FileLifecycleManager::new(
            Arc::new(NativeBridge),
            cfg.watch.root.clone(),
            cfg.archive.root.clone(),
            false,
        );
        Services {
            config: cfg,
            catalog: Arc::new(NullCatalog),
            lifecycle,
        }
    }

    fn test_ctx() -> Context {
        let document = Document {
            id: "d".to_string(),
            source_path: "inbox/a.pdf".into(),
            content_hash: "abcdef012345".to_string(),
            language: None,
            state: DocState::InteractiveReview,
        };
        Context::new(document, Vec::new())
    }

    struct StaticPage {
        next: NavigationResult,
        hits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PageHandler for StaticPage {
        fn render(&self, _s: &Services, _c: &Context) -> Vec<String> {
            Vec::new()
        }
        async fn handle(
            &self,
            _s: &Services,
            _c: &mut Context,
            _input: &str,
        ) -> anyhow::Result<NavigationResult> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(self.next.clone())
        }
    }

    fn page(id: &'static str, next: NavigationResult, hits: Arc<AtomicUsize>) -> Page {
        Page {
            id,
            title: id,
            prompt: ">",
            input: InputSpec::Tokens {
                accepted: &["y", "n"],
                default: Some("y"),
            },
            back: None,
            handler: Box::new(StaticPage { next, hits }),
        }
    }

    #[tokio::test]
    async fn test_rejects_unknown_token_then_accepts() {
        let tmp = TempDir::new().unwrap();
        let services = test_services(&tmp);
        let hits = Arc::new(AtomicUsize::new(0));
        let engine = NavigationEngine::new(vec![page(
            "only",
            NavigationResult::Complete,
            hits.clone(),
        )]);
        let mut ctx = test_ctx();
        let mut input = ScriptedInput::new(["zzz", "7", "y"]);

        let result = engine
            .run("only", &services, &mut ctx, &mut input)
            .await
            .unwrap();
        assert_eq!(result, NavigationResult::Complete);
        // Handler saw exactly one (valid) token.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_quit_overrides_page_validation() {
        let tmp = TempDir::new().unwrap();
        let services = test_services(&tmp);
        let hits = Arc::new(AtomicUsize::new(0));
        let engine = NavigationEngine::new(vec![page(
            "only",
            NavigationResult::Complete,
            hits.clone(),
        )]);
        let mut ctx = test_ctx();
        let mut input = ScriptedInput::new([QUIT_TOKEN]);

        let result = engine
            .run("only", &services, &mut ctx, &mut input)
            .await
            .unwrap();
        assert_eq!(result, NavigationResult::Quit);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_input_uses_default() {
        let tmp = TempDir::new().unwrap();
        let services = test_services(&tmp);
        let hits = Arc::new(AtomicUsize::new(0));
        let engine = NavigationEngine::new(vec![page(
            "only",
            NavigationResult::Complete,
            hits.clone(),
        )]);
        let mut ctx = test_ctx();
        let mut input = ScriptedInput::new([""]);

        let result = engine
            .run("only", &services, &mut ctx, &mut input)
            .await
            .unwrap();
        assert_eq!(result, NavigationResult::Complete);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_eof_is_quit() {
        let tmp = TempDir::new().unwrap();
        let services = test_services(&tmp);
        let hits = Arc::new(AtomicUsize::new(0));
        let engine = NavigationEngine::new(vec![page(
            "only",
            NavigationResult::Complete,
            hits.clone(),
        )]);
        let mut ctx = test_ctx();
        let mut input = ScriptedInput::new(Vec::<String>::new());

        let result = engine
            .run("only", &services, &mut ctx, &mut input)
            .await
            .unwrap();
        assert_eq!(result, NavigationResult::Quit);
    }

    #[tokio::test]
    async fn test_back_pops_history() {
        let tmp = TempDir::new().unwrap();
        let services = test_services(&tmp);
        let hits_a = Arc::new(AtomicUsize::new(0));
        let hits_b = Arc::new(AtomicUsize::new(0));
        let engine = NavigationEngine::new(vec![
            page("a", NavigationResult::GoTo("b"), hits_a.clone()),
            page("b", NavigationResult::Complete, hits_b.clone()),
        ]);
        let mut ctx = test_ctx();
        // a -> b, back to a, forward again, complete on b.
        let mut input = ScriptedInput::new(["y", BACK_TOKEN, "y", "y"]);

        let result = engine.run("a", &services, &mut ctx, &mut input).await.unwrap();
        assert_eq!(result, NavigationResult::Complete);
        assert_eq!(hits_a.load(Ordering::SeqCst), 2);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_page_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let services = test_services(&tmp);
        let hits = Arc::new(AtomicUsize::new(0));
        let engine = NavigationEngine::new(vec![page(
            "a",
            NavigationResult::GoTo("missing"),
            hits,
        )]);
        let mut ctx = test_ctx();
        let mut input = ScriptedInput::new(["y"]);

        let err = engine
            .run("a", &services, &mut ctx, &mut input)
            .await
            .unwrap_err();
        assert!(matches!(err, NavError::UnknownPage(p) if p == "missing"));
    }

    #[tokio::test]
    async fn test_hop_cap_detects_cycle() {
        let tmp = TempDir::new().unwrap();
        let services = test_services(&tmp);
        let hits = Arc::new(AtomicUsize::new(0));
        let engine = NavigationEngine::new(vec![
            page("a", NavigationResult::GoTo("b"), hits.clone()),
            page("b", NavigationResult::GoTo("a"), hits.clone()),
        ])
        .with_max_hops(10);
        let mut ctx = test_ctx();
        let mut input = ScriptedInput::new(std::iter::repeat("y").take(64).collect::<Vec<_>>());

        let err = engine
            .run("a", &services, &mut ctx, &mut input)
            .await
            .unwrap_err();
        assert!(matches!(err, NavError::NavigationLoop { .. }));
    }

    #[tokio::test]
    async fn test_restart_clears_history_and_edits() {
        let tmp = TempDir::new().unwrap();
        let services = test_services(&tmp);
        let hits = Arc::new(AtomicUsize::new(0));
        let engine = NavigationEngine::new(vec![
            page("a", NavigationResult::GoTo("b"), hits.clone()),
            page("b", NavigationResult::Complete, hits.clone()),
        ]);
        let mut ctx = test_ctx();
        ctx.record.apply_edit(FieldKey::Title, "edited title");
        ctx.edits.push(FieldKey::Title);

        // a -> b, restart (back on a), a -> b, complete.
        let mut input = ScriptedInput::new(["y", RESTART_TOKEN, "y", "y"]);
        let result = engine.run("a", &services, &mut ctx, &mut input).await.unwrap();
        assert_eq!(result, NavigationResult::Complete);
        assert!(ctx.edits.is_empty());
        assert_eq!(ctx.record.title, None);
    }

    #[tokio::test]
    async fn test_return_to_caller_resumes_previous_page() {
        let tmp = TempDir::new().unwrap();
        let services = test_services(&tmp);
        let hits_a = Arc::new(AtomicUsize::new(0));
        let hits_sub = Arc::new(AtomicUsize::new(0));

        struct MenuPage {
            hits: Arc<AtomicUsize>,
        }
        #[async_trait]
        impl PageHandler for MenuPage {
            fn render(&self, _s: &Services, _c: &Context) -> Vec<String> {
                Vec::new()
            }
            async fn handle(
                &self,
                _s: &Services,
                _c: &mut Context,
                input: &str,
            ) -> anyhow::Result<NavigationResult> {
                let n = self.hits.fetch_add(1, Ordering::SeqCst);
                if input == "y" && n == 0 {
                    Ok(NavigationResult::GoTo("sub"))
                } else {
                    Ok(NavigationResult::Complete)
                }
            }
        }

        let engine = NavigationEngine::new(vec![
            Page {
                id: "menu",
                title: "menu",
                prompt: ">",
                input: InputSpec::Tokens {
                    accepted: &["y", "n"],
                    default: None,
                },
                back: None,
                handler: Box::new(MenuPage {
                    hits: hits_a.clone(),
                }),
            },
            page("sub", NavigationResult::ReturnToCaller, hits_sub.clone()),
        ]);
        let mut ctx = test_ctx();
        // menu -> sub -> (return) menu -> complete.
        let mut input = ScriptedInput::new(["y", "y", "n"]);

        let result = engine
            .run("menu", &services, &mut ctx, &mut input)
            .await
            .unwrap();
        assert_eq!(result, NavigationResult::Complete);
        assert_eq!(hits_a.load(Ordering::SeqCst), 2);
        assert_eq!(hits_sub.load(Ordering::SeqCst), 1);
    }
}
