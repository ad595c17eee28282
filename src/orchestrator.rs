//! Drives one document at a time through the full pipeline:
//! extraction, reconciliation, interactive review, verified archival,
//! catalog attachment, and settlement of the original file.
//!
//! Every exit path settles the document into exactly one terminal
//! directory. A collaborator failure routes to `manual-review/` or
//! `failed/` with a reason sidecar; it never crashes the daemon and
//! never leaves the original file outside the inbox tree.

use anyhow::{Context as _, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::catalog::AttachResult;
use crate::config::Config;
use crate::error::{ExtractError, LifecycleError};
use crate::extract::MetadataExtractionService;
use crate::models::{DocState, Document};
use crate::nav::{Context, InputSource, NavigationEngine, NavigationResult, Outcome, Services};
use crate::pages;
use crate::watch::{Detection, InboxWatcher, InstanceGuard};
use crate::{bridge, lifecycle};

pub struct Orchestrator {
    services: Services,
    extractor: Arc<dyn MetadataExtractionService>,
    engine: NavigationEngine,
}

impl Orchestrator {
    pub fn new(config: Config, extractor: Arc<dyn MetadataExtractionService>) -> Self {
        let routed = Arc::new(bridge::RoutedBridge::new(
            config.bridge.helper_command.clone(),
        ));
        let lifecycle = lifecycle::FileLifecycleManager::new(
            routed,
            config.watch.root.clone(),
            config.archive.root.clone(),
            config.archive.year_subdirs,
        );
        let catalog: Arc<dyn crate::catalog::CatalogService> = match crate::catalog::HttpCatalog::new(
            &config.catalog,
        ) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                // Construction only fails on a bad client config; surface
                // every call as unavailable rather than refusing to start.
                warn!(error = %e, "catalog client construction failed");
                Arc::new(DeadCatalog(e.to_string()))
            }
        };
        Self {
            services: Services {
                config,
                catalog,
                lifecycle,
            },
            engine: pages::build_pages(),
            extractor,
        }
    }

    /// Build an orchestrator around explicit collaborators. Used by tests
    /// and by embedders that bring their own catalog or bridge.
    pub fn with_services(services: Services, extractor: Arc<dyn MetadataExtractionService>) -> Self {
        Self {
            services,
            extractor,
            engine: pages::build_pages(),
        }
    }

    /// Process one detected document to a terminal state.
    pub async fn process_document(
        &self,
        mut document: Document,
        input: &mut dyn InputSource,
    ) -> Result<DocState> {
        info!(doc = %document.id, path = %document.source_path.display(), "processing document");

        document.state = DocState::Extracting;
        let (sources, start) = match self.extractor.extract(&document.source_path).await {
            Ok(sets) => (sets, "summary"),
            Err(ExtractError::NoUsableFields) => {
                info!(doc = %document.id, "extraction produced nothing, entering manual entry");
                (Vec::new(), "manual-title")
            }
            Err(e) => {
                error!(doc = %document.id, error = %e, "extraction failed");
                self.services
                    .lifecycle
                    .settle(&mut document, DocState::Failed, Some(&e.to_string()))
                    .await?;
                return Ok(DocState::Failed);
            }
        };

        document.state = DocState::Reconciling;
        if document.language.is_none() {
            document.language = sources.iter().find_map(|s| s.language.clone());
        }
        document.state = DocState::InteractiveReview;

        let mut ctx = Context::new(document, sources);
        let result = self
            .engine
            .run(start, &self.services, &mut ctx, input)
            .await;

        match result {
            Ok(NavigationResult::Complete) => match ctx.outcome {
                Some(Outcome::Archive) => self.finalize(ctx, input).await,
                Some(Outcome::Skip) => {
                    self.services
                        .lifecycle
                        .settle(&mut ctx.document, DocState::Skipped, Some("operator skip"))
                        .await?;
                    Ok(DocState::Skipped)
                }
                // A flow completing without an outcome is a page bug.
                None => self.fail(ctx, "flow completed without an outcome").await,
            },
            Ok(NavigationResult::Quit | NavigationResult::ReturnToCaller) => {
                self.services
                    .lifecycle
                    .settle(
                        &mut ctx.document,
                        DocState::ManualReview,
                        Some("operator quit during review"),
                    )
                    .await?;
                Ok(DocState::ManualReview)
            }
            Ok(NavigationResult::GoTo(_)) => unreachable!("run never returns GoTo"),
            Err(e) => self.fail(ctx, &e.to_string()).await,
        }
    }

    /// Archive, attach, and settle a confirmed document.
    ///
    /// A transfer failure drops into the transfer-error page so the
    /// operator decides between replace-and-retry and manual review.
    async fn finalize(&self, mut ctx: Context, input: &mut dyn InputSource) -> Result<DocState> {
        let report = loop {
            let dst = self
                .services
                .lifecycle
                .destination_for(&ctx.document, &ctx.record);
            match self
                .services
                .lifecycle
                .archive(&ctx.document, &dst, ctx.replace_existing)
                .await
            {
                Ok(report) => break report,
                Err(
                    e @ (LifecycleError::DestinationConflict { .. }
                    | LifecycleError::VerificationFailed { .. }),
                ) => {
                    warn!(doc = %ctx.document.id, error = %e, "transfer failed");
                    ctx.transfer_error = Some(e.to_string());
                    match self
                        .engine
                        .run("transfer-error", &self.services, &mut ctx, input)
                        .await
                    {
                        Ok(NavigationResult::Complete) => continue,
                        Ok(_) => {
                            self.services
                                .lifecycle
                                .settle(
                                    &mut ctx.document,
                                    DocState::ManualReview,
                                    Some(&format!("transfer failed: {}", e)),
                                )
                                .await?;
                            return Ok(DocState::ManualReview);
                        }
                        Err(nav) => return self.fail(ctx, &nav.to_string()).await,
                    }
                }
                Err(e) => return self.fail(ctx, &e.to_string()).await,
            }
        };

        if let Some(selection) = &ctx.selection {
            match self
                .services
                .catalog
                .attach(&selection.entry.key, &report.destination, ctx.replace_existing)
                .await
            {
                Ok(AttachResult::AlreadyAttached) => {
                    info!(doc = %ctx.document.id, key = %selection.entry.key, "already attached");
                }
                Ok(_) => {
                    info!(doc = %ctx.document.id, key = %selection.entry.key, "attached to catalog");
                }
                Err(e) => {
                    // The archive copy is verified and in place; only the
                    // catalog link is missing, so this is manual review,
                    // not failure.
                    warn!(doc = %ctx.document.id, error = %e, "catalog attach failed");
                    self.services
                        .lifecycle
                        .settle(
                            &mut ctx.document,
                            DocState::ManualReview,
                            Some(&format!(
                                "archived to {} but attach failed: {}",
                                report.destination.display(),
                                e
                            )),
                        )
                        .await?;
                    return Ok(DocState::ManualReview);
                }
            }
        }

        ctx.document.state = DocState::Attaching;
        let original = ctx.document.source_path.clone();
        let note = ctx.note.clone();
        self.services
            .lifecycle
            .settle(&mut ctx.document, DocState::Done, note.as_deref())
            .await?;
        println!(
            "Archived {} -> {}",
            original.display(),
            report.destination.display()
        );
        Ok(DocState::Done)
    }

    async fn fail(&self, mut ctx: Context, reason: &str) -> Result<DocState> {
        error!(doc = %ctx.document.id, reason, "document failed");
        let detail = match serde_json::to_string_pretty(&ctx.record) {
            Ok(record) => format!("{}\n\nreconciled record:\n{}", reason, record),
            Err(_) => reason.to_string(),
        };
        self.services
            .lifecycle
            .settle(&mut ctx.document, DocState::Failed, Some(&detail))
            .await?;
        Ok(DocState::Failed)
    }

    /// Process one file directly, without the watcher.
    pub async fn process_path(
        &self,
        path: &std::path::Path,
        input: &mut dyn InputSource,
    ) -> Result<DocState> {
        let hash = bridge::hash_file(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let document = Document {
            id: uuid::Uuid::new_v4().to_string(),
            source_path: path.to_path_buf(),
            content_hash: hash,
            language: None,
            state: DocState::Detected,
        };
        self.process_document(document, input).await
    }

    /// Watch the inbox and process documents as they arrive, one at a time.
    pub async fn run_daemon(&self, input: &mut dyn InputSource) -> Result<()> {
        let _guard = InstanceGuard::acquire(&self.services.config.watch.root)?;
        let watcher = InboxWatcher::new(&self.services.config.watch)?;

        let (tx, mut rx) = mpsc::channel::<Document>(16);
        let watch_task = tokio::spawn(watcher.run(tx));

        while let Some(document) = rx.recv().await {
            // One document at a time: the operator is the bottleneck, and
            // serializing keeps lifecycle moves race-free.
            match self.process_document(document, input).await {
                Ok(state) => info!(state = %state, "document settled"),
                Err(e) => error!(error = %e, "document processing aborted"),
            }
        }

        // The channel only closes when the watcher returned; surface its
        // result instead of discarding it.
        match watch_task.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("watcher task panicked: {}", e)),
        }
    }

    /// Rescan the inbox once and report what would be processed.
    pub fn preview(&self) -> Result<Vec<Detection>> {
        let mut watcher = InboxWatcher::new(&self.services.config.watch)?;
        watcher.scan();
        Ok(watcher.scan())
    }

    /// Whether the archive root is reachable through the configured bridge.
    pub async fn archive_accessible(&self) -> bool {
        self.services.lifecycle.archive_accessible().await
    }
}

/// Stands in when the HTTP client could not be constructed; every call
/// reports the construction error.
struct DeadCatalog(String);

#[async_trait::async_trait]
impl crate::catalog::CatalogService for DeadCatalog {
    async fn search(
        &self,
        _query: &crate::models::SearchQuery,
    ) -> Result<Vec<crate::models::CatalogEntry>, crate::error::CatalogError> {
        Err(crate::error::CatalogError::Unavailable(self.0.clone()))
    }
    async fn create(
        &self,
        _record: &crate::models::ReconciledRecord,
    ) -> Result<String, crate::error::CatalogError> {
        Err(crate::error::CatalogError::Unavailable(self.0.clone()))
    }
    async fn attachments(&self, _key: &str) -> Result<Vec<String>, crate::error::CatalogError> {
        Err(crate::error::CatalogError::Unavailable(self.0.clone()))
    }
    async fn attach(
        &self,
        _key: &str,
        _file: &std::path::Path,
        _replace: bool,
    ) -> Result<AttachResult, crate::error::CatalogError> {
        Err(crate::error::CatalogError::Unavailable(self.0.clone()))
    }
}
