//! # Paperdock
//!
//! A watched-inbox ingestion pipeline for scanned documents. Paperdock
//! watches an inbox directory for new scans, extracts bibliographic
//! metadata from several untrusted sources, reconciles their answers,
//! matches the document against a personal reference catalog, and files
//! the verified copy into an archive tree — with a human on the loop for
//! every decision the machine cannot make safely.
//!
//! ## Pipeline
//!
//! ```text
//! ┌─────────┐   ┌────────────┐   ┌───────────┐   ┌────────────┐
//! │  Inbox  │──▶│ Extraction │──▶│ Reconcile │──▶│ Interactive │
//! │ (watch) │   │  sources   │   │ + conflict│   │   review    │
//! └─────────┘   └────────────┘   └───────────┘   └─────┬──────┘
//!                                                      │
//!                              ┌───────────────────────┤
//!                              ▼                       ▼
//!                        ┌──────────┐           ┌────────────┐
//!                        │ Catalog  │           │  Verified  │
//!                        │  match   │           │  archive   │
//!                        └──────────┘           └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Documents, field sets, reconciled records, catalog entries |
//! | [`error`] | Error taxonomy per collaborator |
//! | [`watch`] | Polling inbox scanner and single-instance guard |
//! | [`extract`] | Extraction commands and the built-in identifier scan |
//! | [`reconcile`] | Field-by-field merge with conflict annotation |
//! | [`matcher`] | Client-side scoring of catalog candidates |
//! | [`catalog`] | Catalog service trait and HTTP client |
//! | [`bridge`] | Filesystem access, native or via helper process |
//! | [`lifecycle`] | Verified copies and terminal-directory settlement |
//! | [`nav`] | Page-based interactive navigation engine |
//! | [`pages`] | The concrete review flow |
//! | [`orchestrator`] | End-to-end per-document driver and the daemon loop |

pub mod bridge;
pub mod catalog;
pub mod config;
pub mod error;
pub mod extract;
pub mod lifecycle;
pub mod matcher;
pub mod models;
pub mod nav;
pub mod orchestrator;
pub mod pages;
pub mod reconcile;
pub mod watch;
