//! # Gallery Sync
//!
//! Keeps photo galleries on a hosted image CDN in step with local folders and
//! emits the static JSON manifests a website renders them from.
//!
//! Each configured gallery is walked, normalized to a size-bounded JPEG,
//! uploaded in small concurrent batches, reconciled against a full remote
//! listing, and finally described by a manifest file listing its remote
//! identifiers in display order.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────────┐   ┌───────────┐   ┌──────────┐
//! │  Scanner │──▶│ Normalizer│──▶│ Remote Store │──▶│ Reconciler│──▶│ Manifest │
//! │ (folders)│   │  (JPEG)   │   │ upload/list  │   │ miss/stale│   │  (JSON)  │
//! └──────────┘   └───────────┘   └──────────────┘   └───────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! gsync galleries                      # show configured galleries
//! gsync sync --dry-run                 # plan without touching anything
//! gsync sync                           # full pipeline
//! gsync sync --sync-only               # only rebuild manifests
//! gsync retry newborn                  # upload just what is missing
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, credentials, validation |
//! | [`models`] | Core data types and identifier derivation |
//! | [`scan`] | Asset scanner |
//! | [`normalize`] | Image normalizer |
//! | [`store`] | Remote store contract and implementations |
//! | [`reconcile`] | Missing/stale set computation |
//! | [`pipeline`] | Stage machine, batching, retry, summaries |
//! | [`manifest`] | Manifest sorting and writing |
//! | [`progress`] | Progress reporting on stderr |
//! | [`report`] | Run summaries on stdout and JSON report files |
//! | [`galleries`] | Gallery listing |

pub mod config;
pub mod galleries;
pub mod manifest;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod progress;
pub mod reconcile;
pub mod report;
pub mod scan;
pub mod store;
