//! Remote store abstraction.
//!
//! The [`RemoteStore`] trait is the thin contract the pipeline needs from a
//! hosted image service: upload one file under a logical identifier, list a
//! prefix page by page, and bulk-delete. Implementations perform exactly one
//! logical operation per call and never retry on their own; callers apply the
//! retry and pacing policy.
//!
//! ```text
//! ┌────────────┐   upload / list_page / delete   ┌──────────────────┐
//! │  pipeline  │ ──────────────────────────────▶ │ CloudinaryStore  │
//! │            │                                 │ InMemoryStore    │
//! └────────────┘                                 └──────────────────┘
//! ```
//!
//! Implementations must be `Send + Sync` so uploads can run concurrently
//! within a batch.

pub mod cloudinary;
pub mod memory;

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

use crate::models::{LogicalIdentifier, RemoteAsset};

/// Failure of a single remote operation.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("rate limited by remote store (HTTP {status}): {message}")]
    RateLimited { status: u16, message: String },
    #[error("remote store server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },
    #[error("remote store rejected the request (HTTP {status}): {message}")]
    Client { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response from remote store: {0}")]
    InvalidResponse(String),
    #[error("listing of '{prefix}' is incomplete: {reason}")]
    IncompleteListing { prefix: String, reason: String },
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl RemoteError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::RateLimited { .. } | RemoteError::Server { .. } | RemoteError::Transport(_)
        )
    }
}

/// Result of a successful upload call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The content was stored under `remote_id`.
    Uploaded { remote_id: LogicalIdentifier },
    /// Non-overwriting upload of an identifier that already exists.
    AlreadyPresent,
}

/// One page of a prefix listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub assets: Vec<RemoteAsset>,
    /// Continuation cursor; `None` once the listing is exhausted.
    pub next_cursor: Option<String>,
}

/// The hosted image API as seen by the pipeline.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Short name for logs (e.g. `"cloudinary:my-cloud"`).
    fn name(&self) -> &str;

    /// Upload the file at `local` under `id`.
    ///
    /// With `overwrite = false`, an existing identifier yields
    /// [`UploadOutcome::AlreadyPresent`] rather than an error.
    async fn upload(
        &self,
        local: &Path,
        id: &LogicalIdentifier,
        overwrite: bool,
    ) -> Result<UploadOutcome, RemoteError>;

    /// Fetch one page of assets whose identifier starts with `prefix`.
    async fn list_page(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<ListPage, RemoteError>;

    /// Delete the given identifiers. Unknown identifiers are not an error.
    /// Returns how many were actually deleted.
    async fn delete_by_ids(&self, ids: &[LogicalIdentifier]) -> Result<u64, RemoteError>;

    /// Delete everything under `prefix`. An empty prefix match is not an error.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, RemoteError>;
}

/// Drain every page of a prefix listing.
///
/// The listing is complete only once the store stops returning a cursor. A
/// cursor that repeats is reported as [`RemoteError::IncompleteListing`]
/// instead of being followed forever, and any page error aborts the drain so
/// a partial set is never mistaken for the full one.
pub async fn list_all(
    store: &dyn RemoteStore,
    prefix: &str,
    page_size: u32,
) -> Result<Vec<RemoteAsset>, RemoteError> {
    let mut assets = Vec::new();
    let mut cursor: Option<String> = None;
    let mut seen_cursors = HashSet::new();

    loop {
        let page = store
            .list_page(prefix, cursor.as_deref(), page_size)
            .await
            .map_err(|e| match e {
                RemoteError::IncompleteListing { .. } => e,
                other if cursor.is_some() => RemoteError::IncompleteListing {
                    prefix: prefix.to_string(),
                    reason: format!("page after {} assets failed: {}", assets.len(), other),
                },
                other => other,
            })?;

        assets.extend(page.assets);

        match page.next_cursor {
            Some(next) if !next.is_empty() => {
                if !seen_cursors.insert(next.clone()) {
                    return Err(RemoteError::IncompleteListing {
                        prefix: prefix.to_string(),
                        reason: format!("cursor '{}' returned twice", next),
                    });
                }
                cursor = Some(next);
            }
            _ => break,
        }
    }

    Ok(assets)
}

/// Convenience: the identifier set under `prefix`.
pub async fn list_ids(
    store: &dyn RemoteStore,
    prefix: &str,
    page_size: u32,
) -> Result<Vec<LogicalIdentifier>, RemoteError> {
    Ok(list_all(store, prefix, page_size)
        .await?
        .into_iter()
        .map(|a| a.id)
        .collect())
}
