//! Pipeline orchestration.
//!
//! Coordinates the full sync flow for each gallery, one gallery at a time:
//!
//! ```text
//! Idle → Scanning → Normalizing → Uploading → Reconciling → ManifestWriting → Done
//! ```
//!
//! Per-file failures (corrupt images, rejected uploads) are folded into the
//! [`GallerySummary`] and never abort the run. Only configuration-level
//! problems, such as a `required` gallery whose source folder is missing,
//! move a gallery to [`Stage::Failed`] and return an error to the caller.
//!
//! Uploads run in fixed-size concurrent batches: batch N+1 starts only after
//! every upload of batch N has settled. The throttled mode instead sends one
//! upload at a time with a fixed pause between calls. Transient remote errors
//! are retried here, with exponential backoff, never inside the store client.
//!
//! Manifests are always rebuilt from a fresh, complete listing of the
//! gallery's remote folder. If that listing fails, the manifest is left
//! untouched for this run. Nested galleries get one more manifest per
//! sub-folder, cut from the same listing.
//!
//! Stale remote assets are only pruned when every source folder of the
//! gallery was found: an absent folder would otherwise make all of its
//! remote assets look stale.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{Config, Gallery};
use crate::manifest;
use crate::models::{LogicalIdentifier, NormalizeAction, NormalizedImage, SourceImage};
use crate::normalize;
use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::reconcile::{self, Reconciliation};
use crate::scan;
use crate::store::{self, RemoteError, RemoteStore, UploadOutcome};

// ═══════════════════════════════════════════════════════════════════════
// Stage machine
// ═══════════════════════════════════════════════════════════════════════

/// Lifecycle of one gallery within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Idle,
    Scanning,
    Normalizing,
    Uploading,
    Reconciling,
    ManifestWriting,
    Done,
    Failed,
}

impl Stage {
    fn ordinal(self) -> u8 {
        self as u8
    }

    /// Stages only move forward (skipping is allowed). `Failed` is reachable
    /// from any non-terminal stage; `Done` and `Failed` are terminal.
    pub fn can_advance_to(self, next: Stage) -> bool {
        match (self, next) {
            (Stage::Done | Stage::Failed, _) => false,
            (_, Stage::Failed) => true,
            (from, to) => to.ordinal() > from.ordinal(),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Idle => "idle",
            Stage::Scanning => "scanning",
            Stage::Normalizing => "normalizing",
            Stage::Uploading => "uploading",
            Stage::Reconciling => "reconciling",
            Stage::ManifestWriting => "manifest-writing",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Tracks one gallery's stage and reports every transition.
struct StageTracker<'p> {
    gallery: String,
    stage: Stage,
    progress: &'p dyn SyncProgressReporter,
}

impl<'p> StageTracker<'p> {
    fn new(gallery: &str, progress: &'p dyn SyncProgressReporter) -> Self {
        Self {
            gallery: gallery.to_string(),
            stage: Stage::Idle,
            progress,
        }
    }

    fn enter(&mut self, next: Stage) {
        if !self.stage.can_advance_to(next) {
            warn!(gallery = %self.gallery, from = %self.stage, to = %next, "unexpected stage transition");
        }
        debug!(gallery = %self.gallery, stage = %next, "stage");
        self.stage = next;
        self.progress.report(SyncProgressEvent::Stage {
            gallery: self.gallery.clone(),
            stage: next,
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Options and summaries
// ═══════════════════════════════════════════════════════════════════════

/// Per-invocation switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// No local writes and no mutating remote calls; log intended actions.
    pub dry_run: bool,
    /// Skip scan/normalize/upload; only re-list remote state and rewrite manifests.
    pub sync_only: bool,
    /// Re-normalize even when an up-to-date scratch artifact exists.
    pub force: bool,
    /// One upload at a time with `upload.throttle_delay_ms` between calls.
    pub throttle: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizeCounts {
    pub reencoded: u64,
    pub optimized: u64,
    pub fallback: u64,
    pub reused: u64,
}

impl NormalizeCounts {
    fn record(&mut self, action: NormalizeAction) {
        match action {
            NormalizeAction::Reencoded => self.reencoded += 1,
            NormalizeAction::Optimized => self.optimized += 1,
            NormalizeAction::Fallback => self.fallback += 1,
            NormalizeAction::Reused => self.reused += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.reencoded + self.optimized + self.fallback + self.reused
    }
}

/// A file that could not be normalized or uploaded.
#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub file: String,
    pub identifier: Option<String>,
    pub stage: Stage,
    pub error: String,
}

/// Outcome of one gallery within a run.
#[derive(Debug, Clone, Serialize)]
pub struct GallerySummary {
    pub gallery: String,
    pub folder: String,
    pub stage: Stage,
    /// Set when the gallery was not processed (e.g. missing source folder).
    pub skipped: Option<String>,
    pub scanned: u64,
    pub duplicates: u64,
    pub normalized: NormalizeCounts,
    /// Uploads avoided because the identifier already existed remotely.
    pub already_present: u64,
    pub uploaded: u64,
    /// Uploads that failed first but succeeded in the reconciliation retry.
    pub recovered: u64,
    /// Identifiers a dry run would have uploaded.
    pub planned_uploads: Vec<String>,
    /// Local identifiers still absent remotely after reconciliation.
    pub missing: Vec<String>,
    /// Remote identifiers with no local counterpart.
    pub stale: Vec<String>,
    pub pruned: u64,
    pub remote_count: Option<u64>,
    pub manifest: Option<PathBuf>,
    /// Per-sub-folder manifests of a nested gallery.
    pub group_manifests: Vec<PathBuf>,
    /// Gallery-level problems: listing, pruning, manifest writing.
    pub errors: Vec<String>,
    pub failures: Vec<FailedFile>,
}

impl GallerySummary {
    fn new(gallery: &Gallery) -> Self {
        Self {
            gallery: gallery.slug.clone(),
            folder: gallery.folder.clone(),
            stage: Stage::Idle,
            skipped: None,
            scanned: 0,
            duplicates: 0,
            normalized: NormalizeCounts::default(),
            already_present: 0,
            uploaded: 0,
            recovered: 0,
            planned_uploads: Vec::new(),
            missing: Vec::new(),
            stale: Vec::new(),
            pruned: 0,
            remote_count: None,
            manifest: None,
            group_manifests: Vec::new(),
            errors: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Outcome of a whole invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub command: String,
    pub dry_run: bool,
    pub sync_only: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub galleries: Vec<GallerySummary>,
}

impl RunSummary {
    fn start(command: &str, options: &RunOptions) -> Self {
        let now = Utc::now();
        Self {
            command: command.to_string(),
            dry_run: options.dry_run,
            sync_only: options.sync_only,
            started_at: now,
            finished_at: now,
            galleries: Vec::new(),
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    pub fn total_failures(&self) -> usize {
        self.galleries.iter().map(|g| g.failed()).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.galleries.iter().map(|g| g.errors.len()).sum()
    }
}

/// Outcome of a `purge` invocation.
#[derive(Debug, Clone, Serialize)]
pub struct PurgeSummary {
    pub gallery: String,
    pub prefix: String,
    pub stale_only: bool,
    pub dry_run: bool,
    /// Identifiers selected for deletion.
    pub targeted: Vec<String>,
    pub deleted: u64,
    pub manifest: Option<PathBuf>,
    pub group_manifests: Vec<PathBuf>,
}

/// What a scan hands to the later stages of one gallery.
struct Scanned {
    images: Vec<SourceImage>,
    /// Source roots absent on disk, for display.
    missing_roots: Vec<String>,
}

/// An artifact ready to go to the remote store.
#[derive(Debug, Clone)]
struct UploadItem {
    id: LogicalIdentifier,
    path: PathBuf,
    file: String,
}

// ═══════════════════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════════════════

pub struct Pipeline<'a> {
    config: &'a Config,
    store: &'a dyn RemoteStore,
    progress: &'a dyn SyncProgressReporter,
    options: RunOptions,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a Config,
        store: &'a dyn RemoteStore,
        progress: &'a dyn SyncProgressReporter,
        options: RunOptions,
    ) -> Self {
        Self {
            config,
            store,
            progress,
            options,
        }
    }

    /// Run the full pipeline over `galleries`, sequentially.
    pub async fn run(&self, galleries: &[Gallery]) -> Result<RunSummary> {
        preflight(galleries, self.progress)?;
        info!(store = self.store.name(), galleries = galleries.len(), dry_run = self.options.dry_run, sync_only = self.options.sync_only, "sync starting");

        let mut summary = RunSummary::start("sync", &self.options);
        for gallery in galleries {
            let result = if self.options.sync_only {
                self.sync_only_gallery(gallery).await
            } else {
                self.sync_gallery(gallery).await
            };
            summary.galleries.push(result);
        }
        Ok(summary.finish())
    }

    /// Reconciler-driven retry: upload only what the remote listing lacks,
    /// one file at a time, then rewrite the manifest.
    pub async fn retry(&self, galleries: &[Gallery]) -> Result<RunSummary> {
        preflight(galleries, self.progress)?;

        let mut summary = RunSummary::start("retry", &self.options);
        for gallery in galleries {
            summary.galleries.push(self.retry_gallery(gallery).await);
        }
        Ok(summary.finish())
    }

    async fn sync_gallery(&self, gallery: &Gallery) -> GallerySummary {
        let mut summary = GallerySummary::new(gallery);
        let mut tracker = StageTracker::new(&gallery.slug, self.progress);

        let Some(Scanned {
            images,
            missing_roots,
        }) = scan_step(gallery, &mut tracker, &mut summary)
        else {
            tracker.enter(Stage::Done);
            summary.stage = tracker.stage;
            return summary;
        };
        let local_ids: BTreeSet<LogicalIdentifier> =
            images.iter().map(|i| i.identifier(&gallery.folder)).collect();

        if self.options.dry_run {
            self.dry_run_plan(gallery, &images, &local_ids, &mut tracker, &mut summary)
                .await;
            tracker.enter(Stage::Done);
            summary.stage = tracker.stage;
            return summary;
        }

        tracker.enter(Stage::Normalizing);
        let normalized = normalize_images(
            self.config,
            gallery,
            &images,
            self.options.force,
            self.progress,
            &mut summary,
        )
        .await;
        let items = upload_items(gallery, &normalized);

        tracker.enter(Stage::Uploading);
        let to_upload = self.precheck(gallery, &items, &mut summary).await;
        let results = self
            .upload_all(gallery, &to_upload, self.options.throttle)
            .await;
        for (item, result) in to_upload.iter().zip(results) {
            self.record_upload(gallery, item, result, &mut summary);
        }

        tracker.enter(Stage::Reconciling);
        let listing_ok = self
            .reconcile_step(
                gallery,
                &items,
                &local_ids,
                &missing_roots,
                self.config.upload.retry_missing,
                &mut summary,
            )
            .await;

        if listing_ok {
            tracker.enter(Stage::ManifestWriting);
            self.manifest_step(gallery, &mut summary).await;
        } else {
            summary
                .errors
                .push("manifest not written: remote listing incomplete".to_string());
        }

        tracker.enter(Stage::Done);
        summary.stage = tracker.stage;
        summary
    }

    async fn sync_only_gallery(&self, gallery: &Gallery) -> GallerySummary {
        let mut summary = GallerySummary::new(gallery);
        let mut tracker = StageTracker::new(&gallery.slug, self.progress);

        tracker.enter(Stage::ManifestWriting);
        if self.options.dry_run {
            match store::list_ids(self.store, &gallery.remote_prefix(), self.config.remote.page_size)
                .await
            {
                Ok(ids) => {
                    summary.remote_count = Some(ids.len() as u64);
                    if let Some(ref path) = gallery.manifest_path {
                        info!(gallery = %gallery.slug, path = %path.display(), count = ids.len(), "dry-run: would rewrite manifest");
                    }
                }
                Err(e) => summary.errors.push(format!("listing failed: {}", e)),
            }
        } else {
            self.manifest_step(gallery, &mut summary).await;
        }

        tracker.enter(Stage::Done);
        summary.stage = tracker.stage;
        summary
    }

    async fn retry_gallery(&self, gallery: &Gallery) -> GallerySummary {
        let mut summary = GallerySummary::new(gallery);
        let mut tracker = StageTracker::new(&gallery.slug, self.progress);

        let Some(Scanned {
            images,
            missing_roots,
        }) = scan_step(gallery, &mut tracker, &mut summary)
        else {
            tracker.enter(Stage::Done);
            summary.stage = tracker.stage;
            return summary;
        };
        let local_ids: BTreeSet<LogicalIdentifier> =
            images.iter().map(|i| i.identifier(&gallery.folder)).collect();

        if self.options.dry_run {
            tracker.enter(Stage::Reconciling);
            match store::list_ids(self.store, &gallery.remote_prefix(), self.config.remote.page_size)
                .await
            {
                Ok(remote) => {
                    let remote: BTreeSet<_> = remote.into_iter().collect();
                    summary.planned_uploads = reconcile::missing(&local_ids, &remote)
                        .into_iter()
                        .map(LogicalIdentifier::into_string)
                        .collect();
                    for id in &summary.planned_uploads {
                        info!(gallery = %gallery.slug, id = %id, "dry-run: would upload");
                    }
                }
                Err(e) => summary.errors.push(format!("listing failed: {}", e)),
            }
            tracker.enter(Stage::Done);
            summary.stage = tracker.stage;
            return summary;
        }

        tracker.enter(Stage::Normalizing);
        let normalized = normalize_images(
            self.config,
            gallery,
            &images,
            false,
            self.progress,
            &mut summary,
        )
        .await;
        let items = upload_items(gallery, &normalized);

        tracker.enter(Stage::Reconciling);
        let listing_ok = self
            .reconcile_step(gallery, &items, &local_ids, &missing_roots, true, &mut summary)
            .await;

        if listing_ok {
            tracker.enter(Stage::ManifestWriting);
            self.manifest_step(gallery, &mut summary).await;
        } else {
            summary
                .errors
                .push("manifest not written: remote listing incomplete".to_string());
        }

        tracker.enter(Stage::Done);
        summary.stage = tracker.stage;
        summary
    }

    /// Delete a gallery's remote folder, or only its stale identifiers.
    pub async fn purge(&self, gallery: &Gallery, stale_only: bool) -> Result<PurgeSummary> {
        let prefix = gallery.remote_prefix();
        let page_size = self.config.remote.page_size;

        let remote = store::list_ids(self.store, &prefix, page_size)
            .await
            .with_context(|| format!("Failed to list {}", prefix))?;

        let targeted: Vec<LogicalIdentifier> = if stale_only {
            let scan = scan::scan_gallery(gallery)?;
            if !scan.missing_roots.is_empty() {
                bail!(
                    "Refusing to prune '{}': source folder(s) missing: {}",
                    gallery.slug,
                    scan.missing_roots
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            let local: BTreeSet<_> = scan
                .images
                .iter()
                .map(|i| i.identifier(&gallery.folder))
                .collect();
            let remote: BTreeSet<_> = remote.into_iter().collect();
            reconcile::stale(&local, &remote).into_iter().collect()
        } else {
            remote
        };

        let mut summary = PurgeSummary {
            gallery: gallery.slug.clone(),
            prefix: prefix.clone(),
            stale_only,
            dry_run: self.options.dry_run,
            targeted: targeted.iter().map(|i| i.as_str().to_string()).collect(),
            deleted: 0,
            manifest: None,
            group_manifests: Vec::new(),
        };

        if self.options.dry_run {
            for id in &summary.targeted {
                info!(gallery = %gallery.slug, id = %id, "dry-run: would delete");
            }
            return Ok(summary);
        }

        summary.deleted = if stale_only {
            if targeted.is_empty() {
                0
            } else {
                self.store
                    .delete_by_ids(&targeted)
                    .await
                    .with_context(|| format!("Failed to delete stale assets under {}", prefix))?
            }
        } else {
            self.store
                .delete_by_prefix(&prefix)
                .await
                .with_context(|| format!("Failed to delete {}", prefix))?
        };
        info!(gallery = %gallery.slug, deleted = summary.deleted, "purge complete");

        if gallery.writes_manifests() {
            let ids = store::list_ids(self.store, &prefix, page_size)
                .await
                .with_context(|| format!("Failed to re-list {} after purge", prefix))?;
            for (path, result) in write_gallery_manifests(gallery, &ids) {
                result?;
                if gallery.manifest_path.as_ref() == Some(&path) {
                    summary.manifest = Some(path);
                } else {
                    summary.group_manifests.push(path);
                }
            }
        }

        Ok(summary)
    }

    // ─── steps ──────────────────────────────────────────────────────────

    async fn dry_run_plan(
        &self,
        gallery: &Gallery,
        images: &[SourceImage],
        local_ids: &BTreeSet<LogicalIdentifier>,
        tracker: &mut StageTracker<'_>,
        summary: &mut GallerySummary,
    ) {
        tracker.enter(Stage::Normalizing);
        for image in images {
            let plan = normalize::plan_for(image.size_bytes, &self.config.normalize);
            debug!(
                gallery = %gallery.slug,
                file = %image.filename,
                max_dimension = ?plan.max_dimension,
                quality = plan.quality,
                "dry-run: would normalize"
            );
        }

        tracker.enter(Stage::Uploading);
        let planned: BTreeSet<LogicalIdentifier> = if gallery.overwrite {
            local_ids.clone()
        } else {
            match store::list_ids(self.store, &gallery.remote_prefix(), self.config.remote.page_size)
                .await
            {
                Ok(remote) => {
                    let remote: BTreeSet<_> = remote.into_iter().collect();
                    let missing = reconcile::missing(local_ids, &remote);
                    summary.already_present = (local_ids.len() - missing.len()) as u64;
                    missing
                }
                Err(e) => {
                    warn!(gallery = %gallery.slug, error = %e, "dry-run: listing failed, assuming nothing is present");
                    local_ids.clone()
                }
            }
        };

        for id in &planned {
            info!(gallery = %gallery.slug, id = %id, overwrite = gallery.overwrite, "dry-run: would upload");
        }
        summary.planned_uploads = planned.into_iter().map(LogicalIdentifier::into_string).collect();
    }

    /// With `overwrite = false`, drop items whose identifier is already listed
    /// remotely. A failed listing keeps every item; non-overwriting uploads are
    /// safe to repeat.
    async fn precheck(
        &self,
        gallery: &Gallery,
        items: &[UploadItem],
        summary: &mut GallerySummary,
    ) -> Vec<UploadItem> {
        if gallery.overwrite || items.is_empty() {
            return items.to_vec();
        }

        match store::list_ids(self.store, &gallery.remote_prefix(), self.config.remote.page_size)
            .await
        {
            Ok(remote) => {
                let remote: BTreeSet<_> = remote.into_iter().collect();
                let (present, absent): (Vec<_>, Vec<_>) =
                    items.iter().cloned().partition(|i| remote.contains(&i.id));
                summary.already_present += present.len() as u64;
                debug!(gallery = %gallery.slug, present = present.len(), to_upload = absent.len(), "pre-upload check");
                absent
            }
            Err(e) => {
                warn!(gallery = %gallery.slug, error = %e, "pre-upload listing failed; uploading all");
                items.to_vec()
            }
        }
    }

    /// Upload `items` in batches (or one by one when `throttled`). Results are
    /// returned in the order of `items`.
    async fn upload_all(
        &self,
        gallery: &Gallery,
        items: &[UploadItem],
        throttled: bool,
    ) -> Vec<Result<UploadOutcome, RemoteError>> {
        let total = items.len() as u64;
        let mut results = Vec::with_capacity(items.len());
        if items.is_empty() {
            return results;
        }

        if throttled {
            let delay = Duration::from_millis(self.config.upload.throttle_delay_ms);
            for (i, item) in items.iter().enumerate() {
                if i > 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                results.push(self.upload_with_retry(item, gallery.overwrite).await);
                self.report_upload(gallery, results.len() as u64, total);
            }
        } else {
            let batch_size = self.config.upload.batch_size.max(1);
            for batch in items.chunks(batch_size) {
                let settled = futures::future::join_all(
                    batch
                        .iter()
                        .map(|item| self.upload_with_retry(item, gallery.overwrite)),
                )
                .await;
                results.extend(settled);
                self.report_upload(gallery, results.len() as u64, total);
            }
        }

        results
    }

    async fn upload_with_retry(
        &self,
        item: &UploadItem,
        overwrite: bool,
    ) -> Result<UploadOutcome, RemoteError> {
        let max_retries = self.config.upload.max_retries;
        let mut attempt = 0;
        loop {
            match self.store.upload(&item.path, &item.id, overwrite).await {
                Err(e) if e.is_transient() && attempt < max_retries => {
                    attempt += 1;
                    let delay = backoff(attempt);
                    warn!(id = %item.id, attempt, delay_secs = delay.as_secs(), error = %e, "transient upload error, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    fn report_upload(&self, gallery: &Gallery, n: u64, total: u64) {
        self.progress.report(SyncProgressEvent::Uploading {
            gallery: gallery.slug.clone(),
            n,
            total,
        });
    }

    fn record_upload(
        &self,
        gallery: &Gallery,
        item: &UploadItem,
        result: Result<UploadOutcome, RemoteError>,
        summary: &mut GallerySummary,
    ) {
        match result {
            Ok(UploadOutcome::Uploaded { remote_id }) => {
                debug!(gallery = %gallery.slug, id = %remote_id, "uploaded");
                summary.uploaded += 1;
            }
            Ok(UploadOutcome::AlreadyPresent) => {
                debug!(gallery = %gallery.slug, id = %item.id, "already present");
                summary.already_present += 1;
            }
            Err(e) => {
                warn!(gallery = %gallery.slug, file = %item.file, error = %e, "upload failed");
                summary.failures.push(FailedFile {
                    file: item.file.clone(),
                    identifier: Some(item.id.as_str().to_string()),
                    stage: Stage::Uploading,
                    error: e.to_string(),
                });
            }
        }
    }

    /// List the remote folder, retry what is missing, and prune what is stale.
    /// Returns `false` when the listing was incomplete.
    async fn reconcile_step(
        &self,
        gallery: &Gallery,
        items: &[UploadItem],
        local_ids: &BTreeSet<LogicalIdentifier>,
        missing_roots: &[String],
        retry_missing: bool,
        summary: &mut GallerySummary,
    ) -> bool {
        let remote: BTreeSet<LogicalIdentifier> = match store::list_ids(
            self.store,
            &gallery.remote_prefix(),
            self.config.remote.page_size,
        )
        .await
        {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                warn!(gallery = %gallery.slug, error = %e, "reconciliation listing failed");
                summary.errors.push(format!("reconciliation failed: {}", e));
                return false;
            }
        };

        let uploadable: BTreeSet<LogicalIdentifier> = items.iter().map(|i| i.id.clone()).collect();
        let reconciliation = Reconciliation::compute(&uploadable, &remote);
        let mut still_missing = reconciliation.missing.clone();

        if !reconciliation.missing.is_empty() && retry_missing {
            let retry: Vec<UploadItem> = items
                .iter()
                .filter(|i| reconciliation.missing.contains(&i.id))
                .cloned()
                .collect();
            info!(gallery = %gallery.slug, count = retry.len(), "retrying missing uploads one at a time");

            let results = self.upload_all(gallery, &retry, true).await;
            for (item, result) in retry.iter().zip(results) {
                let id = item.id.as_str();
                match result {
                    Ok(_) => {
                        still_missing.remove(&item.id);
                        summary.recovered += 1;
                        summary
                            .failures
                            .retain(|f| f.identifier.as_deref() != Some(id));
                    }
                    Err(e) => {
                        warn!(gallery = %gallery.slug, file = %item.file, error = %e, "retry failed");
                        summary
                            .failures
                            .retain(|f| f.identifier.as_deref() != Some(id));
                        summary.failures.push(FailedFile {
                            file: item.file.clone(),
                            identifier: Some(id.to_string()),
                            stage: Stage::Reconciling,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
        summary.missing = still_missing
            .into_iter()
            .map(LogicalIdentifier::into_string)
            .collect();

        // Stale is measured against everything scanned, so a file that merely
        // failed to normalize is never pruned.
        let stale: Vec<LogicalIdentifier> = reconcile::stale(local_ids, &remote).into_iter().collect();
        summary.stale = stale.iter().map(|i| i.as_str().to_string()).collect();

        if gallery.prune_stale && !stale.is_empty() && !missing_roots.is_empty() {
            warn!(gallery = %gallery.slug, stale = stale.len(), "source folder missing; not pruning");
            summary.errors.push(format!(
                "prune skipped: source folder(s) missing: {}",
                missing_roots.join(", ")
            ));
        } else if gallery.prune_stale && !stale.is_empty() {
            match self.store.delete_by_ids(&stale).await {
                Ok(n) => {
                    info!(gallery = %gallery.slug, deleted = n, "pruned stale assets");
                    summary.pruned = n;
                }
                Err(e) => {
                    warn!(gallery = %gallery.slug, error = %e, "pruning stale assets failed");
                    summary.errors.push(format!("prune failed: {}", e));
                }
            }
        } else if !stale.is_empty() {
            debug!(gallery = %gallery.slug, count = stale.len(), "stale assets left in place");
        }

        true
    }

    /// Rebuild the manifests from a fresh full listing. Skipped, with an error
    /// recorded, when the listing is incomplete.
    async fn manifest_step(&self, gallery: &Gallery, summary: &mut GallerySummary) {
        if !gallery.writes_manifests() {
            debug!(gallery = %gallery.slug, "no manifest configured");
            return;
        }

        let ids = match store::list_ids(self.store, &gallery.remote_prefix(), self.config.remote.page_size)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(gallery = %gallery.slug, error = %e, "manifest not written");
                summary
                    .errors
                    .push(format!("manifest not written: {}", e));
                return;
            }
        };

        summary.remote_count = Some(ids.len() as u64);
        for (path, result) in write_gallery_manifests(gallery, &ids) {
            match result {
                Ok(()) => {
                    info!(gallery = %gallery.slug, path = %path.display(), "manifest written");
                    if gallery.manifest_path.as_ref() == Some(&path) {
                        summary.manifest = Some(path);
                    } else {
                        summary.group_manifests.push(path);
                    }
                }
                Err(e) => {
                    warn!(gallery = %gallery.slug, path = %path.display(), error = %e, "manifest write failed");
                    summary.errors.push(format!("manifest write failed: {:#}", e));
                }
            }
        }
    }
}

/// Write every manifest `gallery` owns from one listing: the gallery
/// manifest, then one per sub-folder for nested galleries.
fn write_gallery_manifests(
    gallery: &Gallery,
    ids: &[LogicalIdentifier],
) -> Vec<(PathBuf, Result<()>)> {
    let mut written = Vec::new();
    if let Some(ref path) = gallery.manifest_path {
        written.push((path.clone(), manifest::write_manifest(path, ids, gallery.sort)));
    }
    if let Some(ref groups) = gallery.group_manifests {
        for (group, group_ids) in manifest::split_groups(&gallery.remote_prefix(), ids) {
            let path = groups.path_for(&group);
            let result = manifest::write_manifest(&path, &group_ids, gallery.sort);
            written.push((path, result));
        }
    }
    written
}

// ═══════════════════════════════════════════════════════════════════════
// Store-independent steps
// ═══════════════════════════════════════════════════════════════════════

/// Scan and normalize only; no network access.
pub async fn run_normalize_only(
    config: &Config,
    galleries: &[Gallery],
    force: bool,
    progress: &dyn SyncProgressReporter,
) -> Result<RunSummary> {
    preflight(galleries, progress)?;

    let options = RunOptions {
        force,
        ..RunOptions::default()
    };
    let mut summary = RunSummary::start("normalize", &options);
    for gallery in galleries {
        let mut g = GallerySummary::new(gallery);
        let mut tracker = StageTracker::new(&gallery.slug, progress);
        if let Some(Scanned { images, .. }) = scan_step(gallery, &mut tracker, &mut g) {
            tracker.enter(Stage::Normalizing);
            normalize_images(config, gallery, &images, force, progress, &mut g).await;
        }
        tracker.enter(Stage::Done);
        g.stage = tracker.stage;
        summary.galleries.push(g);
    }
    Ok(summary.finish())
}

/// A `required` gallery with a missing source folder is a configuration
/// error for the whole run.
fn preflight(galleries: &[Gallery], progress: &dyn SyncProgressReporter) -> Result<()> {
    for gallery in galleries.iter().filter(|g| g.required) {
        let missing: Vec<String> = gallery
            .sources
            .iter()
            .filter(|p| !p.is_dir())
            .map(|p| p.display().to_string())
            .collect();
        if !missing.is_empty() {
            let mut tracker = StageTracker::new(&gallery.slug, progress);
            tracker.enter(Stage::Failed);
            bail!(
                "Required gallery '{}' is missing source folder(s): {}",
                gallery.slug,
                missing.join(", ")
            );
        }
    }
    Ok(())
}

/// Scan a gallery. Returns `None` when it should be skipped.
fn scan_step(
    gallery: &Gallery,
    tracker: &mut StageTracker<'_>,
    summary: &mut GallerySummary,
) -> Option<Scanned> {
    tracker.enter(Stage::Scanning);

    let scan = match scan::scan_gallery(gallery) {
        Ok(scan) => scan,
        Err(e) => {
            let reason = format!("scan failed: {:#}", e);
            warn!(gallery = %gallery.slug, "{}; skipping gallery", reason);
            summary.skipped = Some(reason);
            return None;
        }
    };

    for root in &scan.missing_roots {
        warn!(gallery = %gallery.slug, root = %root.display(), "source folder not found");
    }
    for dup in &scan.duplicates {
        warn!(gallery = %gallery.slug, file = %dup.display(), "duplicate identifier; file ignored");
    }

    summary.scanned = scan.images.len() as u64;
    summary.duplicates = scan.duplicates.len() as u64;

    if scan.images.is_empty() && scan.missing_roots.len() == gallery.sources.len() {
        summary.skipped = Some("source folder not found".to_string());
        return None;
    }

    info!(gallery = %gallery.slug, files = scan.images.len(), "scanned");
    Some(Scanned {
        images: scan.images,
        missing_roots: scan
            .missing_roots
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
    })
}

/// Normalize `images` into the gallery's scratch directory with bounded
/// concurrency. Failures are recorded and the file is skipped.
async fn normalize_images(
    config: &Config,
    gallery: &Gallery,
    images: &[SourceImage],
    force: bool,
    progress: &dyn SyncProgressReporter,
    summary: &mut GallerySummary,
) -> Vec<(SourceImage, NormalizedImage)> {
    let total = images.len() as u64;
    let concurrency = config.normalize.concurrency.max(1);

    let mut results = stream::iter(images.iter().cloned())
        .map(|image| {
            let out_dir = gallery.scratch_dir.clone();
            let policy = config.normalize.clone();
            async move {
                let result = normalize::normalize(image.clone(), out_dir, policy, force).await;
                (image, result)
            }
        })
        .buffered(concurrency);

    let mut normalized = Vec::with_capacity(images.len());
    let mut n = 0;
    while let Some((image, result)) = results.next().await {
        n += 1;
        match result {
            Ok(out) => {
                summary.normalized.record(out.action);
                normalized.push((image, out));
            }
            Err(e) => {
                warn!(gallery = %gallery.slug, file = %image.filename, error = %e, "normalize failed; skipping file");
                summary.failures.push(FailedFile {
                    file: image.filename.clone(),
                    identifier: Some(image.identifier(&gallery.folder).into_string()),
                    stage: Stage::Normalizing,
                    error: e.to_string(),
                });
            }
        }
        progress.report(SyncProgressEvent::Normalizing {
            gallery: gallery.slug.clone(),
            n,
            total,
        });
    }

    normalized
}

fn upload_items(gallery: &Gallery, normalized: &[(SourceImage, NormalizedImage)]) -> Vec<UploadItem> {
    normalized
        .iter()
        .map(|(source, out)| UploadItem {
            id: source.identifier(&gallery.folder),
            path: out.path.clone(),
            file: source.filename.clone(),
        })
        .collect()
}

/// Exponential backoff: 1s, 2s, 4s, ... capped at 32s.
fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.saturating_sub(1).min(5))
}
