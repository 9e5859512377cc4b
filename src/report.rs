//! End-of-run reporting.
//!
//! The summary goes to stdout as stable, line-oriented text (one block per
//! gallery, terminated by `ok`), so scripts can grep it. `--report <path>`
//! additionally writes the full [`RunSummary`] as pretty JSON, including the
//! list of failed filenames for a targeted `gsync retry` pass.

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;

use crate::pipeline::{GallerySummary, PurgeSummary, RunSummary};
use crate::progress::format_number;

/// Render the text summary of a run.
pub fn render_run(summary: &RunSummary) -> String {
    let mut out = String::new();
    let mode = match (summary.dry_run, summary.sync_only) {
        (true, true) => " (sync-only, dry-run)",
        (true, false) => " (dry-run)",
        (false, true) => " (sync-only)",
        (false, false) => "",
    };

    for g in &summary.galleries {
        let _ = writeln!(out, "{} {}{}", summary.command, g.gallery, mode);
        render_gallery(&mut out, g, summary.dry_run);
    }

    let failures = summary.total_failures();
    let errors = summary.total_errors();
    let _ = writeln!(
        out,
        "galleries: {}  failed files: {}  gallery errors: {}",
        summary.galleries.len(),
        format_number(failures as u64),
        errors
    );
    out.push_str("ok\n");
    out
}

fn render_gallery(out: &mut String, g: &GallerySummary, dry_run: bool) {
    if let Some(ref reason) = g.skipped {
        let _ = writeln!(out, "  skipped: {}", reason);
        return;
    }

    let n = &g.normalized;
    if g.scanned > 0 {
        let _ = writeln!(out, "  scanned: {} files", format_number(g.scanned));
    }
    if g.duplicates > 0 {
        let _ = writeln!(out, "  duplicates ignored: {}", g.duplicates);
    }
    if n.total() > 0 {
        let _ = writeln!(
            out,
            "  normalized: {} (re-encoded {}, optimized {}, fallback {}, reused {})",
            format_number(n.total()),
            n.reencoded,
            n.optimized,
            n.fallback,
            n.reused
        );
    }

    if dry_run {
        if g.already_present > 0 {
            let _ = writeln!(out, "  already present: {}", format_number(g.already_present));
        }
        let _ = writeln!(
            out,
            "  would upload: {}",
            format_number(g.planned_uploads.len() as u64)
        );
    } else if g.scanned > 0 {
        let _ = writeln!(out, "  uploaded: {}", format_number(g.uploaded));
        let _ = writeln!(
            out,
            "  skipped (already present): {}",
            format_number(g.already_present)
        );
        if g.recovered > 0 {
            let _ = writeln!(out, "  recovered on retry: {}", g.recovered);
        }
        if !g.missing.is_empty() {
            let _ = writeln!(out, "  still missing: {}", g.missing.len());
        }
    }

    if !g.stale.is_empty() {
        let _ = writeln!(out, "  stale remote: {} (pruned {})", g.stale.len(), g.pruned);
    }
    if let Some(count) = g.remote_count {
        let _ = writeln!(out, "  remote assets: {}", format_number(count));
    }
    for path in g.manifest.iter().chain(&g.group_manifests) {
        let _ = writeln!(out, "  manifest: {}", path.display());
    }

    let _ = writeln!(out, "  failed: {}", g.failed());
    for f in &g.failures {
        let _ = writeln!(out, "    {} [{}] {}", f.file, f.stage, f.error);
    }
    for e in &g.errors {
        let _ = writeln!(out, "  error: {}", e);
    }
}

/// Render the text summary of a purge.
pub fn render_purge(summary: &PurgeSummary) -> String {
    let mut out = String::new();
    let what = if summary.stale_only { "stale assets" } else { "all assets" };
    let _ = writeln!(
        out,
        "purge {}{}",
        summary.gallery,
        if summary.dry_run { " (dry-run)" } else { "" }
    );
    let _ = writeln!(out, "  prefix: {}", summary.prefix);
    if summary.dry_run {
        let _ = writeln!(out, "  would delete {}: {}", what, summary.targeted.len());
        for id in &summary.targeted {
            let _ = writeln!(out, "    {}", id);
        }
    } else {
        let _ = writeln!(out, "  deleted {}: {}", what, summary.deleted);
    }
    for path in summary.manifest.iter().chain(&summary.group_manifests) {
        let _ = writeln!(out, "  manifest: {}", path.display());
    }
    out.push_str("ok\n");
    out
}

/// Write the run summary as pretty JSON to `path`.
pub fn write_report(path: &Path, summary: &RunSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, json + "\n")
        .with_context(|| format!("Failed to write report {}", path.display()))?;
    Ok(())
}
