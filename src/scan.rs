//! Asset scanner.
//!
//! Walks a gallery's local source folders and produces [`SourceImage`]s.
//! Only `.jpg`, `.jpeg`, and `.png` files (any case) are picked up; dotfiles
//! and dot-folders are ignored. Galleries with [`Grouping::Flatten`] or
//! [`Grouping::Nested`] also descend exactly one level of sub-folders and tag
//! each file with the slugified sub-folder name.

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobMatcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::config::Gallery;
use crate::models::{slugify, Grouping, SourceImage};

/// Extensions accepted by the scanner, matched case-insensitively.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Result of scanning every source folder of one gallery.
#[derive(Debug, Default)]
pub struct GalleryScan {
    /// Accepted images, grouped by sub-folder then ordered by filename.
    pub images: Vec<SourceImage>,
    /// Source roots that do not exist on disk.
    pub missing_roots: Vec<PathBuf>,
    /// Files dropped because another file already maps to the same
    /// identifier (e.g. `a.jpg` next to `a.png`).
    pub duplicates: Vec<PathBuf>,
}

impl GalleryScan {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Scan all source folders of `gallery`.
///
/// An absent root is not an error: it is reported in
/// [`GalleryScan::missing_roots`] and contributes no images.
pub fn scan_gallery(gallery: &Gallery) -> Result<GalleryScan> {
    let matcher = image_matcher()?;
    let mut scan = GalleryScan::default();

    for root in &gallery.sources {
        match scan_source(root, &gallery.slug, gallery.grouping, &matcher)? {
            Some(images) => scan.images.extend(images),
            None => scan.missing_roots.push(root.clone()),
        }
    }

    scan.images.sort_by(|a, b| {
        (&a.group, &a.filename, &a.path).cmp(&(&b.group, &b.filename, &b.path))
    });

    // Enforce one file per identifier within the gallery.
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(scan.images.len());
    for image in scan.images.drain(..) {
        if seen.insert(image.remote_name()) {
            unique.push(image);
        } else {
            scan.duplicates.push(image.path);
        }
    }
    scan.images = unique;

    Ok(scan)
}

/// Scan one root. Returns `None` when the root does not exist.
fn scan_source(
    root: &Path,
    gallery: &str,
    grouping: Grouping,
    matcher: &GlobMatcher,
) -> Result<Option<Vec<SourceImage>>> {
    if !root.is_dir() {
        return Ok(None);
    }

    let max_depth = if grouping.descends() { 2 } else { 1 };

    let mut images = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e));

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let filename = entry.file_name().to_string_lossy().to_string();
        if !matcher.is_match(&filename) {
            continue;
        }

        let group = if entry.depth() == 2 {
            entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| slugify(&n.to_string_lossy()))
                .filter(|s| !s.is_empty())
        } else {
            None
        };

        let size_bytes = entry
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?
            .len();

        images.push(SourceImage {
            path: entry.path().to_path_buf(),
            filename,
            size_bytes,
            gallery: gallery.to_string(),
            group,
            grouping,
        });
    }

    Ok(Some(images))
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

fn image_matcher() -> Result<GlobMatcher> {
    let pattern = format!("*.{{{}}}", IMAGE_EXTENSIONS.join(","));
    let glob = GlobBuilder::new(&pattern)
        .case_insensitive(true)
        .literal_separator(true)
        .build()?;
    Ok(glob.compile_matcher())
}
