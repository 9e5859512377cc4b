//! Core data models used throughout the gallery pipeline.
//!
//! These types represent the files, normalized artifacts, and remote
//! identifiers that flow from the local photo folders to the hosted image
//! store and finally into the manifest files.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// One image file discovered on local disk. Never modified by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    /// Absolute path of the original file.
    pub path: PathBuf,
    /// File name including extension (e.g. `"IMG_0042.JPG"`).
    pub filename: String,
    /// Size of the original in bytes.
    pub size_bytes: u64,
    /// Slug of the gallery this file belongs to.
    pub gallery: String,
    /// Sanitized sub-folder name for files found one level down.
    pub group: Option<String>,
    /// How `group` shapes the identifier.
    pub grouping: Grouping,
}

impl SourceImage {
    /// File name without its extension.
    pub fn stem(&self) -> &str {
        Path::new(&self.filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.filename)
    }

    /// Flattened base name: `"{group}__{stem}"` for grouped files, the bare
    /// stem otherwise. Names the scratch file in every grouping mode.
    pub fn flat_name(&self) -> String {
        match &self.group {
            Some(group) => format!("{}{}{}", group, GROUP_SEPARATOR, self.stem()),
            None => self.stem().to_string(),
        }
    }

    /// Path of the file below the gallery folder: `"{group}/{stem}"` for
    /// nested galleries, [`flat_name`](Self::flat_name) otherwise.
    pub fn remote_name(&self) -> String {
        match (&self.group, self.grouping) {
            (Some(group), Grouping::Nested) => format!("{}/{}", group, self.stem()),
            _ => self.flat_name(),
        }
    }

    /// Derive the stable remote key for this file under `folder`.
    pub fn identifier(&self, folder: &str) -> LogicalIdentifier {
        LogicalIdentifier::new(folder, &self.remote_name())
    }

    /// Name of the normalized artifact (extension forced to `.jpg`).
    pub fn normalized_filename(&self) -> String {
        format!("{}.jpg", self.flat_name())
    }
}

/// Separator between a flattened sub-folder prefix and the file stem.
pub const GROUP_SEPARATOR: &str = "__";

/// How a normalized artifact was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NormalizeAction {
    /// Small input re-encoded as JPEG without resizing.
    Reencoded,
    /// Large input resized and compressed with a size tier.
    Optimized,
    /// The aggressive fallback preset was applied after the first pass.
    Fallback,
    /// A previous run already produced an up-to-date artifact.
    Reused,
}

/// The optimized output artifact written to the scratch directory.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub path: PathBuf,
    pub filename: String,
    pub size_bytes: u64,
    pub max_dimension: Option<u32>,
    pub quality: u8,
    pub action: NormalizeAction,
    /// Path of the original this artifact was derived from (lookup only).
    pub source_path: PathBuf,
}

/// Stable key of an asset once it leaves the local filesystem:
/// `{folder}/{baseName}` with no URL-encoding and case preserved.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalIdentifier(String);

impl LogicalIdentifier {
    pub fn new(folder: &str, base_name: &str) -> Self {
        let folder = folder.trim_matches('/');
        if folder.is_empty() {
            Self(base_name.to_string())
        } else {
            Self(format!("{}/{}", folder, base_name))
        }
    }

    /// Wrap an identifier reported by the remote store as-is.
    pub fn from_remote(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path segment (the part after the last `/`).
    pub fn base_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for LogicalIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LogicalIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What the remote store reports under a prefix. Carries no file content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAsset {
    pub id: LogicalIdentifier,
    pub bytes: Option<u64>,
}

/// Display order applied when a manifest is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortPolicy {
    /// Last run of digits in the final path segment, highest first.
    DescendingNumeric,
    /// Full identifier, ascending.
    Alphabetical,
}

impl fmt::Display for SortPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortPolicy::DescendingNumeric => f.write_str("descending-numeric"),
            SortPolicy::Alphabetical => f.write_str("alphabetical"),
        }
    }
}

/// How a gallery's source folders are walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Grouping {
    /// Only files directly inside each source folder.
    #[default]
    None,
    /// Also one level of sub-folders, prefixed `{subfolder}__` in the identifier.
    Flatten,
    /// Also one level of sub-folders, each uploaded to `{folder}/{subfolder}/`
    /// and described by its own manifest.
    Nested,
}

impl Grouping {
    /// Whether the scanner descends into sub-folders.
    pub fn descends(self) -> bool {
        !matches!(self, Grouping::None)
    }
}

/// Turn a folder name into a prefix: lowercase, runs of anything other
/// than ASCII letters and digits collapsed to `-`, no leading/trailing `-`.
///
/// `"Charvis birthday"` → `"charvis-birthday"`, `"alice-party"` → `"alice-party"`.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(filename: &str, group: Option<&str>) -> SourceImage {
        SourceImage {
            path: PathBuf::from("/photos").join(filename),
            filename: filename.to_string(),
            size_bytes: 10,
            gallery: "events".to_string(),
            group: group.map(str::to_string),
            grouping: Grouping::Flatten,
        }
    }

    #[test]
    fn identifier_strips_extension() {
        let img = image("IMG_0042.JPG", None);
        assert_eq!(img.identifier("newborn").as_str(), "newborn/IMG_0042");
        assert_eq!(img.normalized_filename(), "IMG_0042.jpg");
    }

    #[test]
    fn grouped_identifier_is_prefixed() {
        let img = image("SVP00008CB.jpg", Some("alice-party"));
        assert_eq!(
            img.identifier("events").as_str(),
            "events/alice-party__SVP00008CB"
        );
        assert_eq!(img.identifier("events").base_name(), "alice-party__SVP00008CB");
    }

    #[test]
    fn nested_identifier_keeps_subfolder() {
        let img = SourceImage {
            grouping: Grouping::Nested,
            ..image("SVP00008CB.jpg", Some("khushi-birthday"))
        };
        assert_eq!(
            img.identifier("birthday-events").as_str(),
            "birthday-events/khushi-birthday/SVP00008CB"
        );
        assert_eq!(img.normalized_filename(), "khushi-birthday__SVP00008CB.jpg");
    }

    #[test]
    fn identifier_trims_folder_slashes() {
        assert_eq!(LogicalIdentifier::new("/hero/", "a").as_str(), "hero/a");
        assert_eq!(LogicalIdentifier::new("", "a").as_str(), "a");
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Charvis birthday"), "charvis-birthday");
        assert_eq!(slugify("alice-party"), "alice-party");
        assert_eq!(slugify("  Deversh 5th  Birthday!! "), "deversh-5th-birthday");
        assert_eq!(slugify("Rashmi_Baby_Shower"), "rashmi-baby-shower");
    }
}
