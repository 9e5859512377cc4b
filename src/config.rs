//! TOML configuration parsing and validation.
//!
//! The configuration is read once at startup and passed by reference into
//! every component. Relative paths are resolved against the directory that
//! contains the configuration file.
//!
//! ```toml
//! [paths]
//! source_root = "../photos"
//! scratch_dir = "../compressed"
//! data_dir = "../src/data"
//!
//! [upload]
//! batch_size = 4
//!
//! [galleries.maternity]
//! name = "Maternity"
//! sources = ["1 maternity/for web upload"]
//! sort = "descending-numeric"
//! overwrite = true
//!
//! [galleries.birthday-events]
//! name = "Birthday Events"
//! sources = ["7 birthday event shoot"]
//! grouping = "nested"
//! group_manifest = "birthday-{group}.json"
//! sort = "alphabetical"
//! overwrite = false
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::models::{Grouping, SortPolicy};

const MIB: u64 = 1024 * 1024;

/// Largest page the hosted Admin API returns for a listing call.
pub const MAX_PAGE_SIZE: u32 = 500;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub paths: PathsConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub galleries: BTreeMap<String, GalleryConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_source_root")]
    pub source_root: PathBuf,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    pub data_dir: PathBuf,
}

fn default_source_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_scratch_dir() -> PathBuf {
    PathBuf::from("./compressed")
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub cloud_name: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            cloud_name: None,
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_base_url() -> String {
    "https://api.cloudinary.com".to_string()
}
fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}
fn default_timeout_secs() -> u64 {
    60
}

/// One size tier: inputs of at least `min_bytes` get this dimension/quality.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct SizeTier {
    pub min_bytes: u64,
    pub max_dimension: u32,
    pub quality: u8,
}

/// The preset applied once when the first pass is still above the hard cap.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct FallbackPreset {
    pub max_dimension: u32,
    pub quality: u8,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NormalizeConfig {
    #[serde(default = "default_size_threshold")]
    pub size_threshold_bytes: u64,
    #[serde(default = "default_hard_cap")]
    pub hard_size_cap_bytes: u64,
    #[serde(default = "default_passthrough_quality")]
    pub passthrough_quality: u8,
    #[serde(default = "default_tiers")]
    pub tiers: Vec<SizeTier>,
    #[serde(default = "default_fallback")]
    pub fallback: FallbackPreset,
    #[serde(default = "default_normalize_concurrency")]
    pub concurrency: usize,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            size_threshold_bytes: default_size_threshold(),
            hard_size_cap_bytes: default_hard_cap(),
            passthrough_quality: default_passthrough_quality(),
            tiers: default_tiers(),
            fallback: default_fallback(),
            concurrency: default_normalize_concurrency(),
        }
    }
}

fn default_size_threshold() -> u64 {
    8 * MIB
}
fn default_hard_cap() -> u64 {
    9 * MIB
}
fn default_passthrough_quality() -> u8 {
    90
}
fn default_tiers() -> Vec<SizeTier> {
    vec![
        SizeTier {
            min_bytes: 8 * MIB,
            max_dimension: 3000,
            quality: 85,
        },
        SizeTier {
            min_bytes: 15 * MIB,
            max_dimension: 2500,
            quality: 75,
        },
        SizeTier {
            min_bytes: 25 * MIB,
            max_dimension: 2000,
            quality: 70,
        },
    ]
}
fn default_fallback() -> FallbackPreset {
    FallbackPreset {
        max_dimension: 1800,
        quality: 60,
    }
}
fn default_normalize_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_throttle_delay_ms")]
    pub throttle_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub retry_missing: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            throttle_delay_ms: default_throttle_delay_ms(),
            max_retries: default_max_retries(),
            retry_missing: true,
        }
    }
}

fn default_batch_size() -> usize {
    4
}
fn default_throttle_delay_ms() -> u64 {
    1500
}
fn default_max_retries() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

/// A `[galleries.<slug>]` table.
#[derive(Debug, Deserialize, Clone)]
pub struct GalleryConfig {
    pub name: String,
    pub sources: Vec<PathBuf>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub manifest: Option<String>,
    #[serde(default = "default_true")]
    pub write_manifest: bool,
    pub sort: SortPolicy,
    /// Upload with overwrite, or skip identifiers already present remotely.
    /// Deliberately has no default.
    pub overwrite: bool,
    #[serde(default)]
    pub grouping: Grouping,
    /// File name pattern, relative to `paths.data_dir`, for the per-sub-folder
    /// manifests of a nested gallery. `{group}` is replaced by the sub-folder
    /// slug. Defaults to `{slug}/{group}.json`.
    #[serde(default)]
    pub group_manifest: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub prune_stale: bool,
}

/// Placeholder for the sub-folder slug in [`GalleryConfig::group_manifest`].
pub const GROUP_PLACEHOLDER: &str = "{group}";

/// Where a nested gallery writes one manifest per sub-folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupManifests {
    pub dir: PathBuf,
    pub pattern: String,
}

impl GroupManifests {
    pub fn path_for(&self, group: &str) -> PathBuf {
        self.dir.join(self.pattern.replace(GROUP_PLACEHOLDER, group))
    }
}

/// A gallery with every path resolved and every default applied.
#[derive(Debug, Clone)]
pub struct Gallery {
    pub slug: String,
    pub name: String,
    pub sources: Vec<PathBuf>,
    pub folder: String,
    pub manifest_path: Option<PathBuf>,
    pub scratch_dir: PathBuf,
    pub sort: SortPolicy,
    pub overwrite: bool,
    pub grouping: Grouping,
    /// Set for nested galleries that write manifests.
    pub group_manifests: Option<GroupManifests>,
    pub required: bool,
    pub prune_stale: bool,
}

impl Gallery {
    /// Listing prefix for this gallery's remote folder (always ends in `/`).
    pub fn remote_prefix(&self) -> String {
        format!("{}/", self.folder.trim_end_matches('/'))
    }

    pub fn writes_manifests(&self) -> bool {
        self.manifest_path.is_some() || self.group_manifests.is_some()
    }
}

impl Config {
    /// All configured galleries, resolved, in slug order.
    pub fn galleries(&self) -> Vec<Gallery> {
        self.galleries
            .iter()
            .map(|(slug, g)| self.resolve_gallery(slug, g))
            .collect()
    }

    /// Resolve the named galleries, or all of them when `only` is empty.
    pub fn select_galleries(&self, only: &[String]) -> Result<Vec<Gallery>> {
        if only.is_empty() {
            return Ok(self.galleries());
        }
        let mut selected = Vec::with_capacity(only.len());
        for slug in only {
            let g = self.galleries.get(slug).ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown gallery: '{}'. Configured: {}",
                    slug,
                    self.galleries.keys().cloned().collect::<Vec<_>>().join(", ")
                )
            })?;
            selected.push(self.resolve_gallery(slug, g));
        }
        Ok(selected)
    }

    fn resolve_gallery(&self, slug: &str, g: &GalleryConfig) -> Gallery {
        let manifest_path = if g.write_manifest {
            let file = g
                .manifest
                .clone()
                .unwrap_or_else(|| format!("{}.json", slug));
            Some(self.paths.data_dir.join(file))
        } else {
            None
        };
        let group_manifests = (g.write_manifest && g.grouping == Grouping::Nested).then(|| {
            GroupManifests {
                dir: self.paths.data_dir.clone(),
                pattern: g
                    .group_manifest
                    .clone()
                    .unwrap_or_else(|| format!("{}/{}.json", slug, GROUP_PLACEHOLDER)),
            }
        });
        Gallery {
            slug: slug.to_string(),
            name: g.name.clone(),
            sources: g
                .sources
                .iter()
                .map(|s| self.paths.source_root.join(s))
                .collect(),
            folder: g
                .folder
                .clone()
                .unwrap_or_else(|| slug.to_string())
                .trim_matches('/')
                .to_string(),
            manifest_path,
            scratch_dir: self.paths.scratch_dir.join(slug),
            sort: g.sort,
            overwrite: g.overwrite,
            grouping: g.grouping,
            group_manifests,
            required: g.required,
            prune_stale: g.prune_stale,
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &PathBuf| {
            if p.is_absolute() {
                p.clone()
            } else {
                base.join(p)
            }
        };
        self.paths.source_root = resolve(&self.paths.source_root);
        self.paths.scratch_dir = resolve(&self.paths.scratch_dir);
        self.paths.data_dir = resolve(&self.paths.data_dir);
    }
}

/// Credentials for the hosted image API, read from the environment.
#[derive(Clone)]
pub struct Credentials {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("cloud_name", &self.cloud_name)
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Load `CLOUDINARY_CLOUD_NAME` (falling back to `remote.cloud_name`),
    /// `CLOUDINARY_API_KEY`, and `CLOUDINARY_API_SECRET`.
    pub fn from_env(remote: &RemoteConfig) -> Result<Self> {
        Self::from_lookup(remote, |key| std::env::var(key).ok())
    }

    fn from_lookup(remote: &RemoteConfig, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let cloud_name = non_empty("CLOUDINARY_CLOUD_NAME")
            .or_else(|| remote.cloud_name.clone())
            .context(
                "CLOUDINARY_CLOUD_NAME environment variable not set (and no remote.cloud_name in config)",
            )?;
        let api_key = non_empty("CLOUDINARY_API_KEY")
            .context("CLOUDINARY_API_KEY environment variable not set")?;
        let api_secret = non_empty("CLOUDINARY_API_SECRET")
            .context("CLOUDINARY_API_SECRET environment variable not set")?;

        Ok(Self {
            cloud_name,
            api_key,
            api_secret,
        })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    config.resolve_paths(base);

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.galleries.is_empty() {
        bail!("No galleries configured. Add at least one [galleries.<slug>] table.");
    }

    // Remote
    if config.remote.page_size == 0 || config.remote.page_size > MAX_PAGE_SIZE {
        bail!("remote.page_size must be in [1, {}]", MAX_PAGE_SIZE);
    }
    if config.remote.timeout_secs == 0 {
        bail!("remote.timeout_secs must be > 0");
    }

    // Normalize
    let n = &config.normalize;
    if n.hard_size_cap_bytes == 0 {
        bail!("normalize.hard_size_cap_bytes must be > 0");
    }
    check_quality("normalize.passthrough_quality", n.passthrough_quality)?;
    check_quality("normalize.fallback.quality", n.fallback.quality)?;
    if n.fallback.max_dimension == 0 {
        bail!("normalize.fallback.max_dimension must be > 0");
    }
    if n.tiers.is_empty() {
        bail!("normalize.tiers must contain at least one tier");
    }
    for (i, tier) in n.tiers.iter().enumerate() {
        if tier.max_dimension == 0 {
            bail!("normalize.tiers[{}].max_dimension must be > 0", i);
        }
        check_quality(&format!("normalize.tiers[{}].quality", i), tier.quality)?;
    }
    if n.concurrency == 0 {
        bail!("normalize.concurrency must be > 0");
    }

    // Upload
    if config.upload.batch_size == 0 {
        bail!("upload.batch_size must be > 0");
    }

    // Galleries
    let galleries = config.galleries();
    let mut manifests = HashSet::new();
    for gallery in &galleries {
        if gallery.slug.is_empty()
            || !gallery
                .slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            bail!(
                "Invalid gallery slug '{}': use lowercase letters, digits, and '-'",
                gallery.slug
            );
        }
        if gallery.sources.is_empty() {
            bail!("galleries.{}.sources must not be empty", gallery.slug);
        }
        if gallery.folder.is_empty() {
            bail!("galleries.{}.folder must not be empty", gallery.slug);
        }
        if let Some(pattern) = config
            .galleries
            .get(&gallery.slug)
            .and_then(|g| g.group_manifest.as_deref())
        {
            if gallery.grouping != Grouping::Nested {
                bail!(
                    "galleries.{}.group_manifest is only used with grouping = \"nested\"",
                    gallery.slug
                );
            }
            if !pattern.contains(GROUP_PLACEHOLDER) {
                bail!(
                    "galleries.{}.group_manifest must contain '{}'",
                    gallery.slug,
                    GROUP_PLACEHOLDER
                );
            }
        }
        if let Some(ref manifest) = gallery.manifest_path {
            if !manifests.insert(manifest.clone()) {
                bail!(
                    "Manifest file '{}' is used by more than one gallery",
                    manifest.display()
                );
            }
        }
    }

    // A gallery listing its prefix must never see another gallery's assets,
    // or pruning and purging would delete them.
    for (i, a) in galleries.iter().enumerate() {
        for b in &galleries[i + 1..] {
            let (pa, pb) = (a.remote_prefix(), b.remote_prefix());
            if pa.starts_with(&pb) || pb.starts_with(&pa) {
                bail!(
                    "Remote folders overlap: galleries '{}' ({}) and '{}' ({}). \
                     Use grouping = \"nested\" for sub-folders of one gallery.",
                    a.slug,
                    pa,
                    b.slug,
                    pb
                );
            }
        }
    }

    Ok(())
}

fn check_quality(field: &str, quality: u8) -> Result<()> {
    if !(1..=100).contains(&quality) {
        bail!("{} must be in [1, 100], got {}", field, quality);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
[paths]
source_root = "photos"
data_dir = "data"

[galleries.newborn]
name = "Newborn"
sources = ["newborn for web"]
sort = "descending-numeric"
overwrite = true
"#;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("gsync.toml");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let tmp = TempDir::new().unwrap();
        let cfg = load_config(&write_config(&tmp, MINIMAL)).unwrap();

        assert_eq!(cfg.upload.batch_size, 4);
        assert_eq!(cfg.upload.throttle_delay_ms, 1500);
        assert_eq!(cfg.remote.page_size, 500);
        assert_eq!(cfg.normalize.tiers.len(), 3);
        assert_eq!(cfg.normalize.fallback.quality, 60);

        let galleries = cfg.galleries();
        assert_eq!(galleries.len(), 1);
        let g = &galleries[0];
        assert_eq!(g.folder, "newborn");
        assert_eq!(g.remote_prefix(), "newborn/");
        assert_eq!(g.grouping, Grouping::None);
        assert_eq!(
            g.manifest_path.as_deref(),
            Some(tmp.path().join("data").join("newborn.json").as_path())
        );
        assert_eq!(g.sources[0], tmp.path().join("photos").join("newborn for web"));
        assert_eq!(g.scratch_dir, tmp.path().join("compressed").join("newborn"));
    }

    #[test]
    fn overwrite_is_required() {
        let tmp = TempDir::new().unwrap();
        let body = MINIMAL.replace("overwrite = true\n", "");
        assert!(load_config(&write_config(&tmp, &body)).is_err());
    }

    #[test]
    fn rejects_duplicate_folders() {
        let tmp = TempDir::new().unwrap();
        let body = format!(
            "{}\n[galleries.newborn-2]\nname = \"Again\"\nsources = [\"x\"]\nfolder = \"newborn\"\nsort = \"alphabetical\"\noverwrite = false\n",
            MINIMAL
        );
        let err = load_config(&write_config(&tmp, &body)).unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn rejects_nested_folders() {
        let tmp = TempDir::new().unwrap();
        let body = format!(
            "{}\n[galleries.khushi]\nname = \"Khushi\"\nsources = [\"k\"]\nfolder = \"newborn/khushi\"\nsort = \"alphabetical\"\noverwrite = true\n",
            MINIMAL
        );
        let err = load_config(&write_config(&tmp, &body)).unwrap_err();
        assert!(err.to_string().contains("overlap"), "{}", err);

        // A shared name stem is not nesting.
        let body = body.replace("newborn/khushi", "newborn-khushi");
        assert!(load_config(&write_config(&tmp, &body)).is_ok());
    }

    #[test]
    fn nested_gallery_gets_group_manifests() {
        let tmp = TempDir::new().unwrap();
        let body = MINIMAL.replace("overwrite = true", "overwrite = true\ngrouping = \"nested\"");
        let cfg = load_config(&write_config(&tmp, &body)).unwrap();
        let groups = cfg.galleries()[0].group_manifests.clone().unwrap();
        assert_eq!(
            groups.path_for("khushi-birthday"),
            tmp.path().join("data").join("newborn").join("khushi-birthday.json")
        );

        let body = body.replace(
            "grouping = \"nested\"",
            "grouping = \"nested\"\ngroup_manifest = \"birthday.json\"",
        );
        assert!(load_config(&write_config(&tmp, &body)).is_err());
    }

    #[test]
    fn rejects_bad_quality() {
        let tmp = TempDir::new().unwrap();
        let body = format!("{}\n[normalize]\npassthrough_quality = 0\n", MINIMAL);
        assert!(load_config(&write_config(&tmp, &body)).is_err());
    }

    #[test]
    fn rejects_uppercase_slug() {
        let tmp = TempDir::new().unwrap();
        let body = MINIMAL.replace("galleries.newborn", "galleries.NewBorn");
        assert!(load_config(&write_config(&tmp, &body)).is_err());
    }

    #[test]
    fn manifest_can_be_disabled() {
        let tmp = TempDir::new().unwrap();
        let body = MINIMAL.replace("overwrite = true", "overwrite = true\nwrite_manifest = false");
        let cfg = load_config(&write_config(&tmp, &body)).unwrap();
        assert!(cfg.galleries()[0].manifest_path.is_none());
    }

    #[test]
    fn select_unknown_gallery_fails() {
        let tmp = TempDir::new().unwrap();
        let cfg = load_config(&write_config(&tmp, MINIMAL)).unwrap();
        assert!(cfg.select_galleries(&["maternity".to_string()]).is_err());
        assert_eq!(cfg.select_galleries(&[]).unwrap().len(), 1);
    }

    #[test]
    fn credentials_fall_back_to_config_cloud_name() {
        let remote = RemoteConfig {
            cloud_name: Some("from-config".to_string()),
            ..RemoteConfig::default()
        };
        let creds = Credentials::from_lookup(&remote, |key| match key {
            "CLOUDINARY_API_KEY" => Some("key".to_string()),
            "CLOUDINARY_API_SECRET" => Some("secret".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(creds.cloud_name, "from-config");
        assert!(!format!("{:?}", creds).contains("secret\""));

        let missing = Credentials::from_lookup(&RemoteConfig::default(), |_| None);
        assert!(missing.is_err());
    }

    #[test]
    fn example_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/gsync.example.toml");
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.galleries().len(), 4);
        let events = cfg.select_galleries(&["birthday-events".to_string()]).unwrap();
        assert_eq!(events[0].grouping, Grouping::Nested);
        assert!(!events[0].overwrite);
        assert_eq!(
            events[0].group_manifests.as_ref().unwrap().path_for("khushi-birthday"),
            cfg.paths.data_dir.join("birthday-khushi-birthday.json")
        );
    }
}
