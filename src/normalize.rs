//! Image normalizer.
//!
//! Turns one original into a JPEG that fits the hosted store's limits:
//!
//! 1. Inputs below `size_threshold_bytes` are re-encoded at
//!    `passthrough_quality` without resizing.
//! 2. Larger inputs are resized to fit the longest edge of the matching size
//!    tier (never upscaled) and encoded at the tier's quality.
//! 3. If the result is still above `hard_size_cap_bytes`, the fallback preset
//!    is applied once and its result is accepted unconditionally.
//!
//! Every path auto-rotates from the embedded orientation tag and writes a
//! progressive JPEG. The original is only ever read; the output is written to
//! the gallery's scratch directory through a temporary file and a rename, so
//! an interrupted run never leaves a truncated artifact behind.
//!
//! Next to each artifact sits `<name>.jpg.json`, recording the settings it
//! was encoded with and a fingerprint of the policy in force. An artifact is
//! reused only while that fingerprint still matches, so editing tiers,
//! qualities, or the fallback preset re-encodes on the next run.

use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageReader};
use jpeg_encoder::{ColorType, Encoder, EncodingError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::{FallbackPreset, NormalizeConfig, SizeTier};
use crate::models::{NormalizeAction, NormalizedImage, SourceImage};

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("cannot encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: EncodingError,
    },
    #[error("{path} is {width}x{height}, beyond the 65535 px JPEG limit")]
    TooLarge {
        path: PathBuf,
        width: u32,
        height: u32,
    },
    #[error("cannot record settings for {path}: {source}")]
    Record {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("normalize task for {path} did not complete: {reason}")]
    Task { path: PathBuf, reason: String },
}

/// Dimension and quality chosen for the first pass over an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub max_dimension: Option<u32>,
    pub quality: u8,
    pub action: NormalizeAction,
}

/// Pick the first-pass settings for an input of `size_bytes`.
pub fn plan_for(size_bytes: u64, policy: &NormalizeConfig) -> Plan {
    if size_bytes < policy.size_threshold_bytes {
        return Plan {
            max_dimension: None,
            quality: policy.passthrough_quality,
            action: NormalizeAction::Reencoded,
        };
    }

    // Largest tier whose floor the input reaches; smallest tier otherwise.
    let tier = policy
        .tiers
        .iter()
        .filter(|t| size_bytes >= t.min_bytes)
        .max_by_key(|t| t.min_bytes)
        .or_else(|| policy.tiers.iter().min_by_key(|t| t.min_bytes));

    match tier {
        Some(t) => Plan {
            max_dimension: Some(t.max_dimension),
            quality: t.quality,
            action: NormalizeAction::Optimized,
        },
        None => Plan {
            max_dimension: Some(policy.fallback.max_dimension),
            quality: policy.fallback.quality,
            action: NormalizeAction::Optimized,
        },
    }
}

/// Where the artifact for `source` lives inside `out_dir`.
pub fn output_path(source: &SourceImage, out_dir: &Path) -> PathBuf {
    out_dir.join(source.normalized_filename())
}

/// Settings an artifact was written with, stored beside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ArtifactRecord {
    policy: String,
    max_dimension: Option<u32>,
    quality: u8,
    action: NormalizeAction,
}

/// The parts of [`NormalizeConfig`] that change the encoded bytes.
#[derive(Serialize)]
struct PolicyKey<'a> {
    size_threshold_bytes: u64,
    hard_size_cap_bytes: u64,
    passthrough_quality: u8,
    tiers: &'a [SizeTier],
    fallback: FallbackPreset,
    progressive: bool,
}

/// SHA-256 (hex) over the output-affecting policy fields.
pub fn policy_fingerprint(policy: &NormalizeConfig) -> Result<String, serde_json::Error> {
    let key = PolicyKey {
        size_threshold_bytes: policy.size_threshold_bytes,
        hard_size_cap_bytes: policy.hard_size_cap_bytes,
        passthrough_quality: policy.passthrough_quality,
        tiers: &policy.tiers,
        fallback: policy.fallback,
        progressive: true,
    };
    let bytes = serde_json::to_vec(&key)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// `<artifact>.json`
pub fn record_path(artifact: &Path) -> PathBuf {
    with_suffix(artifact, ".json")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Normalize `source` into `out_dir` on the blocking thread pool.
pub async fn normalize(
    source: SourceImage,
    out_dir: PathBuf,
    policy: NormalizeConfig,
    force: bool,
) -> Result<NormalizedImage, NormalizeError> {
    let path = source.path.clone();
    tokio::task::spawn_blocking(move || normalize_blocking(&source, &out_dir, &policy, force))
        .await
        .map_err(|e| NormalizeError::Task {
            path,
            reason: e.to_string(),
        })?
}

/// Synchronous core of [`normalize`].
pub fn normalize_blocking(
    source: &SourceImage,
    out_dir: &Path,
    policy: &NormalizeConfig,
    force: bool,
) -> Result<NormalizedImage, NormalizeError> {
    let out_path = output_path(source, out_dir);
    let filename = source.normalized_filename();
    let fingerprint = policy_fingerprint(policy).map_err(|e| NormalizeError::Record {
        path: out_path.clone(),
        source: e,
    })?;

    if !force {
        if let Some((size_bytes, record)) = reusable_output(&source.path, &out_path, &fingerprint)
        {
            return Ok(NormalizedImage {
                path: out_path,
                filename,
                size_bytes,
                max_dimension: record.max_dimension,
                quality: record.quality,
                action: NormalizeAction::Reused,
                source_path: source.path.clone(),
            });
        }
    }

    let image = decode_oriented(&source.path)?;
    let plan = plan_for(source.size_bytes, policy);

    let mut encoded = encode(&image, plan.max_dimension, plan.quality, &source.path)?;
    let mut applied = plan;

    if encoded.len() as u64 > policy.hard_size_cap_bytes {
        tracing::debug!(
            file = %source.filename,
            bytes = encoded.len(),
            cap = policy.hard_size_cap_bytes,
            "first pass above size cap, applying fallback preset"
        );
        encoded = encode(
            &image,
            Some(policy.fallback.max_dimension),
            policy.fallback.quality,
            &source.path,
        )?;
        applied = Plan {
            max_dimension: Some(policy.fallback.max_dimension),
            quality: policy.fallback.quality,
            action: NormalizeAction::Fallback,
        };
        if encoded.len() as u64 > policy.hard_size_cap_bytes {
            tracing::warn!(
                file = %source.filename,
                bytes = encoded.len(),
                cap = policy.hard_size_cap_bytes,
                "output still above size cap after fallback preset; keeping it"
            );
        }
    }

    let record_file = record_path(&out_path);
    // A leftover record must never vouch for the new artifact.
    let _ = std::fs::remove_file(&record_file);
    write_atomic(&out_path, &encoded)?;

    let record = ArtifactRecord {
        policy: fingerprint,
        max_dimension: applied.max_dimension,
        quality: applied.quality,
        action: applied.action,
    };
    let record_json = serde_json::to_vec_pretty(&record).map_err(|source| NormalizeError::Record {
        path: record_file.clone(),
        source,
    })?;
    write_atomic(&record_file, &record_json)?;

    Ok(NormalizedImage {
        path: out_path,
        filename,
        size_bytes: encoded.len() as u64,
        max_dimension: applied.max_dimension,
        quality: applied.quality,
        action: applied.action,
        source_path: source.path.clone(),
    })
}

/// An existing artifact is reused when it is non-empty, not older than its
/// source, and its record carries the current policy fingerprint.
fn reusable_output(
    source: &Path,
    output: &Path,
    fingerprint: &str,
) -> Option<(u64, ArtifactRecord)> {
    let out_meta = std::fs::metadata(output).ok()?;
    if !out_meta.is_file() || out_meta.len() == 0 {
        return None;
    }
    let src_modified = std::fs::metadata(source).ok()?.modified().ok()?;
    let out_modified = out_meta.modified().ok()?;
    if out_modified < src_modified {
        return None;
    }

    let raw = std::fs::read(record_path(output)).ok()?;
    let record: ArtifactRecord = serde_json::from_slice(&raw).ok()?;
    if record.policy != fingerprint {
        tracing::debug!(file = %output.display(), "normalize policy changed, re-encoding");
        return None;
    }
    Some((out_meta.len(), record))
}

fn decode_oriented(path: &Path) -> Result<DynamicImage, NormalizeError> {
    let decode_err = |source| NormalizeError::Decode {
        path: path.to_path_buf(),
        source,
    };

    let reader = ImageReader::open(path)
        .map_err(|source| NormalizeError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .with_guessed_format()
        .map_err(|source| NormalizeError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let mut decoder = reader.into_decoder().map_err(decode_err)?;
    let orientation = decoder.orientation().map_err(decode_err)?;
    let mut image = DynamicImage::from_decoder(decoder).map_err(decode_err)?;
    image.apply_orientation(orientation);
    Ok(image)
}

/// Resize to fit `max_dimension` (never enlarging) and encode as a
/// progressive JPEG.
fn encode(
    image: &DynamicImage,
    max_dimension: Option<u32>,
    quality: u8,
    path: &Path,
) -> Result<Vec<u8>, NormalizeError> {
    let resized;
    let image = match max_dimension {
        Some(max) if image.width().max(image.height()) > max => {
            resized = image.resize(max, max, FilterType::Lanczos3);
            &resized
        }
        _ => image,
    };

    // JPEG has no alpha channel.
    let rgb = image.to_rgb8();
    let (Ok(width), Ok(height)) = (u16::try_from(rgb.width()), u16::try_from(rgb.height()))
    else {
        return Err(NormalizeError::TooLarge {
            path: path.to_path_buf(),
            width: rgb.width(),
            height: rgb.height(),
        });
    };

    let mut buf = Vec::new();
    let mut encoder = Encoder::new(&mut buf, quality);
    encoder.set_progressive(true);
    encoder
        .encode(rgb.as_raw(), width, height, ColorType::Rgb)
        .map_err(|source| NormalizeError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(buf)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), NormalizeError> {
    let io_err = |source| NormalizeError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = with_suffix(path, ".partial");
    std::fs::write(&tmp, bytes).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Grouping;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn policy(threshold: u64, max_dimension: u32) -> NormalizeConfig {
        NormalizeConfig {
            size_threshold_bytes: threshold,
            hard_size_cap_bytes: u64::MAX,
            passthrough_quality: 90,
            tiers: vec![SizeTier {
                min_bytes: 0,
                max_dimension,
                quality: 80,
            }],
            fallback: FallbackPreset {
                max_dimension: 40,
                quality: 60,
            },
            concurrency: 1,
        }
    }

    fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> SourceImage {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x * y) % 256) as u8])
        });
        let path = dir.join(name);
        img.save(&path).unwrap();
        SourceImage {
            size_bytes: std::fs::metadata(&path).unwrap().len(),
            path,
            filename: name.to_string(),
            gallery: "g".to_string(),
            group: None,
            grouping: Grouping::None,
        }
    }

    #[test]
    fn plan_picks_tiers_by_size() {
        let cfg = NormalizeConfig::default();
        let mib = 1024 * 1024;

        let small = plan_for(2 * mib, &cfg);
        assert_eq!(small.action, NormalizeAction::Reencoded);
        assert_eq!(small.max_dimension, None);
        assert_eq!(small.quality, 90);

        assert_eq!(plan_for(10 * mib, &cfg).max_dimension, Some(3000));
        assert_eq!(plan_for(20 * mib, &cfg).max_dimension, Some(2500));
        let huge = plan_for(40 * mib, &cfg);
        assert_eq!((huge.max_dimension, huge.quality), (Some(2000), 70));
    }

    #[test]
    fn resizes_large_input_preserving_aspect() {
        let tmp = TempDir::new().unwrap();
        let src = write_png(tmp.path(), "wide.png", 400, 200);
        let out = tmp.path().join("out");

        let result = normalize_blocking(&src, &out, &policy(0, 100), false).unwrap();
        assert_eq!(result.action, NormalizeAction::Optimized);
        assert_eq!(result.filename, "wide.jpg");
        assert_eq!(image::image_dimensions(&result.path).unwrap(), (100, 50));
        assert_eq!(result.size_bytes, std::fs::metadata(&result.path).unwrap().len());
    }

    #[test]
    fn never_upscales() {
        let tmp = TempDir::new().unwrap();
        let src = write_png(tmp.path(), "tiny.png", 80, 40);
        let out = tmp.path().join("out");

        let result = normalize_blocking(&src, &out, &policy(0, 1000), false).unwrap();
        assert_eq!(image::image_dimensions(&result.path).unwrap(), (80, 40));
    }

    #[test]
    fn small_input_is_reencoded_without_resize() {
        let tmp = TempDir::new().unwrap();
        let src = write_png(tmp.path(), "small.png", 300, 120);
        let out = tmp.path().join("out");

        let result = normalize_blocking(&src, &out, &policy(u64::MAX, 50), false).unwrap();
        assert_eq!(result.action, NormalizeAction::Reencoded);
        assert_eq!(image::image_dimensions(&result.path).unwrap(), (300, 120));
        // Source untouched.
        assert!(src.path.exists());
        assert_eq!(std::fs::metadata(&src.path).unwrap().len(), src.size_bytes);
    }

    #[test]
    fn fallback_applies_once_when_over_cap() {
        let tmp = TempDir::new().unwrap();
        let src = write_png(tmp.path(), "big.png", 200, 100);
        let out = tmp.path().join("out");
        let mut cfg = policy(0, 150);
        cfg.hard_size_cap_bytes = 1;

        let result = normalize_blocking(&src, &out, &cfg, false).unwrap();
        assert_eq!(result.action, NormalizeAction::Fallback);
        assert_eq!(result.quality, 60);
        assert_eq!(image::image_dimensions(&result.path).unwrap(), (40, 20));
    }

    #[test]
    fn reuses_fresh_output_unless_forced() {
        let tmp = TempDir::new().unwrap();
        let src = write_png(tmp.path(), "again.png", 64, 64);
        let out = tmp.path().join("out");

        let first = normalize_blocking(&src, &out, &policy(0, 100), false).unwrap();
        assert_eq!(first.action, NormalizeAction::Optimized);

        let second = normalize_blocking(&src, &out, &policy(0, 100), false).unwrap();
        assert_eq!(second.action, NormalizeAction::Reused);
        assert_eq!(second.size_bytes, first.size_bytes);

        let forced = normalize_blocking(&src, &out, &policy(0, 100), true).unwrap();
        assert_eq!(forced.action, NormalizeAction::Optimized);
    }

    #[test]
    fn reused_output_reports_applied_settings() {
        let tmp = TempDir::new().unwrap();
        let src = write_png(tmp.path(), "params.png", 200, 100);
        let out = tmp.path().join("out");

        normalize_blocking(&src, &out, &policy(0, 100), false).unwrap();
        let reused = normalize_blocking(&src, &out, &policy(0, 100), false).unwrap();
        assert_eq!(reused.action, NormalizeAction::Reused);
        assert_eq!(reused.max_dimension, Some(100));
        assert_eq!(reused.quality, 80);
        assert!(record_path(&reused.path).exists());
    }

    #[test]
    fn policy_change_invalidates_reuse() {
        let tmp = TempDir::new().unwrap();
        let src = write_png(tmp.path(), "tiered.png", 200, 100);
        let out = tmp.path().join("out");

        let first = normalize_blocking(&src, &out, &policy(0, 100), false).unwrap();
        assert_eq!(image::image_dimensions(&first.path).unwrap(), (100, 50));

        let mut changed = policy(0, 60);
        changed.tiers[0].quality = 70;
        let second = normalize_blocking(&src, &out, &changed, false).unwrap();
        assert_eq!(second.action, NormalizeAction::Optimized);
        assert_eq!(image::image_dimensions(&second.path).unwrap(), (60, 30));

        // Concurrency does not change the bytes.
        let mut parallel = changed.clone();
        parallel.concurrency = 8;
        let third = normalize_blocking(&src, &out, &parallel, false).unwrap();
        assert_eq!(third.action, NormalizeAction::Reused);
        assert_eq!(third.quality, 70);
    }

    #[test]
    fn missing_record_forces_reencode() {
        let tmp = TempDir::new().unwrap();
        let src = write_png(tmp.path(), "norecord.png", 32, 32);
        let out = tmp.path().join("out");

        let first = normalize_blocking(&src, &out, &policy(0, 100), false).unwrap();
        std::fs::remove_file(record_path(&first.path)).unwrap();
        let second = normalize_blocking(&src, &out, &policy(0, 100), false).unwrap();
        assert_eq!(second.action, NormalizeAction::Optimized);
    }

    #[test]
    fn output_is_progressive_jpeg() {
        let tmp = TempDir::new().unwrap();
        let src = write_png(tmp.path(), "prog.png", 120, 80);
        let out = tmp.path().join("out");

        let result = normalize_blocking(&src, &out, &policy(0, 100), false).unwrap();
        let bytes = std::fs::read(&result.path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        // SOF2 marks a progressive DCT frame.
        assert!(bytes.windows(2).any(|w| w == [0xFF, 0xC2]));
    }

    #[test]
    fn corrupt_input_is_a_decode_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();
        let src = SourceImage {
            path,
            filename: "broken.jpg".to_string(),
            size_bytes: 21,
            gallery: "g".to_string(),
            group: None,
            grouping: Grouping::None,
        };

        let err = normalize_blocking(&src, &tmp.path().join("out"), &policy(0, 100), false)
            .unwrap_err();
        assert!(matches!(err, NormalizeError::Decode { .. }));
        assert!(!tmp.path().join("out").join("broken.jpg").exists());
    }

    #[tokio::test]
    async fn async_wrapper_runs_on_blocking_pool() {
        let tmp = TempDir::new().unwrap();
        let src = write_png(tmp.path(), "async.png", 10, 10);
        let out = tmp.path().join("out");

        let result = normalize(src, out.clone(), policy(0, 100), false).await.unwrap();
        assert_eq!(result.path, out.join("async.jpg"));
    }
}
