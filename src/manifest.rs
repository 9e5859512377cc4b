//! Manifest writer.
//!
//! A manifest is a pretty-printed JSON array of identifier strings, one file
//! per gallery, in the gallery's declared display order. It is always rebuilt
//! from a complete remote listing and replaces any previous file wholesale.
//!
//! # Sort policies
//!
//! | Policy | Order |
//! |--------|-------|
//! | `descending-numeric` | last run of digits in the final path segment, largest first; ties by full identifier, descending |
//! | `alphabetical` | full identifier, ascending (byte-wise) |
//!
//! Under `descending-numeric`, identifiers without any digits in their final
//! segment sort after all numbered ones.
//!
//! Nested galleries additionally get one manifest per sub-folder, cut from
//! the same listing with [`split_groups`].

use anyhow::{Context, Result};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;

use crate::models::{LogicalIdentifier, SortPolicy};

/// Return `ids` in display order for `policy`.
pub fn sort_identifiers(mut ids: Vec<String>, policy: SortPolicy) -> Vec<String> {
    match policy {
        SortPolicy::Alphabetical => ids.sort(),
        SortPolicy::DescendingNumeric => ids.sort_by(|a, b| descending_numeric(a, b)),
    }
    ids
}

/// Render the manifest body (trailing newline included).
pub fn render(ids: &[LogicalIdentifier], policy: SortPolicy) -> Result<String> {
    let sorted = sort_identifiers(ids.iter().map(|i| i.as_str().to_string()).collect(), policy);
    let mut json = serde_json::to_string_pretty(&sorted)?;
    json.push('\n');
    Ok(json)
}

/// Write the manifest at `path`, replacing any existing file.
///
/// The parent directory is created if needed. The content goes to a sibling
/// temp file first and is renamed into place, so readers never observe a
/// half-written manifest.
pub fn write_manifest(path: &Path, ids: &[LogicalIdentifier], policy: SortPolicy) -> Result<()> {
    let body = render(ids, policy)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    std::fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move manifest into place at {}", path.display()))?;
    Ok(())
}

/// Partition identifiers under `prefix` by their first sub-folder.
///
/// `events/khushi/1` under `events/` lands in group `khushi`. Identifiers
/// directly under `prefix`, or outside it, belong to no group and are left out.
pub fn split_groups(
    prefix: &str,
    ids: &[LogicalIdentifier],
) -> BTreeMap<String, Vec<LogicalIdentifier>> {
    let mut groups: BTreeMap<String, Vec<LogicalIdentifier>> = BTreeMap::new();
    for id in ids {
        let Some(rest) = id.as_str().strip_prefix(prefix) else {
            continue;
        };
        if let Some((group, _)) = rest.split_once('/') {
            if !group.is_empty() {
                groups.entry(group.to_string()).or_default().push(id.clone());
            }
        }
    }
    groups
}

/// Read a manifest back as a list of identifier strings.
pub fn read_manifest(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid manifest {}", path.display()))
}

fn descending_numeric(a: &str, b: &str) -> Ordering {
    match (numeric_key(a), numeric_key(b)) {
        (Some(x), Some(y)) => compare_digits(y, x).then_with(|| b.cmp(a)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.cmp(a),
    }
}

/// Last run of ASCII digits in the final `/`-separated segment.
fn numeric_key(id: &str) -> Option<&str> {
    let segment = id.rsplit('/').next().unwrap_or(id);
    let bytes = segment.as_bytes();
    let end = bytes.iter().rposition(|b| b.is_ascii_digit())? + 1;
    let start = bytes[..end]
        .iter()
        .rposition(|b| !b.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    Some(&segment[start..end])
}

/// Compare two digit strings by numeric value without parsing, so arbitrarily
/// long runs never overflow.
fn compare_digits(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn descending_numeric_orders_by_value() {
        let out = sort_identifiers(strs(&["12", "9", "100"]), SortPolicy::DescendingNumeric);
        assert_eq!(out, strs(&["100", "12", "9"]));
    }

    #[test]
    fn suffixed_variants_tie_break_descending() {
        let out = sort_identifiers(
            strs(&["g/883a", "g/900", "g/883b", "g/12"]),
            SortPolicy::DescendingNumeric,
        );
        assert_eq!(out, strs(&["g/900", "g/883b", "g/883a", "g/12"]));
    }

    #[test]
    fn uses_last_digit_run_of_final_segment() {
        let out = sort_identifiers(
            strs(&["2024/shoot-1_img-5", "2023/shoot-9_img-40", "1/cover"]),
            SortPolicy::DescendingNumeric,
        );
        assert_eq!(out, strs(&["2023/shoot-9_img-40", "2024/shoot-1_img-5", "1/cover"]));
    }

    #[test]
    fn leading_zeros_and_huge_numbers() {
        let out = sort_identifiers(
            strs(&["g/007", "g/70", "g/99999999999999999999999", "g/0"]),
            SortPolicy::DescendingNumeric,
        );
        assert_eq!(out, strs(&["g/99999999999999999999999", "g/70", "g/007", "g/0"]));
    }

    #[test]
    fn alphabetical_ascending() {
        let out = sort_identifiers(strs(&["b/2", "a/10", "a/1"]), SortPolicy::Alphabetical);
        assert_eq!(out, strs(&["a/1", "a/10", "b/2"]));
    }

    #[test]
    fn write_replaces_existing_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data").join("newborn.json");

        let ids: Vec<LogicalIdentifier> = ["newborn/1", "newborn/3", "newborn/2"]
            .iter()
            .map(|s| LogicalIdentifier::from_remote(*s))
            .collect();
        write_manifest(&path, &ids, SortPolicy::DescendingNumeric).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            raw,
            "[\n  \"newborn/3\",\n  \"newborn/2\",\n  \"newborn/1\"\n]\n"
        );

        write_manifest(&path, &ids[..1], SortPolicy::DescendingNumeric).unwrap();
        assert_eq!(read_manifest(&path).unwrap(), strs(&["newborn/1"]));
        assert!(!tmp.path().join("data").join("newborn.json.tmp").exists());
    }

    #[test]
    fn split_groups_by_first_subfolder() {
        let ids: Vec<LogicalIdentifier> = [
            "events/cover",
            "events/khushi/2",
            "events/khushi/1",
            "events/naming/a/b",
            "other/x/1",
        ]
        .iter()
        .map(|s| LogicalIdentifier::from_remote(*s))
        .collect();

        let groups = split_groups("events/", &ids);
        assert_eq!(groups.keys().collect::<Vec<_>>(), vec!["khushi", "naming"]);
        assert_eq!(groups["khushi"].len(), 2);
        assert_eq!(groups["naming"][0].as_str(), "events/naming/a/b");
    }

    #[test]
    fn empty_manifest_is_empty_array() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.json");
        write_manifest(&path, &[], SortPolicy::Alphabetical).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]\n");
    }
}
