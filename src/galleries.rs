use anyhow::Result;
use std::fmt::Write as _;

use crate::config::{Config, Gallery};

pub fn list_galleries(config: &Config) -> Result<()> {
    print!("{}", render_galleries(&config.galleries()));
    Ok(())
}

pub fn render_galleries(galleries: &[Gallery]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<16} {:<16} {:<20} {:<18} {:<10} SOURCES",
        "GALLERY", "FOLDER", "MANIFEST", "SORT", "OVERWRITE"
    );

    for g in galleries {
        let missing = g.sources.iter().filter(|p| !p.is_dir()).count();
        let status = if missing == 0 {
            "OK".to_string()
        } else if missing == g.sources.len() {
            if g.required {
                "MISSING (required)".to_string()
            } else {
                "MISSING".to_string()
            }
        } else {
            format!("PARTIAL ({} of {} missing)", missing, g.sources.len())
        };

        let manifest = g
            .manifest_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "-".to_string());

        let _ = writeln!(
            out,
            "{:<16} {:<16} {:<20} {:<18} {:<10} {}",
            g.slug,
            g.remote_prefix(),
            manifest,
            g.sort.to_string(),
            g.overwrite,
            status
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Grouping, SortPolicy};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn gallery(slug: &str, sources: Vec<PathBuf>, manifest: Option<PathBuf>) -> Gallery {
        Gallery {
            slug: slug.to_string(),
            name: slug.to_string(),
            sources,
            folder: slug.to_string(),
            manifest_path: manifest,
            scratch_dir: PathBuf::from("/tmp/unused"),
            sort: SortPolicy::DescendingNumeric,
            overwrite: true,
            grouping: Grouping::None,
            group_manifests: None,
            required: false,
            prune_stale: false,
        }
    }

    #[test]
    fn shows_source_status_and_manifest() {
        let tmp = TempDir::new().unwrap();
        let present = tmp.path().join("newborn");
        std::fs::create_dir_all(&present).unwrap();

        let out = render_galleries(&[
            gallery("newborn", vec![present], Some(tmp.path().join("newborn.json"))),
            gallery("hero", vec![tmp.path().join("absent")], None),
        ]);

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("GALLERY"));
        assert!(lines[1].contains("newborn/"));
        assert!(lines[1].contains("newborn.json"));
        assert!(lines[1].ends_with("OK"));
        assert!(lines[2].contains(" - "));
        assert!(lines[2].ends_with("MISSING"));
    }
}
