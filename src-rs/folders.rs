use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp", "tif", "tiff"];
pub const EXCLUDED_DIRS: &[&str] = &[".git", ".venv", "__pycache__", "target"];

#[derive(Debug, Clone, Serialize)]
pub struct FolderInfo {
    pub index: usize,
    pub name: String,
    pub path: PathBuf,
    pub image_files: usize,
    pub total_bytes: u64,
    #[serde(skip)]
    pub last_modified: Option<SystemTime>,
    #[serde(rename = "last_modified")]
    pub last_modified_display: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderStats {
    pub image_files: usize,
    pub total_bytes: u64,
    pub last_modified: Option<SystemTime>,
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let lower = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

/// Image count, size and newest mtime over the image files directly in
/// `folder`. Unreadable folders count as empty.
pub fn folder_stats(folder: &Path) -> FolderStats {
    let mut stats = FolderStats::default();
    let Ok(entries) = fs::read_dir(folder) else {
        return stats;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() || !is_image_file(&path) {
            continue;
        }
        stats.image_files += 1;
        stats.total_bytes += meta.len();
        if let Ok(mtime) = meta.modified() {
            stats.last_modified = Some(match stats.last_modified {
                Some(prev) if prev >= mtime => prev,
                _ => mtime,
            });
        }
    }
    stats
}

/// Immediate subdirectories of `base` holding at least one image, sorted
/// case-insensitively and numbered from 1.
pub fn discover_candidate_folders(base: &Path) -> Result<Vec<FolderInfo>> {
    let entries = fs::read_dir(base)
        .with_context(|| format!("failed to list base directory: {}", base.display()))?;

    let mut dirs: Vec<(String, PathBuf)> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| (e.file_name().to_string_lossy().to_string(), e.path()))
        .filter(|(name, _)| !name.starts_with('.') && !EXCLUDED_DIRS.contains(&name.as_str()))
        .collect();
    dirs.sort_by_key(|(name, _)| name.to_lowercase());

    let mut out = Vec::new();
    for (name, path) in dirs {
        let stats = folder_stats(&path);
        if stats.image_files == 0 {
            continue;
        }
        out.push(FolderInfo {
            index: out.len() + 1,
            name,
            path,
            image_files: stats.image_files,
            total_bytes: stats.total_bytes,
            last_modified: stats.last_modified,
            last_modified_display: format_mtime(stats.last_modified),
        });
    }
    Ok(out)
}

pub fn format_mtime(mtime: Option<SystemTime>) -> String {
    match mtime {
        Some(t) => DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M").to_string(),
        None => "-".to_string(),
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes}B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1}{}", UNITS[unit])
}

pub fn render_candidates(candidates: &[FolderInfo]) -> String {
    let name_width = candidates.iter().map(|c| c.name.chars().count()).max().unwrap_or(0);
    let mut lines = Vec::with_capacity(candidates.len());
    for c in candidates {
        lines.push(format!(
            " {:>2}) {:<name_width$}  images={:<5}  size={:>8}  updated={}",
            c.index,
            c.name,
            c.image_files,
            human_bytes(c.total_bytes),
            c.last_modified_display,
        ));
    }
    lines.join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Indices(Vec<usize>),
    Quit,
}

/// Parse `1`, `1,3`, `2-5`, `all`, or `q`. Indices are 1-based and must be
/// within `1..=max_index`; the result is sorted and de-duplicated.
pub fn parse_selection(input: &str, max_index: usize) -> Result<Selection> {
    let normalized = input.trim().to_lowercase();
    match normalized.as_str() {
        "q" | "quit" | "exit" => return Ok(Selection::Quit),
        "a" | "all" => return Ok(Selection::All),
        "" => bail!("empty selection"),
        _ => {}
    }

    let mut picked = BTreeSet::new();
    for token in normalized
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
    {
        if let Some((lo, hi)) = token.split_once('-') {
            let (Some(lo), Some(hi)) = (parse_index(lo), parse_index(hi)) else {
                bail!("invalid token: {token}");
            };
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            if lo < 1 || hi > max_index {
                bail!("out of range: {lo}-{hi} (valid 1-{max_index})");
            }
            picked.extend(lo..=hi);
        } else if let Some(idx) = parse_index(token) {
            picked.insert(idx);
        } else {
            bail!("invalid token: {token}");
        }
    }

    let bad: Vec<usize> = picked
        .iter()
        .copied()
        .filter(|&i| i < 1 || i > max_index)
        .collect();
    if !bad.is_empty() {
        bail!("out of range: {bad:?} (valid 1-{max_index})");
    }
    if picked.is_empty() {
        return Ok(Selection::Quit);
    }
    Ok(Selection::Indices(picked.into_iter().collect()))
}

fn parse_index(raw: &str) -> Option<usize> {
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    let home = env::var_os("HOME").or_else(|| env::var_os("USERPROFILE"));
    match (raw.strip_prefix('~'), home) {
        (Some(rest), Some(home)) if rest.is_empty() || rest.starts_with(['/', '\\']) => {
            PathBuf::from(home).join(rest.trim_start_matches(['/', '\\']))
        }
        _ => PathBuf::from(raw),
    }
}

/// Absolute paths and paths that exist relative to the working directory
/// are used as-is; anything else is a folder name under `base`.
pub fn resolve_folder_arg(base: &Path, folder: &str) -> PathBuf {
    let candidate = expand_home(folder);
    let resolved = if candidate.is_absolute() || candidate.exists() {
        candidate
    } else {
        base.join(folder)
    };
    fs::canonicalize(&resolved).unwrap_or(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(path: &Path, bytes: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn discovery_filters_and_sorts() {
        let dir = tempdir().unwrap();
        let base = dir.path();
        touch(&base.join("zeta").join("screenshot_0001.png"), 10);
        touch(&base.join("Alpha").join("a.JPG"), 5);
        touch(&base.join("Alpha").join("b.webp"), 7);
        touch(&base.join("Alpha").join("notes.txt"), 1000);
        touch(&base.join("docs").join("readme.md"), 3);
        touch(&base.join(".hidden").join("x.png"), 1);
        touch(&base.join("__pycache__").join("x.png"), 1);
        touch(&base.join(".git").join("x.png"), 1);
        touch(&base.join("stray.png"), 1);
        fs::create_dir_all(base.join("empty")).unwrap();

        let found = discover_candidate_folders(base).unwrap();
        let names: Vec<&str> = found.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "zeta"]);
        assert_eq!(found[0].index, 1);
        assert_eq!(found[0].image_files, 2);
        assert_eq!(found[0].total_bytes, 12);
        assert!(found[0].last_modified.is_some());
        assert_eq!(found[1].index, 2);
    }

    #[test]
    fn nested_images_do_not_count() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("outer").join("inner").join("a.png"), 4);
        assert!(discover_candidate_folders(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn missing_base_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(discover_candidate_folders(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn human_bytes_formats_units() {
        assert_eq!(human_bytes(0), "0B");
        assert_eq!(human_bytes(1023), "1023B");
        assert_eq!(human_bytes(1024), "1.0KB");
        assert_eq!(human_bytes(1536), "1.5KB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0MB");
        assert_eq!(human_bytes(3 * 1024u64.pow(5)), "3072.0TB");
    }

    #[test]
    fn selection_lists_and_ranges() {
        assert_eq!(
            parse_selection("1,3", 5).unwrap(),
            Selection::Indices(vec![1, 3])
        );
        assert_eq!(
            parse_selection("2-4", 5).unwrap(),
            Selection::Indices(vec![2, 3, 4])
        );
        assert_eq!(
            parse_selection(" 4-2, 1 1 ", 5).unwrap(),
            Selection::Indices(vec![1, 2, 3, 4])
        );
        assert_eq!(parse_selection("ALL", 5).unwrap(), Selection::All);
        assert_eq!(parse_selection("a", 5).unwrap(), Selection::All);
        assert_eq!(parse_selection("q", 5).unwrap(), Selection::Quit);
        assert_eq!(parse_selection("exit", 5).unwrap(), Selection::Quit);
    }

    #[test]
    fn selection_rejects_out_of_range_naming_indices() {
        let err = parse_selection("0,2,7", 5).unwrap_err().to_string();
        assert!(err.contains("[0, 7]"), "{err}");
        assert!(parse_selection("5-6", 5).is_err());
    }

    #[test]
    fn huge_range_is_rejected_without_expanding() {
        let err = parse_selection("1-3000000", 5).unwrap_err().to_string();
        assert_eq!(err, "out of range: 1-3000000 (valid 1-5)");

        let err = parse_selection(&format!("2-{}", usize::MAX), 5)
            .unwrap_err()
            .to_string();
        assert!(err.len() < 80, "{err}");
        assert!(parse_selection("0-2", 5).is_err());
    }

    #[test]
    fn selection_rejects_malformed_tokens() {
        let err = parse_selection("1,x", 5).unwrap_err().to_string();
        assert!(err.contains("x"));
        assert!(parse_selection("1-", 5).is_err());
        assert!(parse_selection("-2", 5).is_err());
        assert!(parse_selection("1-2-3", 5).is_err());
        assert!(parse_selection("", 5).is_err());
    }

    #[test]
    fn render_aligns_names() {
        let rows = vec![
            FolderInfo {
                index: 1,
                name: "a".to_string(),
                path: PathBuf::from("a"),
                image_files: 3,
                total_bytes: 2048,
                last_modified: None,
                last_modified_display: "-".to_string(),
            },
            FolderInfo {
                index: 2,
                name: "longer".to_string(),
                path: PathBuf::from("longer"),
                image_files: 1,
                total_bytes: 1,
                last_modified: None,
                last_modified_display: "-".to_string(),
            },
        ];
        let text = render_candidates(&rows);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("  1) a       images=3"));
        assert!(lines[1].contains("size=      1B"));
    }

    #[test]
    fn folder_arg_resolves_against_base() {
        let dir = tempdir().unwrap();
        let book = dir.path().join("permutation_city");
        fs::create_dir_all(&book).unwrap();

        let resolved = resolve_folder_arg(dir.path(), "permutation_city");
        assert_eq!(resolved, fs::canonicalize(&book).unwrap());

        let absolute = resolve_folder_arg(Path::new("/elsewhere"), book.to_str().unwrap());
        assert_eq!(absolute, fs::canonicalize(&book).unwrap());
    }
}
