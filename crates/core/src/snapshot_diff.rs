//! Snapshot diffing
//!
//! Extracts two zip snapshots into temporary directories and computes a
//! structural and textual diff: files added, removed, modified, moved, and
//! unchanged. Moves are detected by content hash. Status documents
//! (STATUS.md, CHANGELOG.md, devlog*, ...) are surfaced separately because
//! they carry the developer's own notes about the work.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Extensions skipped while diffing when the config does not override them.
pub const DEFAULT_BINARY_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".bmp", ".ico", ".svg", ".exe", ".dll", ".so", ".dylib",
    ".bin", ".zip", ".gz", ".tar", ".rar", ".7z", ".pdf", ".doc", ".docx", ".xls", ".xlsx",
    ".pyc", ".pyo", ".class", ".o", ".obj", ".db", ".sqlite", ".sqlite3", ".mp3", ".mp4", ".wav",
    ".avi", ".mov", ".ttf", ".otf", ".woff", ".woff2", ".ds_store", ".suo", ".cache",
    ".resources", ".pdb", ".nupkg", ".snk",
];

/// Known status/documentation basenames (matched case-insensitively).
const STATUS_DOC_NAMES: &[&str] = &[
    "status.md",
    "changelog.md",
    "todo.md",
    "notes.md",
    "readme.md",
    "development.md",
    "devlog.md",
    "history.md",
    "claude.md",
    "progress.md",
    "release_notes.md",
    "roadmap.md",
    "lessons_learned.md",
];

/// Basename prefixes that also mark a status document.
const STATUS_DOC_PREFIXES: &[&str] = &["devlog", "changelog", "release_notes", "todo"];

/// A modified file with its unified diff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileDiff {
    pub path: String,
    /// Unified diff text with `a/` and `b/` path headers
    pub diff_text: String,
    pub diff_line_count: usize,
}

/// Complete diff between two snapshots.
#[derive(Clone, Debug, Default)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<FileDiff>,
    /// (old_path, new_path) pairs, sorted by new path
    pub moved: Vec<(String, String)>,
    pub unchanged: Vec<String>,
    pub total_diff_lines: usize,
    pub files_changed_count: usize,
    pub new_file_listing: Vec<String>,
    pub old_file_listing: Vec<String>,
    pub total_lines_in_new: usize,
    /// Status-doc path -> content, from the newer snapshot
    pub status_docs: BTreeMap<String, String>,
    /// Subset of `modified` whose paths are status docs
    pub status_doc_diffs: Vec<FileDiff>,
}

/// Normalize a configured extension list: lowercase, dot-prefixed. An empty
/// list yields the built-in skiplist.
pub fn normalize_binary_extensions(extensions: &[String]) -> HashSet<String> {
    if extensions.is_empty() {
        return DEFAULT_BINARY_EXTENSIONS
            .iter()
            .map(|e| e.to_string())
            .collect();
    }
    extensions
        .iter()
        .map(|e| {
            let lower = e.to_lowercase();
            if lower.starts_with('.') {
                lower
            } else {
                format!(".{lower}")
            }
        })
        .collect()
}

fn is_binary(rel_path: &str, binary_extensions: &HashSet<String>) -> bool {
    let basename = rel_path.rsplit('/').next().unwrap_or(rel_path);
    match basename.rfind('.') {
        Some(idx) if idx > 0 => binary_extensions.contains(&basename[idx..].to_lowercase()),
        _ => false,
    }
}

/// Whether a path names a status/documentation file.
pub fn is_status_doc(path: &str) -> bool {
    let basename = path.rsplit('/').next().unwrap_or(path).to_lowercase();
    STATUS_DOC_NAMES.contains(&basename.as_str())
        || STATUS_DOC_PREFIXES.iter().any(|p| basename.starts_with(p))
}

fn file_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Read a file as text: UTF-8 first, Latin-1 as fallback.
fn read_text_file(path: &Path) -> Result<Option<String>> {
    let bytes = std::fs::read(path)?;
    match String::from_utf8(bytes) {
        Ok(text) => Ok(Some(text)),
        Err(err) => {
            let text = encoding_rs::mem::decode_latin1(err.as_bytes()).into_owned();
            Ok(Some(text))
        }
    }
}

fn count_lines(path: &Path) -> usize {
    match read_text_file(path) {
        Ok(Some(text)) => text.lines().count(),
        _ => 0,
    }
}

/// Extract a zip archive into `dest`.
fn extract_archive(zip_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(zip_path).map_err(|e| Error::Archive {
        path: zip_path.to_path_buf(),
        message: format!("cannot open archive: {e}"),
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| Error::Archive {
        path: zip_path.to_path_buf(),
        message: format!("cannot read archive: {e}"),
    })?;
    archive.extract(dest).map_err(|e| Error::Archive {
        path: zip_path.to_path_buf(),
        message: format!("cannot extract archive: {e}"),
    })
}

/// Find the effective root after extraction. Many zips wrap everything in a
/// single top-level directory; strip it so paths are project-relative.
/// Dotfile entries and `__MACOSX` do not count as content.
fn find_root_dir(extract_dir: &Path) -> Result<PathBuf> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(extract_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name == "__MACOSX" {
            continue;
        }
        entries.push(entry.path());
    }
    if entries.len() == 1 && entries[0].is_dir() {
        return Ok(entries[0].clone());
    }
    Ok(extract_dir.to_path_buf())
}

/// Walk a tree and return {relative path -> absolute path} for all files not
/// in the binary skiplist. Keys use `/` separators and sort lexically.
fn walk_files(
    root: &Path,
    binary_extensions: &HashSet<String>,
) -> Result<BTreeMap<String, PathBuf>> {
    let mut files = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Archive {
            path: root.to_path_buf(),
            message: format!("walk failed: {e}"),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if !is_binary(&rel, binary_extensions) {
            files.insert(rel, entry.path().to_path_buf());
        }
    }
    Ok(files)
}

/// Compute the unified diff between two versions of one file.
///
/// Returns `None` when the files are textually identical or when either side
/// cannot be read as text. `max_lines` of 0 means unlimited; otherwise the
/// diff is truncated with a marker noting the omitted count.
fn compute_diff(
    old_path: &Path,
    new_path: &Path,
    rel_path: &str,
    max_lines: usize,
) -> Result<Option<FileDiff>> {
    let (Some(old_text), Some(new_text)) =
        (read_text_file(old_path)?, read_text_file(new_path)?)
    else {
        return Ok(None);
    };

    let text_diff = similar::TextDiff::from_lines(&old_text, &new_text);
    let unified = text_diff
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{rel_path}"), &format!("b/{rel_path}"))
        .to_string();
    if unified.is_empty() {
        return Ok(None);
    }

    let mut lines: Vec<String> = unified.lines().map(|l| l.to_string()).collect();
    if max_lines > 0 && lines.len() > max_lines {
        let truncated = lines.len() - max_lines;
        lines.truncate(max_lines);
        lines.push(format!("... ({truncated} more lines truncated)"));
    }

    let diff_line_count = lines.len();
    Ok(Some(FileDiff {
        path: rel_path.to_string(),
        diff_text: lines.join("\n"),
        diff_line_count,
    }))
}

/// Pair files with identical content hashes across the only-old and only-new
/// sets. Hashes with unequal copy counts pair positionally; surplus copies
/// stay in added/removed. Pairing order can misalign logically related moves
/// when duplicates exist; that is an accepted limitation.
fn detect_moves(
    only_old: &BTreeMap<String, PathBuf>,
    only_new: &BTreeMap<String, PathBuf>,
) -> Result<Vec<(String, String)>> {
    let mut old_hashes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (rel, abs) in only_old {
        old_hashes.entry(file_hash(abs)?).or_default().push(rel.clone());
    }
    let mut new_hashes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (rel, abs) in only_new {
        new_hashes.entry(file_hash(abs)?).or_default().push(rel.clone());
    }

    let mut moved = Vec::new();
    for (hash, old_list) in &old_hashes {
        if let Some(new_list) = new_hashes.get(hash) {
            for (old, new) in old_list.iter().zip(new_list.iter()) {
                moved.push((old.clone(), new.clone()));
            }
        }
    }
    moved.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(moved)
}

/// Extract and diff two zip snapshots.
///
/// `binary_extensions` overrides the built-in skiplist when non-empty.
/// `max_diff_lines` bounds each file's diff (0 = unlimited).
pub fn diff_snapshots(
    old_zip: &Path,
    new_zip: &Path,
    binary_extensions: &[String],
    max_diff_lines: usize,
) -> Result<SnapshotDiff> {
    let bin_ext = normalize_binary_extensions(binary_extensions);

    let tmp = tempfile::tempdir()?;
    let old_dir = tmp.path().join("old");
    let new_dir = tmp.path().join("new");
    extract_archive(old_zip, &old_dir)?;
    extract_archive(new_zip, &new_dir)?;

    let old_root = find_root_dir(&old_dir)?;
    let new_root = find_root_dir(&new_dir)?;

    let old_files = walk_files(&old_root, &bin_ext)?;
    let new_files = walk_files(&new_root, &bin_ext)?;

    let old_paths: BTreeSet<&String> = old_files.keys().collect();
    let new_paths: BTreeSet<&String> = new_files.keys().collect();

    let only_old: BTreeMap<String, PathBuf> = old_files
        .iter()
        .filter(|(p, _)| !new_paths.contains(p))
        .map(|(p, a)| (p.clone(), a.clone()))
        .collect();
    let only_new: BTreeMap<String, PathBuf> = new_files
        .iter()
        .filter(|(p, _)| !old_paths.contains(p))
        .map(|(p, a)| (p.clone(), a.clone()))
        .collect();

    let moved = detect_moves(&only_old, &only_new)?;
    let moved_old: HashSet<&String> = moved.iter().map(|(old, _)| old).collect();
    let moved_new: HashSet<&String> = moved.iter().map(|(_, new)| new).collect();

    let added: Vec<String> = only_new
        .keys()
        .filter(|p| !moved_new.contains(p))
        .cloned()
        .collect();
    let removed: Vec<String> = only_old
        .keys()
        .filter(|p| !moved_old.contains(p))
        .cloned()
        .collect();

    let mut modified = Vec::new();
    let mut unchanged = Vec::new();
    for path in old_paths.intersection(&new_paths) {
        let old_abs = &old_files[*path];
        let new_abs = &new_files[*path];
        if file_hash(old_abs)? == file_hash(new_abs)? {
            unchanged.push((*path).clone());
            continue;
        }
        match compute_diff(old_abs, new_abs, path, max_diff_lines)? {
            Some(fd) => modified.push(fd),
            None => {
                tracing::warn!(path = path.as_str(), "contents differ but no text diff could be computed; treating as unchanged");
                unchanged.push((*path).clone());
            }
        }
    }

    let total_diff_lines = modified.iter().map(|fd| fd.diff_line_count).sum();
    let total_lines_in_new = new_files.values().map(|abs| count_lines(abs)).sum();

    let mut status_docs = BTreeMap::new();
    for (rel, abs) in &new_files {
        if is_status_doc(rel) {
            if let Ok(Some(content)) = read_text_file(abs) {
                status_docs.insert(rel.clone(), content);
            }
        }
    }
    let status_doc_diffs: Vec<FileDiff> = modified
        .iter()
        .filter(|fd| is_status_doc(&fd.path))
        .cloned()
        .collect();

    let files_changed_count = added.len() + removed.len() + modified.len() + moved.len();

    Ok(SnapshotDiff {
        added,
        removed,
        modified,
        moved,
        unchanged,
        total_diff_lines,
        files_changed_count,
        new_file_listing: new_files.keys().cloned().collect(),
        old_file_listing: old_files.keys().cloned().collect(),
        total_lines_in_new,
        status_docs,
        status_doc_diffs,
    })
}

/// Extract a single snapshot and return its file listing and text contents.
/// Used for project-summary generation and the snapshot browser tools.
pub fn get_snapshot_files(
    zip_path: &Path,
    binary_extensions: &[String],
) -> Result<(Vec<String>, BTreeMap<String, String>)> {
    let bin_ext = normalize_binary_extensions(binary_extensions);

    let tmp = tempfile::tempdir()?;
    extract_archive(zip_path, tmp.path())?;
    let root = find_root_dir(tmp.path())?;
    let files = walk_files(&root, &bin_ext)?;

    let listing: Vec<String> = files.keys().cloned().collect();
    let mut contents = BTreeMap::new();
    for (rel, abs) in &files {
        if let Some(text) = read_text_file(abs)? {
            contents.insert(rel.clone(), text);
        }
    }
    Ok((listing, contents))
}
