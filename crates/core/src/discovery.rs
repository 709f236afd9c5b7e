//! Snapshot discovery
//!
//! Finds, parses, and sorts zip snapshots for a project. Filenames follow
//! `<project>_<suffix>.zip` where the suffix is one of several dating or
//! versioning conventions:
//!   - `20250923b` / `20250909_1` (YYYYMMDD with optional letter and sub-number)
//!   - `250507` (YYMMDD)
//!   - `22-08-01`, `02-27-21`, `8-14-21` (separated dates, dash or underscore)
//!   - `0035` (incremental sequence, 3+ digits)
//!   - `0.1`, `2.3.1` (dotted version)
//!   - `v1` (v-prefixed version)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

/// One snapshot zip file belonging to a project.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Full path to the zip file
    pub path: PathBuf,
    /// Sortable key derived from the suffix
    pub sort_key: SortKey,
    /// The suffix verbatim, used as the display label
    pub label: String,
    /// The filename the snapshot was discovered under
    pub filename: String,
}

/// Sort key for a snapshot suffix.
///
/// Variant order controls cross-type sorting: versions before sequences
/// before dates. Dates compare by (year, month, day, letter ordinal,
/// sub-number), with `a` = 1 and no letter = 0.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SortKey {
    Version(Vec<u32>),
    Sequence(u64),
    Date {
        year: u16,
        month: u8,
        day: u8,
        letter: u8,
        sub: u32,
    },
}

static COMPACT_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4})(0[1-9]|1[0-2])(0[1-9]|[12]\d|3[01])([a-z]?)(?:_(\d+))?$").unwrap()
});
static SHORT_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{2})(0[1-9]|1[0-2])(0[1-9]|[12]\d|3[01])$").unwrap());
static SEPARATED_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2})[-_](\d{1,2})[-_](\d{2,4})$").unwrap());
static SEQUENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{3,}$").unwrap());
static DOTTED_VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+(?:\.\d+)+$").unwrap());
static V_VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[vV](\d+)$").unwrap());

/// Parse a filename suffix into a sort key. Returns `None` for suffixes
/// matching none of the known conventions.
pub fn parse_suffix(suffix: &str) -> Option<SortKey> {
    if let Some(caps) = COMPACT_DATE.captures(suffix) {
        let year: u16 = caps[1].parse().ok()?;
        let month: u8 = caps[2].parse().ok()?;
        let day: u8 = caps[3].parse().ok()?;
        let letter = caps
            .get(4)
            .and_then(|m| m.as_str().bytes().next())
            .map(|b| b - b'a' + 1)
            .unwrap_or(0);
        let sub: u32 = caps
            .get(5)
            .map(|m| m.as_str().parse().ok())
            .unwrap_or(Some(0))?;
        return Some(SortKey::Date {
            year,
            month,
            day,
            letter,
            sub,
        });
    }

    if let Some(caps) = SHORT_DATE.captures(suffix) {
        let year: u16 = caps[1].parse::<u16>().ok()? + 2000;
        let month: u8 = caps[2].parse().ok()?;
        let day: u8 = caps[3].parse().ok()?;
        return Some(SortKey::Date {
            year,
            month,
            day,
            letter: 0,
            sub: 0,
        });
    }

    if let Some(caps) = SEPARATED_DATE.captures(suffix) {
        let a: u16 = caps[1].parse().ok()?;
        let b: u16 = caps[2].parse().ok()?;
        let c: u16 = caps[3].parse().ok()?;
        if let Some(key) = parse_separated_date(suffix, a, b, c) {
            return Some(key);
        }
        return None;
    }

    if SEQUENCE.is_match(suffix) {
        return suffix.parse::<u64>().ok().map(SortKey::Sequence);
    }

    if DOTTED_VERSION.is_match(suffix) {
        let parts: Option<Vec<u32>> = suffix.split('.').map(|p| p.parse().ok()).collect();
        return parts.map(SortKey::Version);
    }

    if let Some(caps) = V_VERSION.captures(suffix) {
        let n: u32 = caps[1].parse().ok()?;
        return Some(SortKey::Version(vec![n]));
    }

    None
}

/// Disambiguate a separated date `a<sep>b<sep>c`.
///
/// Priority ladder: a 3-4 digit third component means MM-DD-YYYY; a first
/// component over 12 cannot be a month, so YY-MM-DD; a second component over
/// 12 cannot be a month, so MM-DD-YY; a third component over 23 is too high
/// for a recent two-digit year, so YY-MM-DD; anything left defaults to the
/// US MM-DD-YY convention.
fn parse_separated_date(suffix: &str, a: u16, b: u16, c: u16) -> Option<SortKey> {
    let (year, month, day) = if c >= 100 {
        (c, a, b)
    } else if a > 12 {
        (a + 2000, b, c)
    } else if b > 12 {
        (c + 2000, a, b)
    } else if c > 23 {
        (a + 2000, b, c)
    } else {
        tracing::warn!(
            suffix,
            "ambiguous separated date: could be MM-DD-YY ({a:02}-{b:02}-20{c:02}) \
             or YY-MM-DD (20{a:02}-{b:02}-{c:02}); assuming MM-DD-YY"
        );
        (c + 2000, a, b)
    };

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) || !(2000..=2099).contains(&year) {
        return None;
    }

    Some(SortKey::Date {
        year,
        month: month as u8,
        day: day as u8,
        letter: 0,
        sub: 0,
    })
}

/// Strip a case-insensitive `.zip` extension.
fn strip_zip_extension(filename: &str) -> Option<&str> {
    let idx = filename.len().checked_sub(4)?;
    if !filename.is_char_boundary(idx) {
        return None;
    }
    let (stem, ext) = filename.split_at(idx);
    ext.eq_ignore_ascii_case(".zip").then_some(stem)
}

/// Extract the suffix from `filename` if it matches `<project>_<suffix>.zip`.
/// The project name is matched case-insensitively.
fn extract_project_suffix<'a>(filename: &'a str, project_name: &str) -> Option<&'a str> {
    let stem = strip_zip_extension(filename)?;
    if stem.len() <= project_name.len() + 1 || !stem.is_char_boundary(project_name.len()) {
        return None;
    }
    let (name_part, rest) = stem.split_at(project_name.len());
    if !name_part.eq_ignore_ascii_case(project_name) {
        return None;
    }
    let mut rest_chars = rest.chars();
    if rest_chars.next() != Some('_') {
        return None;
    }
    let suffix = rest_chars.as_str();
    if suffix.is_empty() {
        None
    } else {
        Some(suffix)
    }
}

/// Find and sort all zip snapshots for a project.
///
/// Any matching filename with an unparseable suffix is a hard error (the
/// offending filenames are listed); fewer than two snapshots is a hard error.
pub fn discover_snapshots(zip_directory: &Path, project_name: &str) -> Result<Vec<SnapshotInfo>> {
    if !zip_directory.is_dir() {
        return Err(Error::Discovery(format!(
            "zip directory not found: {}",
            zip_directory.display()
        )));
    }

    let mut snapshots = Vec::new();
    let mut unparseable = Vec::new();

    for entry in std::fs::read_dir(zip_directory)? {
        let entry = entry?;
        let filename = entry.file_name().to_string_lossy().into_owned();
        let Some(suffix) = extract_project_suffix(&filename, project_name) else {
            continue;
        };
        let Some(sort_key) = parse_suffix(suffix) else {
            unparseable.push(filename.clone());
            continue;
        };
        if !entry.path().is_file() {
            continue;
        }
        snapshots.push(SnapshotInfo {
            path: entry.path(),
            sort_key,
            label: suffix.to_string(),
            filename,
        });
    }

    if !unparseable.is_empty() {
        unparseable.sort_unstable();
        return Err(Error::Discovery(format!(
            "found {} matching zip file(s) with unparseable suffixes:\n{}",
            unparseable.len(),
            unparseable
                .iter()
                .map(|f| format!("  {f}"))
                .collect::<Vec<_>>()
                .join("\n")
        )));
    }

    if snapshots.len() < 2 {
        return Err(Error::Discovery(format!(
            "need at least 2 snapshots for project '{project_name}', found {} in {}",
            snapshots.len(),
            zip_directory.display()
        )));
    }

    snapshots.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
    Ok(snapshots)
}

/// Scan a directory and list all detected project names with snapshot counts.
///
/// Project names are grouped by the longest prefix whose suffix parses,
/// lowercased. Only projects with two or more snapshots are returned.
pub fn list_projects(zip_directory: &Path) -> Result<BTreeMap<String, usize>> {
    if !zip_directory.is_dir() {
        return Err(Error::Discovery(format!(
            "zip directory not found: {}",
            zip_directory.display()
        )));
    }

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();

    for entry in std::fs::read_dir(zip_directory)? {
        let entry = entry?;
        let filename = entry.file_name().to_string_lossy().into_owned();
        let Some(stem) = strip_zip_extension(&filename) else {
            continue;
        };

        // Try progressively shorter prefixes until the suffix parses.
        let mut last_idx = stem.len();
        while let Some(idx) = stem[..last_idx].rfind('_') {
            if idx == 0 {
                break;
            }
            let candidate_suffix = &stem[idx + 1..];
            if parse_suffix(candidate_suffix).is_some() {
                let name = stem[..idx].to_lowercase();
                *counts.entry(name).or_insert(0) += 1;
                break;
            }
            last_idx = idx;
        }
    }

    counts.retain(|_, count| *count >= 2);
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn date(year: u16, month: u8, day: u8, letter: u8, sub: u32) -> SortKey {
        SortKey::Date {
            year,
            month,
            day,
            letter,
            sub,
        }
    }

    #[test]
    fn test_parse_compact_date() {
        assert_eq!(parse_suffix("20250923"), Some(date(2025, 9, 23, 0, 0)));
        assert_eq!(parse_suffix("20250923b"), Some(date(2025, 9, 23, 2, 0)));
        assert_eq!(parse_suffix("20250909_1"), Some(date(2025, 9, 9, 0, 1)));
    }

    #[test]
    fn test_parse_compact_date_invalid_month_falls_to_sequence() {
        // 20251301 fails date validation but is a valid 3+ digit sequence
        assert_eq!(parse_suffix("20251301"), Some(SortKey::Sequence(20251301)));
    }

    #[test]
    fn test_parse_short_date() {
        assert_eq!(parse_suffix("250507"), Some(date(2025, 5, 7, 0, 0)));
    }

    #[test]
    fn test_parse_separated_yy_mm_dd() {
        // First component > 12 cannot be a month
        assert_eq!(parse_suffix("22-08-01"), Some(date(2022, 8, 1, 0, 0)));
    }

    #[test]
    fn test_parse_separated_mm_dd_yy() {
        // Second component > 12 cannot be a month
        assert_eq!(parse_suffix("02-27-21"), Some(date(2021, 2, 27, 0, 0)));
        assert_eq!(parse_suffix("8-14-21"), Some(date(2021, 8, 14, 0, 0)));
    }

    #[test]
    fn test_parse_separated_third_over_23_is_day() {
        assert_eq!(parse_suffix("05-06-30"), Some(date(2005, 6, 30, 0, 0)));
    }

    #[test]
    fn test_parse_separated_ambiguous_defaults_us() {
        // 03-04-05 is truly ambiguous; frozen rule says MM-DD-YY
        assert_eq!(parse_suffix("03-04-05"), Some(date(2005, 3, 4, 0, 0)));
    }

    #[test]
    fn test_parse_separated_four_digit_year() {
        assert_eq!(parse_suffix("02-27-2021"), Some(date(2021, 2, 27, 0, 0)));
    }

    #[test]
    fn test_parse_separated_underscores() {
        assert_eq!(parse_suffix("22_08_01"), Some(date(2022, 8, 1, 0, 0)));
    }

    #[test]
    fn test_parse_separated_invalid_day_rejected() {
        assert_eq!(parse_suffix("13-32-21"), None);
    }

    #[test]
    fn test_parse_sequence() {
        assert_eq!(parse_suffix("0001"), Some(SortKey::Sequence(1)));
        assert_eq!(parse_suffix("235"), Some(SortKey::Sequence(235)));
    }

    #[test]
    fn test_two_digit_number_unparseable() {
        // Sequences need 3+ digits to distinguish from dates
        assert_eq!(parse_suffix("12"), None);
    }

    #[test]
    fn test_parse_versions() {
        assert_eq!(parse_suffix("0.1"), Some(SortKey::Version(vec![0, 1])));
        assert_eq!(
            parse_suffix("2.3.1"),
            Some(SortKey::Version(vec![2, 3, 1]))
        );
        assert_eq!(parse_suffix("v1"), Some(SortKey::Version(vec![1])));
        assert_eq!(parse_suffix("V10"), Some(SortKey::Version(vec![10])));
    }

    #[test]
    fn test_parse_garbage() {
        assert_eq!(parse_suffix("final"), None);
        assert_eq!(parse_suffix("backup2"), None);
        assert_eq!(parse_suffix(""), None);
    }

    #[test]
    fn test_cross_type_ordering() {
        let version = parse_suffix("1.0").unwrap();
        let sequence = parse_suffix("0005").unwrap();
        let date = parse_suffix("20240101").unwrap();
        assert!(version < sequence);
        assert!(sequence < date);
    }

    #[test]
    fn test_date_ordering_with_letters_and_subnumbers() {
        // Bare dates precede lettered ones on the same day
        let mut keys = vec![
            ("20250923b", parse_suffix("20250923b").unwrap()),
            ("20250909_2", parse_suffix("20250909_2").unwrap()),
            ("20250923", parse_suffix("20250923").unwrap()),
            ("20250909_1", parse_suffix("20250909_1").unwrap()),
        ];
        keys.sort_by(|a, b| a.1.cmp(&b.1));
        let order: Vec<&str> = keys.iter().map(|(label, _)| *label).collect();
        assert_eq!(order, ["20250909_1", "20250909_2", "20250923", "20250923b"]);
    }

    #[test]
    fn test_version_ordering() {
        let v01 = parse_suffix("0.1").unwrap();
        let v02 = parse_suffix("0.2").unwrap();
        let v1 = parse_suffix("1.0").unwrap();
        assert!(v01 < v02);
        assert!(v02 < v1);
    }

    #[test]
    fn test_extract_project_suffix() {
        assert_eq!(
            extract_project_suffix("Document_Analyzer_20250923.zip", "Document_Analyzer"),
            Some("20250923")
        );
        assert_eq!(
            extract_project_suffix("document_analyzer_20250923.zip", "Document_Analyzer"),
            Some("20250923")
        );
        assert_eq!(
            extract_project_suffix("Other_Project_20250923.zip", "Document_Analyzer"),
            None
        );
        assert_eq!(
            extract_project_suffix("Document_Analyzer.zip", "Document_Analyzer"),
            None
        );
        assert_eq!(
            extract_project_suffix("Document_Analyzer_.zip", "Document_Analyzer"),
            None
        );
    }

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"PK\x03\x04").unwrap();
    }

    #[test]
    fn test_discover_snapshots_sorted() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "proj_20250923b.zip");
        touch(dir.path(), "proj_20250909_1.zip");
        touch(dir.path(), "proj_20250923.zip");
        touch(dir.path(), "proj_20250909_2.zip");

        let snaps = discover_snapshots(dir.path(), "proj").unwrap();
        let labels: Vec<&str> = snaps.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(
            labels,
            ["20250909_1", "20250909_2", "20250923", "20250923b"]
        );
    }

    #[test]
    fn test_discover_unparseable_is_hard_error() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "proj_20250923.zip");
        touch(dir.path(), "proj_final.zip");
        touch(dir.path(), "proj_20250924.zip");

        let err = discover_snapshots(dir.path(), "proj").unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("proj_final.zip"));
        assert!(msg.contains("unparseable"));
    }

    #[test]
    fn test_discover_requires_two_snapshots() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "proj_20250923.zip");

        let err = discover_snapshots(dir.path(), "proj").unwrap_err();
        assert!(format!("{err}").contains("at least 2"));
    }

    #[test]
    fn test_discover_missing_directory() {
        let err = discover_snapshots(Path::new("/nonexistent/zips"), "proj").unwrap_err();
        assert!(format!("{err}").contains("not found"));
    }

    #[test]
    fn test_discover_ignores_other_projects() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "proj_20250923.zip");
        touch(dir.path(), "proj_20250924.zip");
        touch(dir.path(), "other_20250925.zip");
        touch(dir.path(), "notes.txt");

        let snaps = discover_snapshots(dir.path(), "proj").unwrap();
        assert_eq!(snaps.len(), 2);
    }

    #[test]
    fn test_list_projects() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "Alpha_Tool_20250101.zip");
        touch(dir.path(), "Alpha_Tool_20250102.zip");
        touch(dir.path(), "beta_0001.zip");
        touch(dir.path(), "beta_0002.zip");
        touch(dir.path(), "beta_0003.zip");
        touch(dir.path(), "solo_v1.zip");
        touch(dir.path(), "junk.txt");

        let projects = list_projects(dir.path()).unwrap();
        let entries: Vec<(&str, usize)> = projects
            .iter()
            .map(|(name, count)| (name.as_str(), *count))
            .collect();
        // Single-snapshot projects are excluded; names are lowercased and sorted
        assert_eq!(entries, [("alpha_tool", 2), ("beta", 3)]);
    }

    #[test]
    fn test_list_projects_backs_off_over_sub_numbers() {
        let dir = TempDir::new().unwrap();
        // The trailing "_1" alone does not parse (sequences need 3+ digits),
        // so grouping backs off one underscore to "20250909_1".
        touch(dir.path(), "Mentorship_Database_20250909_1.zip");
        touch(dir.path(), "Mentorship_Database_20250909_2.zip");

        let projects = list_projects(dir.path()).unwrap();
        assert_eq!(projects.get("mentorship_database"), Some(&2));
    }
}
