//! Shared filesystem helpers

use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Write `contents` to `path` atomically: write to a sibling temp file, then
/// rename over the target. Retries with exponential backoff on transient
/// errors (file locking on some platforms).
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    const MAX_RETRIES: u32 = 5;
    let mut delay = Duration::from_millis(100);
    let mut last_err = None;

    for attempt in 0..MAX_RETRIES {
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        match std::fs::write(tmp.path(), contents).and_then(|_| {
            // persist() renames over an existing target on Unix; on Windows
            // rename-over-existing can fail while the target is open, which
            // is what the retry loop covers.
            tmp.persist(path)
                .map(|_| ())
                .map_err(|e| e.error)
        }) {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < MAX_RETRIES {
                    std::thread::sleep(delay);
                    delay *= 2;
                }
            }
        }
    }

    Err(last_err
        .expect("retry loop ran at least once")
        .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.json");
        write_atomic(&path, "{\"a\": 1}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn test_write_atomic_overwrites_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.json");
        write_atomic(&path, "first").unwrap();
        write_atomic(&path, "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn test_write_atomic_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/out.json");
        write_atomic(&path, "x").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "x");
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.json");
        write_atomic(&path, "data").unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }
}
