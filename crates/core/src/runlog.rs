//! Per-run interaction log
//!
//! Every LLM interaction in a run is appended to `<output>/logNNNN.json`,
//! where NNNN is the first unused number at session start. Cache hits are
//! recorded with a CACHED marker so a run can be audited without re-querying.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Result;

/// One logged LLM interaction.
#[derive(Debug, Serialize)]
pub struct LogEntry<'a> {
    pub timestamp: String,
    pub model: &'a str,
    /// "CACHED" when the response came from the local response cache
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<&'a str>,
    pub stable_prompt: &'a str,
    pub query_prompt: &'a str,
    pub response: &'a str,
    pub cache_created: u64,
    pub cache_read: u64,
}

/// Append-only log file for one run.
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    /// Create a log at the first unused `logNNNN.json` in `dir`.
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut count = 1u32;
        let path = loop {
            let candidate = dir.join(format!("log{count:04}.json"));
            if !candidate.exists() {
                break candidate;
            }
            count += 1;
        };
        std::fs::write(&path, "")?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one interaction record.
    pub fn append(&self, entry: &LogEntry<'_>) -> Result<()> {
        let mut file = std::fs::OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(serde_json::to_string_pretty(entry)?.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry<'a>(response: &'a str) -> LogEntry<'a> {
        LogEntry {
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            model: "sonnet",
            cached: None,
            stable_prompt: "stable",
            query_prompt: "query",
            response,
            cache_created: 0,
            cache_read: 0,
        }
    }

    #[test]
    fn test_creates_first_unused_number() {
        let dir = TempDir::new().unwrap();
        let first = RunLog::create(dir.path()).unwrap();
        assert!(first.path().ends_with("log0001.json"));
        let second = RunLog::create(dir.path()).unwrap();
        assert!(second.path().ends_with("log0002.json"));
    }

    #[test]
    fn test_append_accumulates() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::create(dir.path()).unwrap();
        log.append(&entry("one")).unwrap();
        log.append(&entry("two")).unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert!(contents.contains("\"one\""));
        assert!(contents.contains("\"two\""));
    }

    #[test]
    fn test_cached_marker_serialized() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::create(dir.path()).unwrap();
        let mut e = entry("r");
        e.cached = Some("CACHED");
        log.append(&e).unwrap();
        assert!(std::fs::read_to_string(log.path())
            .unwrap()
            .contains("CACHED"));
    }
}
