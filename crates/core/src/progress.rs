//! Per-project analysis progress
//!
//! Provides resumability: completed analysis units, their results, and the
//! cached project summary are checkpointed to
//! `<output>/<project>_progress.json` after every mutation. Progress is
//! invalidated when the snapshot set changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::analysis::AnalysisResult;
use crate::error::Result;
use crate::util::write_atomic;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ProgressData {
    #[serde(default)]
    project_name: String,
    #[serde(default)]
    snapshots_hash: String,
    #[serde(default)]
    snapshot_count: usize,
    #[serde(default)]
    project_summary: Option<String>,
    #[serde(default)]
    completed_units: Vec<usize>,
    /// Keyed by unit index rendered as a string, matching the JSON contract
    #[serde(default)]
    analysis_results: BTreeMap<String, AnalysisResult>,
    #[serde(default)]
    last_updated: String,
}

/// Tracks analysis progress for a single project.
pub struct ProgressTracker {
    progress_file: PathBuf,
    data: ProgressData,
}

impl ProgressTracker {
    /// Load progress for a project, starting fresh when the file is missing
    /// or unreadable.
    pub fn load(project_name: &str, output_dir: &Path) -> Self {
        let progress_file = output_dir.join(format!("{project_name}_progress.json"));
        let data = if progress_file.is_file() {
            match std::fs::read_to_string(&progress_file)
                .map_err(|e| e.to_string())
                .and_then(|c| serde_json::from_str(&c).map_err(|e| e.to_string()))
            {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(
                        path = %progress_file.display(),
                        error = e,
                        "could not load progress file, starting fresh"
                    );
                    ProgressData::default()
                }
            }
        } else {
            ProgressData::default()
        };
        Self {
            progress_file,
            data,
        }
    }

    /// Fingerprint of a snapshot set: SHA-256 over the sorted paths,
    /// truncated to 16 hex characters.
    pub fn compute_snapshots_hash(snapshot_paths: &[PathBuf]) -> String {
        let mut paths: Vec<String> = snapshot_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        paths.sort();
        let mut hasher = Sha256::new();
        hasher.update(paths.join("\n").as_bytes());
        format!("{:x}", hasher.finalize())[..16].to_string()
    }

    /// Whether the saved progress matches the current snapshot set.
    pub fn is_valid_for(&self, snapshots_hash: &str) -> bool {
        self.data.snapshots_hash == snapshots_hash
    }

    /// Initialize or reset progress for a new analysis run.
    pub fn initialize(
        &mut self,
        project_name: &str,
        snapshots_hash: &str,
        snapshot_count: usize,
    ) -> Result<()> {
        self.data = ProgressData {
            project_name: project_name.to_string(),
            snapshots_hash: snapshots_hash.to_string(),
            snapshot_count,
            ..Default::default()
        };
        self.save()
    }

    pub fn project_summary(&self) -> Option<&str> {
        self.data.project_summary.as_deref()
    }

    pub fn set_project_summary(&mut self, summary: &str) -> Result<()> {
        self.data.project_summary = Some(summary.to_string());
        self.save()
    }

    pub fn is_unit_completed(&self, unit_index: usize) -> bool {
        self.data.completed_units.contains(&unit_index)
    }

    /// Mark a unit completed and store its result. Indices stay sorted.
    pub fn mark_unit_completed(&mut self, unit_index: usize, result: &AnalysisResult) -> Result<()> {
        if !self.data.completed_units.contains(&unit_index) {
            self.data.completed_units.push(unit_index);
            self.data.completed_units.sort_unstable();
        }
        self.data
            .analysis_results
            .insert(unit_index.to_string(), result.clone());
        self.save()
    }

    pub fn unit_result(&self, unit_index: usize) -> Option<&AnalysisResult> {
        self.data.analysis_results.get(&unit_index.to_string())
    }

    pub fn completed_count(&self) -> usize {
        self.data.completed_units.len()
    }

    /// Human-readable resume status.
    pub fn status_summary(&self, total_units: usize) -> String {
        format!(
            "Progress: {}/{} units completed, project summary {}",
            self.completed_count(),
            total_units,
            if self.data.project_summary.is_some() {
                "cached"
            } else {
                "not yet generated"
            }
        )
    }

    fn save(&mut self) -> Result<()> {
        self.data.last_updated = chrono::Local::now().to_rfc3339();
        let contents = serde_json::to_string_pretty(&self.data)?;
        write_atomic(&self.progress_file, &contents)
    }
}
