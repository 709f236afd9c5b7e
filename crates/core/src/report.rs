//! Markdown report assembly
//!
//! Renders the chronological narrative report: overview, change statistics,
//! and one section per analysis unit with collapsible file details.

use std::path::{Path, PathBuf};

use crate::analysis::AnalysisResult;
use crate::classifier::{AnalysisUnit, BreakpointResult, Tier};
use crate::error::Result;

/// Write `<output>/<project>_history.md` and return its path.
pub fn generate_report(
    project_name: &str,
    overview: &str,
    analysis_results: &[AnalysisResult],
    units: &[AnalysisUnit],
    snapshot_labels: &[String],
    breakpoints: &BreakpointResult,
    output_dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;
    let report_path = output_dir.join(format!("{project_name}_history.md"));

    let mut lines: Vec<String> = Vec::new();

    lines.push(format!("# Project History: {project_name}"));
    lines.push(String::new());
    lines.push(format!(
        "*Generated {}*",
        chrono::Local::now().format("%Y-%m-%d %H:%M")
    ));
    lines.push(String::new());

    lines.push("## Overview".to_string());
    lines.push(String::new());
    lines.push(overview.to_string());
    lines.push(String::new());

    lines.push("## Change Statistics".to_string());
    lines.push(String::new());
    lines.push(format!("- **Total snapshots:** {}", snapshot_labels.len()));
    lines.push(format!("- **Analysis units:** {}", units.len()));
    for tier in [Tier::Major, Tier::Moderate, Tier::Minor, Tier::MinorBatch] {
        let count = units.iter().filter(|u| u.tier == tier).count();
        if count > 0 {
            lines.push(format!("  - {}: {count}", tier.to_string().replace('_', " ")));
        }
    }
    if let (Some(first), Some(last)) = (snapshot_labels.first(), snapshot_labels.last()) {
        lines.push(format!("- **Date range:** {first} to {last}"));
    }
    lines.push(format!(
        "- **Breakpoint method:** {}",
        breakpoints.stats.method
    ));
    lines.push(format!(
        "- **Thresholds:** minor <= {:.4}, major >= {:.4}",
        breakpoints.minor_threshold, breakpoints.major_threshold
    ));
    lines.push(String::new());

    lines.push("## Version History".to_string());
    lines.push(String::new());

    for result in analysis_results {
        let label_range = format!(
            "{} -> {}",
            result.snapshot_labels.first().map(|s| s.as_str()).unwrap_or(""),
            result.snapshot_labels.last().map(|s| s.as_str()).unwrap_or("")
        );
        let tier_marker = match result.tier {
            Tier::Major => " (Major Change)",
            Tier::MinorBatch => " (Minor Changes)",
            _ => "",
        };
        lines.push(format!("### {label_range}{tier_marker}"));
        lines.push(String::new());

        let fs = &result.files_summary;
        let mut parts = Vec::new();
        if !fs.modified.is_empty() {
            parts.push(format!("{} modified", fs.modified.len()));
        }
        if !fs.added.is_empty() {
            parts.push(format!("{} added", fs.added.len()));
        }
        if !fs.removed.is_empty() {
            parts.push(format!("{} removed", fs.removed.len()));
        }
        if !fs.moved.is_empty() {
            parts.push(format!("{} moved", fs.moved.len()));
        }
        if !parts.is_empty() {
            lines.push(format!("**Files changed:** {}", parts.join(", ")));
            lines.push(String::new());
        }

        lines.push(result.narrative.clone());
        lines.push(String::new());

        let has_details = !fs.modified.is_empty()
            || !fs.added.is_empty()
            || !fs.removed.is_empty()
            || !fs.moved.is_empty();
        if has_details {
            lines.push("<details><summary>File details</summary>".to_string());
            lines.push(String::new());
            for (heading, files) in [
                ("Modified", &fs.modified),
                ("Added", &fs.added),
                ("Removed", &fs.removed),
            ] {
                if !files.is_empty() {
                    lines.push(format!("**{heading}:**"));
                    for file in files {
                        lines.push(format!("- {file}"));
                    }
                    lines.push(String::new());
                }
            }
            if !fs.moved.is_empty() {
                lines.push("**Moved:**".to_string());
                for mv in &fs.moved {
                    lines.push(format!("- {} -> {}", mv.from, mv.to));
                }
                lines.push(String::new());
            }
            lines.push("</details>".to_string());
            lines.push(String::new());
        }

        lines.push("---".to_string());
        lines.push(String::new());
    }

    std::fs::write(&report_path, lines.join("\n"))?;
    Ok(report_path)
}
