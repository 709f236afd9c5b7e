//! Change classification and analysis planning
//!
//! Local-only analysis of snapshot diffs: normalized change magnitudes,
//! adaptive breakpoint detection over the magnitude distribution, and
//! grouping of transitions into analysis units (batched minors, individual
//! moderates, deep-dive majors).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::snapshot_diff::SnapshotDiff;

/// Analysis depth tier for one unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    MinorBatch,
    Minor,
    Moderate,
    Major,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::MinorBatch => write!(f, "minor_batch"),
            Tier::Minor => write!(f, "minor"),
            Tier::Moderate => write!(f, "moderate"),
            Tier::Major => write!(f, "major"),
        }
    }
}

/// Descriptive statistics of a magnitude distribution.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DistributionStats {
    pub method: String,
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub q1: f64,
    pub q3: f64,
}

/// Result of adaptive breakpoint detection.
#[derive(Clone, Debug)]
pub struct BreakpointResult {
    /// Magnitudes at or below this are minor
    pub minor_threshold: f64,
    /// Magnitudes at or above this are major
    pub major_threshold: f64,
    pub stats: DistributionStats,
}

/// One planned unit of LLM analysis.
#[derive(Clone, Debug)]
pub struct AnalysisUnit {
    /// Snapshot index range (start, end) where end is the post-change index
    pub snapshot_range: (usize, usize),
    /// Transition indices covered, contiguous and ascending
    pub transitions: Vec<usize>,
    pub tier: Tier,
    pub total_magnitude: f64,
    pub description: String,
    /// Major units trigger a project-summary refresh after completion
    pub is_inflection_point: bool,
}

/// Compute the normalized change magnitude for one transition.
///
/// Typical values: under 0.01 trivial, 0.01-0.05 minor, 0.05-0.20 moderate,
/// 0.20+ major. Structural changes weigh highest because they indicate
/// reorganization.
pub fn compute_magnitude(diff: &SnapshotDiff) -> f64 {
    let total_lines = diff.total_lines_in_new.max(1) as f64;
    let total_files = diff.new_file_listing.len().max(1) as f64;

    let diff_ratio = diff.total_diff_lines as f64 / total_lines;
    let structural_changes = (diff.added.len() + diff.removed.len() + diff.moved.len()) as f64;
    let structural_ratio = structural_changes / total_files;
    let modification_breadth = diff.modified.len() as f64 / total_files;

    0.4 * diff_ratio + 0.35 * structural_ratio + 0.25 * modification_breadth
}

fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

/// Find adaptive breakpoints in a magnitude distribution.
///
/// Uses gap-based natural breaks (the two largest gaps between consecutive
/// sorted values become the tier boundaries), with percentile fallbacks for
/// short or uniform distributions.
pub fn find_breakpoints(magnitudes: &[f64]) -> BreakpointResult {
    if magnitudes.is_empty() {
        return BreakpointResult {
            minor_threshold: 0.05,
            major_threshold: 0.20,
            stats: DistributionStats {
                method: "default".to_string(),
                ..Default::default()
            },
        };
    }

    let n = magnitudes.len();
    let mut sorted = magnitudes.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("magnitudes are finite"));

    let mean = sorted.iter().sum::<f64>() / n as f64;
    let median = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    };
    let variance = sorted.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    let std_dev = variance.sqrt();
    let q1 = if n >= 4 { sorted[n / 4] } else { sorted[0] };
    let q3 = if n >= 4 { sorted[3 * n / 4] } else { sorted[n - 1] };

    let mut stats = DistributionStats {
        method: String::new(),
        count: n,
        min: sorted[0],
        max: sorted[n - 1],
        mean: round_to(mean, 4),
        median: round_to(median, 4),
        std_dev: round_to(std_dev, 4),
        q1: round_to(q1, 4),
        q3: round_to(q3, 4),
    };

    let (mut minor, mut major) = if n < 5 {
        stats.method = "percentile (few transitions)".to_string();
        let major = if n >= 4 { q3 } else { sorted[n - 1] * 0.8 };
        (median, major)
    } else if std_dev < mean * 0.3 && mean > 0.0 {
        stats.method = "percentile (uniform distribution)".to_string();
        (q1, q3)
    } else {
        // Gap-based natural breaks: the two largest gaps between consecutive
        // sorted values separate minor/moderate/major.
        let mut gaps: Vec<(f64, usize)> = sorted
            .windows(2)
            .enumerate()
            .map(|(i, w)| (w[1] - w[0], i))
            .collect();
        gaps.sort_by(|a, b| b.partial_cmp(a).expect("gaps are finite"));

        let mut break_indices = [gaps[0].1, gaps[1].1];
        break_indices.sort_unstable();

        let mut minor = (sorted[break_indices[0]] + sorted[break_indices[0] + 1]) / 2.0;
        let mut major = (sorted[break_indices[1]] + sorted[break_indices[1] + 1]) / 2.0;

        if minor >= major {
            // Only one real gap: use it for minor, put major halfway to max
            let big = gaps[0].1;
            minor = (sorted[big] + sorted[big + 1]) / 2.0;
            major = minor + (sorted[n - 1] - minor) * 0.5;
        }

        stats.method = "gap-based natural breaks".to_string();
        (minor, major)
    };

    minor = round_to(minor, 6);
    major = round_to(major, 6);
    // Thresholds must stay strictly ordered even for degenerate
    // distributions (single transition, all-equal magnitudes).
    if major <= minor {
        major = round_to(minor + 0.05, 6);
    }

    BreakpointResult {
        minor_threshold: minor,
        major_threshold: major,
        stats,
    }
}

/// Group transitions into analysis units.
///
/// Consecutive minor transitions batch into one unit; moderate and major
/// transitions are individual units; majors are inflection points.
pub fn plan_analysis_units(
    magnitudes: &[f64],
    breakpoints: &BreakpointResult,
) -> Result<Vec<AnalysisUnit>> {
    if magnitudes.is_empty() {
        return Err(Error::Discovery(
            "cannot plan analysis with zero transitions".to_string(),
        ));
    }

    let mut units = Vec::new();
    let mut batch: Vec<usize> = Vec::new();
    let mut batch_magnitude = 0.0;

    let flush =
        |units: &mut Vec<AnalysisUnit>, batch: &mut Vec<usize>, batch_magnitude: &mut f64| {
            if batch.is_empty() {
                return;
            }
            if batch.len() == 1 {
                let idx = batch[0];
                units.push(AnalysisUnit {
                    snapshot_range: (idx, idx + 1),
                    transitions: vec![idx],
                    tier: Tier::Minor,
                    total_magnitude: *batch_magnitude,
                    description: format!("Snapshot {idx} -> {} (minor change)", idx + 1),
                    is_inflection_point: false,
                });
            } else {
                let first = batch[0];
                let last = *batch.last().expect("batch is non-empty");
                units.push(AnalysisUnit {
                    snapshot_range: (first, last + 1),
                    transitions: std::mem::take(batch),
                    tier: Tier::MinorBatch,
                    total_magnitude: *batch_magnitude,
                    description: format!(
                        "Snapshots {first} -> {} ({} minor transitions)",
                        last + 1,
                        last - first + 1
                    ),
                    is_inflection_point: false,
                });
            }
            batch.clear();
            *batch_magnitude = 0.0;
        };

    for (i, &mag) in magnitudes.iter().enumerate() {
        if mag <= breakpoints.minor_threshold {
            batch.push(i);
            batch_magnitude += mag;
            continue;
        }

        flush(&mut units, &mut batch, &mut batch_magnitude);

        let (tier, description, is_inflection_point) = if mag >= breakpoints.major_threshold {
            (
                Tier::Major,
                format!("Snapshot {i} -> {} (MAJOR change, magnitude {mag:.4})", i + 1),
                true,
            )
        } else {
            (
                Tier::Moderate,
                format!(
                    "Snapshot {i} -> {} (moderate change, magnitude {mag:.4})",
                    i + 1
                ),
                false,
            )
        };
        units.push(AnalysisUnit {
            snapshot_range: (i, i + 1),
            transitions: vec![i],
            tier,
            total_magnitude: mag,
            description,
            is_inflection_point,
        });
    }

    flush(&mut units, &mut batch, &mut batch_magnitude);
    Ok(units)
}

/// Render a human-readable summary of the analysis plan.
pub fn summarize_plan(units: &[AnalysisUnit], breakpoints: &BreakpointResult) -> String {
    let mut lines = Vec::new();
    lines.push("Analysis Plan Summary".to_string());
    lines.push("=".repeat(50));

    let stats = &breakpoints.stats;
    lines.push(format!(
        "\nChange Distribution ({} transitions):",
        stats.count
    ));
    lines.push(format!("  Method: {}", stats.method));
    if stats.count > 0 {
        lines.push(format!("  Range:  {:.4} - {:.4}", stats.min, stats.max));
        lines.push(format!(
            "  Mean:   {:.4}  Median: {:.4}",
            stats.mean, stats.median
        ));
        lines.push(format!("  StdDev: {:.4}", stats.std_dev));
    }
    lines.push("\nThresholds:".to_string());
    lines.push(format!("  Minor:  <= {:.4}", breakpoints.minor_threshold));
    lines.push(format!("  Major:  >= {:.4}", breakpoints.major_threshold));

    let mut tier_counts: Vec<(Tier, usize)> = Vec::new();
    for unit in units {
        match tier_counts.iter_mut().find(|(t, _)| *t == unit.tier) {
            Some((_, count)) => *count += 1,
            None => tier_counts.push((unit.tier, 1)),
        }
    }
    tier_counts.sort_by_key(|(t, _)| t.to_string());

    lines.push(format!("\nAnalysis Units: {} total", units.len()));
    for (tier, count) in &tier_counts {
        lines.push(format!("  {tier}: {count}"));
    }

    let inflection_count = units.iter().filter(|u| u.is_inflection_point).count();
    if inflection_count > 0 {
        lines.push(format!(
            "  Inflection points (summary refresh): {inflection_count}"
        ));
    }

    let api_calls: usize = units
        .iter()
        .map(|u| if u.tier == Tier::Major { 3 } else { 1 })
        .sum::<usize>()
        + 2; // project summary + final overview
    lines.push(format!("\nEstimated API calls: {api_calls}"));
    lines.push(format!(
        "  (+ {inflection_count} summary refreshes at inflection points)"
    ));

    lines.push("\nPlanned Units:".to_string());
    for (i, unit) in units.iter().enumerate() {
        let marker = if unit.is_inflection_point { " ***" } else { "" };
        lines.push(format!("  {}. {}{marker}", i + 1, unit.description));
    }

    lines.join("\n")
}
