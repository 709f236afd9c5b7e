//! Pipeline driver
//!
//! Orchestrates the six phases: discover snapshots, diff adjacent pairs,
//! plan analysis units, build the project understanding, analyze each unit,
//! and generate the report. Owns resume logic: completed units are loaded
//! from the progress file, and the project summary is refreshed after every
//! inflection point so later units see the post-change architecture.

use std::path::PathBuf;

use crate::analysis::{AnalysisResult, Analyzer};
use crate::classifier::{
    compute_magnitude, find_breakpoints, plan_analysis_units, summarize_plan, AnalysisUnit, Tier,
};
use crate::config::Config;
use crate::discovery::{discover_snapshots, list_projects, SnapshotInfo};
use crate::error::{Error, Result};
use crate::progress::ProgressTracker;
use crate::query::{EnvProviderFactory, LlmSession, ProviderFactory};
use crate::report::generate_report;
use crate::snapshot_diff::{diff_snapshots, get_snapshot_files, is_status_doc, SnapshotDiff};

/// Options for one driver invocation.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Stop after planning; phases 1-3 only, no API calls or side effects
    pub plan_only: bool,
    /// Compare two specific snapshots with a single deep analysis
    pub drill_down: Option<(String, String)>,
}

/// List all projects found in the configured zip directory.
pub fn run_list_projects(config: &Config) -> Result<()> {
    let zip_dir = PathBuf::from(config.zip_directory()?);
    let projects = list_projects(&zip_dir)?;

    if projects.is_empty() {
        println!("No projects with 2+ snapshots found in: {}", zip_dir.display());
        return Ok(());
    }

    println!("Projects in {}:", zip_dir.display());
    println!("{:<35} {:>10}", "Project Name", "Snapshots");
    println!("{}", "-".repeat(47));
    for (name, count) in &projects {
        println!("  {name:<33} {count:>8}");
    }
    println!("\n{} projects found.", projects.len());
    Ok(())
}

/// Run the analysis pipeline for one project.
pub async fn run_analysis(config: Config, project_name: &str, options: &RunOptions) -> Result<()> {
    run_analysis_with_factory(config, project_name, options, Box::new(EnvProviderFactory)).await
}

/// Same as [`run_analysis`], with an injectable provider factory.
pub async fn run_analysis_with_factory(
    config: Config,
    project_name: &str,
    options: &RunOptions,
    factory: Box<dyn ProviderFactory>,
) -> Result<()> {
    if let Some((label_a, label_b)) = &options.drill_down {
        return run_drill_down(config, project_name, label_a, label_b, factory).await;
    }

    let zip_dir = PathBuf::from(config.zip_directory()?);
    let output_dir = config.output_directory()?;
    let binary_extensions = config.binary_extensions.clone();

    // Phase 1: discovery
    println!("\nPhase 1: Discovering snapshots for '{project_name}'...");
    let snapshots = discover_snapshots(&zip_dir, project_name)?;
    println!("  Found {} snapshots", snapshots.len());
    println!(
        "  Range: {} to {}",
        snapshots[0].label,
        snapshots[snapshots.len() - 1].label
    );

    let snapshot_labels: Vec<String> = snapshots.iter().map(|s| s.label.clone()).collect();
    let snapshot_paths: Vec<PathBuf> = snapshots.iter().map(|s| s.path.clone()).collect();

    let mut tracker = ProgressTracker::load(project_name, &output_dir);
    let snapshots_hash = ProgressTracker::compute_snapshots_hash(&snapshot_paths);
    if !tracker.is_valid_for(&snapshots_hash) {
        println!("  Starting fresh analysis (snapshot set changed or no prior progress)");
        if !options.plan_only {
            tracker.initialize(project_name, &snapshots_hash, snapshots.len())?;
        }
    } else {
        println!(
            "  Resuming: {} units previously completed",
            tracker.completed_count()
        );
    }

    // Phase 2: local diffing
    println!("\nPhase 2: Computing {} diffs locally...", snapshots.len() - 1);
    let (all_diffs, all_magnitudes) = compute_all_diffs(&snapshots, &binary_extensions)?;

    // Phase 3: planning
    println!("\nPhase 3: Planning analysis...");
    let breakpoints = find_breakpoints(&all_magnitudes);
    let units = plan_analysis_units(&all_magnitudes, &breakpoints)?;
    println!("{}", summarize_plan(&units, &breakpoints));

    if options.plan_only {
        println!("\n--plan-only: Stopping before API calls.");
        println!("To proceed with full analysis, run again without --plan-only.");
        return Ok(());
    }

    let engine = config.current_engine()?.to_string();
    let mut session = LlmSession::with_factory(config, &output_dir, factory)?;
    let provider = session.create_provider(&engine)?;
    println!("Using model: {engine}");

    // Phase 4: project understanding
    println!("\nPhase 4: Project understanding...");
    let mut project_summary = match tracker.project_summary() {
        Some(summary) => {
            println!("  Using cached project summary");
            summary.to_string()
        }
        None => {
            println!("  Generating project summary from first snapshot...");
            let (listing, contents) = get_snapshot_files(&snapshots[0].path, &binary_extensions)?;
            let status_docs = extract_status_docs(&contents);
            let mut analyzer = Analyzer {
                session: &mut session,
                provider: provider.as_ref(),
                project_name,
            };
            let summary = analyzer
                .generate_project_summary(&listing, &contents, &status_docs)
                .await?;
            tracker.set_project_summary(&summary)?;
            println!("  Summary generated ({} chars)", summary.len());
            summary
        }
    };

    // Phase 5: LLM analysis
    println!("\nPhase 5: Analyzing {} units...", units.len());
    let mut all_results: Vec<AnalysisResult> = Vec::new();
    for (i, unit) in units.iter().enumerate() {
        if tracker.is_unit_completed(i) {
            if let Some(stored) = tracker.unit_result(i) {
                all_results.push(stored.clone());
                println!("  [{}/{}] {} - CACHED", i + 1, units.len(), unit.description);
                continue;
            }
        }

        println!("  [{}/{}] {}", i + 1, units.len(), unit.description);
        let mut analyzer = Analyzer {
            session: &mut session,
            provider: provider.as_ref(),
            project_name,
        };
        let result = analyzer
            .analyze_unit(
                unit,
                &all_diffs,
                &snapshot_labels,
                &project_summary,
                &snapshot_paths,
                &binary_extensions,
            )
            .await?;
        tracker.mark_unit_completed(i, &result)?;
        all_results.push(result);

        if unit.is_inflection_point {
            let post_idx = unit.snapshot_range.1;
            if post_idx < snapshots.len() {
                let (_, post_contents) =
                    get_snapshot_files(&snapshots[post_idx].path, &binary_extensions)?;
                let post_status = extract_status_docs(&post_contents);
                let mut analyzer = Analyzer {
                    session: &mut session,
                    provider: provider.as_ref(),
                    project_name,
                };
                project_summary = analyzer
                    .refresh_project_summary(&project_summary, &post_contents, &post_status)
                    .await?;
                tracker.set_project_summary(&project_summary)?;
                println!("  Project summary refreshed ({} chars)", project_summary.len());
            }
        }
    }

    // Phase 6: report generation
    println!("\nPhase 6: Generating report...");
    let mut analyzer = Analyzer {
        session: &mut session,
        provider: provider.as_ref(),
        project_name,
    };
    let overview = analyzer.generate_overview(&all_results).await?;

    let report_path = generate_report(
        project_name,
        &overview,
        &all_results,
        &units,
        &snapshot_labels,
        &breakpoints,
        &output_dir,
    )?;
    println!("\nReport written to: {}", report_path.display());
    println!(
        "Analysis complete: {} units analyzed across {} snapshots.",
        all_results.len(),
        snapshots.len()
    );
    Ok(())
}

/// Compare two specific snapshots with a single deep (major-tier) analysis,
/// bypassing planning.
async fn run_drill_down(
    config: Config,
    project_name: &str,
    label_a: &str,
    label_b: &str,
    factory: Box<dyn ProviderFactory>,
) -> Result<()> {
    let zip_dir = PathBuf::from(config.zip_directory()?);
    let output_dir = config.output_directory()?;
    let binary_extensions = config.binary_extensions.clone();
    let engine = config.current_engine()?.to_string();

    let snapshots = discover_snapshots(&zip_dir, project_name)?;
    let mut snap_a = find_snapshot(&snapshots, label_a)?;
    let mut snap_b = find_snapshot(&snapshots, label_b)?;
    if snap_a.sort_key > snap_b.sort_key {
        std::mem::swap(&mut snap_a, &mut snap_b);
    }

    println!("Drill-down analysis: {} -> {}", snap_a.label, snap_b.label);

    let mut session = LlmSession::with_factory(config, &output_dir, factory)?;
    let provider = session.create_provider(&engine)?;
    let mut tracker = ProgressTracker::load(project_name, &output_dir);

    let project_summary = match tracker.project_summary() {
        Some(summary) => summary.to_string(),
        None => {
            println!("\nPhase 1: Generating project understanding...");
            let (listing, contents) = get_snapshot_files(&snap_a.path, &binary_extensions)?;
            let status_docs = extract_status_docs(&contents);
            let mut analyzer = Analyzer {
                session: &mut session,
                provider: provider.as_ref(),
                project_name,
            };
            let summary = analyzer
                .generate_project_summary(&listing, &contents, &status_docs)
                .await?;
            tracker.set_project_summary(&summary)?;
            summary
        }
    };

    println!("\nPhase 2: Diffing snapshots...");
    let diff = diff_snapshots(&snap_a.path, &snap_b.path, &binary_extensions, 0)?;
    println!(
        "  {} files changed, {} diff lines",
        diff.files_changed_count, diff.total_diff_lines
    );

    println!("\nPhase 3: Deep analysis...");
    let unit = AnalysisUnit {
        snapshot_range: (0, 1),
        transitions: vec![0],
        tier: Tier::Major,
        total_magnitude: compute_magnitude(&diff),
        description: format!("Drill-down: {} -> {}", snap_a.label, snap_b.label),
        is_inflection_point: false,
    };

    let mut analyzer = Analyzer {
        session: &mut session,
        provider: provider.as_ref(),
        project_name,
    };
    let result = analyzer
        .analyze_major(
            &unit,
            &diff,
            &snap_a.label,
            &snap_b.label,
            &project_summary,
            &snap_a.path,
            &snap_b.path,
            &binary_extensions,
        )
        .await?;

    let separator = "=".repeat(60);
    println!("\n{separator}");
    println!("ANALYSIS: {} -> {}", snap_a.label, snap_b.label);
    println!("{separator}");
    println!("{}", result.narrative);
    println!("{separator}");
    Ok(())
}

fn find_snapshot<'a>(snapshots: &'a [SnapshotInfo], label: &str) -> Result<&'a SnapshotInfo> {
    snapshots.iter().find(|s| s.label == label).ok_or_else(|| {
        let available: Vec<&str> = snapshots.iter().map(|s| s.label.as_str()).collect();
        Error::Discovery(format!(
            "snapshot '{label}' not found; available labels: {}",
            available.join(", ")
        ))
    })
}

fn compute_all_diffs(
    snapshots: &[SnapshotInfo],
    binary_extensions: &[String],
) -> Result<(Vec<SnapshotDiff>, Vec<f64>)> {
    let mut all_diffs = Vec::new();
    let mut all_magnitudes = Vec::new();
    for i in 0..snapshots.len() - 1 {
        let old_snap = &snapshots[i];
        let new_snap = &snapshots[i + 1];
        let diff = diff_snapshots(&old_snap.path, &new_snap.path, binary_extensions, 0)?;
        let magnitude = compute_magnitude(&diff);
        println!(
            "  [{}/{}] {} -> {} {} files, {} lines, mag={magnitude:.4}",
            i + 1,
            snapshots.len() - 1,
            old_snap.label,
            new_snap.label,
            diff.files_changed_count,
            diff.total_diff_lines
        );
        all_diffs.push(diff);
        all_magnitudes.push(magnitude);
    }
    Ok((all_diffs, all_magnitudes))
}

fn extract_status_docs(
    contents: &std::collections::BTreeMap<String, String>,
) -> std::collections::BTreeMap<String, String> {
    contents
        .iter()
        .filter(|(path, _)| is_status_doc(path))
        .map(|(path, content)| (path.clone(), content.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{AiResponse, MessageRequest, Provider};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct CountingProvider {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Provider for CountingProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        fn default_max_tokens(&self) -> u32 {
            4000
        }

        async fn create_message(
            &self,
            request: &MessageRequest,
        ) -> crate::error::Result<AiResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Vary the reply with the prompt so distinct cache keys get
            // distinct responses
            let text = format!(
                "narrative ({} chars of prompt)",
                request
                    .messages
                    .iter()
                    .map(|m| match m {
                        crate::llm::ChatMessage::User(t) => t.len(),
                        _ => 0,
                    })
                    .sum::<usize>()
            );
            Ok(AiResponse {
                text,
                ..Default::default()
            })
        }
    }

    struct CountingFactory {
        calls: Arc<AtomicUsize>,
    }

    impl ProviderFactory for CountingFactory {
        fn create(
            &self,
            _config: &Config,
            _model_name: &str,
        ) -> crate::error::Result<Box<dyn Provider>> {
            Ok(Box::new(CountingProvider {
                calls: self.calls.clone(),
            }))
        }
    }

    fn make_zip(dir: &Path, name: &str, files: &[(&str, &str)]) {
        let file = std::fs::File::create(dir.join(name)).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (rel, content) in files {
            writer.start_file(*rel, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    fn fixture_config(zip_dir: &Path, output_dir: &Path) -> Config {
        let toml = format!(
            r#"
            zip_directory = "{}"
            current_engine = "fixed"

            [output]
            directory = "{}"

            [models.fixed]
            platform = "anthropic"
            model = "test-model"
            max_tokens = 4000
            "#,
            zip_dir.display(),
            output_dir.display()
        );
        toml::from_str(&toml).unwrap()
    }

    fn three_snapshot_fixture(zip_dir: &Path) {
        make_zip(
            zip_dir,
            "proj_20240101.zip",
            &[("a.txt", "hello\n"), ("b.txt", "stable\n")],
        );
        make_zip(
            zip_dir,
            "proj_20240102.zip",
            &[("a.txt", "hello\nworld\n"), ("b.txt", "stable\n")],
        );
        make_zip(
            zip_dir,
            "proj_20240103.zip",
            &[("a.txt", "hello\nworld\nagain\n"), ("b.txt", "stable\n")],
        );
    }

    #[tokio::test]
    async fn test_plan_only_no_side_effects() {
        let zips = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        three_snapshot_fixture(zips.path());
        let config = fixture_config(zips.path(), output.path());

        let calls = Arc::new(AtomicUsize::new(0));
        run_analysis_with_factory(
            config,
            "proj",
            &RunOptions {
                plan_only: true,
                drill_down: None,
            },
            Box::new(CountingFactory {
                calls: calls.clone(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0, "no model calls in plan-only");
        let files: Vec<_> = std::fs::read_dir(output.path()).unwrap().collect();
        assert!(files.is_empty(), "plan-only writes nothing to the output dir");
    }

    #[tokio::test]
    async fn test_full_pipeline_produces_report_and_progress() {
        let zips = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        three_snapshot_fixture(zips.path());
        let config = fixture_config(zips.path(), output.path());

        let calls = Arc::new(AtomicUsize::new(0));
        run_analysis_with_factory(
            config,
            "proj",
            &RunOptions::default(),
            Box::new(CountingFactory {
                calls: calls.clone(),
            }),
        )
        .await
        .unwrap();

        assert!(output.path().join("proj_history.md").is_file());
        assert!(output.path().join("proj_progress.json").is_file());
        assert!(output.path().join("api_cache.json").is_file());
        assert!(output.path().join("log0001.json").is_file());

        let progress: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(output.path().join("proj_progress.json")).unwrap(),
        )
        .unwrap();
        assert!(progress["project_summary"].is_string());
        assert!(!progress["completed_units"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_run_fully_cached() {
        let zips = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        three_snapshot_fixture(zips.path());

        let calls = Arc::new(AtomicUsize::new(0));
        run_analysis_with_factory(
            fixture_config(zips.path(), output.path()),
            "proj",
            &RunOptions::default(),
            Box::new(CountingFactory {
                calls: calls.clone(),
            }),
        )
        .await
        .unwrap();
        let first_run_calls = calls.load(Ordering::SeqCst);
        assert!(first_run_calls > 0);

        // Second run: completed units come from progress, the overview from
        // the response cache; zero provider calls
        run_analysis_with_factory(
            fixture_config(zips.path(), output.path()),
            "proj",
            &RunOptions::default(),
            Box::new(CountingFactory {
                calls: calls.clone(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), first_run_calls);
    }

    #[tokio::test]
    async fn test_snapshot_set_change_resets_progress() {
        let zips = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        three_snapshot_fixture(zips.path());

        run_analysis_with_factory(
            fixture_config(zips.path(), output.path()),
            "proj",
            &RunOptions::default(),
            Box::new(CountingFactory {
                calls: Arc::new(AtomicUsize::new(0)),
            }),
        )
        .await
        .unwrap();

        // A new snapshot invalidates the stored fingerprint
        make_zip(zips.path(), "proj_20240104.zip", &[("a.txt", "more\n")]);
        let tracker = ProgressTracker::load("proj", output.path());
        let snapshots =
            discover_snapshots(zips.path(), "proj").unwrap();
        let hash = ProgressTracker::compute_snapshots_hash(
            &snapshots.iter().map(|s| s.path.clone()).collect::<Vec<_>>(),
        );
        assert!(!tracker.is_valid_for(&hash));
    }

    #[tokio::test]
    async fn test_drill_down_unknown_label_lists_available() {
        let zips = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        three_snapshot_fixture(zips.path());
        let config = fixture_config(zips.path(), output.path());

        let err = run_analysis_with_factory(
            config,
            "proj",
            &RunOptions {
                plan_only: false,
                drill_down: Some(("20240101".to_string(), "nope".to_string())),
            },
            Box::new(CountingFactory {
                calls: Arc::new(AtomicUsize::new(0)),
            }),
        )
        .await
        .unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("'nope' not found"));
        assert!(msg.contains("20240102"));
    }

    #[tokio::test]
    async fn test_drill_down_swaps_out_of_order_labels() {
        let zips = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        three_snapshot_fixture(zips.path());
        let config = fixture_config(zips.path(), output.path());

        // Labels given newest-first still analyze oldest -> newest
        run_analysis_with_factory(
            config,
            "proj",
            &RunOptions {
                plan_only: false,
                drill_down: Some(("20240103".to_string(), "20240101".to_string())),
            },
            Box::new(CountingFactory {
                calls: Arc::new(AtomicUsize::new(0)),
            }),
        )
        .await
        .unwrap();
    }

    #[test]
    fn test_find_snapshot_error_message() {
        let snapshots = vec![SnapshotInfo {
            path: PathBuf::from("/z/proj_v1.zip"),
            sort_key: crate::discovery::parse_suffix("v1").unwrap(),
            label: "v1".to_string(),
            filename: "proj_v1.zip".to_string(),
        }];
        let err = find_snapshot(&snapshots, "v9").unwrap_err();
        assert!(format!("{err}").contains("available labels: v1"));
    }
}
