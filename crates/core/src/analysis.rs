//! Tiered LLM analysis
//!
//! Dispatches each planned unit to a tier-appropriate call strategy:
//! batched summaries for runs of minor transitions, single calls with
//! formatted diffs for minor/moderate transitions, and tool-assisted
//! conversations for major transitions. Also owns project-summary
//! generation, inflection-point refreshes, and overview generation.
//!
//! A fixed writing-style block is prepended to the cacheable prompt parts of
//! every call so provider-side prompt caching gets the longest possible
//! stable prefix.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::classifier::{AnalysisUnit, Tier};
use crate::conversation::{run_tool_conversation, OverviewBrowser, SnapshotBrowser, DEFAULT_MAX_TURNS};
use crate::error::{Error, Result};
use crate::llm::Provider;
use crate::query::LlmSession;
use crate::snapshot_diff::SnapshotDiff;
use crate::tools::{overview_tools, snapshot_tools};

pub const SYSTEM_MESSAGE: &str = "You are an expert software engineer analyzing the evolution of a coding project. \
     You examine code changes between snapshots to understand what was built, modified, \
     and why. You identify patterns like bug fixes, feature additions, refactoring, \
     architecture changes, and problem-solving approaches.";

/// Writing style instructions, included as cached context in every API call.
pub const WRITING_STYLE: &str = "Writing style requirements for all output:

Language and Attribution
- Keep tone neutral and factual; avoid promotional language (\"revolutionary,\" \"groundbreaking,\" \"rich cultural heritage,\" \"captivates\").
- Don't inflate significance without evidence (\"testament to,\" \"plays a vital role,\" \"underscores importance\").
- Don't use valorizing adjectives to characterize developer decisions or judgment (\"disciplined,\" \"sophisticated,\" \"elegant,\" \"mature,\" \"pragmatic\"). Describe what was done, not how impressive it was.
- Avoid dramatic contrastive setups that minimize one thing to elevate another (\"This wasn't merely X - it was Y,\" \"more than just X\"). State what happened directly.
- Attribute opinions and disputed facts to specific, verifiable sources rather than vague authorities (\"many experts,\" \"it is widely believed\").
- Avoid editorializing or injecting unsupported analysis (\"it's important to note,\" \"defining feature\").

Sentence Structure and Flow
- Vary sentence length and structure to avoid uniform rhythm.
- Minimize transitional connectors (\"moreover,\" \"furthermore,\" \"however,\" \"on the other hand\").
- Avoid repetitive patterns like the rule of three or negative parallelisms (\"not only...but\").
- Don't end sections with unnecessary summaries (\"In conclusion,\" \"Overall\").
- Eliminate superficial commentary that ends sentences with \"-ing\" phrases.

Voice and Perspective
- Never address the reader directly (\"let's explore,\" \"we will examine\") unless the genre requires it.
- Avoid collaborative language (\"Would you like me to...?\").
- Don't include self-referential cues (\"as noted above,\" \"in this article\").
- Never include knowledge cutoffs or disclaimers about limited information.

Formatting and Style
- Use sentence case for headings unless convention requires title case.
- Apply formatting (bold, italics) sparingly and purposefully.
- Avoid emojis, excessive punctuation, or decorative elements.
- Avoid em-dashes.
- Write in paragraphs rather than over-relying on bullet points.

Content Quality
- Prioritize concrete, sourced information over vague generalizations.
- Avoid padding with empty phrases or superficial depth.
- Don't overuse cliched framings around \"humanity,\" \"innovation,\" or \"transformative power.\"
- Don't assume commercial intent, product goals, or user bases. Avoid \"prototype to product\" framing, \"productization,\" or language implying the goal is shipping a product. Describe the project's actual state and evolution without imposing a narrative of professional maturation.

The key principle: Write naturally, concisely, and directly, focusing on factual content rather than artificial emphasis or formulaic structures.";

/// Per-file diff budget in single-call prompts.
pub const MAX_DIFF_LINES_PER_FILE: usize = 300;
/// Whole-prompt diff budget in single-call prompts.
pub const MAX_TOTAL_DIFF_FOR_PROMPT: usize = 5000;
/// Source-text budget for project summaries, roughly 25K tokens.
const SUMMARY_SOURCE_CHAR_BUDGET: usize = 100_000;

/// A moved file in a persisted files summary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovedFile {
    pub from: String,
    pub to: String,
}

/// Flat lists of changed files, merged across batched transitions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub moved: Vec<MovedFile>,
}

/// Model output for one analysis unit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub unit_index: usize,
    pub tier: Tier,
    pub narrative: String,
    pub snapshot_labels: Vec<String>,
    pub files_summary: FilesSummary,
}

/// Build the files summary for one transition.
pub fn build_files_summary(diff: &SnapshotDiff) -> FilesSummary {
    FilesSummary {
        added: diff.added.clone(),
        removed: diff.removed.clone(),
        modified: diff.modified.iter().map(|fd| fd.path.clone()).collect(),
        moved: diff
            .moved
            .iter()
            .map(|(from, to)| MovedFile {
                from: from.clone(),
                to: to.clone(),
            })
            .collect(),
    }
}

/// Merge summaries across batched transitions, de-duplicating paths while
/// preserving first-seen order. Moves keep their from/to pairs.
pub fn merge_files_summaries(summaries: &[FilesSummary]) -> FilesSummary {
    let mut merged = FilesSummary::default();
    let mut seen_added = BTreeSet::new();
    let mut seen_removed = BTreeSet::new();
    let mut seen_modified = BTreeSet::new();
    for summary in summaries {
        for path in &summary.added {
            if seen_added.insert(path.clone()) {
                merged.added.push(path.clone());
            }
        }
        for path in &summary.removed {
            if seen_removed.insert(path.clone()) {
                merged.removed.push(path.clone());
            }
        }
        for path in &summary.modified {
            if seen_modified.insert(path.clone()) {
                merged.modified.push(path.clone());
            }
        }
        merged.moved.extend(summary.moved.iter().cloned());
    }
    merged
}

/// Truncate a diff to `max_lines`, appending a marker with the omitted count.
fn truncate_diff(diff_text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = diff_text.split('\n').collect();
    if lines.len() <= max_lines {
        return diff_text.to_string();
    }
    let omitted = lines.len() - max_lines;
    let mut out = lines[..max_lines].join("\n");
    out.push_str(&format!("\n... ({omitted} more lines truncated)"));
    out
}

/// Format a transition's diff for a single-call prompt, within the global
/// line budget. Status-doc changes lead the prompt because they carry the
/// developer's own notes.
pub fn format_diff_for_prompt(diff: &SnapshotDiff, max_total_lines: usize) -> String {
    let mut sections: Vec<String> = Vec::new();

    if !diff.status_doc_diffs.is_empty() {
        let mut section = String::from(
            "DEVELOPER STATUS DOCUMENT CHANGES:\n\
             (These documents contain the developer's own notes about what they're working on)\n",
        );
        for fd in &diff.status_doc_diffs {
            section.push_str(&format!("\n--- {} ---\n", fd.path));
            section.push_str(&truncate_diff(&fd.diff_text, 200));
            section.push('\n');
        }
        sections.push(section);
    }

    if !diff.added.is_empty() {
        sections.push(format!(
            "FILES ADDED:\n{}",
            diff.added
                .iter()
                .map(|p| format!("  + {p}"))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }

    if !diff.removed.is_empty() {
        sections.push(format!(
            "FILES REMOVED:\n{}",
            diff.removed
                .iter()
                .map(|p| format!("  - {p}"))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }

    if !diff.moved.is_empty() {
        sections.push(format!(
            "FILES MOVED:\n{}",
            diff.moved
                .iter()
                .map(|(old, new)| format!("  {old} -> {new}"))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }

    if !diff.modified.is_empty() {
        let mut section = format!("FILES MODIFIED ({} files):\n", diff.modified.len());
        let mut lines_so_far = 0usize;
        for (index, fd) in diff.modified.iter().enumerate() {
            let truncated = truncate_diff(&fd.diff_text, MAX_DIFF_LINES_PER_FILE);
            let lines_in_this = truncated.split('\n').count();
            if lines_so_far + lines_in_this > max_total_lines {
                let remaining = diff.modified.len() - index;
                section.push_str(&format!(
                    "\n  ... and {remaining} more modified files (diffs omitted for length)\n"
                ));
                break;
            }
            section.push_str(&format!(
                "\n--- {} ({} lines changed) ---\n{truncated}\n",
                fd.path, fd.diff_line_count
            ));
            lines_so_far += lines_in_this;
        }
        sections.push(section);
    }

    sections.join("\n\n")
}

/// Format a compact per-transition table for minor-batch analysis.
pub fn format_batch_summary(diffs: &[&SnapshotDiff], labels: &[(String, String)]) -> String {
    let mut sections = Vec::new();
    for (i, (diff, (old_label, new_label))) in diffs.iter().zip(labels.iter()).enumerate() {
        let mut section = format!("Transition {}: {old_label} -> {new_label}\n", i + 1);
        section.push_str(&format!(
            "  Files: {} changed ({} added, {} removed, {} modified, {} moved)\n",
            diff.files_changed_count,
            diff.added.len(),
            diff.removed.len(),
            diff.modified.len(),
            diff.moved.len()
        ));
        section.push_str(&format!("  Diff lines: {}\n", diff.total_diff_lines));

        let name_list = |label: &str, names: Vec<&str>, total: usize| -> String {
            let mut line = format!("  {label}: {}", names.join(", "));
            if total > 10 {
                line.push_str(&format!(" ... and {} more", total - 10));
            }
            line.push('\n');
            line
        };
        if !diff.modified.is_empty() {
            section.push_str(&name_list(
                "Modified",
                diff.modified.iter().take(10).map(|fd| fd.path.as_str()).collect(),
                diff.modified.len(),
            ));
        }
        if !diff.added.is_empty() {
            section.push_str(&name_list(
                "Added",
                diff.added.iter().take(10).map(|s| s.as_str()).collect(),
                diff.added.len(),
            ));
        }
        if !diff.removed.is_empty() {
            section.push_str(&name_list(
                "Removed",
                diff.removed.iter().take(10).map(|s| s.as_str()).collect(),
                diff.removed.len(),
            ));
        }
        sections.push(section);
    }
    sections.join("\n")
}

/// Concatenate file contents up to the character budget, with a marker for
/// files left out.
fn build_source_context(contents: &BTreeMap<String, String>) -> String {
    let mut parts = Vec::new();
    let mut total_chars = 0usize;
    for (path, content) in contents {
        if total_chars + content.len() > SUMMARY_SOURCE_CHAR_BUDGET {
            let remaining = contents.len() - parts.len();
            parts.push(format!("\n... ({remaining} more files not shown for length)"));
            break;
        }
        parts.push(format!("\n=== {path} ===\n{content}"));
        total_chars += content.len();
    }
    parts.concat()
}

fn format_status_docs(status_docs: &BTreeMap<String, String>, heading: &str) -> String {
    let mut text = format!("\n\n{heading}\n");
    for (path, content) in status_docs {
        text.push_str(&format!("\n--- {path} ---\n{content}\n"));
    }
    text
}

/// Tier-specific analysis dispatcher bound to one run.
pub struct Analyzer<'a> {
    pub session: &'a mut LlmSession,
    pub provider: &'a dyn Provider,
    pub project_name: &'a str,
}

impl Analyzer<'_> {
    /// Single cached call with the writing style prepended as the first
    /// cacheable block.
    async fn query(
        &mut self,
        cache_parts: Vec<String>,
        query: String,
        max_tokens: u32,
        task: &str,
    ) -> Result<String> {
        let mut blocks = vec![WRITING_STYLE.to_string()];
        blocks.extend(cache_parts);
        self.session
            .query_text(self.provider, SYSTEM_MESSAGE, &blocks, &query, max_tokens, task)
            .await
    }

    fn summary_cache_part(&self, project_summary: &str) -> String {
        format!(
            "Project: {}\n\nProject Summary:\n{project_summary}",
            self.project_name
        )
    }

    /// Generate the initial architectural summary from the earliest
    /// snapshot's contents.
    pub async fn generate_project_summary(
        &mut self,
        file_listing: &[String],
        file_contents: &BTreeMap<String, String>,
        status_docs: &BTreeMap<String, String>,
    ) -> Result<String> {
        let source_context = build_source_context(file_contents);
        let mut cache_parts = vec![format!(
            "Project: {}\n\nFile listing ({} files):\n{}\n\nSource code:\n{source_context}",
            self.project_name,
            file_listing.len(),
            file_listing
                .iter()
                .map(|f| format!("  {f}"))
                .collect::<Vec<_>>()
                .join("\n")
        )];
        if !status_docs.is_empty() {
            cache_parts.push(format_status_docs(
                status_docs,
                "Developer documentation found in the project:",
            ));
        }

        let query = "Provide a detailed architectural summary of this project. Include:\n\
             1. The project's purpose and what it does\n\
             2. The programming language(s) and key technologies/frameworks used\n\
             3. For each significant file or module: its purpose, key classes/functions, \
             and how it relates to other modules\n\
             4. The overall architecture and design patterns used\n\
             5. Any notable implementation details or patterns\n\n\
             Be thorough but concise. This summary will be used as context when analyzing \
             future code changes to this project."
            .to_string();

        println!("  Generating project summary...");
        self.query(cache_parts, query, 4000, "project_summary").await
    }

    /// Refresh the summary after an inflection point, carrying the previous
    /// summary forward as context.
    pub async fn refresh_project_summary(
        &mut self,
        old_summary: &str,
        file_contents: &BTreeMap<String, String>,
        status_docs: &BTreeMap<String, String>,
    ) -> Result<String> {
        let source_context = build_source_context(file_contents);
        let mut cache_parts = vec![format!(
            "Project: {}\n\nPrevious architectural summary:\n{old_summary}\n\nCurrent source code:\n{source_context}",
            self.project_name
        )];
        if !status_docs.is_empty() {
            cache_parts.push(format_status_docs(
                status_docs,
                "Current developer documentation:",
            ));
        }

        let query = "The project has undergone significant changes since the previous summary. \
             Provide an updated architectural summary reflecting the current state. \
             Note what has changed from the previous architecture."
            .to_string();

        println!("  Refreshing project summary after major change...");
        self.query(cache_parts, query, 4000, "project_summary").await
    }

    async fn analyze_minor_batch(
        &mut self,
        unit: &AnalysisUnit,
        diffs: &[SnapshotDiff],
        snapshot_labels: &[String],
        project_summary: &str,
    ) -> Result<AnalysisResult> {
        let batch_diffs: Vec<&SnapshotDiff> =
            unit.transitions.iter().map(|&idx| &diffs[idx]).collect();
        let labels: Vec<(String, String)> = unit
            .transitions
            .iter()
            .map(|&idx| (snapshot_labels[idx].clone(), snapshot_labels[idx + 1].clone()))
            .collect();

        let batch_summary = format_batch_summary(&batch_diffs, &labels);
        let merged = merge_files_summaries(
            &batch_diffs
                .iter()
                .map(|d| build_files_summary(d))
                .collect::<Vec<_>>(),
        );

        let query = format!(
            "The following {} consecutive transitions represent a period of minor changes \
             in the project. Provide a brief overview of what work was done across these \
             versions.\n\n{batch_summary}",
            unit.transitions.len()
        );

        println!(
            "  Analyzing batch of {} minor transitions...",
            unit.transitions.len()
        );
        let narrative = self
            .query(
                vec![self.summary_cache_part(project_summary)],
                query,
                2000,
                "unit_analysis",
            )
            .await?;

        Ok(AnalysisResult {
            unit_index: unit.transitions[0],
            tier: unit.tier,
            narrative,
            snapshot_labels: vec![
                snapshot_labels[unit.snapshot_range.0].clone(),
                snapshot_labels[unit.snapshot_range.1].clone(),
            ],
            files_summary: merged,
        })
    }

    async fn analyze_minor_single(
        &mut self,
        unit: &AnalysisUnit,
        diff: &SnapshotDiff,
        old_label: &str,
        new_label: &str,
        project_summary: &str,
    ) -> Result<AnalysisResult> {
        let diff_text = format_diff_for_prompt(diff, MAX_TOTAL_DIFF_FOR_PROMPT);
        let query = format!(
            "Here are the changes between version {old_label} and {new_label}. \
             Briefly summarize what was changed and why.\n\n{diff_text}"
        );

        println!("  Analyzing minor change {old_label} -> {new_label}...");
        let narrative = self
            .query(
                vec![self.summary_cache_part(project_summary)],
                query,
                1500,
                "unit_analysis",
            )
            .await?;

        Ok(AnalysisResult {
            unit_index: unit.transitions[0],
            tier: unit.tier,
            narrative,
            snapshot_labels: vec![old_label.to_string(), new_label.to_string()],
            files_summary: build_files_summary(diff),
        })
    }

    async fn analyze_moderate(
        &mut self,
        unit: &AnalysisUnit,
        diff: &SnapshotDiff,
        old_label: &str,
        new_label: &str,
        project_summary: &str,
    ) -> Result<AnalysisResult> {
        let diff_text = format_diff_for_prompt(diff, MAX_TOTAL_DIFF_FOR_PROMPT);
        let query = format!(
            "Analyze the changes between version {old_label} and {new_label} of the project.\n\n\
             Changes summary: {} files changed ({} added, {} removed, {} modified, {} moved), \
             {} diff lines.\n\n{diff_text}\n\n\
             Describe:\n\
             1. What was changed\n\
             2. The likely motivation for these changes\n\
             3. Any patterns you observe (bug fixes, new features, refactoring, etc.)\n\
             4. If status documents changed, note what the developer said about their work",
            diff.files_changed_count,
            diff.added.len(),
            diff.removed.len(),
            diff.modified.len(),
            diff.moved.len(),
            diff.total_diff_lines
        );

        println!("  Analyzing moderate change {old_label} -> {new_label}...");
        let narrative = self
            .query(
                vec![self.summary_cache_part(project_summary)],
                query,
                3000,
                "unit_analysis",
            )
            .await?;

        Ok(AnalysisResult {
            unit_index: unit.transitions[0],
            tier: unit.tier,
            narrative,
            snapshot_labels: vec![old_label.to_string(), new_label.to_string()],
            files_summary: build_files_summary(diff),
        })
    }

    /// Deep analysis of a major transition through the snapshot browser.
    /// The model receives summary statistics and pulls diffs, file contents,
    /// and listings on demand; no truncation is applied.
    pub async fn analyze_major(
        &mut self,
        unit: &AnalysisUnit,
        diff: &SnapshotDiff,
        old_label: &str,
        new_label: &str,
        project_summary: &str,
        old_zip: &Path,
        new_zip: &Path,
        binary_extensions: &[String],
    ) -> Result<AnalysisResult> {
        let mut browser = SnapshotBrowser::new(diff, old_zip, new_zip, binary_extensions);
        let summary = browser.change_summary();

        let cached_context = vec![
            WRITING_STYLE.to_string(),
            self.summary_cache_part(project_summary),
        ];

        let initial_query = format!(
            "MAJOR TRANSITION: {old_label} -> {new_label}\n\n\
             Change statistics:\n\
             \x20 Files added:     {}\n\
             \x20 Files removed:   {}\n\
             \x20 Files modified:  {}\n\
             \x20 Files moved:     {}\n\
             \x20 Total diff lines: {}\n\
             \x20 Total lines in new snapshot: {}\n\n\
             You have tools to explore this transition in detail. Use them to:\n\
             1. List the modified/added/removed files to understand the scope\n\
             2. Read diffs for files that seem significant\n\
             3. Read file contents when a diff needs more context\n\
             4. Check status docs for the developer's own notes\n\n\
             After investigating, write a comprehensive narrative covering:\n\
             - What changed at a high level\n\
             - Why these changes were likely made\n\
             - What problems were being solved\n\
             - The impact on the project's architecture\n\
             - Any lessons that can be inferred from the changes\n\n\
             Write in a clear, narrative style suitable for a project history document.",
            summary["files_added"],
            summary["files_removed"],
            summary["files_modified"],
            summary["files_moved"],
            summary["total_diff_lines"],
            summary["total_lines_in_new_snapshot"],
        );

        println!("  Analyzing major change {old_label} -> {new_label} (tool-assisted)...");
        let narrative = run_tool_conversation(
            self.provider,
            SYSTEM_MESSAGE,
            &cached_context,
            &initial_query,
            snapshot_tools(),
            &mut browser,
            DEFAULT_MAX_TURNS,
            4000,
        )
        .await?;

        Ok(AnalysisResult {
            unit_index: unit.transitions[0],
            tier: unit.tier,
            narrative,
            snapshot_labels: vec![old_label.to_string(), new_label.to_string()],
            files_summary: build_files_summary(diff),
        })
    }

    /// Dispatch one unit to its tier-appropriate strategy.
    #[allow(clippy::too_many_arguments)]
    pub async fn analyze_unit(
        &mut self,
        unit: &AnalysisUnit,
        diffs: &[SnapshotDiff],
        snapshot_labels: &[String],
        project_summary: &str,
        snapshot_paths: &[std::path::PathBuf],
        binary_extensions: &[String],
    ) -> Result<AnalysisResult> {
        if unit.tier == Tier::MinorBatch {
            return self
                .analyze_minor_batch(unit, diffs, snapshot_labels, project_summary)
                .await;
        }

        let idx = *unit.transitions.first().ok_or_else(|| {
            Error::Discovery("analysis unit covers no transitions".to_string())
        })?;
        let diff = &diffs[idx];
        let old_label = &snapshot_labels[idx];
        let new_label = &snapshot_labels[idx + 1];

        match unit.tier {
            Tier::Minor => {
                self.analyze_minor_single(unit, diff, old_label, new_label, project_summary)
                    .await
            }
            Tier::Moderate => {
                self.analyze_moderate(unit, diff, old_label, new_label, project_summary)
                    .await
            }
            Tier::Major => {
                self.analyze_major(
                    unit,
                    diff,
                    old_label,
                    new_label,
                    project_summary,
                    &snapshot_paths[idx],
                    &snapshot_paths[idx + 1],
                    binary_extensions,
                )
                .await
            }
            Tier::MinorBatch => unreachable!("handled above"),
        }
    }

    /// Generate the evolution overview. Small result sets go in one call;
    /// larger projects use the overview browser so the model reads
    /// narratives on demand.
    pub async fn generate_overview(&mut self, all_results: &[AnalysisResult]) -> Result<String> {
        if all_results.len() <= 10 {
            return self.generate_overview_oneshot(all_results).await;
        }
        self.generate_overview_tool_assisted(all_results).await
    }

    async fn generate_overview_oneshot(
        &mut self,
        all_results: &[AnalysisResult],
    ) -> Result<String> {
        let mut analyses_text = String::new();
        for result in all_results {
            let label_range = format!(
                "{} -> {}",
                result.snapshot_labels.first().map(|s| s.as_str()).unwrap_or(""),
                result.snapshot_labels.last().map(|s| s.as_str()).unwrap_or("")
            );
            analyses_text.push_str(&format!(
                "\n### {label_range} ({})\n{}\n",
                result.tier, result.narrative
            ));
        }

        let cache_parts = vec![format!(
            "Project: {}\n\nIndividual analysis results for {} transitions:\n{analyses_text}",
            self.project_name,
            all_results.len()
        )];

        let query = "Based on all the individual transition analyses above, write a high-level \
             narrative overview of this project's evolution. Cover:\n\
             1. What the project is and its overall purpose\n\
             2. The major phases of development\n\
             3. Key milestones and turning points\n\
             4. Significant challenges or roadblocks encountered and how they were addressed\n\
             5. Architectural evolution and design decisions\n\
             6. Lessons that can be inferred from the development history\n\n\
             Write in a clear, engaging narrative style. This is the executive summary \
             that readers will see first."
            .to_string();

        println!("  Generating project overview...");
        self.query(cache_parts, query, 4000, "overview").await
    }

    async fn generate_overview_tool_assisted(
        &mut self,
        all_results: &[AnalysisResult],
    ) -> Result<String> {
        let mut browser = OverviewBrowser::new(all_results);

        let mut transition_index = format!(
            "Project: {}\n\nTotal transitions: {}\n\nTransition index:\n",
            self.project_name,
            all_results.len()
        );
        for (i, result) in all_results.iter().enumerate() {
            transition_index.push_str(&format!(
                "  [{i}] {} -> {} (tier: {})\n",
                result.snapshot_labels.first().map(|s| s.as_str()).unwrap_or(""),
                result.snapshot_labels.last().map(|s| s.as_str()).unwrap_or(""),
                result.tier
            ));
        }

        let initial_query = format!(
            "{transition_index}\n\
             You have tools to read individual transition narratives by index or range.\n\
             Use them to build a high-level narrative overview of this project's evolution.\n\n\
             Approach:\n\
             1. Read the major/moderate transitions first for key milestones\n\
             2. Sample minor transitions for context on incremental work\n\
             3. Write a cohesive narrative covering:\n\
             \x20  - What the project is and its overall purpose\n\
             \x20  - The major phases of development\n\
             \x20  - Key milestones and turning points\n\
             \x20  - Significant challenges or roadblocks encountered and how they were addressed\n\
             \x20  - Architectural evolution and design decisions\n\
             \x20  - Lessons that can be inferred from the development history\n\n\
             Write in a clear, engaging narrative style. This is the executive summary \
             that readers will see first."
        );

        println!(
            "  Generating project overview (tool-assisted, {} transitions)...",
            all_results.len()
        );
        run_tool_conversation(
            self.provider,
            SYSTEM_MESSAGE,
            &[WRITING_STYLE.to_string()],
            &initial_query,
            overview_tools(),
            &mut browser,
            DEFAULT_MAX_TURNS,
            4000,
        )
        .await
    }
}
