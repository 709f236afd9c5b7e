//! Multi-turn tool-calling conversation loop
//!
//! Lets the model pull diffs, file contents, and summaries on demand instead
//! of receiving everything in one truncated prompt. Used for major
//! transitions and for overview generation on large projects.
//!
//! The loop is provider-agnostic: it speaks the uniform message types from
//! `llm` and dispatches tool calls against a [`ToolContext`]. Handler errors
//! are reported back to the model as error-flagged tool results rather than
//! aborting the conversation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use crate::analysis::AnalysisResult;
use crate::error::Result;
use crate::llm::{ChatMessage, MessageRequest, Provider, ToolResult};
use crate::snapshot_diff::{get_snapshot_files, SnapshotDiff};
use crate::tools::ToolDefinition;

/// Safety cap on conversation rounds.
pub const DEFAULT_MAX_TURNS: usize = 25;

/// Local dispatch target for tool calls.
pub trait ToolContext {
    /// Execute a named tool. `Err` is returned to the model as a tool result
    /// with the error flag set.
    fn call(&mut self, name: &str, input: &Value) -> std::result::Result<Value, String>;
}

fn render_tool_value(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Run a tool-calling conversation until the model stops requesting tools
/// (or the turn cap is hit). Returns all text the model produced, joined
/// with newlines.
pub async fn run_tool_conversation(
    provider: &dyn Provider,
    system: &str,
    cached_context: &[String],
    initial_query: &str,
    tools: Vec<ToolDefinition>,
    context: &mut dyn ToolContext,
    max_turns: usize,
    max_tokens: u32,
) -> Result<String> {
    let mut messages = vec![ChatMessage::User(initial_query.to_string())];
    let mut accumulated: Vec<String> = Vec::new();

    for turn in 0..max_turns {
        let request = MessageRequest {
            system: system.to_string(),
            cache_blocks: cached_context.to_vec(),
            messages: messages.clone(),
            tools: tools.clone(),
            max_tokens,
        };
        let response = provider.create_message(&request).await?;

        if !response.text.is_empty() {
            accumulated.push(response.text.clone());
        }

        if response.tool_calls.is_empty() {
            break;
        }

        messages.push(ChatMessage::Assistant {
            text: response.text,
            tool_calls: response.tool_calls.clone(),
        });

        let mut results = Vec::new();
        for call in &response.tool_calls {
            let (content, is_error) = match context.call(&call.name, &call.input) {
                Ok(value) => (render_tool_value(value), false),
                Err(message) => (format!("Error: {message}"), true),
            };
            results.push(ToolResult {
                tool_call_id: call.id.clone(),
                content,
                is_error,
            });
        }
        messages.push(ChatMessage::ToolResults(results));

        let names: Vec<&str> = response
            .tool_calls
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        println!("    [turn {}] called: {}", turn + 1, names.join(", "));
    }

    Ok(accumulated.join("\n"))
}

// ---------------------------------------------------------------------------
// Snapshot browser: per-transition exploration
// ---------------------------------------------------------------------------

/// Tool handlers for a single transition, backed by the precomputed
/// [`SnapshotDiff`] and on-demand zip extraction for file contents.
pub struct SnapshotBrowser<'a> {
    diff: &'a SnapshotDiff,
    old_zip: PathBuf,
    new_zip: PathBuf,
    binary_extensions: Vec<String>,
    // Extraction is expensive; each side loads once, on first read
    old_contents: Option<BTreeMap<String, String>>,
    new_contents: Option<BTreeMap<String, String>>,
}

impl<'a> SnapshotBrowser<'a> {
    pub fn new(
        diff: &'a SnapshotDiff,
        old_zip: &Path,
        new_zip: &Path,
        binary_extensions: &[String],
    ) -> Self {
        Self {
            diff,
            old_zip: old_zip.to_path_buf(),
            new_zip: new_zip.to_path_buf(),
            binary_extensions: binary_extensions.to_vec(),
            old_contents: None,
            new_contents: None,
        }
    }

    /// The statistics block used both as a tool result and in the initial
    /// prompt for major-tier analysis.
    pub fn change_summary(&self) -> Value {
        json!({
            "files_added": self.diff.added.len(),
            "files_removed": self.diff.removed.len(),
            "files_modified": self.diff.modified.len(),
            "files_moved": self.diff.moved.len(),
            "files_unchanged": self.diff.unchanged.len(),
            "total_diff_lines": self.diff.total_diff_lines,
            "total_lines_in_new_snapshot": self.diff.total_lines_in_new,
        })
    }

    fn contents_for(&mut self, snapshot: &str) -> std::result::Result<&BTreeMap<String, String>, String> {
        let (slot, zip_path) = if snapshot == "old" {
            (&mut self.old_contents, &self.old_zip)
        } else {
            (&mut self.new_contents, &self.new_zip)
        };
        if slot.is_none() {
            let (_, contents) = get_snapshot_files(zip_path, &self.binary_extensions)
                .map_err(|e| format!("failed to load {snapshot} snapshot: {e}"))?;
            *slot = Some(contents);
        }
        Ok(slot.as_ref().expect("slot was just filled"))
    }

    fn get_diff(&self, file_path: &str) -> Value {
        match self.diff.modified.iter().find(|fd| fd.path == file_path) {
            Some(fd) => Value::String(fd.diff_text.clone()),
            None => Value::String(format!(
                "No diff found for '{file_path}'. Use list_files_modified to see available paths."
            )),
        }
    }

    fn get_file_content(&mut self, snapshot: &str, file_path: &str) -> std::result::Result<Value, String> {
        let contents = self.contents_for(snapshot)?;
        Ok(match contents.get(file_path) {
            Some(text) => Value::String(text.clone()),
            None => Value::String(format!(
                "File '{file_path}' not found in {snapshot} snapshot."
            )),
        })
    }

    fn get_status_docs(&self) -> Value {
        let mut result = serde_json::Map::new();
        if !self.diff.status_docs.is_empty() {
            result.insert("status_docs".to_string(), json!(self.diff.status_docs));
        }
        if !self.diff.status_doc_diffs.is_empty() {
            let diffs: BTreeMap<&str, &str> = self
                .diff
                .status_doc_diffs
                .iter()
                .map(|fd| (fd.path.as_str(), fd.diff_text.as_str()))
                .collect();
            result.insert("status_doc_diffs".to_string(), json!(diffs));
        }
        if result.is_empty() {
            result.insert(
                "message".to_string(),
                json!("No status/documentation files found in this transition."),
            );
        }
        Value::Object(result)
    }

    fn snapshot_arg<'v>(input: &'v Value) -> std::result::Result<&'v str, String> {
        match input["snapshot"].as_str() {
            Some(s @ ("old" | "new")) => Ok(s),
            _ => Err("parameter 'snapshot' must be \"old\" or \"new\"".to_string()),
        }
    }
}

impl ToolContext for SnapshotBrowser<'_> {
    fn call(&mut self, name: &str, input: &Value) -> std::result::Result<Value, String> {
        match name {
            "get_change_summary" => Ok(self.change_summary()),
            "list_files_added" => Ok(json!(self.diff.added)),
            "list_files_removed" => Ok(json!(self.diff.removed)),
            "list_files_moved" => Ok(json!(self
                .diff
                .moved
                .iter()
                .map(|(old, new)| json!({"old_path": old, "new_path": new}))
                .collect::<Vec<_>>())),
            "list_files_modified" => Ok(json!(self
                .diff
                .modified
                .iter()
                .map(|fd| json!({"path": fd.path, "diff_lines": fd.diff_line_count}))
                .collect::<Vec<_>>())),
            "get_diff" => {
                let file_path = input["file_path"]
                    .as_str()
                    .ok_or_else(|| "parameter 'file_path' is required".to_string())?;
                Ok(self.get_diff(file_path))
            }
            "get_file_content" => {
                let snapshot = Self::snapshot_arg(input)?;
                let file_path = input["file_path"]
                    .as_str()
                    .ok_or_else(|| "parameter 'file_path' is required".to_string())?;
                self.get_file_content(snapshot, file_path)
            }
            "get_status_docs" => Ok(self.get_status_docs()),
            "list_all_files" => {
                let snapshot = Self::snapshot_arg(input)?;
                if snapshot == "old" {
                    Ok(json!(self.diff.old_file_listing))
                } else {
                    Ok(json!(self.diff.new_file_listing))
                }
            }
            other => Err(format!("Unknown tool: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Overview browser: cross-transition narratives
// ---------------------------------------------------------------------------

/// Tool handlers for overview generation, backed by the completed unit
/// results.
pub struct OverviewBrowser<'a> {
    results: &'a [AnalysisResult],
}

impl<'a> OverviewBrowser<'a> {
    pub fn new(results: &'a [AnalysisResult]) -> Self {
        Self { results }
    }

    fn summary(&self, index: usize) -> Value {
        match self.results.get(index) {
            Some(r) => json!({
                "index": index,
                "tier": r.tier,
                "snapshot_labels": r.snapshot_labels,
                "narrative": r.narrative,
            }),
            None => json!({
                "error": format!(
                    "Index {index} out of range (0-{})",
                    self.results.len().saturating_sub(1)
                )
            }),
        }
    }
}

impl ToolContext for OverviewBrowser<'_> {
    fn call(&mut self, name: &str, input: &Value) -> std::result::Result<Value, String> {
        match name {
            "get_transition_summary" => {
                let index = input["index"]
                    .as_u64()
                    .ok_or_else(|| "parameter 'index' is required".to_string())?;
                Ok(self.summary(index as usize))
            }
            "get_transition_range" => {
                let start = input["start"]
                    .as_u64()
                    .ok_or_else(|| "parameter 'start' is required".to_string())?
                    as usize;
                let end = input["end"]
                    .as_u64()
                    .ok_or_else(|| "parameter 'end' is required".to_string())?
                    as usize;
                let upper = (end + 1).min(self.results.len());
                let entries: Vec<Value> =
                    (start.min(upper)..upper).map(|i| self.summary(i)).collect();
                Ok(json!(entries))
            }
            other => Err(format!("Unknown tool: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::FilesSummary;
    use crate::classifier::Tier;
    use crate::llm::{AiResponse, ToolCall};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Provider scripted with one response per turn.
    struct TurnProvider {
        turns: Mutex<Vec<AiResponse>>,
        calls: AtomicUsize,
    }

    impl TurnProvider {
        fn new(turns: Vec<AiResponse>) -> Self {
            Self {
                turns: Mutex::new(turns),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Provider for TurnProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn default_max_tokens(&self) -> u32 {
            4000
        }

        async fn create_message(
            &self,
            _request: &MessageRequest,
        ) -> crate::error::Result<AiResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut turns = self.turns.lock().unwrap();
            if turns.is_empty() {
                Ok(AiResponse {
                    text: "done".to_string(),
                    ..Default::default()
                })
            } else {
                Ok(turns.remove(0))
            }
        }
    }

    /// Context that records calls and echoes tool names.
    struct EchoContext {
        calls: Vec<String>,
    }

    impl ToolContext for EchoContext {
        fn call(&mut self, name: &str, _input: &Value) -> std::result::Result<Value, String> {
            self.calls.push(name.to_string());
            if name == "boom" {
                Err("handler exploded".to_string())
            } else {
                Ok(json!({"echo": name}))
            }
        }
    }

    fn tool_call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            input: json!({}),
        }
    }

    #[tokio::test]
    async fn test_conversation_terminates_without_tools() {
        let provider = TurnProvider::new(vec![AiResponse {
            text: "final narrative".to_string(),
            ..Default::default()
        }]);
        let mut context = EchoContext { calls: vec![] };
        let result = run_tool_conversation(
            &provider,
            "sys",
            &[],
            "go",
            vec![],
            &mut context,
            DEFAULT_MAX_TURNS,
            1000,
        )
        .await
        .unwrap();
        assert_eq!(result, "final narrative");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(context.calls.is_empty());
    }

    #[tokio::test]
    async fn test_conversation_executes_tools_and_accumulates_text() {
        let provider = TurnProvider::new(vec![
            AiResponse {
                text: "looking at files".to_string(),
                tool_calls: vec![tool_call("t1", "list_files_added"), tool_call("t2", "get_diff")],
                ..Default::default()
            },
            AiResponse {
                text: "the conclusion".to_string(),
                ..Default::default()
            },
        ]);
        let mut context = EchoContext { calls: vec![] };
        let result = run_tool_conversation(
            &provider,
            "sys",
            &[],
            "go",
            vec![],
            &mut context,
            DEFAULT_MAX_TURNS,
            1000,
        )
        .await
        .unwrap();
        assert_eq!(result, "looking at files\nthe conclusion");
        assert_eq!(context.calls, vec!["list_files_added", "get_diff"]);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_result_not_abort() {
        let provider = TurnProvider::new(vec![
            AiResponse {
                tool_calls: vec![tool_call("t1", "boom")],
                ..Default::default()
            },
            AiResponse {
                text: "recovered".to_string(),
                ..Default::default()
            },
        ]);
        let mut context = EchoContext { calls: vec![] };
        let result = run_tool_conversation(
            &provider,
            "sys",
            &[],
            "go",
            vec![],
            &mut context,
            DEFAULT_MAX_TURNS,
            1000,
        )
        .await
        .unwrap();
        assert_eq!(result, "recovered");
    }

    #[tokio::test]
    async fn test_turn_cap_enforced() {
        // A provider that always asks for another tool call
        let endless: Vec<AiResponse> = (0..50)
            .map(|i| AiResponse {
                tool_calls: vec![tool_call(&format!("t{i}"), "echo")],
                ..Default::default()
            })
            .collect();
        let provider = TurnProvider::new(endless);
        let mut context = EchoContext { calls: vec![] };
        run_tool_conversation(&provider, "sys", &[], "go", vec![], &mut context, 3, 1000)
            .await
            .unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    fn make_zip(dir: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let path = dir.join(name);
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (rel, content) in files {
            writer.start_file(*rel, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn browser_fixture(dir: &TempDir) -> (SnapshotDiff, PathBuf, PathBuf) {
        let old = make_zip(
            dir.path(),
            "old.zip",
            &[("main.py", "print('v1')\n"), ("README.md", "# proj\n")],
        );
        let new = make_zip(
            dir.path(),
            "new.zip",
            &[
                ("main.py", "print('v2')\n"),
                ("README.md", "# proj\nupdated\n"),
                ("util.py", "pass\n"),
            ],
        );
        let diff = crate::snapshot_diff::diff_snapshots(&old, &new, &[], 0).unwrap();
        (diff, old, new)
    }

    #[test]
    fn test_snapshot_browser_listings() {
        let dir = TempDir::new().unwrap();
        let (diff, old, new) = browser_fixture(&dir);
        let mut browser = SnapshotBrowser::new(&diff, &old, &new, &[]);

        let summary = browser.call("get_change_summary", &json!({})).unwrap();
        assert_eq!(summary["files_added"], 1);
        assert_eq!(summary["files_modified"], 2);

        let added = browser.call("list_files_added", &json!({})).unwrap();
        assert_eq!(added, json!(["util.py"]));

        let modified = browser.call("list_files_modified", &json!({})).unwrap();
        let paths: Vec<&str> = modified
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["path"].as_str().unwrap())
            .collect();
        assert_eq!(paths, vec!["README.md", "main.py"]);
    }

    #[test]
    fn test_snapshot_browser_get_diff() {
        let dir = TempDir::new().unwrap();
        let (diff, old, new) = browser_fixture(&dir);
        let mut browser = SnapshotBrowser::new(&diff, &old, &new, &[]);

        let result = browser
            .call("get_diff", &json!({"file_path": "main.py"}))
            .unwrap();
        assert!(result.as_str().unwrap().contains("+print('v2')"));

        let missing = browser
            .call("get_diff", &json!({"file_path": "nope.py"}))
            .unwrap();
        assert!(missing.as_str().unwrap().contains("No diff found"));
    }

    #[test]
    fn test_snapshot_browser_lazy_file_content() {
        let dir = TempDir::new().unwrap();
        let (diff, old, new) = browser_fixture(&dir);
        let mut browser = SnapshotBrowser::new(&diff, &old, &new, &[]);
        assert!(browser.old_contents.is_none());

        let content = browser
            .call(
                "get_file_content",
                &json!({"snapshot": "old", "file_path": "main.py"}),
            )
            .unwrap();
        assert_eq!(content.as_str().unwrap(), "print('v1')\n");
        assert!(browser.old_contents.is_some());
        assert!(browser.new_contents.is_none(), "new side stays unloaded");

        let missing = browser
            .call(
                "get_file_content",
                &json!({"snapshot": "new", "file_path": "ghost.py"}),
            )
            .unwrap();
        assert!(missing.as_str().unwrap().contains("not found"));
    }

    #[test]
    fn test_snapshot_browser_status_docs() {
        let dir = TempDir::new().unwrap();
        let (diff, old, new) = browser_fixture(&dir);
        let mut browser = SnapshotBrowser::new(&diff, &old, &new, &[]);

        let docs = browser.call("get_status_docs", &json!({})).unwrap();
        assert!(docs["status_docs"]["README.md"]
            .as_str()
            .unwrap()
            .contains("updated"));
        assert!(docs["status_doc_diffs"]["README.md"]
            .as_str()
            .unwrap()
            .contains("+updated"));
    }

    #[test]
    fn test_snapshot_browser_bad_arguments() {
        let dir = TempDir::new().unwrap();
        let (diff, old, new) = browser_fixture(&dir);
        let mut browser = SnapshotBrowser::new(&diff, &old, &new, &[]);

        assert!(browser.call("get_diff", &json!({})).is_err());
        assert!(browser
            .call("list_all_files", &json!({"snapshot": "sideways"}))
            .is_err());
        assert!(browser.call("no_such_tool", &json!({})).is_err());
    }

    fn overview_results() -> Vec<AnalysisResult> {
        (0..3)
            .map(|i| AnalysisResult {
                unit_index: i,
                tier: Tier::Minor,
                narrative: format!("narrative {i}"),
                snapshot_labels: vec![format!("v{i}"), format!("v{}", i + 1)],
                files_summary: FilesSummary::default(),
            })
            .collect()
    }

    #[test]
    fn test_overview_browser_summary_and_range() {
        let results = overview_results();
        let mut browser = OverviewBrowser::new(&results);

        let one = browser
            .call("get_transition_summary", &json!({"index": 1}))
            .unwrap();
        assert_eq!(one["narrative"], "narrative 1");

        let out_of_range = browser
            .call("get_transition_summary", &json!({"index": 9}))
            .unwrap();
        assert!(out_of_range["error"].as_str().unwrap().contains("range"));

        let range = browser
            .call("get_transition_range", &json!({"start": 1, "end": 5}))
            .unwrap();
        assert_eq!(range.as_array().unwrap().len(), 2);
        assert_eq!(range[0]["index"], 1);
        assert_eq!(range[1]["index"], 2);
    }
}
