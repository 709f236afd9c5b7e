//! Tool definitions for tool-assisted analysis
//!
//! Uniform author-facing schemas (name, description, JSON-schema input).
//! Provider adapters translate these into their native tool formats.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Tool definition for LLM function calling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name
    pub name: String,
    /// Tool description
    pub description: String,
    /// JSON schema for parameters
    pub parameters: serde_json::Value,
}

/// Tools exposed to the model while exploring one snapshot transition.
pub fn snapshot_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "get_change_summary".to_string(),
            description: "Get a high-level statistical summary of this transition: \
                          counts of files added, removed, modified, moved, and total diff lines."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        },
        ToolDefinition {
            name: "list_files_added".to_string(),
            description: "List all file paths that were added in this transition.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        },
        ToolDefinition {
            name: "list_files_removed".to_string(),
            description: "List all file paths that were removed in this transition.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        },
        ToolDefinition {
            name: "list_files_moved".to_string(),
            description: "List all files that were moved/renamed, showing old and new paths."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        },
        ToolDefinition {
            name: "list_files_modified".to_string(),
            description: "List all modified file paths with the number of diff lines for each. \
                          Use this to decide which files to inspect in detail."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        },
        ToolDefinition {
            name: "get_diff".to_string(),
            description: "Get the full unified diff for a specific modified file. \
                          No truncation is applied; you see the complete diff."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "file_path": {
                        "type": "string",
                        "description": "The relative file path (as shown in list_files_modified)."
                    }
                },
                "required": ["file_path"]
            }),
        },
        ToolDefinition {
            name: "get_file_content".to_string(),
            description: "Read the full content of a file from either the old or new snapshot. \
                          Useful for understanding context around a diff, or reading newly added files."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "snapshot": {
                        "type": "string",
                        "enum": ["old", "new"],
                        "description": "Which snapshot to read from."
                    },
                    "file_path": {
                        "type": "string",
                        "description": "The relative file path to read."
                    }
                },
                "required": ["snapshot", "file_path"]
            }),
        },
        ToolDefinition {
            name: "get_status_docs".to_string(),
            description: "Get the content of developer status/documentation files (STATUS.md, \
                          CHANGELOG.md, TODO.md, etc.) from the new snapshot, plus their diffs \
                          if they were modified."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        },
        ToolDefinition {
            name: "list_all_files".to_string(),
            description: "Get the complete file listing for either the old or new snapshot."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "snapshot": {
                        "type": "string",
                        "enum": ["old", "new"],
                        "description": "Which snapshot's file listing to return."
                    }
                },
                "required": ["snapshot"]
            }),
        },
    ]
}

/// Tools exposed to the model while writing the cross-transition overview.
pub fn overview_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "get_transition_summary".to_string(),
            description: "Get the analysis narrative for a specific transition by its index. \
                          Use the transition list provided in the initial context to choose indices."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "index": {
                        "type": "integer",
                        "description": "The transition index (0-based, from the transition list)."
                    }
                },
                "required": ["index"]
            }),
        },
        ToolDefinition {
            name: "get_transition_range".to_string(),
            description: "Get the analysis narratives for a range of transitions. \
                          More efficient than calling get_transition_summary repeatedly."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "start": {
                        "type": "integer",
                        "description": "Start index (inclusive, 0-based)."
                    },
                    "end": {
                        "type": "integer",
                        "description": "End index (inclusive, 0-based)."
                    }
                },
                "required": ["start", "end"]
            }),
        },
    ]
}
