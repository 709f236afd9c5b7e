//! CLI argument handling for chronicle
//!
//! Parses the command-line surface, loads the TOML configuration, and
//! applies flag overrides. `main` stays a thin shell around these helpers.

use std::path::{Path, PathBuf};

use clap::Parser;

use chronicle_core::Config;

pub const DEFAULT_CONFIG_FILE: &str = "chronicle.toml";

/// Analyze the evolution of a coding project through zip snapshots.
#[derive(Debug, Parser)]
#[command(name = "chronicle", version, about)]
pub struct Args {
    /// Project name to analyze (e.g., Document_Analyzer)
    pub project_name: Option<String>,

    /// List all projects found in the zip directory
    #[arg(long)]
    pub list_projects: bool,

    /// Compare two specific snapshots with deep analysis
    #[arg(long, num_args = 2, value_names = ["LABEL_A", "LABEL_B"])]
    pub drill_down: Option<Vec<String>>,

    /// Run local analysis only (phases 1-3): discover, diff, and plan.
    /// No API calls.
    #[arg(long)]
    pub plan_only: bool,

    /// Directory containing zip files (overrides the config file)
    #[arg(long, value_name = "DIR")]
    pub zip_dir: Option<String>,

    /// Output directory for reports (overrides the config file)
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<String>,

    /// Model to use (overrides the config file's current_engine)
    #[arg(long, value_name = "NAME")]
    pub model: Option<String>,

    /// Path to the configuration file
    #[arg(long, value_name = "FILE", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
}

impl Args {
    /// Load the config file (when present) and apply flag overrides. A
    /// missing config file is only an error when it was named explicitly.
    pub fn resolve_config(&self) -> chronicle_core::Result<Config> {
        let mut config = if self.config.exists() {
            Config::load(&self.config)?
        } else if self.config == Path::new(DEFAULT_CONFIG_FILE) {
            Config::default()
        } else {
            return Err(chronicle_core::Error::Config(format!(
                "configuration file not found: {}",
                self.config.display()
            )));
        };
        config.apply_overrides(
            self.zip_dir.as_deref(),
            self.output_dir.as_deref(),
            self.model.as_deref(),
        );
        Ok(config)
    }

    /// The drill-down label pair, when given.
    pub fn drill_down_labels(&self) -> Option<(String, String)> {
        self.drill_down
            .as_ref()
            .filter(|labels| labels.len() == 2)
            .map(|labels| (labels[0].clone(), labels[1].clone()))
    }
}
