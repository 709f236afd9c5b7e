//! chronicle CLI
//!
//! Entry point for the project history analyzer.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use chronicle_cli::Args;
use chronicle_core::{run_analysis, run_list_projects, RunOptions};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match args.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if args.list_projects {
        if let Err(e) = run_list_projects(&config) {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
        return;
    }

    let Some(project_name) = args.project_name.clone() else {
        // No project and no --list-projects: print help and fail
        use clap::CommandFactory;
        Args::command().print_help().ok();
        println!();
        std::process::exit(1);
    };

    let options = RunOptions {
        plan_only: args.plan_only,
        drill_down: args.drill_down_labels(),
    };

    if let Err(e) = run_analysis(config, &project_name, &options).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
