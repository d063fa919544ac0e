//! Operator entry point: run the correlation core over one analysis
//! directory, the way the plugin runner would.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use serde::Deserialize;

use sandgraph::postprocess::{LogFiles, PostprocessContext, build_process_graph};
use sandgraph::process_tree::ProcessTree;

const ENV_CONFIG_PATH: &str = "SANDGRAPH_CONFIG";
const PROCESS_TREE_FILE: &str = "process_tree.json";

#[derive(Parser, Debug)]
#[command(name = "sandgraph")]
#[command(about = "Build the annotated process graph for a finished sandbox analysis")]
struct Args {
    /// Analysis directory holding the trace logs and process_tree.json
    analysis_dir: PathBuf,
    /// Path to config file (overrides SANDGRAPH_CONFIG)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Also write the report patch as report_processes.json
    #[arg(long)]
    write_report: bool,
}

#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    logs: LogFiles,
}

impl Config {
    /// Load configuration. The path comes from `--config`, then the
    /// `SANDGRAPH_CONFIG` environment variable. A missing or unparseable
    /// file falls back to defaults.
    fn load(explicit: Option<&PathBuf>) -> Self {
        let path = explicit
            .map(|p| p.to_string_lossy().into_owned())
            .or_else(|| std::env::var(ENV_CONFIG_PATH).ok());
        let Some(path) = path else {
            return Config::default();
        };
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|err| {
                warn!("config {path} not parseable ({err}), using defaults");
                Config::default()
            }),
            Err(err) => {
                warn!("config {path} not readable ({err}), using defaults");
                Config::default()
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = Config::load(args.config.as_ref());

    let mut context = PostprocessContext::new(&args.analysis_dir);
    context.log_files = config.logs;

    let tree_path = args.analysis_dir.join(PROCESS_TREE_FILE);
    match ProcessTree::from_json_file(&tree_path) {
        Ok(tree) => context.process_tree = Some(tree),
        Err(err) => warn!("no usable process tree at {}: {err:#}", tree_path.display()),
    }

    let Some(patch) = build_process_graph(&context)? else {
        anyhow::bail!(
            "no process tree in {}; run the tree builder first",
            args.analysis_dir.display()
        );
    };

    if args.write_report {
        let report_path = args.analysis_dir.join("report_processes.json");
        fs::write(&report_path, serde_json::to_string(&patch)?)
            .with_context(|| format!("writing {}", report_path.display()))?;
        info!("report patch written to {}", report_path.display());
    }

    let count = patch["processes"].as_array().map_or(0, Vec::len);
    println!(
        "process graph built for {} ({count} processes)",
        args.analysis_dir.display()
    );
    Ok(())
}
