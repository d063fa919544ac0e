//! Post-processing entry point invoked by the plugin runner.
//!
//! Wires the whole pipeline together over one analysis directory: trace
//! logs -> parser -> graph -> detection -> summary projection -> on-disk
//! `process_graph.json`, returning the `processes` report section for the
//! runner to merge.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{error, info};
use serde::Deserialize;
use serde_json::Value;

use crate::detection::DetectionEngine;
use crate::graph::ProcessGraph;
use crate::log_reader::read_all_records;
use crate::parser::EventParser;
use crate::process_tree::ProcessTree;
use crate::summary::project;

pub const PROCESS_GRAPH_FILE: &str = "process_graph.json";

/// Names of the trace logs inside an analysis directory.
#[derive(Debug, Clone, Deserialize)]
pub struct LogFiles {
    #[serde(default = "default_syscall_log")]
    pub syscall: String,
    #[serde(default = "default_apimon_log")]
    pub apimon: String,
    #[serde(default = "default_filetracer_log")]
    pub filetracer: String,
}

impl Default for LogFiles {
    fn default() -> Self {
        Self {
            syscall: default_syscall_log(),
            apimon: default_apimon_log(),
            filetracer: default_filetracer_log(),
        }
    }
}

fn default_syscall_log() -> String {
    "syscall.log".to_string()
}
fn default_apimon_log() -> String {
    "apimon.log".to_string()
}
fn default_filetracer_log() -> String {
    "filetracer.log".to_string()
}

impl LogFiles {
    fn paths(&self, analysis_dir: &Path) -> Vec<PathBuf> {
        [&self.syscall, &self.apimon, &self.filetracer]
            .into_iter()
            .map(|name| analysis_dir.join(name))
            .collect()
    }
}

/// State handed along the post-processing plugin chain. The process tree is
/// produced by an earlier stage.
pub struct PostprocessContext {
    pub analysis_dir: PathBuf,
    pub process_tree: Option<ProcessTree>,
    pub log_files: LogFiles,
}

impl PostprocessContext {
    pub fn new(analysis_dir: impl Into<PathBuf>) -> Self {
        Self {
            analysis_dir: analysis_dir.into(),
            process_tree: None,
            log_files: LogFiles::default(),
        }
    }
}

/// Build the annotated process graph for an analysis and write it as
/// `process_graph.json`. Returns the report patch, or `None` when the
/// process tree was never prepared (in which case nothing is written).
pub fn build_process_graph(context: &PostprocessContext) -> anyhow::Result<Option<Value>> {
    let Some(tree) = &context.process_tree else {
        error!("process tree not prepared; the tree builder must run first");
        return Ok(None);
    };

    let paths = context.log_files.paths(&context.analysis_dir);
    info!(
        "building process graph for {} ({} processes)",
        context.analysis_dir.display(),
        tree.len()
    );

    let mut parser = EventParser::new();
    let mut graph = ProcessGraph::from_tree(tree);
    let records = read_all_records(&paths);
    graph.ingest(records.filter_map(|record| parser.parse(&record)), tree);
    parser.finish();

    let findings = DetectionEngine::new().run(&graph);
    let summary = project(&graph, &findings).context("projecting summary graph")?;

    let graph_path = context.analysis_dir.join(PROCESS_GRAPH_FILE);
    let data = serde_json::to_string(&summary.to_cytoscape())
        .context("serializing process graph")?;
    fs::write(&graph_path, data)
        .with_context(|| format!("writing {}", graph_path.display()))?;
    info!("process graph written to {}", graph_path.display());

    Ok(Some(tree.report_processes()))
}
