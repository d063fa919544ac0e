//! Read-only view over the process tree produced by the sandbox.
//!
//! The tree itself is built by an earlier pipeline stage from the process
//! monitor log; this module only loads the snapshot and answers lookups.
//! Pids are recycled by the guest OS, so a lookup is always qualified by the
//! event id at which the pid was observed: each process carries the trace
//! interval during which it was alive.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Immutable snapshot of one process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    /// Monotonic sequence id, unique within an analysis even across pid reuse.
    pub seqid: u32,
    pub pid: u32,
    pub procname: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub started_at: Option<f64>,
    #[serde(default)]
    pub exited_at: Option<f64>,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub exit_code_str: Option<String>,
    #[serde(default)]
    pub killed_by: Option<String>,
    #[serde(default)]
    pub parent_seqid: Option<u32>,
    /// First event id at which this process was observed alive.
    #[serde(default)]
    pub evtid_from: Option<u64>,
    /// Event id past the end of this process's lifetime, if it exited.
    #[serde(default)]
    pub evtid_to: Option<u64>,
}

impl Process {
    /// Whether this process was alive when the given event was recorded.
    /// Bounds are half-open; an absent bound is unbounded on that side.
    fn covers(&self, evtid: u64) -> bool {
        self.evtid_from.is_none_or(|from| from <= evtid)
            && self.evtid_to.is_none_or(|to| evtid < to)
    }
}

pub struct ProcessTree {
    processes: Vec<Process>,
    by_seqid: HashMap<u32, usize>,
    by_pid: HashMap<u32, Vec<usize>>,
}

impl ProcessTree {
    pub fn from_processes(processes: Vec<Process>) -> Self {
        let mut by_seqid = HashMap::new();
        let mut by_pid: HashMap<u32, Vec<usize>> = HashMap::new();
        for (idx, process) in processes.iter().enumerate() {
            by_seqid.insert(process.seqid, idx);
            by_pid.entry(process.pid).or_default().push(idx);
        }
        for indices in by_pid.values_mut() {
            indices.sort_by_key(|&idx| processes[idx].evtid_from.unwrap_or(0));
        }
        Self {
            processes,
            by_seqid,
            by_pid,
        }
    }

    /// Load the `process_tree.json` snapshot written by the tree builder.
    /// Accepts either a bare array of processes or an object wrapping it.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading process tree {}", path.display()))?;
        let value: Value = serde_json::from_str(&data)
            .with_context(|| format!("parsing process tree {}", path.display()))?;
        let list = match &value {
            Value::Array(list) => list.clone(),
            Value::Object(obj) => obj
                .get("processes")
                .and_then(Value::as_array)
                .cloned()
                .context("process tree object has no 'processes' array")?,
            _ => anyhow::bail!("process tree is neither an array nor an object"),
        };
        let processes = list
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Process>, _>>()
            .context("decoding process snapshots")?;
        Ok(Self::from_processes(processes))
    }

    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.processes.iter()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn get(&self, seqid: u32) -> Option<&Process> {
        self.by_seqid.get(&seqid).map(|&idx| &self.processes[idx])
    }

    /// Resolve a pid to the process instance that was alive when the given
    /// event was recorded. With recycled pids, later instances shadow
    /// earlier ones over disjoint intervals.
    pub fn lookup(&self, pid: u32, evtid: u64) -> Option<&Process> {
        let indices = self.by_pid.get(&pid)?;
        indices
            .iter()
            .map(|&idx| &self.processes[idx])
            .filter(|process| process.covers(evtid))
            .last()
    }

    /// The `processes` section contributed to the analysis report.
    pub fn report_processes(&self) -> Value {
        let entries: Vec<Value> = self
            .processes
            .iter()
            .map(|process| {
                json!({
                    "seqid": process.seqid,
                    "pid": process.pid,
                    "parent_seqid": process.parent_seqid,
                    "name": process.procname,
                    "args": process.args,
                    "started_at": process.started_at,
                    "exited_at": process.exited_at,
                    "exit_code": process.exit_code,
                    "exit_code_str": process.exit_code_str,
                    "killed_by": process.killed_by,
                })
            })
            .collect();
        json!({ "processes": entries })
    }
}

#[cfg(test)]
pub(crate) fn test_process(seqid: u32, pid: u32, name: &str) -> Process {
    Process {
        seqid,
        pid,
        procname: name.to_string(),
        args: Vec::new(),
        started_at: None,
        exited_at: None,
        exit_code: None,
        exit_code_str: None,
        killed_by: None,
        parent_seqid: None,
        evtid_from: None,
        evtid_to: None,
    }
}
