//! Process-injection detection over allocate/write/execute primitives.
//!
//! For every target process, incoming interactions are bucketed by variant
//! and correlated through address-range overlap. Full Alloc->Write->Exec
//! chains take priority; a pair that already contributed to a chain is
//! consumed and never reported again as a shorter pattern.

use crate::events::Event;
use crate::graph::ProcessGraph;

use super::{Detection, DetectionError, DisplayType, Finding};

pub struct ProcessInjection;

const NAME: &str = "Process Injection";

impl Detection for ProcessInjection {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run(&self, graph: &ProcessGraph) -> Result<Vec<Finding>, DetectionError> {
        let mut findings = Vec::new();
        for (seqid, _node) in graph.nodes() {
            let mut allocations = Vec::new();
            let mut writes = Vec::new();
            let mut executes = Vec::new();
            for event in graph.in_interactions(seqid) {
                match event {
                    Event::Allocate { .. } => allocations.push(event),
                    Event::Write { .. } => writes.push(event),
                    Event::Execute { .. } => executes.push(event),
                    _ => {}
                }
            }
            findings.extend(correlate_primitives(&allocations, &writes, &executes));
        }
        Ok(findings)
    }
}

/// Non-empty intersection of the allocated and the written range.
fn alloc_write_match(alloc: &Event, write: &Event) -> bool {
    let (Event::Allocate { address: a, size, .. }, Event::Write { address: w, bytes_written, .. }) =
        (alloc, write)
    else {
        return false;
    };
    let alloc_end = a.saturating_add(*size);
    let write_end = w.saturating_add(*bytes_written);
    (*a).max(*w) < alloc_end.min(write_end)
}

/// Some execution address falls inside the written range (half-open).
fn write_exec_match(write: &Event, execute: &Event) -> bool {
    let (Event::Write { address, bytes_written, .. }, Event::Execute { addresses, .. }) =
        (write, execute)
    else {
        return false;
    };
    let end = address.saturating_add(*bytes_written);
    addresses.iter().any(|addr| *address <= *addr && *addr < end)
}

/// Some execution address falls inside the allocated range (half-open).
fn alloc_exec_match(alloc: &Event, execute: &Event) -> bool {
    let (Event::Allocate { address, size, .. }, Event::Execute { addresses, .. }) =
        (alloc, execute)
    else {
        return false;
    };
    let end = address.saturating_add(*size);
    addresses.iter().any(|addr| *address <= *addr && *addr < end)
}

fn correlate_primitives(
    allocations: &[&Event],
    writes: &[&Event],
    executes: &[&Event],
) -> Vec<Finding> {
    // Candidate pairs as (bucket index, bucket index).
    let mut alloc_write: Vec<(usize, usize)> = Vec::new();
    for (ai, alloc) in allocations.iter().enumerate() {
        for (wi, write) in writes.iter().enumerate() {
            if alloc_write_match(alloc, write) {
                alloc_write.push((ai, wi));
            }
        }
    }
    let mut write_exec: Vec<(usize, usize)> = Vec::new();
    for (wi, write) in writes.iter().enumerate() {
        for (ei, execute) in executes.iter().enumerate() {
            if write_exec_match(write, execute) {
                write_exec.push((wi, ei));
            }
        }
    }
    let mut alloc_exec: Vec<(usize, usize)> = Vec::new();
    for (ai, alloc) in allocations.iter().enumerate() {
        for (ei, execute) in executes.iter().enumerate() {
            if alloc_exec_match(alloc, execute) {
                alloc_exec.push((ai, ei));
            }
        }
    }

    let mut findings = Vec::new();

    // Full chains first; every pair is consumed by at most one chain.
    let mut aw_idx = 0;
    while aw_idx < alloc_write.len() {
        let (ai, wi) = alloc_write[aw_idx];
        let chain = write_exec
            .iter()
            .position(|&(wi2, _)| wi2 == wi)
            .map(|we_idx| (we_idx, write_exec[we_idx].1));
        match chain {
            Some((we_idx, ei)) => {
                findings.push(Finding::new(
                    NAME,
                    DisplayType::Edge,
                    "Alloc->Write->Exec",
                    vec![
                        (*allocations[ai]).clone(),
                        (*writes[wi]).clone(),
                        (*executes[ei]).clone(),
                    ],
                ));
                alloc_write.remove(aw_idx);
                write_exec.remove(we_idx);
                alloc_exec.retain(|&(ai2, ei2)| !(ai2 == ai && ei2 == ei));
            }
            None => aw_idx += 1,
        }
    }

    for (ai, wi) in alloc_write {
        findings.push(Finding::new(
            NAME,
            DisplayType::Edge,
            "Alloc->Write",
            vec![(*allocations[ai]).clone(), (*writes[wi]).clone()],
        ));
    }
    for (wi, ei) in write_exec {
        findings.push(Finding::new(
            NAME,
            DisplayType::Edge,
            "Write->Exec",
            vec![(*writes[wi]).clone(), (*executes[ei]).clone()],
        ));
    }
    for (ai, ei) in alloc_exec {
        findings.push(Finding::new(
            NAME,
            DisplayType::Edge,
            "Alloc->Exec",
            vec![(*allocations[ai]).clone(), (*executes[ei]).clone()],
        ));
    }

    findings
}
