//! Summary-graph projection.
//!
//! The detail graph keeps every interaction; the summary graph is what the
//! UI renders. Projection copies nodes and child edges, collapses edge
//! findings into labeled detection edges, and attaches node-attribute
//! findings to their process. Raw interaction edges stay behind in the
//! detail graph. All event payloads are converted to record form here, at
//! the serialization boundary.

use std::collections::HashMap;

use log::{error, warn};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::detection::{DisplayType, Finding};
use crate::events::Event;
use crate::graph::{EdgeKind, ProcessGraph};

/// A graph attribute could not be converted to record form for export.
/// Known event variants always convert; this covers foreign attribute types.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("attribute on node {seqid} is not serializable: {source}")]
    UnsupportedAttribute {
        seqid: u32,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryNode {
    pub seqid: u32,
    pub label: String,
    pub child_count: usize,
    /// Node-scoped events, already in record form.
    pub node_events: Vec<Value>,
    /// Serialized node-attribute findings; empty for clean processes.
    pub findings: Vec<Value>,
    pub process: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryEdgeType {
    Child,
    Detection,
}

impl SummaryEdgeType {
    pub fn as_str(self) -> &'static str {
        match self {
            SummaryEdgeType::Child => "child",
            SummaryEdgeType::Detection => "detection",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryEdge {
    pub key: String,
    pub source: u32,
    pub target: u32,
    pub edge_type: SummaryEdgeType,
    pub label: String,
    /// Serialized findings; empty for child edges.
    pub findings: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryGraph {
    pub nodes: Vec<SummaryNode>,
    pub edges: Vec<SummaryEdge>,
}

/// Project (detail graph, findings) into an independently owned summary
/// graph. The inputs are not mutated; projecting twice yields equal output.
/// An attribute that cannot be serialized fails the whole projection.
pub fn project(graph: &ProcessGraph, findings: &[Finding]) -> Result<SummaryGraph, ExportError> {
    let mut nodes = Vec::new();
    for (seqid, node) in graph.nodes() {
        let node_findings: Vec<Value> = findings
            .iter()
            .filter(|finding| {
                finding.display_type == DisplayType::NodeAttribute
                    && finding.primary_target_seqid() == Some(seqid)
            })
            .map(Finding::to_record)
            .collect();
        let process = serde_json::to_value(&node.process).map_err(|source| {
            error!("process snapshot on node {seqid} is not serializable: {source}");
            ExportError::UnsupportedAttribute { seqid, source }
        })?;
        nodes.push(SummaryNode {
            seqid,
            label: node.label.clone(),
            child_count: graph.child_count(seqid),
            node_events: node.node_events.iter().map(Event::to_record).collect(),
            findings: node_findings,
            process,
        });
    }

    let mut edges = Vec::new();
    for edge in graph.edges() {
        if matches!(edge.kind, EdgeKind::Child) {
            edges.push(SummaryEdge {
                key: edge.key.clone(),
                source: edge.source,
                target: edge.target,
                edge_type: SummaryEdgeType::Child,
                label: "child".to_string(),
                findings: Vec::new(),
            });
        }
    }

    // Edge findings collapse into one detection edge per
    // (source, target, detection, pattern) group.
    type GroupKey = (u32, u32, String, String);
    let mut group_order: Vec<GroupKey> = Vec::new();
    let mut groups: HashMap<GroupKey, Vec<&Finding>> = HashMap::new();
    for finding in findings {
        if finding.display_type != DisplayType::Edge {
            continue;
        }
        let (Some(source), Some(target)) = (finding.source_seqid(), finding.primary_target_seqid())
        else {
            warn!(
                "edge finding '{}' has unresolved endpoints, skipping",
                finding.pattern
            );
            continue;
        };
        let key = (
            source,
            target,
            finding.detection_name.clone(),
            finding.pattern.clone(),
        );
        let bucket = groups.entry(key.clone()).or_default();
        if bucket.is_empty() {
            group_order.push(key);
        }
        bucket.push(finding);
    }
    for (idx, key) in group_order.iter().enumerate() {
        let (source, target, _name, pattern) = key;
        if graph.node(*source).is_none() || graph.node(*target).is_none() {
            warn!(
                "detection edge {source} -> {target} references a missing node, skipping"
            );
            continue;
        }
        let group = &groups[key];
        edges.push(SummaryEdge {
            key: format!("detection_{idx}"),
            source: *source,
            target: *target,
            edge_type: SummaryEdgeType::Detection,
            label: format!("{pattern} (x{})", group.len()),
            findings: group.iter().map(|finding| finding.to_record()).collect(),
        });
    }

    Ok(SummaryGraph { nodes, edges })
}

impl SummaryGraph {
    /// Cytoscape-compatible JSON shape consumed by the report UI.
    pub fn to_cytoscape(&self) -> Value {
        let nodes: Vec<Value> = self
            .nodes
            .iter()
            .map(|node| {
                let mut data = Map::new();
                data.insert("id".into(), json!(node.seqid.to_string()));
                data.insert("label".into(), json!(node.label));
                data.insert("type".into(), json!("Process"));
                data.insert("child_count".into(), json!(node.child_count));
                data.insert("node_events".into(), Value::Array(node.node_events.clone()));
                data.insert("process".into(), node.process.clone());
                if !node.findings.is_empty() {
                    data.insert("has_finding".into(), json!(true));
                    data.insert("findings".into(), Value::Array(node.findings.clone()));
                }
                json!({ "data": data })
            })
            .collect();

        let edges: Vec<Value> = self
            .edges
            .iter()
            .map(|edge| {
                let mut data = Map::new();
                data.insert("id".into(), json!(edge.key));
                data.insert("source".into(), json!(edge.source.to_string()));
                data.insert("target".into(), json!(edge.target.to_string()));
                data.insert("type".into(), json!(edge.edge_type.as_str()));
                data.insert("label".into(), json!(edge.label));
                if edge.edge_type == SummaryEdgeType::Detection {
                    data.insert("findings".into(), Value::Array(edge.findings.clone()));
                }
                json!({ "data": data })
            })
            .collect();

        json!({
            "data": {},
            "directed": true,
            "multigraph": true,
            "elements": {
                "nodes": nodes,
                "edges": edges,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::DetectionEngine;
    use crate::events::EventHeader;
    use crate::process_tree::{ProcessTree, test_process};

    fn injected_graph() -> (ProcessGraph, ProcessTree) {
        let parent = test_process(1, 100, r"C:\dropper.exe");
        let mut child = test_process(2, 200, r"C:\Windows\System32\svchost.exe");
        child.parent_seqid = Some(1);
        let tree = ProcessTree::from_processes(vec![parent, child]);
        let mut graph = ProcessGraph::from_tree(&tree);

        let mut alloc_header = EventHeader::new(100, 0x10, "NtAllocateVirtualMemory");
        alloc_header.target_pid = Some(200);
        let mut write_header = EventHeader::new(100, 0x11, "NtWriteVirtualMemory");
        write_header.target_pid = Some(200);
        let mut exec_header = EventHeader::new(100, 0x12, "NtCreateThreadEx");
        exec_header.target_pid = Some(200);
        let register_header =
            EventHeader::new(100, 0x13, "ITaskFolder::RegisterTaskDefinition");
        let file_header = EventHeader::new(100, 0x14, "NtWriteFile");

        graph.ingest(
            vec![
                Event::Allocate {
                    header: alloc_header,
                    address: 0x1000,
                    size: 0x2000,
                },
                Event::Write {
                    header: write_header,
                    address: 0x1400,
                    bytes_written: 0x100,
                },
                Event::Execute {
                    header: exec_header,
                    addresses: vec![0x1420],
                    target_tid: None,
                },
                Event::TaskRegister {
                    header: register_header,
                    task_name: "EvilTask".into(),
                },
                Event::FileTaskFolder {
                    header: file_header,
                    file_name: r"C:\Windows\System32\Tasks\EvilTask".into(),
                },
            ],
            &tree,
        );
        (graph, tree)
    }

    #[test]
    fn summary_carries_only_child_and_detection_edges() {
        let (graph, _tree) = injected_graph();
        let findings = DetectionEngine::new().run(&graph);
        let summary = project(&graph, &findings).unwrap();

        assert_eq!(summary.nodes.len(), 2);
        let types: Vec<SummaryEdgeType> =
            summary.edges.iter().map(|edge| edge.edge_type).collect();
        assert_eq!(
            types,
            vec![SummaryEdgeType::Child, SummaryEdgeType::Detection]
        );
        let detection = &summary.edges[1];
        assert_eq!(detection.source, 1);
        assert_eq!(detection.target, 2);
        assert_eq!(detection.label, "Alloc->Write->Exec (x1)");
        assert_eq!(detection.findings.len(), 1);
    }

    #[test]
    fn node_attribute_findings_attach_to_their_node() {
        let (graph, _tree) = injected_graph();
        let findings = DetectionEngine::new().run(&graph);
        let summary = project(&graph, &findings).unwrap();

        let dropper = summary.nodes.iter().find(|n| n.seqid == 1).unwrap();
        assert_eq!(dropper.findings.len(), 1);
        assert_eq!(
            dropper.findings[0]["pattern"],
            "Task 'EvilTask' Created"
        );
        assert_eq!(dropper.node_events.len(), 2);
        assert_eq!(dropper.child_count, 1);

        let target = summary.nodes.iter().find(|n| n.seqid == 2).unwrap();
        assert!(target.findings.is_empty());
        assert_eq!(target.child_count, 0);
    }

    #[test]
    fn projection_is_idempotent() {
        let (graph, _tree) = injected_graph();
        let findings = DetectionEngine::new().run(&graph);
        let first = project(&graph, &findings).unwrap();
        let second = project(&graph, &findings).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_cytoscape(), second.to_cytoscape());
    }

    #[test]
    fn repeated_patterns_collapse_with_a_count() {
        let (graph, _tree) = {
            let parent = test_process(1, 100, "a.exe");
            let child = test_process(2, 200, "b.exe");
            let tree = ProcessTree::from_processes(vec![parent, child]);
            let mut graph = ProcessGraph::from_tree(&tree);
            for evtid in [0x10u64, 0x20] {
                let mut write_header = EventHeader::new(100, evtid, "NtWriteVirtualMemory");
                write_header.target_pid = Some(200);
                let mut exec_header = EventHeader::new(100, evtid + 1, "NtCreateThreadEx");
                exec_header.target_pid = Some(200);
                graph.ingest(
                    vec![
                        Event::Write {
                            header: write_header,
                            address: 0x1000 * evtid,
                            bytes_written: 0x100,
                        },
                        Event::Execute {
                            header: exec_header,
                            addresses: vec![0x1000 * evtid + 0x10],
                            target_tid: None,
                        },
                    ],
                    &tree,
                );
            }
            (graph, tree)
        };
        let findings = DetectionEngine::new().run(&graph);
        assert_eq!(findings.len(), 2);
        let summary = project(&graph, &findings).unwrap();
        let detections: Vec<&SummaryEdge> = summary
            .edges
            .iter()
            .filter(|edge| edge.edge_type == SummaryEdgeType::Detection)
            .collect();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].label, "Write->Exec (x2)");
        assert_eq!(detections[0].findings.len(), 2);
    }

    #[test]
    fn cytoscape_shape_for_ui() {
        let (graph, _tree) = injected_graph();
        let findings = DetectionEngine::new().run(&graph);
        let summary = project(&graph, &findings).unwrap();
        let data = summary.to_cytoscape();

        assert_eq!(data["directed"], true);
        assert_eq!(data["multigraph"], true);
        let nodes = data["elements"]["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0]["data"]["id"], "1");
        assert_eq!(nodes[0]["data"]["type"], "Process");
        assert_eq!(nodes[0]["data"]["has_finding"], true);
        let edges = data["elements"]["edges"].as_array().unwrap();
        assert_eq!(edges[0]["data"]["type"], "child");
        assert_eq!(edges[1]["data"]["type"], "detection");
        assert_eq!(edges[1]["data"]["source"], "1");
        assert_eq!(edges[1]["data"]["target"], "2");
        // Events inside the export are plain records.
        assert_eq!(
            edges[1]["data"]["findings"][0]["correlated_events"][0]["event_type"],
            "Allocate"
        );
    }
}
