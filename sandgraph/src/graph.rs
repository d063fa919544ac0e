//! Process multigraph: the parent/child tree overlaid with observed
//! inter-process interactions and per-process events.
//!
//! Nodes are keyed by process seqid. Between one ordered pair of nodes there
//! can be many edges (one `child` edge plus any number of interactions), so
//! edges carry an explicit key that must be unique per ordered pair. Events
//! are moved into the graph at ingestion and stay in their native variant
//! form; conversion to record form only happens at the export boundary.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::{debug, error};

use crate::events::Event;
use crate::process_tree::{Process, ProcessTree};

#[derive(Debug)]
pub enum EdgeKind {
    Child,
    Interaction(Event),
}

#[derive(Debug)]
pub struct GraphEdge {
    pub key: String,
    pub source: u32,
    pub target: u32,
    pub kind: EdgeKind,
}

#[derive(Debug)]
pub struct NodeData {
    pub process: Process,
    pub label: String,
    /// Events attributed to this process alone, in ingestion order.
    pub node_events: Vec<Event>,
}

#[derive(Default)]
pub struct ProcessGraph {
    nodes: BTreeMap<u32, NodeData>,
    edges: Vec<GraphEdge>,
    out_edges: HashMap<u32, Vec<usize>>,
    in_edges: HashMap<u32, Vec<usize>>,
    edge_keys: HashSet<(u32, u32, String)>,
}

/// Last path component of a Windows image path; tolerates forward slashes.
pub(crate) fn windows_basename(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

impl ProcessGraph {
    /// Build the structural graph: one node per process, one `child` edge
    /// per parent/child link.
    pub fn from_tree(tree: &ProcessTree) -> Self {
        let mut graph = Self::default();
        for process in tree.processes() {
            graph.add_node(process.clone());
        }
        for process in tree.processes() {
            if let Some(parent) = process.parent_seqid {
                graph.add_edge(parent, process.seqid, "child".to_string(), EdgeKind::Child);
            }
        }
        graph
    }

    fn add_node(&mut self, process: Process) {
        let label = format!("{}\n({})", windows_basename(&process.procname), process.pid);
        debug!("adding node {} ({})", process.seqid, process.procname);
        self.nodes.insert(
            process.seqid,
            NodeData {
                process,
                label,
                node_events: Vec::new(),
            },
        );
    }

    fn add_edge(&mut self, source: u32, target: u32, key: String, kind: EdgeKind) {
        if !self.nodes.contains_key(&source) || !self.nodes.contains_key(&target) {
            error!("edge {key} references missing node ({source} -> {target}), dropping");
            return;
        }
        if !self
            .edge_keys
            .insert((source, target, key.clone()))
        {
            error!("duplicate edge key {key} between {source} -> {target}, dropping");
            return;
        }
        let idx = self.edges.len();
        self.edges.push(GraphEdge {
            key,
            source,
            target,
            kind,
        });
        self.out_edges.entry(source).or_default().push(idx);
        self.in_edges.entry(target).or_default().push(idx);
    }

    /// Attach parsed events to the graph. Edge-typed events become
    /// interaction edges; node-typed events land on their source node.
    /// Events whose pids cannot be resolved at their evtid are dropped.
    pub fn ingest(&mut self, events: impl IntoIterator<Item = Event>, tree: &ProcessTree) {
        for mut event in events {
            let header = event.header();
            let source = match tree.lookup(header.source_pid, header.evtid) {
                Some(process) => process.seqid,
                None => {
                    error!(
                        "no process for source pid {} at evtid {:#x} ({}), dropping event",
                        header.source_pid, header.evtid, header.method
                    );
                    continue;
                }
            };
            event.header_mut().source_seqid = Some(source);

            match event.header().target_pid {
                Some(target_pid) => {
                    let evtid = event.header().evtid;
                    let target = match tree.lookup(target_pid, evtid) {
                        Some(process) => process.seqid,
                        None => {
                            error!(
                                "no process for target pid {target_pid} at evtid {evtid:#x}, \
                                 dropping event"
                            );
                            continue;
                        }
                    };
                    event.header_mut().target_seqid = Some(target);
                    let key = format!("interaction_{evtid}");
                    self.add_edge(source, target, key, EdgeKind::Interaction(event));
                }
                None => {
                    if let Some(node) = self.nodes.get_mut(&source) {
                        node.node_events.push(event);
                    }
                }
            }
        }
    }

    /// Nodes in seqid order.
    pub fn nodes(&self) -> impl Iterator<Item = (u32, &NodeData)> {
        self.nodes.iter().map(|(&seqid, data)| (seqid, data))
    }

    pub fn node(&self, seqid: u32) -> Option<&NodeData> {
        self.nodes.get(&seqid)
    }

    pub fn edges(&self) -> impl Iterator<Item = &GraphEdge> {
        self.edges.iter()
    }

    /// Interaction events targeting the given node, in ingestion order.
    pub fn in_interactions(&self, seqid: u32) -> impl Iterator<Item = &Event> {
        self.in_edges
            .get(&seqid)
            .into_iter()
            .flatten()
            .filter_map(|&idx| match &self.edges[idx].kind {
                EdgeKind::Interaction(event) => Some(event),
                EdgeKind::Child => None,
            })
    }

    pub fn child_count(&self, seqid: u32) -> usize {
        self.out_edges
            .get(&seqid)
            .into_iter()
            .flatten()
            .filter(|&&idx| matches!(self.edges[idx].kind, EdgeKind::Child))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHeader;
    use crate::process_tree::test_process as process;

    fn tree_with_two() -> ProcessTree {
        let parent = process(1, 100, r"C:\dropper.exe");
        let mut child = process(2, 200, r"C:\Windows\System32\notepad.exe");
        child.parent_seqid = Some(1);
        ProcessTree::from_processes(vec![parent, child])
    }

    fn write_event(evtid: u64, source_pid: u32, target_pid: Option<u32>) -> Event {
        let mut header = EventHeader::new(source_pid, evtid, "NtWriteVirtualMemory");
        header.target_pid = target_pid;
        Event::Write {
            header,
            address: 0x1000,
            bytes_written: 0x10,
        }
    }

    #[test]
    fn from_tree_builds_nodes_and_child_edges() {
        let tree = tree_with_two();
        let graph = ProcessGraph::from_tree(&tree);
        assert_eq!(graph.nodes().count(), 2);
        assert_eq!(graph.child_count(1), 1);
        assert_eq!(graph.child_count(2), 0);
        assert_eq!(graph.node(2).unwrap().label, "notepad.exe\n(200)");
    }

    #[test]
    fn ingest_routes_edge_and_node_events() {
        let tree = tree_with_two();
        let mut graph = ProcessGraph::from_tree(&tree);

        let edge_event = write_event(0x10, 100, Some(200));
        let node_event = Event::TaskRegister {
            header: EventHeader::new(100, 0x11, "ITaskFolder::RegisterTaskDefinition"),
            task_name: "T".into(),
        };
        graph.ingest(vec![edge_event, node_event], &tree);

        let incoming: Vec<&Event> = graph.in_interactions(2).collect();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].header().source_seqid, Some(1));
        assert_eq!(incoming[0].header().target_seqid, Some(2));

        let node = graph.node(1).unwrap();
        assert_eq!(node.node_events.len(), 1);
        assert_eq!(node.node_events[0].header().source_seqid, Some(1));
    }

    #[test]
    fn unresolvable_pids_are_dropped() {
        let tree = tree_with_two();
        let mut graph = ProcessGraph::from_tree(&tree);
        graph.ingest(vec![write_event(0x10, 999, Some(200))], &tree);
        graph.ingest(vec![write_event(0x11, 100, Some(999))], &tree);
        assert_eq!(graph.in_interactions(2).count(), 0);
        assert!(graph.node(1).unwrap().node_events.is_empty());
    }

    #[test]
    fn duplicate_interaction_keys_are_rejected() {
        let tree = tree_with_two();
        let mut graph = ProcessGraph::from_tree(&tree);
        graph.ingest(
            vec![write_event(0x10, 100, Some(200)), write_event(0x10, 100, Some(200))],
            &tree,
        );
        assert_eq!(graph.in_interactions(2).count(), 1);
    }

    #[test]
    fn interaction_edges_always_have_both_endpoints() {
        let tree = tree_with_two();
        let mut graph = ProcessGraph::from_tree(&tree);
        graph.ingest(vec![write_event(0x10, 100, Some(200))], &tree);
        for edge in graph.edges() {
            assert!(graph.node(edge.source).is_some());
            assert!(graph.node(edge.target).is_some());
        }
    }
}
