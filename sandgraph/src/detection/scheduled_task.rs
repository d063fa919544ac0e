//! Scheduled-task persistence detection.
//!
//! Registering a task through the Task Scheduler API also drops a task
//! definition file under `System32\Tasks`. Seeing the same task name on both
//! channels ties the API call to the on-disk artifact.

use std::collections::HashMap;

use crate::events::Event;
use crate::graph::{ProcessGraph, windows_basename};

use super::{Detection, DetectionError, DisplayType, Finding};

pub struct ScheduledTaskCreation;

const NAME: &str = "Scheduled Task Creation";

impl Detection for ScheduledTaskCreation {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run(&self, graph: &ProcessGraph) -> Result<Vec<Finding>, DetectionError> {
        // Task names in first-registration order, so findings come out
        // deterministically.
        let mut order: Vec<String> = Vec::new();
        let mut api_events: HashMap<String, Vec<Event>> = HashMap::new();
        let mut file_events: HashMap<String, Vec<Event>> = HashMap::new();

        for (_seqid, node) in graph.nodes() {
            for event in &node.node_events {
                match event {
                    Event::TaskRegister { task_name, .. } => {
                        let bucket = api_events.entry(task_name.clone()).or_default();
                        if bucket.is_empty() {
                            order.push(task_name.clone());
                        }
                        bucket.push(event.clone());
                    }
                    Event::FileTaskFolder { file_name, .. } => {
                        let task_name = windows_basename(file_name).to_string();
                        file_events.entry(task_name).or_default().push(event.clone());
                    }
                    _ => {}
                }
            }
        }

        let mut findings = Vec::new();
        for task_name in order {
            let Some(file_bucket) = file_events.get(&task_name) else {
                continue;
            };
            let api_bucket = &api_events[&task_name];
            let source_seqid = api_bucket
                .first()
                .and_then(|event| event.header().source_seqid);
            let mut correlated = api_bucket.clone();
            correlated.extend(file_bucket.iter().cloned());
            findings.push(
                Finding::new(
                    NAME,
                    DisplayType::NodeAttribute,
                    format!("Task '{task_name}' Created"),
                    correlated,
                )
                .with_primary_target(source_seqid),
            );
        }
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHeader;
    use crate::process_tree::{ProcessTree, test_process};

    fn register(source_pid: u32, evtid: u64, task_name: &str) -> Event {
        Event::TaskRegister {
            header: EventHeader::new(source_pid, evtid, "ITaskFolder::RegisterTaskDefinition"),
            task_name: task_name.to_string(),
        }
    }

    fn task_file(source_pid: u32, evtid: u64, file_name: &str) -> Event {
        Event::FileTaskFolder {
            header: EventHeader::new(source_pid, evtid, "NtWriteFile"),
            file_name: file_name.to_string(),
        }
    }

    fn run_detection(events: Vec<Event>) -> Vec<Finding> {
        let tree = ProcessTree::from_processes(vec![test_process(1, 100, r"C:\dropper.exe")]);
        let mut graph = ProcessGraph::from_tree(&tree);
        graph.ingest(events, &tree);
        ScheduledTaskCreation.run(&graph).unwrap()
    }

    #[test]
    fn api_and_file_with_same_name_correlate() {
        let findings = run_detection(vec![
            register(100, 0x40, "EvilTask"),
            task_file(100, 0x41, r"C:\Windows\System32\Tasks\EvilTask"),
        ]);
        assert_eq!(findings.len(), 1);
        let finding = &findings[0];
        assert_eq!(finding.pattern, "Task 'EvilTask' Created");
        assert_eq!(finding.display_type, DisplayType::NodeAttribute);
        assert_eq!(finding.detection_name, "Scheduled Task Creation");
        assert_eq!(finding.correlated_events.len(), 2);
        // API evidence first, then the file artifact.
        assert!(matches!(finding.correlated_events[0], Event::TaskRegister { .. }));
        assert!(matches!(finding.correlated_events[1], Event::FileTaskFolder { .. }));
        // Pinned to the registering process, not the file target.
        assert_eq!(finding.primary_target_seqid(), Some(1));
    }

    #[test]
    fn api_without_file_does_not_fire() {
        let findings = run_detection(vec![register(100, 0x40, "LonelyTask")]);
        assert!(findings.is_empty());
    }

    #[test]
    fn file_without_api_does_not_fire() {
        let findings =
            run_detection(vec![task_file(100, 0x41, r"C:\Windows\System32\Tasks\Orphan")]);
        assert!(findings.is_empty());
    }

    #[test]
    fn names_must_match_exactly() {
        let findings = run_detection(vec![
            register(100, 0x40, "TaskA"),
            task_file(100, 0x41, r"C:\Windows\System32\Tasks\TaskB"),
        ]);
        assert!(findings.is_empty());
    }

    #[test]
    fn multiple_tasks_emit_in_registration_order() {
        let findings = run_detection(vec![
            register(100, 0x40, "Second"),
            register(100, 0x41, "First"),
            task_file(100, 0x42, r"C:\Windows\System32\Tasks\First"),
            task_file(100, 0x43, r"C:\Windows\System32\Tasks\Second"),
        ]);
        let patterns: Vec<&str> = findings.iter().map(|f| f.pattern.as_str()).collect();
        assert_eq!(
            patterns,
            vec!["Task 'Second' Created", "Task 'First' Created"]
        );
    }
}
