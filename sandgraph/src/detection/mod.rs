//! Detection engine: correlates primitive events into findings.
//!
//! Strategies run in a fixed order against the finished graph. One faulty
//! strategy must never take the others down with it; the engine logs the
//! failure and moves on.

mod injection;
mod scheduled_task;

pub use injection::ProcessInjection;
pub use scheduled_task::ScheduledTaskCreation;

use log::{error, info};
use serde_json::{Value, json};
use thiserror::Error;

use crate::events::Event;
use crate::graph::ProcessGraph;

/// Where a finding renders in the summary graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayType {
    /// Drawn as an edge between source and target process.
    Edge,
    /// Attached to the target process node.
    NodeAttribute,
}

impl DisplayType {
    pub fn as_str(self) -> &'static str {
        match self {
            DisplayType::Edge => "edge",
            DisplayType::NodeAttribute => "node_attribute",
        }
    }
}

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("detection invariant breached: {0}")]
    Invariant(String),
}

/// A correlated higher-level technique, with the primitive events that
/// evidence it.
#[derive(Debug, Clone)]
pub struct Finding {
    pub detection_name: String,
    pub pattern: String,
    pub display_type: DisplayType,
    /// Non-empty; preserves the evidence in correlation order.
    pub correlated_events: Vec<Event>,
    primary_target_override: Option<u32>,
}

impl Finding {
    pub fn new(
        detection_name: impl Into<String>,
        display_type: DisplayType,
        pattern: impl Into<String>,
        correlated_events: Vec<Event>,
    ) -> Self {
        Self {
            detection_name: detection_name.into(),
            pattern: pattern.into(),
            display_type,
            correlated_events,
            primary_target_override: None,
        }
    }

    /// Point the finding at a specific process instead of the default
    /// first-event target.
    pub fn with_primary_target(mut self, seqid: Option<u32>) -> Self {
        self.primary_target_override = seqid;
        self
    }

    /// The process this finding is about.
    pub fn primary_target_seqid(&self) -> Option<u32> {
        self.primary_target_override.or_else(|| {
            self.correlated_events
                .first()
                .and_then(|event| event.header().target_seqid)
        })
    }

    /// Source side for edge-rendered findings.
    pub fn source_seqid(&self) -> Option<u32> {
        self.correlated_events
            .first()
            .and_then(|event| event.header().source_seqid)
    }

    pub fn to_record(&self) -> Value {
        json!({
            "detection_name": self.detection_name,
            "pattern": self.pattern,
            "display_type": self.display_type.as_str(),
            "target_seqid": self.primary_target_seqid(),
            "correlated_events": self
                .correlated_events
                .iter()
                .map(Event::to_record)
                .collect::<Vec<_>>(),
        })
    }
}

pub trait Detection {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &ProcessGraph) -> Result<Vec<Finding>, DetectionError>;
}

pub struct DetectionEngine {
    strategies: Vec<Box<dyn Detection>>,
}

impl Default for DetectionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionEngine {
    /// The production strategy list, in the order findings are reported.
    pub fn new() -> Self {
        Self::with_strategies(vec![
            Box::new(ProcessInjection),
            Box::new(ScheduledTaskCreation),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn Detection>>) -> Self {
        Self { strategies }
    }

    /// Run every strategy, concatenating findings in strategy order. A
    /// failing strategy is logged and skipped.
    pub fn run(&self, graph: &ProcessGraph) -> Vec<Finding> {
        let mut all_findings = Vec::new();
        for strategy in &self.strategies {
            match strategy.run(graph) {
                Ok(findings) => {
                    if !findings.is_empty() {
                        info!(
                            "'{}' produced {} finding(s)",
                            strategy.name(),
                            findings.len()
                        );
                    }
                    all_findings.extend(findings);
                }
                Err(err) => {
                    error!("detection '{}' failed: {err}", strategy.name());
                }
            }
        }
        info!("detection finished, {} finding(s) total", all_findings.len());
        all_findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHeader;
    use crate::process_tree::{ProcessTree, test_process};

    struct Faulty;

    impl Detection for Faulty {
        fn name(&self) -> &'static str {
            "Faulty"
        }

        fn run(&self, _graph: &ProcessGraph) -> Result<Vec<Finding>, DetectionError> {
            Err(DetectionError::Invariant("broken bucket".into()))
        }
    }

    struct Constant;

    impl Detection for Constant {
        fn name(&self) -> &'static str {
            "Constant"
        }

        fn run(&self, _graph: &ProcessGraph) -> Result<Vec<Finding>, DetectionError> {
            let mut header = EventHeader::new(1, 1, "NtWriteVirtualMemory");
            header.target_seqid = Some(9);
            Ok(vec![Finding::new(
                "Constant",
                DisplayType::Edge,
                "Write",
                vec![Event::Write {
                    header,
                    address: 0,
                    bytes_written: 1,
                }],
            )])
        }
    }

    #[test]
    fn failing_strategy_does_not_abort_siblings() {
        let tree = ProcessTree::from_processes(vec![test_process(1, 100, "a.exe")]);
        let graph = ProcessGraph::from_tree(&tree);
        let engine =
            DetectionEngine::with_strategies(vec![Box::new(Faulty), Box::new(Constant)]);
        let findings = engine.run(&graph);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].detection_name, "Constant");
    }

    #[test]
    fn primary_target_defaults_to_first_event_and_can_be_overridden() {
        let mut header = EventHeader::new(1, 1, "NtWriteVirtualMemory");
        header.target_seqid = Some(9);
        let finding = Finding::new(
            "x",
            DisplayType::Edge,
            "p",
            vec![Event::Write {
                header,
                address: 0,
                bytes_written: 1,
            }],
        );
        assert_eq!(finding.primary_target_seqid(), Some(9));
        let overridden = finding.with_primary_target(Some(4));
        assert_eq!(overridden.primary_target_seqid(), Some(4));
    }
}
