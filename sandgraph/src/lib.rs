//! Behavioral-event correlation core for sandbox post-processing.
//!
//! Consumes the sandbox's trace logs together with the process-tree
//! snapshot, builds an annotated process graph, correlates primitive events
//! into findings, and projects the summary graph the report UI renders.

pub mod detection;
pub mod events;
pub mod graph;
pub mod log_reader;
pub mod parser;
pub mod postprocess;
pub mod process_tree;
pub mod summary;

pub use detection::{Detection, DetectionEngine, DisplayType, Finding};
pub use events::{Event, EventCodecError, EventHeader};
pub use graph::ProcessGraph;
pub use parser::EventParser;
pub use postprocess::{LogFiles, PostprocessContext, build_process_graph};
pub use process_tree::{Process, ProcessTree};
pub use summary::{ExportError, SummaryGraph, project};
