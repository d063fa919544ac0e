//! Semantic event model.
//!
//! The parser translates raw trace records into a closed set of event
//! variants. Events that carry a `target_pid` become interaction edges in the
//! process graph; the rest attach to their source node. The original trace
//! records that produced an event are preserved verbatim in `raw_entries` so
//! the UI can show the evidence later.

use serde_json::{Map, Value, json};
use thiserror::Error;

/// Fields shared by every event variant.
///
/// `source_seqid` / `target_seqid` stay unset until graph ingestion resolves
/// the pids against the process tree.
#[derive(Debug, Clone, PartialEq)]
pub struct EventHeader {
    pub source_pid: u32,
    pub evtid: u64,
    pub method: String,
    /// Original records, in the order they were observed. Append-only.
    pub raw_entries: Vec<Value>,
    pub target_pid: Option<u32>,
    pub source_seqid: Option<u32>,
    pub target_seqid: Option<u32>,
}

impl EventHeader {
    pub fn new(source_pid: u32, evtid: u64, method: impl Into<String>) -> Self {
        Self {
            source_pid,
            evtid,
            method: method.into(),
            raw_entries: Vec::new(),
            target_pid: None,
            source_seqid: None,
            target_seqid: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Allocate {
        header: EventHeader,
        address: u64,
        size: u64,
    },
    Write {
        header: EventHeader,
        address: u64,
        bytes_written: u64,
    },
    Execute {
        header: EventHeader,
        addresses: Vec<u64>,
        target_tid: Option<u64>,
    },
    FileTaskFolder {
        header: EventHeader,
        file_name: String,
    },
    TaskRegister {
        header: EventHeader,
        task_name: String,
    },
}

#[derive(Debug, Error)]
pub enum EventCodecError {
    #[error("record is missing the 'event_type' discriminator")]
    MissingDiscriminator,
    #[error("unknown event variant '{0}'")]
    UnknownVariant(String),
    #[error("record field '{0}' is missing or has the wrong type")]
    BadField(&'static str),
}

impl Event {
    pub fn header(&self) -> &EventHeader {
        match self {
            Event::Allocate { header, .. }
            | Event::Write { header, .. }
            | Event::Execute { header, .. }
            | Event::FileTaskFolder { header, .. }
            | Event::TaskRegister { header, .. } => header,
        }
    }

    pub fn header_mut(&mut self) -> &mut EventHeader {
        match self {
            Event::Allocate { header, .. }
            | Event::Write { header, .. }
            | Event::Execute { header, .. }
            | Event::FileTaskFolder { header, .. }
            | Event::TaskRegister { header, .. } => header,
        }
    }

    /// Variant name used as the `event_type` discriminator in record form.
    pub fn variant_name(&self) -> &'static str {
        match self {
            Event::Allocate { .. } => "Allocate",
            Event::Write { .. } => "Write",
            Event::Execute { .. } => "Execute",
            Event::FileTaskFolder { .. } => "FileTaskFolder",
            Event::TaskRegister { .. } => "TaskRegister",
        }
    }

    /// Edge-typed events carry a resolved target pid; node-typed events
    /// attach to their source process instead.
    pub fn is_edge_event(&self) -> bool {
        self.header().target_pid.is_some()
    }

    /// Serialize into the flat record form used by the graph export.
    pub fn to_record(&self) -> Value {
        let header = self.header();
        let mut record = Map::new();
        record.insert("event_type".into(), json!(self.variant_name()));
        record.insert("source_pid".into(), json!(header.source_pid));
        record.insert("evtid".into(), json!(header.evtid));
        record.insert("method".into(), json!(header.method));
        record.insert("raw_entries".into(), Value::Array(header.raw_entries.clone()));
        record.insert("target_pid".into(), json!(header.target_pid));
        record.insert("source_seqid".into(), json!(header.source_seqid));
        record.insert("target_seqid".into(), json!(header.target_seqid));
        match self {
            Event::Allocate { address, size, .. } => {
                record.insert("address".into(), json!(address));
                record.insert("size".into(), json!(size));
            }
            Event::Write {
                address,
                bytes_written,
                ..
            } => {
                record.insert("address".into(), json!(address));
                record.insert("bytes_written".into(), json!(bytes_written));
            }
            Event::Execute {
                addresses,
                target_tid,
                ..
            } => {
                record.insert("addresses".into(), json!(addresses));
                record.insert("target_tid".into(), json!(target_tid));
            }
            Event::FileTaskFolder { file_name, .. } => {
                record.insert("file_name".into(), json!(file_name));
            }
            Event::TaskRegister { task_name, .. } => {
                record.insert("task_name".into(), json!(task_name));
            }
        }
        Value::Object(record)
    }

    /// Rebuild an event from its record form.
    pub fn from_record(record: &Value) -> Result<Event, EventCodecError> {
        let obj = record
            .as_object()
            .ok_or(EventCodecError::BadField("record"))?;
        let variant = match obj.get("event_type") {
            Some(Value::String(name)) => name.as_str(),
            Some(_) | None => return Err(EventCodecError::MissingDiscriminator),
        };

        let header = EventHeader {
            source_pid: field_u64(obj, "source_pid")? as u32,
            evtid: field_u64(obj, "evtid")?,
            method: obj
                .get("method")
                .and_then(Value::as_str)
                .ok_or(EventCodecError::BadField("method"))?
                .to_string(),
            raw_entries: obj
                .get("raw_entries")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            target_pid: opt_u64(obj, "target_pid").map(|v| v as u32),
            source_seqid: opt_u64(obj, "source_seqid").map(|v| v as u32),
            target_seqid: opt_u64(obj, "target_seqid").map(|v| v as u32),
        };

        match variant {
            "Allocate" => Ok(Event::Allocate {
                header,
                address: field_u64(obj, "address")?,
                size: field_u64(obj, "size")?,
            }),
            "Write" => Ok(Event::Write {
                header,
                address: field_u64(obj, "address")?,
                bytes_written: field_u64(obj, "bytes_written")?,
            }),
            "Execute" => {
                let addresses = obj
                    .get("addresses")
                    .and_then(Value::as_array)
                    .ok_or(EventCodecError::BadField("addresses"))?
                    .iter()
                    .map(|v| v.as_u64().ok_or(EventCodecError::BadField("addresses")))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Event::Execute {
                    header,
                    addresses,
                    target_tid: opt_u64(obj, "target_tid"),
                })
            }
            "FileTaskFolder" => Ok(Event::FileTaskFolder {
                header,
                file_name: field_str(obj, "file_name")?,
            }),
            "TaskRegister" => Ok(Event::TaskRegister {
                header,
                task_name: field_str(obj, "task_name")?,
            }),
            other => Err(EventCodecError::UnknownVariant(other.to_string())),
        }
    }
}

fn field_u64(obj: &Map<String, Value>, key: &'static str) -> Result<u64, EventCodecError> {
    obj.get(key)
        .and_then(Value::as_u64)
        .ok_or(EventCodecError::BadField(key))
}

fn opt_u64(obj: &Map<String, Value>, key: &str) -> Option<u64> {
    obj.get(key).and_then(Value::as_u64)
}

fn field_str(obj: &Map<String, Value>, key: &'static str) -> Result<String, EventCodecError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(EventCodecError::BadField(key))
}
