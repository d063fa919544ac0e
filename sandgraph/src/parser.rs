//! Stateful translation of raw trace records into semantic events.
//!
//! Most records map 1:1 onto an event (or onto nothing), but thread-context
//! manipulation needs cross-record correlation: `NtSetContextThread` alone
//! proves nothing, it only becomes an execution primitive once the thread is
//! resumed. The parser therefore keeps the captured register values keyed by
//! thread id and fabricates an `Execute` event when the matching
//! `NtResumeThread` arrives, consuming the pending entry.
//!
//! Malformed or incomplete records never fail the pipeline; they are dropped
//! with a debug log entry.

use std::collections::HashMap;

use log::debug;
use serde_json::Value;

use crate::events::{Event, EventHeader};

/// Register values captured from a set-context record, waiting for the
/// resume that makes them meaningful.
#[derive(Debug, Clone)]
struct PendingContext {
    registers: Vec<(String, u64)>,
    raw_record: Value,
}

/// Register names whose values become candidate start addresses.
const CONTEXT_REGISTERS: [&str; 4] = ["rip", "rcx", "eip", "eax"];

#[derive(Debug, Default)]
pub struct EventParser {
    pending_context: HashMap<u64, PendingContext>,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of set-context records still waiting for a resume.
    pub fn pending_len(&self) -> usize {
        self.pending_context.len()
    }

    /// Call at end-of-stream. Contexts that never saw a resume are not
    /// evidence of anything, so they are only reported, not emitted.
    pub fn finish(&mut self) {
        for (tid, pending) in self.pending_context.drain() {
            debug!(
                "discarding pending thread context for tid {tid} ({} registers, never resumed)",
                pending.registers.len()
            );
        }
    }

    /// Translate one record. Returns `None` for records that carry no
    /// semantic event (unknown plugins, failed calls, context captures,
    /// malformed entries).
    pub fn parse(&mut self, record: &Value) -> Option<Event> {
        let plugin = record.get("Plugin").and_then(Value::as_str)?;
        match plugin {
            "syscall" => self.parse_syscall(record),
            "apimon" => parse_apimon(record),
            "filetracer" => parse_filetracer(record),
            _ => None,
        }
    }

    fn parse_syscall(&mut self, record: &Value) -> Option<Event> {
        let method = record.get("Method").and_then(Value::as_str)?;
        let pid = num_field(record, "PID").and_then(to_u32).or_else(|| {
            debug!("syscall {method}: missing PID");
            None
        })?;
        let evtid = num_field(record, "EventUID").or_else(|| {
            debug!("syscall {method}: missing EventUID");
            None
        })?;

        // A failed call never moved any memory.
        if let Some(rv) = num_field(record, "ReturnValue") {
            if rv != 0 {
                debug!("syscall {method} (evtid {evtid:#x}): non-zero return, skipping");
                return None;
            }
        }

        let dropped = |field: &str| {
            debug!("syscall {method} (evtid {evtid:#x}): missing or invalid {field}");
            None
        };

        match method {
            "NtAllocateVirtualMemory" | "NtAllocateVirtualMemoryEx" => {
                let target_pid = target_pid_of(record, pid);
                let address = match num_field(record, "*BaseAddress") {
                    Some(v) => v,
                    None => return dropped("*BaseAddress"),
                };
                let size = match num_field(record, "*RegionSize").filter(|s| *s > 0) {
                    Some(v) => v,
                    None => return dropped("*RegionSize"),
                };
                let mut header = EventHeader::new(pid, evtid, method);
                header.target_pid = Some(target_pid);
                header.raw_entries.push(record.clone());
                Some(Event::Allocate {
                    header,
                    address,
                    size,
                })
            }
            "NtWriteVirtualMemory" => {
                let target_pid = target_pid_of(record, pid);
                let address = match num_field(record, "BaseAddress") {
                    Some(v) => v,
                    None => return dropped("BaseAddress"),
                };
                let bytes_written =
                    match num_field(record, "*NumberOfBytesWritten").filter(|b| *b > 0) {
                        Some(v) => v,
                        None => return dropped("*NumberOfBytesWritten"),
                    };
                let mut header = EventHeader::new(pid, evtid, method);
                header.target_pid = Some(target_pid);
                header.raw_entries.push(record.clone());
                Some(Event::Write {
                    header,
                    address,
                    bytes_written,
                })
            }
            // A view mapped into another process is a write as far as
            // injection detection is concerned.
            "NtMapViewOfSection" | "NtMapViewOfSectionEx" => {
                let target_pid = target_pid_of(record, pid);
                let address = match num_field(record, "*BaseAddress") {
                    Some(v) => v,
                    None => return dropped("*BaseAddress"),
                };
                let bytes_written = match num_field(record, "*ViewSize").filter(|b| *b > 0) {
                    Some(v) => v,
                    None => return dropped("*ViewSize"),
                };
                let mut header = EventHeader::new(pid, evtid, method);
                header.target_pid = Some(target_pid);
                header.raw_entries.push(record.clone());
                Some(Event::Write {
                    header,
                    address,
                    bytes_written,
                })
            }
            "NtCreateThread" | "NtCreateThreadEx" | "RtlCreateUserThread" => {
                let target_pid = target_pid_of(record, pid);
                let start = num_field(record, "ThreadContext.Rip")
                    .or_else(|| num_field(record, "*StartRoutine"))
                    .or_else(|| num_field(record, "*StartAddress"));
                let start = match start {
                    Some(v) => v,
                    None => return dropped("start address"),
                };
                let mut header = EventHeader::new(pid, evtid, method);
                header.target_pid = Some(target_pid);
                header.raw_entries.push(record.clone());
                Some(Event::Execute {
                    header,
                    addresses: vec![start],
                    target_tid: None,
                })
            }
            "NtSetContextThread" | "NtSetInformationThread" => {
                let tid = match num_field(record, "ThreadHandle_TID") {
                    Some(v) => v,
                    None => return dropped("ThreadHandle_TID"),
                };
                let registers = capture_registers(record);
                if registers.is_empty() {
                    debug!("syscall {method} (evtid {evtid:#x}): no context registers, skipping");
                    return None;
                }
                self.pending_context.insert(
                    tid,
                    PendingContext {
                        registers,
                        raw_record: record.clone(),
                    },
                );
                None
            }
            "NtResumeThread" => {
                let tid = match num_field(record, "ThreadHandle_TID") {
                    Some(v) => v,
                    None => return dropped("ThreadHandle_TID"),
                };
                // Resuming a thread nobody tampered with is not an event.
                let pending = self.pending_context.remove(&tid)?;
                let target_pid = match num_field(record, "ThreadHandle_PID").and_then(to_u32) {
                    Some(v) => v,
                    None => return dropped("ThreadHandle_PID"),
                };
                let mut header = EventHeader::new(pid, evtid, method);
                header.target_pid = Some(target_pid);
                header.raw_entries.push(pending.raw_record);
                header.raw_entries.push(record.clone());
                Some(Event::Execute {
                    header,
                    addresses: pending.registers.into_iter().map(|(_, v)| v).collect(),
                    target_tid: Some(tid),
                })
            }
            _ => None,
        }
    }
}

fn parse_apimon(record: &Value) -> Option<Event> {
    let method = record.get("Method").and_then(Value::as_str)?;
    if method != "ITaskFolder::RegisterTaskDefinition" {
        return None;
    }
    let pid = num_field(record, "PID").and_then(to_u32).or_else(|| {
        debug!("apimon {method}: missing or invalid PID");
        None
    })?;
    let evtid = num_field(record, "EventUID").or_else(|| {
        debug!("apimon {method}: missing or invalid EventUID");
        None
    })?;
    let task_name = match record
        .get("Arguments")
        .and_then(Value::as_array)
        .and_then(|args| args.iter().find_map(|arg| arg.as_str()?.strip_prefix("Arg1=")))
        .and_then(parse_typed_argument)
    {
        Some(name) => name,
        None => {
            debug!("apimon {method} (evtid {evtid:#x}): Arg1 not extractable");
            return None;
        }
    };
    let mut header = EventHeader::new(pid, evtid, method);
    header.raw_entries.push(record.clone());
    Some(Event::TaskRegister { header, task_name })
}

/// Arguments arrive as `<type>:"<value>"`; only the value matters.
fn parse_typed_argument(arg: &str) -> Option<String> {
    let (_, value) = arg.split_once(':')?;
    Some(value.trim_matches('"').to_string())
}

const NT_OBJECT_PREFIX: &str = r"\??\";
const TASKS_FOLDER: &str = r"\system32\tasks\";

fn parse_filetracer(record: &Value) -> Option<Event> {
    let method = record.get("Method").and_then(Value::as_str)?;
    let write_access = match method {
        "NtWriteFile" => true,
        "NtCreateFile" => record
            .get("DesiredAccess")
            .and_then(Value::as_str)
            .is_some_and(|access| access.contains("WRITE")),
        _ => false,
    };
    if !write_access {
        return None;
    }
    let pid = num_field(record, "PID").and_then(to_u32).or_else(|| {
        debug!("filetracer {method}: missing or invalid PID");
        None
    })?;
    let evtid = num_field(record, "EventUID").or_else(|| {
        debug!("filetracer {method}: missing or invalid EventUID");
        None
    })?;
    let file_name = match record.get("FileName").and_then(Value::as_str) {
        Some(name) => name,
        None => {
            debug!("filetracer {method} (evtid {evtid:#x}): missing FileName");
            return None;
        }
    };
    let file_name = file_name.strip_prefix(NT_OBJECT_PREFIX).unwrap_or(file_name);
    if !file_name.to_ascii_lowercase().contains(TASKS_FOLDER) {
        return None;
    }
    let mut header = EventHeader::new(pid, evtid, method);
    header.raw_entries.push(record.clone());
    Some(Event::FileTaskFolder {
        header,
        file_name: file_name.to_string(),
    })
}

/// Remote syscalls carry the resolved pid of the handle they operated on;
/// calls on the current process omit it.
fn target_pid_of(record: &Value, source_pid: u32) -> u32 {
    num_field(record, "ProcessHandle_PID")
        .or_else(|| num_field(record, "TargetPID"))
        .and_then(to_u32)
        .unwrap_or(source_pid)
}

/// Collect the context registers relevant for start-address recovery. Keys
/// match case-insensitively on their last dotted segment, so both `Rip` and
/// `ThreadContext.Rip` count. The parsed record map is key-sorted, so a
/// multi-register capture always comes out in field-name order.
fn capture_registers(record: &Value) -> Vec<(String, u64)> {
    let Some(obj) = record.as_object() else {
        return Vec::new();
    };
    obj.iter()
        .filter_map(|(key, value)| {
            let name = key.rsplit('.').next().unwrap_or(key);
            if !CONTEXT_REGISTERS
                .iter()
                .any(|reg| name.eq_ignore_ascii_case(reg))
            {
                return None;
            }
            parse_number(value).map(|v| (key.clone(), v))
        })
        .collect()
}

/// Numeric trace fields arrive as JSON numbers, decimal strings, or
/// `0x`-prefixed hex strings.
fn parse_number(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16).ok()
            } else {
                s.parse().ok()
            }
        }
        _ => None,
    }
}

fn num_field(record: &Value, key: &str) -> Option<u64> {
    record.get(key).and_then(parse_number)
}

fn to_u32(value: u64) -> Option<u32> {
    u32::try_from(value).ok()
}
