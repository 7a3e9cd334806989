//! JSONL tracer: one record per tool call or event delivery.
//!
//! The record layout is a compatibility surface for scoring and replay
//! verification tools; `TRACE_VERSION` bumps on breaking changes only.

use crate::error::KernelError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use vei_env::LogicalTime;

/// Current trace schema version.
pub const TRACE_VERSION: u32 = 1;

/// One trace line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEntry {
    Call {
        trace_version: u32,
        time_ms: LogicalTime,
        tool: String,
        args: Value,
        response: Value,
    },
    Event {
        trace_version: u32,
        time_ms: LogicalTime,
        target: String,
        payload: Value,
        emitted: Value,
    },
}

impl TraceEntry {
    pub fn call(time_ms: LogicalTime, tool: &str, args: &Value, response: &Value) -> Self {
        TraceEntry::Call {
            trace_version: TRACE_VERSION,
            time_ms,
            tool: tool.to_string(),
            args: args.clone(),
            response: response.clone(),
        }
    }

    pub fn event(time_ms: LogicalTime, target: &str, payload: &Value, emitted: &Value) -> Self {
        TraceEntry::Event {
            trace_version: TRACE_VERSION,
            time_ms,
            target: target.to_string(),
            payload: payload.clone(),
            emitted: emitted.clone(),
        }
    }

    pub fn time_ms(&self) -> LogicalTime {
        match self {
            TraceEntry::Call { time_ms, .. } | TraceEntry::Event { time_ms, .. } => *time_ms,
        }
    }

    /// Tool name for call records.
    pub fn tool(&self) -> Option<&str> {
        match self {
            TraceEntry::Call { tool, .. } => Some(tool),
            TraceEntry::Event { .. } => None,
        }
    }

    /// Serialized JSON line (without the trailing newline).
    pub fn to_line(&self) -> Result<String, KernelError> {
        serde_json::to_string(self).map_err(|e| KernelError::Persistence(format!("trace encode: {}", e)))
    }
}

/// Append-only trace, optionally mirrored to a JSONL file.
#[derive(Debug, Default)]
pub struct Tracer {
    entries: Vec<TraceEntry>,
    path: Option<PathBuf>,
    sink: Option<BufWriter<File>>,
}

impl Tracer {
    /// In-memory tracer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracer that also writes each record to `path` (truncated on open).
    pub fn with_file<P: AsRef<Path>>(path: P) -> Result<Self, KernelError> {
        let path = path.as_ref().to_path_buf();
        let sink = Self::open_sink(&path)?;
        Ok(Self {
            entries: Vec::new(),
            path: Some(path),
            sink: Some(sink),
        })
    }

    fn open_sink(path: &Path) -> Result<BufWriter<File>, KernelError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| KernelError::Persistence(format!("open {}: {}", path.display(), e)))?;
        Ok(BufWriter::new(file))
    }

    /// Appends a record.
    pub fn record(&mut self, entry: TraceEntry) -> Result<(), KernelError> {
        if let Some(sink) = self.sink.as_mut() {
            let line = entry.to_line()?;
            writeln!(sink, "{}", line)
                .and_then(|_| sink.flush())
                .map_err(|e| KernelError::Persistence(format!("trace write: {}", e)))?;
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Drops all records and truncates the file, if any.
    pub fn reset(&mut self) -> Result<(), KernelError> {
        self.entries.clear();
        if let Some(path) = self.path.clone() {
            self.sink = Some(Self::open_sink(&path)?);
        }
        Ok(())
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&TraceEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Full trace as JSONL text.
    pub fn to_jsonl(&self) -> Result<String, KernelError> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.to_line()?);
            out.push('\n');
        }
        Ok(out)
    }

    /// SHA-256 of the JSONL bytes.
    pub fn digest(&self) -> Result<String, KernelError> {
        Ok(hex::encode(Sha256::digest(self.to_jsonl()?.as_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_record_layout() {
        let entry = TraceEntry::call(1000, "browser.read", &json!({}), &json!({"title": "Home"}));
        let line = entry.to_line().unwrap();
        let parsed: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["type"], "call");
        assert_eq!(parsed["trace_version"], 1);
        assert_eq!(parsed["time_ms"], 1000);
        assert_eq!(parsed["tool"], "browser.read");
        assert_eq!(parsed["response"]["title"], "Home");
    }

    #[test]
    fn test_event_record_layout() {
        let entry = TraceEntry::event(15_000, "slack", &json!({"text": "Approved"}), &json!({"ts": "2"}));
        let parsed: Value = serde_json::from_str(&entry.to_line().unwrap()).unwrap();
        assert_eq!(parsed["type"], "event");
        assert_eq!(parsed["target"], "slack");
        assert_eq!(parsed["emitted"]["ts"], "2");
        let back: TraceEntry = serde_json::from_value(parsed).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_jsonl_and_digest_are_stable() {
        let mut a = Tracer::new();
        let mut b = Tracer::new();
        for tracer in [&mut a, &mut b] {
            tracer.record(TraceEntry::call(0, "mail.list", &json!({}), &json!([]))).unwrap();
            tracer.record(TraceEntry::event(5, "mail", &json!({}), &json!({}))).unwrap();
        }
        assert_eq!(a.to_jsonl().unwrap(), b.to_jsonl().unwrap());
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        assert_eq!(a.to_jsonl().unwrap().lines().count(), 2);
    }

    #[test]
    fn test_reset_clears_entries() {
        let mut tracer = Tracer::new();
        tracer.record(TraceEntry::call(0, "x.y", &json!({}), &json!({}))).unwrap();
        tracer.reset().unwrap();
        assert!(tracer.is_empty());
    }
}
