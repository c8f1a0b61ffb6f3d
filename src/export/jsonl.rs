use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;

use crate::export::TraceSink;
use crate::state::{HopResult, TraceResult};

/// UTC with microseconds, no offset suffix
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// One finalized trace session
#[derive(Debug, Serialize)]
pub struct TraceRecord<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub uuid: &'a str,
    pub ip: IpAddr,
    pub timestamp: String,
    pub started_at: String,
    pub hops: &'a [HopResult],
    pub completed: bool,
    pub reached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

impl<'a> TraceRecord<'a> {
    pub fn new(result: &'a TraceResult, error: Option<&'a str>) -> Self {
        Self {
            kind: "0trace",
            uuid: &result.session_id,
            ip: result.target,
            timestamp: format_timestamp(result.ended_at),
            started_at: format_timestamp(result.started_at),
            hops: &result.hops,
            completed: result.completed,
            reached: result.reached,
            error,
        }
    }
}

/// Final message of an echo session, kept exactly as the client sent it
#[derive(Debug, Serialize)]
pub struct EchoRecord<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub ip: IpAddr,
    pub timestamp: String,
    pub message: &'a serde_json::Value,
}

impl<'a> EchoRecord<'a> {
    pub fn new(ip: IpAddr, message: &'a serde_json::Value) -> Self {
        Self {
            kind: "ws-final",
            ip,
            timestamp: format_timestamp(Utc::now()),
            message,
        }
    }
}

/// Append-only log with one JSON object per line
pub struct JsonLineLog<W: Write + Send = File> {
    writer: Mutex<W>,
}

impl JsonLineLog<File> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        Ok(Self::from_writer(file))
    }
}

impl<W: Write + Send> JsonLineLog<W> {
    pub fn from_writer(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Serialize `record` and append it as a single line
    pub fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        // Serialize first so a failure never leaves half a line behind
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut writer = self.writer.lock();
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> TraceSink for JsonLineLog<W> {
    fn record_trace(&self, result: &TraceResult, error: Option<&str>) {
        if let Err(e) = self.append(&TraceRecord::new(result, error)) {
            tracing::warn!(session = %result.session_id, "Failed to log trace result: {:#}", e);
        }
    }
}
