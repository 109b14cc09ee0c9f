use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use padpress_core::{TelemetryEvent, TelemetryEventType, TelemetrySink};
use reqwest::blocking::Client;
use serde::Serialize;
use tracing::{info, warn};

pub fn sink_from_env() -> Option<Box<dyn TelemetrySink>> {
    let mode = std::env::var("PADPRESS_TELEMETRY_SINK").ok()?;
    sink_for_mode(&mode, |name| std::env::var(name).ok())
}

fn sink_for_mode(mode: &str, lookup: impl Fn(&str) -> Option<String>) -> Option<Box<dyn TelemetrySink>> {
    let non_blank = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    match mode.trim().to_ascii_lowercase().as_str() {
        "stdout" => Some(Box::new(StdoutSink)),
        "log" => Some(Box::new(LogSink)),
        "file" => {
            let path = non_blank("PADPRESS_TELEMETRY_FILE")?;
            Some(Box::new(FileSink::new(PathBuf::from(path))))
        }
        "http" => {
            let endpoint = non_blank("PADPRESS_TELEMETRY_ENDPOINT")?;
            Some(Box::new(HttpSink::new(endpoint)))
        }
        _ => None,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryEnvelope {
    event_type: String,
    pipeline: String,
    index: usize,
    total: usize,
    progress: f32,
    duration_ms: Option<u64>,
    detail: Option<String>,
}

impl From<&TelemetryEvent> for TelemetryEnvelope {
    fn from(event: &TelemetryEvent) -> Self {
        Self {
            event_type: format!("{:?}", event.event_type),
            pipeline: event.pipeline.label().to_string(),
            index: event.index,
            total: event.total,
            progress: event.progress(),
            duration_ms: event.duration_ms,
            detail: event.detail.clone(),
        }
    }
}

pub struct StdoutSink;

impl TelemetrySink for StdoutSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Ok(line) = serde_json::to_string(&TelemetryEnvelope::from(&event)) {
            println!("{}", line);
        }
    }
}

/// Forwards progress to the `tracing` subscriber instead of a separate stream.
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn emit(&self, event: TelemetryEvent) {
        let pipeline = event.pipeline.label();
        match event.event_type {
            TelemetryEventType::FileError => warn!(
                pipeline,
                index = event.index,
                total = event.total,
                detail = event.detail.as_deref().unwrap_or(""),
                "file failed"
            ),
            _ => info!(
                pipeline,
                event = ?event.event_type,
                index = event.index,
                total = event.total,
                progress = event.progress(),
                "batch progress"
            ),
        }
    }
}

pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn write_line(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("creating telemetry log parent directory")?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("opening telemetry file")?;
        writeln!(file, "{}", line).context("writing telemetry line")?;
        Ok(())
    }
}

impl TelemetrySink for FileSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Ok(line) = serde_json::to_string(&TelemetryEnvelope::from(&event)) {
            if let Err(err) = self.write_line(&line) {
                warn!(path = %self.path.display(), error = %err, "dropping telemetry event");
            }
        }
    }
}

pub struct HttpSink {
    endpoint: String,
    client: Client,
}

impl HttpSink {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: Client::new(),
        }
    }
}

impl TelemetrySink for HttpSink {
    fn emit(&self, event: TelemetryEvent) {
        let payload = TelemetryEnvelope::from(&event);
        if let Err(err) = self.client.post(&self.endpoint).json(&payload).send() {
            warn!(endpoint = %self.endpoint, error = %err, "dropping telemetry event");
        }
    }
}
