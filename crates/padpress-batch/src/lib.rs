use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::time::Instant;

use padpress_core::{
    artifact_name, CanvasSpec, CoreError, EditParams, EncodedArtifact, EncodingParameters, ErrorInfo, Pipeline,
    RemoteEditor, TelemetryEvent, TelemetryEventType, TelemetrySink,
};
use padpress_image::{decode, encode_within_cap, fit_and_encode, EncodeOutcome};
use serde::Serialize;
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug, Clone)]
pub struct InputFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl InputFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessSettings {
    pub edit: EditParams,
    pub encoding: EncodingParameters,
}

impl ProcessSettings {
    /// Output is always re-encoded in the export format under the size cap,
    /// whatever the remote service returned.
    pub fn new(edit: EditParams, size_cap_kb: u32) -> Self {
        let encoding = EncodingParameters::for_format(edit.export_format).with_size_cap_kb(size_cap_kb);
        Self { edit, encoding }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResizeSettings {
    pub canvas: CanvasSpec,
    pub encoding: EncodingParameters,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySummary {
    pub input: String,
    pub name: String,
    pub size: usize,
    pub quality: u8,
    pub attempts: u32,
    pub within_cap: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFailure {
    pub input: String,
    pub error: ErrorInfo,
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub pipeline: Pipeline,
    pub entries: Vec<EntrySummary>,
    pub failures: Vec<FileFailure>,
    pub archive: Vec<u8>,
}

impl BatchReport {
    /// A download is offered only when at least one file made it into the archive.
    pub fn download_offered(&self) -> bool {
        !self.entries.is_empty()
    }
}

/// In-memory zip of encoded artifacts. Entries are stored uncompressed since
/// the payloads are already compressed images.
pub struct ArchiveBuilder {
    writer: ZipWriter<Cursor<Vec<u8>>>,
    names: HashSet<String>,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self {
            writer: ZipWriter::new(Cursor::new(Vec::new())),
            names: HashSet::new(),
        }
    }

    /// Adds an entry and returns the name it was stored under. A name already
    /// in the archive gets a `-2`, `-3`, ... suffix before its extension.
    pub fn add(&mut self, name: &str, bytes: &[u8]) -> Result<String, CoreError> {
        let stored = self.unique_name(name);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        self.writer
            .start_file(stored.as_str(), options)
            .map_err(|e| CoreError::Archive(e.to_string()))?;
        self.writer
            .write_all(bytes)
            .map_err(|e| CoreError::Archive(e.to_string()))?;
        self.names.insert(stored.clone());
        Ok(stored)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn finish(self) -> Result<Vec<u8>, CoreError> {
        let cursor = self.writer.finish().map_err(|e| CoreError::Archive(e.to_string()))?;
        Ok(cursor.into_inner())
    }

    fn unique_name(&self, name: &str) -> String {
        if !self.names.contains(name) {
            return name.to_string();
        }
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
            _ => (name, None),
        };
        (2..)
            .map(|n| match ext {
                Some(ext) => format!("{}-{}.{}", stem, n, ext),
                None => format!("{}-{}", stem, n),
            })
            .find(|candidate| !self.names.contains(candidate))
            .unwrap_or_else(|| name.to_string())
    }
}

fn into_artifact(pipeline: Pipeline, input_name: &str, encoding: &EncodingParameters, outcome: EncodeOutcome) -> EncodedArtifact {
    EncodedArtifact {
        file_name: artifact_name(pipeline, input_name, encoding.format),
        bytes: outcome.bytes,
        format: encoding.format,
        quality_used: outcome.quality,
        attempts: outcome.attempts,
        within_cap: outcome.within_cap,
    }
}

/// Sends one file to the remote editor and size-caps whatever comes back.
pub fn process_file(
    editor: &dyn RemoteEditor,
    input: &InputFile,
    settings: &ProcessSettings,
) -> Result<EncodedArtifact, CoreError> {
    let response = editor.edit(&input.bytes, &input.name, &settings.edit)?;
    if !response.is_success() {
        return Err(CoreError::RemoteEdit {
            status: response.status,
            body: response.body_text(),
        });
    }
    let edited = decode(&response.body)?;
    let outcome = encode_within_cap(&edited, &settings.encoding)?;
    Ok(into_artifact(Pipeline::Process, &input.name, &settings.encoding, outcome))
}

pub fn resize_file(input: &InputFile, settings: &ResizeSettings) -> Result<EncodedArtifact, CoreError> {
    let source = decode(&input.bytes)?;
    let outcome = fit_and_encode(&source, &settings.canvas, &settings.encoding)?;
    Ok(into_artifact(Pipeline::Resize, &input.name, &settings.encoding, outcome))
}

pub fn run_process_batch(
    editor: &dyn RemoteEditor,
    inputs: &[InputFile],
    settings: &ProcessSettings,
    telemetry: Option<&dyn TelemetrySink>,
) -> Result<BatchReport, CoreError> {
    settings.encoding.validate()?;
    run_batch(Pipeline::Process, inputs, telemetry, |input| {
        process_file(editor, input, settings)
    })
}

pub fn run_resize_batch(
    inputs: &[InputFile],
    settings: &ResizeSettings,
    telemetry: Option<&dyn TelemetrySink>,
) -> Result<BatchReport, CoreError> {
    settings.encoding.validate()?;
    run_batch(Pipeline::Resize, inputs, telemetry, |input| resize_file(input, settings))
}

fn emit(
    telemetry: Option<&dyn TelemetrySink>,
    event_type: TelemetryEventType,
    pipeline: Pipeline,
    index: usize,
    total: usize,
    duration_ms: Option<u64>,
    detail: Option<String>,
) {
    if let Some(sink) = telemetry {
        sink.emit(TelemetryEvent {
            event_type,
            pipeline,
            index,
            total,
            duration_ms,
            detail,
        });
    }
}

/// Runs `transform` over `inputs` in order. Per-file failures are recorded
/// and skipped; only archive errors abort the batch.
fn run_batch<F>(
    pipeline: Pipeline,
    inputs: &[InputFile],
    telemetry: Option<&dyn TelemetrySink>,
    mut transform: F,
) -> Result<BatchReport, CoreError>
where
    F: FnMut(&InputFile) -> Result<EncodedArtifact, CoreError>,
{
    let total = inputs.len();
    let batch_start = Instant::now();
    info!(pipeline = pipeline.label(), total, "batch started");
    emit(telemetry, TelemetryEventType::BatchStart, pipeline, 0, total, None, None);

    let mut archive = ArchiveBuilder::new();
    let mut entries = Vec::new();
    let mut failures = Vec::new();

    for (idx, input) in inputs.iter().enumerate() {
        let start = Instant::now();
        let result = transform(input);
        let elapsed = start.elapsed().as_millis() as u64;
        match result {
            Ok(artifact) => {
                let stored = archive.add(&artifact.file_name, &artifact.bytes)?;
                info!(
                    pipeline = pipeline.label(),
                    input = %input.name,
                    output = %stored,
                    size = artifact.bytes.len(),
                    quality = artifact.quality_used,
                    within_cap = artifact.within_cap,
                    "file done"
                );
                emit(
                    telemetry,
                    TelemetryEventType::FileSuccess,
                    pipeline,
                    idx + 1,
                    total,
                    Some(elapsed),
                    Some(format!("{} -> {}", input.name, stored)),
                );
                entries.push(EntrySummary {
                    input: input.name.clone(),
                    name: stored,
                    size: artifact.bytes.len(),
                    quality: artifact.quality_used,
                    attempts: artifact.attempts,
                    within_cap: artifact.within_cap,
                });
            }
            Err(err) => {
                warn!(pipeline = pipeline.label(), input = %input.name, error = %err, "file skipped");
                emit(
                    telemetry,
                    TelemetryEventType::FileError,
                    pipeline,
                    idx + 1,
                    total,
                    Some(elapsed),
                    Some(format!("{}: {}", input.name, err)),
                );
                failures.push(FileFailure {
                    input: input.name.clone(),
                    error: err.as_error_info(),
                });
            }
        }
    }

    let archive = archive.finish()?;
    info!(
        pipeline = pipeline.label(),
        succeeded = entries.len(),
        failed = failures.len(),
        "batch complete"
    );
    emit(
        telemetry,
        TelemetryEventType::BatchComplete,
        pipeline,
        total,
        total,
        Some(batch_start.elapsed().as_millis() as u64),
        Some(format!("succeeded={},failed={}", entries.len(), failures.len())),
    );

    Ok(BatchReport {
        pipeline,
        entries,
        failures,
        archive,
    })
}
