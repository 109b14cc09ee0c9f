use std::fmt::{Display, Formatter};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_START_QUALITY: u8 = 85;
pub const DEFAULT_QUALITY_STEP: i8 = -5;
pub const DEFAULT_QUALITY_FLOOR: u8 = 5;
pub const DEFAULT_SIZE_CAP_KB: u32 = 200;
pub const DEFAULT_CANVAS_WIDTH: u32 = 1200;
pub const DEFAULT_CANVAS_HEIGHT: u32 = 1500;
pub const DEFAULT_PAD_HEX: &str = "#EFEFEF";
pub const DEFAULT_REMOTE_PADDING: f32 = 0.1;
pub const DEFAULT_SHADOW_MODE: &str = "ai.soft";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    Jpeg,
    Jpg,
    Png,
    Webp,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "jpeg" => Ok(Self::Jpeg),
            "jpg" => Ok(Self::Jpg),
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::Webp),
            other => Err(CoreError::InvalidParameters(format!(
                "unknown output format '{}'; expected one of: jpeg, jpg, png, webp",
                other
            ))),
        }
    }

    /// Lowercase file extension, which is also the label the format was selected by.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Jpg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
        }
    }

    pub fn is_jpeg_family(self) -> bool {
        matches!(self, Self::Jpeg | Self::Jpg)
    }

    pub fn supports_alpha(self) -> bool {
        !self.is_jpeg_family()
    }

    /// The edit API only exports jpeg, jpg and png; webp is requested as jpeg
    /// and re-encoded locally.
    pub fn remote_export_format(self) -> Self {
        match self {
            Self::Webp => Self::Jpeg,
            other => other,
        }
    }
}

impl FromStr for OutputFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for OutputFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PadColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl PadColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Accepts `#RRGGBB` or `RRGGBB`, any case.
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        let hex = value.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CoreError::InvalidParameters(format!(
                "invalid colour '{}'; expected #RRGGBB",
                value
            )));
        }
        let channel = |i: usize| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|e| CoreError::InvalidParameters(format!("invalid colour '{}': {}", value, e)))
        };
        Ok(Self::new(channel(0)?, channel(2)?, channel(4)?))
    }

    /// Uppercase hex without the leading `#`, as the edit API expects it.
    pub fn to_hex(self) -> String {
        format!("{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }

    pub fn rgb(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }

    pub fn rgba(self) -> [u8; 4] {
        [self.r, self.g, self.b, 255]
    }
}

impl Default for PadColor {
    fn default() -> Self {
        Self::new(0xEF, 0xEF, 0xEF)
    }
}

impl FromStr for PadColor {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSize {
    pub width: u32,
    pub height: u32,
}

impl OutputSize {
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        let invalid = || CoreError::InvalidParameters(format!("invalid output size '{}'; expected WxH", value));
        let normalized = value.trim().to_ascii_lowercase();
        let (w, h) = normalized.split_once('x').ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl Default for OutputSize {
    fn default() -> Self {
        Self {
            width: DEFAULT_CANVAS_WIDTH,
            height: DEFAULT_CANVAS_HEIGHT,
        }
    }
}

impl Display for OutputSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Parameters of the size-capped quality search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingParameters {
    pub format: OutputFormat,
    pub start_quality: u8,
    pub quality_step: i8,
    pub quality_floor: u8,
    pub size_cap_kb: u32,
}

impl EncodingParameters {
    pub fn for_format(format: OutputFormat) -> Self {
        Self {
            format,
            start_quality: DEFAULT_START_QUALITY,
            quality_step: DEFAULT_QUALITY_STEP,
            quality_floor: DEFAULT_QUALITY_FLOOR,
            size_cap_kb: DEFAULT_SIZE_CAP_KB,
        }
    }

    pub fn with_size_cap_kb(mut self, size_cap_kb: u32) -> Self {
        self.size_cap_kb = size_cap_kb;
        self
    }

    pub fn size_cap_bytes(&self) -> usize {
        (self.size_cap_kb as usize).saturating_mul(1024)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.quality_step >= 0 {
            return Err(CoreError::InvalidParameters(format!(
                "quality step must be negative (received {})",
                self.quality_step
            )));
        }
        if !(1..=100).contains(&self.start_quality) {
            return Err(CoreError::InvalidParameters(format!(
                "start quality must be within 1..=100 (received {})",
                self.start_quality
            )));
        }
        if self.quality_floor < DEFAULT_QUALITY_FLOOR || self.quality_floor > self.start_quality {
            return Err(CoreError::InvalidParameters(format!(
                "quality floor {} must be within {}..={}",
                self.quality_floor, DEFAULT_QUALITY_FLOOR, self.start_quality
            )));
        }
        if self.size_cap_kb == 0 {
            return Err(CoreError::InvalidParameters("size cap must be positive".to_string()));
        }
        Ok(())
    }

    /// Upper bound on encode attempts: one per quality level from start down to floor.
    pub fn max_attempts(&self) -> u32 {
        let span = self.start_quality.saturating_sub(self.quality_floor) as u32;
        let step = self.quality_step.unsigned_abs().max(1) as u32;
        span.div_ceil(step) + 1
    }
}

impl Default for EncodingParameters {
    fn default() -> Self {
        Self::for_format(OutputFormat::Jpeg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasSpec {
    width: u32,
    height: u32,
    pad_color: PadColor,
}

impl CanvasSpec {
    pub fn new(width: u32, height: u32, pad_color: PadColor) -> Result<Self, CoreError> {
        if width == 0 || height == 0 {
            return Err(CoreError::InvalidParameters(format!(
                "canvas dimensions must be positive (received {}x{})",
                width, height
            )));
        }
        Ok(Self {
            width,
            height,
            pad_color,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pad_color(&self) -> PadColor {
        self.pad_color
    }
}

impl Default for CanvasSpec {
    fn default() -> Self {
        Self {
            width: DEFAULT_CANVAS_WIDTH,
            height: DEFAULT_CANVAS_HEIGHT,
            pad_color: PadColor::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pipeline {
    Process,
    Resize,
}

impl Pipeline {
    pub fn label(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Resize => "resize",
        }
    }

    pub fn archive_name(self) -> &'static str {
        match self {
            Self::Process => "processed_images.zip",
            Self::Resize => "resized_images.zip",
        }
    }
}

/// Input name with its last extension removed.
pub fn file_stem(input_name: &str) -> String {
    Path::new(input_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| input_name.to_string())
}

pub fn artifact_name(pipeline: Pipeline, input_name: &str, format: OutputFormat) -> String {
    let stem = file_stem(input_name);
    match pipeline {
        Pipeline::Process => format!("{}_processed.{}", stem, format.extension()),
        Pipeline::Resize => format!("resized_{}.{}", stem, format.extension()),
    }
}

#[derive(Debug, Clone)]
pub struct EncodedArtifact {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub quality_used: u8,
    pub attempts: u32,
    pub within_cap: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditParams {
    pub background_color: PadColor,
    pub export_format: OutputFormat,
    pub output_size: OutputSize,
    pub padding: f32,
    pub shadow_mode: String,
}

impl EditParams {
    pub fn new(background_color: PadColor, export_format: OutputFormat, output_size: OutputSize) -> Self {
        Self {
            background_color,
            export_format,
            output_size,
            padding: DEFAULT_REMOTE_PADDING,
            shadow_mode: DEFAULT_SHADOW_MODE.to_string(),
        }
    }

    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("background.color", self.background_color.to_hex()),
            ("export.format", self.export_format.remote_export_format().extension().to_string()),
            ("outputSize", self.output_size.to_string()),
            ("padding", self.padding.to_string()),
            ("shadow.mode", self.shadow_mode.clone()),
        ]
    }
}

impl Default for EditParams {
    fn default() -> Self {
        Self::new(PadColor::default(), OutputFormat::Jpeg, OutputSize::default())
    }
}

#[derive(Debug, Clone)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RemoteResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Remote background-removal/compositing service.
pub trait RemoteEditor: Send + Sync {
    fn edit(&self, image: &[u8], file_name: &str, params: &EditParams) -> Result<RemoteResponse, CoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TelemetryEventType {
    BatchStart,
    FileSuccess,
    FileError,
    BatchComplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_type: TelemetryEventType,
    pub pipeline: Pipeline,
    pub index: usize,
    pub total: usize,
    pub duration_ms: Option<u64>,
    pub detail: Option<String>,
}

impl TelemetryEvent {
    /// Completed fraction of the batch after this event, in `0.0..=1.0`.
    pub fn progress(&self) -> f32 {
        if self.total == 0 {
            return 1.0;
        }
        self.index as f32 / self.total as f32
    }
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("remote edit failed: {status} - {body}")]
    RemoteEdit { status: u16, body: String },
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("failed to encode image: {0}")]
    Encode(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("archive error: {0}")]
    Archive(String),
    #[error("missing API key in environment variable {0}")]
    MissingApiKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    RemoteEditFailed,
    DecodeFailed,
    EncodeFailed,
    TransportError,
    InvalidParameters,
    ArchiveError,
    MissingApiKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::RemoteEdit { .. } => ErrorCode::RemoteEditFailed,
            Self::Decode(_) => ErrorCode::DecodeFailed,
            Self::Encode(_) => ErrorCode::EncodeFailed,
            Self::Transport(_) => ErrorCode::TransportError,
            Self::InvalidParameters(_) => ErrorCode::InvalidParameters,
            Self::Archive(_) => ErrorCode::ArchiveError,
            Self::MissingApiKey(_) => ErrorCode::MissingApiKey,
        }
    }

    pub fn as_error_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    pub output_format: String,
    pub pad_color: String,
    pub output_size: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub size_cap_kb: Option<u32>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_format: "jpeg".to_string(),
            pad_color: DEFAULT_PAD_HEX.to_string(),
            output_size: OutputSize::default().to_string(),
            width: Some(DEFAULT_CANVAS_WIDTH),
            height: Some(DEFAULT_CANVAS_HEIGHT),
            size_cap_kb: Some(DEFAULT_SIZE_CAP_KB),
        }
    }
}

impl PipelineConfig {
    pub fn format(&self) -> Result<OutputFormat, CoreError> {
        OutputFormat::parse(&self.output_format)
    }

    pub fn encoding_parameters(&self) -> Result<EncodingParameters, CoreError> {
        let params = EncodingParameters::for_format(self.format()?)
            .with_size_cap_kb(self.size_cap_kb.unwrap_or(DEFAULT_SIZE_CAP_KB));
        params.validate()?;
        Ok(params)
    }

    pub fn canvas_spec(&self) -> Result<CanvasSpec, CoreError> {
        CanvasSpec::new(
            self.width.unwrap_or(DEFAULT_CANVAS_WIDTH),
            self.height.unwrap_or(DEFAULT_CANVAS_HEIGHT),
            PadColor::parse(&self.pad_color)?,
        )
    }

    pub fn edit_params(&self) -> Result<EditParams, CoreError> {
        Ok(EditParams::new(
            PadColor::parse(&self.pad_color)?,
            self.format()?,
            OutputSize::parse(&self.output_size)?,
        ))
    }
}

pub fn resolve_pipeline_config(overrides: PipelineConfig) -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    if !overrides.output_format.trim().is_empty() {
        cfg.output_format = overrides.output_format;
    }
    if !overrides.pad_color.trim().is_empty() {
        cfg.pad_color = overrides.pad_color;
    }
    if !overrides.output_size.trim().is_empty() {
        cfg.output_size = overrides.output_size;
    }
    if overrides.width.is_some() {
        cfg.width = overrides.width;
    }
    if overrides.height.is_some() {
        cfg.height = overrides.height;
    }
    if overrides.size_cap_kb.is_some() {
        cfg.size_cap_kb = overrides.size_cap_kb;
    }
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_color_parses_with_and_without_hash() {
        assert_eq!(PadColor::parse("#EFEFEF").expect("valid colour"), PadColor::new(239, 239, 239));
        assert_eq!(PadColor::parse("ff0080").expect("valid colour"), PadColor::new(255, 0, 128));
        assert_eq!(PadColor::new(239, 239, 239).to_hex(), "EFEFEF");
        assert!(PadColor::parse("#EFEF").is_err());
        assert!(PadColor::parse("#GGGGGG").is_err());
    }

    #[test]
    fn output_size_round_trips_through_display() {
        let size = OutputSize::parse(" 1200X1500 ").expect("valid size");
        assert_eq!(size, OutputSize { width: 1200, height: 1500 });
        assert_eq!(size.to_string(), "1200x1500");
        assert!(OutputSize::parse("1200").is_err());
        assert!(OutputSize::parse("0x10").is_err());
    }

    #[test]
    fn artifact_names_follow_pipeline_conventions() {
        assert_eq!(
            artifact_name(Pipeline::Process, "shoe.front.png", OutputFormat::Jpg),
            "shoe.front_processed.jpg"
        );
        assert_eq!(artifact_name(Pipeline::Resize, "bag.webp", OutputFormat::Png), "resized_bag.png");
        assert_eq!(
            artifact_name(Pipeline::Resize, "hat.jpeg", OutputFormat::parse("JPEG").expect("format")),
            "resized_hat.jpeg"
        );
    }

    #[test]
    fn default_encoding_parameters_allow_seventeen_attempts() {
        let params = EncodingParameters::default();
        params.validate().expect("defaults are valid");
        assert_eq!(params.max_attempts(), 17);
        assert_eq!(params.size_cap_bytes(), 200 * 1024);
    }

    #[test]
    fn non_negative_step_is_rejected() {
        let mut params = EncodingParameters::default();
        params.quality_step = 0;
        assert!(matches!(params.validate(), Err(CoreError::InvalidParameters(_))));
    }

    #[test]
    fn quality_floor_below_five_is_rejected() {
        let mut params = EncodingParameters::default();
        for floor in [0, 1, 4] {
            params.quality_floor = floor;
            assert!(matches!(params.validate(), Err(CoreError::InvalidParameters(_))), "floor {}", floor);
        }
        params.quality_floor = 5;
        params.validate().expect("floor of five is valid");
        params.quality_floor = 86;
        assert!(params.validate().is_err());
    }

    #[test]
    fn canvas_rejects_zero_dimensions() {
        assert!(CanvasSpec::new(0, 10, PadColor::default()).is_err());
        assert!(CanvasSpec::new(10, 0, PadColor::default()).is_err());
    }

    #[test]
    fn edit_params_request_jpeg_for_webp_exports() {
        let params = EditParams::new(PadColor::default(), OutputFormat::Webp, OutputSize::default());
        let fields = params.form_fields();
        assert!(fields.contains(&("export.format", "jpeg".to_string())));
        assert!(fields.contains(&("background.color", "EFEFEF".to_string())));
        assert!(fields.contains(&("padding", "0.1".to_string())));
        assert!(fields.contains(&("shadow.mode", "ai.soft".to_string())));
    }

    #[test]
    fn resolve_keeps_defaults_for_blank_overrides() {
        let cfg = resolve_pipeline_config(PipelineConfig {
            output_format: " ".to_string(),
            pad_color: String::new(),
            output_size: "800x600".to_string(),
            width: None,
            height: Some(900),
            size_cap_kb: None,
        });
        assert_eq!(cfg.output_format, "jpeg");
        assert_eq!(cfg.pad_color, DEFAULT_PAD_HEX);
        assert_eq!(cfg.output_size, "800x600");
        assert_eq!(cfg.width, Some(DEFAULT_CANVAS_WIDTH));
        assert_eq!(cfg.height, Some(900));
        let canvas = cfg.canvas_spec().expect("canvas");
        assert_eq!((canvas.width(), canvas.height()), (1200, 900));
    }

    #[test]
    fn remote_edit_error_reports_status_and_body() {
        let err = CoreError::RemoteEdit {
            status: 500,
            body: "boom".to_string(),
        };
        let info = err.as_error_info();
        assert_eq!(info.code, ErrorCode::RemoteEditFailed);
        assert_eq!(info.message, "remote edit failed: 500 - boom");
    }
}
