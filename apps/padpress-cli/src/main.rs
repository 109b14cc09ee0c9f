use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use padpress_batch::{run_process_batch, run_resize_batch, BatchReport, InputFile, ProcessSettings, ResizeSettings};
use padpress_core::{resolve_pipeline_config, OutputFormat, PipelineConfig, TelemetrySink};
use padpress_remote::{PhotoroomClient, DEFAULT_API_KEY_ENV};
use padpress_telemetry::{sink_from_env, LogSink};
use regex::Regex;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(name = "padpress", version, about = "Batch background editing and canvas resizing with size-capped output")]
struct Cli {
    /// Default log level when RUST_LOG is unset.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
    #[command(subcommand)]
    command: TopLevelCommand,
}

#[derive(Subcommand, Debug)]
enum TopLevelCommand {
    /// Send images to the remote editor and zip the size-capped results.
    Process(ProcessArgs),
    /// Fit images onto a padded canvas locally and zip the results.
    Resize(ResizeArgs),
}

#[derive(Args, Debug)]
struct InputArgs {
    /// A file, a directory, or a regex matched against file names under --input-root.
    #[arg(long, short = 'i')]
    input: String,
    /// Root directory for regex input matching (defaults to current directory).
    #[arg(long, short = 'r')]
    input_root: Option<PathBuf>,
    /// Recurse when scanning directories / regex matches.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    recursive: bool,
    /// Archive to write. Defaults to processed_images.zip / resized_images.zip.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, default_value_t = 200)]
    size_cap_kb: u32,
}

#[derive(Args, Debug)]
struct ProcessArgs {
    #[command(flatten)]
    inputs: InputArgs,
    #[arg(long, short = 's', default_value = "1200x1500")]
    output_size: String,
    #[arg(long, short = 'f', default_value = "jpeg")]
    format: String,
    #[arg(long, short = 'b', default_value = "#EFEFEF")]
    background_color: String,
    #[arg(long, default_value = DEFAULT_API_KEY_ENV)]
    api_key_env: String,
    #[arg(long)]
    api_url: Option<String>,
}

#[derive(Args, Debug)]
struct ResizeArgs {
    #[command(flatten)]
    inputs: InputArgs,
    #[arg(long, short = 'W', default_value_t = 1200)]
    width: u32,
    #[arg(long, short = 'H', default_value_t = 1500)]
    height: u32,
    #[arg(long, short = 'f', default_value = "JPEG")]
    format: String,
    #[arg(long, short = 'p', default_value = "#EFEFEF")]
    pad_color: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("padpress={}", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let telemetry: Box<dyn TelemetrySink> = sink_from_env().unwrap_or_else(|| Box::new(LogSink));

    match cli.command {
        TopLevelCommand::Process(args) => {
            let config = resolve_pipeline_config(PipelineConfig {
                output_format: args.format.clone(),
                pad_color: args.background_color.clone(),
                output_size: args.output_size.clone(),
                width: None,
                height: None,
                size_cap_kb: Some(args.inputs.size_cap_kb),
            });
            let settings = ProcessSettings::new(config.edit_params()?, args.inputs.size_cap_kb);
            settings.encoding.validate()?;
            let (inputs, read_failures) = load_inputs(&args.inputs)?;
            let client = PhotoroomClient::from_env(&args.api_key_env, args.api_url.clone())?;
            info!(endpoint = client.endpoint(), files = inputs.len(), "processing images");
            let report = run_process_batch(&client, &inputs, &settings, Some(telemetry.as_ref()))?;
            finish(report, read_failures, args.inputs.output.as_deref())?;
        }
        TopLevelCommand::Resize(args) => {
            let config = resolve_pipeline_config(PipelineConfig {
                output_format: args.format.clone(),
                pad_color: args.pad_color.clone(),
                output_size: String::new(),
                width: Some(args.width),
                height: Some(args.height),
                size_cap_kb: Some(args.inputs.size_cap_kb),
            });
            let settings = ResizeSettings {
                canvas: config.canvas_spec()?,
                encoding: config.encoding_parameters()?,
            };
            let (inputs, read_failures) = load_inputs(&args.inputs)?;
            info!(
                width = settings.canvas.width(),
                height = settings.canvas.height(),
                files = inputs.len(),
                "resizing images"
            );
            let report = run_resize_batch(&inputs, &settings, Some(telemetry.as_ref()))?;
            finish(report, read_failures, args.inputs.output.as_deref())?;
        }
    }

    Ok(())
}

fn finish(report: BatchReport, read_failures: Vec<serde_json::Value>, output: Option<&Path>) -> Result<()> {
    let archive_path = if report.download_offered() {
        let path = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(report.pipeline.archive_name()));
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &report.archive).with_context(|| format!("writing archive {}", path.display()))?;
        Some(path)
    } else {
        None
    };

    let mut failures = read_failures;
    for failure in &report.failures {
        failures.push(serde_json::to_value(failure)?);
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "pipeline": report.pipeline.label(),
            "archive": archive_path,
            "downloadOffered": report.download_offered(),
            "entries": report.entries,
            "failures": failures,
        }))?
    );
    Ok(())
}

/// Reads every matched input. Unreadable files become failure records rather
/// than aborting the run.
fn load_inputs(args: &InputArgs) -> Result<(Vec<InputFile>, Vec<serde_json::Value>)> {
    let paths = resolve_inputs(args)?;
    if paths.is_empty() {
        return Err(anyhow!("no input images matched"));
    }
    let mut inputs = Vec::with_capacity(paths.len());
    let mut failures = Vec::new();
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("input file must include a valid file name: {}", path.display()))?;
        match std::fs::read(&path) {
            Ok(bytes) => inputs.push(InputFile::new(name, bytes)),
            Err(err) => failures.push(serde_json::json!({
                "input": path,
                "error": format!("failed to read input: {}", err),
            })),
        }
    }
    Ok((inputs, failures))
}

/// How `--input` selects files: one file, every image under a directory, or
/// every image under `--input-root` whose file name matches a regex.
enum InputSelector {
    File(PathBuf),
    Dir(PathBuf),
    Pattern { root: PathBuf, re: Regex },
}

impl InputSelector {
    fn from_args(args: &InputArgs) -> Result<Self> {
        let candidate = PathBuf::from(&args.input);
        if candidate.is_dir() {
            return Ok(Self::Dir(candidate));
        }
        if candidate.exists() {
            return Ok(Self::File(candidate));
        }
        let root = match args.input_root.clone() {
            Some(root) => root,
            None => std::env::current_dir()?,
        };
        let re = Regex::new(&args.input)
            .with_context(|| format!("'{}' is neither a path nor a valid regex", args.input))?;
        Ok(Self::Pattern { root, re })
    }

    fn paths(&self, recursive: bool) -> Vec<PathBuf> {
        match self {
            Self::File(path) => vec![path.clone()],
            Self::Dir(dir) => scan_images(dir, recursive, |_| true),
            Self::Pattern { root, re } => scan_images(root, recursive, |name| re.is_match(name)),
        }
    }
}

fn resolve_inputs(args: &InputArgs) -> Result<Vec<PathBuf>> {
    Ok(InputSelector::from_args(args)?.paths(args.recursive))
}

/// Sorted image files under `root` whose file name passes `keep`.
fn scan_images(root: &Path, recursive: bool, keep: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    let walk = WalkDir::new(root).max_depth(if recursive { usize::MAX } else { 1 });
    let mut out: Vec<PathBuf> = walk
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            is_supported_image(entry.path()) && keep(name.as_ref())
        })
        .map(|entry| entry.into_path())
        .collect();
    out.sort();
    out
}

/// Inputs are recognised by the same extensions padpress can write.
fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| OutputFormat::parse(ext).is_ok())
}
