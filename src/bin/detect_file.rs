//! detect_file - run the detection pipeline once on a local file
//!
//! Offline counterpart of the upload routes: no HTTP, no authentication. The
//! result is printed as JSON on stdout. Unless `--no-log` is given the record is
//! written to the configured detection log.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use firewatch::{
    config::{FirewatchConfig, FIRE_PROFILE},
    frame::{file_extension, IMAGE_EXTENSIONS},
    CancelToken, DetectionLogWriter, InMemoryDetectionLogStore, Orchestrator,
    PipelineRequest, SourceType, SqliteDetectionLogStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run fire/metal detection on a local image or video")]
struct Args {
    /// Image (jpg, jpeg, png) or video (mp4, avi, mov, mkv, webm, mjpeg) file.
    input: PathBuf,

    /// Detection profile to run.
    #[arg(long, default_value = FIRE_PROFILE)]
    profile: String,

    /// Sample every Nth video frame.
    #[arg(long, env = "FIREWATCH_FRAME_STRIDE")]
    frame_stride: Option<u64>,

    /// Do not write a detection log record.
    #[arg(long)]
    no_log: bool,

    /// Give up after this many seconds.
    #[arg(long, default_value_t = 600)]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut config = FirewatchConfig::load()?;
    if let Some(stride) = args.frame_stride {
        config.sampling.frame_stride = stride;
    }

    let settings = config
        .profiles
        .get(&args.profile)
        .ok_or_else(|| anyhow!("unknown profile '{}'", args.profile))?;
    let detector = settings.backend.build()?;
    detector.warm_up()?;
    let profile = firewatch::DetectionProfile::new(
        args.profile.clone(),
        firewatch::TargetPolicy::new(settings.target_labels.iter().cloned()),
        detector,
    )
    .with_messages(settings.alert_message.clone(), settings.clear_message.clone());

    let writer = if args.no_log {
        DetectionLogWriter::new(InMemoryDetectionLogStore::new())
    } else {
        DetectionLogWriter::new(SqliteDetectionLogStore::open(&config.db_path)?)
    };
    let orchestrator = Orchestrator::new(config.artifact_store()?, writer, config.frame_sampler()?);

    let file_name = args
        .input
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("input path has no usable file name"))?
        .to_string();
    let bytes = std::fs::read(&args.input)
        .with_context(|| format!("read {}", args.input.display()))?;
    let request = match file_extension(&file_name) {
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => {
            PipelineRequest::image(file_name, bytes)
        }
        _ => PipelineRequest::video(file_name, bytes),
    }
    .with_source_type(SourceType::Upload);
    let cancel = CancelToken::new().with_timeout(std::time::Duration::from_secs(args.timeout_secs));
    let outcome = orchestrator.run(&profile, request, &cancel)?;

    println!("{}", serde_json::to_string_pretty(&outcome.record)?);
    Ok(())
}
