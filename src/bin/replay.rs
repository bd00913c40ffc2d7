use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use serde_json::json;

use pose_fusion_rs::geodesy::haversine_distance;
use pose_fusion_rs::sensor_fusion::{EngineStatus, FusionConfig, FusionEngine, FusionEvent};
use pose_fusion_rs::sensors::SessionLog;
use pose_fusion_rs::types::GnssFix;

#[derive(Parser, Debug)]
struct Args {
    /// Path to a session_*.json[.gz] log
    #[arg(long, conflicts_with = "golden_dir")]
    log: Option<PathBuf>,

    /// Directory of golden logs to batch replay (processes session_*.json[.gz])
    #[arg(long)]
    golden_dir: Option<PathBuf>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Whole-hour UTC offset (overrides the log's own)
    #[arg(long, allow_hyphen_values = true)]
    utc_offset: Option<i32>,

    /// Also write the results array to this file
    #[arg(long)]
    output: Option<PathBuf>,
}

fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::INFINITY;
    }
    let sum_sq: f64 = values.iter().map(|v| v * v).sum();
    (sum_sq / values.len() as f64).sqrt()
}

/// Great-circle length of the usable fixes, in recording order [m]
fn gnss_path_length(fixes: &[GnssFix]) -> f64 {
    let usable: Vec<&GnssFix> = fixes.iter().filter(|f| f.is_usable()).collect();
    usable
        .windows(2)
        .map(|w| {
            haversine_distance(
                w[0].latitude.abs(),
                w[0].longitude.abs(),
                w[1].latitude.abs(),
                w[1].longitude.abs(),
            )
        })
        .sum()
}

fn run_once(path: &Path, args: &Args) -> anyhow::Result<serde_json::Value> {
    let log = SessionLog::load(path)?;

    let mut config = match args.config.as_ref() {
        Some(config_path) => FusionConfig::load(config_path)?,
        None => FusionConfig::default(),
    };
    config.utc_offset_hours = args.utc_offset.unwrap_or(log.utc_offset_hours);
    // Everything is buffered before the engine drains it
    config.buffer_capacity.inertial = config.buffer_capacity.inertial.max(log.imu.len());
    config.buffer_capacity.position = config.buffer_capacity.position.max(log.gnss.len());

    let mut engine = FusionEngine::new(config)?;
    let mut imu = engine
        .inertial_feed()
        .context("inertial feed already handed out")?;
    let mut gnss = engine
        .position_feed()
        .context("position feed already handed out")?;

    let mut rejected_imu = 0u64;
    for sample in &log.imu {
        if imu.push(sample.clone()).is_err() {
            rejected_imu += 1;
        }
    }
    let mut bad_stamps = 0u64;
    for fix in &log.gnss {
        if let Err(e) = gnss.push_fix(fix) {
            warn!("fix at {} skipped: {}", fix.utc, e);
            bad_stamps += 1;
        }
    }
    let sentinel_fixes = gnss.discarded();
    imu.finish();
    gnss.finish();

    let mut residuals = Vec::new();
    let mut skipped_by_error = Vec::new();
    while engine.status() != EngineStatus::Shutdown {
        for event in engine.process_due() {
            match event {
                FusionEvent::Corrected { residual_m, .. } => residuals.push(residual_m),
                FusionEvent::StepSkipped { error, .. } => skipped_by_error.push(error.to_string()),
                _ => {}
            }
        }
    }
    let summary = engine.summary();

    info!(
        "{}: {} predicts, {} corrections, {} skipped",
        path.display(),
        summary.counters.predicts,
        summary.counters.corrections,
        summary.counters.skipped
    );

    Ok(json!({
        "log": path.display().to_string(),
        "imu_samples": log.imu.len(),
        "gnss_fixes": log.gnss.len(),
        "rejected_imu": rejected_imu,
        "sentinel_fixes": sentinel_fixes,
        "bad_utc_stamps": bad_stamps,
        "predicts": summary.counters.predicts,
        "corrections": summary.counters.corrections,
        "skipped": summary.counters.skipped,
        "skip_reasons": skipped_by_error,
        "position_innovation_rms": rms(&residuals),
        "max_position_innovation": residuals.iter().copied().fold(0.0_f64, f64::max),
        "final_state": summary.last.as_ref().map(|s| s.state),
        "final_covariance_trace": summary.last.as_ref().map(|s| s.covariance_trace),
        "gnss_path_length_m": gnss_path_length(&log.gnss),
    }))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let mut results = Vec::new();

    if let Some(dir) = args.golden_dir.as_ref() {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !(name.starts_with("session_") && (name.ends_with(".json") || name.ends_with(".json.gz"))) {
                continue;
            }
            match run_once(&path, &args) {
                Ok(res) => results.push(res),
                Err(e) => eprintln!("Failed {}: {}", path.display(), e),
            }
        }
    } else if let Some(log) = args.log.as_ref() {
        results.push(run_once(log, &args)?);
    } else {
        anyhow::bail!("Provide --log or --golden-dir");
    }

    let text = serde_json::to_string_pretty(&results)?;
    if let Some(output) = args.output.as_ref() {
        std::fs::write(output, &text).with_context(|| format!("writing {}", output.display()))?;
    }
    println!("{}", text);
    Ok(())
}
