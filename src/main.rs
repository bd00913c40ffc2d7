use anyhow::{Context, Result};
use chrono::{Local, Utc};
use clap::Parser;
use log::{info, warn};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use tokio::time::{interval, Duration};

use pose_fusion_rs::clock::{seconds_of_day, ClockAligner};
use pose_fusion_rs::live_status::{self, LiveStatus};
use pose_fusion_rs::sensor_fusion::{FusionConfig, FusionEngine, FusionSnapshot, StepKind};
use pose_fusion_rs::sensors::{self, ReplayClock, ReplayOptions, SessionLog, SimulationConfig};

#[derive(Parser, Debug)]
#[command(name = "pose_fusion")]
#[command(about = "Planar GNSS/IMU fusion - replay a session or drive the simulator", long_about = None)]
struct Args {
    /// Duration in seconds (0 = until the sources end or Ctrl-C)
    #[arg(long, value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// JSON config file (camelCase keys, missing keys use defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Session log to replay (.json or .json.gz); simulates when omitted
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Simulated accelerometer rate (Hz)
    #[arg(long, default_value = "63")]
    accel_rate: f64,

    /// Simulated gyroscope rate (Hz)
    #[arg(long, default_value = "200")]
    gyro_rate: f64,

    /// Simulated GNSS rate (Hz)
    #[arg(long, default_value = "5")]
    gnss_rate: f64,

    /// Output directory
    #[arg(long, default_value = "pose_fusion_sessions")]
    output_dir: String,

    /// Whole-hour UTC offset of the local clock (overrides config and log)
    #[arg(long, allow_hyphen_values = true)]
    utc_offset: Option<i32>,

    /// Stop each producer after this many samples
    #[arg(long)]
    max_samples: Option<u64>,

    /// Replay speed factor (0 = as fast as possible)
    #[arg(long, default_value = "1.0")]
    speed: f64,
}

#[derive(Serialize)]
struct TrajectoryPoint {
    t_local: f64,
    x: f64,
    y: f64,
    speed: f64,
    heading_deg: f64,
    covariance_trace: f64,
    step: StepKind,
}

impl From<&FusionSnapshot> for TrajectoryPoint {
    fn from(snapshot: &FusionSnapshot) -> Self {
        Self {
            t_local: snapshot.t_local,
            x: snapshot.state.x,
            y: snapshot.state.y,
            speed: snapshot.state.v,
            heading_deg: snapshot.state.heading_deg(),
            covariance_trace: snapshot.covariance_trace,
            step: snapshot.step,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match args.config.as_ref() {
        Some(path) => FusionConfig::load(path)?,
        None => FusionConfig::default(),
    };
    let session = args
        .replay
        .as_ref()
        .map(|path| SessionLog::load(path))
        .transpose()?;
    if let Some(offset) = args.utc_offset {
        config.utc_offset_hours = offset;
    } else if let Some(log) = session.as_ref() {
        config.utc_offset_hours = log.utc_offset_hours;
    }
    config.validate()?;

    info!("[{}] Pose fusion starting", ts_now());
    info!("  Duration: {} seconds (0=until end)", args.duration);
    match args.replay.as_ref() {
        Some(path) => info!("  Replay: {} at {}x", path.display(), args.speed),
        None => info!(
            "  Simulation: accel {} Hz, gyro {} Hz, gnss {} Hz",
            args.accel_rate, args.gyro_rate, args.gnss_rate
        ),
    }
    info!("  UTC offset: {:+} h", config.utc_offset_hours);
    info!("  Output Dir: {}", args.output_dir);

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir))?;

    let mut engine = FusionEngine::new(config.clone())?;
    let imu_feed = engine
        .inertial_feed()
        .context("inertial feed already handed out")?;
    let gnss_feed = engine
        .position_feed()
        .context("position feed already handed out")?;
    let shutdown = engine.shutdown_handle();
    let state = engine.state_handle();
    let snapshots = engine.subscribe();

    // Producers
    let (imu_task, gnss_task) = match session {
        Some(log) => {
            let origin = log
                .start_local_secs(&ClockAligner::new(config.utc_offset_hours))
                .unwrap_or(0.0);
            let options = ReplayOptions {
                speed: args.speed,
                max_samples: args.max_samples,
                clock: Some(ReplayClock::start_now(origin)),
            };
            info!(
                "Replaying {} inertial samples and {} fixes",
                log.imu.len(),
                log.gnss.len()
            );
            (
                tokio::spawn(sensors::replay_inertial_loop(
                    log.imu,
                    imu_feed,
                    shutdown.clone(),
                    options,
                )),
                tokio::spawn(sensors::replay_gnss_loop(
                    log.gnss,
                    gnss_feed,
                    shutdown.clone(),
                    options,
                )),
            )
        }
        None => {
            let sim = SimulationConfig {
                accel_hz: args.accel_rate,
                gyro_hz: args.gyro_rate,
                gnss_hz: args.gnss_rate,
                start_local_secs: seconds_of_day(Local::now().time()),
                duration_secs: (args.duration > 0).then_some(args.duration as f64),
                max_samples: args.max_samples,
                utc_offset_hours: config.utc_offset_hours,
                ..SimulationConfig::default()
            };
            sim.validate()?;
            (
                tokio::spawn(sensors::simulated_inertial_loop(
                    imu_feed,
                    shutdown.clone(),
                    sim.clone(),
                )),
                tokio::spawn(sensors::simulated_gnss_loop(gnss_feed, shutdown.clone(), sim)),
            )
        }
    };

    // Ctrl-C
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("[{}] Ctrl-C received, stopping...", ts_now());
                shutdown.request();
            }
        });
    }

    // Estimator on its own thread
    let mut engine_task = tokio::task::spawn_blocking(move || engine.run());

    let start = Utc::now();
    let mut last_status_update = Utc::now();
    let mut trajectory: Vec<TrajectoryPoint> = Vec::new();
    let mut ticker = interval(Duration::from_millis(250));
    let status_path = format!("{}/live_status.json", args.output_dir);

    let summary = loop {
        tokio::select! {
            result = &mut engine_task => break result.context("fusion thread panicked")?,
            _ = ticker.tick() => {
                trajectory.extend(snapshots.try_iter().map(|s| TrajectoryPoint::from(&s)));

                let now = Utc::now();
                if args.duration > 0 && args.replay.is_some() {
                    let elapsed = now.signed_duration_since(start);
                    if elapsed.num_seconds() as u64 >= args.duration && !shutdown.is_requested() {
                        info!("[{}] Duration reached, stopping...", ts_now());
                        shutdown.request();
                    }
                }

                // Update live status every 2 seconds
                if now.signed_duration_since(last_status_update).num_seconds() >= 2 {
                    let mut live = LiveStatus::new();
                    live.uptime_seconds = now.signed_duration_since(start).num_seconds().max(0) as u64;
                    if let Some(snapshot) = state.latest() {
                        live.apply_snapshot(&snapshot);
                    }
                    if let Err(e) = live.save(&status_path) {
                        warn!("Failed to write {}: {}", status_path, e);
                    }
                    last_status_update = now;
                }
            }
        }
    };
    trajectory.extend(snapshots.try_iter().map(|s| TrajectoryPoint::from(&s)));

    // Engine is done; let the producers wind down
    shutdown.request();
    let imu_samples = imu_task.await.unwrap_or_else(|e| {
        warn!("inertial producer failed: {}", e);
        0
    });
    let gnss_fixes = gnss_task.await.unwrap_or_else(|e| {
        warn!("position producer failed: {}", e);
        0
    });

    let uptime = Utc::now().signed_duration_since(start).num_seconds().max(0) as u64;
    let mut final_status = LiveStatus::new();
    final_status.timestamp = live_status::current_timestamp();
    final_status.uptime_seconds = uptime;
    if let Some(snapshot) = summary.last.as_ref() {
        final_status.apply_snapshot(snapshot);
    }
    final_status.status = summary.final_status;
    let final_path = format!("{}/live_status_final.json", args.output_dir);
    if let Err(e) = final_status.save(&final_path) {
        warn!("Failed to write {}: {}", final_path, e);
    }

    let points = trajectory.len();
    let output = json!({
        "config": config,
        "summary": {
            "imu_samples": imu_samples,
            "gnss_fixes": gnss_fixes,
            "predicts": summary.counters.predicts,
            "corrections": summary.counters.corrections,
            "skipped": summary.counters.skipped,
            "evicted_inertial": summary.evicted_inertial,
            "evicted_position": summary.evicted_position,
            "final_status": summary.final_status,
            "termination": summary.termination.as_ref().map(|e| e.to_string()),
            "final_state": summary.last.as_ref().map(|s| s.state),
        },
        "trajectory": trajectory,
    });
    let filename = format!("{}/trajectory_{}.json", args.output_dir, ts_now_clean());
    std::fs::write(&filename, serde_json::to_string_pretty(&output)?)
        .with_context(|| format!("writing {}", filename))?;
    info!(
        "[{}] Saved {} trajectory points to {}",
        ts_now(),
        points,
        filename
    );

    println!("\n=== Final Stats ===");
    println!("Inertial samples: {}", imu_samples);
    println!("GNSS fixes: {}", gnss_fixes);
    println!(
        "Steps: {} predicts, {} corrections, {} skipped",
        summary.counters.predicts, summary.counters.corrections, summary.counters.skipped
    );
    if let Some(last) = summary.last.as_ref() {
        println!(
            "Final state: x={:.2} m, y={:.2} m, v={:.2} m/s, heading={:.1}°",
            last.state.x,
            last.state.y,
            last.state.v,
            last.state.heading_deg()
        );
    }

    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
