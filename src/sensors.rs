use anyhow::Context;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};

use crate::clock::ClockAligner;
use crate::error::{FusionError, FusionResult};
use crate::feed::{InertialFeed, PositionFeed};
use crate::geodesy::{body_to_world, LocalProjection};
use crate::sensor_fusion::ShutdownHandle;
use crate::types::{GnssFix, InertialSample};

const GRAVITY: f64 = 9.81;
const SECONDS_PER_DAY: f64 = 86_400.0;

// ─── Session logs ────────────────────────────────────────────────────────────

/// Recorded session: inertial samples on the local clock, fixes in UTC.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLog {
    #[serde(default)]
    pub utc_offset_hours: i32,
    pub imu: Vec<InertialSample>,
    pub gnss: Vec<GnssFix>,
}

impl SessionLog {
    /// Load a `.json` or `.json.gz` session.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let log: SessionLog = if is_gzip(path) {
            serde_json::from_reader(BufReader::new(GzDecoder::new(file)))
        } else {
            serde_json::from_reader(BufReader::new(file))
        }
        .with_context(|| format!("parsing session {}", path.display()))?;
        Ok(log)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        if is_gzip(path) {
            let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
            serde_json::to_writer(&mut encoder, self)?;
            encoder.finish()?.flush()?;
        } else {
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, self)?;
            writer.flush()?;
        }
        Ok(())
    }

    /// Earliest local timestamp across both streams.
    pub fn start_local_secs(&self, aligner: &ClockAligner) -> Option<f64> {
        let first_imu = self.imu.iter().map(|s| s.t_local).reduce(f64::min);
        let first_fix = self
            .gnss
            .iter()
            .filter(|f| f.is_usable())
            .filter_map(|f| aligner.to_local_seconds(&f.utc).ok())
            .reduce(f64::min);
        match (first_imu, first_fix) {
            (Some(i), Some(f)) => Some(i.min(f)),
            (t, None) | (None, t) => t,
        }
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension().map(|e| e == "gz").unwrap_or(false)
}

// ─── Replay producers ────────────────────────────────────────────────────────

/// Wall-clock anchor shared by every replay producer of one session.
///
/// A sample stamped `t` is released at `start + (t - origin) / speed`, so
/// both streams stay interleaved the way they were recorded.
#[derive(Clone, Copy, Debug)]
pub struct ReplayClock {
    start: Instant,
    origin: f64,
}

impl ReplayClock {
    pub fn start_now(origin: f64) -> Self {
        Self {
            start: Instant::now(),
            origin,
        }
    }

    fn release_at(&self, t: f64, speed: f64) -> Option<Instant> {
        if !(speed > 0.0) || !speed.is_finite() {
            return None;
        }
        let offset = Duration::try_from_secs_f64(((t - self.origin) / speed).max(0.0)).ok()?;
        self.start.checked_add(offset)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ReplayOptions {
    /// Playback rate relative to the recording; 0 means as fast as possible
    pub speed: f64,
    pub max_samples: Option<u64>,
    /// Shared pacing anchor; without one a loop anchors on its own first sample
    pub clock: Option<ReplayClock>,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            speed: 1.0,
            max_samples: None,
            clock: None,
        }
    }
}

impl ReplayOptions {
    async fn wait_for(&self, clock: &mut Option<ReplayClock>, t: f64) {
        let anchor = *clock.get_or_insert_with(|| ReplayClock::start_now(t));
        match anchor.release_at(t, self.speed) {
            Some(deadline) => sleep_until(deadline).await,
            None => tokio::task::yield_now().await,
        }
    }

    fn exhausted(&self, count: u64) -> bool {
        self.max_samples.map_or(false, |max| count >= max)
    }
}

/// Push recorded inertial samples, paced by their timestamps.
pub async fn replay_inertial_loop(
    samples: Vec<InertialSample>,
    mut feed: InertialFeed,
    shutdown: ShutdownHandle,
    options: ReplayOptions,
) -> u64 {
    let mut sample_count = 0u64;
    let mut clock = options.clock;

    for sample in samples {
        if shutdown.is_requested() || options.exhausted(sample_count) {
            break;
        }
        options.wait_for(&mut clock, sample.t_local).await;

        match feed.push(sample) {
            Ok(()) => {
                sample_count += 1;
                if sample_count % 100 == 0 {
                    info!("[imu] {} samples", sample_count);
                }
            }
            Err(e) => warn!("[imu] dropped sample: {}", e),
        }
    }

    info!("[imu] replay finished after {} samples", sample_count);
    feed.finish();
    sample_count
}

/// Push recorded fixes, paced by their UTC stamps.
pub async fn replay_gnss_loop(
    fixes: Vec<GnssFix>,
    mut feed: PositionFeed,
    shutdown: ShutdownHandle,
    options: ReplayOptions,
) -> u64 {
    let aligner = feed.aligner();
    let mut fix_count = 0u64;
    let mut clock = options.clock;

    for fix in fixes {
        if shutdown.is_requested() || options.exhausted(fix_count) {
            break;
        }
        match aligner.to_local_seconds(&fix.utc) {
            Ok(t_local) => options.wait_for(&mut clock, t_local).await,
            Err(_) => tokio::task::yield_now().await,
        }

        match feed.push_fix(&fix) {
            Ok(true) => {
                fix_count += 1;
                if fix_count % 100 == 0 {
                    info!("[gnss] {} fixes", fix_count);
                }
            }
            Ok(false) => {}
            Err(e) => warn!("[gnss] skipped fix at {}: {}", fix.utc, e),
        }
    }

    info!(
        "[gnss] replay finished after {} fixes ({} without a fix)",
        fix_count,
        feed.discarded()
    );
    feed.finish();
    fix_count
}

// ─── Simulated producers ─────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub accel_hz: f64,
    pub gyro_hz: f64,
    pub gnss_hz: f64,
    /// Constant ground speed [m/s]
    pub speed_mps: f64,
    /// Circle radius [m], counter-clockwise
    pub radius_m: f64,
    /// Geodetic position of the start point
    pub origin: (f64, f64),
    /// Local time of day at which the drive starts [s]
    pub start_local_secs: f64,
    /// Stop after this long; None runs until shutdown
    pub duration_secs: Option<f64>,
    pub max_samples: Option<u64>,
    pub utc_offset_hours: i32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            accel_hz: 63.0,
            gyro_hz: 200.0,
            gnss_hz: 5.0,
            speed_mps: 10.0,
            radius_m: 50.0,
            origin: (22.3193, 114.1694),
            start_local_secs: 12.0 * 3600.0,
            duration_secs: None,
            max_samples: None,
            utc_offset_hours: 0,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> FusionResult<()> {
        for (name, rate) in [
            ("accel rate", self.accel_hz),
            ("gyro rate", self.gyro_hz),
            ("gnss rate", self.gnss_hz),
        ] {
            if sample_period(rate).is_none() {
                return Err(FusionError::InvalidConfig(format!(
                    "{} must be finite and positive, got {}",
                    name, rate
                )));
            }
        }
        if !self.speed_mps.is_finite() || !(self.radius_m > 0.0) || !self.radius_m.is_finite() {
            return Err(FusionError::InvalidConfig(format!(
                "drive needs a finite speed and positive radius, got {} m/s on {} m",
                self.speed_mps, self.radius_m
            )));
        }
        Ok(())
    }
}

/// Tick period for `rate_hz`, or None when no usable interval exists.
fn sample_period(rate_hz: f64) -> Option<Duration> {
    if !(rate_hz > 0.0) || !rate_hz.is_finite() {
        return None;
    }
    let period = Duration::try_from_secs_f64(1.0 / rate_hz).ok()?;
    (!period.is_zero()).then_some(period)
}

/// Deterministic constant-speed circular drive starting at the planar origin
/// heading along +x.
#[derive(Clone, Copy, Debug)]
pub struct CircularDrive {
    speed: f64,
    radius: f64,
}

impl CircularDrive {
    pub fn new(speed: f64, radius: f64) -> Self {
        Self {
            speed,
            radius: radius.max(f64::EPSILON),
        }
    }

    pub fn yaw_rate(&self) -> f64 {
        self.speed / self.radius
    }

    /// Body-frame specific force: centripetal on the lateral axis, gravity on z
    pub fn accel_at(&self, _t: f64) -> (f64, f64, f64) {
        (self.speed * self.speed / self.radius, 0.0, GRAVITY)
    }

    pub fn gyro_at(&self, _t: f64) -> (f64, f64, f64) {
        (0.0, 0.0, self.yaw_rate())
    }

    /// Walk the planar position from `t0` to `t1` along the circle.
    ///
    /// The chord between both instants is a forward body step taken at the
    /// mid-arc heading, which keeps the walk on the circle.
    pub fn advance(&self, position: (f64, f64), t0: f64, t1: f64) -> (f64, f64) {
        let swept = self.yaw_rate() * (t1 - t0);
        let chord = 2.0 * self.radius * (swept / 2.0).sin();
        let mid_heading = self.yaw_rate() * t0 + swept / 2.0;
        body_to_world(0.0, chord, position.0, position.1, mid_heading)
    }
}

/// Value of a stream sampled at `rate_hz`, held until its next sample.
fn zero_order_hold(t: f64, rate_hz: f64) -> f64 {
    if rate_hz > 0.0 {
        (t * rate_hz).floor() / rate_hz
    } else {
        t
    }
}

fn wrap_day(t: f64) -> f64 {
    t.rem_euclid(SECONDS_PER_DAY)
}

/// Simulated accelerometer and gyroscope combined into inertial samples at
/// the faster of the two rates.
pub async fn simulated_inertial_loop(
    mut feed: InertialFeed,
    shutdown: ShutdownHandle,
    sim: SimulationConfig,
) -> u64 {
    let drive = CircularDrive::new(sim.speed_mps, sim.radius_m);
    let rate = sim.accel_hz.max(sim.gyro_hz);
    let Some(period) = sample_period(rate) else {
        warn!("[imu] unusable simulation rate {} Hz", rate);
        feed.finish();
        return 0;
    };
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
    let mut sample_count = 0u64;

    loop {
        ticker.tick().await;
        let t = sample_count as f64 / rate;
        if shutdown.is_requested()
            || sim.duration_secs.map_or(false, |d| t > d)
            || sim.max_samples.map_or(false, |max| sample_count >= max)
        {
            break;
        }

        let (acc_x, acc_y, acc_z) = drive.accel_at(zero_order_hold(t, sim.accel_hz));
        let (gyro_x, gyro_y, gyro_z) = drive.gyro_at(zero_order_hold(t, sim.gyro_hz));
        let sample = InertialSample {
            acc_x,
            acc_y,
            acc_z,
            gyro_x,
            gyro_y,
            gyro_z,
            t_local: wrap_day(sim.start_local_secs + t),
        };

        if let Err(e) = feed.push(sample) {
            warn!("[imu] {}", e);
            break;
        }
        sample_count += 1;
        if sample_count % 100 == 0 {
            info!("[imu] {} samples", sample_count);
        }
    }

    info!("[imu] simulation stopped after {} samples", sample_count);
    feed.finish();
    sample_count
}

/// Simulated receiver: true positions on the drive, stamped in UTC.
pub async fn simulated_gnss_loop(
    mut feed: PositionFeed,
    shutdown: ShutdownHandle,
    sim: SimulationConfig,
) -> u64 {
    let drive = CircularDrive::new(sim.speed_mps, sim.radius_m);
    let aligner = ClockAligner::new(sim.utc_offset_hours);
    let projection = LocalProjection::new(sim.origin.0, sim.origin.1);
    let rate = sim.gnss_hz;
    let Some(period) = sample_period(rate) else {
        warn!("[gnss] unusable simulation rate {} Hz", rate);
        feed.finish();
        return 0;
    };
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

    let mut fix_count = 0u64;
    let mut tick = 0u64;
    let mut position = (0.0, 0.0);
    let mut last_t = 0.0;

    loop {
        ticker.tick().await;
        let t = tick as f64 / rate;
        tick += 1;
        if shutdown.is_requested() || sim.duration_secs.map_or(false, |d| t > d) {
            break;
        }

        position = drive.advance(position, last_t, t);
        last_t = t;

        let (lat, lon) = projection.to_geodetic(position.0, position.1);
        let utc = match aligner.utc_from_local_seconds(wrap_day(sim.start_local_secs + t)) {
            Ok(utc) => utc,
            Err(e) => {
                warn!("[gnss] {}", e);
                continue;
            }
        };
        let fix = GnssFix {
            longitude: lon,
            latitude: lat,
            utc,
            valid: true,
        };

        match feed.push_fix(&fix) {
            Ok(true) => {
                fix_count += 1;
                if fix_count % 100 == 0 {
                    info!("[gnss] {} fixes", fix_count);
                }
            }
            Ok(false) => {}
            Err(e) => warn!("[gnss] skipped fix at {}: {}", fix.utc, e),
        }
    }

    info!("[gnss] simulation stopped after {} fixes", fix_count);
    feed.finish();
    fix_count
}
