// sensor_fusion.rs: Fusion engine for the planar estimator
//
// Owns the (state, covariance) pair and the two sample buffers. Producers
// write through feeds; the engine merges both buffers by local timestamp,
// predicts on every inertial sample and corrects on every fix.
//
// No async runtime in here: `run()` is a blocking loop meant for its own
// thread, `process_due()` is the single-step entry point for tests and replay.

use anyhow::Context;
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::buffer::{doorbell, Doorbell, DoorbellListener, SampleBuffer};
use crate::clock::ClockAligner;
use crate::error::{FusionError, FusionResult};
use crate::feed::{InertialFeed, PositionFeed};
use crate::filters::{MeasurementCorrector, Observation, PlanarState, StatePredictor};
use crate::types::{InertialSample, PositionSample, SourceKind, StateMat, StateVec, STATE_DIM};

// ─── Configuration ───────────────────────────────────────────────────────────

/// How the engine leaves `Uninitialized`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InitMode {
    /// Position from the first admitted fix, everything else zero
    FirstFix,
    /// `initialState`, stamped with the first due sample
    Configured,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferCapacity {
    pub inertial: usize,
    pub position: usize,
}

impl Default for BufferCapacity {
    fn default() -> Self {
        Self {
            inertial: 4096,
            position: 256,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FusionConfig {
    // ── Process noise ──
    pub accel_variance: f64,
    pub gyro_variance: f64,

    // ── Measurement noise ──
    pub gnss_x_variance: f64,
    pub gnss_y_variance: f64,
    pub accel_meas_variance: f64,
    pub gyro_meas_variance: f64,

    // ── Time alignment ──
    pub utc_offset_hours: i32,
    pub gnss_latency_secs: f64,

    // ── Buffers / loop ──
    pub buffer_capacity: BufferCapacity,
    pub idle_poll_ms: u64,

    // ── Initialization ──
    pub init_mode: InitMode,
    pub initial_state: PlanarState,
    /// Diagonal of the prior covariance, in state order
    pub initial_covariance: [f64; STATE_DIM],
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            accel_variance: 0.5,
            gyro_variance: 0.01,
            gnss_x_variance: 4.0,
            gnss_y_variance: 4.0,
            accel_meas_variance: 0.25,
            gyro_meas_variance: 0.0025,
            utc_offset_hours: 0,
            gnss_latency_secs: 0.2,
            buffer_capacity: BufferCapacity::default(),
            idle_poll_ms: 50,
            init_mode: InitMode::FirstFix,
            initial_state: PlanarState::default(),
            initial_covariance: [10.0, 10.0, 1.0, 1.0, 0.5, 0.1],
        }
    }
}

impl FusionConfig {
    /// Read a JSON config file; missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: FusionConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FusionResult<()> {
        let variances = [
            ("accelVariance", self.accel_variance),
            ("gyroVariance", self.gyro_variance),
            ("gnssXVariance", self.gnss_x_variance),
            ("gnssYVariance", self.gnss_y_variance),
            ("accelMeasVariance", self.accel_meas_variance),
            ("gyroMeasVariance", self.gyro_meas_variance),
            ("gnssLatencySecs", self.gnss_latency_secs),
        ];
        for (name, value) in variances {
            if !value.is_finite() || value < 0.0 {
                return Err(FusionError::InvalidConfig(format!(
                    "{} must be finite and non-negative, got {}",
                    name, value
                )));
            }
        }
        if let Some(bad) = self
            .initial_covariance
            .iter()
            .find(|v| !v.is_finite() || **v < 0.0)
        {
            return Err(FusionError::InvalidConfig(format!(
                "initialCovariance entries must be finite and non-negative, got {}",
                bad
            )));
        }
        if self.buffer_capacity.inertial == 0 || self.buffer_capacity.position == 0 {
            return Err(FusionError::InvalidConfig(
                "bufferCapacity entries must be at least 1".to_string(),
            ));
        }
        if !(-23..=23).contains(&self.utc_offset_hours) {
            return Err(FusionError::InvalidConfig(format!(
                "utcOffsetHours {} outside [-23, 23]",
                self.utc_offset_hours
            )));
        }
        Ok(())
    }

    fn prior_covariance(&self) -> StateMat {
        StateMat::from_diagonal(&StateVec::from(self.initial_covariance))
    }
}

// ─── Status / events ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineStatus {
    Uninitialized,
    Running,
    Stalled,
    Shutdown,
}

/// Which step produced a snapshot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Initialize,
    Predict,
    Correct,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FusionEvent {
    Initialized { t_local: f64, x: f64, y: f64 },
    Corrected { t_local: f64, innovation: [f64; 4], residual_m: f64 },
    StepSkipped { t_local: f64, source: SourceKind, error: FusionError },
    Stalled { t_local: Option<f64> },
    Resumed,
    SamplesEvicted { source: SourceKind, count: u64 },
    SourceEnded(SourceKind),
    Shutdown,
}

// ─── Published output ────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FusionSnapshot {
    pub state: PlanarState,
    pub covariance: [[f64; STATE_DIM]; STATE_DIM],
    pub covariance_trace: f64,
    pub t_local: f64,
    pub status: EngineStatus,
    pub step: StepKind,
    pub predicts: u64,
    pub corrections: u64,
    pub skipped: u64,
    /// Samples dropped by full buffers, both sources
    pub evicted: u64,
}

impl FusionSnapshot {
    pub fn covariance_matrix(&self) -> StateMat {
        StateMat::from_fn(|i, j| self.covariance[i][j])
    }
}

fn covariance_rows(covariance: &StateMat) -> [[f64; STATE_DIM]; STATE_DIM] {
    let mut rows = [[0.0; STATE_DIM]; STATE_DIM];
    for (i, row) in rows.iter_mut().enumerate() {
        for (j, value) in row.iter_mut().enumerate() {
            *value = covariance[(i, j)];
        }
    }
    rows
}

/// Read side of the published state. Cheap to clone, safe from any thread.
#[derive(Clone, Debug, Default)]
pub struct StateHandle {
    inner: Arc<RwLock<Option<FusionSnapshot>>>,
}

impl StateHandle {
    pub fn latest(&self) -> Option<FusionSnapshot> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, snapshot: FusionSnapshot) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }
}

/// Stop request shared by the engine and the producers
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    doorbell: Doorbell,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.doorbell.ring();
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepCounters {
    pub predicts: u64,
    pub corrections: u64,
    pub skipped: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineSummary {
    pub counters: StepCounters,
    pub evicted_inertial: u64,
    pub evicted_position: u64,
    pub final_status: EngineStatus,
    /// Set when a source ending drove the shutdown
    pub termination: Option<FusionError>,
    pub last: Option<FusionSnapshot>,
}

// ─── Engine ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
struct Estimate {
    state: StateVec,
    covariance: StateMat,
    t_local: f64,
}

enum Due {
    Inertial(InertialSample),
    Position(PositionSample),
}

pub struct FusionEngine {
    config: FusionConfig,
    predictor: StatePredictor,
    corrector: MeasurementCorrector,

    inertial: Arc<SampleBuffer<InertialSample>>,
    position: Arc<SampleBuffer<PositionSample>>,
    inertial_feed: Option<InertialFeed>,
    position_feed: Option<PositionFeed>,
    listener: DoorbellListener,
    shutdown: ShutdownHandle,

    status: EngineStatus,
    estimate: Option<Estimate>,
    last_inertial: Option<InertialSample>,
    counters: StepCounters,
    reported_evictions: (u64, u64),
    termination: Option<FusionError>,

    published: StateHandle,
    subscribers: Vec<Sender<FusionSnapshot>>,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> FusionResult<Self> {
        config.validate()?;

        let predictor = StatePredictor::new(config.accel_variance, config.gyro_variance);
        let corrector = MeasurementCorrector::from_variances(
            config.gnss_x_variance,
            config.gnss_y_variance,
            config.accel_meas_variance,
            config.gyro_meas_variance,
        );

        let inertial = Arc::new(SampleBuffer::new(
            SourceKind::Inertial,
            config.buffer_capacity.inertial,
        ));
        let position = Arc::new(SampleBuffer::new(
            SourceKind::Position,
            config.buffer_capacity.position,
        ));
        let (bell, listener) = doorbell();

        let inertial_feed = InertialFeed::new(Arc::clone(&inertial), bell.clone());
        let position_feed = PositionFeed::new(
            Arc::clone(&position),
            bell.clone(),
            ClockAligner::new(config.utc_offset_hours),
        );
        let shutdown = ShutdownHandle {
            flag: Arc::new(AtomicBool::new(false)),
            doorbell: bell,
        };

        info!(
            "Fusion engine ready: Q(a={}, w={}), R(x={}, y={}, a={}, w={}), utc{:+}h, init={:?}",
            config.accel_variance,
            config.gyro_variance,
            config.gnss_x_variance,
            config.gnss_y_variance,
            config.accel_meas_variance,
            config.gyro_meas_variance,
            config.utc_offset_hours,
            config.init_mode
        );

        Ok(Self {
            config,
            predictor,
            corrector,
            inertial,
            position,
            inertial_feed: Some(inertial_feed),
            position_feed: Some(position_feed),
            listener,
            shutdown,
            status: EngineStatus::Uninitialized,
            estimate: None,
            last_inertial: None,
            counters: StepCounters::default(),
            reported_evictions: (0, 0),
            termination: None,
            published: StateHandle::default(),
            subscribers: Vec::new(),
        })
    }

    /// The inertial producer handle. Handed out once.
    pub fn inertial_feed(&mut self) -> Option<InertialFeed> {
        self.inertial_feed.take()
    }

    /// The position producer handle. Handed out once.
    pub fn position_feed(&mut self) -> Option<PositionFeed> {
        self.position_feed.take()
    }

    pub fn state_handle(&self) -> StateHandle {
        self.published.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Receive every snapshot published from now on.
    pub fn subscribe(&mut self) -> Receiver<FusionSnapshot> {
        let (tx, rx) = channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn counters(&self) -> &StepCounters {
        &self.counters
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Seed the estimate explicitly. Covariance comes from the configured prior.
    pub fn initialize(&mut self, state: PlanarState, t_local: f64) -> FusionResult<()> {
        if !t_local.is_finite() {
            return Err(FusionError::InvalidTime(format!(
                "initialization time {}",
                t_local
            )));
        }
        let mut events = Vec::new();
        self.seed(state, t_local, &mut events);
        Ok(())
    }

    fn seed(&mut self, state: PlanarState, t_local: f64, events: &mut Vec<FusionEvent>) {
        let mut vector = state.to_vector();
        crate::filters::state::normalize_state(&mut vector);
        self.estimate = Some(Estimate {
            state: vector,
            covariance: self.config.prior_covariance(),
            t_local,
        });
        if self.status == EngineStatus::Uninitialized {
            self.status = EngineStatus::Running;
        }
        info!(
            "Initialized at t={:.3}: x={:.2} y={:.2} v={:.2} heading={:.1}°",
            t_local,
            vector[0],
            vector[1],
            vector[2],
            vector[4].to_degrees()
        );
        events.push(FusionEvent::Initialized {
            t_local,
            x: vector[0],
            y: vector[1],
        });
        self.publish(StepKind::Initialize);
    }

    /// Latest local time up to which both streams are considered complete.
    fn due_horizon(&self) -> Option<f64> {
        let newest_inertial = self.inertial.newest_seen();
        let newest_position = self.position.newest_seen();

        let newest_overall = match (newest_inertial, newest_position) {
            (Some(i), Some(p)) => i.max(p),
            (Some(t), None) | (None, Some(t)) => t,
            (None, None) => return None,
        };
        let latency_bound = newest_overall - self.config.gnss_latency_secs;

        Some(match (newest_inertial, newest_position) {
            (Some(i), Some(p)) => i.min(p).max(latency_bound),
            _ => latency_bound,
        })
    }

    fn source_ended(&self) -> bool {
        self.inertial.is_closed() || self.position.is_closed()
    }

    /// Process every sample that is due right now.
    pub fn process_due(&mut self) -> Vec<FusionEvent> {
        let mut events = Vec::new();
        if self.status == EngineStatus::Shutdown {
            return events;
        }

        if self.shutdown.is_requested() {
            info!("Shutdown requested");
            self.enter_shutdown(&mut events);
            return events;
        }

        self.collect_evictions(&mut events);

        let ended = self.source_ended();
        let horizon = if ended {
            f64::INFINITY
        } else {
            self.due_horizon().unwrap_or(f64::NEG_INFINITY)
        };

        let processed = self.drain_upto(horizon, &mut events);

        if self.shutdown.is_requested() {
            info!("Shutdown requested");
            self.enter_shutdown(&mut events);
            return events;
        }

        if ended {
            for buffer_kind in [SourceKind::Inertial, SourceKind::Position] {
                let closed = match buffer_kind {
                    SourceKind::Inertial => self.inertial.is_closed(),
                    SourceKind::Position => self.position.is_closed(),
                };
                if closed {
                    let err = FusionError::SourceTerminated(buffer_kind);
                    warn!("{}", err);
                    events.push(FusionEvent::SourceEnded(buffer_kind));
                    self.termination.get_or_insert(err);
                }
            }
            self.enter_shutdown(&mut events);
            return events;
        }

        self.update_activity(processed, &mut events);
        events
    }

    /// Process everything buffered, ignoring the due horizon.
    pub fn flush(&mut self) -> Vec<FusionEvent> {
        let mut events = Vec::new();
        if self.status == EngineStatus::Shutdown {
            return events;
        }
        self.collect_evictions(&mut events);
        let processed = self.drain_upto(f64::INFINITY, &mut events);
        if self.shutdown.is_requested() {
            self.enter_shutdown(&mut events);
            return events;
        }
        self.update_activity(processed, &mut events);
        events
    }

    /// Block on the buffers until shutdown or end-of-stream.
    pub fn run(&mut self) -> EngineSummary {
        let idle = Duration::from_millis(self.config.idle_poll_ms.max(1));
        info!("Fusion loop started (idle poll {:?})", idle);

        while self.status != EngineStatus::Shutdown {
            for event in self.process_due() {
                debug!("{:?}", event);
            }
            if self.status == EngineStatus::Shutdown {
                break;
            }
            self.listener.wait(idle);
        }

        let summary = self.summary();
        info!(
            "Fusion loop finished: {} predicts, {} corrections, {} skipped",
            summary.counters.predicts, summary.counters.corrections, summary.counters.skipped
        );
        summary
    }

    pub fn summary(&self) -> EngineSummary {
        EngineSummary {
            counters: self.counters.clone(),
            evicted_inertial: self.inertial.evicted(),
            evicted_position: self.position.evicted(),
            final_status: self.status,
            termination: self.termination.clone(),
            last: self.published.latest(),
        }
    }

    fn update_activity(&mut self, processed: usize, events: &mut Vec<FusionEvent>) {
        let idle = self.inertial.is_empty() && self.position.is_empty();
        if self.status == EngineStatus::Running && processed == 0 && idle {
            let t_local = self.estimate.map(|e| e.t_local);
            debug!("Buffers empty, stalled at t={:?}", t_local);
            self.status = EngineStatus::Stalled;
            events.push(FusionEvent::Stalled { t_local });
        }
    }

    fn resume(&mut self, events: &mut Vec<FusionEvent>) {
        if self.status == EngineStatus::Stalled {
            debug!("Data resumed");
            self.status = EngineStatus::Running;
            events.push(FusionEvent::Resumed);
        }
    }

    fn enter_shutdown(&mut self, events: &mut Vec<FusionEvent>) {
        self.status = EngineStatus::Shutdown;
        events.push(FusionEvent::Shutdown);
        info!("Fusion engine shut down");
    }

    fn collect_evictions(&mut self, events: &mut Vec<FusionEvent>) {
        let inertial = self.inertial.evicted();
        if inertial > self.reported_evictions.0 {
            let count = inertial - self.reported_evictions.0;
            warn!("Inertial buffer overflow: {} samples evicted", count);
            events.push(FusionEvent::SamplesEvicted {
                source: SourceKind::Inertial,
                count,
            });
            self.reported_evictions.0 = inertial;
        }
        let position = self.position.evicted();
        if position > self.reported_evictions.1 {
            let count = position - self.reported_evictions.1;
            warn!("Position buffer overflow: {} fixes evicted", count);
            events.push(FusionEvent::SamplesEvicted {
                source: SourceKind::Position,
                count,
            });
            self.reported_evictions.1 = position;
        }
    }

    /// Merge both buffers up to `horizon`, ties go inertial first.
    fn drain_upto(&mut self, horizon: f64, events: &mut Vec<FusionEvent>) -> usize {
        let mut inertial = self.inertial.pop_due(horizon).into_iter().peekable();
        let mut position = self.position.pop_due(horizon).into_iter().peekable();
        let mut processed = 0;

        loop {
            if self.shutdown.is_requested() {
                break;
            }
            let next = match (inertial.peek(), position.peek()) {
                (Some(i), Some(p)) if i.t_local <= p.t_local => inertial.next().map(Due::Inertial),
                (Some(_), Some(_)) => position.next().map(Due::Position),
                (Some(_), None) => inertial.next().map(Due::Inertial),
                (None, Some(_)) => position.next().map(Due::Position),
                (None, None) => None,
            };
            if next.is_some() {
                self.resume(events);
            }
            match next {
                Some(Due::Inertial(sample)) => self.step_inertial(sample, events),
                Some(Due::Position(fix)) => self.step_position(fix, events),
                None => break,
            }
            processed += 1;
        }
        processed
    }

    fn step_inertial(&mut self, sample: InertialSample, events: &mut Vec<FusionEvent>) {
        if self.estimate.is_none() && self.config.init_mode == InitMode::Configured {
            self.seed(self.config.initial_state, sample.t_local, events);
        }

        if let Some(estimate) = self.estimate {
            let elapsed = sample.t_local - estimate.t_local;
            if elapsed != 0.0 {
                match self
                    .predictor
                    .predict(&estimate.state, &estimate.covariance, elapsed)
                {
                    Ok((state, covariance)) => {
                        self.estimate = Some(Estimate {
                            state,
                            covariance,
                            t_local: sample.t_local,
                        });
                        self.counters.predicts += 1;
                        self.publish(StepKind::Predict);
                    }
                    Err(error) => self.skip(sample.t_local, SourceKind::Inertial, error, events),
                }
            }
        }

        let newer = self
            .last_inertial
            .as_ref()
            .map_or(true, |last| sample.t_local >= last.t_local);
        if newer {
            self.last_inertial = Some(sample);
        }
    }

    fn step_position(&mut self, fix: PositionSample, events: &mut Vec<FusionEvent>) {
        let estimate = match self.estimate {
            Some(estimate) => estimate,
            None => {
                let initial = match self.config.init_mode {
                    InitMode::FirstFix => PlanarState {
                        x: fix.x,
                        y: fix.y,
                        ..PlanarState::default()
                    },
                    InitMode::Configured => self.config.initial_state,
                };
                self.seed(initial, fix.t_local, events);
                if self.config.init_mode == InitMode::FirstFix {
                    return;
                }
                match self.estimate {
                    Some(estimate) => estimate,
                    None => return,
                }
            }
        };

        let elapsed = fix.t_local - estimate.t_local;
        let predicted = if elapsed > 0.0 {
            match self
                .predictor
                .predict(&estimate.state, &estimate.covariance, elapsed)
            {
                Ok((state, covariance)) => {
                    let predicted = Estimate {
                        state,
                        covariance,
                        t_local: fix.t_local,
                    };
                    self.estimate = Some(predicted);
                    self.counters.predicts += 1;
                    self.publish(StepKind::Predict);
                    predicted
                }
                Err(error) => {
                    self.skip(fix.t_local, SourceKind::Position, error, events);
                    return;
                }
            }
        } else if elapsed == 0.0 {
            estimate
        } else {
            self.skip(
                fix.t_local,
                SourceKind::Position,
                FusionError::InvalidInterval(elapsed),
                events,
            );
            return;
        };

        // Nearest preceding inertial reading; without one, a and w are not observed
        let (accel_magnitude, yaw_rate) = match &self.last_inertial {
            Some(imu) => (imu.planar_accel_magnitude(), imu.yaw_rate()),
            None => (predicted.state[3], predicted.state[5]),
        };
        let observation = Observation {
            x: fix.x,
            y: fix.y,
            accel_magnitude,
            yaw_rate,
        };

        match self
            .corrector
            .correct(&predicted.state, &predicted.covariance, &observation)
        {
            Ok(correction) => {
                let residual_m = correction.position_residual();
                let innovation = [
                    correction.innovation[0],
                    correction.innovation[1],
                    correction.innovation[2],
                    correction.innovation[3],
                ];
                self.estimate = Some(Estimate {
                    state: correction.state,
                    covariance: correction.covariance,
                    t_local: fix.t_local,
                });
                self.counters.corrections += 1;
                self.publish(StepKind::Correct);
                debug!(
                    "Corrected at t={:.3}: residual {:.2} m",
                    fix.t_local, residual_m
                );
                events.push(FusionEvent::Corrected {
                    t_local: fix.t_local,
                    innovation,
                    residual_m,
                });
            }
            Err(error) => self.skip(fix.t_local, SourceKind::Position, error, events),
        }
    }

    fn skip(
        &mut self,
        t_local: f64,
        source: SourceKind,
        error: FusionError,
        events: &mut Vec<FusionEvent>,
    ) {
        warn!("Skipped {} step at t={:.3}: {}", source, t_local, error);
        self.counters.skipped += 1;
        events.push(FusionEvent::StepSkipped {
            t_local,
            source,
            error,
        });
    }

    fn publish(&mut self, step: StepKind) {
        let Some(estimate) = self.estimate else {
            return;
        };
        let snapshot = FusionSnapshot {
            state: PlanarState::from_vector(&estimate.state),
            covariance: covariance_rows(&estimate.covariance),
            covariance_trace: estimate.covariance.trace(),
            t_local: estimate.t_local,
            status: self.status,
            step,
            predicts: self.counters.predicts,
            corrections: self.counters.corrections,
            skipped: self.counters.skipped,
            evicted: self.reported_evictions.0 + self.reported_evictions.1,
        };
        self.subscribers
            .retain(|tx| tx.send(snapshot.clone()).is_ok());
        self.published.publish(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UtcTimeOfDay;
    use approx::assert_abs_diff_eq;

    fn straight_line_config() -> FusionConfig {
        FusionConfig {
            accel_variance: 0.01,
            gyro_variance: 0.001,
            gnss_x_variance: 0.5,
            gnss_y_variance: 0.5,
            gnss_latency_secs: 0.0,
            init_mode: InitMode::Configured,
            initial_state: PlanarState {
                v: 1.0,
                ..PlanarState::default()
            },
            initial_covariance: [0.1; STATE_DIM],
            ..FusionConfig::default()
        }
    }

    /// UTC stamp at `secs` after midnight (zero offset)
    fn utc_at(secs: f64) -> UtcTimeOfDay {
        let whole = secs.floor() as u32;
        let micros = ((secs - secs.floor()) * 1e6).round() as u32;
        UtcTimeOfDay::new((whole / 3600) as i32, (whole / 60) % 60, whole % 60, micros)
    }

    /// Engine seeded at t=0 plus ten still inertial samples at 0.1 s spacing
    fn dead_reckoned(config: FusionConfig) -> (FusionEngine, InertialFeed, PositionFeed) {
        let mut engine = FusionEngine::new(config).unwrap();
        let mut imu = engine.inertial_feed().unwrap();
        let gnss = engine.position_feed().unwrap();
        let initial = engine.config().initial_state;
        engine.initialize(initial, 0.0).unwrap();
        for k in 1..=10 {
            imu.push(InertialSample::planar(0.0, 0.0, 0.0, k as f64 * 0.1))
                .unwrap();
        }
        (engine, imu, gnss)
    }

    #[test]
    fn test_config_defaults_validate() {
        assert!(FusionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let mut config = FusionConfig {
            accel_variance: -1.0,
            ..FusionConfig::default()
        };
        assert!(matches!(config.validate(), Err(FusionError::InvalidConfig(_))));

        config = FusionConfig {
            utc_offset_hours: 24,
            ..FusionConfig::default()
        };
        assert!(config.validate().is_err());

        config = FusionConfig {
            buffer_capacity: BufferCapacity {
                inertial: 0,
                position: 8,
            },
            ..FusionConfig::default()
        };
        assert!(FusionEngine::new(config).is_err());
    }

    #[test]
    fn test_config_camel_case_partial_json() {
        let json = r#"{
            "accelVariance": 0.3,
            "utcOffsetHours": 8,
            "bufferCapacity": {"inertial": 10, "position": 2},
            "initMode": "configured",
            "initialState": {"x": 1.0, "y": 2.0, "v": 0.0, "a": 0.0, "theta": 0.0, "w": 0.0}
        }"#;
        let config: FusionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.accel_variance, 0.3);
        assert_eq!(config.utc_offset_hours, 8);
        assert_eq!(config.buffer_capacity.position, 2);
        assert_eq!(config.init_mode, InitMode::Configured);
        assert_eq!(config.initial_state.y, 2.0);
        assert_eq!(config.gyro_variance, FusionConfig::default().gyro_variance);
    }

    #[test]
    fn test_dead_reckoning_ten_samples() {
        let (mut engine, _imu, _gnss) = dead_reckoned(straight_line_config());
        let rx = engine.subscribe();

        engine.process_due();

        let snapshot = engine.state_handle().latest().unwrap();
        assert_abs_diff_eq!(snapshot.state.x, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(snapshot.state.y, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(snapshot.t_local, 1.0, epsilon = 1e-9);
        assert_eq!(engine.counters().predicts, 10);

        let traces: Vec<f64> = rx.try_iter().map(|s| s.covariance_trace).collect();
        assert_eq!(traces.len(), 10);
        assert!(traces.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn test_fix_after_dead_reckoning_pulls_toward_fix() {
        let (mut engine, _imu, mut gnss) = dead_reckoned(straight_line_config());
        engine.process_due();
        let before = engine.state_handle().latest().unwrap();

        gnss.push_planar(1.2, 0.05, &utc_at(1.0)).unwrap();
        let events = engine.process_due();

        assert!(events
            .iter()
            .any(|e| matches!(e, FusionEvent::Corrected { .. })));
        let after = engine.state_handle().latest().unwrap();
        assert_eq!(after.step, StepKind::Correct);
        assert!(after.state.x > before.state.x && after.state.x < 1.2);
        assert!(after.state.y > 0.0);
        assert!(after.covariance[0][0] < before.covariance[0][0]);
        // Zero elapsed: corrected without another predict
        assert_eq!(engine.counters().predicts, 10);
        assert_eq!(engine.counters().corrections, 1);
    }

    #[test]
    fn test_singular_innovation_keeps_prediction() {
        let config = FusionConfig {
            accel_variance: 0.0,
            gyro_variance: 0.0,
            gnss_x_variance: 0.0,
            gnss_y_variance: 0.0,
            accel_meas_variance: 0.0,
            gyro_meas_variance: 0.0,
            initial_covariance: [0.0; STATE_DIM],
            ..straight_line_config()
        };
        let (mut engine, _imu, mut gnss) = dead_reckoned(config);
        engine.process_due();

        gnss.push_planar(1.2, 0.05, &utc_at(1.05)).unwrap();
        let events = engine.process_due();

        assert!(events.iter().any(|e| matches!(
            e,
            FusionEvent::StepSkipped {
                error: FusionError::SingularInnovation,
                ..
            }
        )));
        let published = engine.state_handle().latest().unwrap();
        assert_eq!(published.step, StepKind::Predict);
        assert_abs_diff_eq!(published.state.x, 1.05, epsilon = 1e-9);
        assert_abs_diff_eq!(published.t_local, 1.05, epsilon = 1e-9);
        assert_eq!(engine.counters().skipped, 1);
        assert_eq!(engine.status(), EngineStatus::Running);
    }

    #[test]
    fn test_first_fix_initializes() {
        let mut engine = FusionEngine::new(FusionConfig {
            gnss_latency_secs: 0.0,
            ..FusionConfig::default()
        })
        .unwrap();
        let mut imu = engine.inertial_feed().unwrap();
        let mut gnss = engine.position_feed().unwrap();

        imu.push(InertialSample::planar(0.0, 0.0, 0.0, 0.5)).unwrap();
        engine.process_due();
        assert_eq!(engine.status(), EngineStatus::Uninitialized);
        assert!(engine.state_handle().latest().is_none());

        assert!(gnss
            .push_fix(&crate::types::GnssFix {
                longitude: 114.2,
                latitude: 22.3,
                utc: utc_at(1.0),
                valid: true,
            })
            .unwrap());
        let events = engine.process_due();

        assert!(matches!(events[0], FusionEvent::Initialized { .. }));
        assert_eq!(engine.status(), EngineStatus::Running);
        let snapshot = engine.state_handle().latest().unwrap();
        assert_eq!(snapshot.step, StepKind::Initialize);
        assert_abs_diff_eq!(snapshot.state.x, 0.0, epsilon = 1e-9);
        assert_eq!(snapshot.covariance[0][0], 10.0);
    }

    #[test]
    fn test_late_sample_skipped() {
        let (mut engine, mut imu, _gnss) = dead_reckoned(straight_line_config());
        engine.process_due();
        let before = engine.state_handle().latest().unwrap();

        imu.push(InertialSample::planar(0.0, 0.0, 0.0, 0.95)).unwrap();
        let events = engine.flush();

        assert!(events.iter().any(|e| matches!(
            e,
            FusionEvent::StepSkipped {
                error: FusionError::InvalidInterval(_),
                ..
            }
        )));
        assert_eq!(engine.state_handle().latest().unwrap(), before);
    }

    #[test]
    fn test_stall_and_resume() {
        let (mut engine, mut imu, _gnss) = dead_reckoned(straight_line_config());
        engine.process_due();
        let events = engine.process_due();
        assert!(events
            .iter()
            .any(|e| matches!(e, FusionEvent::Stalled { .. })));
        assert_eq!(engine.status(), EngineStatus::Stalled);

        let snapshots = engine.subscribe();
        imu.push(InertialSample::planar(0.0, 0.0, 0.0, 1.1)).unwrap();
        let events = engine.process_due();
        assert!(events.contains(&FusionEvent::Resumed));
        assert_eq!(engine.status(), EngineStatus::Running);

        // Steps taken while resuming already report the running engine
        let published: Vec<_> = snapshots.try_iter().collect();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].status, EngineStatus::Running);
    }

    #[test]
    fn test_shutdown_observed_between_samples() {
        const TOTAL: usize = 50_000;
        let config = FusionConfig {
            buffer_capacity: BufferCapacity {
                inertial: TOTAL,
                position: 16,
            },
            ..straight_line_config()
        };
        let mut engine = FusionEngine::new(config).unwrap();
        let mut imu = engine.inertial_feed().unwrap();
        let _gnss = engine.position_feed().unwrap();
        for k in 0..TOTAL {
            imu.push(InertialSample::planar(0.0, 0.0, 0.0, k as f64 * 0.001))
                .unwrap();
        }

        let snapshots = engine.subscribe();
        let shutdown = engine.shutdown_handle();
        let stopper = std::thread::spawn(move || {
            if snapshots.recv().is_ok() {
                shutdown.request();
            }
        });

        // Latency 0 with no fix: the whole batch is due at once
        let events = engine.process_due();
        stopper.join().unwrap();

        assert!(events.contains(&FusionEvent::Shutdown));
        assert_eq!(engine.status(), EngineStatus::Shutdown);
        assert!(
            (engine.counters().predicts as usize) < TOTAL - 2,
            "drained {} samples after the stop request",
            engine.counters().predicts
        );
    }

    #[test]
    fn test_latency_window_holds_back_samples() {
        let config = FusionConfig {
            gnss_latency_secs: 0.35,
            ..straight_line_config()
        };
        let (mut engine, _imu, _gnss) = dead_reckoned(config);
        engine.process_due();
        // No fix yet: due up to 1.0 - 0.35
        let snapshot = engine.state_handle().latest().unwrap();
        assert_abs_diff_eq!(snapshot.t_local, 0.6, epsilon = 1e-9);
        assert_eq!(engine.counters().predicts, 6);
    }

    #[test]
    fn test_ties_process_inertial_first() {
        let (mut engine, mut imu, mut gnss) = dead_reckoned(straight_line_config());
        engine.process_due();

        let stamp = utc_at(1.1);
        let t_fix = ClockAligner::new(0).to_local_seconds(&stamp).unwrap();
        gnss.push_planar(1.1, 0.0, &stamp).unwrap();
        imu.push(InertialSample::planar(0.5, 0.0, 0.2, t_fix)).unwrap();
        let events = engine.process_due();

        let corrected = events.iter().find_map(|e| match e {
            FusionEvent::Corrected { innovation, .. } => Some(*innovation),
            _ => None,
        });
        // The fix sees the tied reading as nearest preceding
        let innovation = corrected.unwrap();
        assert!(innovation[2] > 0.4);
        assert_eq!(engine.counters().predicts, 11);
    }

    #[test]
    fn test_source_end_flushes_then_shuts_down() {
        let config = FusionConfig {
            gnss_latency_secs: 5.0,
            ..straight_line_config()
        };
        let (mut engine, imu, _gnss) = dead_reckoned(config);
        imu.finish();

        let summary = engine.run();

        assert_eq!(summary.final_status, EngineStatus::Shutdown);
        assert_eq!(summary.counters.predicts, 10);
        assert_eq!(
            summary.termination,
            Some(FusionError::SourceTerminated(SourceKind::Inertial))
        );
        assert_abs_diff_eq!(summary.last.unwrap().state.x, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_shutdown_request_stops_run_loop() {
        let mut engine = FusionEngine::new(FusionConfig {
            idle_poll_ms: 5,
            ..FusionConfig::default()
        })
        .unwrap();
        let _imu = engine.inertial_feed().unwrap();
        let _gnss = engine.position_feed().unwrap();
        let shutdown = engine.shutdown_handle();

        let worker = std::thread::spawn(move || engine.run());
        std::thread::sleep(Duration::from_millis(20));
        shutdown.request();
        let summary = worker.join().unwrap();

        assert_eq!(summary.final_status, EngineStatus::Shutdown);
        assert!(summary.termination.is_none());
        assert!(summary.last.is_none());
    }

    #[test]
    fn test_eviction_reported() {
        let config = FusionConfig {
            buffer_capacity: BufferCapacity {
                inertial: 4,
                position: 4,
            },
            ..straight_line_config()
        };
        let (mut engine, _imu, _gnss) = dead_reckoned(config);
        let events = engine.process_due();
        assert!(events.contains(&FusionEvent::SamplesEvicted {
            source: SourceKind::Inertial,
            count: 6,
        }));
        assert_eq!(engine.summary().evicted_inertial, 6);
    }
}
