//! Producer-side handles onto the engine's sample buffers.
//!
//! Each feed is the single writer of one buffer. Dropping a feed (or calling
//! `finish`) marks that source's end-of-stream.

use log::debug;
use std::sync::Arc;

use crate::buffer::{Doorbell, SampleBuffer};
use crate::clock::ClockAligner;
use crate::error::{FusionError, FusionResult};
use crate::geodesy::LocalProjection;
use crate::types::{GnssFix, InertialSample, PositionSample, UtcTimeOfDay};

pub struct InertialFeed {
    buffer: Arc<SampleBuffer<InertialSample>>,
    doorbell: Doorbell,
    pushed: u64,
}

impl InertialFeed {
    pub(crate) fn new(buffer: Arc<SampleBuffer<InertialSample>>, doorbell: Doorbell) -> Self {
        Self {
            buffer,
            doorbell,
            pushed: 0,
        }
    }

    /// Buffer one reading. Never blocks; a full buffer sheds its oldest entry.
    pub fn push(&mut self, sample: InertialSample) -> FusionResult<()> {
        if !sample.t_local.is_finite() {
            return Err(FusionError::InvalidTime(format!(
                "inertial timestamp {}",
                sample.t_local
            )));
        }
        if let Some(dropped) = self.buffer.push(sample) {
            debug!("inertial buffer full, dropped t={:.3}", dropped.t_local);
        }
        self.pushed += 1;
        self.doorbell.ring();
        Ok(())
    }

    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    /// Signal end-of-stream.
    pub fn finish(self) {}
}

impl Drop for InertialFeed {
    fn drop(&mut self) {
        self.buffer.close();
        self.doorbell.ring();
    }
}

pub struct PositionFeed {
    buffer: Arc<SampleBuffer<PositionSample>>,
    doorbell: Doorbell,
    aligner: ClockAligner,
    projection: Option<LocalProjection>,
    pushed: u64,
    discarded: u64,
}

impl PositionFeed {
    pub(crate) fn new(
        buffer: Arc<SampleBuffer<PositionSample>>,
        doorbell: Doorbell,
        aligner: ClockAligner,
    ) -> Self {
        Self {
            buffer,
            doorbell,
            aligner,
            projection: None,
            pushed: 0,
            discarded: 0,
        }
    }

    /// Pin the planar origin instead of anchoring it on the first fix.
    pub fn with_origin(mut self, lat: f64, lon: f64) -> Self {
        self.projection = Some(LocalProjection::new(lat.abs(), lon.abs()));
        self
    }

    /// Project, time-align and buffer a raw receiver fix.
    ///
    /// Returns `Ok(false)` for "no fix" sentinels and fixes the receiver
    /// flagged invalid; those never reach the buffer.
    pub fn push_fix(&mut self, fix: &GnssFix) -> FusionResult<bool> {
        if !fix.is_usable() {
            self.discarded += 1;
            return Ok(false);
        }

        // Hemispheres are not tracked, only magnitudes
        let lat = fix.latitude.abs();
        let lon = fix.longitude.abs();

        let t_local = self.aligner.to_local_seconds(&fix.utc)?;
        let projection = *self
            .projection
            .get_or_insert_with(|| LocalProjection::new(lat, lon));
        let (x, y) = projection.to_local(lat, lon);

        self.push_sample(PositionSample { x, y, t_local });
        Ok(true)
    }

    /// Buffer a fix that is already in the planar frame.
    pub fn push_planar(&mut self, x: f64, y: f64, utc: &UtcTimeOfDay) -> FusionResult<()> {
        let t_local = self.aligner.to_local_seconds(utc)?;
        self.push_sample(PositionSample { x, y, t_local });
        Ok(())
    }

    fn push_sample(&mut self, sample: PositionSample) {
        if let Some(dropped) = self.buffer.push(sample) {
            debug!("position buffer full, dropped t={:.3}", dropped.t_local);
        }
        self.pushed += 1;
        self.doorbell.ring();
    }

    pub fn projection(&self) -> Option<LocalProjection> {
        self.projection
    }

    pub fn aligner(&self) -> ClockAligner {
        self.aligner
    }

    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    /// Sentinel or invalid fixes rejected so far
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Signal end-of-stream.
    pub fn finish(self) {}
}

impl Drop for PositionFeed {
    fn drop(&mut self) {
        self.buffer.close();
        self.doorbell.ring();
    }
}
