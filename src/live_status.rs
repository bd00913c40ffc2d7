use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::sensor_fusion::{EngineStatus, FusionSnapshot};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub status: EngineStatus,
    pub predicts: u64,
    pub corrections: u64,
    pub skipped: u64,
    pub evicted_samples: u64,
    pub uptime_seconds: u64,
    // Latest estimate
    pub t_local: f64,
    pub x: f64,
    pub y: f64,
    pub speed: f64,
    pub accel: f64,
    pub heading_deg: f64,
    pub yaw_rate: f64,
    pub covariance_trace: f64,
}

impl LiveStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            status: EngineStatus::Uninitialized,
            predicts: 0,
            corrections: 0,
            skipped: 0,
            evicted_samples: 0,
            uptime_seconds: 0,
            t_local: 0.0,
            x: 0.0,
            y: 0.0,
            speed: 0.0,
            accel: 0.0,
            heading_deg: 0.0,
            yaw_rate: 0.0,
            covariance_trace: 0.0,
        }
    }

    /// Copy the estimate fields out of a published snapshot.
    pub fn apply_snapshot(&mut self, snapshot: &FusionSnapshot) {
        self.status = snapshot.status;
        self.predicts = snapshot.predicts;
        self.corrections = snapshot.corrections;
        self.skipped = snapshot.skipped;
        self.evicted_samples = snapshot.evicted;
        self.t_local = snapshot.t_local;
        self.x = snapshot.state.x;
        self.y = snapshot.state.y;
        self.speed = snapshot.state.v;
        self.accel = snapshot.state.a;
        self.heading_deg = snapshot.state.heading_deg();
        self.yaw_rate = snapshot.state.w;
        self.covariance_trace = snapshot.covariance_trace;
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl Default for LiveStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
