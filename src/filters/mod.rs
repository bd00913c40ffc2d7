pub mod correction;
pub mod kinematic;
pub mod state;

pub use correction::{Correction, MeasurementCorrector, Observation};
pub use kinematic::StatePredictor;
pub use state::{wrap_angle, PlanarState};
