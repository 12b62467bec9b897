pub mod anomaly;
pub mod clock;
pub mod config;
pub mod error;
pub mod geometry;
pub mod observation;
pub mod series;
pub mod task;

pub use anomaly::{AnomalyDirection, AnomalyRecord};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::Config;
pub use error::*;
pub use geometry::Geometry;
pub use observation::Observation;
pub use series::{CellId, Series, SeriesKey};
pub use task::*;
