pub mod backends;
pub mod forecast;
pub mod metrics;
pub mod partition;
pub mod pipeline;
pub mod scheduler;
pub mod scorer;
pub mod worker;

pub use backends::Backends;
pub use forecast::{ForecastEngine, ForecastStrategy, ForecastWindow};
pub use metrics::{SchedulerMetrics, WorkerMetrics};
pub use partition::{partition, Partition, PartitionConfig};
pub use pipeline::Evaluator;
pub use scheduler::{RetryPolicy, Scheduler, SweepProgress, SweepReport, SystemStatus};
pub use scorer::AnomalyScorer;
pub use worker::{WorkerDisposition, WorkerPool};
