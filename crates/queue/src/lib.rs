pub mod cache;
pub mod codec;
pub mod error;
pub mod memory;
pub mod pg_cache;
pub mod queue;
pub mod sqs;

pub use cache::{ClaimKey, InMemoryResultCache, ResultCache};
pub use codec::{decode, encode, TaskPayload};
pub use error::QueueError;
pub use memory::InMemoryTaskQueue;
pub use pg_cache::PgResultCache;
pub use queue::{Delivery, QueueHealth, SubmitOutcome, TaskQueue};
pub use sqs::SqsTaskQueue;
