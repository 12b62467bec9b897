pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{AnomalyQuery, AnomalyStore, EntityActivity, EvaluationLedger, ObservationStore};
