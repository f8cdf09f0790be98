pub mod aggregator;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod payload;

pub use aggregator::{MetricsAggregator, ObservationRecord, Outcome, Summary};
pub use engine::orchestrator::{PoolStatus, Session, SessionReport};
pub use error::{FailureKind, SessionError};
pub use payload::{PayloadProvider, SyntheticPayloads};
