pub mod flood;
pub mod orchestrator;
pub mod pool;
pub mod probe;
pub mod target;
pub mod weights;
