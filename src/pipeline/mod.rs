// =============================================================================
// Stage pipeline: stages, partition workers and the runner that supervises them
// =============================================================================

pub mod runner;
pub mod stage;
pub mod worker;

pub use runner::Runner;
pub use worker::WorkerSettings;
