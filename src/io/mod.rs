//! Configuration input and run records

pub mod config;
pub mod run_record;

pub use config::{ConcurrencyMode, StackConfig};
pub use run_record::RunRecord;
