//! Shared data models for the device cloud and the orchestrator

mod device;
mod filter;
mod run;

pub use device::*;
pub use filter::*;
pub use run::*;
