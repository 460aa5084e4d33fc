//! devfarm-core - Device acquisition orchestrator for remote device farms
//!
//! Hands out exclusive, proxied access to a handset running a requested
//! build. If no such handset is free, one is flashed through the farm's job
//! runner first. The farm itself sits behind the [`DeviceCloud`] trait.

pub mod cloud;
pub mod config;
pub mod error;
pub mod fake;
pub mod models;
pub mod properties;
pub mod selection;
pub mod signer;

mod finder;
mod flash;
mod manager;
mod session;

pub use cloud::DeviceCloud;
pub use config::{
    FlashJobConfig, OrchestratorConfig, OrchestratorConfigBuilder, SearchConfig, SessionConfig,
    SigningConfig,
};
pub use error::{FarmError, FarmResult};
pub use fake::{FakeDevice, FakeDeviceCloud, FlashBehavior, PollFailure, SessionBehavior};
pub use manager::DeviceManager;
pub use models::*;
pub use properties::{normalize_properties, DeviceProperties, PropertyValue};
pub use selection::SelectionStrategy;
pub use signer::{sign_url, sign_url_at, strip_signature, verify_signed_url};
