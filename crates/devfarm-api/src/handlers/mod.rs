//! HTTP request handlers for the devfarm API
//!
//! Handlers only translate between HTTP and the `DeviceManager`; the
//! orchestration itself lives in devfarm-core.

pub mod devices;
pub mod sessions;
