//! Testdroid Client Library
//!
//! Typed HTTP client for the Testdroid (Bitbar) device cloud. The client
//! implements [`devfarm_core::DeviceCloud`] so the orchestrator can drive it.
//!
//! # Example
//!
//! ```rust,no_run
//! use devfarm_client::{CloudConfig, TestdroidClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CloudConfig::new("https://cloud.testdroid.com")
//!         .with_credentials("user@example.com", "secret");
//!     let client = TestdroidClient::new(config)?;
//!
//!     for device in client.devices().await? {
//!         println!("{} {} online={}", device.id, device.display_name, device.online);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Testing
//!
//! The `testing` module serves a stub of the API over an in-memory cloud:
//!
//! ```rust,ignore
//! use devfarm_client::testing::{StubTestdroid, TestServer};
//!
//! let stub = StubTestdroid::new(Arc::new(FakeDeviceCloud::sample()));
//! let server = TestServer::start(stub.router()).await?;
//! let devices = server.client.devices().await?;
//! ```

mod client;
mod cloud;
mod config;
mod error;
pub mod testing;
mod types;

pub use client::{filter_expression, TestdroidClient};
pub use config::{CloudConfig, DEFAULT_OAUTH_CLIENT_ID};
pub use error::{Result, TestdroidError};
pub use types::*;
