//! # lib_signalflow
//!
//! A streaming client for SignalFlow analytics over a single, self-healing
//! WebSocket connection.
//!
//! ```no_run
//! use lib_signalflow::{Client, ClientOptions, ExecuteRequest};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(ClientOptions::new().with_realm("us1").with_access_token("TOKEN"))?;
//! let computation = client.execute(ExecuteRequest::new("data('cpu.utilization').publish()")).await?;
//!
//! println!("resolution: {:?}", computation.resolution().await);
//! if let Some(mut data) = computation.data() {
//!     while let Some(batch) = data.recv().await {
//!         println!("{} points at {}", batch.payloads.len(), batch.timestamp_ms);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod computation;
pub mod core;
pub mod error;
#[cfg(feature = "loggers")]
pub mod loggers;
pub mod messages;
pub mod options;
pub mod relay;

pub use client::Client;
pub use computation::{Computation, ComputationError, JobError};
pub use error::ClientError;
pub use messages::{
    DataMessage, DataPayload, DataValue, DetachRequest, EventMessage, ExecuteRequest, ExpiredTsidMessage, Message,
    MetadataMessage, StopRequest, Tsid,
};
pub use options::{ClientOptions, OptionsError};
pub use relay::Relay;
