use thiserror::Error;

use crate::core::ConnectionError;
use crate::options::OptionsError;

/// Errors returned synchronously by [`Client`](crate::Client) and
/// [`Computation`](crate::Computation) operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid client options: {0}")]
    Options(#[from] OptionsError),

    #[error("failed to send request: {0}")]
    Connection(#[from] ConnectionError),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("channel '{0}' is already in use by a running computation")]
    ChannelInUse(String),

    #[error("computation on channel '{0}' has no handle yet")]
    HandleUnknown(String),

    #[error("client is closed")]
    Closed,

    #[error("a client must be created inside a Tokio runtime")]
    NoRuntime,
}
