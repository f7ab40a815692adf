//! # Client Options
//!
//! Everything a [`Client`](crate::Client) can be configured with. Setters only
//! record values; [`ClientOptions::validate`] checks them when the client is
//! built, so a bad option never yields a half-constructed client.

use std::time::Duration;

use thiserror::Error;
use url::Url;

/// Realm used when neither a realm nor a stream URL is configured.
pub const DEFAULT_REALM: &str = "us0";
/// Path of the SignalFlow WebSocket endpoint.
pub const STREAM_PATH: &str = "/v2/signalflow/connect";

pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionsError {
    #[error("invalid stream URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("stream URL must use ws or wss, got '{0}'")]
    UnsupportedScheme(String),

    #[error("realm must not be empty")]
    EmptyRealm,

    #[error("{0} must be greater than zero")]
    NonPositiveDuration(&'static str),
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub(crate) stream_url: Option<String>,
    pub(crate) realm: Option<String>,
    pub(crate) access_token: String,
    pub(crate) user_agent: String,
    pub(crate) metadata_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) reconnect_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            stream_url: None,
            realm: None,
            access_token: String::new(),
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            metadata_timeout: DEFAULT_METADATA_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full endpoint URL. Takes precedence over [`Self::with_realm`]. An empty
    /// path is replaced by the standard SignalFlow path.
    pub fn with_stream_url(mut self, url: impl Into<String>) -> Self {
        self.stream_url = Some(url.into());
        self
    }

    /// Realm name, e.g. `us1`, used to derive the endpoint URL.
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = token.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Default wait of computation metadata accessors.
    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    /// Longest silence tolerated on the socket before reconnecting.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Pause before each reconnect attempt.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn metadata_timeout(&self) -> Duration {
        self.metadata_timeout
    }

    /// Checks every option and resolves the endpoint URL.
    pub fn validate(&self) -> Result<Url, OptionsError> {
        for (name, value) in [
            ("metadata timeout", self.metadata_timeout),
            ("read timeout", self.read_timeout),
            ("write timeout", self.write_timeout),
            ("reconnect delay", self.reconnect_delay),
        ] {
            if value.is_zero() {
                return Err(OptionsError::NonPositiveDuration(name));
            }
        }
        self.stream_url()
    }

    fn stream_url(&self) -> Result<Url, OptionsError> {
        let raw = match (&self.stream_url, &self.realm) {
            (Some(url), _) => url.clone(),
            (None, Some(realm)) => {
                let realm = realm.trim();
                if realm.is_empty() {
                    return Err(OptionsError::EmptyRealm);
                }
                format!("wss://stream.{}.signalfx.com", realm)
            }
            (None, None) => format!("wss://stream.{}.signalfx.com", DEFAULT_REALM),
        };

        let mut url = Url::parse(&raw).map_err(|e| OptionsError::InvalidUrl {
            url: raw.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(OptionsError::UnsupportedScheme(url.scheme().to_string()));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(OptionsError::InvalidUrl { url: raw, reason: "missing host".to_string() });
        }
        if url.path().is_empty() || url.path() == "/" {
            url.set_path(STREAM_PATH);
        }
        Ok(url)
    }
}
