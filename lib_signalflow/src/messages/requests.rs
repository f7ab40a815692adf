//! # Outbound Requests
//!
//! JSON requests sent to the SignalFlow endpoint. Each is tagged with a `type`
//! field when serialized through [`Request`]; unset optional fields are left
//! out of the payload.

use std::time::Duration;

use serde::Serialize;

/// Authenticates the connection. Sent automatically after every connect.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateRequest {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Starts a computation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    /// The SignalFlow program text, e.g. `data('cpu.utilization').publish()`.
    pub program: String,
    /// Channel the results are routed on. Generated by the client when `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Start of the time range, in epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    /// End of the time range, in epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<i64>,
    /// Requested resolution in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<u64>,
    /// Maximum wait for late data, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub immediate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl ExecuteRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), ..Default::default() }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_start_ms(mut self, start_ms: i64) -> Self {
        self.start = Some(start_ms);
        self
    }

    pub fn with_stop_ms(mut self, stop_ms: i64) -> Self {
        self.stop = Some(stop_ms);
        self
    }

    pub fn with_resolution(mut self, resolution: Duration) -> Self {
        self.resolution = Some(resolution.as_millis() as u64);
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay.as_millis() as u64);
        self
    }

    pub fn with_immediate(mut self, immediate: bool) -> Self {
        self.immediate = Some(immediate);
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }
}

/// Stops a running computation by handle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopRequest {
    pub handle: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StopRequest {
    pub fn new(handle: impl Into<String>) -> Self {
        Self { handle: handle.into(), reason: None }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Detaches from a computation's channel, leaving the server-side job alone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetachRequest {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DetachRequest {
    pub fn new(channel: impl Into<String>) -> Self {
        Self { channel: channel.into(), reason: None }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// A request as it goes on the wire, with its `type` tag.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Request<'a> {
    Authenticate(&'a AuthenticateRequest),
    Execute(&'a ExecuteRequest),
    Stop(&'a StopRequest),
    Detach(&'a DetachRequest),
}

impl Request<'_> {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
