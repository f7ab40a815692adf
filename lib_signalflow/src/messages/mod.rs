//! # SignalFlow Wire Messages
//!
//! This module holds the closed set of messages a SignalFlow stream can deliver
//! and the pure decoder that turns raw WebSocket frames into them. Nothing here
//! performs I/O or keeps state between frames.
//!
//! ## Contained Modules:
//! - **`json`**: decoding of text frames (control, info, metadata, event, error
//!   and JSON-encoded data messages).
//! - **`binary`**: decoding of the fixed-layout binary data frames, including
//!   gzip-compressed ones.
//! - **`requests`**: the outbound request shapes (authenticate, execute, stop,
//!   detach).

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Decoding of the binary data frame layout.
pub mod binary;
/// Decoding of JSON text frames.
pub mod json;
/// Outbound request messages.
pub mod requests;

pub use requests::{AuthenticateRequest, DetachRequest, ExecuteRequest, StopRequest};

/// Errors produced while turning a frame into a [`Message`].
///
/// A decode error only ever concerns the one frame it was raised for; callers
/// log it and move on to the next frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("binary frame too short: need {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("JSON-encoded binary frames are not supported")]
    JsonInBinary,

    #[error("unsupported binary message type {0}")]
    UnsupportedBinaryType(u8),

    #[error("failed to inflate gzip payload: {0}")]
    Gzip(#[source] std::io::Error),

    #[error("gzip payload inflates past {limit} bytes")]
    InflatedTooLarge { limit: usize },

    #[error("binary data frame declares {declared} records but only {available} bytes follow the sub-header")]
    Truncated { declared: usize, available: usize },

    #[error("invalid time series id '{0}'")]
    InvalidTsid(String),
}

/// Decodes one WebSocket frame.
///
/// `is_text` selects the JSON decoder; everything else goes through the binary
/// data frame decoder.
pub fn parse_message(frame: &[u8], is_text: bool) -> Result<Message, DecodeError> {
    if is_text {
        json::parse_text_message(frame)
    } else {
        binary::parse_binary_message(frame)
    }
}

/// # Time Series Id
///
/// Identifies one time series within a computation's output. JSON frames carry
/// it as the unpadded URL-safe base64 encoding of its eight big-endian bytes,
/// binary frames carry the raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tsid(pub u64);

impl Tsid {
    /// Builds an id from the eight big-endian bytes found in binary records.
    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Tsid(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for Tsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0.to_be_bytes()))
    }
}

impl FromStr for Tsid {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s.trim_end_matches('='))
            .map_err(|_| DecodeError::InvalidTsid(s.to_string()))?;
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| DecodeError::InvalidTsid(s.to_string()))?;
        Ok(Tsid::from_be_bytes(raw))
    }
}

impl Serialize for Tsid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Tsid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// # SignalFlow Message
///
/// Every frame decodes to exactly one of these. All variants except
/// [`Message::Authenticated`] carry a channel name; an empty name means the
/// message is connection-global.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Acknowledgement of the authenticate request.
    Authenticated(AuthenticatedMessage),
    /// Periodic keep-alive control message.
    KeepAlive(ControlMessage),
    /// The computation was started and assigned a handle.
    JobStart(JobStartMessage),
    /// Progress report while the computation backfills.
    JobProgress(JobProgressMessage),
    /// The computation finished normally; nothing further will arrive.
    EndOfChannel(ControlMessage),
    /// The computation was aborted by the server.
    ChannelAbort(ChannelAbortMessage),
    /// Any other control event.
    Control(ControlMessage),
    /// Informational message about the computation (resolution, lag, ...).
    Info(InfoMessage),
    /// Properties of one output time series.
    Metadata(MetadataMessage),
    /// A time series left the computation's output.
    ExpiredTsid(ExpiredTsidMessage),
    /// A detector event.
    Event(EventMessage),
    /// The server reported an error.
    Error(ErrorMessage),
    /// One batch of data points sharing a timestamp.
    Data(DataMessage),
}

impl Message {
    /// The channel this message is addressed to; empty for global messages.
    pub fn channel(&self) -> &str {
        match self {
            Message::Authenticated(_) => "",
            Message::KeepAlive(m) | Message::EndOfChannel(m) | Message::Control(m) => &m.channel,
            Message::JobStart(m) => &m.channel,
            Message::JobProgress(m) => &m.channel,
            Message::ChannelAbort(m) => &m.channel,
            Message::Info(m) => &m.channel,
            Message::Metadata(m) => &m.channel,
            Message::ExpiredTsid(m) => &m.channel,
            Message::Event(m) => &m.channel,
            Message::Error(m) => &m.channel,
            Message::Data(m) => &m.channel,
        }
    }

    /// Short, stable name of the variant for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Authenticated(_) => "authenticated",
            Message::KeepAlive(_) => "keep-alive",
            Message::JobStart(_) => "job-start",
            Message::JobProgress(_) => "job-progress",
            Message::EndOfChannel(_) => "end-of-channel",
            Message::ChannelAbort(_) => "channel-abort",
            Message::Control(_) => "control",
            Message::Info(_) => "info",
            Message::Metadata(_) => "metadata",
            Message::ExpiredTsid(_) => "expired-tsid",
            Message::Event(_) => "event",
            Message::Error(_) => "error",
            Message::Data(_) => "data",
        }
    }
}

/// Sent by the server once the access token has been accepted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedMessage {
    /// Organization the token belongs to.
    pub org_id: Option<String>,
    /// User the token belongs to, if it is a session token.
    pub user_id: Option<String>,
}

/// A control message without further payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    #[serde(default)]
    pub channel: String,
    /// The control event name, e.g. `KEEP_ALIVE`.
    pub event: String,
    pub timestamp_ms: Option<i64>,
}

/// `JOB_START` control message carrying the computation handle.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStartMessage {
    #[serde(default)]
    pub channel: String,
    /// Server-assigned id of the running computation.
    pub handle: String,
    pub timestamp_ms: Option<i64>,
}

/// `JOB_PROGRESS` control message.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressMessage {
    #[serde(default)]
    pub channel: String,
    /// Backfill progress in percent.
    pub progress: Option<i64>,
    pub timestamp_ms: Option<i64>,
}

/// `CHANNEL_ABORT` control message.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAbortMessage {
    #[serde(default)]
    pub channel: String,
    /// Free-form abort details, when the server provides them.
    pub abort_info: Option<Value>,
    pub timestamp_ms: Option<i64>,
}

/// Known message codes of info messages, with their contents decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum InfoContents {
    /// `JOB_RUNNING_RESOLUTION`
    JobRunningResolution { resolution_ms: i64 },
    /// `JOB_DETECTED_LAG`
    JobDetectedLag { lag_ms: i64 },
    /// `JOB_INITIAL_MAX_DELAY`
    JobInitialMaxDelay { max_delay_ms: i64 },
    /// `FIND_LIMITED_RESULT_SET`
    FindLimitedResultSet { matched_size: i64, limit_size: i64 },
    /// `FIND_MATCHED_NO_TIMESERIES`
    FindMatchedNoTimeseries { query: String },
    /// `GROUPBY_MISSING_PROPERTY`
    GroupByMissingProperty { property_names: Vec<String> },
    /// Unrecognised code, or contents that did not fit the code; see
    /// [`InfoMessage::raw_contents`].
    Other,
}

/// An informational message about a running computation.
#[derive(Debug, Clone, PartialEq)]
pub struct InfoMessage {
    pub channel: String,
    pub logical_timestamp_ms: Option<i64>,
    /// e.g. `JOB_RUNNING_RESOLUTION`.
    pub message_code: String,
    pub message_level: Option<String>,
    pub timestamp_ms: Option<i64>,
    /// Typed view over [`Self::raw_contents`].
    pub contents: InfoContents,
    /// The `contents` object exactly as received.
    pub raw_contents: Map<String, Value>,
}

/// Properties of one output time series.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataMessage {
    #[serde(default)]
    pub channel: String,
    #[serde(rename = "tsId")]
    pub tsid: Tsid,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl MetadataMessage {
    /// The metric name (`sf_metric`), if present.
    pub fn metric(&self) -> Option<&str> {
        self.properties.get("sf_metric").and_then(Value::as_str)
    }

    /// The metric the series was derived from (`sf_originatingMetric`).
    pub fn originating_metric(&self) -> Option<&str> {
        self.properties.get("sf_originatingMetric").and_then(Value::as_str)
    }

    /// String value of an arbitrary property or dimension.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

/// A time series is no longer part of the output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiredTsidMessage {
    #[serde(default)]
    pub channel: String,
    #[serde(rename = "tsId")]
    pub tsid: Tsid,
}

/// A detector event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    #[serde(default)]
    pub channel: String,
    #[serde(rename = "tsId")]
    pub tsid: Option<Tsid>,
    pub timestamp_ms: Option<i64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// An error reported by the server. The payload is kept as received.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorMessage {
    pub channel: String,
    pub raw: Map<String, Value>,
}

/// Wire tag of a data point's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Int64,
    Float64,
    Int32,
    Unknown(u8),
}

impl From<u8> for ValueType {
    fn from(tag: u8) -> Self {
        match tag {
            1 => ValueType::Int64,
            2 => ValueType::Float64,
            3 => ValueType::Int32,
            other => ValueType::Unknown(other),
        }
    }
}

/// A decoded data point value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataValue {
    Int64(i64),
    Float64(f64),
    Int32(i32),
}

impl DataValue {
    /// Lossy conversion for callers that only deal in floats.
    pub fn as_f64(&self) -> f64 {
        match *self {
            DataValue::Int64(v) => v as f64,
            DataValue::Float64(v) => v,
            DataValue::Int32(v) => f64::from(v),
        }
    }
}

/// One data point: a value for one time series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPayload {
    pub value_type: ValueType,
    pub tsid: Tsid,
    /// The eight value bytes, big-endian, interpreted according to `value_type`.
    pub raw: [u8; 8],
}

impl DataPayload {
    pub fn new(value: DataValue, tsid: Tsid) -> Self {
        let (value_type, raw) = match value {
            DataValue::Int64(v) => (ValueType::Int64, v.to_be_bytes()),
            DataValue::Float64(v) => (ValueType::Float64, v.to_bits().to_be_bytes()),
            DataValue::Int32(v) => {
                let mut raw = [0u8; 8];
                raw[4..].copy_from_slice(&v.to_be_bytes());
                (ValueType::Int32, raw)
            }
        };
        Self { value_type, tsid, raw }
    }

    /// Interprets the raw bytes; `None` for unknown value types.
    pub fn value(&self) -> Option<DataValue> {
        match self.value_type {
            ValueType::Int64 => Some(DataValue::Int64(i64::from_be_bytes(self.raw))),
            ValueType::Float64 => Some(DataValue::Float64(f64::from_bits(u64::from_be_bytes(self.raw)))),
            ValueType::Int32 => {
                let mut low = [0u8; 4];
                low.copy_from_slice(&self.raw[4..]);
                Some(DataValue::Int32(i32::from_be_bytes(low)))
            }
            ValueType::Unknown(_) => None,
        }
    }
}

/// A batch of data points sharing one logical timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    pub channel: String,
    pub timestamp_ms: i64,
    pub payloads: Vec<DataPayload>,
}
