//! # Text Frame Decoder
//!
//! Text frames are JSON objects whose `type` field picks the concrete message.
//! Control messages dispatch a second time on `event`, info messages on
//! `message.messageCode`.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{
    DataMessage, DataPayload, DataValue, DecodeError, ErrorMessage, InfoContents, InfoMessage,
    Message, Tsid,
};

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    event: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInfo {
    #[serde(default)]
    channel: String,
    logical_timestamp_ms: Option<i64>,
    message: RawInfoBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInfoBody {
    message_code: String,
    message_level: Option<String>,
    timestamp_ms: Option<i64>,
    #[serde(default)]
    contents: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawData {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    logical_timestamp_ms: i64,
    #[serde(default)]
    data: Vec<RawDataPoint>,
}

#[derive(Deserialize)]
struct RawDataPoint {
    #[serde(rename = "tsId")]
    tsid: Tsid,
    value: Value,
}

/// Decodes a JSON text frame.
pub fn parse_text_message(frame: &[u8]) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_slice(frame)?;
    let envelope = Envelope::deserialize(&value)?;

    let message = match envelope.kind.as_str() {
        "authenticated" => Message::Authenticated(serde_json::from_value(value)?),
        "control-message" => match envelope.event.as_deref() {
            Some("KEEP_ALIVE") => Message::KeepAlive(serde_json::from_value(value)?),
            Some("JOB_START") => Message::JobStart(serde_json::from_value(value)?),
            Some("JOB_PROGRESS") => Message::JobProgress(serde_json::from_value(value)?),
            Some("END_OF_CHANNEL") => Message::EndOfChannel(serde_json::from_value(value)?),
            Some("CHANNEL_ABORT") => Message::ChannelAbort(serde_json::from_value(value)?),
            _ => Message::Control(serde_json::from_value(value)?),
        },
        "message" => Message::Info(parse_info(value)?),
        "metadata" => Message::Metadata(serde_json::from_value(value)?),
        "expired-tsid" => Message::ExpiredTsid(serde_json::from_value(value)?),
        "event" => Message::Event(serde_json::from_value(value)?),
        "error" => Message::Error(parse_error(value)),
        "data" => Message::Data(parse_data(value)?),
        other => return Err(DecodeError::UnknownType(other.to_string())),
    };
    Ok(message)
}

fn parse_info(value: Value) -> Result<InfoMessage, DecodeError> {
    let raw: RawInfo = serde_json::from_value(value)?;
    let raw_contents = raw.message.contents.unwrap_or_default();
    let contents = info_contents(&raw.message.message_code, &raw_contents);
    Ok(InfoMessage {
        channel: raw.channel,
        logical_timestamp_ms: raw.logical_timestamp_ms,
        message_code: raw.message.message_code,
        message_level: raw.message.message_level,
        timestamp_ms: raw.message.timestamp_ms,
        contents,
        raw_contents,
    })
}

/// Typed view over an info message's contents. A known code whose contents do
/// not carry the expected fields is treated like an unknown code.
pub fn info_contents(code: &str, contents: &Map<String, Value>) -> InfoContents {
    let typed = match code {
        "JOB_RUNNING_RESOLUTION" => int_field(contents, "resolutionMs")
            .map(|resolution_ms| InfoContents::JobRunningResolution { resolution_ms }),
        "JOB_DETECTED_LAG" => {
            int_field(contents, "lagMs").map(|lag_ms| InfoContents::JobDetectedLag { lag_ms })
        }
        "JOB_INITIAL_MAX_DELAY" => int_field(contents, "maxDelayMs")
            .map(|max_delay_ms| InfoContents::JobInitialMaxDelay { max_delay_ms }),
        "FIND_LIMITED_RESULT_SET" => int_field(contents, "matchedSize")
            .zip(int_field(contents, "limitSize"))
            .map(|(matched_size, limit_size)| InfoContents::FindLimitedResultSet {
                matched_size,
                limit_size,
            }),
        "FIND_MATCHED_NO_TIMESERIES" => contents
            .get("query")
            .and_then(Value::as_str)
            .map(|query| InfoContents::FindMatchedNoTimeseries { query: query.to_string() }),
        "GROUPBY_MISSING_PROPERTY" => contents
            .get("propertyNames")
            .and_then(Value::as_array)
            .map(|names| InfoContents::GroupByMissingProperty {
                property_names: names
                    .iter()
                    .filter_map(|n| n.as_str().map(str::to_string))
                    .collect(),
            }),
        _ => None,
    };
    typed.unwrap_or(InfoContents::Other)
}

fn int_field(contents: &Map<String, Value>, key: &str) -> Option<i64> {
    let value = contents.get(key)?;
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}

fn parse_error(value: Value) -> ErrorMessage {
    let raw = match value {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let channel = raw
        .get("channel")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    ErrorMessage { channel, raw }
}

fn parse_data(value: Value) -> Result<DataMessage, DecodeError> {
    let raw: RawData = serde_json::from_value(value)?;
    let payloads = raw
        .data
        .into_iter()
        .filter_map(|point| {
            let value = match point.value.as_i64() {
                Some(v) => DataValue::Int64(v),
                None => DataValue::Float64(point.value.as_f64()?),
            };
            Some(DataPayload::new(value, point.tsid))
        })
        .collect();
    Ok(DataMessage {
        channel: raw.channel,
        timestamp_ms: raw.logical_timestamp_ms,
        payloads,
    })
}
