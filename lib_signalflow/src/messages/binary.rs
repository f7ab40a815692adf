//! # Binary Frame Decoder
//!
//! Layout of a binary frame:
//!
//! ```text
//! | version u8 | type u8 | flags u8 | reserved u8 | channel [u8; 16] |   20-byte header
//! | timestamp_ms u64 BE | element count u32 BE |                        12-byte sub-header
//! | value type u8 | tsid u64 BE | value [u8; 8] |  x count               17-byte records
//! ```
//!
//! Everything after the header may be gzip-compressed (flag bit 0). Flag bit 1
//! announces a JSON body inside the binary frame, which is not supported.

use std::io::Read;

use bytes::Buf;
use flate2::read::GzDecoder;

use super::{DataMessage, DataPayload, DecodeError, Message, Tsid, ValueType};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 20;
/// Size of the data sub-header following the frame header.
pub const DATA_SUBHEADER_LEN: usize = 12;
/// Size of one data record.
pub const DATA_RECORD_LEN: usize = 17;
/// Width of the NUL-padded channel name field.
pub const CHANNEL_FIELD_LEN: usize = 16;

/// Binary message type of data batches.
pub const DATA_MESSAGE_TYPE: u8 = 5;

/// Flag bit: body is gzip-compressed.
pub const FLAG_COMPRESSED: u8 = 1 << 0;
/// Flag bit: body is JSON.
pub const FLAG_JSON: u8 = 1 << 1;

/// Largest body a compressed frame may inflate to.
pub const MAX_INFLATED_LEN: usize = 16 * 1024 * 1024;

/// Decodes a binary frame into a [`Message::Data`].
pub fn parse_binary_message(frame: &[u8]) -> Result<Message, DecodeError> {
    if frame.len() < HEADER_LEN {
        return Err(DecodeError::FrameTooShort { expected: HEADER_LEN, actual: frame.len() });
    }

    let mut header = &frame[..HEADER_LEN];
    let _version = header.get_u8();
    let message_type = header.get_u8();
    let flags = header.get_u8();
    let _reserved = header.get_u8();
    let channel = channel_name(header);

    if flags & FLAG_JSON != 0 {
        return Err(DecodeError::JsonInBinary);
    }
    if message_type != DATA_MESSAGE_TYPE {
        return Err(DecodeError::UnsupportedBinaryType(message_type));
    }

    let body = &frame[HEADER_LEN..];
    let data = if flags & FLAG_COMPRESSED != 0 {
        let inflated = inflate(body, MAX_INFLATED_LEN)?;
        parse_data_body(channel, &inflated)?
    } else {
        parse_data_body(channel, body)?
    };
    Ok(Message::Data(data))
}

/// Gunzips `body`, refusing to produce more than `limit` bytes.
fn inflate(body: &[u8], limit: usize) -> Result<Vec<u8>, DecodeError> {
    let mut inflated = Vec::new();
    GzDecoder::new(body)
        .take(limit as u64 + 1)
        .read_to_end(&mut inflated)
        .map_err(DecodeError::Gzip)?;
    if inflated.len() > limit {
        return Err(DecodeError::InflatedTooLarge { limit });
    }
    Ok(inflated)
}

fn channel_name(field: &[u8]) -> String {
    String::from_utf8_lossy(field).trim_matches('\0').to_string()
}

fn parse_data_body(channel: String, body: &[u8]) -> Result<DataMessage, DecodeError> {
    if body.len() < DATA_SUBHEADER_LEN {
        return Err(DecodeError::FrameTooShort {
            expected: HEADER_LEN + DATA_SUBHEADER_LEN,
            actual: HEADER_LEN + body.len(),
        });
    }

    let mut buf = body;
    let timestamp_ms = buf.get_u64() as i64;
    let count = buf.get_u32() as usize;

    if buf.remaining() < count.saturating_mul(DATA_RECORD_LEN) {
        return Err(DecodeError::Truncated { declared: count, available: buf.remaining() });
    }

    let mut payloads = Vec::with_capacity(count);
    for _ in 0..count {
        let value_type = ValueType::from(buf.get_u8());
        let tsid = Tsid(buf.get_u64());
        let mut raw = [0u8; 8];
        buf.copy_to_slice(&mut raw);
        payloads.push(DataPayload { value_type, tsid, raw });
    }

    Ok(DataMessage { channel, timestamp_ms, payloads })
}

/// Encodes a data batch in the binary layout, for tests and mock servers.
#[cfg(any(test, feature = "test-util"))]
pub fn encode_data_frame(
    channel: &str,
    timestamp_ms: i64,
    payloads: &[DataPayload],
    compress: bool,
) -> std::io::Result<Vec<u8>> {
    use bytes::BufMut;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    let mut body = Vec::with_capacity(DATA_SUBHEADER_LEN + payloads.len() * DATA_RECORD_LEN);
    body.put_u64(timestamp_ms as u64);
    body.put_u32(payloads.len() as u32);
    for payload in payloads {
        let tag = match payload.value_type {
            ValueType::Int64 => 1,
            ValueType::Float64 => 2,
            ValueType::Int32 => 3,
            ValueType::Unknown(tag) => tag,
        };
        body.put_u8(tag);
        body.put_u64(payload.tsid.0);
        body.put_slice(&payload.raw);
    }

    if compress {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body)?;
        body = encoder.finish()?;
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.put_u8(1);
    frame.put_u8(DATA_MESSAGE_TYPE);
    frame.put_u8(if compress { FLAG_COMPRESSED } else { 0 });
    frame.put_u8(0);
    let mut name = [0u8; CHANNEL_FIELD_LEN];
    let len = channel.len().min(CHANNEL_FIELD_LEN);
    name[..len].copy_from_slice(&channel.as_bytes()[..len]);
    frame.put_slice(&name);
    frame.put_slice(&body);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DataValue;

    fn sample_payloads() -> Vec<DataPayload> {
        vec![
            DataPayload::new(DataValue::Int64(42), Tsid(1)),
            DataPayload::new(DataValue::Float64(0.25), Tsid(2)),
            DataPayload::new(DataValue::Int32(-7), Tsid(3)),
        ]
    }

    fn encode(channel: &str, timestamp_ms: i64, payloads: &[DataPayload], compress: bool) -> Vec<u8> {
        encode_data_frame(channel, timestamp_ms, payloads, compress).unwrap()
    }

    fn decode(frame: &[u8]) -> DataMessage {
        match parse_binary_message(frame).unwrap() {
            Message::Data(data) => data,
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[test]
    fn records_keep_order_and_share_the_timestamp() {
        let frame = encode("ch-12", 1_700_000_000_000, &sample_payloads(), false);
        let data = decode(&frame);

        assert_eq!(data.channel, "ch-12");
        assert_eq!(data.timestamp_ms, 1_700_000_000_000);
        assert_eq!(data.payloads, sample_payloads());
        assert_eq!(data.payloads[1].value(), Some(DataValue::Float64(0.25)));
    }

    #[test]
    fn hand_built_frame_decodes() {
        let mut frame = vec![1, 5, 0, 0];
        frame.extend_from_slice(b"ch-1\0\0\0\0\0\0\0\0\0\0\0\0");
        frame.extend_from_slice(&1000u64.to_be_bytes());
        frame.extend_from_slice(&1u32.to_be_bytes());
        frame.push(1);
        frame.extend_from_slice(&0xA2A9_D1B5u64.to_be_bytes());
        frame.extend_from_slice(&99i64.to_be_bytes());

        let data = decode(&frame);
        assert_eq!(data.channel, "ch-1");
        assert_eq!(data.payloads.len(), 1);
        assert_eq!(data.payloads[0].tsid.to_string(), "AAAAAKKp0bU");
        assert_eq!(data.payloads[0].value(), Some(DataValue::Int64(99)));
    }

    #[test]
    fn compressed_frame_matches_uncompressed() {
        let plain = decode(&encode("ch-4", 5, &sample_payloads(), false));
        let gzipped = decode(&encode("ch-4", 5, &sample_payloads(), true));
        assert_eq!(plain, gzipped);
    }

    #[test]
    fn empty_batch_is_valid() {
        let data = decode(&encode("ch-1", 10, &[], false));
        assert!(data.payloads.is_empty());
    }

    #[test]
    fn json_flag_is_rejected() {
        let mut frame = encode("ch-1", 1, &sample_payloads(), false);
        frame[2] |= FLAG_JSON;
        assert!(matches!(parse_binary_message(&frame), Err(DecodeError::JsonInBinary)));
    }

    #[test]
    fn malformed_frames_fail() {
        assert!(matches!(
            parse_binary_message(&[1, 5, 0]),
            Err(DecodeError::FrameTooShort { expected: 20, actual: 3 })
        ));

        let mut other_type = encode("ch-1", 1, &[], false);
        other_type[1] = 9;
        assert!(matches!(parse_binary_message(&other_type), Err(DecodeError::UnsupportedBinaryType(9))));

        let mut truncated = encode("ch-1", 1, &sample_payloads(), false);
        truncated.truncate(truncated.len() - 5);
        assert!(matches!(
            parse_binary_message(&truncated),
            Err(DecodeError::Truncated { declared: 3, .. })
        ));

        let mut corrupt = encode("ch-1", 1, &sample_payloads(), false);
        corrupt[2] |= FLAG_COMPRESSED;
        assert!(matches!(parse_binary_message(&corrupt), Err(DecodeError::Gzip(_))));
    }

    #[test]
    fn inflation_stops_at_the_limit() {
        use flate2::{write::GzEncoder, Compression};
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&[0u8; 4096]).unwrap();
        let bomb = encoder.finish().unwrap();

        assert!(matches!(inflate(&bomb, 1024), Err(DecodeError::InflatedTooLarge { limit: 1024 })));
        assert_eq!(inflate(&bomb, 4096).unwrap().len(), 4096);
    }
}
