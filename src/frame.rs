//! Frame representation and ordering.
//!
//! - `OrderingKey`: `(acquisition, frame)` pair; totally orders frames across sources.
//! - `FrameHeader`: decoded JSON header. Kept whole so it can be re-encoded on publish.
//! - `Frame`: key + header + opaque payload. Immutable once built.
//!
//! Payload bytes are never inspected.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

/// Header field carrying the producer-local sequence number.
pub const FRAME_NUM_FIELD: &str = "frame_num";

// ----------------------------------------------------------------------------
// OrderingKey
// ----------------------------------------------------------------------------

/// Lexicographic ordering key: acquisition epoch first, then frame number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderingKey {
    pub acquisition: u64,
    pub frame: u64,
}

impl OrderingKey {
    pub const fn new(acquisition: u64, frame: u64) -> Self {
        Self { acquisition, frame }
    }
}

impl Ord for OrderingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.acquisition
            .cmp(&other.acquisition)
            .then(self.frame.cmp(&other.frame))
    }
}

impl PartialOrd for OrderingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OrderingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.acquisition, self.frame)
    }
}

// ----------------------------------------------------------------------------
// FrameHeader
// ----------------------------------------------------------------------------

/// Decoded frame header.
///
/// Any JSON object with an unsigned integer `frame_num` is accepted. Other
/// fields are carried through untouched.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameHeader {
    fields: Map<String, Value>,
    frame_num: u64,
}

impl FrameHeader {
    /// Decode a raw header as sent by a producer.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(raw).map_err(|e| anyhow!("header is not valid JSON: {}", e))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(fields) = value else {
            return Err(anyhow!("header must be a JSON object"));
        };
        let frame_num = fields
            .get(FRAME_NUM_FIELD)
            .ok_or_else(|| anyhow!("header is missing '{}'", FRAME_NUM_FIELD))?
            .as_u64()
            .ok_or_else(|| anyhow!("'{}' must be an unsigned integer", FRAME_NUM_FIELD))?;
        Ok(Self { fields, frame_num })
    }

    pub fn frame_num(&self) -> u64 {
        self.frame_num
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Encode the header back to JSON for publishing.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.fields)?)
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A single frame on its way through the combiner.
#[derive(Clone, Debug)]
pub struct Frame {
    key: OrderingKey,
    header: FrameHeader,
    payload: Vec<u8>,
}

impl Frame {
    pub fn new(key: OrderingKey, header: FrameHeader, payload: Vec<u8>) -> Self {
        Self {
            key,
            header,
            payload,
        }
    }

    pub fn key(&self) -> OrderingKey {
        self.key
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_parts(self) -> (FrameHeader, Vec<u8>) {
        (self.header, self.payload)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_orders_by_acquisition_first() {
        assert!(OrderingKey::new(0, 9) < OrderingKey::new(1, 0));
        assert!(OrderingKey::new(1, 2) > OrderingKey::new(1, 1));
        assert_eq!(OrderingKey::new(3, 3), OrderingKey::new(3, 3));
    }

    #[test]
    fn header_decode_extracts_frame_num() {
        let header = FrameHeader::decode(br#"{"frame_num": 7, "dtype": "uint16"}"#).unwrap();
        assert_eq!(header.frame_num(), 7);
        assert_eq!(header.get("dtype"), Some(&Value::from("uint16")));
    }

    #[test]
    fn header_decode_rejects_malformed() {
        assert!(FrameHeader::decode(b"not json").is_err());
        assert!(FrameHeader::decode(b"[1, 2]").is_err());
        assert!(FrameHeader::decode(br#"{"dtype": "uint16"}"#).is_err());
        assert!(FrameHeader::decode(br#"{"frame_num": -1}"#).is_err());
        assert!(FrameHeader::decode(br#"{"frame_num": 1.5}"#).is_err());
        assert!(FrameHeader::decode(br#"{"frame_num": "3"}"#).is_err());
    }

    #[test]
    fn header_reencodes_all_fields() {
        let header = FrameHeader::decode(br#"{"frame_num": 3, "shape": [2, 4]}"#).unwrap();
        let bytes = header.to_json_bytes().unwrap();
        let back: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back["frame_num"], 3);
        assert_eq!(back["shape"], serde_json::json!([2, 4]));
    }
}
