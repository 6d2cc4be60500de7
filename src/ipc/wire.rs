//! Pluggable serializer for envelopes and payloads.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::types::{Error, Result};

/// Serializer selected for a node and every channel it opens.
///
/// Both ends of a channel must agree; children inherit their parent's format
/// through their configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// MessagePack with named fields.
    #[default]
    MsgPack,
    /// JSON, mostly useful when reading captured traffic.
    Json,
}

impl WireFormat {
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            WireFormat::MsgPack => rmp_serde::to_vec_named(value).map_err(|e| {
                tracing::error!("Msgpack encoding failed: {}", e);
                e.into()
            }),
            WireFormat::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            WireFormat::MsgPack => Ok(rmp_serde::from_slice(bytes)?),
            WireFormat::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WireFormat::MsgPack => "msgpack",
            WireFormat::Json => "json",
        }
    }
}

impl FromStr for WireFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "msgpack" => Ok(WireFormat::MsgPack),
            "json" => Ok(WireFormat::Json),
            other => Err(Error::validation(format!("unknown wire format: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Error;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        values: Vec<i64>,
        nested: Option<Box<Sample>>,
    }

    #[test]
    fn test_both_formats_are_deterministic() {
        let sample = Sample {
            name: "a".into(),
            values: vec![1, -2, 3],
            nested: Some(Box::new(Sample {
                name: "b".into(),
                values: vec![],
                nested: None,
            })),
        };
        for format in [WireFormat::MsgPack, WireFormat::Json] {
            let first = format.encode(&sample).unwrap();
            let second = format.encode(&sample).unwrap();
            assert_eq!(first, second);
            let back: Sample = format.decode(&first).unwrap();
            assert_eq!(back, sample);
        }
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        let err = WireFormat::MsgPack.decode::<Sample>(&[0xc1]).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        let err = WireFormat::Json.decode::<Sample>(b"{").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_config_spelling() {
        let f: WireFormat = serde_json::from_str("\"msgpack\"").unwrap();
        assert_eq!(f, WireFormat::MsgPack);
        assert_eq!(WireFormat::Json.name(), "json");
        assert_eq!("MsgPack".parse::<WireFormat>().unwrap(), WireFormat::MsgPack);
        assert!("cbor".parse::<WireFormat>().is_err());
    }
}
