//! Value serialization: JSON, optionally zstd-compressed.

use recall_core::BackendError;
use serde::de::DeserializeOwned;
use serde::Serialize;

const ZSTD_LEVEL: i32 = 3;

pub fn encode_value<T: Serialize + ?Sized>(value: &T, compress: bool) -> Result<Vec<u8>, BackendError> {
    let json = serde_json::to_vec(value).map_err(|e| BackendError::Serialization {
        reason: e.to_string(),
    })?;
    if !compress {
        return Ok(json);
    }
    zstd::encode_all(json.as_slice(), ZSTD_LEVEL).map_err(|e| BackendError::Serialization {
        reason: format!("compression failed: {e}"),
    })
}

pub fn decode_value<T: DeserializeOwned>(bytes: &[u8], compressed: bool) -> Result<T, BackendError> {
    let result = if compressed {
        let json = zstd::decode_all(bytes).map_err(|e| BackendError::Serialization {
            reason: format!("decompression failed: {e}"),
        })?;
        serde_json::from_slice(&json)
    } else {
        serde_json::from_slice(bytes)
    };
    result.map_err(|e| BackendError::Serialization {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Report {
        title: String,
        rows: Vec<u32>,
    }

    fn report() -> Report {
        Report {
            title: "quarterly".repeat(20),
            rows: (0..200).collect(),
        }
    }

    #[test]
    fn test_compressed_value_is_smaller_and_readable() {
        let plain = encode_value(&report(), false).expect("encode should succeed");
        let packed = encode_value(&report(), true).expect("encode should succeed");
        assert!(packed.len() < plain.len());
        let back: Report = decode_value(&packed, true).expect("decode should succeed");
        assert_eq!(back, report());
    }

    #[test]
    fn test_wrong_type_is_a_serialization_error() {
        let bytes = encode_value(&"just a string", false).expect("encode should succeed");
        let err = decode_value::<Report>(&bytes, false).expect_err("decode should fail");
        assert!(matches!(err, BackendError::Serialization { .. }));
    }

    #[test]
    fn test_compressed_flag_mismatch_fails() {
        let bytes = encode_value(&report(), false).expect("encode should succeed");
        assert!(decode_value::<Report>(&bytes, true).is_err());
    }
}
