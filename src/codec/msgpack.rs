//! MsgPack codec using `rmp-serde`.
//!
//! Always `to_vec_named`: structs travel as maps keyed by field name, so a
//! newer peer can add fields without breaking an older one.

use crate::error::Result;

/// MessagePack codec for structured reply bodies.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FramewireError;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Counters {
        current: u32,
        peak: u32,
        uptime_secs: u64,
    }

    #[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
    struct CountersV2 {
        current: u32,
        peak: u32,
        #[serde(default)]
        crashed: u32,
    }

    #[test]
    fn test_struct_encodes_as_map() {
        let value = Counters {
            current: 2,
            peak: 5,
            uptime_secs: 60,
        };
        let encoded = MsgPackCodec::encode(&value).unwrap();

        // 0x83 = fixmap with 3 entries, 0x93 would be a positional array
        assert_eq!(encoded[0], 0x83);
        assert_eq!(MsgPackCodec::decode::<Counters>(&encoded).unwrap(), value);
    }

    #[test]
    fn test_named_fields_tolerate_schema_drift() {
        let old = Counters {
            current: 1,
            peak: 4,
            uptime_secs: 9,
        };
        let encoded = MsgPackCodec::encode(&old).unwrap();

        let newer: CountersV2 = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(
            newer,
            CountersV2 {
                current: 1,
                peak: 4,
                crashed: 0
            }
        );
    }

    #[test]
    fn test_large_counters() {
        let n = u64::MAX - 1;
        let decoded: u64 = MsgPackCodec::decode(&MsgPackCodec::encode(&n).unwrap()).unwrap();
        assert_eq!(decoded, n);
    }

    #[test]
    fn test_decode_error_maps_to_msgpack_variant() {
        let result: Result<Counters> = MsgPackCodec::decode(b"\xc1garbage");
        assert!(matches!(result, Err(FramewireError::MsgPackDecode(_))));

        let truncated = &MsgPackCodec::encode(&Counters {
            current: 1,
            peak: 1,
            uptime_secs: 1,
        })
        .unwrap()[..4];
        assert!(MsgPackCodec::decode::<Counters>(truncated).is_err());
    }
}
