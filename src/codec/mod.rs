//! Codec module - structured payload bodies.
//!
//! Almost every protocol field is encoded with the fixed-width helpers in
//! [`crate::protocol::wire_format`]. The few bodies that carry a
//! structured record (server statistics) use [`MsgPackCodec`].
//!
//! # Example
//!
//! ```
//! use framewire::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&("clients", 3u32)).unwrap();
//! let decoded: (String, u32) = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, ("clients".to_string(), 3));
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
