//! Protocol module - wire format, packets, and reassembly.
//!
//! This module implements the binary packet protocol:
//! - 4-byte header encoding/decoding (ordinary, fragment-start, fragment)
//! - Packet struct with fragment bookkeeping
//! - PacketReader for turning partial reads into complete packets
//! - Typed payload helpers and the identify block

mod codes;
mod identify;
mod packet;
mod packet_reader;
mod payload;
pub mod wire_format;

pub use codes::{is_notification_code, ErrorCode, NotificationCode, RequestCode};
pub use identify::{
    PasswordFlags, ServerInfo, IDENTIFY_SIZE, PEER_SIGNATURE, PROTOCOL_MAJOR, PROTOCOL_MINOR,
    SERVER_SIGNATURE,
};
pub use packet::{Packet, PacketType, ReplyCallback, Role};
pub use packet_reader::PacketReader;
pub use payload::{cstr_list, PayloadReader, PayloadWriter};
pub use wire_format::{Header, HeaderKind, BASE_HEADER_SIZE, DEFAULT_MAX_DATASIZE};
