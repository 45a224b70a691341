//! Identification payload exchanged on connect (reply to request 0x00).
//!
//! ```text
//! 0      protocol major        12..17 password flags (6 x u8)
//! 1      protocol minor        18..19 reserved
//! 2..4   server version        20..51 signature, NUL-padded
//! 5      max request code      52..79 reserved
//! 6      max notification code
//! 8      max clients (u16)
//! 10     max databases (u16)
//! ```

use serde::{Deserialize, Serialize};

use super::codes::{ErrorCode, NotificationCode, RequestCode};
use super::wire_format::{load_byte, load_short, store_byte, store_short};

/// Exact size of the identification payload.
pub const IDENTIFY_SIZE: usize = 0x50;

pub const PROTOCOL_MAJOR: u8 = 1;
pub const PROTOCOL_MINOR: u8 = 0;

/// Signature of a dedicated database server.
pub const SERVER_SIGNATURE: &str = "FramepaC DB-Server";
/// Signature of a peer-to-peer node.
pub const PEER_SIGNATURE: &str = "FramepaC Peer2Peer";

const SIGNATURE_OFFSET: usize = 20;
const SIGNATURE_LEN: usize = 32;
const PASSWORD_OFFSET: usize = 12;

/// Per-operation password requirements advertised by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordFlags {
    pub register: bool,
    pub open_db: bool,
    pub create_db: bool,
    pub revert_frame: bool,
    pub delete_frame: bool,
    pub set_config: bool,
}

impl PasswordFlags {
    fn to_bytes(self) -> [u8; 6] {
        [
            self.register,
            self.open_db,
            self.create_db,
            self.revert_frame,
            self.delete_frame,
            self.set_config,
        ]
        .map(u8::from)
    }

    fn from_bytes(b: &[u8]) -> Self {
        Self {
            register: b[0] != 0,
            open_db: b[1] != 0,
            create_db: b[2] != 0,
            revert_frame: b[3] != 0,
            delete_frame: b[4] != 0,
            set_config: b[5] != 0,
        }
    }
}

/// What a server says about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub protocol_major: u8,
    pub protocol_minor: u8,
    pub server_version: (u8, u8, u8),
    pub max_request_code: u8,
    pub max_notification_code: u8,
    pub max_clients: u16,
    pub max_databases: u16,
    pub passwords: PasswordFlags,
    pub signature: String,
}

impl ServerInfo {
    /// Identification for this build in server or peer mode.
    pub fn local(peer_mode: bool, max_clients: u16, max_databases: u16, passwords: PasswordFlags) -> Self {
        Self {
            protocol_major: PROTOCOL_MAJOR,
            protocol_minor: PROTOCOL_MINOR,
            server_version: crate_version(),
            max_request_code: RequestCode::MAX.as_wire(),
            max_notification_code: NotificationCode::MAX.as_wire(),
            max_clients,
            max_databases,
            passwords,
            signature: if peer_mode { PEER_SIGNATURE } else { SERVER_SIGNATURE }.to_string(),
        }
    }

    /// Encode to the fixed 80-byte layout. Over-long signatures are truncated.
    pub fn encode(&self) -> [u8; IDENTIFY_SIZE] {
        let mut buf = [0u8; IDENTIFY_SIZE];
        store_byte(self.protocol_major, &mut buf, 0);
        store_byte(self.protocol_minor, &mut buf, 1);
        store_byte(self.server_version.0, &mut buf, 2);
        store_byte(self.server_version.1, &mut buf, 3);
        store_byte(self.server_version.2, &mut buf, 4);
        store_byte(self.max_request_code, &mut buf, 5);
        store_byte(self.max_notification_code, &mut buf, 6);
        store_short(self.max_clients, &mut buf, 8);
        store_short(self.max_databases, &mut buf, 10);
        buf[PASSWORD_OFFSET..PASSWORD_OFFSET + 6].copy_from_slice(&self.passwords.to_bytes());
        let sig = self.signature.as_bytes();
        let n = sig.len().min(SIGNATURE_LEN - 1);
        buf[SIGNATURE_OFFSET..SIGNATURE_OFFSET + n].copy_from_slice(&sig[..n]);
        buf
    }

    /// Decode an identification payload; anything malformed is `NotAServer`.
    pub fn decode(buf: &[u8]) -> Result<Self, ErrorCode> {
        if buf.len() != IDENTIFY_SIZE {
            return Err(ErrorCode::NotAServer);
        }
        let sig_field = &buf[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_LEN];
        let sig_end = sig_field
            .iter()
            .position(|&b| b == 0)
            .ok_or(ErrorCode::NotAServer)?;
        let signature = std::str::from_utf8(&sig_field[..sig_end])
            .map_err(|_| ErrorCode::NotAServer)?
            .to_string();
        Ok(Self {
            protocol_major: load_byte(buf, 0),
            protocol_minor: load_byte(buf, 1),
            server_version: (load_byte(buf, 2), load_byte(buf, 3), load_byte(buf, 4)),
            max_request_code: load_byte(buf, 5),
            max_notification_code: load_byte(buf, 6),
            max_clients: load_short(buf, 8),
            max_databases: load_short(buf, 10),
            passwords: PasswordFlags::from_bytes(&buf[PASSWORD_OFFSET..PASSWORD_OFFSET + 6]),
            signature,
        })
    }

    pub fn is_peer(&self) -> bool {
        self.signature == PEER_SIGNATURE
    }

    /// A client accepts a known signature at a protocol version no older than its own.
    pub fn is_compatible(&self) -> bool {
        let known = self.signature == SERVER_SIGNATURE || self.signature == PEER_SIGNATURE;
        known && (self.protocol_major, self.protocol_minor) >= (PROTOCOL_MAJOR, PROTOCOL_MINOR)
    }
}

fn crate_version() -> (u8, u8, u8) {
    let parse = |s: &str| s.parse::<u8>().unwrap_or(0);
    (
        parse(env!("CARGO_PKG_VERSION_MAJOR")),
        parse(env!("CARGO_PKG_VERSION_MINOR")),
        parse(env!("CARGO_PKG_VERSION_PATCH")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_layout() {
        let info = ServerInfo::local(false, 64, 64, PasswordFlags {
            delete_frame: true,
            ..Default::default()
        });
        let bytes = info.encode();

        assert_eq!(bytes.len(), 80);
        assert_eq!(bytes[0], PROTOCOL_MAJOR);
        assert_eq!(bytes[5], 0x27);
        assert_eq!(bytes[6], 0x90);
        assert_eq!(&bytes[8..10], &[0, 64]);
        assert_eq!(bytes[16], 1);
        assert_eq!(&bytes[20..38], SERVER_SIGNATURE.as_bytes());
        assert!(bytes[38..].iter().all(|&b| b == 0));

        let decoded = ServerInfo::decode(&bytes).unwrap();
        assert_eq!(decoded, info);
        assert!(decoded.is_compatible());
        assert!(!decoded.is_peer());
    }

    #[test]
    fn test_peer_signature() {
        let info = ServerInfo::local(true, 8, 64, PasswordFlags::default());
        let decoded = ServerInfo::decode(&info.encode()).unwrap();
        assert!(decoded.is_peer());
        assert!(decoded.is_compatible());
    }

    #[test]
    fn test_incompatible_peers() {
        let mut info = ServerInfo::local(false, 1, 1, PasswordFlags::default());
        info.signature = "Some Other Server".to_string();
        assert!(!ServerInfo::decode(&info.encode()).unwrap().is_compatible());

        let mut old = ServerInfo::local(false, 1, 1, PasswordFlags::default());
        old.protocol_major = 0;
        old.protocol_minor = 9;
        assert!(!old.is_compatible());

        assert_eq!(ServerInfo::decode(&[0u8; 10]), Err(ErrorCode::NotAServer));
    }
}
