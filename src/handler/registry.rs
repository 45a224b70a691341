//! Handler registry for dispatching packets by code.
//!
//! Request codes (`0x00`-`0x7F`) produce exactly one reply. Codes in the
//! notification band are responses to server notifications and are
//! consumed silently.

use std::collections::HashMap;

use bytes::Bytes;

use super::HandlerContext;
use crate::protocol::{is_notification_code, ErrorCode, NotificationCode, Packet, RequestCode};

/// Reply body on success, specific status on failure.
pub type HandlerResult = Result<Bytes, ErrorCode>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&mut HandlerContext<'_>, &Packet) -> HandlerResult + Send + Sync + 'static,
{
    fn call(&self, ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
        self(ctx, packet)
    }
}

/// What the dispatcher should send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Reply(ErrorCode, Bytes),
    NoReply,
}

struct HandlerEntry {
    name: &'static str,
    /// Shortest acceptable payload.
    min_len: usize,
    replies: bool,
    handler: Box<dyn Handler>,
}

/// Registry mapping codes to handlers.
pub struct HandlerRegistry {
    entries: HashMap<u8, HandlerEntry>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register the handler for a request code.
    pub fn register_request<H: Handler>(&mut self, code: RequestCode, min_len: usize, handler: H) {
        self.entries.insert(
            code.as_wire(),
            HandlerEntry {
                name: code.name(),
                min_len,
                replies: true,
                handler: Box::new(handler),
            },
        );
    }

    /// Register the handler for responses to a notification code.
    pub fn register_response<H: Handler>(&mut self, code: NotificationCode, handler: H) {
        self.entries.insert(
            code.as_wire(),
            HandlerEntry {
                name: code.name(),
                min_len: 0,
                replies: false,
                handler: Box::new(handler),
            },
        );
    }

    pub fn contains(&self, code: u8) -> bool {
        self.entries.contains_key(&code)
    }

    /// Symbolic name of the handler registered for `code`.
    pub fn name(&self, code: u8) -> Option<&'static str> {
        self.entries.get(&code).map(|e| e.name)
    }

    /// Minimum payload length for `code`.
    pub fn min_len(&self, code: u8) -> Option<usize> {
        self.entries.get(&code).map(|e| e.min_len)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the handler for `packet`.
    ///
    /// Checks, in order: known code, minimum length, registration. Each
    /// failure becomes a reply with the matching status and the handler is
    /// not run.
    pub fn dispatch(&self, ctx: &mut HandlerContext<'_>, packet: &Packet) -> Outcome {
        let code = packet.code();
        let Some(entry) = self.entries.get(&code) else {
            if is_notification_code(code) {
                tracing::debug!(code, "Response to unknown notification code");
                return Outcome::NoReply;
            }
            tracing::debug!(code, "Unknown request code");
            return Outcome::Reply(ErrorCode::InvalidRequest, Bytes::new());
        };

        if !entry.replies {
            if let Err(status) = entry.handler.call(ctx, packet) {
                tracing::debug!(response = entry.name, %status, "Response handler failed");
            }
            return Outcome::NoReply;
        }

        if packet.packet_length() < entry.min_len {
            tracing::debug!(
                request = entry.name,
                len = packet.packet_length(),
                min = entry.min_len,
                "Request too short"
            );
            return Outcome::Reply(ErrorCode::InvalidParameters, Bytes::new());
        }

        let needs_registration =
            RequestCode::from_wire(code).is_some_and(RequestCode::requires_registration);
        if needs_registration && !ctx.is_registered() {
            return Outcome::Reply(ErrorCode::NotRegistered, Bytes::new());
        }

        match entry.handler.call(ctx, packet) {
            Ok(body) => Outcome::Reply(ErrorCode::Success, body),
            Err(status) => {
                tracing::debug!(request = entry.name, %status, "Request failed");
                Outcome::Reply(status, Bytes::new())
            }
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketType;
    use crate::server::test_support::TestServer;

    fn echo(_ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
        Ok(Bytes::copy_from_slice(packet.payload()))
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register_request(RequestCode::LivenessCheck, 0, echo);
        registry.register_request(RequestCode::GetFrame, 3, echo);
        registry.register_response(NotificationCode::AreYouThere, |_: &mut HandlerContext<'_>, _: &Packet| {
            Err(ErrorCode::NoSuchClient)
        });
        registry
    }

    #[test]
    fn test_names_and_lengths() {
        let registry = registry();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.name(0x20), Some("LivenessCheck"));
        assert_eq!(registry.min_len(0x0D), Some(3));
        assert!(!registry.contains(0x0E));
    }

    #[tokio::test]
    async fn test_unknown_request_code() {
        let mut server = TestServer::new();
        let (id, _peer) = server.add_client(true);
        let outcome = registry().dispatch(
            &mut server.context(id),
            &Packet::new(PacketType::Request, 0x0E, 1),
        );
        assert_eq!(outcome, Outcome::Reply(ErrorCode::InvalidRequest, Bytes::new()));

        let outcome = registry().dispatch(
            &mut server.context(id),
            &Packet::new(PacketType::Response, 0x90, 1),
        );
        assert_eq!(outcome, Outcome::NoReply);
    }

    #[tokio::test]
    async fn test_short_payload_rejected_before_handler() {
        let mut server = TestServer::new();
        let (id, _peer) = server.add_client(true);
        let packet = Packet::with_payload(PacketType::Request, 0x0D, 1, b"\0\x01");
        let outcome = registry().dispatch(&mut server.context(id), &packet);
        assert_eq!(outcome, Outcome::Reply(ErrorCode::InvalidParameters, Bytes::new()));
    }

    #[tokio::test]
    async fn test_registration_required() {
        let mut server = TestServer::new();
        let (id, _peer) = server.add_client(false);
        let registry = registry();

        let packet = Packet::with_payload(PacketType::Request, 0x0D, 1, b"\0\x01X\0");
        assert_eq!(
            registry.dispatch(&mut server.context(id), &packet),
            Outcome::Reply(ErrorCode::NotRegistered, Bytes::new())
        );

        let packet = Packet::with_payload(PacketType::Request, 0x20, 1, b"hi");
        assert_eq!(
            registry.dispatch(&mut server.context(id), &packet),
            Outcome::Reply(ErrorCode::Success, Bytes::from_static(b"hi"))
        );
    }

    #[tokio::test]
    async fn test_response_handlers_never_reply() {
        let mut server = TestServer::new();
        let (id, _peer) = server.add_client(true);
        let packet = Packet::new(PacketType::Response, 0x80, 3);
        assert_eq!(registry().dispatch(&mut server.context(id), &packet), Outcome::NoReply);
    }
}
