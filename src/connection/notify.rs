//! Client-side notification dispatch table.

use std::collections::HashMap;
use std::sync::Arc;

use crate::protocol::{ErrorCode, NotificationCode, Packet};

/// Handler for one notification code.
///
/// The returned status is sent back in a Response packet when the
/// notification expects one; otherwise it is ignored.
pub type NotificationHandler = Arc<dyn Fn(&Packet) -> ErrorCode + Send + Sync>;

/// One handler per notification code.
#[derive(Clone)]
pub struct NotificationTable {
    handlers: HashMap<u8, NotificationHandler>,
}

impl NotificationTable {
    /// Table with the default handlers installed for every known code.
    pub fn new() -> Self {
        let mut handlers: HashMap<u8, NotificationHandler> = HashMap::new();
        for &code in NotificationCode::ALL {
            handlers.insert(code.as_wire(), Arc::new(default_handler));
        }
        Self { handlers }
    }

    /// Replace the handler for `code`.
    pub fn set<F>(&mut self, code: NotificationCode, handler: F)
    where
        F: Fn(&Packet) -> ErrorCode + Send + Sync + 'static,
    {
        self.handlers.insert(code.as_wire(), Arc::new(handler));
    }

    /// Look up the handler for a raw code.
    pub fn get(&self, code: u8) -> Option<NotificationHandler> {
        self.handlers.get(&code).cloned()
    }
}

impl Default for NotificationTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Liveness probes and client messages are acknowledged; the rest is logged.
fn default_handler(packet: &Packet) -> ErrorCode {
    match NotificationCode::from_wire(packet.code()) {
        Some(code) if code.expects_response() => ErrorCode::Success,
        Some(code) => {
            tracing::debug!(
                notification = code.name(),
                len = packet.packet_length(),
                "Unhandled notification"
            );
            ErrorCode::Success
        }
        None => {
            tracing::debug!(code = packet.code(), "Unknown notification code");
            ErrorCode::InvalidRequest
        }
    }
}
