//! Handler context.
//!
//! A handler runs with exclusive access to the server state and the event
//! list for the duration of one packet. Anything it wants to tell other
//! clients goes through the state's outbox and is sent by the dispatcher
//! after the handler's own reply.

use std::time::Instant;

use crate::connection::ConnectionId;
use crate::event_list::EventList;
use crate::server::{ClientState, ServerState};
use crate::protocol::ErrorCode;

/// Everything a handler may touch while it runs.
pub struct HandlerContext<'a> {
    pub state: &'a mut ServerState,
    pub events: &'a mut EventList<ServerState>,
    /// Connection the packet arrived on.
    pub client: ConnectionId,
    /// Sequence number of the packet being handled.
    pub seq: u8,
    pub now: Instant,
}

impl<'a> HandlerContext<'a> {
    pub fn new(
        state: &'a mut ServerState,
        events: &'a mut EventList<ServerState>,
        client: ConnectionId,
        seq: u8,
        now: Instant,
    ) -> Self {
        Self {
            state,
            events,
            client,
            seq,
            now,
        }
    }

    /// State of the requesting client.
    pub fn client(&self) -> Result<&ClientState, ErrorCode> {
        self.state.client(self.client).ok_or(ErrorCode::NoSuchClient)
    }

    pub fn client_mut(&mut self) -> Result<&mut ClientState, ErrorCode> {
        self.state
            .client_mut(self.client)
            .ok_or(ErrorCode::NoSuchClient)
    }

    pub fn is_registered(&self) -> bool {
        self.client().is_ok_and(ClientState::is_registered)
    }

    /// A Response to one of our notifications arrived on this connection.
    ///
    /// Frees the sequence number and cancels the pending timeout.
    pub fn acknowledge_notification(&mut self, code: u8) -> Result<(), ErrorCode> {
        let event = self.state.notification_answered(self.client, self.seq, code)?;
        self.events.cancel(event);
        Ok(())
    }
}
