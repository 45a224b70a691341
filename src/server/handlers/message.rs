//! Client-to-client messaging, relayed as notifications.

use bytes::Bytes;

use super::{required, MAX_MESSAGE_LEN};
use crate::handler::{HandlerContext, HandlerResult};
use crate::protocol::{ErrorCode, NotificationCode, Packet, PayloadReader, PayloadWriter};
use crate::server::TimeoutAction;

fn check_len(text: &[u8]) -> Result<(), ErrorCode> {
    if text.len() > MAX_MESSAGE_LEN {
        return Err(ErrorCode::InvalidParameters);
    }
    Ok(())
}

fn sender_name(ctx: &HandlerContext<'_>) -> Result<String, ErrorCode> {
    ctx.client()?
        .user()
        .map(str::to_string)
        .ok_or(ErrorCode::NotRegistered)
}

fn text_notification(sender: &str, message: &str) -> Bytes {
    let mut w = PayloadWriter::with_capacity(sender.len() + message.len() + 2);
    w.put_cstr(sender).put_cstr(message);
    w.finish()
}

pub(super) fn personal(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let mut r = PayloadReader::new(packet.payload());
    let user = required(&mut r)?;
    let message = r.cstr()?;
    check_len(user.as_bytes())?;

    let recipients: Vec<_> = ctx
        .state
        .registered_clients()
        .into_iter()
        .filter(|&(_, _, name)| name == user)
        .map(|(id, _, _)| id)
        .collect();
    if recipients.is_empty() {
        return Err(ErrorCode::NoSuchUser);
    }

    let body = text_notification(&sender_name(ctx)?, message);
    for id in recipients {
        ctx.state
            .notify(id, NotificationCode::PersonalMessage, body.clone(), None);
    }
    Ok(Bytes::new())
}

pub(super) fn broadcast(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let message = PayloadReader::new(packet.payload()).cstr()?;
    check_len(message.as_bytes())?;

    let body = text_notification(&sender_name(ctx)?, message);
    let recipients: Vec<_> = ctx
        .state
        .registered_clients()
        .into_iter()
        .map(|(id, _, _)| id)
        .filter(|&id| id != ctx.client)
        .collect();
    for id in recipients {
        ctx.state
            .notify(id, NotificationCode::BroadcastMessage, body.clone(), None);
    }
    Ok(Bytes::new())
}

/// Delivered with a response expected; silence is reported back to the
/// sender as ClientMessageTimeout.
pub(super) fn client(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let mut r = PayloadReader::new(packet.payload());
    let target_handle = r.u32()?;
    let message = r.rest();
    check_len(message)?;

    let target = ctx
        .state
        .find_client_by_handle(target_handle)
        .ok_or(ErrorCode::NoSuchClient)?;
    let sender = ctx.client()?.handle().ok_or(ErrorCode::NotRegistered)?;

    let mut w = PayloadWriter::with_capacity(4 + message.len());
    w.put_u32(sender).put_bytes(message);
    ctx.state.notify(
        target,
        NotificationCode::ClientMessage,
        w.finish(),
        Some(TimeoutAction::ClientMessage {
            originator: ctx.client,
            target_handle,
        }),
    );
    Ok(Bytes::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PacketType, RequestCode};
    use crate::server::test_support::TestServer;

    fn request(code: RequestCode, payload: &[u8]) -> Packet {
        Packet::with_payload(PacketType::Request, code.as_wire(), 1, payload)
    }

    #[tokio::test]
    async fn test_personal_message() {
        let mut server = TestServer::new();
        let (a, _pa) = server.add_named_client("alice");
        let (b, _pb) = server.add_named_client("bob");

        personal(&mut server.context(a), &request(RequestCode::PersonalMessage, b"bob\0hi\0")).unwrap();
        let outbox = server.state.take_outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].target, b);
        assert_eq!(outbox[0].code, NotificationCode::PersonalMessage);
        assert_eq!(&outbox[0].payload[..], b"alice\0hi\0");

        assert_eq!(
            personal(&mut server.context(a), &request(RequestCode::PersonalMessage, b"carol\0hi\0")),
            Err(ErrorCode::NoSuchUser)
        );
    }

    #[tokio::test]
    async fn test_personal_message_is_not_capped() {
        let mut server = TestServer::new();
        let (a, _pa) = server.add_named_client("alice");
        let (_b, _pb) = server.add_named_client("bob");

        let text = "x".repeat(10_000);
        let mut payload = b"bob\0".to_vec();
        payload.extend_from_slice(text.as_bytes());
        payload.push(0);
        personal(&mut server.context(a), &request(RequestCode::PersonalMessage, &payload)).unwrap();
        assert_eq!(server.state.take_outbox()[0].payload.len(), 6 + 10_001);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let mut server = TestServer::new();
        let (a, _pa) = server.add_named_client("alice");
        let (b, _pb) = server.add_named_client("bob");
        let (c, _pc) = server.add_named_client("carol");
        let (_u, _pu) = server.add_client(false);

        broadcast(&mut server.context(a), &request(RequestCode::BroadcastMessage, b"hello\0")).unwrap();
        let mut targets: Vec<_> = server.state.take_outbox().iter().map(|o| o.target).collect();
        targets.sort();
        assert_eq!(targets, vec![b, c]);

        let long = format!("{}\0", "y".repeat(256));
        assert_eq!(
            broadcast(&mut server.context(a), &request(RequestCode::BroadcastMessage, long.as_bytes())),
            Err(ErrorCode::InvalidParameters)
        );
    }

    #[tokio::test]
    async fn test_client_message() {
        let mut server = TestServer::new();
        let (a, _pa) = server.add_named_client("alice");
        let (b, _pb) = server.add_named_client("bob");
        let a_handle = server.state.client(a).unwrap().handle().unwrap();
        let b_handle = server.state.client(b).unwrap().handle().unwrap();

        let mut payload = b_handle.to_be_bytes().to_vec();
        payload.extend_from_slice(b"ping");
        client(&mut server.context(a), &request(RequestCode::ClientMessage, &payload)).unwrap();

        let outbox = server.state.take_outbox();
        assert_eq!(outbox[0].target, b);
        let mut r = PayloadReader::new(&outbox[0].payload);
        assert_eq!(r.u32().unwrap(), a_handle);
        assert_eq!(r.rest(), b"ping");
        assert_eq!(
            outbox[0].on_timeout,
            Some(TimeoutAction::ClientMessage {
                originator: a,
                target_handle: b_handle
            })
        );

        let payload = 9999u32.to_be_bytes();
        assert_eq!(
            client(&mut server.context(a), &request(RequestCode::ClientMessage, &payload)),
            Err(ErrorCode::NoSuchClient)
        );
    }
}
