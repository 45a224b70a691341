//! Client identity, preferences, statistics and the small key/value stores.

use bytes::Bytes;

use super::required;
use crate::codec::MsgPackCodec;
use crate::handler::{HandlerContext, HandlerResult};
use crate::protocol::{ErrorCode, Packet, PayloadReader, PayloadWriter, PROTOCOL_MAJOR};

pub(super) fn identify(ctx: &mut HandlerContext<'_>, _packet: &Packet) -> HandlerResult {
    Ok(Bytes::copy_from_slice(&ctx.state.info().encode()))
}

pub(super) fn register(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let mut r = PayloadReader::new(packet.payload());
    let major = r.u8()?;
    let _minor = r.u8()?;
    let _caps = r.u16()?;
    let user = required(&mut r)?;
    let password = r.opt_cstr()?;

    if major > PROTOCOL_MAJOR {
        return Err(ErrorCode::InvalidRequest);
    }
    let needs_password = ctx.state.info().passwords.register;
    ctx.state.check_password(needs_password, Some(user), password)?;

    let handle = ctx.state.register_client(ctx.client, user)?;
    let mut w = PayloadWriter::new();
    w.put_u32(handle);
    Ok(w.finish())
}

pub(super) fn unregister(ctx: &mut HandlerContext<'_>, _packet: &Packet) -> HandlerResult {
    ctx.state.unregister_client(ctx.client)?;
    Ok(Bytes::new())
}

/// `*` at the end of the pattern matches any suffix.
fn matches_pattern(pattern: &str, user: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => user.starts_with(prefix),
        None => pattern.is_empty() || pattern == user,
    }
}

pub(super) fn find_clients(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let mut r = PayloadReader::new(packet.payload());
    let pattern = r.opt_cstr()?.unwrap_or("");

    let mut w = PayloadWriter::new();
    for (_, handle, user) in ctx.state.registered_clients() {
        if matches_pattern(pattern, user) {
            w.put_u32(handle).put_cstr(user);
        }
    }
    Ok(w.finish())
}

pub(super) fn get_preferences(ctx: &mut HandlerContext<'_>, _packet: &Packet) -> HandlerResult {
    Ok(ctx.client()?.preferences.clone())
}

pub(super) fn set_preferences(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    ctx.client_mut()?.preferences = Bytes::copy_from_slice(packet.payload());
    Ok(Bytes::new())
}

pub(super) fn statistics(ctx: &mut HandlerContext<'_>, _packet: &Packet) -> HandlerResult {
    let stats = ctx.state.statistics(ctx.now);
    MsgPackCodec::encode(&stats)
        .map(Bytes::from)
        .map_err(|e| e.code())
}

pub(super) fn liveness(_ctx: &mut HandlerContext<'_>, _packet: &Packet) -> HandlerResult {
    Ok(Bytes::new())
}

pub(super) fn get_system_config(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let key = required(&mut PayloadReader::new(packet.payload()))?;
    let value = ctx
        .state
        .system_config
        .get(key)
        .ok_or(ErrorCode::InvalidParameters)?;
    let mut w = PayloadWriter::new();
    w.put_cstr(value);
    Ok(w.finish())
}

pub(super) fn set_system_config(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let mut r = PayloadReader::new(packet.payload());
    let key = required(&mut r)?;
    let value = r.cstr()?;
    let password = r.opt_cstr()?;

    let user = ctx.client()?.user().map(str::to_string);
    let needs_password = ctx.state.info().passwords.set_config;
    ctx.state.check_password(needs_password, user.as_deref(), password)?;

    tracing::info!(key, value, "System configuration changed");
    ctx.state
        .system_config
        .insert(key.to_string(), value.to_string());
    Ok(Bytes::new())
}

pub(super) fn get_user_data(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let key = required(&mut PayloadReader::new(packet.payload()))?;
    let user = ctx.client()?.user().ok_or(ErrorCode::NotRegistered)?;
    Ok(ctx
        .state
        .user_data
        .get(user)
        .and_then(|data| data.get(key))
        .cloned()
        .unwrap_or_default())
}

pub(super) fn set_user_data(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let mut r = PayloadReader::new(packet.payload());
    let key = required(&mut r)?.to_string();
    let data = Bytes::copy_from_slice(r.rest());
    let user = ctx
        .client()?
        .user()
        .ok_or(ErrorCode::NotRegistered)?
        .to_string();
    ctx.state
        .user_data
        .entry(user)
        .or_default()
        .insert(key, data);
    Ok(Bytes::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::protocol::{PacketType, RequestCode, ServerInfo};
    use crate::server::test_support::TestServer;
    use crate::server::ServerStatistics;

    fn request(code: RequestCode, payload: &[u8]) -> Packet {
        Packet::with_payload(PacketType::Request, code.as_wire(), 1, payload)
    }

    fn register_payload(user: &str, password: &str) -> Vec<u8> {
        let mut w = PayloadWriter::new();
        w.put_u8(1).put_u8(0).put_u16(0).put_cstr(user).put_cstr(password);
        w.finish().to_vec()
    }

    #[tokio::test]
    async fn test_identify_and_register() {
        let mut server = TestServer::new();
        let (id, _peer) = server.add_client(false);

        let body = identify(&mut server.context(id), &request(RequestCode::Identify, b"")).unwrap();
        let info = ServerInfo::decode(&body).unwrap();
        assert!(info.is_compatible());
        assert!(!info.is_peer());

        let packet = request(RequestCode::Register, &register_payload("alice", ""));
        let body = register(&mut server.context(id), &packet).unwrap();
        let handle = PayloadReader::new(&body).u32().unwrap();
        assert_eq!(server.state.client(id).unwrap().handle(), Some(handle));

        assert_eq!(
            register(&mut server.context(id), &packet),
            Err(ErrorCode::AlreadyRegistered)
        );
        unregister(&mut server.context(id), &request(RequestCode::Unregister, b"")).unwrap();
        unregister(&mut server.context(id), &request(RequestCode::Unregister, b"")).unwrap();
        assert!(!server.state.client(id).unwrap().is_registered());
    }

    #[tokio::test]
    async fn test_register_password() {
        let mut config = NetConfig::default();
        config.passwords.register = true;
        config.users.insert("alice".into(), "secret".into());
        let mut server = TestServer::with_config(config);
        let (id, _peer) = server.add_client(false);

        let bad = request(RequestCode::Register, &register_payload("alice", "guess"));
        assert_eq!(register(&mut server.context(id), &bad), Err(ErrorCode::AccessDenied));
        let good = request(RequestCode::Register, &register_payload("alice", "secret"));
        assert!(register(&mut server.context(id), &good).is_ok());
    }

    #[tokio::test]
    async fn test_find_clients() {
        let mut server = TestServer::new();
        let (_a, _pa) = server.add_named_client("alice");
        let (_b, _pb) = server.add_named_client("albert");
        let (c, _pc) = server.add_named_client("bob");

        let body = find_clients(&mut server.context(c), &request(RequestCode::FindClients, b"al*\0"))
            .unwrap();
        let mut r = PayloadReader::new(&body);
        let mut users = Vec::new();
        while !r.is_empty() {
            r.u32().unwrap();
            users.push(r.cstr().unwrap().to_string());
        }
        users.sort();
        assert_eq!(users, vec!["albert", "alice"]);

        let body = find_clients(&mut server.context(c), &request(RequestCode::FindClients, b""))
            .unwrap();
        assert!(body.ends_with(b"\0"));
        assert!(matches_pattern("bob", "bob"));
        assert!(!matches_pattern("bo", "bob"));
    }

    #[tokio::test]
    async fn test_preferences_and_user_data() {
        let mut server = TestServer::new();
        let (id, _peer) = server.add_client(true);

        set_preferences(&mut server.context(id), &request(RequestCode::SetPreferences, b"dark"))
            .unwrap();
        let prefs =
            get_preferences(&mut server.context(id), &request(RequestCode::GetPreferences, b""));
        assert_eq!(prefs.unwrap(), Bytes::from_static(b"dark"));

        set_user_data(&mut server.context(id), &request(RequestCode::SetUserData, b"k\0\x01\x02"))
            .unwrap();
        let data = get_user_data(&mut server.context(id), &request(RequestCode::GetUserData, b"k\0"));
        assert_eq!(data.unwrap(), Bytes::from_static(b"\x01\x02"));
        let data = get_user_data(&mut server.context(id), &request(RequestCode::GetUserData, b"x\0"));
        assert!(data.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_system_config() {
        let mut config = NetConfig::default();
        config.system.insert("motd".into(), "hello".into());
        let mut server = TestServer::with_config(config);
        let (id, _peer) = server.add_client(true);

        let value = get_system_config(
            &mut server.context(id),
            &request(RequestCode::GetSystemConfig, b"motd\0"),
        );
        assert_eq!(value.unwrap(), Bytes::from_static(b"hello\0"));
        assert_eq!(
            get_system_config(&mut server.context(id), &request(RequestCode::GetSystemConfig, b"x\0")),
            Err(ErrorCode::InvalidParameters)
        );

        set_system_config(
            &mut server.context(id),
            &request(RequestCode::SetSystemConfig, b"motd\0bye\0"),
        )
        .unwrap();
        assert_eq!(server.state.system_config["motd"], "bye");
    }

    #[tokio::test]
    async fn test_statistics_body_is_msgpack() {
        let mut server = TestServer::new();
        let (id, _peer) = server.add_client(true);
        let body = statistics(&mut server.context(id), &request(RequestCode::ServerStatistics, b""))
            .unwrap();
        let stats: ServerStatistics = MsgPackCodec::decode(&body).unwrap();
        assert_eq!(stats.current_clients, 1);
        assert_eq!(stats.total_registrations, 1);
    }
}
