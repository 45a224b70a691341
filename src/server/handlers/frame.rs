//! Frame reads, writes, locks and inheritance queries.
//!
//! Every mutation is announced to the other users of the same database
//! after it succeeds.

use bytes::Bytes;

use super::{bool_reply, names_reply, required};
use crate::frames::{Frame, Relation};
use crate::handler::{HandlerContext, HandlerResult};
use crate::protocol::{ErrorCode, NotificationCode, Packet, PayloadReader, PayloadWriter};

/// Database handle and frame name, the prefix shared by most requests here.
fn target(packet: &Packet) -> Result<(u16, &str, PayloadReader<'_>), ErrorCode> {
    let mut r = PayloadReader::new(packet.payload());
    let handle = r.u16()?;
    let frame = required(&mut r)?;
    Ok((handle, frame, r))
}

fn frame_text(frame: &Frame) -> Bytes {
    Bytes::from(frame.to_string())
}

pub(super) fn get(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let (handle, name, _) = target(packet)?;
    let db = ctx.state.database(ctx.client, handle)?;
    let frame = db.store_ref().get_frame(name).ok_or(ErrorCode::NoSuchFrame)?;
    Ok(frame_text(&frame))
}

pub(super) fn get_old(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let (handle, name, _) = target(packet)?;
    let db = ctx.state.database(ctx.client, handle)?;
    let frame = db
        .store_ref()
        .committed_frame(name)
        .ok_or(ErrorCode::NoSuchFrame)?;
    Ok(frame_text(&frame))
}

pub(super) fn get_fillers(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let (handle, name, mut r) = target(packet)?;
    let slot = required(&mut r)?;
    let facet = required(&mut r)?;
    let db = ctx.state.database(ctx.client, handle)?;
    Ok(names_reply(&db.store_ref().get_fillers(name, slot, facet)?))
}

pub(super) fn lock(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let (handle, name, _) = target(packet)?;
    let mut db = ctx.state.database(ctx.client, handle)?;
    db.ensure_writable()?;
    let owner = db.open.owner;
    db.store().lock_frame(name, owner)?;
    let db_name = db.open.name.clone();

    ctx.state
        .notify_frame(&db_name, ctx.client, NotificationCode::FrameLocked, name);
    Ok(Bytes::new())
}

pub(super) fn unlock(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let (handle, name, _) = target(packet)?;
    let mut db = ctx.state.database(ctx.client, handle)?;
    let owner = db.open.owner;
    db.store().unlock_frame(name, owner)?;
    let db_name = db.open.name.clone();

    ctx.state
        .notify_frame(&db_name, ctx.client, NotificationCode::FrameUnlocked, name);
    Ok(Bytes::new())
}

pub(super) fn create(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let (handle, name, _) = target(packet)?;
    let mut db = ctx.state.database(ctx.client, handle)?;
    db.ensure_writable()?;
    db.store().create_frame(name)?;
    let db_name = db.open.name.clone();

    ctx.state
        .notify_frame(&db_name, ctx.client, NotificationCode::FrameCreated, name);
    Ok(Bytes::new())
}

fn check_frame_password(
    ctx: &HandlerContext<'_>,
    needs_password: bool,
    password: Option<&str>,
) -> Result<(), ErrorCode> {
    let user = ctx.client()?.user();
    ctx.state.check_password(needs_password, user, password)
}

pub(super) fn delete(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let (handle, name, mut r) = target(packet)?;
    let password = r.opt_cstr()?;
    check_frame_password(ctx, ctx.state.info().passwords.delete_frame, password)?;

    let mut db = ctx.state.database(ctx.client, handle)?;
    db.ensure_writable()?;
    db.ensure_not_locked_by_other(name)?;
    db.store().delete_frame(name)?;
    let db_name = db.open.name.clone();

    ctx.state
        .notify_frame(&db_name, ctx.client, NotificationCode::FrameDeleted, name);
    Ok(Bytes::new())
}

pub(super) fn revert(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let (handle, name, mut r) = target(packet)?;
    let password = r.opt_cstr()?;
    check_frame_password(ctx, ctx.state.info().passwords.revert_frame, password)?;

    let mut db = ctx.state.database(ctx.client, handle)?;
    db.ensure_writable()?;
    db.ensure_not_locked_by_other(name)?;
    let frame = db.store().revert_frame(name)?;
    Ok(frame_text(&frame))
}

pub(super) fn update(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let mut r = PayloadReader::new(packet.payload());
    let handle = r.u16()?;
    let text = r.rest_str()?.trim_end_matches('\0');
    let frame = Frame::parse(text).map_err(|_| ErrorCode::InvalidParameters)?;
    let name = frame.name().to_string();

    let mut db = ctx.state.database(ctx.client, handle)?;
    db.ensure_writable()?;
    db.ensure_not_locked_by_other(&name)?;
    db.store().update_frame(frame)?;
    let db_name = db.open.name.clone();

    ctx.state
        .notify_frame(&db_name, ctx.client, NotificationCode::FrameUpdated, &name);
    Ok(Bytes::new())
}

pub(super) fn test_ancestry(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let mut r = PayloadReader::new(packet.payload());
    let handle = r.u16()?;
    let relation = Relation::from_wire(r.u8()?)?;
    let frame = required(&mut r)?;
    let ancestor = required(&mut r)?;
    let db = ctx.state.database(ctx.client, handle)?;
    Ok(bool_reply(db.store_ref().inherits(relation, frame, ancestor)?))
}

pub(super) fn check_restrictions(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let (handle, name, mut r) = target(packet)?;
    let slot = required(&mut r)?;
    let filler = required(&mut r)?;
    let db = ctx.state.database(ctx.client, handle)?;
    Ok(bool_reply(db.store_ref().check_restrictions(name, slot, filler)?))
}

pub(super) fn proxy_update(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let mut r = PayloadReader::new(packet.payload());
    let handle = r.u16()?;
    let op = r.u8()?;
    let frame = required(&mut r)?;
    let slot = required(&mut r)?;
    let facet = required(&mut r)?;
    let filler = required(&mut r)?;

    let mut db = ctx.state.database(ctx.client, handle)?;
    db.ensure_writable()?;
    db.ensure_not_locked_by_other(frame)?;
    match op {
        1 => db.store().add_filler(frame, slot, facet, filler)?,
        0 => db.store().erase_filler(frame, slot, facet, filler)?,
        _ => return Err(ErrorCode::InvalidParameters),
    }
    let db_name = db.open.name.clone();

    ctx.state.notify_database_users(
        &db_name,
        ctx.client,
        NotificationCode::ProxyUpdate,
        |recipient| {
            let mut w = PayloadWriter::new();
            w.put_u16(recipient)
                .put_u8(op)
                .put_cstr(frame)
                .put_cstr(slot)
                .put_cstr(facet)
                .put_cstr(filler);
            w.finish()
        },
    );
    Ok(Bytes::new())
}

pub(super) fn inheritable_facets(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let (handle, name, mut r) = target(packet)?;
    let slot = required(&mut r)?;
    let db = ctx.state.database(ctx.client, handle)?;
    Ok(names_reply(&db.store_ref().inheritable_facets(name, slot)?))
}

pub(super) fn inherit_all_fillers(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let mut r = PayloadReader::new(packet.payload());
    let handle = r.u16()?;
    let relation = Relation::from_wire(r.u8()?)?;
    let frame = required(&mut r)?;
    let slot = required(&mut r)?;
    let facet = required(&mut r)?;
    let db = ctx.state.database(ctx.client, handle)?;
    Ok(names_reply(
        &db.store_ref().inherit_fillers(relation, frame, slot, facet)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionId;
    use crate::protocol::{PacketType, RequestCode};
    use crate::server::test_support::TestServer;

    fn request(code: RequestCode, handle: u16, rest: &[u8]) -> Packet {
        let mut payload = handle.to_be_bytes().to_vec();
        payload.extend_from_slice(rest);
        Packet::with_payload(PacketType::Request, code.as_wire(), 1, &payload)
    }

    struct Fixture {
        server: TestServer,
        a: ConnectionId,
        b: ConnectionId,
        ha: u16,
        hb: u16,
        _peers: Vec<tokio::io::DuplexStream>,
    }

    fn fixture() -> Fixture {
        let mut server = TestServer::new();
        let (a, pa) = server.add_named_client("alice");
        let (b, pb) = server.add_named_client("bob");
        let ha = server.state.open_database(a, "testdb", false, false).unwrap();
        let hb = server.state.open_database(b, "testdb", false, false).unwrap();
        Fixture {
            server,
            a,
            b,
            ha,
            hb,
            _peers: vec![pa, pb],
        }
    }

    #[tokio::test]
    async fn test_lock_contention() {
        let mut f = fixture();
        let s = &mut f.server;

        lock(&mut s.context(f.a), &request(RequestCode::LockFrame, f.ha, b"APPLE\0")).unwrap();
        assert_eq!(
            lock(&mut s.context(f.b), &request(RequestCode::LockFrame, f.hb, b"APPLE\0")),
            Err(ErrorCode::AlreadyLocked)
        );
        assert_eq!(
            unlock(&mut s.context(f.b), &request(RequestCode::UnlockFrame, f.hb, b"APPLE\0")),
            Err(ErrorCode::NotLocked)
        );
        assert_eq!(
            delete(&mut s.context(f.b), &request(RequestCode::DeleteFrame, f.hb, b"APPLE\0")),
            Err(ErrorCode::FrameLocked)
        );

        unlock(&mut s.context(f.a), &request(RequestCode::UnlockFrame, f.ha, b"APPLE\0")).unwrap();
        lock(&mut s.context(f.b), &request(RequestCode::LockFrame, f.hb, b"APPLE\0")).unwrap();

        let outbox = s.state.take_outbox();
        let codes: Vec<_> = outbox.iter().map(|o| (o.target, o.code)).collect();
        assert_eq!(
            codes,
            vec![
                (f.b, NotificationCode::FrameLocked),
                (f.b, NotificationCode::FrameUnlocked),
                (f.a, NotificationCode::FrameLocked),
            ]
        );
        assert_eq!(&outbox[2].payload[..], b"\0\0APPLE\0");
    }

    #[tokio::test]
    async fn test_read_only_handle() {
        let mut f = fixture();
        let s = &mut f.server;
        let ro = s.state.open_database(f.a, "testdb", true, false).unwrap();

        for (code, rest) in [
            (RequestCode::LockFrame, &b"APPLE\0"[..]),
            (RequestCode::CreateFrame, b"PEAR\0"),
            (RequestCode::DeleteFrame, b"APPLE\0"),
            (RequestCode::UpdateFrame, b"[APPLE]"),
        ] {
            let registry = crate::server::handlers::build_registry();
            let outcome = registry.dispatch(&mut s.context(f.a), &request(code, ro, rest));
            assert_eq!(
                outcome,
                crate::handler::Outcome::Reply(ErrorCode::ReadOnlyDatabase, Bytes::new()),
                "{}",
                code.name()
            );
        }
        let body = get(&mut s.context(f.a), &request(RequestCode::GetFrame, ro, b"APPLE\0")).unwrap();
        assert!(body.starts_with(b"[APPLE"));
    }

    #[tokio::test]
    async fn test_update_and_get() {
        let mut f = fixture();
        let s = &mut f.server;

        create(&mut s.context(f.a), &request(RequestCode::CreateFrame, f.ha, b"FOO\0")).unwrap();
        assert_eq!(
            create(&mut s.context(f.a), &request(RequestCode::CreateFrame, f.ha, b"FOO\0")),
            Err(ErrorCode::FrameExists)
        );
        update(
            &mut s.context(f.a),
            &request(RequestCode::UpdateFrame, f.ha, b"[FOO[SLOT[VALUE 42]]]\0"),
        )
        .unwrap();
        assert_eq!(
            update(&mut s.context(f.a), &request(RequestCode::UpdateFrame, f.ha, b"[FOO[")),
            Err(ErrorCode::InvalidParameters)
        );

        let body = get(&mut s.context(f.b), &request(RequestCode::GetFrame, f.hb, b"FOO\0")).unwrap();
        assert_eq!(&body[..], b"[FOO[SLOT[VALUE 42]]]");
        let fillers = get_fillers(
            &mut s.context(f.b),
            &request(RequestCode::GetFillers, f.hb, b"FOO\0SLOT\0VALUE\0"),
        )
        .unwrap();
        assert_eq!(&fillers[..], b"42\0");
        assert_eq!(
            get(&mut s.context(f.b), &request(RequestCode::GetFrame, f.hb, b"NOPE\0")),
            Err(ErrorCode::NoSuchFrame)
        );
        assert_eq!(
            get(&mut s.context(f.b), &request(RequestCode::GetFrame, 9, b"FOO\0")),
            Err(ErrorCode::NoSuchDatabase)
        );

        let codes: Vec<_> = s.state.take_outbox().iter().map(|o| o.code).collect();
        assert_eq!(codes, vec![NotificationCode::FrameCreated, NotificationCode::FrameUpdated]);
    }

    #[tokio::test]
    async fn test_inheritance_queries() {
        let mut f = fixture();
        let s = &mut f.server;

        let body = test_ancestry(
            &mut s.context(f.a),
            &request(RequestCode::TestAncestry, f.ha, b"\0APPLE\0THING\0"),
        )
        .unwrap();
        assert_eq!(&body[..], &[1]);
        assert_eq!(
            test_ancestry(
                &mut s.context(f.a),
                &request(RequestCode::TestAncestry, f.ha, b"\x07APPLE\0THING\0"),
            ),
            Err(ErrorCode::UnknownInheritanceType)
        );

        let body = inherit_all_fillers(
            &mut s.context(f.a),
            &request(RequestCode::InheritAllFillers, f.ha, b"\0APPLE\0COLOR\0VALUE\0"),
        )
        .unwrap();
        assert_eq!(&body[..], b"RED\0");

        let body = inheritable_facets(
            &mut s.context(f.a),
            &request(RequestCode::InheritableFacets, f.ha, b"APPLE\0COLOR\0"),
        )
        .unwrap();
        assert_eq!(&body[..], b"VALUE\0");
    }

    #[tokio::test]
    async fn test_proxy_update_broadcast() {
        let mut f = fixture();
        let s = &mut f.server;

        proxy_update(
            &mut s.context(f.a),
            &request(RequestCode::ProxyUpdate, f.ha, b"\x01APPLE\0TASTE\0VALUE\0SWEET\0"),
        )
        .unwrap();
        let fillers = get_fillers(
            &mut s.context(f.b),
            &request(RequestCode::GetFillers, f.hb, b"APPLE\0TASTE\0VALUE\0"),
        )
        .unwrap();
        assert_eq!(&fillers[..], b"SWEET\0");

        let outbox = s.state.take_outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].target, f.b);
        assert_eq!(&outbox[0].payload[..], b"\0\0\x01APPLE\0TASTE\0VALUE\0SWEET\0");

        assert_eq!(
            proxy_update(
                &mut s.context(f.a),
                &request(RequestCode::ProxyUpdate, f.ha, b"\x05APPLE\0TASTE\0VALUE\0SWEET\0"),
            ),
            Err(ErrorCode::InvalidParameters)
        );
    }

    #[tokio::test]
    async fn test_revert_inside_transaction() {
        let mut f = fixture();
        let s = &mut f.server;

        s.state.begin_transaction(f.a, f.ha).unwrap();
        update(
            &mut s.context(f.a),
            &request(RequestCode::UpdateFrame, f.ha, b"[APPLE[COLOR[VALUE GREEN]]]"),
        )
        .unwrap();
        let body = revert(&mut s.context(f.a), &request(RequestCode::RevertFrame, f.ha, b"APPLE\0"))
            .unwrap();
        assert!(std::str::from_utf8(&body).unwrap().contains("RED"));
    }
}
