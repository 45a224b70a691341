//! Database handles and index queries.

use bytes::Bytes;

use super::{names_reply, required};
use crate::handler::{HandlerContext, HandlerResult};
use crate::protocol::{Packet, PayloadReader, PayloadWriter};

const READ_ONLY_FLAG: u8 = 0x01;

pub(super) fn list(ctx: &mut HandlerContext<'_>, _packet: &Packet) -> HandlerResult {
    Ok(names_reply(&ctx.state.list_databases()))
}

fn open_or_create(ctx: &mut HandlerContext<'_>, packet: &Packet, create: bool) -> HandlerResult {
    let mut r = PayloadReader::new(packet.payload());
    let flags = r.u8()?;
    let name = required(&mut r)?;
    let password = r.opt_cstr()?;

    let passwords = ctx.state.info().passwords;
    let needs_password = if create {
        passwords.create_db
    } else {
        passwords.open_db
    };
    let user = ctx.client()?.user().map(str::to_string);
    ctx.state
        .check_password(needs_password, user.as_deref(), password)?;

    let read_only = flags & READ_ONLY_FLAG != 0;
    let handle = ctx
        .state
        .open_database(ctx.client, name, read_only, create)?;
    let mut w = PayloadWriter::new();
    w.put_u16(handle);
    Ok(w.finish())
}

pub(super) fn open(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    open_or_create(ctx, packet, false)
}

pub(super) fn create(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    open_or_create(ctx, packet, true)
}

pub(super) fn close(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let handle = PayloadReader::new(packet.payload()).u16()?;
    ctx.state.close_database(ctx.client, handle)?;
    Ok(Bytes::new())
}

pub(super) fn index_info(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let handle = PayloadReader::new(packet.payload()).u16()?;
    let db = ctx.state.database(ctx.client, handle)?;
    let store = db.store_ref();
    let frames = store.frame_names().len();
    let indexes = store.index_names();

    let mut w = PayloadWriter::new();
    w.put_u32(u32::try_from(frames).unwrap_or(u32::MAX))
        .put_u16(u16::try_from(indexes.len()).unwrap_or(u16::MAX));
    for name in &indexes {
        w.put_cstr(name);
    }
    Ok(w.finish())
}

pub(super) fn create_index(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let mut r = PayloadReader::new(packet.payload());
    let handle = r.u16()?;
    let slot = required(&mut r)?;
    ctx.state
        .database(ctx.client, handle)?
        .store()
        .create_index(slot)?;
    Ok(Bytes::new())
}

pub(super) fn db_index(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let mut r = PayloadReader::new(packet.payload());
    let handle = r.u16()?;
    let slot = r.opt_cstr()?.filter(|s| !s.is_empty());
    let db = ctx.state.database(ctx.client, handle)?;
    Ok(names_reply(&db.store_ref().frames_with_slot(slot)))
}

pub(super) fn indexed_retrieval(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let mut r = PayloadReader::new(packet.payload());
    let handle = r.u16()?;
    let slot = required(&mut r)?;
    let facet = required(&mut r)?;
    let filler = required(&mut r)?;
    let db = ctx.state.database(ctx.client, handle)?;
    Ok(names_reply(&db.store_ref().retrieve(slot, facet, filler)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorCode, PacketType, RequestCode};
    use crate::server::test_support::TestServer;

    fn request(code: RequestCode, payload: &[u8]) -> Packet {
        Packet::with_payload(PacketType::Request, code.as_wire(), 1, payload)
    }

    #[tokio::test]
    async fn test_open_close_and_list() {
        let mut server = TestServer::new();
        let (id, _peer) = server.add_client(true);

        let body = list(&mut server.context(id), &request(RequestCode::ListDatabases, b"")).unwrap();
        assert_eq!(&body[..], b"testdb\0");

        let body = open(&mut server.context(id), &request(RequestCode::OpenDatabase, b"\x01testdb\0"))
            .unwrap();
        assert_eq!(&body[..], &[0, 0]);
        assert!(server.state.database(id, 0).unwrap().open.read_only);

        close(&mut server.context(id), &request(RequestCode::CloseDatabase, &[0, 0])).unwrap();
        assert_eq!(
            close(&mut server.context(id), &request(RequestCode::CloseDatabase, &[0, 0])),
            Err(ErrorCode::NoSuchDatabase)
        );
    }

    #[tokio::test]
    async fn test_create_database() {
        let mut server = TestServer::new();
        let (id, _peer) = server.add_client(true);

        let packet = request(RequestCode::CreateDatabase, b"\0fresh\0");
        assert!(create(&mut server.context(id), &packet).is_ok());
        assert_eq!(create(&mut server.context(id), &packet), Err(ErrorCode::DatabaseExists));
        assert_eq!(server.state.list_databases(), vec!["fresh", "testdb"]);
        assert_eq!(
            open(&mut server.context(id), &request(RequestCode::OpenDatabase, b"\0\0")),
            Err(ErrorCode::InvalidParameters)
        );
    }

    #[tokio::test]
    async fn test_open_password() {
        let mut config = crate::config::NetConfig::default();
        config.passwords.open_db = true;
        config.users.insert("tester".into(), "pw".into());
        let mut server = TestServer::with_config(config);
        let (id, _peer) = server.add_named_client("tester");

        assert_eq!(
            open(&mut server.context(id), &request(RequestCode::OpenDatabase, b"\0testdb\0")),
            Err(ErrorCode::AccessDenied)
        );
        assert!(open(&mut server.context(id), &request(RequestCode::OpenDatabase, b"\0testdb\0pw\0"))
            .is_ok());
    }

    #[tokio::test]
    async fn test_indexes_and_retrieval() {
        let mut server = TestServer::new();
        let (id, _peer) = server.add_client(true);
        let handle = server.state.open_database(id, "testdb", false, false).unwrap();
        let h = handle.to_be_bytes();

        let mut payload = h.to_vec();
        payload.extend_from_slice(b"COLOR\0");
        create_index(&mut server.context(id), &request(RequestCode::CreateIndex, &payload)).unwrap();

        let body = index_info(&mut server.context(id), &request(RequestCode::GetIndexInfo, &h)).unwrap();
        let mut r = PayloadReader::new(&body);
        assert_eq!(r.u32().unwrap(), 3);
        assert_eq!(r.u16().unwrap(), 1);
        assert_eq!(r.cstr().unwrap(), "COLOR");

        let mut payload = h.to_vec();
        payload.extend_from_slice(b"COLOR\0");
        let body = db_index(&mut server.context(id), &request(RequestCode::GetDbIndex, &payload)).unwrap();
        assert_eq!(&body[..], b"APPLE\0");

        let body = db_index(&mut server.context(id), &request(RequestCode::GetDbIndex, &h)).unwrap();
        assert_eq!(&body[..], b"APPLE\0FRUIT\0THING\0");

        let mut payload = h.to_vec();
        payload.extend_from_slice(b"COLOR\0VALUE\0RED\0");
        let body = indexed_retrieval(
            &mut server.context(id),
            &request(RequestCode::IndexedRetrieval, &payload),
        )
        .unwrap();
        assert_eq!(&body[..], b"APPLE\0");
    }
}
