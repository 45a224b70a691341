//! Validated request payloads.
//!
//! Every constructor checks its arguments before building anything, so a
//! rejected request never reaches the transport.

use bytes::Bytes;

use crate::frames::{Frame, Relation};
use crate::protocol::{
    ErrorCode, Packet, PacketType, PayloadWriter, RequestCode, PROTOCOL_MAJOR, PROTOCOL_MINOR,
};

/// Longest message body accepted by broadcast and client messages, and the
/// longest recipient name of a personal message.
pub const MAX_MESSAGE_LEN: usize = 255;

type Built = Result<Request, ErrorCode>;

/// An open database on the server, or the null handle.
///
/// `RemoteDb::default()` is the null handle; every request taking one
/// rejects it with `InvalidParameters` before any I/O.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteDb {
    handle: Option<u16>,
    name: String,
    read_only: bool,
}

impl RemoteDb {
    pub(crate) fn opened(handle: u16, name: &str, read_only: bool) -> Self {
        Self {
            handle: Some(handle),
            name: name.to_string(),
            read_only,
        }
    }

    pub fn handle(&self) -> Option<u16> {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn mark_closed(&mut self) {
        self.handle = None;
    }
}

/// Whether a proxy update adds or erases a filler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProxyOp {
    Erase = 0,
    Add = 1,
}

/// A request ready to be sent: code plus encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    code: RequestCode,
    payload: Bytes,
}

fn db(db: &RemoteDb) -> Result<u16, ErrorCode> {
    db.handle.ok_or(ErrorCode::InvalidParameters)
}

/// A required string: non-empty, no embedded NUL.
fn text(s: &str) -> Result<&str, ErrorCode> {
    if s.is_empty() {
        return Err(ErrorCode::InvalidParameters);
    }
    opt_text(s)
}

/// A string that may be empty.
fn opt_text(s: &str) -> Result<&str, ErrorCode> {
    if s.contains('\0') {
        return Err(ErrorCode::InvalidParameters);
    }
    Ok(s)
}

fn capped(s: &[u8]) -> Result<(), ErrorCode> {
    if s.len() > MAX_MESSAGE_LEN {
        return Err(ErrorCode::InvalidParameters);
    }
    Ok(())
}

impl Request {
    fn new(code: RequestCode, payload: Bytes) -> Self {
        Self { code, payload }
    }

    fn empty(code: RequestCode) -> Self {
        Self::new(code, Bytes::new())
    }

    fn build<F>(code: RequestCode, fill: F) -> Built
    where
        F: FnOnce(&mut PayloadWriter) -> Result<(), ErrorCode>,
    {
        let mut w = PayloadWriter::new();
        fill(&mut w)?;
        Ok(Self::new(code, w.finish()))
    }

    /// db handle followed by required strings.
    fn db_strings(code: RequestCode, handle: &RemoteDb, strings: &[&str]) -> Built {
        Self::build(code, |w| {
            w.put_u16(db(handle)?);
            for s in strings {
                w.put_cstr(text(s)?);
            }
            Ok(())
        })
    }

    pub fn code(&self) -> RequestCode {
        self.code
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_packet(self) -> Packet {
        Packet::with_payload(PacketType::Request, self.code.as_wire(), 0, &self.payload)
    }

    pub fn identify() -> Self {
        Self::empty(RequestCode::Identify)
    }

    pub fn register(user: &str, password: Option<&str>, capabilities: u16) -> Built {
        Self::build(RequestCode::Register, |w| {
            w.put_u8(PROTOCOL_MAJOR)
                .put_u8(PROTOCOL_MINOR)
                .put_u16(capabilities)
                .put_cstr(text(user)?)
                .put_cstr(opt_text(password.unwrap_or(""))?);
            Ok(())
        })
    }

    pub fn unregister() -> Self {
        Self::empty(RequestCode::Unregister)
    }

    pub fn list_databases() -> Self {
        Self::empty(RequestCode::ListDatabases)
    }

    pub fn index_info(handle: &RemoteDb) -> Built {
        Self::db_strings(RequestCode::GetIndexInfo, handle, &[])
    }

    pub fn find_clients(pattern: Option<&str>) -> Built {
        Self::build(RequestCode::FindClients, |w| {
            if let Some(pattern) = pattern {
                w.put_cstr(opt_text(pattern)?);
            }
            Ok(())
        })
    }

    pub fn get_preferences() -> Self {
        Self::empty(RequestCode::GetPreferences)
    }

    pub fn set_preferences(data: &[u8]) -> Self {
        Self::new(RequestCode::SetPreferences, Bytes::copy_from_slice(data))
    }

    fn open_or_create(
        code: RequestCode,
        name: &str,
        read_only: bool,
        password: Option<&str>,
    ) -> Built {
        Self::build(code, |w| {
            w.put_u8(u8::from(read_only)).put_cstr(text(name)?);
            if let Some(password) = password {
                w.put_cstr(opt_text(password)?);
            }
            Ok(())
        })
    }

    pub fn open_database(name: &str, read_only: bool, password: Option<&str>) -> Built {
        Self::open_or_create(RequestCode::OpenDatabase, name, read_only, password)
    }

    pub fn create_database(name: &str, read_only: bool, password: Option<&str>) -> Built {
        Self::open_or_create(RequestCode::CreateDatabase, name, read_only, password)
    }

    pub fn close_database(handle: &RemoteDb) -> Built {
        Self::db_strings(RequestCode::CloseDatabase, handle, &[])
    }

    pub fn create_index(handle: &RemoteDb, slot: &str) -> Built {
        Self::db_strings(RequestCode::CreateIndex, handle, &[slot])
    }

    /// Frames having `slot`, or every frame.
    pub fn db_index(handle: &RemoteDb, slot: Option<&str>) -> Built {
        Self::build(RequestCode::GetDbIndex, |w| {
            w.put_u16(db(handle)?);
            if let Some(slot) = slot {
                w.put_cstr(text(slot)?);
            }
            Ok(())
        })
    }

    pub fn get_frame(handle: &RemoteDb, frame: &str) -> Built {
        Self::db_strings(RequestCode::GetFrame, handle, &[frame])
    }

    pub fn get_old_frame(handle: &RemoteDb, frame: &str) -> Built {
        Self::db_strings(RequestCode::GetOldFrame, handle, &[frame])
    }

    pub fn get_fillers(handle: &RemoteDb, frame: &str, slot: &str, facet: &str) -> Built {
        Self::db_strings(RequestCode::GetFillers, handle, &[frame, slot, facet])
    }

    pub fn lock_frame(handle: &RemoteDb, frame: &str) -> Built {
        Self::db_strings(RequestCode::LockFrame, handle, &[frame])
    }

    pub fn unlock_frame(handle: &RemoteDb, frame: &str) -> Built {
        Self::db_strings(RequestCode::UnlockFrame, handle, &[frame])
    }

    pub fn create_frame(handle: &RemoteDb, frame: &str) -> Built {
        Self::db_strings(RequestCode::CreateFrame, handle, &[frame])
    }

    fn frame_with_password(
        code: RequestCode,
        handle: &RemoteDb,
        frame: &str,
        password: Option<&str>,
    ) -> Built {
        Self::build(code, |w| {
            w.put_u16(db(handle)?).put_cstr(text(frame)?);
            if let Some(password) = password {
                w.put_cstr(opt_text(password)?);
            }
            Ok(())
        })
    }

    pub fn delete_frame(handle: &RemoteDb, frame: &str, password: Option<&str>) -> Built {
        Self::frame_with_password(RequestCode::DeleteFrame, handle, frame, password)
    }

    pub fn revert_frame(handle: &RemoteDb, frame: &str, password: Option<&str>) -> Built {
        Self::frame_with_password(RequestCode::RevertFrame, handle, frame, password)
    }

    pub fn update_frame(handle: &RemoteDb, frame: &Frame) -> Built {
        Self::build(RequestCode::UpdateFrame, |w| {
            text(frame.name())?;
            w.put_u16(db(handle)?).put_bytes(frame.to_string().as_bytes());
            Ok(())
        })
    }

    pub fn begin_transaction(handle: &RemoteDb) -> Built {
        Self::db_strings(RequestCode::BeginTransaction, handle, &[])
    }

    fn finish_transaction(code: RequestCode, handle: &RemoteDb, txn: u32) -> Built {
        Self::build(code, |w| {
            w.put_u16(db(handle)?).put_u32(txn);
            Ok(())
        })
    }

    pub fn end_transaction(handle: &RemoteDb, txn: u32) -> Built {
        Self::finish_transaction(RequestCode::EndTransaction, handle, txn)
    }

    pub fn abort_transaction(handle: &RemoteDb, txn: u32) -> Built {
        Self::finish_transaction(RequestCode::AbortTransaction, handle, txn)
    }

    pub fn personal_message(user: &str, message: &str) -> Built {
        Self::build(RequestCode::PersonalMessage, |w| {
            capped(user.as_bytes())?;
            w.put_cstr(text(user)?).put_cstr(opt_text(message)?);
            Ok(())
        })
    }

    pub fn broadcast_message(message: &str) -> Built {
        Self::build(RequestCode::BroadcastMessage, |w| {
            capped(message.as_bytes())?;
            w.put_cstr(opt_text(message)?);
            Ok(())
        })
    }

    pub fn client_message(target: u32, message: &[u8]) -> Built {
        Self::build(RequestCode::ClientMessage, |w| {
            capped(message)?;
            w.put_u32(target).put_bytes(message);
            Ok(())
        })
    }

    pub fn test_ancestry(handle: &RemoteDb, relation: Relation, frame: &str, ancestor: &str) -> Built {
        Self::build(RequestCode::TestAncestry, |w| {
            w.put_u16(db(handle)?)
                .put_u8(relation.as_wire())
                .put_cstr(text(frame)?)
                .put_cstr(text(ancestor)?);
            Ok(())
        })
    }

    pub fn check_restrictions(handle: &RemoteDb, frame: &str, slot: &str, filler: &str) -> Built {
        Self::db_strings(RequestCode::CheckRestrictions, handle, &[frame, slot, filler])
    }

    pub fn indexed_retrieval(handle: &RemoteDb, slot: &str, facet: &str, filler: &str) -> Built {
        Self::db_strings(RequestCode::IndexedRetrieval, handle, &[slot, facet, filler])
    }

    pub fn server_statistics() -> Self {
        Self::empty(RequestCode::ServerStatistics)
    }

    pub fn liveness_check() -> Self {
        Self::empty(RequestCode::LivenessCheck)
    }

    pub fn get_system_config(key: &str) -> Built {
        Self::build(RequestCode::GetSystemConfig, |w| {
            w.put_cstr(text(key)?);
            Ok(())
        })
    }

    pub fn set_system_config(key: &str, value: &str, password: Option<&str>) -> Built {
        Self::build(RequestCode::SetSystemConfig, |w| {
            w.put_cstr(text(key)?).put_cstr(opt_text(value)?);
            if let Some(password) = password {
                w.put_cstr(opt_text(password)?);
            }
            Ok(())
        })
    }

    pub fn get_user_data(key: &str) -> Built {
        Self::build(RequestCode::GetUserData, |w| {
            w.put_cstr(text(key)?);
            Ok(())
        })
    }

    pub fn set_user_data(key: &str, data: &[u8]) -> Built {
        Self::build(RequestCode::SetUserData, |w| {
            w.put_cstr(text(key)?).put_bytes(data);
            Ok(())
        })
    }

    pub fn proxy_update(
        handle: &RemoteDb,
        op: ProxyOp,
        frame: &str,
        slot: &str,
        facet: &str,
        filler: &str,
    ) -> Built {
        Self::build(RequestCode::ProxyUpdate, |w| {
            w.put_u16(db(handle)?).put_u8(op as u8);
            for s in [frame, slot, facet, filler] {
                w.put_cstr(text(s)?);
            }
            Ok(())
        })
    }

    pub fn inheritable_facets(handle: &RemoteDb, frame: &str, slot: &str) -> Built {
        Self::db_strings(RequestCode::InheritableFacets, handle, &[frame, slot])
    }

    pub fn inherit_all_fillers(
        handle: &RemoteDb,
        relation: Relation,
        frame: &str,
        slot: &str,
        facet: &str,
    ) -> Built {
        Self::build(RequestCode::InheritAllFillers, |w| {
            w.put_u16(db(handle)?).put_u8(relation.as_wire());
            for s in [frame, slot, facet] {
                w.put_cstr(text(s)?);
            }
            Ok(())
        })
    }
}
