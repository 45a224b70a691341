//! Application-facing request API.
//!
//! A [`ClientSession`] talks to one server over a connection borrowed from
//! a [`NetRuntime`]. Every request method validates its arguments before
//! anything is written, waits up to [`REPLY_TIMEOUT`] for the reply and
//! records the outcome in [`ClientSession::last_error`].
//!
//! [`REPLY_TIMEOUT`]: crate::connection::REPLY_TIMEOUT

use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use super::request::{ProxyOp, RemoteDb, Request};
use super::runtime::{Endpoint, NetRuntime};
use crate::codec::MsgPackCodec;
use crate::connection::Connection;
use crate::error::{FramewireError, Result};
use crate::frames::{Frame, Relation};
use crate::protocol::{ErrorCode, NotificationCode, Packet, PayloadReader, RequestCode, ServerInfo};
use crate::server::ServerStatistics;

/// User name and optional password presented at registration.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// One entry of a FindClients reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub handle: u32,
    pub user: String,
}

/// Reply to GetIndexInfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub frame_count: u32,
    pub indexes: Vec<String>,
}

fn malformed(what: &str, e: ErrorCode) -> FramewireError {
    FramewireError::Protocol(format!("malformed {} reply: {}", what, e))
}

fn into_body(reply: Packet) -> Result<Bytes> {
    match reply.status() {
        ErrorCode::Success => Ok(reply.into_payload()),
        status => Err(FramewireError::Status(status)),
    }
}

fn string_list(body: &[u8], what: &str) -> Result<Vec<String>> {
    let names = PayloadReader::new(body)
        .cstr_list()
        .map_err(|e| malformed(what, e))?;
    Ok(names.into_iter().map(str::to_string).collect())
}

fn frame_body(body: &[u8]) -> Result<Frame> {
    let text = std::str::from_utf8(body).map_err(|_| malformed("frame", ErrorCode::InvalidParameters))?;
    Frame::parse(text.trim_end_matches('\0')).map_err(|e| malformed("frame", e))
}

fn flag_body(body: &[u8]) -> Result<bool> {
    PayloadReader::new(body)
        .u8()
        .map(|b| b != 0)
        .map_err(|e| malformed("boolean", e))
}

/// A client's conversation with one server.
pub struct ClientSession {
    runtime: NetRuntime,
    endpoint: Endpoint,
    conn: Connection,
    /// Whether `conn` is still the runtime's shared connection.
    shared: bool,
    client_id: String,
    handle: Option<u32>,
    server_info: ServerInfo,
    last_error: Arc<AtomicU16>,
    released: bool,
}

impl ClientSession {
    /// Connect to `host:port`, identify the server, and register if
    /// credentials are given.
    ///
    /// Fails with `NoSuchServer` when the server cannot be reached or does
    /// not identify as a compatible FramepaC server or peer.
    pub async fn connect(
        runtime: &NetRuntime,
        client_id: impl Into<String>,
        host: &str,
        port: u16,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        let endpoint = Endpoint::new(host, port);
        let conn = runtime.connect(&endpoint).await?;
        Self::establish(runtime, endpoint, conn, client_id.into(), credentials).await
    }

    /// Like [`connect`](Self::connect) over an already-open stream.
    pub async fn attach<S>(
        runtime: &NetRuntime,
        client_id: impl Into<String>,
        endpoint: Endpoint,
        stream: S,
        credentials: Option<Credentials>,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = runtime.attach(endpoint.clone(), stream)?;
        Self::establish(runtime, endpoint, conn, client_id.into(), credentials).await
    }

    async fn establish(
        runtime: &NetRuntime,
        endpoint: Endpoint,
        conn: Connection,
        client_id: String,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        let server_info = match identify(&conn).await {
            Ok(info) if info.is_compatible() => info,
            Ok(info) => {
                tracing::warn!(
                    %endpoint,
                    signature = %info.signature,
                    major = info.protocol_major,
                    minor = info.protocol_minor,
                    "Incompatible server"
                );
                runtime.release(&endpoint, conn.id());
                return Err(ErrorCode::NoSuchServer.into());
            }
            Err(e) => {
                tracing::warn!(%endpoint, "Identification failed: {}", e);
                runtime.release(&endpoint, conn.id());
                return Err(ErrorCode::NoSuchServer.into());
            }
        };
        tracing::debug!(
            %endpoint,
            client = %client_id,
            peer = server_info.is_peer(),
            "Server identified"
        );

        let mut session = Self {
            runtime: runtime.clone(),
            endpoint,
            conn,
            shared: true,
            client_id,
            handle: None,
            server_info,
            last_error: Arc::new(AtomicU16::new(ErrorCode::Success.as_wire())),
            released: false,
        };
        if let Some(credentials) = credentials {
            session.register(&credentials).await?;
        }
        Ok(session)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Handle assigned by the server at registration.
    pub fn handle(&self) -> Option<u32> {
        self.handle
    }

    pub fn is_registered(&self) -> bool {
        self.handle.is_some()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Outcome of the most recent request.
    pub fn last_error(&self) -> ErrorCode {
        ErrorCode::from_wire(self.last_error.load(Ordering::Acquire)).unwrap_or(ErrorCode::ProtocolError)
    }

    fn record<T>(&self, result: &Result<T>) {
        let code = match result {
            Ok(_) => ErrorCode::Success,
            Err(e) => e.code(),
        };
        self.last_error.store(code.as_wire(), Ordering::Release);
    }

    /// Install the handler for one notification code.
    ///
    /// The handler's status is returned to the server for notifications
    /// that expect a response.
    pub fn on_notification<F>(&self, code: NotificationCode, handler: F)
    where
        F: Fn(&Packet) -> ErrorCode + Send + Sync + 'static,
    {
        self.conn.set_notification_handler(code, handler);
    }

    fn check_registered(&self, code: RequestCode) -> Result<()> {
        if code.requires_registration() && self.handle.is_none() {
            return Err(ErrorCode::NotRegistered.into());
        }
        Ok(())
    }

    async fn round_trip(&self, request: std::result::Result<Request, ErrorCode>) -> Result<Bytes> {
        let request = request?;
        self.check_registered(request.code())?;
        let reply = self.conn.call(request.into_packet()).await?;
        into_body(reply)
    }

    /// Validate, send, wait and unwrap the reply status.
    async fn execute(&self, request: std::result::Result<Request, ErrorCode>) -> Result<Bytes> {
        let result = self.round_trip(request).await;
        self.record(&result);
        result
    }

    async fn execute_unit(&self, request: std::result::Result<Request, ErrorCode>) -> Result<()> {
        self.execute(request).await.map(|_| ())
    }

    /// Send without waiting; `callback` gets the reply body or the failure.
    ///
    /// Returns the sequence number the request went out on.
    pub async fn submit<F>(&self, request: Request, callback: F) -> Result<u8>
    where
        F: FnOnce(Result<Bytes>) + Send + 'static,
    {
        let submitted = self.submit_inner(request, callback).await;
        self.record(&submitted);
        submitted
    }

    async fn submit_inner<F>(&self, request: Request, callback: F) -> Result<u8>
    where
        F: FnOnce(Result<Bytes>) + Send + 'static,
    {
        self.check_registered(request.code())?;
        let last_error = self.last_error.clone();
        let mut packet = request.into_packet();
        packet.set_recv_callback(move |reply| {
            let result = reply.and_then(into_body);
            let code = match &result {
                Ok(_) => ErrorCode::Success,
                Err(e) => e.code(),
            };
            last_error.store(code.as_wire(), Ordering::Release);
            callback(result);
        });
        self.conn.submit(packet).await
    }

    pub async fn identify(&self) -> Result<ServerInfo> {
        let body = self.execute(Ok(Request::identify())).await?;
        ServerInfo::decode(&body).map_err(|e| malformed("identify", e))
    }

    /// Register with the server and remember the assigned handle.
    ///
    /// The server tracks registration per socket, so a session sharing its
    /// connection with others first moves to a private one. Notification
    /// handlers installed before that move stay on the shared connection.
    pub async fn register(&mut self, credentials: &Credentials) -> Result<u32> {
        let request = match Request::register(&credentials.user, credentials.password.as_deref(), 0) {
            Ok(request) => request,
            Err(code) => {
                let failed = Err(code.into());
                self.record(&failed);
                return failed;
            }
        };
        if let Err(e) = self.go_private().await {
            let failed = Err(e);
            self.record(&failed);
            return failed;
        }
        let body = self.execute(Ok(request)).await?;
        let handle = PayloadReader::new(&body)
            .u32()
            .map_err(|e| malformed("register", e))?;
        tracing::info!(endpoint = %self.endpoint, user = %credentials.user, handle, "Registered");
        self.handle = Some(handle);
        Ok(handle)
    }

    /// Give up the client handle. Does nothing when not registered.
    pub async fn unregister(&mut self) -> Result<()> {
        if self.handle.is_none() {
            self.record(&Ok(()));
            return Ok(());
        }
        self.execute_unit(Ok(Request::unregister())).await?;
        self.handle = None;
        Ok(())
    }

    pub async fn list_databases(&self) -> Result<Vec<String>> {
        let body = self.execute(Ok(Request::list_databases())).await?;
        string_list(&body, "database list")
    }

    pub async fn index_info(&self, db: &RemoteDb) -> Result<IndexInfo> {
        let body = self.execute(Request::index_info(db)).await?;
        let mut r = PayloadReader::new(&body);
        let parse = |r: &mut PayloadReader<'_>| -> std::result::Result<IndexInfo, ErrorCode> {
            let frame_count = r.u32()?;
            let count = r.u16()?;
            let mut indexes = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                indexes.push(r.cstr()?.to_string());
            }
            Ok(IndexInfo { frame_count, indexes })
        };
        parse(&mut r).map_err(|e| malformed("index info", e))
    }

    /// Registered clients whose user name matches `pattern`.
    pub async fn find_clients(&self, pattern: Option<&str>) -> Result<Vec<ClientInfo>> {
        let body = self.execute(Request::find_clients(pattern)).await?;
        let mut r = PayloadReader::new(&body);
        let mut clients = Vec::new();
        while !r.is_empty() {
            let handle = r.u32().map_err(|e| malformed("client list", e))?;
            let user = r.cstr().map_err(|e| malformed("client list", e))?;
            clients.push(ClientInfo {
                handle,
                user: user.to_string(),
            });
        }
        Ok(clients)
    }

    pub async fn get_preferences(&self) -> Result<Bytes> {
        self.execute(Ok(Request::get_preferences())).await
    }

    pub async fn set_preferences(&self, data: &[u8]) -> Result<()> {
        self.execute_unit(Ok(Request::set_preferences(data))).await
    }

    async fn open_with(&self, request: std::result::Result<Request, ErrorCode>, name: &str, read_only: bool) -> Result<RemoteDb> {
        let body = self.execute(request).await?;
        let handle = PayloadReader::new(&body)
            .u16()
            .map_err(|e| malformed("open database", e))?;
        tracing::debug!(db = name, handle, read_only, "Database opened");
        Ok(RemoteDb::opened(handle, name, read_only))
    }

    pub async fn open_database(&self, name: &str, read_only: bool, password: Option<&str>) -> Result<RemoteDb> {
        self.open_with(Request::open_database(name, read_only, password), name, read_only)
            .await
    }

    pub async fn create_database(&self, name: &str, read_only: bool, password: Option<&str>) -> Result<RemoteDb> {
        self.open_with(Request::create_database(name, read_only, password), name, read_only)
            .await
    }

    /// Close `db`; the handle is unusable afterwards.
    pub async fn close_database(&self, db: &mut RemoteDb) -> Result<()> {
        self.execute_unit(Request::close_database(db)).await?;
        db.mark_closed();
        Ok(())
    }

    pub async fn create_index(&self, db: &RemoteDb, slot: &str) -> Result<()> {
        self.execute_unit(Request::create_index(db, slot)).await
    }

    pub async fn db_index(&self, db: &RemoteDb, slot: Option<&str>) -> Result<Vec<String>> {
        let body = self.execute(Request::db_index(db, slot)).await?;
        string_list(&body, "database index")
    }

    pub async fn get_frame(&self, db: &RemoteDb, frame: &str) -> Result<Frame> {
        let body = self.execute(Request::get_frame(db, frame)).await?;
        frame_body(&body)
    }

    /// The frame as it was before the current transaction touched it.
    pub async fn get_old_frame(&self, db: &RemoteDb, frame: &str) -> Result<Frame> {
        let body = self.execute(Request::get_old_frame(db, frame)).await?;
        frame_body(&body)
    }

    pub async fn get_fillers(&self, db: &RemoteDb, frame: &str, slot: &str, facet: &str) -> Result<Vec<String>> {
        let body = self.execute(Request::get_fillers(db, frame, slot, facet)).await?;
        string_list(&body, "fillers")
    }

    pub async fn lock_frame(&self, db: &RemoteDb, frame: &str) -> Result<()> {
        self.execute_unit(Request::lock_frame(db, frame)).await
    }

    pub async fn unlock_frame(&self, db: &RemoteDb, frame: &str) -> Result<()> {
        self.execute_unit(Request::unlock_frame(db, frame)).await
    }

    pub async fn create_frame(&self, db: &RemoteDb, frame: &str) -> Result<()> {
        self.execute_unit(Request::create_frame(db, frame)).await
    }

    pub async fn delete_frame(&self, db: &RemoteDb, frame: &str, password: Option<&str>) -> Result<()> {
        self.execute_unit(Request::delete_frame(db, frame, password)).await
    }

    /// Throw away local changes and get the stored version back.
    pub async fn revert_frame(&self, db: &RemoteDb, frame: &str, password: Option<&str>) -> Result<Frame> {
        let body = self.execute(Request::revert_frame(db, frame, password)).await?;
        frame_body(&body)
    }

    pub async fn update_frame(&self, db: &RemoteDb, frame: &Frame) -> Result<()> {
        self.execute_unit(Request::update_frame(db, frame)).await
    }

    pub async fn begin_transaction(&self, db: &RemoteDb) -> Result<u32> {
        let body = self.execute(Request::begin_transaction(db)).await?;
        PayloadReader::new(&body)
            .u32()
            .map_err(|e| malformed("begin transaction", e))
    }

    pub async fn end_transaction(&self, db: &RemoteDb, txn: u32) -> Result<()> {
        self.execute_unit(Request::end_transaction(db, txn)).await
    }

    pub async fn abort_transaction(&self, db: &RemoteDb, txn: u32) -> Result<()> {
        self.execute_unit(Request::abort_transaction(db, txn)).await
    }

    pub async fn personal_message(&self, user: &str, message: &str) -> Result<()> {
        self.execute_unit(Request::personal_message(user, message)).await
    }

    pub async fn broadcast_message(&self, message: &str) -> Result<()> {
        self.execute_unit(Request::broadcast_message(message)).await
    }

    /// Send opaque bytes to the client holding `target`.
    pub async fn client_message(&self, target: u32, message: &[u8]) -> Result<()> {
        self.execute_unit(Request::client_message(target, message)).await
    }

    pub async fn test_ancestry(&self, db: &RemoteDb, relation: Relation, frame: &str, ancestor: &str) -> Result<bool> {
        let body = self.execute(Request::test_ancestry(db, relation, frame, ancestor)).await?;
        flag_body(&body)
    }

    pub async fn check_restrictions(&self, db: &RemoteDb, frame: &str, slot: &str, filler: &str) -> Result<bool> {
        let body = self.execute(Request::check_restrictions(db, frame, slot, filler)).await?;
        flag_body(&body)
    }

    pub async fn indexed_retrieval(&self, db: &RemoteDb, slot: &str, facet: &str, filler: &str) -> Result<Vec<String>> {
        let body = self.execute(Request::indexed_retrieval(db, slot, facet, filler)).await?;
        string_list(&body, "retrieval")
    }

    pub async fn server_statistics(&self) -> Result<ServerStatistics> {
        let body = self.execute(Ok(Request::server_statistics())).await?;
        MsgPackCodec::decode(&body)
    }

    pub async fn liveness_check(&self) -> Result<()> {
        self.execute_unit(Ok(Request::liveness_check())).await
    }

    pub async fn get_system_config(&self, key: &str) -> Result<String> {
        let body = self.execute(Request::get_system_config(key)).await?;
        PayloadReader::new(&body)
            .cstr()
            .map(str::to_string)
            .map_err(|e| malformed("system config", e))
    }

    pub async fn set_system_config(&self, key: &str, value: &str, password: Option<&str>) -> Result<()> {
        self.execute_unit(Request::set_system_config(key, value, password)).await
    }

    pub async fn get_user_data(&self, key: &str) -> Result<Bytes> {
        self.execute(Request::get_user_data(key)).await
    }

    pub async fn set_user_data(&self, key: &str, data: &[u8]) -> Result<()> {
        self.execute_unit(Request::set_user_data(key, data)).await
    }

    pub async fn proxy_update(
        &self,
        db: &RemoteDb,
        op: ProxyOp,
        frame: &str,
        slot: &str,
        facet: &str,
        filler: &str,
    ) -> Result<()> {
        self.execute_unit(Request::proxy_update(db, op, frame, slot, facet, filler))
            .await
    }

    pub async fn proxy_add(&self, db: &RemoteDb, frame: &str, slot: &str, facet: &str, filler: &str) -> Result<()> {
        self.proxy_update(db, ProxyOp::Add, frame, slot, facet, filler).await
    }

    pub async fn proxy_delete(&self, db: &RemoteDb, frame: &str, slot: &str, facet: &str, filler: &str) -> Result<()> {
        self.proxy_update(db, ProxyOp::Erase, frame, slot, facet, filler).await
    }

    pub async fn inheritable_facets(&self, db: &RemoteDb, frame: &str, slot: &str) -> Result<Vec<String>> {
        let body = self.execute(Request::inheritable_facets(db, frame, slot)).await?;
        string_list(&body, "facet list")
    }

    pub async fn inherit_all_fillers(
        &self,
        db: &RemoteDb,
        relation: Relation,
        frame: &str,
        slot: &str,
        facet: &str,
    ) -> Result<Vec<String>> {
        let body = self
            .execute(Request::inherit_all_fillers(db, relation, frame, slot, facet))
            .await?;
        string_list(&body, "fillers")
    }

    /// Unregister if needed and let go of the connection.
    pub async fn disconnect(mut self) -> Result<()> {
        let unregistered = self.unregister().await;
        self.release();
        unregistered
    }

    /// Make sure nobody else sends on this session's connection.
    async fn go_private(&mut self) -> Result<()> {
        if !self.shared {
            return Ok(());
        }
        if self.runtime.claim(&self.endpoint, self.conn.id()) {
            self.shared = false;
            return Ok(());
        }

        let conn = self.runtime.connect_private(&self.endpoint).await?;
        match identify(&conn).await {
            Ok(info) if info.is_compatible() => {}
            Ok(_) | Err(_) => {
                conn.close();
                return Err(ErrorCode::NoSuchServer.into());
            }
        }
        tracing::debug!(
            endpoint = %self.endpoint,
            from = self.conn.id(),
            to = conn.id(),
            "Leaving shared connection"
        );
        self.runtime.release(&self.endpoint, self.conn.id());
        self.conn = conn;
        self.shared = false;
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.shared {
            self.runtime.release(&self.endpoint, self.conn.id());
        } else {
            self.conn.close();
        }
    }
}

async fn identify(conn: &Connection) -> Result<ServerInfo> {
    let reply = conn.call(Request::identify().into_packet()).await?;
    let body = into_body(reply)?;
    Ok(ServerInfo::decode(&body)?)
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("endpoint", &self.endpoint)
            .field("client_id", &self.client_id)
            .field("handle", &self.handle)
            .finish()
    }
}
