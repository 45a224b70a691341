//! Everything the server knows, owned by the dispatcher task.
//!
//! Handlers mutate this through [`crate::handler::HandlerContext`]. Nothing
//! here is shared across tasks, so none of it is behind a lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::mem;
use std::time::Instant;

use bytes::Bytes;

use super::stats::{ServerStatistics, StatsCounters};
use crate::config::NetConfig;
use crate::connection::{Connection, ConnectionId};
use crate::event_list::EventId;
use crate::frames::{FrameBackend, FrameStore, LockOwner};
use crate::protocol::{ErrorCode, NotificationCode, PayloadWriter, ServerInfo};

/// Open database handles per connection.
pub const MAX_DATABASES: usize = 64;

/// What happens when a notification goes unanswered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Tell the originator its client message was not acknowledged.
    ClientMessage {
        originator: ConnectionId,
        target_handle: u32,
    },
    /// The client is presumed crashed and dropped.
    AreYouThere,
}

/// A notification waiting to be sent by the dispatcher.
#[derive(Debug)]
pub struct Outgoing {
    pub target: ConnectionId,
    pub code: NotificationCode,
    pub payload: Bytes,
    pub on_timeout: Option<TimeoutAction>,
}

/// One handle's view of an open database.
#[derive(Debug, Clone)]
pub struct OpenDb {
    pub name: String,
    pub read_only: bool,
    /// Lock-table identity of this handle.
    pub owner: LockOwner,
    pub transaction: Option<u32>,
}

/// A database resident in the server, shared by every handle on it.
pub(crate) struct SharedDatabase {
    pub(crate) store: Box<dyn FrameStore>,
    pub(crate) users: usize,
    /// Handle whose transaction currently holds the store's cache.
    pub(crate) txn_owner: Option<LockOwner>,
}

impl SharedDatabase {
    fn new(store: Box<dyn FrameStore>) -> Self {
        Self {
            store,
            users: 0,
            txn_owner: None,
        }
    }
}

/// Per-connection server state.
pub struct ClientState {
    pub(crate) conn: Connection,
    pub(crate) user: Option<String>,
    pub(crate) handle: u32,
    pub(crate) preferences: Bytes,
    pub(crate) databases: Vec<Option<OpenDb>>,
    pub(crate) last_activity: Instant,
    /// An AreYouThere is outstanding.
    pub(crate) probing: bool,
    /// Sequence number → timeout event of notifications awaiting a response.
    pub(crate) pending_notifications: HashMap<u8, EventId>,
}

impl ClientState {
    fn new(conn: Connection, now: Instant) -> Self {
        Self {
            conn,
            user: None,
            handle: 0,
            preferences: Bytes::new(),
            databases: (0..MAX_DATABASES).map(|_| None).collect(),
            last_activity: now,
            probing: false,
            pending_notifications: HashMap::new(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    #[inline]
    pub fn is_registered(&self) -> bool {
        self.user.is_some()
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Server-assigned client handle, once registered.
    pub fn handle(&self) -> Option<u32> {
        self.user.as_ref().map(|_| self.handle)
    }

    pub fn open_databases(&self) -> usize {
        self.databases.iter().filter(|d| d.is_some()).count()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }
}

/// A resolved database handle.
pub struct DbRef<'a> {
    pub handle: u16,
    pub open: &'a mut OpenDb,
    pub(crate) shared: &'a mut SharedDatabase,
}

impl DbRef<'_> {
    pub fn store(&mut self) -> &mut dyn FrameStore {
        self.shared.store.as_mut()
    }

    pub fn store_ref(&self) -> &dyn FrameStore {
        self.shared.store.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.open.name
    }

    /// Writes need a read-write handle and no other handle's transaction.
    pub fn ensure_writable(&self) -> Result<(), ErrorCode> {
        if self.open.read_only {
            return Err(ErrorCode::ReadOnlyDatabase);
        }
        match self.shared.txn_owner {
            Some(owner) if owner != self.open.owner => Err(ErrorCode::TransactionPending),
            _ => Ok(()),
        }
    }

    /// Fails with `FrameLocked` if another handle holds the frame's lock.
    pub fn ensure_not_locked_by_other(&self, frame: &str) -> Result<(), ErrorCode> {
        match self.shared.store.lock_owner(frame) {
            Some(owner) if owner != self.open.owner => Err(ErrorCode::FrameLocked),
            _ => Ok(()),
        }
    }
}

/// Server-wide state.
pub struct ServerState {
    pub(crate) config: NetConfig,
    pub(crate) info: ServerInfo,
    pub(crate) clients: BTreeMap<ConnectionId, ClientState>,
    pub(crate) databases: BTreeMap<String, SharedDatabase>,
    pub(crate) backend: Box<dyn FrameBackend>,
    pub(crate) stats: StatsCounters,
    pub(crate) system_config: BTreeMap<String, String>,
    pub(crate) user_data: HashMap<String, HashMap<String, Bytes>>,
    outbox: Vec<Outgoing>,
    dropped: Vec<ConnectionId>,
    next_handle: u32,
    next_txn: u32,
    next_owner: LockOwner,
}

impl ServerState {
    pub fn new(config: NetConfig, backend: Box<dyn FrameBackend>, now: Instant) -> Self {
        let info = ServerInfo::local(
            config.peer_mode,
            config.max_clients,
            MAX_DATABASES as u16,
            config.passwords,
        );
        Self {
            system_config: config.system.clone(),
            config,
            info,
            clients: BTreeMap::new(),
            databases: BTreeMap::new(),
            backend,
            stats: StatsCounters::new(now),
            user_data: HashMap::new(),
            outbox: Vec::new(),
            dropped: Vec::new(),
            next_handle: 1,
            next_txn: 1,
            next_owner: 1,
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn statistics(&self, now: Instant) -> ServerStatistics {
        self.stats.snapshot(now)
    }

    pub fn client(&self, id: ConnectionId) -> Option<&ClientState> {
        self.clients.get(&id)
    }

    pub fn client_mut(&mut self, id: ConnectionId) -> Option<&mut ClientState> {
        self.clients.get_mut(&id)
    }

    /// Connected clients, registered or not.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn registered_count(&self) -> usize {
        self.clients.values().filter(|c| c.is_registered()).count()
    }

    pub(crate) fn client_ids(&self) -> Vec<ConnectionId> {
        self.clients.keys().copied().collect()
    }

    pub(crate) fn add_client(&mut self, conn: Connection, now: Instant) -> ConnectionId {
        let id = conn.id();
        self.clients.insert(id, ClientState::new(conn, now));
        id
    }

    pub(crate) fn register_client(&mut self, id: ConnectionId, user: &str) -> Result<u32, ErrorCode> {
        let registered = self.registered_count();
        let max_clients = usize::from(self.config.max_clients);
        let client = self.clients.get_mut(&id).ok_or(ErrorCode::NoSuchClient)?;
        if client.is_registered() {
            return Err(ErrorCode::AlreadyRegistered);
        }
        if registered >= max_clients {
            return Err(ErrorCode::TooManyClients);
        }
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        client.user = Some(user.to_string());
        client.handle = handle;
        self.stats.client_registered();
        tracing::info!(conn = id, user, handle, "Client registered");
        Ok(handle)
    }

    /// Idempotent: an unregistered client is left alone.
    pub(crate) fn unregister_client(&mut self, id: ConnectionId) -> Result<(), ErrorCode> {
        let client = self.clients.get_mut(&id).ok_or(ErrorCode::NoSuchClient)?;
        if client.user.take().is_none() {
            return Ok(());
        }
        let open = take_open_databases(client);
        for (handle, db) in open {
            self.release_database(id, handle, db);
        }
        self.stats.client_gone(false);
        tracing::info!(conn = id, "Client unregistered");
        Ok(())
    }

    /// Forget a connection entirely, releasing everything it held.
    ///
    /// A still-registered client counts as crashed when `crashed` is set.
    pub(crate) fn remove_client(&mut self, id: ConnectionId, crashed: bool) -> bool {
        let Some(mut client) = self.clients.remove(&id) else {
            return false;
        };
        for (handle, db) in take_open_databases(&mut client) {
            self.release_database(id, handle, db);
        }
        if client.is_registered() {
            self.stats.client_gone(crashed);
            if crashed {
                tracing::warn!(conn = id, user = client.user(), "Client crashed");
            }
        }
        self.stats
            .notifications_settled(client.pending_notifications.len());
        client.conn.close();
        true
    }

    pub(crate) fn find_client_by_handle(&self, handle: u32) -> Option<ConnectionId> {
        self.clients
            .iter()
            .find(|(_, c)| c.handle() == Some(handle))
            .map(|(&id, _)| id)
    }

    /// Registered clients as (connection, handle, user).
    pub(crate) fn registered_clients(&self) -> Vec<(ConnectionId, u32, &str)> {
        self.clients
            .iter()
            .filter_map(|(&id, c)| Some((id, c.handle()?, c.user()?)))
            .collect()
    }

    /// Check `password` for `user` when `required`.
    pub(crate) fn check_password(
        &self,
        required: bool,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), ErrorCode> {
        if !required {
            return Ok(());
        }
        let expected = user.and_then(|u| self.config.users.get(u));
        match (expected, password) {
            (Some(expected), Some(given)) if expected == given => Ok(()),
            _ => Err(ErrorCode::AccessDenied),
        }
    }

    pub(crate) fn list_databases(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.backend.list().into_iter().collect();
        names.extend(self.databases.keys().cloned());
        names.into_iter().collect()
    }

    /// Open (or create) `name` for client `id`, returning the new handle.
    pub(crate) fn open_database(
        &mut self,
        id: ConnectionId,
        name: &str,
        read_only: bool,
        create: bool,
    ) -> Result<u16, ErrorCode> {
        if name.is_empty() {
            return Err(ErrorCode::InvalidParameters);
        }
        let slot = self
            .clients
            .get(&id)
            .ok_or(ErrorCode::NoSuchClient)?
            .databases
            .iter()
            .position(Option::is_none)
            .ok_or(ErrorCode::TooManyDatabases)?;

        if create {
            if self.databases.contains_key(name) || self.backend.list().iter().any(|n| n == name) {
                return Err(ErrorCode::DatabaseExists);
            }
            let store = self.backend.create(name)?;
            self.databases
                .insert(name.to_string(), SharedDatabase::new(store));
            tracing::info!(database = name, "Database created");
        } else if !self.databases.contains_key(name) {
            let store = self.backend.open(name)?;
            self.databases
                .insert(name.to_string(), SharedDatabase::new(store));
        }

        let owner = self.next_owner;
        self.next_owner += 1;
        if let Some(shared) = self.databases.get_mut(name) {
            shared.users += 1;
        }
        if let Some(client) = self.clients.get_mut(&id) {
            client.databases[slot] = Some(OpenDb {
                name: name.to_string(),
                read_only,
                owner,
                transaction: None,
            });
        }
        tracing::debug!(conn = id, database = name, handle = slot, read_only, "Database opened");
        Ok(slot as u16)
    }

    pub(crate) fn close_database(&mut self, id: ConnectionId, handle: u16) -> Result<(), ErrorCode> {
        let open = self
            .clients
            .get_mut(&id)
            .ok_or(ErrorCode::NoSuchClient)?
            .databases
            .get_mut(usize::from(handle))
            .and_then(Option::take)
            .ok_or(ErrorCode::NoSuchDatabase)?;
        self.release_database(id, handle, open);
        Ok(())
    }

    /// Resolve a client's database handle.
    pub fn database(&mut self, id: ConnectionId, handle: u16) -> Result<DbRef<'_>, ErrorCode> {
        let client = self.clients.get_mut(&id).ok_or(ErrorCode::NoSuchClient)?;
        let open = client
            .databases
            .get_mut(usize::from(handle))
            .and_then(Option::as_mut)
            .ok_or(ErrorCode::NoSuchDatabase)?;
        let shared = self
            .databases
            .get_mut(&open.name)
            .ok_or(ErrorCode::NoSuchDatabase)?;
        Ok(DbRef {
            handle,
            open,
            shared,
        })
    }

    /// Drop a handle: release its locks and abort its transaction.
    fn release_database(&mut self, id: ConnectionId, handle: u16, open: OpenDb) {
        let Some(shared) = self.databases.get_mut(&open.name) else {
            return;
        };
        shared.users = shared.users.saturating_sub(1);
        let released = shared.store.release_locks(open.owner);
        let aborted = open.transaction.is_some() && shared.txn_owner == Some(open.owner);
        if aborted {
            shared.txn_owner = None;
            if let Err(status) = shared.store.rollback() {
                tracing::debug!(database = %open.name, %status, "Implicit rollback failed");
            }
        }
        tracing::debug!(conn = id, database = %open.name, handle, "Database closed");

        if aborted {
            self.stats.transaction_ended(false);
            self.notify_frame(&open.name, id, NotificationCode::DiscardFrame, "");
        }
        for frame in released {
            self.notify_frame(&open.name, id, NotificationCode::FrameUnlocked, &frame);
        }
    }

    pub(crate) fn begin_transaction(&mut self, id: ConnectionId, handle: u16) -> Result<u32, ErrorCode> {
        let txn = self.next_txn;
        {
            let mut db = self.database(id, handle)?;
            if db.open.transaction.is_some() || db.shared.txn_owner.is_some() {
                return Err(ErrorCode::TransactionPending);
            }
            db.store().begin_transaction()?;
            db.shared.txn_owner = Some(db.open.owner);
            db.open.transaction = Some(txn);
        }
        self.next_txn = self.next_txn.wrapping_add(1).max(1);
        self.stats.transaction_begun();
        Ok(txn)
    }

    /// Commit or roll back the handle's transaction `txn`.
    pub(crate) fn finish_transaction(
        &mut self,
        id: ConnectionId,
        handle: u16,
        txn: u32,
        commit: bool,
    ) -> Result<(), ErrorCode> {
        let name = {
            let mut db = self.database(id, handle)?;
            if db.open.transaction != Some(txn) {
                return Err(ErrorCode::NoSuchTransaction);
            }
            if commit {
                db.store().commit()?;
            } else {
                db.store().rollback()?;
            }
            db.open.transaction = None;
            db.shared.txn_owner = None;
            db.open.name.clone()
        };
        self.stats.transaction_ended(commit);
        if !commit {
            self.notify_frame(&name, id, NotificationCode::DiscardFrame, "");
        }
        Ok(())
    }

    /// Queue a notification for the dispatcher to send.
    pub(crate) fn notify(
        &mut self,
        target: ConnectionId,
        code: NotificationCode,
        payload: Bytes,
        on_timeout: Option<TimeoutAction>,
    ) {
        self.outbox.push(Outgoing {
            target,
            code,
            payload,
            on_timeout,
        });
    }

    /// Notify every other registered connection with `db_name` open.
    ///
    /// `payload` builds the body from the recipient's own handle.
    pub(crate) fn notify_database_users<F>(
        &mut self,
        db_name: &str,
        except: ConnectionId,
        code: NotificationCode,
        payload: F,
    ) where
        F: Fn(u16) -> Bytes,
    {
        let mut targets = Vec::new();
        for (&id, client) in &self.clients {
            if id == except || !client.is_registered() {
                continue;
            }
            for (handle, slot) in client.databases.iter().enumerate() {
                if slot.as_ref().is_some_and(|db| db.name == db_name) {
                    targets.push((id, handle as u16));
                }
            }
        }
        for (id, handle) in targets {
            self.notify(id, code, payload(handle), None);
        }
    }

    /// The common (handle, frame) notification body.
    pub(crate) fn notify_frame(
        &mut self,
        db_name: &str,
        except: ConnectionId,
        code: NotificationCode,
        frame: &str,
    ) {
        self.notify_database_users(db_name, except, code, |handle| {
            let mut w = PayloadWriter::new();
            w.put_u16(handle).put_cstr(frame);
            w.finish()
        });
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<Outgoing> {
        mem::take(&mut self.outbox)
    }

    pub(crate) fn take_dropped(&mut self) -> Vec<ConnectionId> {
        mem::take(&mut self.dropped)
    }

    /// Schedule `id` for removal as a crashed client.
    pub(crate) fn drop_client(&mut self, id: ConnectionId) {
        if !self.dropped.contains(&id) {
            self.dropped.push(id);
        }
    }

    /// Record the timeout event of a notification just sent.
    pub(crate) fn notification_sent(
        &mut self,
        target: ConnectionId,
        seq: u8,
        event: Option<EventId>,
    ) {
        self.stats.notification_sent(event.is_some());
        if let (Some(event), Some(client)) = (event, self.clients.get_mut(&target)) {
            client.pending_notifications.insert(seq, event);
        }
    }

    /// Match a Response against an outstanding notification.
    ///
    /// Returns the timeout event to cancel.
    pub(crate) fn notification_answered(
        &mut self,
        id: ConnectionId,
        seq: u8,
        code: u8,
    ) -> Result<EventId, ErrorCode> {
        let client = self.clients.get_mut(&id).ok_or(ErrorCode::NoSuchClient)?;
        if !client.conn.complete_seq(seq, code) {
            tracing::debug!(conn = id, code, seq, "Unsolicited notification response");
            return Err(ErrorCode::InvalidParameters);
        }
        if code == NotificationCode::AreYouThere.as_wire() {
            client.probing = false;
        }
        let event = client
            .pending_notifications
            .remove(&seq)
            .ok_or(ErrorCode::InvalidParameters)?;
        self.stats.notifications_settled(1);
        Ok(event)
    }

    /// Timeout event body for an unanswered notification.
    pub(crate) fn notification_timed_out(
        &mut self,
        target: ConnectionId,
        seq: u8,
        code: NotificationCode,
        action: Option<TimeoutAction>,
    ) {
        let Some(client) = self.clients.get_mut(&target) else {
            return;
        };
        if client.pending_notifications.remove(&seq).is_none() {
            return;
        }
        client.conn.release_seq(seq);
        client.probing = false;
        self.stats.notifications_settled(1);
        tracing::warn!(conn = target, notification = code.name(), seq, "Notification not answered");

        match action {
            Some(TimeoutAction::ClientMessage {
                originator,
                target_handle,
            }) => {
                let mut w = PayloadWriter::new();
                w.put_u32(target_handle);
                self.notify(originator, NotificationCode::ClientMessageTimeout, w.finish(), None);
            }
            Some(TimeoutAction::AreYouThere) => self.drop_client(target),
            None => {}
        }
    }

    /// Probe every registered client idle for longer than the idle timeout.
    pub(crate) fn check_idle_clients(&mut self, now: Instant) {
        let idle = self.config.idle_timeout();
        let targets: Vec<ConnectionId> = self
            .clients
            .iter_mut()
            .filter(|(_, c)| {
                c.is_registered() && !c.probing && now.saturating_duration_since(c.last_activity) > idle
            })
            .map(|(&id, c)| {
                c.probing = true;
                id
            })
            .collect();
        for id in targets {
            tracing::debug!(conn = id, "Probing idle client");
            self.notify(
                id,
                NotificationCode::AreYouThere,
                Bytes::new(),
                Some(TimeoutAction::AreYouThere),
            );
        }
    }
}

fn take_open_databases(client: &mut ClientState) -> Vec<(u16, OpenDb)> {
    client
        .databases
        .iter_mut()
        .enumerate()
        .filter_map(|(handle, slot)| slot.take().map(|db| (handle as u16, db)))
        .collect()
}
