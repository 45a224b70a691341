//! # framewire
//!
//! Client/server wire protocol for FramepaC frame databases.
//!
//! Clients talk to a frame server over TCP using small binary packets.
//! Payloads larger than the negotiated `max_datasize` are split into
//! fragments and reassembled on the other side. Several requests may be
//! outstanding on one connection at once; replies are matched by
//! sequence number, never by arrival order. The server pushes
//! notifications (frame locked, message received, are-you-there) that
//! some clients must acknowledge.
//!
//! ## Architecture
//!
//! - **Wire layer** ([`protocol`], [`queue`], [`writer`]): headers,
//!   fragmentation, reassembly and the outbound writer task
//! - **Connections** ([`connection`]): one reader and one writer task per
//!   socket, a 128-slot sequence table and notification handlers
//! - **Client** ([`client`]): the endpoint registry and typed request API
//! - **Server** ([`server`], [`handler`], [`event_list`]): a single
//!   dispatcher task owning all server state, the handler table and timed
//!   events
//! - **Frames** ([`frames`]): the frame-store interface the server calls,
//!   plus an in-memory backend
//!
//! ## Example
//!
//! ```no_run
//! use framewire::client::{ClientSession, Credentials, NetRuntime};
//! use framewire::config::NetConfig;
//! use framewire::frames::MemoryBackend;
//! use framewire::server::ServerDispatcher;
//!
//! #[tokio::main]
//! async fn main() -> framewire::Result<()> {
//!     let mut config = NetConfig::default();
//!     config.host = "127.0.0.1".to_string();
//!     config.port = Some(0);
//!     let backend = MemoryBackend::new().with_database("testdb", Vec::new());
//!     let mut server = ServerDispatcher::bind(config, backend).await?;
//!     let port = server.local_addr().map_or(0, |addr| addr.port());
//!     tokio::spawn(async move { server.run(std::future::pending::<()>()).await });
//!
//!     let runtime = NetRuntime::new();
//!     let session =
//!         ClientSession::connect(&runtime, "demo", "127.0.0.1", port, Some(Credentials::new("alice")))
//!             .await?;
//!     println!("{:?}", session.list_databases().await?);
//!     session.disconnect().await
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_list;
pub mod frames;
pub mod handler;
pub mod logging;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod writer;

pub use client::{ClientSession, Credentials, Endpoint, NetRuntime, RemoteDb, Request};
pub use config::NetConfig;
pub use connection::Connection;
pub use error::{FramewireError, Result};
pub use protocol::{ErrorCode, NotificationCode, RequestCode};
pub use server::ServerDispatcher;
