//! Client side: connection registry, sessions and request builders.
//!
//! # Example
//!
//! ```no_run
//! use framewire::client::{ClientSession, Credentials, NetRuntime};
//!
//! #[tokio::main]
//! async fn main() -> framewire::Result<()> {
//!     let runtime = NetRuntime::new();
//!     let session = ClientSession::connect(
//!         &runtime,
//!         "example",
//!         "localhost",
//!         framewire::config::SERVER_PORT,
//!         Some(Credentials::new("alice")),
//!     )
//!     .await?;
//!
//!     let mut db = session.open_database("testdb", false, None).await?;
//!     session.create_frame(&db, "FOO").await?;
//!     session.lock_frame(&db, "FOO").await?;
//!     let frame = session.get_frame(&db, "FOO").await?;
//!     println!("{}", frame);
//!     session.unlock_frame(&db, "FOO").await?;
//!     session.close_database(&mut db).await?;
//!     session.disconnect().await
//! }
//! ```

mod request;
mod runtime;
mod session;

pub use request::{ProxyOp, RemoteDb, Request, MAX_MESSAGE_LEN};
pub use runtime::{Endpoint, NetRuntime};
pub use session::{ClientInfo, ClientSession, Credentials, IndexInfo};
