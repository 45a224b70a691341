//! Handler module - server-side request dispatch.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps request/notification codes to handlers
//! - [`HandlerContext`] - what a handler may touch while it runs
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use framewire::handler::{HandlerContext, HandlerRegistry, HandlerResult};
//! use framewire::protocol::{Packet, RequestCode};
//!
//! fn liveness(_ctx: &mut HandlerContext<'_>, _packet: &Packet) -> HandlerResult {
//!     Ok(Bytes::new())
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_request(RequestCode::LivenessCheck, 0, liveness);
//! assert_eq!(registry.name(RequestCode::LivenessCheck.as_wire()), Some("LivenessCheck"));
//! ```

mod context;
mod registry;

pub use context::HandlerContext;
pub use registry::{Handler, HandlerRegistry, HandlerResult, Outcome};
