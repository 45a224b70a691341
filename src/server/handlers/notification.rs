use bytes::Bytes;

use crate::handler::{HandlerContext, HandlerResult};
use crate::protocol::{ErrorCode, Packet};

/// A client answered one of our notifications.
pub(super) fn response(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    if packet.status() != ErrorCode::Success {
        tracing::debug!(
            conn = ctx.client,
            code = packet.code(),
            status = %packet.status(),
            "Notification answered with failure"
        );
    }
    ctx.acknowledge_notification(packet.code())?;
    Ok(Bytes::new())
}
