use bytes::Bytes;

use crate::handler::{HandlerContext, HandlerResult};
use crate::protocol::{Packet, PayloadReader, PayloadWriter};

pub(super) fn begin(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    let handle = PayloadReader::new(packet.payload()).u16()?;
    let txn = ctx.state.begin_transaction(ctx.client, handle)?;
    let mut w = PayloadWriter::new();
    w.put_u32(txn);
    Ok(w.finish())
}

fn finish(ctx: &mut HandlerContext<'_>, packet: &Packet, commit: bool) -> HandlerResult {
    let mut r = PayloadReader::new(packet.payload());
    let handle = r.u16()?;
    let txn = r.u32()?;
    ctx.state
        .finish_transaction(ctx.client, handle, txn, commit)?;
    Ok(Bytes::new())
}

pub(super) fn end(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    finish(ctx, packet, true)
}

pub(super) fn abort(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    finish(ctx, packet, false)
}
