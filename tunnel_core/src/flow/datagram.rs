//! Datagram flow adapter.
//!
//! Datagram flows are connectionless: there is no open handshake, and each
//! datagram maps to exactly one `datagram` message in both directions.

use std::io;
use tracing::{debug, instrument, trace, warn};

use super::{Datagram, DatagramFlow, FlowContext, FlowError, FlowEvent, FlowInbox};
use crate::proto::message::{CloseMode, Message};
use crate::tunnel::error::{TunnelError, TunnelResult};
use crate::tunnel::types::FlowId;

enum Exit {
    /// The server closed the flow
    RemoteClosed,
    /// The application is done with the socket
    LocalClosed,
    Failed(io::Error),
    SessionGone,
}

/// Run one datagram flow until it closes.
#[instrument(name = "datagram_flow", skip_all, fields(flow_id = %id))]
pub async fn run_datagram_flow(
    id: FlowId,
    mut flow: Box<dyn DatagramFlow>,
    mut inbox: FlowInbox,
    ctx: FlowContext,
) -> TunnelResult<()> {
    let mut suspended = false;

    let exit = loop {
        tokio::select! {
            event = inbox.recv() => match event {
                Some(FlowEvent::Datagram(datagram)) => {
                    trace!(endpoint = %datagram.endpoint, bytes = datagram.payload.len(), "Delivering datagram");
                    if let Err(e) = flow.write_datagrams(vec![datagram]).await {
                        break Exit::Failed(e);
                    }
                }
                Some(FlowEvent::Close(_)) => break Exit::RemoteClosed,
                Some(FlowEvent::Suspend) => suspended = true,
                Some(FlowEvent::Resume) => suspended = false,
                Some(FlowEvent::OpenResult(_)) | Some(FlowEvent::Data(_)) => {
                    warn!("Ignoring stream message addressed to a datagram flow");
                }
                Some(FlowEvent::SessionClosed) | None => break Exit::SessionGone,
            },
            batch = flow.read_datagrams(), if !suspended => match batch {
                Ok(Some(datagrams)) => {
                    if forward(id, &ctx, datagrams).await.is_err() {
                        break Exit::SessionGone;
                    }
                }
                Ok(None) => break Exit::LocalClosed,
                Err(e) => break Exit::Failed(e),
            },
        }
    };

    let (reason, result) = match exit {
        Exit::RemoteClosed => {
            debug!("Server closed datagram flow");
            (None, Ok(()))
        }
        Exit::LocalClosed => {
            debug!("Application closed datagram flow");
            send_close(id, &ctx).await;
            (None, Ok(()))
        }
        Exit::Failed(e) => {
            warn!(error = %e, "Datagram flow I/O failed");
            send_close(id, &ctx).await;
            (Some(FlowError::Io(e.to_string())), Err(TunnelError::Io(e)))
        }
        Exit::SessionGone => (Some(FlowError::SessionClosed), Err(TunnelError::Closed)),
    };

    ctx.registry.unregister(id);
    flow.close(reason).await;
    result
}

/// One message per datagram; datagrams that cannot be framed are dropped.
async fn forward(id: FlowId, ctx: &FlowContext, datagrams: Vec<Datagram>) -> TunnelResult<()> {
    for datagram in datagrams {
        let message = Message::Datagram {
            flow_id: id,
            endpoint: datagram.endpoint,
            payload: datagram.payload,
        };
        if let Err(e) = message.check_fits(ctx.max_message_size) {
            warn!(error = %e, "Dropping datagram that cannot be framed");
            continue;
        }
        ctx.outbound.send(message).await?;
    }
    Ok(())
}

async fn send_close(id: FlowId, ctx: &FlowContext) {
    let close = Message::Close {
        flow_id: id,
        mode: CloseMode::All,
    };
    let _ = ctx.outbound.send(close).await;
}
