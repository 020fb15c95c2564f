use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use relaynode_core::envelope::PacketEnvelope;
use relaynode_core::events::DetachReason;
use relaynode_tunnel::{ClientChannel, Outbound, SessionRegistry};
use tracing::{Instrument, debug, info_span, warn};

/// Close code sent when the node refuses a session ("try again later").
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_NORMAL: u16 = 1000;

/// How long the writer gets to flush a final close frame.
const WRITER_FLUSH: Duration = Duration::from_secs(2);

/// Run one client's tunnel session over an upgraded WebSocket.
pub async fn serve(socket: WebSocket, session_id: String, registry: SessionRegistry, buffer: usize) {
    let span = info_span!("tunnel_session", session = %session_id);
    let (sink, stream) = socket.split();
    drive(sink, stream, session_id, registry, buffer)
        .instrument(span)
        .await
}

/// Session loop over any message sink/stream pair.
///
/// Inbound text frames are envelopes forwarded under `session_id`; the
/// registry's outbound queue is drained into `sink` by a writer task.
/// Returns once either side closes or the registry closes the channel.
/// A forced close gives the writer [`WRITER_FLUSH`] before aborting it,
/// so a peer that stopped reading cannot pin the session.
pub(crate) async fn drive<Si, St, E>(
    mut sink: Si,
    mut stream: St,
    session_id: String,
    registry: SessionRegistry,
    buffer: usize,
) where
    Si: Sink<Message, Error = E> + Unpin + Send + 'static,
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display + Send + 'static,
{
    let (channel, mut rx) = ClientChannel::new(&session_id, buffer);
    if let Err(e) = registry.attach(&session_id, channel.clone()) {
        warn!(error = %e, "Tunnel attach rejected");
        let code = if e.is_client_error() {
            CLOSE_POLICY_VIOLATION
        } else {
            CLOSE_TRY_AGAIN_LATER
        };
        let frame = CloseFrame {
            code,
            reason: e.to_string().into(),
        };
        let _ = sink.send(Message::Close(Some(frame))).await;
        return;
    }

    let mut writer = tokio::spawn(
        async move {
            while let Some(outbound) = rx.recv().await {
                match outbound {
                    Outbound::Control(message) => {
                        let text = match message.to_json() {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "Failed to encode control message");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            debug!(error = %e, "Tunnel write failed");
                            break;
                        }
                    }
                    Outbound::Close => {
                        let frame = CloseFrame {
                            code: CLOSE_NORMAL,
                            reason: "session closed".into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        break;
                    }
                }
            }
        }
        .in_current_span(),
    );

    let mut writer_done = false;
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    forward_frame(&registry, &session_id, text.as_str()).await;
                }
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => forward_frame(&registry, &session_id, text).await,
                    Err(_) => warn!(len = bytes.len(), "Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Tunnel read failed");
                    break;
                }
            },
            _ = &mut writer, if !writer_done => {
                writer_done = true;
                break;
            }
            _ = channel.closed() => {
                debug!("Tunnel channel closed by registry");
                break;
            }
        }
    }

    registry.detach_channel(&session_id, &channel, DetachReason::ChannelClosed);
    drop(channel);
    if !writer_done && tokio::time::timeout(WRITER_FLUSH, &mut writer).await.is_err() {
        debug!("Tunnel writer stalled, aborting");
        writer.abort();
    }
    drop(stream);
    debug!("Tunnel session ended");
}

async fn forward_frame(registry: &SessionRegistry, session_id: &str, text: &str) {
    let envelope = match PacketEnvelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Dropping malformed envelope");
            return;
        }
    };
    if let Err(e) = registry.forward(session_id, envelope).await {
        if e.is_client_error() {
            debug!(error = %e, "Packet rejected");
        } else {
            warn!(error = %e, "Packet forward failed");
        }
    }
}
