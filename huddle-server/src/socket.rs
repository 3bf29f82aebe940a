use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use huddle_collab::Collab;
use huddle_core::{Envelope, Outbox, Outgoing, PeerConnection, PeerIdentity, RoomSession};
use log::{debug, warn};
use tokio::sync::mpsc;

/// Runs one room connection from upgrade to disconnect
pub async fn handle_socket(
    socket: WebSocket,
    collab: Arc<Collab>,
    identity: PeerIdentity,
    org: String,
    slug: String,
) {
    let (peer, outbox) = PeerConnection::new(identity);
    let (sink, mut stream) = socket.split();
    let (inbound_sender, mut inbound) = mpsc::unbounded_channel();

    let writer = tokio::spawn(write_frames(sink, outbox, peer.clone()));

    let reader = {
        let peer = peer.clone();

        tokio::spawn(async move {
            while let Some(Ok(message)) = stream.next().await {
                match message {
                    Message::Text(text) => {
                        if inbound_sender.send(text).is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }

            peer.mark_closed();
        })
    };

    if let Ok(session) = collab.rooms.join(&peer, &org, &slug).await {
        loop {
            tokio::select! {
                text = inbound.recv() => match text {
                    Some(text) => dispatch(&session, &peer, &text),
                    None => break,
                },
                _ = peer.closed() => break,
            }
        }

        session.remove(peer.id());
    }

    // Everything queued, like the close frame of a refused join, is written before this resolves
    let _ = writer.await;
    reader.abort();
}

/// Relays a text frame received from a peer to the rest of its session
fn dispatch(session: &RoomSession, peer: &PeerConnection, text: &str) {
    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Ignoring frame from {}: {}", peer.identity().display_name, e);
            return;
        }
    };

    if let Err(e) = session.dispatch(peer.id(), &envelope) {
        warn!(
            "Dropped {:?} from {} in {}: {}",
            envelope.kind,
            peer.identity().display_name,
            session.key(),
            e
        );
    }
}

/// Drains a connection's outbox into the socket until the connection closes
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbox: Outbox,
    peer: Arc<PeerConnection>,
) {
    loop {
        let outgoing = tokio::select! {
            biased;
            outgoing = outbox.recv() => outgoing,
            _ = peer.closed() => None,
        };

        match outgoing {
            Some(outgoing) => {
                if !write_frame(&mut sink, outgoing).await {
                    return;
                }
            }
            None => break,
        }
    }

    for outgoing in outbox.drain() {
        if !write_frame(&mut sink, outgoing).await {
            return;
        }
    }
}

/// Returns false once nothing more should be written
async fn write_frame(sink: &mut SplitSink<WebSocket, Message>, outgoing: Outgoing) -> bool {
    match outgoing {
        Outgoing::Envelope(envelope) => sink.send(Message::Text(envelope.to_text())).await.is_ok(),
        Outgoing::Close(code) => {
            let frame = CloseFrame {
                code,
                reason: "".into(),
            };

            let _ = sink.send(Message::Close(Some(frame))).await;
            false
        }
    }
}
