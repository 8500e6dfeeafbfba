//! Signaling routes binding a [`PacketClient`] to its [`MediaSession`].

use std::sync::Arc;

use tracing::{debug, warn};

use super::MediaSession;
use crate::envelope::{Envelope, kinds};
use crate::protocol::PacketClient;

/// Register the session's handlers on `client`.
///
/// | kind         | action                              | reply   | order      |
/// |--------------|-------------------------------------|---------|------------|
/// | `initwebrtc` | open a transport, create the offer  | `offer` | own task   |
/// | `answer`     | apply the remote description        | none    | in order   |
/// | `candidate`  | add a remote candidate              | none    | in order   |
/// | input kinds  | forward to the input queue          | none    | in order   |
///
/// Negotiation may wait out a renegotiation delay, so it never holds up
/// the in-order lane.
pub fn attach(session: &Arc<MediaSession>, client: &PacketClient) {
    let s = Arc::clone(session);
    client.receive(kinds::INIT_WEBRTC, move |request: Envelope| {
        let session = Arc::clone(&s);
        async move {
            match session.negotiate(&request).await {
                Ok(offer) => Envelope::new(kinds::OFFER, offer),
                Err(e) => {
                    warn!("session {}: no offer: {e}", session.id());
                    Envelope::noop()
                }
            }
        }
    });

    let s = Arc::clone(session);
    client.receive_in_order(kinds::ANSWER, move |request: Envelope| {
        let session = Arc::clone(&s);
        async move {
            if let Err(e) = session.apply_remote_description(&request.payload).await {
                warn!("session {}: answer rejected: {e}", session.id());
            }
            Envelope::noop()
        }
    });

    let s = Arc::clone(session);
    client.receive_in_order(kinds::CANDIDATE, move |request: Envelope| {
        let session = Arc::clone(&s);
        async move {
            if let Err(e) = session.add_remote_candidate(&request.payload).await {
                debug!("session {}: candidate rejected: {e}", session.id());
            }
            Envelope::noop()
        }
    });

    for kind in kinds::INPUT {
        let s = Arc::clone(session);
        client.receive_in_order(kind, move |request: Envelope| {
            let session = Arc::clone(&s);
            async move {
                session.submit_input(&request).await;
                Envelope::noop()
            }
        });
    }
}
