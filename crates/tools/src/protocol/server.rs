use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use strand_core::{Error, InvocationError, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use super::frame::{codec, Frame, FrameKind, HANDSHAKE_REQUIRED};
use crate::CapabilityRegistry;

const PROTOCOL_VIOLATION: &str = "ProtocolViolation";

/// Serves a registry over the data protocol.
///
/// Requests on one connection are handled concurrently, so responses may be
/// written in a different order than their requests arrived.
pub struct ProtocolServer {
    registry: Arc<CapabilityRegistry>,
}

impl ProtocolServer {
    pub fn new(registry: CapabilityRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Serve a single connection over this process's stdin/stdout.
    pub async fn serve_stdio(&self) -> Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve one connection until the peer closes it or sends an unreadable frame.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut frames = FramedRead::new(reader, codec());
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

        let writer_task = tokio::spawn(async move {
            let mut sink = FramedWrite::new(writer, codec());
            while let Some(body) = rx.recv().await {
                if let Err(e) = sink.send(body).await {
                    error!(error = %e, "Protocol write failed");
                    return Err(Error::Transport(format!("write failed: {}", e)));
                }
            }
            Ok(())
        });

        let mut handshaken = false;
        let outcome = loop {
            let body = match frames.next().await {
                Some(Ok(body)) => body,
                Some(Err(e)) => {
                    warn!(error = %e, "Unreadable frame, closing connection");
                    break Err(Error::Transport(format!("read failed: {}", e)));
                }
                None => {
                    debug!("Peer closed connection");
                    break Ok(());
                }
            };

            let frame = match Frame::decode(&body) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Malformed frame, closing connection");
                    break Err(e);
                }
            };

            let reply = match frame.kind {
                FrameKind::HandshakeRequest if handshaken => Some(Frame::handshake_refused(
                    InvocationError::new(PROTOCOL_VIOLATION, "handshake already completed"),
                )),
                FrameKind::HandshakeRequest => {
                    handshaken = true;
                    info!(capabilities = self.registry.len(), "Handshake accepted");
                    Some(Frame::handshake_response(&self.registry.descriptors())?)
                }
                FrameKind::InvokeRequest if !handshaken => Some(Frame::invoke_err(
                    frame.correlation_id,
                    InvocationError::new(HANDSHAKE_REQUIRED, "handshake must precede invocations"),
                )),
                FrameKind::InvokeRequest => self.dispatch(frame, tx.clone()),
                FrameKind::HandshakeResponse | FrameKind::InvokeResponse => Some(Frame::invoke_err(
                    frame.correlation_id,
                    InvocationError::new(PROTOCOL_VIOLATION, "server does not accept response frames"),
                )),
            };

            if let Some(reply) = reply {
                if tx.send(reply.encode()?).is_err() {
                    break Err(Error::Transport("writer stopped".to_string()));
                }
            }
        };

        // In-flight invocations keep their own senders; the writer drains them.
        drop(tx);
        match writer_task.await {
            Ok(Err(e)) if outcome.is_ok() => return Err(e),
            Err(e) => error!(error = %e, "Protocol writer task panicked"),
            _ => {}
        }
        outcome
    }

    /// Start one invocation in the background. Returns an immediate reply
    /// only when the request itself is unusable.
    fn dispatch(&self, frame: Frame, tx: mpsc::UnboundedSender<Bytes>) -> Option<Frame> {
        let (Some(correlation_id), Some(capability)) = (frame.correlation_id.clone(), frame.capability_name) else {
            return Some(Frame::invoke_err(
                frame.correlation_id,
                InvocationError::new(PROTOCOL_VIOLATION, "invoke-request needs correlation_id and capability_name"),
            ));
        };
        let arguments = frame.arguments.unwrap_or_else(|| json!({}));
        let registry = self.registry.clone();

        tokio::spawn(async move {
            debug!(correlation_id = %correlation_id, capability = %capability, "Invocation received");
            let response = match registry.invoke(&capability, arguments).await {
                Ok(output) => Frame::invoke_ok(&correlation_id, output),
                Err(e) => {
                    warn!(correlation_id = %correlation_id, capability = %capability, error = %e, "Invocation failed");
                    Frame::invoke_err(Some(correlation_id.clone()), InvocationError::from(&e))
                }
            };
            match response.encode() {
                Ok(body) => {
                    let _ = tx.send(body);
                }
                Err(e) => error!(correlation_id = %correlation_id, error = %e, "Failed to encode response"),
            }
        });
        None
    }
}
