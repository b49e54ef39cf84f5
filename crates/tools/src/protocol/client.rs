use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use strand_core::{CapabilityDescriptor, Error, InvocationError, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error, warn};

use super::frame::{codec, error_from_wire, Frame, FrameKind};

/// A response is either transport-level failure or the server's own verdict.
type Reply = Result<std::result::Result<Value, InvocationError>>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>;
type FrameWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LengthDelimitedCodec>;

/// Shared failure state: once broken, every outstanding and future call fails.
#[derive(Clone)]
struct Connection {
    endpoint: String,
    pending: PendingMap,
    broken: Arc<AtomicBool>,
}

impl Connection {
    fn fail_all(&self, reason: &str) {
        let drained: Vec<_> = match self.pending.lock() {
            Ok(mut map) => {
                self.broken.store(true, Ordering::SeqCst);
                map.drain().map(|(_, tx)| tx).collect()
            }
            Err(_) => {
                self.broken.store(true, Ordering::SeqCst);
                Vec::new()
            }
        };
        if !drained.is_empty() {
            warn!(endpoint = %self.endpoint, count = drained.len(), reason, "Failing outstanding invocations");
        }
        for tx in drained {
            let _ = tx.send(Err(Error::Transport(reason.to_string())));
        }
    }

    /// Register a waiter for `id`, unless the connection is already broken.
    fn register(&self, id: &str) -> Result<oneshot::Receiver<Reply>> {
        let mut map = self
            .pending
            .lock()
            .map_err(|e| Error::Transport(format!("Pending map poisoned: {}", e)))?;
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("Endpoint '{}' is unusable", self.endpoint)));
        }
        let (tx, rx) = oneshot::channel();
        map.insert(id.to_string(), tx);
        Ok(rx)
    }

    fn take(&self, id: &str) -> Option<oneshot::Sender<Reply>> {
        self.pending.lock().ok().and_then(|mut map| map.remove(id))
    }
}

/// Drops a waiter whose caller stopped waiting (for example on timeout).
struct PendingGuard<'a> {
    conn: &'a Connection,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.conn.take(&self.id);
    }
}

/// Client side of the data protocol.
///
/// Supports many invocations in flight at once; responses are matched by
/// correlation id, not by arrival order.
pub struct ProtocolClient {
    conn: Connection,
    writer: AsyncMutex<FrameWriter>,
    next_id: AtomicU64,
    capabilities: Vec<CapabilityDescriptor>,
    _child: Option<AsyncMutex<Child>>,
}

impl ProtocolClient {
    /// Launch the data-owning process and handshake over its stdin/stdout.
    pub async fn spawn(
        endpoint: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::Transport(format!("{}: failed to spawn '{}': {}", endpoint, command, e))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport(format!("{}: no stdin", endpoint)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport(format!("{}: no stdout", endpoint)))?;

        let mut client = Self::connect(endpoint, stdout, stdin).await?;
        client._child = Some(AsyncMutex::new(child));
        Ok(client)
    }

    /// Handshake over an already-open byte stream.
    pub async fn connect<R, W>(endpoint: &str, reader: R, writer: W) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut reader = FramedRead::new(reader, codec());
        let boxed: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        let mut writer = FramedWrite::new(boxed, codec());

        let capabilities = Self::handshake(endpoint, &mut reader, &mut writer).await?;
        debug!(endpoint, count = capabilities.len(), "Protocol handshake complete");

        let conn = Connection {
            endpoint: endpoint.to_string(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            broken: Arc::new(AtomicBool::new(false)),
        };
        tokio::spawn(Self::reader_task(reader, conn.clone()));

        Ok(Self {
            conn,
            writer: AsyncMutex::new(writer),
            next_id: AtomicU64::new(1),
            capabilities,
            _child: None,
        })
    }

    async fn handshake<R>(
        endpoint: &str,
        reader: &mut FramedRead<R, LengthDelimitedCodec>,
        writer: &mut FrameWriter,
    ) -> Result<Vec<CapabilityDescriptor>>
    where
        R: AsyncRead + Unpin,
    {
        writer
            .send(Frame::handshake_request().encode()?)
            .await
            .map_err(|e| Error::Transport(format!("{}: handshake write failed: {}", endpoint, e)))?;

        let body = match reader.next().await {
            Some(Ok(body)) => body,
            Some(Err(e)) => {
                return Err(Error::Transport(format!("{}: handshake read failed: {}", endpoint, e)))
            }
            None => return Err(Error::Transport(format!("{}: closed during handshake", endpoint))),
        };
        let frame = Frame::decode(&body).map_err(|e| Error::Transport(format!("{}: {}", endpoint, e)))?;
        if frame.kind != FrameKind::HandshakeResponse {
            return Err(Error::Protocol(format!(
                "{}: expected handshake-response, got {:?}",
                endpoint, frame.kind
            )));
        }
        frame.capabilities()
    }

    pub fn endpoint(&self) -> &str {
        &self.conn.endpoint
    }

    /// Capabilities declared at handshake. Fixed for the connection lifetime.
    pub fn capabilities(&self) -> &[CapabilityDescriptor] {
        &self.capabilities
    }

    /// False once the stream has failed; the caller must connect again.
    pub fn is_usable(&self) -> bool {
        !self.conn.broken.load(Ordering::SeqCst)
    }

    pub async fn invoke(&self, capability: &str, arguments: Value) -> Result<Value> {
        if !self.capabilities.iter().any(|c| c.name == capability) {
            return Err(Error::UnknownCapability(capability.to_string()));
        }

        let id = format!("c-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let rx = self.conn.register(&id)?;
        let _guard = PendingGuard {
            conn: &self.conn,
            id: id.clone(),
        };

        let body = Frame::invoke_request(&id, capability, arguments).encode()?;
        debug!(endpoint = %self.conn.endpoint, correlation_id = %id, capability, "Protocol → invoke");
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.send(body).await {
                let reason = format!("write failed: {}", e);
                self.conn.fail_all(&reason);
                return Err(Error::Transport(reason));
            }
        }

        let reply = rx
            .await
            .map_err(|_| Error::Transport(format!("{}: connection closed", self.conn.endpoint)))??;
        reply.map_err(|e| error_from_wire(capability, &e))
    }

    /// Dispatch responses to their waiters until the stream ends or breaks.
    async fn reader_task<R>(mut reader: FramedRead<R, LengthDelimitedCodec>, conn: Connection)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let body = match reader.next().await {
                Some(Ok(body)) => body,
                Some(Err(e)) => {
                    error!(endpoint = %conn.endpoint, error = %e, "Protocol read error");
                    conn.fail_all(&format!("read failed: {}", e));
                    return;
                }
                None => {
                    error!(endpoint = %conn.endpoint, "Protocol stream closed");
                    conn.fail_all("stream closed");
                    return;
                }
            };

            let frame = match Frame::decode(&body) {
                Ok(frame) => frame,
                Err(e) => {
                    error!(endpoint = %conn.endpoint, error = %e, "Malformed frame from server");
                    conn.fail_all(&e.to_string());
                    return;
                }
            };

            if frame.kind != FrameKind::InvokeResponse {
                warn!(endpoint = %conn.endpoint, kind = ?frame.kind, "Ignoring unexpected frame");
                continue;
            }
            let Some(id) = frame.correlation_id.as_deref() else {
                warn!(endpoint = %conn.endpoint, "Response without correlation id");
                continue;
            };
            let Some(tx) = conn.take(id) else {
                debug!(endpoint = %conn.endpoint, correlation_id = id, "No waiter for response");
                continue;
            };
            debug!(endpoint = %conn.endpoint, correlation_id = id, "Protocol ← response");

            let reply = match frame.error {
                Some(err) => Err(err),
                None => Ok(frame.output.unwrap_or(Value::Null)),
            };
            let _ = tx.send(Ok(reply));
        }
    }
}
