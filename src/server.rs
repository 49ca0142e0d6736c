//! TCP server: accept loop, per-connection dispatch, reply writer.
//!
//! Each accepted connection gets a read task and a writer task joined by an
//! mpsc channel, so slow peers never block dispatch. Every decoded request
//! is dispatched on its own task the moment it parses, so a slow handler
//! does not delay the requests behind it; replies go out through the writer
//! channel in completion order. A handler panic is caught and turned into
//! an internal error reply instead of taking the connection down.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{RelinkError, Result};
use crate::handler::{invocation_error, Registry};
use crate::protocol::{encode_line, LineDecoder, Request, RpcError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;

/// A restartable TCP server dispatching newline-delimited requests to
/// registered handlers.
pub struct Server {
    port: u16,
    host: String,
    registry: Arc<RwLock<Registry>>,
    running: Option<Running>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl Server {
    /// Create a server for `port` (0 picks a free port at start) listening
    /// on all interfaces.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            host: "0.0.0.0".to_string(),
            registry: Arc::new(RwLock::new(Registry::new())),
            running: None,
        }
    }

    /// Bind to a specific interface instead of all of them.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Register (or replace) the handler for `method`. May be called before
    /// or after [`start`](Self::start); connections already open see the
    /// change on their next request.
    pub async fn register<F, T, R, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        Fut: Future<Output = std::result::Result<R, RpcError>> + Send + 'static,
    {
        self.registry.write().await.register(method, handler);
    }

    /// Bind the listener and spawn the accept loop. Returns the bound
    /// address (useful with port 0).
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.running.is_some() {
            return Err(RelinkError::AlreadyRunning);
        }
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "listening");

        let (shutdown, rx) = watch::channel(false);
        let registry = Arc::clone(&self.registry);
        let accept_task = tokio::spawn(accept_loop(listener, registry, rx));
        self.running = Some(Running {
            shutdown,
            accept_task,
        });
        Ok(addr)
    }

    /// Stop accepting and drop every open connection. The server can be
    /// started again afterwards; registered handlers are kept.
    pub async fn close(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        let _ = running.accept_task.await;
        tracing::info!("stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<RwLock<Registry>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "connection accepted");
                    let (read_half, write_half) = stream.into_split();
                    let (reply_tx, reply_rx) = mpsc::channel::<Bytes>(64);
                    connections.spawn(write_replies(write_half, reply_rx));
                    connections.spawn(serve_connection(read_half, Arc::clone(&registry), reply_tx));
                }
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    connections.abort_all();
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(
    read_half: OwnedReadHalf,
    registry: Arc<RwLock<Registry>>,
    reply_tx: mpsc::Sender<Bytes>,
) {
    let peer = read_half.peer_addr().ok();
    // Requests dispatch as soon as they decode; a slow handler never holds
    // up the ones behind it. Dropping the set on connection teardown aborts
    // whatever is still running.
    let mut inflight = JoinSet::new();

    let mut decoder = LineDecoder::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        if let Err(error) = read_half.readable().await {
            tracing::debug!(peer = ?peer, %error, "connection closed");
            break;
        }
        match read_half.try_read(&mut buf) {
            Ok(0) => {
                tracing::debug!(peer = ?peer, "connection closed by peer");
                break;
            }
            Ok(n) => {
                let messages = match decoder.push(&buf[..n]) {
                    Ok(m) => m,
                    Err(error) => {
                        tracing::warn!(peer = ?peer, %error, "dropping connection");
                        break;
                    }
                };
                for msg in messages {
                    inflight.spawn(dispatch(msg, Arc::clone(&registry), reply_tx.clone()));
                }
                while inflight.try_join_next().is_some() {}
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(error) => {
                tracing::debug!(peer = ?peer, %error, "connection closed");
                break;
            }
        }
    }

    // Let in-flight handlers run to completion; the writer exits once the
    // last reply sender is gone.
    drop(reply_tx);
    while inflight.join_next().await.is_some() {}
}

async fn write_replies(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        if let Err(error) = write_half.write_all(&frame).await {
            tracing::debug!(%error, "reply write failed");
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Route one decoded inbound object. Notifications (no id) never produce a
/// reply, whatever goes wrong; requests always get exactly one.
async fn dispatch(msg: Value, registry: Arc<RwLock<Registry>>, replies: mpsc::Sender<Bytes>) {
    let request: Request = match serde_json::from_value(msg.clone()) {
        Ok(r) => r,
        Err(error) => {
            tracing::warn!(%error, "malformed request");
            // Shape is wrong but an id may still be salvageable; answer it
            // so the caller is not left hanging.
            if let Some(id) = msg.get("id").and_then(Value::as_u64) {
                send_error(&replies, id, RpcError::method_not_found()).await;
            }
            return;
        }
    };

    let handler = registry.read().await.get(&request.method);
    let Some(handler) = handler else {
        tracing::debug!(method = %request.method, "method not found");
        if let Some(id) = request.id {
            send_error(&replies, id, RpcError::method_not_found()).await;
        }
        return;
    };

    let fut = handler.call(request.params);
    // A separate task isolates handler panics from the connection.
    let outcome = match tokio::spawn(fut).await {
        Ok(outcome) => outcome,
        Err(join_err) => Err(invocation_error(panic_message(join_err))),
    };

    let Some(id) = request.id else {
        if let Err(error) = outcome {
            tracing::debug!(method = %request.method, %error, "notification handler failed");
        }
        return;
    };
    let reply = match outcome {
        Ok(result) => json!({"id": id, "result": result}),
        Err(error) => json!({"id": id, "error": error}),
    };
    let _ = replies.send(encode_line(&reply)).await;
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return "handler cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "handler panicked".to_string()
    }
}

async fn send_error(replies: &mpsc::Sender<Bytes>, id: u64, error: RpcError) {
    let reply = json!({"id": id, "error": error});
    let _ = replies.send(encode_line(&reply)).await;
}
