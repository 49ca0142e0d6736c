//! Client builder, handle, and the connection task.
//!
//! A [`Client`] is a cheap cloneable handle over an mpsc channel. One
//! spawned task per client owns the outbound buffer, the socket, and the
//! correlation state, and processes every command, socket event, and timer
//! as discrete sequential turns, so no locking is needed anywhere.
//!
//! Task lifecycle: idle (nothing to send, not eager) -> connecting (commands
//! still processed, requests buffer and may overflow) -> active (replay,
//! reads, correlation) -> back through a retry sleep on failure. With retry
//! disabled, a failed connection fails every buffered waiter with a
//! transport error and the task returns to idle; the next request triggers
//! a fresh attempt.

use std::io;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::error::{RelinkError, Result};
use crate::protocol::{default_encoder, Encoder, LineDecoder, Response, RpcError};
use crate::transport::{CallResult, Entry, Outbound};

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default outbound buffer capacity.
pub const DEFAULT_MAX_BUFFERED: usize = 100;

/// Default delay between reconnect attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

const READ_BUF_SIZE: usize = 64 * 1024;

/// Error string surfaced to waiters when the transport gives up.
const CONNECT_FAILED: &str = "connect failed";

/// Builder for configuring and creating a [`Client`].
pub struct ClientBuilder {
    port: u16,
    host: String,
    protocol_version: Option<String>,
    connect_timeout: Option<Duration>,
    max_buffered: usize,
    connect_immediately: bool,
    retry: bool,
    retry_delay: Duration,
    encoder: Encoder,
}

impl ClientBuilder {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            host: "127.0.0.1".to_string(),
            protocol_version: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            max_buffered: DEFAULT_MAX_BUFFERED,
            connect_immediately: false,
            retry: true,
            retry_delay: DEFAULT_RETRY_DELAY,
            encoder: default_encoder(),
        }
    }

    /// Remote host to connect to. Default: `127.0.0.1`.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Stamp this value into the `jsonrpc` field of every request.
    pub fn protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = Some(version.into());
        self
    }

    /// Connect attempt timeout. A zero duration disables the timeout.
    /// Default: 10 seconds.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Outbound buffer capacity; the oldest entry is evicted past this.
    /// Default: 100.
    pub fn max_buffered(mut self, capacity: usize) -> Self {
        self.max_buffered = capacity;
        self
    }

    /// Connect as soon as the client is built rather than on the first
    /// request. Default: false.
    pub fn connect_immediately(mut self, eager: bool) -> Self {
        self.connect_immediately = eager;
        self
    }

    /// Reconnect automatically after transport failure. Default: true.
    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    /// Delay between reconnect attempts. Default: 100 ms.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Replace the wire encoder. Default: JSON text plus trailing newline.
    pub fn encoder(mut self, encoder: Encoder) -> Self {
        self.encoder = encoder;
        self
    }

    /// Spawn the connection task and return the handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let overflow = Box::new(|entry: Entry| {
            if entry.completed {
                return;
            }
            if let Some(waiter) = entry.waiter {
                tracing::debug!(seq = entry.seq, "evicting oldest buffered request");
                let _ = waiter.send(Err(RpcError::overflow()));
            }
        });
        let outbound = Outbound::new(self.max_buffered, self.encoder.clone(), overflow);
        let task = ClientTask {
            rx,
            outbound,
            host: self.host,
            port: self.port,
            protocol_version: self.protocol_version,
            connect_timeout: self.connect_timeout,
            retry: self.retry,
            retry_delay: self.retry_delay,
            next_id: 1,
        };
        tokio::spawn(task.run(self.connect_immediately));
        Client { tx }
    }
}

/// Handle to a running client.
#[derive(Clone)]
pub struct Client {
    tx: mpsc::UnboundedSender<Command>,
}

impl Client {
    /// Create a builder targeting `port` on the default host.
    pub fn builder(port: u16) -> ClientBuilder {
        ClientBuilder::new(port)
    }

    /// Issue a request and wait for its reply.
    ///
    /// `Value::Null` params are omitted from the wire object. Transport
    /// failures surface as code `-32300`, buffer overflow as `-32000`.
    pub async fn call(&self, method: &str, params: impl Serialize) -> CallResult {
        self.request(method, params, None).await
    }

    /// Like [`call`](Self::call), with extra top-level fields merged into
    /// the request object (the `method`/`id` fields win on collision).
    pub async fn call_with_fields(
        &self,
        method: &str,
        params: impl Serialize,
        fields: Map<String, Value>,
    ) -> CallResult {
        self.request(method, params, Some(fields)).await
    }

    async fn request(
        &self,
        method: &str,
        params: impl Serialize,
        fields: Option<Map<String, Value>>,
    ) -> CallResult {
        let params = into_params(params)?;
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Request {
                method: method.to_string(),
                params,
                fields,
                waiter: Some(tx),
            })
            .map_err(|_| RpcError::transport("client closed"))?;
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::transport("client closed")),
        }
    }

    /// Fire-and-forget notification: no id, no reply, never resent once
    /// the transport confirms it was sent.
    pub fn notify(&self, method: &str, params: impl Serialize) -> Result<()> {
        let params = serde_json::to_value(params)?;
        let params = (!params.is_null()).then_some(params);
        self.tx
            .send(Command::Request {
                method: method.to_string(),
                params,
                fields: None,
                waiter: None,
            })
            .map_err(|_| RelinkError::Closed)
    }

    /// Shut the connection down and stop the task. Idempotent; no further
    /// requests will be delivered, and their waiters observe a transport
    /// error.
    pub fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }
}

fn into_params(params: impl Serialize) -> std::result::Result<Option<Value>, RpcError> {
    let value = serde_json::to_value(params)
        .map_err(|e| RpcError::new(crate::protocol::codes::INTERNAL_ERROR, e.to_string()))?;
    Ok((!value.is_null()).then_some(value))
}

enum Command {
    Request {
        method: String,
        params: Option<Value>,
        fields: Option<Map<String, Value>>,
        waiter: Option<oneshot::Sender<CallResult>>,
    },
    Close,
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Shutdown,
}

enum ConnectOutcome {
    Connected(TcpStream),
    GiveUp,
    Shutdown,
}

enum DriveOutcome {
    Disconnected,
    Shutdown,
}

struct ClientTask {
    rx: mpsc::UnboundedReceiver<Command>,
    outbound: Outbound,
    host: String,
    port: u16,
    protocol_version: Option<String>,
    connect_timeout: Option<Duration>,
    retry: bool,
    retry_delay: Duration,
    next_id: u64,
}

impl ClientTask {
    async fn run(mut self, mut eager: bool) {
        loop {
            if !eager && self.outbound.is_empty() {
                // Idle: wait for a reason to connect.
                match self.rx.recv().await {
                    None => return,
                    Some(cmd) => {
                        if self.apply(cmd) == Flow::Shutdown {
                            return;
                        }
                    }
                }
                continue;
            }

            let stream = match self.connect_phase().await {
                ConnectOutcome::Connected(s) => s,
                ConnectOutcome::GiveUp => {
                    eager = false;
                    continue;
                }
                ConnectOutcome::Shutdown => return,
            };

            match self.drive(stream).await {
                DriveOutcome::Shutdown => return,
                DriveOutcome::Disconnected => {
                    if self.retry {
                        if self.sleep_retry().await == Flow::Shutdown {
                            return;
                        }
                        eager = true;
                    } else {
                        tracing::error!("connection failed with retry disabled");
                        self.fail_all(CONNECT_FAILED);
                        eager = false;
                    }
                }
            }
        }
    }

    /// Open a connection, retrying per configuration. Commands keep being
    /// processed while waiting, so requests buffer (and may overflow)
    /// before the socket exists.
    async fn connect_phase(&mut self) -> ConnectOutcome {
        loop {
            let addr = format!("{}:{}", self.host, self.port);
            tracing::debug!(%addr, "connecting");
            let attempt = attempt_connect(addr, self.connect_timeout);
            tokio::pin!(attempt);
            let result = loop {
                tokio::select! {
                    res = &mut attempt => break res,
                    cmd = self.rx.recv() => match cmd {
                        None => return ConnectOutcome::Shutdown,
                        Some(c) => {
                            if self.apply(c) == Flow::Shutdown {
                                return ConnectOutcome::Shutdown;
                            }
                        }
                    },
                }
            };
            match result {
                Ok(stream) => return ConnectOutcome::Connected(stream),
                Err(error) => {
                    if self.retry {
                        tracing::debug!(
                            %error,
                            delay_ms = self.retry_delay.as_millis() as u64,
                            "connect failed, will retry"
                        );
                        if self.sleep_retry().await == Flow::Shutdown {
                            return ConnectOutcome::Shutdown;
                        }
                    } else {
                        tracing::error!(%error, "connect failed");
                        self.fail_all(CONNECT_FAILED);
                        return ConnectOutcome::GiveUp;
                    }
                }
            }
        }
    }

    /// Wait out the retry delay without stalling command processing.
    async fn sleep_retry(&mut self) -> Flow {
        let sleep = tokio::time::sleep(self.retry_delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Flow::Continue,
                cmd = self.rx.recv() => match cmd {
                    None => return Flow::Shutdown,
                    Some(c) => {
                        if self.apply(c) == Flow::Shutdown {
                            return Flow::Shutdown;
                        }
                    }
                },
            }
        }
    }

    /// Run one established connection until it fails or the client closes.
    async fn drive(&mut self, mut stream: TcpStream) -> DriveOutcome {
        tracing::debug!("connected");
        self.outbound.reset_connection();
        let mut decoder = LineDecoder::new();
        let mut buf = vec![0u8; READ_BUF_SIZE];

        if let Err(error) = self.replay(&mut stream) {
            tracing::warn!(%error, "connection lost");
            return DriveOutcome::Disconnected;
        }

        loop {
            let mut interest = Interest::READABLE;
            if self.outbound.wants_write() {
                interest = interest.add(Interest::WRITABLE);
            }
            tokio::select! {
                cmd = self.rx.recv() => {
                    let shutdown = match cmd {
                        None => true,
                        Some(c) => self.apply(c) == Flow::Shutdown,
                    };
                    if shutdown {
                        let _ = stream.shutdown().await;
                        return DriveOutcome::Shutdown;
                    }
                    if let Err(error) = self.replay(&mut stream) {
                        tracing::warn!(%error, "connection lost");
                        return DriveOutcome::Disconnected;
                    }
                }
                ready = stream.ready(interest) => {
                    let ready = match ready {
                        Ok(r) => r,
                        Err(error) => {
                            tracing::warn!(%error, "connection lost");
                            return DriveOutcome::Disconnected;
                        }
                    };
                    if ready.is_readable() {
                        if let Err(error) = self.pump_reads(&mut stream, &mut decoder, &mut buf) {
                            tracing::warn!(%error, "connection lost");
                            return DriveOutcome::Disconnected;
                        }
                    }
                    if ready.is_writable() {
                        self.outbound.resume();
                    }
                    if let Err(error) = self.replay(&mut stream) {
                        tracing::warn!(%error, "connection lost");
                        return DriveOutcome::Disconnected;
                    }
                }
            }
        }
    }

    fn replay(&mut self, stream: &mut TcpStream) -> io::Result<()> {
        self.outbound.replay(stream, |entry| {
            // Notifications never correlate to a reply; once sent they are
            // permanently complete and never resent.
            if entry.id.is_none() {
                entry.completed = true;
            }
        })
    }

    /// Drain readable bytes, decode complete lines, correlate replies.
    fn pump_reads(
        &mut self,
        stream: &mut TcpStream,
        decoder: &mut LineDecoder,
        buf: &mut [u8],
    ) -> Result<()> {
        loop {
            match stream.try_read(buf) {
                Ok(0) => {
                    return Err(RelinkError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    )))
                }
                Ok(n) => {
                    for msg in decoder.push(&buf[..n])? {
                        self.handle_inbound(msg);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn apply(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Request {
                method,
                params,
                fields,
                waiter,
            } => {
                let (id, message) = self.build_message(&method, params, fields, waiter.is_some());
                self.outbound.push(id, message, waiter);
                Flow::Continue
            }
            Command::Close => Flow::Shutdown,
        }
    }

    /// Build the wire object. A correlation id is assigned iff a reply is
    /// expected; ids are monotonic from 1 and never reused.
    fn build_message(
        &mut self,
        method: &str,
        params: Option<Value>,
        fields: Option<Map<String, Value>>,
        wants_reply: bool,
    ) -> (Option<u64>, Value) {
        let mut obj = fields.unwrap_or_default();
        obj.insert("method".to_string(), Value::from(method));
        let id = wants_reply.then(|| {
            let id = self.next_id;
            self.next_id += 1;
            obj.insert("id".to_string(), Value::from(id));
            id
        });
        if let Some(params) = params {
            obj.insert("params".to_string(), params);
        }
        if let Some(version) = &self.protocol_version {
            obj.insert("jsonrpc".to_string(), Value::from(version.clone()));
        }
        (id, Value::Object(obj))
    }

    /// Correlate one decoded inbound object with its pending entry, then
    /// purge completed entries from the front.
    fn handle_inbound(&mut self, msg: Value) {
        let resp: Response = match serde_json::from_value(msg) {
            Ok(r) => r,
            Err(error) => {
                tracing::warn!(%error, "discarding malformed inbound message");
                return;
            }
        };
        let Some(id) = resp.id else {
            return;
        };
        for i in 0..self.outbound.len() {
            let Some(entry) = self.outbound.get_mut(i) else {
                break;
            };
            if entry.id == Some(id) {
                if let Some(waiter) = entry.waiter.take() {
                    let outcome = match resp.error {
                        Some(err) => Err(err),
                        None => Ok(resp.result.unwrap_or(Value::Null)),
                    };
                    let _ = waiter.send(outcome);
                }
                entry.completed = true;
                break;
            }
        }
        self.outbound.purge_front();
    }

    /// Terminal transport failure: every remaining waiter gets the same
    /// synthesized error and the queue is emptied.
    fn fail_all(&mut self, reason: &str) {
        if self.outbound.is_empty() {
            return;
        }
        tracing::warn!(pending = self.outbound.len(), reason, "failing buffered requests");
        let err = RpcError::transport(reason);
        while let Some(entry) = self.outbound.shift() {
            if let Some(waiter) = entry.waiter {
                let _ = waiter.send(Err(err.clone()));
            }
        }
    }
}

async fn attempt_connect(addr: String, timeout: Option<Duration>) -> io::Result<TcpStream> {
    match timeout {
        Some(t) => match tokio::time::timeout(t, TcpStream::connect(&addr)).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        },
        None => TcpStream::connect(&addr).await,
    }
}
