//! Duplex request/response channel to one running plugin process.
//!
//! A [`StdioConnection`] multiplexes concurrent requests over the plugin's
//! standard streams using newline-delimited JSON messages. A background
//! reader task routes each response to the waiter that sent the matching
//! request id. Every wait is bounded by the negotiated request timeout, and
//! cancellation aborts only the local wait.

use crate::config::PluginSettings;
use crate::protocol::{
    version_in_range, Fault, HandshakeRequest, HandshakeResponse, Message, MessageKind,
    MessageMethod, MessageResponseCode, MINIMUM_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Connection-specific error types
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message parsing error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    Closed,

    #[error("Connection disposed")]
    Disposed,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Plugin fault: {0}")]
    Fault(String),
}

/// Negotiated options governing one connection
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Protocol version this client offers
    pub protocol_version: String,
    /// Oldest protocol version this client accepts
    pub minimum_protocol_version: String,
    /// Timeout for each request/response round trip
    pub request_timeout: Duration,
    /// Timeout for the initial handshake exchange
    pub handshake_timeout: Duration,
}

impl ConnectionOptions {
    /// Derive connection options from resolved plugin settings
    pub fn from_settings(settings: &PluginSettings) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            minimum_protocol_version: MINIMUM_PROTOCOL_VERSION.to_string(),
            request_timeout: settings.request_timeout,
            handshake_timeout: settings.handshake_timeout,
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_settings(&PluginSettings::default())
    }
}

/// Duplex request/response channel to a running plugin
#[async_trait]
pub trait PluginConnection: Send + Sync + fmt::Debug {
    /// Options this connection was established with
    fn options(&self) -> &ConnectionOptions;

    /// Protocol version negotiated during the handshake, if completed
    fn protocol_version(&self) -> Option<String>;

    /// Send one request and await its correlated response or fault frame
    async fn send_request(
        &self,
        method: MessageMethod,
        payload: serde_json::Value,
        token: CancellationToken,
    ) -> Result<Message, ConnectionError>;

    /// Whether the channel can still carry requests
    fn is_alive(&self) -> bool;

    /// Number of requests currently awaiting a response
    fn in_flight(&self) -> usize;

    /// Time since the last request completed (or since establishment)
    fn idle_for(&self) -> Duration;

    /// Terminate the channel, failing all outstanding requests as disposed
    async fn close(&self);
}

/// Send a typed request over `connection` and decode the typed response.
///
/// Fault frames are surfaced as [`ConnectionError::Fault`].
pub async fn send_typed<Req, Resp>(
    connection: &(impl PluginConnection + ?Sized),
    method: MessageMethod,
    request: &Req,
    token: CancellationToken,
) -> Result<Resp, ConnectionError>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let payload = serde_json::to_value(request)?;
    let message = connection.send_request(method, payload, token).await?;

    match message.kind {
        MessageKind::Fault => {
            let reason = message
                .payload
                .and_then(|value| serde_json::from_value::<Fault>(value).ok())
                .map(|fault| fault.message)
                .unwrap_or_else(|| "unspecified plugin fault".to_string());
            Err(ConnectionError::Fault(reason))
        }
        _ => {
            let payload = message.payload.unwrap_or(serde_json::Value::Null);
            Ok(serde_json::from_value(payload)?)
        }
    }
}

type PendingMap = HashMap<String, oneshot::Sender<Message>>;
type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// [`PluginConnection`] over a spawned process's standard streams
pub struct StdioConnection {
    options: ConnectionOptions,
    negotiated_version: OnceLock<String>,
    writer: SharedWriter,
    pending: Arc<StdMutex<PendingMap>>,
    alive: Arc<AtomicBool>,
    disposed: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    last_activity: Arc<StdMutex<Instant>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for StdioConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdioConnection")
            .field("options", &self.options)
            .field("negotiated_version", &self.negotiated_version.get())
            .field("alive", &self.is_alive())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl StdioConnection {
    /// Establish a connection over `reader`/`writer` and start the routing
    /// task. The handshake is not run yet; call [`Self::handshake`] before
    /// sending other requests.
    pub fn new<R, W>(reader: R, writer: W, options: ConnectionOptions) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));
        let pending: Arc<StdMutex<PendingMap>> = Arc::new(StdMutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let connection = Arc::new(Self {
            options,
            negotiated_version: OnceLock::new(),
            writer: Arc::clone(&writer),
            pending: Arc::clone(&pending),
            alive: Arc::clone(&alive),
            disposed: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
            last_activity: Arc::new(StdMutex::new(Instant::now())),
            reader_task: StdMutex::new(None),
        });

        let handle = tokio::spawn(read_loop(reader, writer, pending, alive));
        *connection
            .reader_task
            .lock()
            .expect("reader task lock poisoned") = Some(handle);

        connection
    }

    /// Run the version handshake under the handshake timeout and record the
    /// negotiated version
    pub async fn handshake(&self) -> Result<String, ConnectionError> {
        let request = HandshakeRequest {
            protocol_version: self.options.protocol_version.clone(),
            minimum_protocol_version: self.options.minimum_protocol_version.clone(),
        };

        let exchange = send_typed::<_, HandshakeResponse>(
            self,
            MessageMethod::Handshake,
            &request,
            CancellationToken::new(),
        );

        let response = match timeout(self.options.handshake_timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                self.mark_broken("handshake timed out");
                return Err(ConnectionError::Timeout(format!(
                    "no handshake response within {}s",
                    self.options.handshake_timeout.as_secs()
                )));
            }
        };

        if response.response_code != MessageResponseCode::Success {
            return Err(ConnectionError::Handshake(
                "plugin rejected the handshake".to_string(),
            ));
        }

        let version = response.protocol_version.ok_or_else(|| {
            ConnectionError::Handshake("plugin did not state a protocol version".to_string())
        })?;

        if !version_in_range(
            &version,
            &self.options.minimum_protocol_version,
            &self.options.protocol_version,
        ) {
            return Err(ConnectionError::Handshake(format!(
                "plugin protocol version {version} is outside the supported range {}..={}",
                self.options.minimum_protocol_version, self.options.protocol_version
            )));
        }

        let _ = self.negotiated_version.set(version.clone());
        debug!(version = %version, "handshake complete");

        Ok(version)
    }

    async fn write_message(&self, message: &Message) -> Result<(), ConnectionError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Mark the channel unusable and wake every outstanding waiter
    fn mark_broken(&self, reason: &str) {
        if self.alive.swap(false, Ordering::SeqCst) {
            warn!(reason, "plugin connection broken");
        }
        self.pending
            .lock()
            .expect("pending request lock poisoned")
            .clear();
    }

    fn wire_version(&self) -> String {
        self.negotiated_version
            .get()
            .cloned()
            .unwrap_or_else(|| self.options.protocol_version.clone())
    }
}

#[async_trait]
impl PluginConnection for StdioConnection {
    fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    fn protocol_version(&self) -> Option<String> {
        self.negotiated_version.get().cloned()
    }

    async fn send_request(
        &self,
        method: MessageMethod,
        payload: serde_json::Value,
        token: CancellationToken,
    ) -> Result<Message, ConnectionError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Disposed);
        }
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }

        let message = Message::request(method, self.wire_version(), Some(payload));
        let (sender, receiver) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending request lock poisoned")
            .insert(message.request_id.clone(), sender);

        let _guard = InFlightGuard::new(
            Arc::clone(&self.pending),
            Arc::clone(&self.in_flight),
            Arc::clone(&self.last_activity),
            message.request_id.clone(),
        );

        if let Err(error) = self.write_message(&message).await {
            self.mark_broken("request write failed");
            return Err(error);
        }

        tokio::select! {
            _ = token.cancelled() => Err(ConnectionError::Cancelled),
            outcome = timeout(self.options.request_timeout, receiver) => match outcome {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => {
                    if self.disposed.load(Ordering::SeqCst) {
                        Err(ConnectionError::Disposed)
                    } else {
                        Err(ConnectionError::Closed)
                    }
                }
                Err(_) => {
                    self.mark_broken("request timed out");
                    Err(ConnectionError::Timeout(format!(
                        "no response to {method:?} within {}s",
                        self.options.request_timeout.as_secs()
                    )))
                }
            },
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.disposed.load(Ordering::SeqCst)
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("last activity lock poisoned")
            .elapsed()
    }

    async fn close(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.alive.load(Ordering::SeqCst) {
            let notice = Message::request(MessageMethod::Close, self.wire_version(), None);
            let _ = self.write_message(&notice).await;
        }

        self.alive.store(false, Ordering::SeqCst);
        let handle = self
            .reader_task
            .lock()
            .expect("reader task lock poisoned")
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        self.pending
            .lock()
            .expect("pending request lock poisoned")
            .clear();

        let _ = self.writer.lock().await.shutdown().await;
        debug!("plugin connection disposed");
    }
}

/// Decrements the in-flight count, drops the pending entry, and refreshes
/// the idle clock however the request completes
struct InFlightGuard {
    pending: Arc<StdMutex<PendingMap>>,
    in_flight: Arc<AtomicUsize>,
    last_activity: Arc<StdMutex<Instant>>,
    request_id: String,
}

impl InFlightGuard {
    fn new(
        pending: Arc<StdMutex<PendingMap>>,
        in_flight: Arc<AtomicUsize>,
        last_activity: Arc<StdMutex<Instant>>,
        request_id: String,
    ) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            pending,
            in_flight,
            last_activity,
            request_id,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.request_id);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Ok(mut last_activity) = self.last_activity.lock() {
            *last_activity = Instant::now();
        }
    }
}

/// Reader side of the connection: parses newline-delimited messages and
/// routes responses to their waiters. Inbound requests are answered with a
/// not-found fault; this host registers no request handlers.
async fn read_loop<R>(
    reader: R,
    writer: SharedWriter,
    pending: Arc<StdMutex<PendingMap>>,
    alive: Arc<AtomicBool>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let message: Message = match serde_json::from_str(&line) {
                    Ok(message) => message,
                    Err(error) => {
                        warn!(%error, "discarding unparseable plugin message");
                        continue;
                    }
                };

                match message.kind {
                    MessageKind::Response | MessageKind::Fault => {
                        let waiter = pending
                            .lock()
                            .expect("pending request lock poisoned")
                            .remove(&message.request_id);
                        match waiter {
                            Some(sender) => {
                                let _ = sender.send(message);
                            }
                            None => {
                                debug!(
                                    request_id = %message.request_id,
                                    "discarding response with no waiter"
                                );
                            }
                        }
                    }
                    MessageKind::Request if message.method == MessageMethod::Close => {
                        debug!("plugin requested close");
                        break;
                    }
                    MessageKind::Request => {
                        let fault = Message::fault(
                            message.request_id.clone(),
                            message.method,
                            message.protocol_version.clone(),
                            format!("method {:?} is not handled by this host", message.method),
                        );
                        if let Ok(mut line) = serde_json::to_string(&fault) {
                            line.push('\n');
                            let mut writer = writer.lock().await;
                            let _ = writer.write_all(line.as_bytes()).await;
                            let _ = writer.flush().await;
                        }
                    }
                }
            }
            Ok(None) => {
                debug!("plugin stream ended");
                break;
            }
            Err(error) => {
                warn!(%error, "plugin stream read failed");
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    pending
        .lock()
        .expect("pending request lock poisoned")
        .clear();
}
