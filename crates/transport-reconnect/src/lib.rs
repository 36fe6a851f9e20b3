//! Self-healing WebSocket client.
//!
//! Wraps a `tokio-tungstenite` connection behind a supervisor task that
//! reconnects with capped exponential backoff. Callers send text frames
//! through an infallible [`ResilientSocket::send`]; frames submitted while
//! the link is down are queued (bounded) and flushed in order once the
//! connection opens again. Connection lifecycle is published as
//! [`SocketEvent`]s on a broadcast channel.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Tuning knobs for the reconnect loop.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub min_delay: Duration,
    /// Upper bound on the retry delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay on every consecutive failure.
    pub growth_factor: f64,
    /// How long a connection must stay open before the retry counter resets.
    pub min_uptime: Duration,
    /// An attempt that neither opens nor errors within this window is a failure.
    pub connect_timeout: Duration,
    /// Give up for good after this many consecutive failures. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Bound on frames queued while disconnected; overflow is dropped silently.
    /// `None` keeps everything.
    pub max_queued: Option<usize>,
    /// `Sec-WebSocket-Protocol` value offered on the handshake.
    pub subprotocol: Option<String>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            growth_factor: 1.3,
            min_uptime: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(4),
            max_retries: None,
            max_queued: None,
            subprotocol: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry attempt `attempt` (1-based):
    /// `min(min_delay * growth_factor^(attempt-1), max_delay)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.min_delay.min(self.max_delay);
        }
        let factor = self.growth_factor.powi(attempt as i32 - 1);
        let millis = (self.min_delay.as_millis() as f64) * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Where to connect. A resolver is invoked fresh before every attempt so the
/// target can rotate between retries.
#[derive(Clone)]
pub enum Endpoint {
    Fixed(String),
    Resolver(Arc<dyn Fn() -> String + Send + Sync>),
}

impl Endpoint {
    fn resolve(&self) -> String {
        match self {
            Endpoint::Fixed(url) => url.clone(),
            Endpoint::Resolver(resolve) => resolve(),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Fixed(url) => f.debug_tuple("Fixed").field(url).finish(),
            Endpoint::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

impl From<String> for Endpoint {
    fn from(url: String) -> Self {
        Endpoint::Fixed(url)
    }
}

impl From<&str> for Endpoint {
    fn from(url: &str) -> Self {
        Endpoint::Fixed(url.to_string())
    }
}

/// Lifecycle and traffic events published to subscribers.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The underlying connection opened (initial connect or reconnect).
    Open,
    /// A text frame arrived.
    Message(String),
    /// The underlying connection dropped, or the socket shut down for good.
    Closed,
    /// A connect or I/O error. Always followed by recovery or `Closed`.
    Error(String),
}

enum Command {
    Send(String),
    Reconnect,
    Close,
}

enum LinkOutcome {
    Dropped,
    ReconnectRequested,
    CloseRequested,
}

/// A logical WebSocket connection that outlives the physical one.
pub struct ResilientSocket {
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SocketEvent>,
    supervisor: tokio::task::JoinHandle<()>,
}

impl ResilientSocket {
    /// Spawn the supervisor and start connecting immediately.
    pub fn connect(endpoint: impl Into<Endpoint>, config: ReconnectConfig) -> Self {
        Self::connect_subscribed(endpoint, config).0
    }

    /// Like [`connect`](Self::connect), but also returns a receiver that was
    /// subscribed before the first connection attempt, so the initial `Open`
    /// cannot be missed.
    pub fn connect_subscribed(
        endpoint: impl Into<Endpoint>,
        config: ReconnectConfig,
    ) -> (Self, broadcast::Receiver<SocketEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, initial) = broadcast::channel(256);
        let supervisor = tokio::spawn(supervise(endpoint.into(), config, cmd_rx, events.clone()));
        (
            Self {
                cmd_tx,
                events,
                supervisor,
            },
            initial,
        )
    }

    /// Subscribe to connection events. Every subscriber sees every event from
    /// this point on; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.events.subscribe()
    }

    /// Send a text frame. Queued if the link is down; never fails at the call
    /// site. Transport errors surface as [`SocketEvent::Error`].
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Send(text.into()));
    }

    /// Tear down the current connection (if any) and reconnect right away,
    /// resetting the retry counter.
    pub fn reconnect(&self) {
        let _ = self.cmd_tx.send(Command::Reconnect);
    }

    /// Shut down for good. No further reconnection attempts are made.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

impl Drop for ResilientSocket {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

async fn supervise(
    endpoint: Endpoint,
    config: ReconnectConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<SocketEvent>,
) {
    let mut pending: VecDeque<String> = VecDeque::new();
    let mut retries: u32 = 0;

    loop {
        let url = endpoint.resolve();
        trace!(%url, "connecting");

        let opened = match timeout(config.connect_timeout, open_socket(&url, &config)).await {
            Ok(Ok(stream)) => Some(stream),
            Ok(Err(err)) => {
                let _ = events.send(SocketEvent::Error(err.to_string()));
                None
            }
            Err(_) => {
                let _ = events.send(SocketEvent::Error(format!(
                    "connection attempt to {url} timed out"
                )));
                None
            }
        };

        if let Some(stream) = opened {
            debug!(%url, "connection open");
            let _ = events.send(SocketEvent::Open);
            let opened_at = Instant::now();

            let outcome = drive_link(stream, &mut cmd_rx, &mut pending, &events).await;

            let _ = events.send(SocketEvent::Closed);
            if opened_at.elapsed() >= config.min_uptime {
                retries = 0;
            }
            match outcome {
                LinkOutcome::CloseRequested => return,
                LinkOutcome::ReconnectRequested => {
                    retries = 0;
                    continue;
                }
                LinkOutcome::Dropped => {}
            }
        }

        retries += 1;
        if let Some(max) = config.max_retries {
            if retries > max {
                warn!(%url, "giving up after {max} failed attempts");
                let _ = events.send(SocketEvent::Closed);
                return;
            }
        }

        // Wait out the backoff, still servicing commands: sends queue up,
        // reconnect skips the wait, close aborts.
        let wake = sleep(config.backoff_delay(retries));
        tokio::pin!(wake);
        loop {
            tokio::select! {
                _ = &mut wake => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Send(text)) => enqueue(&mut pending, text, config.max_queued),
                    Some(Command::Reconnect) => {
                        retries = 0;
                        break;
                    }
                    Some(Command::Close) | None => {
                        let _ = events.send(SocketEvent::Closed);
                        return;
                    }
                },
            }
        }
    }
}

/// Run one live connection until it drops or the caller intervenes.
async fn drive_link(
    stream: WsStream,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    pending: &mut VecDeque<String>,
    events: &broadcast::Sender<SocketEvent>,
) -> LinkOutcome {
    let (mut sink, mut source): (SplitSink<WsStream, Message>, SplitStream<WsStream>) =
        stream.split();

    // Flush frames queued while disconnected, oldest first.
    while let Some(text) = pending.pop_front() {
        if let Err(err) = sink.send(Message::Text(text)).await {
            let _ = events.send(SocketEvent::Error(err.to_string()));
            return LinkOutcome::Dropped;
        }
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(text)) => {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        let _ = events.send(SocketEvent::Error(err.to_string()));
                        return LinkOutcome::Dropped;
                    }
                }
                Some(Command::Reconnect) => {
                    let _ = sink.close().await;
                    return LinkOutcome::ReconnectRequested;
                }
                Some(Command::Close) | None => {
                    let _ = sink.close().await;
                    return LinkOutcome::CloseRequested;
                }
            },
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(SocketEvent::Message(text));
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Ok(text) = String::from_utf8(data) {
                        let _ = events.send(SocketEvent::Message(text));
                    }
                }
                Some(Ok(Message::Close(_))) | None => return LinkOutcome::Dropped,
                Some(Ok(_)) => {} // ping/pong are answered by tungstenite itself
                Some(Err(err)) => {
                    let _ = events.send(SocketEvent::Error(err.to_string()));
                    return LinkOutcome::Dropped;
                }
            },
        }
    }
}

fn enqueue(pending: &mut VecDeque<String>, text: String, max_queued: Option<usize>) {
    if let Some(max) = max_queued {
        if pending.len() >= max {
            return;
        }
    }
    pending.push_back(text);
}

async fn open_socket(
    url: &str,
    config: &ReconnectConfig,
) -> Result<WsStream, tokio_tungstenite::tungstenite::Error> {
    let mut request = url.into_client_request()?;
    if let Some(proto) = &config.subprotocol {
        if let Ok(value) = HeaderValue::from_str(proto) {
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }
    }
    let (stream, _) = connect_async(request).await?;
    Ok(stream)
}
