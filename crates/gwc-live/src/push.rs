use crate::visibility::Visibility;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use gwc_core::event_stream::{DecodeReport, EventStreamDecoder, ServerEvent};
use reqwest::header::{HeaderValue, ACCEPT, CACHE_CONTROL};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Text payloads of one live push connection. The stream ends when the
/// connection closes; dropping it closes the connection.
pub type PushStream = BoxStream<'static, Result<String, PushError>>;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("push endpoint returned {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid push url: {0}")]
    Url(#[from] url::ParseError),
}

/// Opens push connections. One call is one connection attempt.
pub trait PushConnector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<PushStream, PushError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    Connected,
    Message(String),
    Disconnected { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// One connection; the channel ends when it closes.
    Never,
    Fixed(Duration),
    Exponential { initial: Duration, max: Duration },
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or `None` when
    /// the channel should stop.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match *self {
            ReconnectPolicy::Never => None,
            ReconnectPolicy::Fixed(delay) => Some(delay),
            ReconnectPolicy::Exponential { initial, max } => {
                let mut delay = initial;
                for _ in 1..attempt {
                    delay = next_backoff(delay, max);
                    if delay >= max {
                        break;
                    }
                }
                Some(delay.min(max))
            }
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}

enum Closed {
    Consumer,
    Suspended,
    Dropped(String),
}

/// Drives one logical push channel until the consumer goes away or the
/// policy gives up.
///
/// When a visibility receiver is supplied the connection is dropped on hide
/// and reopened on show without counting against the reconnect policy.
pub async fn run_push_channel<C: PushConnector>(
    connector: C,
    policy: ReconnectPolicy,
    mut visibility: Option<watch::Receiver<Visibility>>,
    events: mpsc::Sender<PushEvent>,
) {
    let mut attempt = 0u32;

    loop {
        if let Some(rx) = visibility.as_mut() {
            if !wait_visible(rx, &events).await {
                return;
            }
        }

        let closed = match connector.connect().await {
            Ok(stream) => {
                attempt = 0;
                if events.send(PushEvent::Connected).await.is_err() {
                    return;
                }
                pump(stream, visibility.as_mut(), &events).await
            }
            Err(err) => {
                warn!(event = "push_connect_error", error = %err);
                Closed::Dropped(err.to_string())
            }
        };

        let reason = match closed {
            Closed::Consumer => return,
            Closed::Suspended => {
                let reason = "suspended while hidden".to_string();
                if events
                    .send(PushEvent::Disconnected { reason })
                    .await
                    .is_err()
                {
                    return;
                }
                continue;
            }
            Closed::Dropped(reason) => reason,
        };

        if events
            .send(PushEvent::Disconnected {
                reason: reason.clone(),
            })
            .await
            .is_err()
        {
            return;
        }

        attempt = attempt.saturating_add(1);
        let Some(delay) = policy.delay(attempt) else {
            debug!(event = "push_channel_finished", reason = %reason);
            return;
        };
        info!(
            event = "push_reconnect_scheduled",
            attempt,
            delay_ms = delay.as_millis() as u64,
            reason = %reason
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = events.closed() => return,
        }
    }
}

async fn wait_visible(
    rx: &mut watch::Receiver<Visibility>,
    events: &mpsc::Sender<PushEvent>,
) -> bool {
    loop {
        if rx.borrow_and_update().is_visible() {
            return true;
        }
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    // Nobody can show the page again; stay parked until the consumer leaves.
                    events.closed().await;
                    return false;
                }
            }
            _ = events.closed() => return false,
        }
    }
}

async fn pump(
    mut stream: PushStream,
    mut visibility: Option<&mut watch::Receiver<Visibility>>,
    events: &mpsc::Sender<PushEvent>,
) -> Closed {
    let mut watching = visibility.is_some();
    loop {
        tokio::select! {
            next = stream.next() => match next {
                Some(Ok(text)) => {
                    if events.send(PushEvent::Message(text)).await.is_err() {
                        return Closed::Consumer;
                    }
                }
                Some(Err(err)) => {
                    warn!(event = "push_transport_error", error = %err);
                    return Closed::Dropped(err.to_string());
                }
                None => return Closed::Dropped("stream ended".to_string()),
            },
            changed = visibility_changed(visibility.as_deref_mut()), if watching => {
                match changed {
                    Some(Visibility::Hidden) => return Closed::Suspended,
                    Some(Visibility::Visible) => {}
                    None => watching = false,
                }
            }
            _ = events.closed() => return Closed::Consumer,
        }
    }
}

async fn visibility_changed(rx: Option<&mut watch::Receiver<Visibility>>) -> Option<Visibility> {
    let rx = rx?;
    rx.changed().await.ok()?;
    let visibility = *rx.borrow_and_update();
    Some(visibility)
}

/// Text/event-stream transport over reqwest.
#[derive(Debug, Clone)]
pub struct SseConnector {
    http: reqwest::Client,
    url: String,
    max_event_bytes: usize,
}

impl SseConnector {
    /// The client must not carry a whole-request timeout, or long-lived
    /// streams get cut off.
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            max_event_bytes: gwc_core::event_stream::DEFAULT_MAX_EVENT_BYTES,
        }
    }

    pub fn streaming_client(connect_timeout: Duration) -> Result<reqwest::Client, PushError> {
        reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| PushError::Connect(err.to_string()))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl PushConnector for SseConnector {
    async fn connect(&self) -> Result<PushStream, PushError> {
        let request_id = Uuid::new_v4().to_string();
        let response = self
            .http
            .get(&self.url)
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
            .header("x-request-id", &request_id)
            .send()
            .await
            .map_err(|err| PushError::Connect(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PushError::Status(status.as_u16()));
        }
        debug!(event = "sse_connected", url = %self.url, request_id = %request_id);
        Ok(event_stream_messages(response.bytes_stream(), self.max_event_bytes).boxed())
    }
}

struct SseState<S> {
    body: Pin<Box<S>>,
    decoder: EventStreamDecoder,
    ready: VecDeque<String>,
    finished: bool,
}

impl<S> SseState<S> {
    fn absorb(&mut self, report: DecodeReport<ServerEvent>) {
        for err in report.errors {
            warn!(event = "sse_frame_error", error = %err);
        }
        for frame in report.frames {
            if !frame.data.is_empty() {
                self.ready.push_back(frame.data);
            }
        }
    }
}

/// Turns a chunked event-stream body into its event payloads.
pub fn event_stream_messages<S, B, E>(
    body: S,
    max_event_bytes: usize,
) -> impl Stream<Item = Result<String, PushError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = SseState {
        body: Box::pin(body),
        decoder: EventStreamDecoder::new(max_event_bytes),
        ready: VecDeque::new(),
        finished: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(message) = state.ready.pop_front() {
                return Some((Ok(message), state));
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let report = state.decoder.push_chunk(chunk.as_ref());
                    state.absorb(report);
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(PushError::Transport(err.to_string())), state));
                }
                None => {
                    let report = state.decoder.finish();
                    state.absorb(report);
                    state.finished = true;
                }
            }
        }
    })
}

/// WebSocket transport; text frames are the payloads.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    /// Maps an `http(s)` endpoint to its `ws(s)` counterpart.
    pub fn from_http(url: &str) -> Result<Self, PushError> {
        let mut url = Url::parse(url)?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(PushError::Connect(format!("unsupported scheme {other}"))),
        };
        if url.set_scheme(scheme).is_err() {
            return Err(PushError::Connect(format!("cannot use {scheme} for {url}")));
        }
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl PushConnector for WebSocketConnector {
    async fn connect(&self) -> Result<PushStream, PushError> {
        let (socket, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|err| PushError::Connect(err.to_string()))?;
        debug!(event = "ws_connected", url = %self.url);
        let messages = socket.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        debug!(event = "ws_binary_frame_skipped");
                        None
                    }
                },
                Ok(_) => None,
                Err(err) => Some(Err(PushError::Transport(err.to_string()))),
            }
        });
        Ok(messages.boxed())
    }
}
