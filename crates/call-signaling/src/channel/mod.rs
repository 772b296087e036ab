//! The single authenticated websocket to the signaling relay.
//!
//! One supervisor task owns the socket. It pumps outbound frames, decodes
//! inbound frames into [`ChannelEvent::Message`], pings the relay on an
//! interval, and after an unexpected close reconnects with jittered
//! exponential backoff until the policy gives up.

pub mod backoff;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{
    Error as WsError, Message, error::ProtocolError as WsProtocolError,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{ChannelConfig, ReconnectPolicy};
use crate::error::SignalingError;
use crate::identity::Identity;
use crate::protocol::{MessageKind, SignalingMessage};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound half of the relay connection as seen by sessions.
pub trait SignalingSink: Send + Sync {
    /// Enqueues one frame. Fails with [`SignalingError::NotOpen`] while the
    /// connection is down; the failure is also reported as
    /// [`ChannelEvent::SendFailed`].
    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Message(SignalingMessage),
    SendFailed {
        kind: MessageKind,
        target_id: Option<String>,
    },
    Disconnected {
        reason: String,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    Reconnected,
    Unavailable {
        attempts: u32,
    },
}

struct Shared {
    identity: Identity,
    state: Mutex<ChannelState>,
    retries: AtomicU32,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Shared {
    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn open(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);
        *self.state.lock() = ChannelState::Open;
        rx
    }

    fn set_down(&self, state: ChannelState) {
        self.outbound.lock().take();
        *self.state.lock() = state;
    }
}

pub struct SignalingChannel {
    shared: Arc<Shared>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Opens the relay connection for `identity`.
    ///
    /// The first attempt is made inline so credential rejection surfaces to
    /// the caller as [`SignalingError::Authentication`].
    pub async fn connect(
        config: ChannelConfig,
        identity: Identity,
    ) -> Result<Arc<Self>, SignalingError> {
        let url = connection_url(&config.url, &identity)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            identity,
            state: Mutex::new(ChannelState::Connecting),
            retries: AtomicU32::new(0),
            outbound: Mutex::new(None),
            events: events_tx,
        });

        let socket = match open_socket(&url).await {
            Ok(socket) => socket,
            Err(err) => {
                shared.set_down(ChannelState::Closed);
                tracing::warn!(target = "signaling", relay = %config.url, error = %err, "relay connect failed");
                return Err(err);
            }
        };
        tracing::info!(
            target = "signaling",
            relay = %config.url,
            user_id = %shared.identity.user_id(),
            "signaling channel connected"
        );

        let outbound = shared.open();
        shared.emit(ChannelEvent::Connected);

        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(
            Arc::clone(&shared),
            config,
            url,
            socket,
            outbound,
            cancel.clone(),
        ));

        Ok(Arc::new(Self {
            shared,
            events: Mutex::new(Some(events_rx)),
            cancel,
            supervisor: Mutex::new(Some(supervisor)),
        }))
    }

    pub fn user_id(&self) -> &str {
        self.shared.identity.user_id()
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.lock()
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.retries.load(Ordering::SeqCst)
    }

    /// Takes the inbound event stream. Only the first caller gets it.
    pub fn events(&self) -> Result<mpsc::UnboundedReceiver<ChannelEvent>, SignalingError> {
        self.events.lock().take().ok_or(SignalingError::EventsTaken)
    }

    /// Closes the connection and stops reconnecting. Idempotent.
    pub fn disconnect(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.shared.set_down(ChannelState::Closed);
        tracing::info!(target = "signaling", user_id = %self.user_id(), "signaling channel disconnected");
    }

    /// Waits for the supervisor task to exit after [`disconnect`](Self::disconnect).
    pub async fn closed(&self) {
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl SignalingSink for SignalingChannel {
    fn send(&self, mut message: SignalingMessage) -> Result<(), SignalingError> {
        if message.sender_id.is_empty() {
            message.sender_id = self.user_id().to_string();
        }
        let kind = message.kind;
        let text = match message.encode() {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(target = "signaling", kind = %kind, error = %err, "failed to encode frame");
                return Err(SignalingError::Transport(err.to_string()));
            }
        };

        let delivered = self
            .shared
            .outbound
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(text).is_ok());
        if delivered {
            counter!("signaling_messages_sent_total", 1, "kind" => kind.as_str());
            tracing::trace!(target = "signaling", kind = %kind, target_id = ?message.target_id, "frame queued");
            return Ok(());
        }

        counter!("signaling_messages_dropped_total", 1, "kind" => kind.as_str(), "direction" => "outbound");
        tracing::warn!(
            target = "signaling",
            kind = %kind,
            target_id = ?message.target_id,
            state = ?self.state(),
            "signaling channel not open; frame dropped"
        );
        self.shared.emit(ChannelEvent::SendFailed {
            kind,
            target_id: message.target_id,
        });
        Err(SignalingError::NotOpen)
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }
}

enum PumpExit {
    Cancelled,
    Lost(String),
}

async fn supervise(
    shared: Arc<Shared>,
    config: ChannelConfig,
    url: Url,
    mut socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let reason = match pump(&shared, socket, outbound, config.heartbeat_interval(), &cancel).await
        {
            PumpExit::Cancelled => {
                shared.set_down(ChannelState::Closed);
                return;
            }
            PumpExit::Lost(reason) => reason,
        };

        shared.set_down(ChannelState::Connecting);
        tracing::warn!(target = "signaling", reason = %reason, "signaling connection lost");
        shared.emit(ChannelEvent::Disconnected { reason });

        match reconnect(&shared, &config.reconnect, &url, &cancel).await {
            Some(next) => {
                socket = next;
                outbound = shared.open();
                shared.emit(ChannelEvent::Reconnected);
            }
            None => {
                shared.set_down(ChannelState::Closed);
                return;
            }
        }
    }
}

async fn reconnect(
    shared: &Shared,
    policy: &ReconnectPolicy,
    url: &Url,
    cancel: &CancellationToken,
) -> Option<Socket> {
    for attempt in 1..=policy.max_attempts {
        let delay = backoff::delay_for_attempt(policy, attempt);
        shared.retries.store(attempt, Ordering::SeqCst);
        counter!("signaling_reconnect_attempts_total", 1);
        tracing::info!(
            target = "signaling",
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnecting to relay"
        );
        shared.emit(ChannelEvent::Reconnecting { attempt, delay });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        match open_socket(url).await {
            Ok(socket) => {
                shared.retries.store(0, Ordering::SeqCst);
                tracing::info!(target = "signaling", attempt, "relay reconnected");
                return Some(socket);
            }
            Err(SignalingError::Authentication(reason)) => {
                tracing::warn!(target = "signaling", attempt, reason = %reason, "relay rejected credentials on reconnect");
                shared.emit(ChannelEvent::Unavailable { attempts: attempt });
                return None;
            }
            Err(err) => {
                tracing::warn!(target = "signaling", attempt, error = %err, "reconnect attempt failed");
            }
        }
    }

    tracing::error!(
        target = "signaling",
        attempts = policy.max_attempts,
        "relay unavailable; giving up"
    );
    shared.emit(ChannelEvent::Unavailable {
        attempts: policy.max_attempts,
    });
    None
}

async fn pump(
    shared: &Shared,
    socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<String>,
    heartbeat: Duration,
    cancel: &CancellationToken,
) -> PumpExit {
    let (mut write, mut read) = socket.split();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return PumpExit::Cancelled;
            }
            frame = outbound.recv() => {
                let Some(text) = frame else {
                    return PumpExit::Lost("outbound queue closed".into());
                };
                if let Err(err) = write.send(Message::Text(text)).await {
                    return PumpExit::Lost(format!("write failed: {err}"));
                }
            }
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    tracing::trace!(target = "signaling", event = "ws_in", kind = "text", len = text.len());
                    deliver(shared, SignalingMessage::decode(&text));
                }
                Some(Ok(Message::Binary(data))) => {
                    tracing::trace!(target = "signaling", event = "ws_in", kind = "binary", len = data.len());
                    deliver(shared, SignalingMessage::decode_binary(&data));
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|frame| format!("closed by relay: {} {}", frame.code, frame.reason))
                        .unwrap_or_else(|| "closed by relay".into());
                    return PumpExit::Lost(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    match &err {
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
                            tracing::debug!(target = "signaling", "signaling websocket closed: {err}");
                        }
                        _ => {
                            tracing::warn!(target = "signaling", "signaling websocket error: {err}");
                        }
                    }
                    return PumpExit::Lost(err.to_string());
                }
                None => return PumpExit::Lost("stream ended".into()),
            },
            _ = ticker.tick() => {
                if let Err(err) = write.send(Message::Ping(Vec::new())).await {
                    return PumpExit::Lost(format!("heartbeat failed: {err}"));
                }
            }
        }
    }
}

fn deliver(shared: &Shared, decoded: Result<SignalingMessage, crate::error::ProtocolError>) {
    match decoded {
        Ok(message) => {
            counter!("signaling_messages_received_total", 1, "kind" => message.kind.as_str());
            shared.emit(ChannelEvent::Message(message));
        }
        Err(err) => {
            counter!("signaling_messages_dropped_total", 1, "kind" => "malformed", "direction" => "inbound");
            tracing::warn!(target = "signaling", error = %err, "dropping malformed frame");
        }
    }
}

async fn open_socket(url: &Url) -> Result<Socket, SignalingError> {
    match connect_async(url.as_str()).await {
        Ok((socket, _response)) => Ok(socket),
        Err(WsError::Http(response)) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                Err(SignalingError::Authentication(format!(
                    "relay answered {status}"
                )))
            } else {
                Err(SignalingError::Transport(format!(
                    "relay upgrade refused with {status}"
                )))
            }
        }
        Err(err) => Err(SignalingError::Transport(err.to_string())),
    }
}

/// Relay URL with the identity attached as `token` and `userId` query
/// parameters. `http(s)` schemes are mapped to `ws(s)`.
fn connection_url(base: &str, identity: &Identity) -> Result<Url, SignalingError> {
    let invalid = |reason: String| SignalingError::InvalidUrl {
        url: base.to_string(),
        reason,
    };
    let mut url = Url::parse(base).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme `{other}`"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot rewrite scheme".into()))?;

    let preserved: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "token" && key != "userId")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    url.set_query(None);
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in &preserved {
            query.append_pair(key, value);
        }
        query
            .append_pair("token", identity.token())
            .append_pair("userId", identity.user_id());
    }
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity::new("alice", "tok en")
    }

    #[test]
    fn connection_url_appends_credentials() {
        let url = connection_url("https://relay.example/signaling?room=7&token=stale", &identity())
            .unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/signaling");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("room".to_string(), "7".to_string()),
                ("token".to_string(), "tok en".to_string()),
                ("userId".to_string(), "alice".to_string()),
            ]
        );

        let plain = connection_url("http://127.0.0.1:9000/signaling", &identity()).unwrap();
        assert_eq!(plain.scheme(), "ws");
    }

    #[test]
    fn connection_url_rejects_unknown_scheme() {
        assert!(matches!(
            connection_url("ftp://relay.example/", &identity()),
            Err(SignalingError::InvalidUrl { .. })
        ));
        assert!(matches!(
            connection_url("not a url", &identity()),
            Err(SignalingError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = SignalingChannel::connect(
            ChannelConfig::new(format!("ws://{addr}/signaling")),
            identity(),
        )
        .await;
        assert!(matches!(result, Err(SignalingError::Transport(_))));
    }
}
