//! Outbound connection to the locker controller.
//!
//! The link task owns the socket and keeps reconnecting until cancelled. The
//! relay only sees `ControllerUp` / `ControllerDown` transitions and the text
//! frames received in between; [`ControllerLink`] is the relay's view of them.

use std::time::Duration;

use cube_core::{Frame, RelayError, Result};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::RelayConfig;
use crate::relay::{RelayEvent, RelayHandle};

/// Whether the controller has ever been reached since startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionHistory {
    #[default]
    NeverConnected,
    Connected,
    DisconnectedAfterConnected,
}

impl ConnectionHistory {
    pub fn on_connected(&mut self) {
        *self = Self::Connected;
    }

    /// Record a disconnect. Returns `true` only for a Connected → disconnected
    /// transition, the one that makes cached upstream state stale.
    pub fn on_disconnected(&mut self) -> bool {
        match self {
            Self::Connected => {
                *self = Self::DisconnectedAfterConnected;
                true
            }
            Self::NeverConnected | Self::DisconnectedAfterConnected => false,
        }
    }

    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NeverConnected => "never_connected",
            Self::Connected => "connected",
            Self::DisconnectedAfterConnected => "disconnected_after_connected",
        }
    }
}

/// The relay-side state of the controller connection.
#[derive(Debug, Default)]
pub struct ControllerLink {
    history: ConnectionHistory,
    outbound: Option<mpsc::Sender<String>>,
}

impl ControllerLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected(&mut self, outbound: mpsc::Sender<String>) {
        self.history.on_connected();
        self.outbound = Some(outbound);
    }

    /// See [`ConnectionHistory::on_disconnected`].
    pub fn disconnected(&mut self) -> bool {
        self.outbound = None;
        self.history.on_disconnected()
    }

    pub fn is_connected(&self) -> bool {
        self.history.is_connected() && self.outbound.is_some()
    }

    pub fn history(&self) -> ConnectionHistory {
        self.history
    }

    /// Queue `frame` on the live connection.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        let Some(outbound) = &self.outbound else {
            return Err(RelayError::ControllerSend("not connected".into()));
        };
        let json = frame.to_json()?;
        outbound.try_send(json).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RelayError::ControllerSend("send queue full".into()),
            mpsc::error::TrySendError::Closed(_) => {
                RelayError::ControllerSend("connection closed".into())
            }
        })
    }
}

/// Connection parameters for the link task.
#[derive(Clone, Debug)]
pub struct LinkSettings {
    pub url: String,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_send_queue: usize,
}

impl LinkSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            url: config.controller_url(),
            reconnect_delay: config.reconnect_delay(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            max_send_queue: config.max_send_queue,
        }
    }
}

enum LoopOutcome {
    Reconnect,
    Shutdown,
}

/// Start the reconnecting controller client.
///
/// Every failed attempt and every lost connection is reported as
/// `ControllerDown`; the relay decides which of those matter.
pub fn spawn_controller_link(
    settings: LinkSettings,
    relay: RelayHandle,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut failures: u32 = 0;
        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio_tungstenite::connect_async(settings.url.as_str()) => result,
            };

            match attempt {
                Ok((ws, _)) => {
                    failures = 0;
                    info!(url = %settings.url, "controller connected");
                    let (tx, rx) = mpsc::channel(settings.max_send_queue);
                    if !relay.send(RelayEvent::ControllerUp(tx)).await {
                        return;
                    }
                    let outcome = run_connection(ws, rx, &relay, &settings, &cancel).await;
                    info!(url = %settings.url, "controller connection closed");
                    if !relay.send(RelayEvent::ControllerDown).await {
                        return;
                    }
                    if let LoopOutcome::Shutdown = outcome {
                        return;
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures == 1 || failures % 20 == 0 {
                        debug!(url = %settings.url, attempt = failures, error = %e, "controller connect failed, will retry");
                    }
                    if !relay.send(RelayEvent::ControllerDown).await {
                        return;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(settings.reconnect_delay) => {}
            }
        }
    })
}

async fn run_connection(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::Receiver<String>,
    relay: &RelayHandle,
    settings: &LinkSettings,
    cancel: &CancellationToken,
) -> LoopOutcome {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut ping_interval = tokio::time::interval(settings.heartbeat_interval);
    ping_interval.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(WsMessage::Close(None)).await;
                return LoopOutcome::Shutdown;
            }
            msg = outbound.recv() => {
                let Some(text) = msg else {
                    // Relay dropped its sender; nothing left to forward to.
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    return LoopOutcome::Shutdown;
                };
                trace!(len = text.len(), "controller send");
                if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                    warn!(error = %e, "controller send failed");
                    return LoopOutcome::Reconnect;
                }
            }
            incoming = ws_rx.next() => {
                last_seen = Instant::now();
                let text = match incoming {
                    Some(Ok(WsMessage::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!("ignoring non-UTF-8 binary frame from controller");
                            continue;
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) | None => return LoopOutcome::Reconnect,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(error = %e, "controller read failed");
                        return LoopOutcome::Reconnect;
                    }
                };
                trace!(len = text.len(), "controller frame");
                if !relay.send(RelayEvent::ControllerFrame(text)).await {
                    return LoopOutcome::Shutdown;
                }
            }
            _ = ping_interval.tick() => {
                if last_seen.elapsed() > settings.heartbeat_timeout {
                    warn!(url = %settings.url, "controller heartbeat timed out");
                    return LoopOutcome::Reconnect;
                }
                if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    return LoopOutcome::Reconnect;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cube_core::Message;

    #[test]
    fn history_never_connected_does_not_qualify() {
        let mut history = ConnectionHistory::default();
        assert!(!history.on_disconnected());
        assert!(!history.on_disconnected());
        assert_eq!(history, ConnectionHistory::NeverConnected);
    }

    #[test]
    fn history_qualifies_once_per_connection() {
        let mut history = ConnectionHistory::NeverConnected;
        history.on_connected();
        assert!(history.is_connected());
        assert!(history.on_disconnected());
        assert_eq!(history, ConnectionHistory::DisconnectedAfterConnected);
        // Later failed attempts are not new transitions.
        assert!(!history.on_disconnected());
        history.on_connected();
        assert!(history.on_disconnected());
    }

    #[test]
    fn history_serializes_camel_case() {
        let json = serde_json::to_string(&ConnectionHistory::DisconnectedAfterConnected).unwrap();
        assert_eq!(json, "\"disconnectedAfterConnected\"");
    }

    #[test]
    fn send_without_connection_fails() {
        let link = ControllerLink::new();
        assert!(!link.is_connected());
        let err = link.send(&Frame::new(Message::RestartOs)).unwrap_err();
        assert_eq!(err.error_kind(), "controller_send");
    }

    #[test]
    fn send_queues_json() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut link = ControllerLink::new();
        link.connected(tx);
        assert!(link.is_connected());
        link.send(&Frame::new(Message::RestartUi)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), r#"{"@type":"restartUi"}"#);
    }

    #[test]
    fn send_after_receiver_dropped_fails() {
        let (tx, rx) = mpsc::channel(4);
        let mut link = ControllerLink::new();
        link.connected(tx);
        drop(rx);
        assert!(matches!(
            link.send(&Frame::new(Message::RestartOs)),
            Err(RelayError::ControllerSend(_))
        ));
    }

    #[test]
    fn disconnect_clears_outbound() {
        let (tx, _rx) = mpsc::channel(4);
        let mut link = ControllerLink::new();
        link.connected(tx);
        assert!(link.disconnected());
        assert!(!link.is_connected());
        assert!(!link.disconnected());
    }

    #[test]
    fn settings_from_config() {
        let settings = LinkSettings::from_config(&RelayConfig::default());
        assert_eq!(settings.url, "ws://localhost:9000/app");
        assert_eq!(settings.reconnect_delay, Duration::from_secs(3));
        assert_eq!(settings.heartbeat_timeout, Duration::from_secs(30));
    }
}
