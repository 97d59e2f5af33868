//! Per-connection WebSocket loop for app and mock sessions.

use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::RelayConfig;
use crate::relay::{RelayEvent, RelayHandle};
use crate::session::{Group, Session, SessionId};

/// Liveness and queue settings shared by all sessions.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_send_queue: usize,
}

impl SessionSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            max_send_queue: config.max_send_queue,
        }
    }
}

/// Drive one upgraded connection until either side goes away.
///
/// The session is registered with the relay before any inbound frame is
/// read, and its replay is written in full before the queue is drained, so
/// the replay precedes every live event and its first command's answer.
pub async fn run_session(
    socket: WebSocket,
    group: Group,
    relay: RelayHandle,
    settings: SessionSettings,
) {
    let id = SessionId::new();
    let (tx, mut rx) = mpsc::channel::<String>(settings.max_send_queue);
    let Some(replay) = relay.open_session(Session::new(id.clone(), group, tx)).await else {
        return;
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    debug!(session_id = %id, frames = replay.len(), "writing replay");
    for text in replay {
        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
            let _ = relay.send(RelayEvent::SessionClosed { group, id }).await;
            return;
        }
    }
    let mut ping_interval = tokio::time::interval(settings.heartbeat_interval);
    ping_interval.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(text) => {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Dropped by the relay: group closed or relay stopped.
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            incoming = ws_rx.next() => {
                last_seen = Instant::now();
                let text = match incoming {
                    Some(Ok(WsMessage::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!(session_id = %id, "ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(session_id = %id, error = %e, "session read failed");
                        break;
                    }
                };
                trace!(session_id = %id, len = text.len(), "session frame");
                if !relay.send(RelayEvent::Inbound { group, id: id.clone(), text }).await {
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if last_seen.elapsed() > settings.heartbeat_timeout {
                    warn!(session_id = %id, %group, "session heartbeat timed out");
                    break;
                }
                if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                trace!(session_id = %id, "sent ping");
            }
        }
    }

    let _ = relay.send(RelayEvent::SessionClosed { group, id }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_from_config() {
        let config = RelayConfig {
            heartbeat_interval_ms: 500,
            max_send_queue: 8,
            ..RelayConfig::default()
        };
        let settings = SessionSettings::from_config(&config);
        assert_eq!(settings.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(settings.heartbeat_timeout, Duration::from_millis(1500));
        assert_eq!(settings.max_send_queue, 8);
    }
}
