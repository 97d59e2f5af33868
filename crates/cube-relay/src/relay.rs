//! The relay task: a single owner for all relay state.
//!
//! Sessions, the controller link and the lifecycle coordinator talk to the
//! [`Router`] only through [`RelayHandle`], so events are applied strictly in
//! arrival order.

use std::panic::AssertUnwindSafe;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::router::{RelayStatus, Router};
use crate::session::{Group, Session, SessionId};

/// Capacity of the relay's event queue.
pub const EVENT_QUEUE: usize = 1024;

/// Everything the relay task reacts to.
#[derive(Debug)]
pub enum RelayEvent {
    /// A WebSocket session finished its upgrade. `replay` receives the frames
    /// to write before anything from the session's queue.
    SessionOpened {
        session: Session,
        replay: oneshot::Sender<Vec<String>>,
    },
    SessionClosed { group: Group, id: SessionId },
    /// A text frame from a session.
    Inbound {
        group: Group,
        id: SessionId,
        text: String,
    },
    /// The controller link connected; frames queued on the sender go upstream.
    ControllerUp(mpsc::Sender<String>),
    /// A connection attempt failed or a live connection was lost.
    ControllerDown,
    ControllerFrame(String),
    /// Stop admitting sessions to `group` and close the live ones.
    CloseGroup {
        group: Group,
        done: oneshot::Sender<usize>,
    },
    Status(oneshot::Sender<RelayStatus>),
    Shutdown,
}

impl RelayEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::SessionOpened { .. } => "session_opened",
            Self::SessionClosed { .. } => "session_closed",
            Self::Inbound { .. } => "inbound",
            Self::ControllerUp(_) => "controller_up",
            Self::ControllerDown => "controller_down",
            Self::ControllerFrame(_) => "controller_frame",
            Self::CloseGroup { .. } => "close_group",
            Self::Status(_) => "status",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Cloneable sender side of the relay task.
#[derive(Clone, Debug)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayEvent>,
}

impl RelayHandle {
    /// Queue an event. Returns `false` once the relay task has stopped.
    pub async fn send(&self, event: RelayEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Register `session`; resolves with its replay, or `None` if the relay
    /// has stopped.
    pub async fn open_session(&self, session: Session) -> Option<Vec<String>> {
        let (replay, rx) = oneshot::channel();
        if !self.send(RelayEvent::SessionOpened { session, replay }).await {
            return None;
        }
        rx.await.ok()
    }

    pub async fn status(&self) -> Option<RelayStatus> {
        let (reply, rx) = oneshot::channel();
        if !self.send(RelayEvent::Status(reply)).await {
            return None;
        }
        rx.await.ok()
    }

    /// Close `group`; resolves with the number of sessions closed.
    pub async fn close_group(&self, group: Group) -> Option<usize> {
        let (done, rx) = oneshot::channel();
        if !self.send(RelayEvent::CloseGroup { group, done }).await {
            return None;
        }
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.send(RelayEvent::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the relay task around `router`.
pub fn spawn_relay(router: Router, capacity: usize) -> (RelayHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity);
    let task = tokio::spawn(run(router, rx));
    (RelayHandle { tx }, task)
}

async fn run(mut router: Router, mut rx: mpsc::Receiver<RelayEvent>) {
    debug!("relay task started");
    while let Some(event) = rx.recv().await {
        if let RelayEvent::Shutdown = event {
            break;
        }
        dispatch(&mut router, event);
    }
    info!("relay task stopped");
}

/// Apply one event, containing both errors and panics.
fn dispatch(router: &mut Router, event: RelayEvent) {
    let kind = event.kind();
    guarded(kind, || router.handle(event));
}

fn guarded(kind: &'static str, handler: impl FnOnce() -> cube_core::Result<()>) {
    match std::panic::catch_unwind(AssertUnwindSafe(handler)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(event = kind, error_kind = e.error_kind(), error = %e, "relay event failed");
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            error!(event = kind, panic = %message, "relay event handler panicked");
        }
    }
}
