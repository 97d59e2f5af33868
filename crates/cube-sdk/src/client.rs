//! Connection to the cube app service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cube_core::{Compartment, Device, Frame, Message, OpenContext};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Result, SdkError};
use crate::listeners::{Event, EventKind, ListenerId, Listeners};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 4000;

/// Where and how to connect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Host the cube app service runs on.
    pub host: String,
    /// Port the cube app service listens on.
    pub port: u16,
    /// Operate the locks on the secondary side of the locker.
    pub secondary: bool,
    /// Delay between connection attempts.
    pub reconnect_delay: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
            secondary: false,
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

impl ConnectOptions {
    pub fn url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }

    /// Options from a `host=..&port=..&secondary=..` query string, as a kiosk
    /// page receives them. Missing or invalid values keep their defaults.
    pub fn from_query(query: &str) -> Self {
        let mut options = Self::default();
        let query = query.strip_prefix('?').unwrap_or(query);
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "host" if !value.is_empty() => options.host = value.into_owned(),
                "port" => {
                    if let Ok(port) = value.parse() {
                        options.port = port;
                    }
                }
                "secondary" => options.secondary = parse_bool(&value),
                _ => {}
            }
        }
        options
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

type Pending = oneshot::Sender<Result<()>>;

#[derive(Default)]
struct State {
    compartments: Vec<Compartment>,
    devices: Vec<Device>,
    outbound: Option<mpsc::Sender<String>>,
    pending: HashMap<String, Pending>,
}

struct Inner {
    listeners: Listeners,
    state: Mutex<State>,
    connected: watch::Sender<bool>,
    next_id: AtomicU64,
}

impl Inner {
    fn on_open(&self, outbound: mpsc::Sender<String>) {
        self.state.lock().outbound = Some(outbound);
        let _ = self.connected.send_replace(true);
        let _ = self.listeners.dispatch(&Event::Open);
    }

    fn on_close(&self, reason: fn() -> SdkError) {
        let pending: Vec<Pending> = {
            let mut state = self.state.lock();
            state.outbound = None;
            state.pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in pending {
            let _ = tx.send(Err(reason()));
        }
        let _ = self.connected.send_replace(false);
        let _ = self.listeners.dispatch(&Event::Close);
    }

    fn resolve(&self, id: Option<String>, result: Result<()>) {
        let Some(id) = id else {
            debug!("acknowledgement without id");
            return;
        };
        match self.state.lock().pending.remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(id = %id, "acknowledgement for unknown command"),
        }
    }

    fn on_frame(&self, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "ignoring malformed frame");
                return;
            }
        };
        let event = match frame.message {
            Message::Ack => return self.resolve(frame.id, Ok(())),
            Message::Nak { error } => return self.resolve(frame.id, Err(SdkError::Rejected(error))),
            Message::Compartments { compartments } => {
                self.state.lock().compartments = compartments.clone();
                Event::Compartments(compartments)
            }
            Message::Devices { devices } => {
                self.state.lock().devices = devices.clone();
                Event::Devices(devices)
            }
            Message::Lock(lock) => Event::Lock(lock),
            Message::Code { code, source } => Event::Code { code, source },
            other => {
                debug!(message_type = other.message_type(), "ignoring message");
                return;
            }
        };
        let _ = self.listeners.dispatch(&event);
    }
}

/// Handle to a locker, reached through the cube app service.
///
/// Connecting never fails; the client keeps reconnecting in the background
/// and reports transitions as [`Event::Open`] / [`Event::Close`].
pub struct Cube {
    inner: Arc<Inner>,
    secondary: bool,
    cancel: CancellationToken,
    connected: watch::Receiver<bool>,
}

impl Cube {
    /// Start connecting. Must be called within a Tokio runtime.
    pub fn connect(options: ConnectOptions) -> Self {
        let (connected_tx, connected_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            listeners: Listeners::new(),
            state: Mutex::new(State::default()),
            connected: connected_tx,
            next_id: AtomicU64::new(1),
        });
        let cancel = CancellationToken::new();
        let _ = tokio::spawn(run(
            Arc::clone(&inner),
            options.url(),
            options.reconnect_delay,
            cancel.clone(),
        ));
        Self {
            inner,
            secondary: options.secondary,
            cancel,
            connected: connected_rx,
        }
    }

    pub fn add_event_listener(
        &self,
        kind: EventKind,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.listeners.add(kind, listener)
    }

    pub fn remove_event_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        self.inner.listeners.remove(kind, id)
    }

    pub fn connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Resolves once connected; fails if the client was closed first.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut connected = self.connected.clone();
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(SdkError::Closed),
            result = connected.wait_for(|c| *c) => result.map(|_| ()).map_err(|_| SdkError::Closed),
        };
        outcome
    }

    pub fn secondary(&self) -> bool {
        self.secondary
    }

    /// Latest compartment list received from the relay.
    pub fn compartments(&self) -> Vec<Compartment> {
        self.inner.state.lock().compartments.clone()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.inner.state.lock().devices.clone()
    }

    pub fn get_compartment(&self, number: &str) -> Option<Compartment> {
        self.inner
            .state
            .lock()
            .compartments
            .iter()
            .find(|c| c.number == number)
            .cloned()
    }

    /// The lock operated for `number`: the secondary lock when this client
    /// was connected with `secondary`, else the primary one.
    pub fn get_compartment_lock(&self, number: &str) -> Result<String> {
        let compartment = self
            .get_compartment(number)
            .ok_or_else(|| SdkError::CompartmentNotFound(number.to_string()))?;
        let lock = if self.secondary {
            compartment.secondary_lock
        } else {
            compartment.lock
        };
        lock.ok_or_else(|| SdkError::NoLockConfigured(number.to_string()))
    }

    pub async fn open_lock(&self, lock: &str, context: OpenContext) -> Result<()> {
        self.command(Message::open_lock(lock, context)).await
    }

    pub async fn open_compartment(&self, number: &str, context: OpenContext) -> Result<()> {
        let lock = self.get_compartment_lock(number)?;
        self.open_lock(&lock, context).await
    }

    pub async fn restart_user_interface(&self) -> Result<()> {
        self.command(Message::RestartUi).await
    }

    pub async fn restart_operating_system(&self) -> Result<()> {
        self.command(Message::RestartOs).await
    }

    /// Stop reconnecting and drop the connection.
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut connected = self.connected.clone();
        let _ = connected.wait_for(|c| !*c).await;
    }

    /// Send a command and wait for the relay's ack or nak.
    async fn command(&self, message: Message) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SdkError::Closed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let json = Frame::with_id(id.clone(), message).to_json()?;
        let (tx, rx) = oneshot::channel();
        let outbound = {
            let mut state = self.inner.state.lock();
            let outbound = state.outbound.clone().ok_or(SdkError::NotConnected)?;
            let _ = state.pending.insert(id.clone(), tx);
            outbound
        };
        if outbound.send(json).await.is_err() {
            let _ = self.inner.state.lock().pending.remove(&id);
            return Err(SdkError::NotConnected);
        }
        rx.await.unwrap_or(Err(SdkError::NotConnected))
    }
}

impl Drop for Cube {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Cube {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cube")
            .field("connected", &self.connected())
            .field("secondary", &self.secondary)
            .finish()
    }
}

async fn run(inner: Arc<Inner>, url: String, reconnect_delay: Duration, cancel: CancellationToken) {
    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
        };
        match attempt {
            Ok((ws, _)) => {
                info!(%url, "connected to cube app service");
                let (tx, rx) = mpsc::channel(64);
                inner.on_open(tx);
                let closed = drive(&inner, ws, rx, &cancel).await;
                if closed {
                    inner.on_close(|| SdkError::Closed);
                    return;
                }
                info!(%url, "connection to cube app service lost");
                inner.on_close(|| SdkError::NotConnected);
            }
            Err(e) => debug!(%url, error = %e, "connect failed, will retry"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }
}

/// Pump one connection. Returns `true` if the client was closed.
async fn drive(
    inner: &Inner,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::Receiver<String>,
    cancel: &CancellationToken,
) -> bool {
    let (mut ws_tx, mut ws_rx) = ws.split();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(WsMessage::Close(None)).await;
                return true;
            }
            Some(text) = outbound.recv() => {
                if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                    return false;
                }
            }
            incoming = ws_rx.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => inner.on_frame(text.as_str()),
                Some(Ok(WsMessage::Close(_))) | None => return false,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "read failed");
                    return false;
                }
            },
        }
    }
}
