//! Command routing, state-update routing and trust-loss resets.
//!
//! The router owns all relay state. It is driven one [`RelayEvent`] at a time
//! by the relay task, and every handler runs to completion without awaiting,
//! so a cache mutation and its broadcast are never interleaved with another
//! event.

use cube_core::{Frame, LockEvent, LockStatus, Message, RelayError, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::link::{ConnectionHistory, ControllerLink};
use crate::relay::RelayEvent;
use crate::session::{encode, Group, Session, SessionGroups, SessionId};
use crate::state::StateCache;

/// Where a command was handed off to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Controller,
    Mock,
}

impl Target {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Mock => "mock",
        }
    }
}

/// Upstream sources of state updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Upstream {
    Controller,
    Mock,
}

impl Upstream {
    fn as_str(self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Mock => "mock",
        }
    }
}

/// Point-in-time view of the relay, for `/health`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub app_sessions: usize,
    pub mock_sessions: usize,
    pub controller: ConnectionHistory,
}

#[derive(Debug, Default)]
pub struct Router {
    cache: StateCache,
    groups: SessionGroups,
    controller: ControllerLink,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event.
    ///
    /// Errors are already contained when this returns (a rejected command has
    /// been nak'ed); they are returned for logging only.
    pub fn handle(&mut self, event: RelayEvent) -> Result<()> {
        match event {
            RelayEvent::SessionOpened { session, replay } => {
                let _ = replay.send(self.session_opened(session));
                Ok(())
            }
            RelayEvent::SessionClosed { group, id } => {
                self.session_closed(group, &id);
                Ok(())
            }
            RelayEvent::Inbound {
                group: Group::App,
                id,
                text,
            } => self.on_app_text(&id, &text),
            RelayEvent::Inbound {
                group: Group::Mock,
                text,
                ..
            } => self.on_upstream_text(Upstream::Mock, &text),
            RelayEvent::ControllerUp(outbound) => {
                self.controller_connected(outbound);
                Ok(())
            }
            RelayEvent::ControllerDown => {
                self.controller_disconnected();
                Ok(())
            }
            RelayEvent::ControllerFrame(text) => self.on_upstream_text(Upstream::Controller, &text),
            RelayEvent::CloseGroup { group, done } => {
                let _ = done.send(self.close_group(group));
                Ok(())
            }
            RelayEvent::Status(reply) => {
                let _ = reply.send(self.status());
                Ok(())
            }
            RelayEvent::Shutdown => Ok(()),
        }
    }

    /// Register a session and return the encoded frames it must write before
    /// draining its queue. Only app sessions get a replay.
    ///
    /// The replay bypasses the session's bounded queue, so it is never cut
    /// short by the queue size however many locks are known.
    pub fn session_opened(&mut self, session: Session) -> Vec<String> {
        let id = session.id.clone();
        let group = session.group;
        if !self.groups.add(session) {
            return Vec::new();
        }
        info!(session_id = %id, %group, sessions = self.groups.session_count(group), "session connected");
        if group != Group::App {
            return Vec::new();
        }
        self.cache
            .replay()
            .into_iter()
            .filter_map(|message| encode(&Frame::new(message)))
            .collect()
    }

    pub fn session_closed(&mut self, group: Group, id: &SessionId) {
        if self.groups.remove(group, id).is_none() {
            return;
        }
        let remaining = self.groups.session_count(group);
        info!(session_id = %id, %group, sessions = remaining, "session disconnected");
        if group == Group::Mock && remaining == 0 {
            warn!("last mock session left, resetting state");
            self.reset();
        }
    }

    pub fn controller_connected(&mut self, outbound: mpsc::Sender<String>) {
        self.controller.connected(outbound);
        debug!("controller link up");
    }

    pub fn controller_disconnected(&mut self) {
        if self.controller.disconnected() {
            warn!("controller disconnected, resetting state");
            self.reset();
        }
    }

    /// Handle a frame from an app session, answering it with ack or nak.
    fn on_app_text(&mut self, session: &SessionId, text: &str) -> Result<()> {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                let err = RelayError::from(e);
                let _ = self
                    .groups
                    .send_to(Group::App, session, &Frame::nak(None, err.to_string()));
                return Err(err);
            }
        };
        let Frame { id, message } = frame;

        if !message.is_command() {
            let err = RelayError::UnexpectedMessage {
                role: Group::App.as_str(),
                message_type: message.message_type(),
            };
            let _ = self
                .groups
                .send_to(Group::App, session, &Frame::nak(id, err.to_string()));
            return Err(err);
        }

        let message_type = message.message_type();
        match self.route_command(message) {
            Ok(target) => {
                debug!(session_id = %session, command = message_type, target = target.as_str(), "command forwarded");
                let _ = self.groups.send_to(Group::App, session, &Frame::ack(id));
                Ok(())
            }
            Err(err) => {
                warn!(session_id = %session, command = message_type, error = %err, "command rejected");
                let _ = self
                    .groups
                    .send_to(Group::App, session, &Frame::nak(id, err.to_string()));
                Err(err)
            }
        }
    }

    /// Hand a command to the controller if connected, else to the mock group.
    ///
    /// An `openLock` for a lock already known to be OPEN first re-announces
    /// that status to apps, since opening an open lock may not produce a new
    /// event upstream. That happens whether or not forwarding succeeds.
    pub fn route_command(&mut self, message: Message) -> Result<Target> {
        if let Message::OpenLock { lock, .. } = &message {
            self.announce_if_open(lock);
        }

        let frame = Frame::new(message);
        if self.controller.is_connected() {
            self.controller.send(&frame)?;
            return Ok(Target::Controller);
        }
        if self.groups.session_count(Group::Mock) > 0 {
            let _ = self.groups.broadcast(Group::Mock, &frame);
            return Ok(Target::Mock);
        }
        Err(RelayError::NoLockerConnected)
    }

    fn announce_if_open(&mut self, lock: &str) {
        if self.cache.lock_status(lock) != Some(LockStatus::Open) {
            return;
        }
        let compartment = self
            .cache
            .compartment_for_lock(lock)
            .map(|c| c.number.clone());
        debug!(lock, compartment = compartment.as_deref(), "lock already open, re-announcing");
        let event = LockEvent::new(lock, LockStatus::Open).with_compartment(compartment);
        let _ = self
            .groups
            .broadcast(Group::App, &Frame::new(Message::Lock(event)));
    }

    /// Apply a state update from the controller or a mock locker and fan it
    /// out to apps.
    fn on_upstream_text(&mut self, source: Upstream, text: &str) -> Result<()> {
        let frame = Frame::parse(text)?;
        let update = match frame.message {
            Message::Compartments { compartments } => self.cache.on_compartments(compartments),
            Message::Devices { devices } => self.cache.on_devices(devices),
            Message::Lock(event) => {
                debug!(source = source.as_str(), lock = %event.lock, status = %event.status, "lock update");
                self.cache.on_lock(event)
            }
            message @ Message::Code { .. } => message,
            other => {
                return Err(RelayError::UnexpectedMessage {
                    role: source.as_str(),
                    message_type: other.message_type(),
                })
            }
        };
        let _ = self.groups.broadcast(Group::App, &Frame::new(update));
        Ok(())
    }

    /// Clear cached state and tell apps.
    fn reset(&mut self) {
        for message in self.cache.reset() {
            let _ = self.groups.broadcast(Group::App, &Frame::new(message));
        }
    }

    /// Refuse further sessions in `group` and close the live ones. Closing the
    /// mock group counts as the last mock leaving.
    pub fn close_group(&mut self, group: Group) -> usize {
        let closed = self.groups.close_group(group);
        info!(%group, closed, "session group closed");
        if group == Group::Mock && closed > 0 {
            self.reset();
        }
        closed
    }

    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            app_sessions: self.groups.session_count(Group::App),
            mock_sessions: self.groups.session_count(Group::Mock),
            controller: self.controller.history(),
        }
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }
}
