//! App and mock session pools.

use std::collections::HashMap;

use cube_core::Frame;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// The role a session plays, decided by its upgrade path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Group {
    /// Downstream application sessions.
    App,
    /// Simulated lockers standing in for the controller.
    Mock,
}

impl Group {
    /// Paths starting with `mock_prefix` join the mock group, all others the
    /// app group.
    pub fn for_path(path: &str, mock_prefix: &str) -> Self {
        if path.starts_with(mock_prefix) {
            Self::Mock
        } else {
            Self::App
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Mock => "mock",
        }
    }
}

impl std::fmt::Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection identity. Not stable across reconnects.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(format!("session_{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An open connection in one group.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub group: Group,
    /// Send channel to the session's WebSocket write loop.
    tx: mpsc::Sender<String>,
    /// Messages dropped because the queue was full or closed.
    dropped: u64,
}

impl Session {
    pub fn new(id: SessionId, group: Group, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            group,
            tx,
            dropped: 0,
        }
    }

    /// Queue a text frame. Never blocks; a full or closed queue counts as a
    /// dropped message and returns `false`.
    pub fn send(&mut self, text: String) -> bool {
        if self.tx.try_send(text).is_ok() {
            true
        } else {
            self.dropped += 1;
            false
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped
    }
}

/// Two independent sets of live sessions.
#[derive(Debug, Default)]
pub struct SessionGroups {
    app: HashMap<SessionId, Session>,
    mock: HashMap<SessionId, Session>,
    app_closed: bool,
    mock_closed: bool,
}

impl SessionGroups {
    pub fn new() -> Self {
        Self::default()
    }

    fn members(&self, group: Group) -> &HashMap<SessionId, Session> {
        match group {
            Group::App => &self.app,
            Group::Mock => &self.mock,
        }
    }

    fn members_mut(&mut self, group: Group) -> &mut HashMap<SessionId, Session> {
        match group {
            Group::App => &mut self.app,
            Group::Mock => &mut self.mock,
        }
    }

    /// Whether new sessions are still admitted to `group`.
    pub fn is_open(&self, group: Group) -> bool {
        match group {
            Group::App => !self.app_closed,
            Group::Mock => !self.mock_closed,
        }
    }

    /// Add a session to its group. Returns `false` (and drops the session,
    /// closing its write loop) once the group has been closed.
    pub fn add(&mut self, session: Session) -> bool {
        if !self.is_open(session.group) {
            debug!(session_id = %session.id, group = %session.group, "group closed, refusing session");
            return false;
        }
        let group = session.group;
        let _ = self.members_mut(group).insert(session.id.clone(), session);
        true
    }

    pub fn remove(&mut self, group: Group, id: &SessionId) -> Option<Session> {
        self.members_mut(group).remove(id)
    }

    pub fn contains(&self, group: Group, id: &SessionId) -> bool {
        self.members(group).contains_key(id)
    }

    /// Current live count of `group`.
    pub fn session_count(&self, group: Group) -> usize {
        self.members(group).len()
    }

    /// Send `frame` to one session. Returns `false` if it is unknown or its
    /// queue rejected the frame.
    pub fn send_to(&mut self, group: Group, id: &SessionId, frame: &Frame) -> bool {
        let Some(json) = encode(frame) else {
            return false;
        };
        match self.members_mut(group).get_mut(id) {
            Some(session) => {
                let sent = session.send(json);
                if !sent {
                    warn!(session_id = %id, %group, dropped = session.drop_count(), "failed to send to session");
                }
                sent
            }
            None => false,
        }
    }

    /// Send `frame` to every live session of `group`, best-effort. A failed
    /// send to one session does not affect the others. Returns the number of
    /// sessions that accepted the frame.
    pub fn broadcast(&mut self, group: Group, frame: &Frame) -> usize {
        let Some(json) = encode(frame) else {
            return 0;
        };
        let members = self.members_mut(group);
        let recipients = members.len();
        debug!(message_type = frame.message.message_type(), %group, recipients, "broadcast");
        let mut delivered = 0;
        for session in members.values_mut() {
            if session.send(json.clone()) {
                delivered += 1;
            } else {
                warn!(session_id = %session.id, %group, dropped = session.drop_count(), "failed to send broadcast to session");
            }
        }
        delivered
    }

    /// Stop admitting sessions to `group` and drop the live ones, which ends
    /// their write loops. Returns how many sessions were closed.
    pub fn close_group(&mut self, group: Group) -> usize {
        match group {
            Group::App => self.app_closed = true,
            Group::Mock => self.mock_closed = true,
        }
        let members = self.members_mut(group);
        let closed = members.len();
        members.clear();
        closed
    }
}

pub(crate) fn encode(frame: &Frame) -> Option<String> {
    match frame.to_json() {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(message_type = frame.message.message_type(), error = %e, "failed to serialize frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cube_core::Message;

    fn make_session(id: &str, group: Group) -> (Session, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        (Session::new(id.into(), group, tx), rx)
    }

    #[test]
    fn group_for_path() {
        assert_eq!(Group::for_path("/mock", "/mock"), Group::Mock);
        assert_eq!(Group::for_path("/mock/ui", "/mock"), Group::Mock);
        assert_eq!(Group::for_path("/", "/mock"), Group::App);
        assert_eq!(Group::for_path("/app/mock", "/mock"), Group::App);
    }

    #[test]
    fn session_ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("session_"));
    }

    #[test]
    fn add_and_remove_per_group() {
        let mut groups = SessionGroups::new();
        let (a1, _r1) = make_session("a1", Group::App);
        let (m1, _r2) = make_session("m1", Group::Mock);
        assert!(groups.add(a1));
        assert!(groups.add(m1));
        assert_eq!(groups.session_count(Group::App), 1);
        assert_eq!(groups.session_count(Group::Mock), 1);
        assert!(groups.remove(Group::App, &"m1".into()).is_none());
        assert!(groups.remove(Group::Mock, &"m1".into()).is_some());
        assert_eq!(groups.session_count(Group::Mock), 0);
    }

    #[test]
    fn broadcast_reaches_only_target_group() {
        let mut groups = SessionGroups::new();
        let (a1, mut ra1) = make_session("a1", Group::App);
        let (a2, mut ra2) = make_session("a2", Group::App);
        let (m1, mut rm1) = make_session("m1", Group::Mock);
        let _ = groups.add(a1);
        let _ = groups.add(a2);
        let _ = groups.add(m1);

        let delivered = groups.broadcast(Group::App, &Frame::new(Message::devices(vec![])));
        assert_eq!(delivered, 2);
        assert!(ra1.try_recv().unwrap().contains("\"devices\""));
        assert!(ra2.try_recv().is_ok());
        assert!(rm1.try_recv().is_err());
    }

    #[test]
    fn failed_session_does_not_block_others() {
        let mut groups = SessionGroups::new();
        let (dead, dead_rx) = make_session("dead", Group::App);
        let (live, mut live_rx) = make_session("live", Group::App);
        drop(dead_rx);
        let _ = groups.add(dead);
        let _ = groups.add(live);

        let delivered = groups.broadcast(Group::App, &Frame::new(Message::RestartUi));
        assert_eq!(delivered, 1);
        assert!(live_rx.try_recv().is_ok());
        // A failed send is not a disconnect.
        assert_eq!(groups.session_count(Group::App), 2);
    }

    #[test]
    fn full_queue_counts_drops() {
        let (tx, _rx) = mpsc::channel(1);
        let mut session = Session::new("s".into(), Group::App, tx);
        assert!(session.send("one".into()));
        assert!(!session.send("two".into()));
        assert_eq!(session.drop_count(), 1);
    }

    #[test]
    fn send_to_unknown_session() {
        let mut groups = SessionGroups::new();
        assert!(!groups.send_to(Group::App, &"ghost".into(), &Frame::ack(None)));
    }

    #[test]
    fn send_to_single_session() {
        let mut groups = SessionGroups::new();
        let (a1, mut r1) = make_session("a1", Group::App);
        let (a2, mut r2) = make_session("a2", Group::App);
        let _ = groups.add(a1);
        let _ = groups.add(a2);
        assert!(groups.send_to(Group::App, &"a2".into(), &Frame::ack(Some("7".into()))));
        assert!(r1.try_recv().is_err());
        assert_eq!(r2.try_recv().unwrap(), r#"{"@id":"7","@type":"ack"}"#);
    }

    #[tokio::test]
    async fn close_group_refuses_new_sessions_and_ends_write_loops() {
        let mut groups = SessionGroups::new();
        let (a1, mut r1) = make_session("a1", Group::App);
        let _ = groups.add(a1);
        assert_eq!(groups.close_group(Group::App), 1);
        assert!(!groups.is_open(Group::App));
        assert!(groups.is_open(Group::Mock));
        // Sender dropped with the session.
        assert!(r1.recv().await.is_none());

        let (a2, _r2) = make_session("a2", Group::App);
        assert!(!groups.add(a2));
        assert_eq!(groups.session_count(Group::App), 0);
    }
}
