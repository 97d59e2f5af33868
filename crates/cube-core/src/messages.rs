//! Wire messages.
//!
//! Every frame is a JSON object with an `@type` discriminator and an optional
//! `@id` used to correlate a command with its `ack`/`nak`.

use serde::{Deserialize, Serialize};

use crate::types::{CodeSource, Compartment, Device, LockEvent, OpenContext};

/// A typed message, discriminated by `@type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@type", rename_all = "camelCase")]
pub enum Message {
    /// Full replacement compartment list.
    Compartments { compartments: Vec<Compartment> },
    /// Full replacement device list.
    Devices { devices: Vec<Device> },
    /// Lock status change.
    Lock(LockEvent),
    /// A code entered on the keypad or read by a scanner.
    Code { code: String, source: CodeSource },
    /// Command: open a lock.
    OpenLock {
        lock: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        actor: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<String>,
    },
    /// Command: restart the locker's operating system.
    RestartOs,
    /// Command: restart the locker's user interface.
    RestartUi,
    /// The command with the same `@id` was handed to the locker.
    Ack,
    /// The command with the same `@id` was rejected.
    Nak { error: String },
}

impl Message {
    pub fn compartments(compartments: Vec<Compartment>) -> Self {
        Self::Compartments { compartments }
    }

    pub fn devices(devices: Vec<Device>) -> Self {
        Self::Devices { devices }
    }

    pub fn open_lock(lock: impl Into<String>, context: OpenContext) -> Self {
        Self::OpenLock {
            lock: lock.into(),
            actor: context.actor,
            action: context.action,
        }
    }

    /// The `@type` tag of this message.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Compartments { .. } => "compartments",
            Self::Devices { .. } => "devices",
            Self::Lock(_) => "lock",
            Self::Code { .. } => "code",
            Self::OpenLock { .. } => "openLock",
            Self::RestartOs => "restartOs",
            Self::RestartUi => "restartUi",
            Self::Ack => "ack",
            Self::Nak { .. } => "nak",
        }
    }

    /// Commands flow from apps towards the locker.
    pub fn is_command(&self) -> bool {
        matches!(self, Self::OpenLock { .. } | Self::RestartOs | Self::RestartUi)
    }

    /// State updates flow from the locker towards apps.
    pub fn is_state_update(&self) -> bool {
        matches!(
            self,
            Self::Compartments { .. } | Self::Devices { .. } | Self::Lock(_) | Self::Code { .. }
        )
    }
}

/// A message plus its optional correlation id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "@id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub message: Message,
}

impl Frame {
    pub fn new(message: Message) -> Self {
        Self { id: None, message }
    }

    pub fn with_id(id: impl Into<String>, message: Message) -> Self {
        Self {
            id: Some(id.into()),
            message,
        }
    }

    /// Positive acknowledgement for the command `id`.
    pub fn ack(id: Option<String>) -> Self {
        Self {
            id,
            message: Message::Ack,
        }
    }

    /// Negative acknowledgement for the command `id`.
    pub fn nak(id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            id,
            message: Message::Nak {
                error: error.into(),
            },
        }
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LockStatus;
    use serde_json::{json, Value};

    fn to_value(frame: &Frame) -> Value {
        serde_json::from_str(&frame.to_json().unwrap()).unwrap()
    }

    #[test]
    fn open_lock_with_id() {
        let frame = Frame::parse(r#"{"@type":"openLock","@id":"c1","lock":"L1","actor":"bob"}"#)
            .unwrap();
        assert_eq!(frame.id.as_deref(), Some("c1"));
        assert_eq!(
            frame.message,
            Message::OpenLock {
                lock: "L1".into(),
                actor: Some("bob".into()),
                action: None,
            }
        );
    }

    #[test]
    fn unit_commands_parse() {
        let os = Frame::parse(r#"{"@type":"restartOs"}"#).unwrap();
        assert_eq!(os.message, Message::RestartOs);
        assert!(os.id.is_none());
        let ui = Frame::parse(r#"{"@type":"restartUi","@id":"7"}"#).unwrap();
        assert_eq!(ui.message, Message::RestartUi);
        assert_eq!(to_value(&ui), json!({"@type": "restartUi", "@id": "7"}));
    }

    #[test]
    fn lock_message_is_flat() {
        let frame = Frame::new(Message::Lock(
            LockEvent::new("L1", LockStatus::Open).with_compartment(Some("1".into())),
        ));
        assert_eq!(
            to_value(&frame),
            json!({"@type": "lock", "lock": "L1", "compartmentNumber": "1", "status": "OPEN"})
        );
    }

    #[test]
    fn code_message() {
        let frame = Frame::parse(r#"{"@type":"code","code":"1234","source":"NFC"}"#).unwrap();
        assert_eq!(
            frame.message,
            Message::Code {
                code: "1234".into(),
                source: CodeSource::Nfc,
            }
        );
    }

    #[test]
    fn empty_compartments_serialize() {
        let frame = Frame::new(Message::compartments(vec![]));
        assert_eq!(to_value(&frame), json!({"@type": "compartments", "compartments": []}));
    }

    #[test]
    fn nak_carries_error() {
        let frame = Frame::nak(Some("x".into()), "No locker connected");
        assert_eq!(
            to_value(&frame),
            json!({"@type": "nak", "@id": "x", "error": "No locker connected"})
        );
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(Frame::parse(r#"{"@type":"selfDestruct"}"#).is_err());
        assert!(Frame::parse(r#"{"lock":"L1"}"#).is_err());
        assert!(Frame::parse("not json").is_err());
    }

    #[test]
    fn classification() {
        assert!(Message::RestartOs.is_command());
        assert!(Message::open_lock("L", OpenContext::default()).is_command());
        assert!(!Message::RestartOs.is_state_update());
        assert!(Message::devices(vec![]).is_state_update());
        assert!(!Message::Ack.is_command());
        assert!(!Message::Ack.is_state_update());
        assert_eq!(Message::RestartUi.message_type(), "restartUi");
    }

    #[test]
    fn open_lock_builder_copies_context() {
        let ctx = OpenContext {
            actor: Some("courier".into()),
            action: Some("deliver".into()),
        };
        let msg = Message::open_lock("L9", ctx);
        let v = to_value(&Frame::new(msg));
        assert_eq!(v["actor"], "courier");
        assert_eq!(v["action"], "deliver");
        assert_eq!(v["lock"], "L9");
    }
}
