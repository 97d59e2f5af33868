//! Locker data model.

use serde::{Deserialize, Serialize};

/// The status of a lock.
///
/// A lock without a recorded status is *unknown*, which is not the same as
/// [`LockStatus::Closed`]; callers model that with `Option<LockStatus>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LockStatus {
    Open,
    Closed,
    Breakin,
    Blocked,
}

impl LockStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
            Self::Breakin => "BREAKIN",
            Self::Blocked => "BLOCKED",
        }
    }
}

impl std::fmt::Display for LockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feature of a compartment. Unknown tags from upstream are kept verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompartmentFeature {
    /// Has a cooling unit.
    Cooled,
    /// Accessible for handicapped people.
    Accessible,
    /// Has a charger.
    Charger,
    /// Suitable for dangerous goods.
    DangerousGoods,
    #[serde(untagged)]
    Other(String),
}

/// A compartment of the locker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Compartment {
    /// Stable compartment number, e.g. `"1"`.
    pub number: String,
    pub enabled: bool,
    /// Size/type tags, e.g. `S`, `M`, `L`.
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub features: Vec<CompartmentFeature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_lock: Option<String>,
}

impl Compartment {
    /// Whether `lock` is this compartment's primary or secondary lock.
    pub fn has_lock(&self, lock: &str) -> bool {
        self.lock.as_deref() == Some(lock) || self.secondary_lock.as_deref() == Some(lock)
    }

    /// Primary and secondary lock ids, in that order.
    pub fn locks(&self) -> impl Iterator<Item = &str> {
        self.lock
            .as_deref()
            .into_iter()
            .chain(self.secondary_lock.as_deref())
    }
}

/// Device type tag. Unknown tags from upstream are kept verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    NfcReader,
    PaymentTerminal,
    Locking,
    BarcodeReader,
    Admission,
    ComputeUnit,
    Kiosk,
    Keypad,
    DoorBell,
    #[serde(untagged)]
    Other(String),
}

/// A peripheral device of the locker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub types: Vec<DeviceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    /// Capability-specific information, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
}

/// Source of an entered or scanned code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CodeSource {
    Keypad,
    Scanner,
    Nfc,
}

/// Who opened a lock and why. Passed through to the hardware side and back.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// A lock status change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockEvent {
    pub lock: String,
    /// Number of the compartment the lock belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compartment_number: Option<String>,
    pub status: LockStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl LockEvent {
    pub fn new(lock: impl Into<String>, status: LockStatus) -> Self {
        Self {
            lock: lock.into(),
            compartment_number: None,
            status,
            actor: None,
            action: None,
        }
    }

    #[must_use]
    pub fn with_compartment(mut self, number: Option<String>) -> Self {
        self.compartment_number = number;
        self
    }
}
