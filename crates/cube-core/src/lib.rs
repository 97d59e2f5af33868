//! # cube-core
//!
//! Types shared by the relay service and the application SDK:
//! - locker data model (compartments, devices, lock status)
//! - `@type`-tagged wire messages and the `@id`-carrying frame around them
//! - the relay error taxonomy

pub mod errors;
pub mod messages;
pub mod types;

pub use errors::{RelayError, Result};
pub use messages::{Frame, Message};
pub use types::{
    CodeSource, Compartment, CompartmentFeature, Device, DeviceType, LockEvent, LockStatus,
    OpenContext,
};
