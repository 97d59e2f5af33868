//! Client SDK for applications driving a locker through the cube app service.
//!
//! ```no_run
//! # async fn demo() -> cube_sdk::Result<()> {
//! use cube_sdk::{ConnectOptions, Cube, Event, EventKind, OpenContext};
//!
//! let cube = Cube::connect(ConnectOptions::default());
//! cube.add_event_listener(EventKind::Lock, |event| {
//!     if let Event::Lock(lock) = event {
//!         println!("{} is {}", lock.lock, lock.status);
//!     }
//! });
//! cube.wait_connected().await?;
//! cube.open_compartment("1", OpenContext::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod errors;
pub mod listeners;

pub use client::{ConnectOptions, Cube};
pub use cube_core::{CodeSource, Compartment, Device, LockEvent, LockStatus, OpenContext};
pub use errors::{Result, SdkError};
pub use listeners::{Event, EventKind, ListenerId, Listeners};
