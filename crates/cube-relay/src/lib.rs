//! Relay between one locker controller, any number of mock lockers and any
//! number of app sessions.
//!
//! All relay state lives in a single task ([`relay`]) driving the
//! [`router::Router`]; WebSocket sessions and the controller link only send
//! it events.

pub mod config;
pub mod health;
pub mod link;
pub mod relay;
pub mod router;
pub mod server;
pub mod session;
pub mod state;
pub mod websocket;

pub use config::{RelayConfig, DEFAULT_ENV_FILE};
pub use link::ConnectionHistory;
pub use relay::{RelayEvent, RelayHandle};
pub use router::RelayStatus;
pub use server::{build_router, start, RunningRelay};
pub use session::Group;
