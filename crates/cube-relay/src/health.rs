//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

use crate::link::ConnectionHistory;
use crate::router::RelayStatus;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the relay task is running.
    pub status: String,
    /// Seconds since the relay started.
    pub uptime_secs: u64,
    pub app_sessions: usize,
    pub mock_sessions: usize,
    pub controller: ConnectionHistory,
}

/// Build a health response from a relay snapshot.
pub fn health_check(start_time: Instant, status: RelayStatus) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        app_sessions: status.app_sessions,
        mock_sessions: status.mock_sessions,
        controller: status.controller,
    }
}
