// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! The stream lifecycle state machine (§4.7), shared between the Stream
//! Reader (which drives transitions as it connects/streams/backs off) and
//! the Lifecycle Manager (which reports it via `status`/the HTTP API).

/// One stream quartet's lifecycle state. `Idle` is pre-start only; once a
/// stream is added it moves to `Connecting` and then oscillates between
/// `Running` and `Backoff` until it is explicitly stopped (`Stopping`) or
/// gives up permanently (`Failed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Running,
    Backoff,
    Stopping,
    Failed,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Connecting => "connecting",
            StreamState::Running => "running",
            StreamState::Backoff => "backoff",
            StreamState::Stopping => "stopping",
            StreamState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
