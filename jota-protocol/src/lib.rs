//! Wire protocol types for the Jota inference gateway.
//!
//! The gateway speaks a message-oriented protocol over WebSocket: one JSON
//! object per text frame, discriminated by an `op` field.
//!
//! # Connection flow
//!
//! 1. Client connects, optionally supplying `X-Client-ID` / `X-API-Key`
//!    headers for the handshake-time credential check.
//! 2. Header-authenticated connections receive `auth_success` immediately;
//!    others receive a `hello` greeting and must send `op: auth` before
//!    anything else.
//! 3. The client creates one or more sessions, then streams prompts with
//!    `op: infer`; the server answers with zero or more `token` frames
//!    followed by a single `end` frame carrying generation stats.
//! 4. `subscribe_metrics` opts the connection into a periodic `metrics`
//!    frame with GPU and inference counters.

use serde::{Deserialize, Serialize};

/// Messages sent from client to gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Availability check; the only operation that never requires auth.
    Hello,
    /// In-band credential presentation.
    Auth { client_id: String, api_key: String },
    /// Allocate a new generation session for the authenticated client.
    CreateSession,
    /// Destroy a session owned by the caller.
    CloseSession { session_id: String },
    /// Stream a completion for a prompt on an existing session.
    Infer {
        session_id: String,
        prompt: String,
        #[serde(default)]
        params: InferParams,
    },
    /// Cooperatively cancel the session's in-flight generation.
    Abort { session_id: String },
    /// Opt into the periodic telemetry feed.
    SubscribeMetrics,
    /// Opt out of the periodic telemetry feed.
    UnsubscribeMetrics,
}

/// Messages sent from gateway to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        status: String,
        uptime_seconds: u64,
        requires_auth: bool,
    },
    AuthSuccess {
        client_id: String,
        max_sessions: u32,
    },
    AuthFailed {
        reason: String,
    },
    SessionCreated {
        session_id: String,
    },
    SessionClosed {
        session_id: String,
    },
    SessionError {
        error: String,
    },
    /// One generated piece; zero or more per `infer`.
    Token {
        session_id: String,
        content: String,
    },
    /// Terminal frame of an `infer`, always sent once generation stops.
    End {
        session_id: String,
        stats: GenerationStats,
    },
    Abort {
        session_id: String,
        status: AbortStatus,
    },
    Metrics {
        timestamp: i64,
        gpu: GpuTelemetry,
        inference: InferenceTelemetry,
    },
    MetricsSubscribed {
        message: String,
    },
    MetricsUnsubscribed {
        message: String,
    },
    Error {
        error: String,
    },
}

/// Outcome of an abort request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortStatus {
    Aborted,
    NotFound,
}

/// Sampling parameters attached to an `infer` request.
///
/// Generation is greedy for now; `temp` is carried for forward compatibility
/// while `max_tokens` is enforced as a hard cap whenever it is non-negative.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InferParams {
    #[serde(default = "default_temp")]
    pub temp: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i32,
}

fn default_temp() -> f32 {
    0.7
}

fn default_max_tokens() -> i32 {
    -1
}

impl Default for InferParams {
    fn default() -> Self {
        Self {
            temp: default_temp(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Stats produced by one completed (or aborted) generation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GenerationStats {
    /// Time to first token, milliseconds.
    pub ttft_ms: f64,
    /// Wall-clock duration of the whole generation, milliseconds.
    pub total_ms: f64,
    /// Pieces emitted.
    pub tokens: u32,
    /// Tokens per second over `total_ms`.
    pub tps: f64,
}

/// GPU counters as sampled by the hardware probe.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GpuTelemetry {
    pub temp: u32,
    pub vram_total_mb: u64,
    pub vram_used_mb: u64,
    pub vram_free_mb: u64,
    pub power_watts: u64,
    pub fan_percent: u32,
    pub throttling: bool,
}

/// Inference-side counters for the telemetry feed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InferenceTelemetry {
    pub active_generations: usize,
    pub total_sessions: usize,
    pub last_tps: f64,
    pub last_ttft_ms: f64,
    pub total_tokens_generated: u32,
}
