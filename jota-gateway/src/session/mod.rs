//! Generation sessions.
//!
//! A session binds one client to one model context. Its lifecycle is owned
//! by the [`registry::SessionRegistry`]; everything else refers to sessions
//! by id and re-resolves through the registry.

pub mod registry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use jota_protocol::{GenerationStats, InferParams};
use jota_runtime::{ModelContext, TextModel};

/// Generation state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Generating,
    Error,
}

/// One client's generation context.
pub struct Session {
    session_id: String,
    client_id: String,
    model: Arc<dyn TextModel>,
    ctx: Mutex<Box<dyn ModelContext>>,
    state: Mutex<SessionState>,
    abort_flag: AtomicBool,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Session {
    pub fn new(
        session_id: String,
        client_id: String,
        model: Arc<dyn TextModel>,
        ctx: Box<dyn ModelContext>,
    ) -> Self {
        Self {
            session_id,
            client_id,
            model,
            ctx: Mutex::new(ctx),
            state: Mutex::new(SessionState::Idle),
            abort_flag: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> SessionState {
        *relock(&self.state)
    }

    pub fn is_generating(&self) -> bool {
        self.state() == SessionState::Generating
    }

    /// Request cooperative cancellation; the generation loop observes the
    /// flag within one token.
    pub fn abort(&self) {
        self.abort_flag.store(true, Ordering::SeqCst);
    }

    fn set_state(&self, state: SessionState) {
        *relock(&self.state) = state;
    }

    /// Run one generation over this session's context, streaming each piece
    /// to `on_token`. Pieces are raw bytes; token boundaries may split
    /// multi-byte characters. Returning `false` from the callback stops
    /// generation, as does the abort flag and a non-negative `max_tokens`.
    ///
    /// Synchronous and CPU-bound; callers run it on a blocking thread. Two
    /// concurrent calls against one session serialize on the context lock.
    pub fn generate(
        &self,
        prompt: &str,
        params: &InferParams,
        mut on_token: impl FnMut(&[u8]) -> bool,
    ) -> GenerationStats {
        let mut stats = GenerationStats::default();
        let mut ctx = relock(&self.ctx);

        self.abort_flag.store(false, Ordering::SeqCst);
        self.set_state(SessionState::Generating);

        let start = Instant::now();
        ctx.clear();

        let prompt_tokens = self.model.tokenize(prompt, true);
        if let Err(e) = ctx.decode(&prompt_tokens, 0) {
            tracing::error!("Prompt decode failed for {}: {}", self.session_id, e);
            self.set_state(SessionState::Error);
            stats.total_ms = elapsed_ms(start);
            return stats;
        }

        let mut n_cur = prompt_tokens.len() as u32;
        let mut first_token = true;

        loop {
            if params.max_tokens >= 0 && stats.tokens >= params.max_tokens as u32 {
                break;
            }

            let token = ctx.sample_greedy();

            if first_token {
                stats.ttft_ms = elapsed_ms(start);
                first_token = false;
            }

            if self.model.is_end_of_generation(token) {
                break;
            }

            let piece = self.model.token_bytes(token);
            stats.tokens += 1;

            if !on_token(&piece) {
                break;
            }
            if self.abort_flag.load(Ordering::SeqCst) {
                break;
            }

            if let Err(e) = ctx.decode(&[token], n_cur) {
                tracing::error!("Decode failed during generation for {}: {}", self.session_id, e);
                self.set_state(SessionState::Error);
                break;
            }
            n_cur += 1;
        }

        stats.total_ms = elapsed_ms(start);
        if stats.total_ms > 0.0 {
            stats.tps = stats.tokens as f64 / (stats.total_ms / 1000.0);
        }

        if self.state() != SessionState::Error {
            self.set_state(SessionState::Idle);
        }
        stats
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
