//! Model runtime seam for the Jota inference gateway.
//!
//! The gateway drives its model through two narrow traits: [`TextModel`]
//! (shared, immutable vocabulary operations) and [`ModelContext`] (one
//! conversation's mutable decode state, including its KV cache). Backends are
//! free to wrap whatever library actually runs the network; the in-tree
//! [`echo::EchoModel`] is a deterministic development backend used in tests
//! and CI where no GPU-grade runtime is available.
//!
//! Contexts are not thread-safe and must be driven by one caller at a time;
//! a [`TextModel`] may be shared freely across threads.

use std::sync::Once;

pub mod echo;
pub mod gguf;

/// Token identifier within a model's vocabulary.
pub type TokenId = u32;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("Context creation failed: {0}")]
    ContextCreation(String),

    #[error("Decode failed: {0}")]
    Decode(String),
}

static BACKEND_INIT: Once = Once::new();

/// Process-wide backend initialization.
///
/// Must run before the first context is created; safe to call repeatedly
/// from any thread.
pub fn backend_init() {
    BACKEND_INIT.call_once(|| {
        tracing::debug!("Model backend initialized");
    });
}

/// Shared, read-only side of a loaded model.
pub trait TextModel: Send + Sync {
    /// Split `text` into model tokens, optionally prefixed with the
    /// beginning-of-sequence token.
    fn tokenize(&self, text: &str, add_bos: bool) -> Vec<TokenId>;

    /// Raw bytes of a token's piece. Pieces are byte sequences, not
    /// guaranteed to fall on UTF-8 boundaries.
    fn token_bytes(&self, token: TokenId) -> Vec<u8>;

    /// Whether `token` terminates a generation.
    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Create a fresh decode context with the given window size.
    fn new_context(&self, ctx_size: u32) -> Result<Box<dyn ModelContext>, RuntimeError>;
}

/// One conversation's mutable decode state.
pub trait ModelContext: Send {
    /// Drop all cached state, returning the context to a blank slate.
    fn clear(&mut self);

    /// Feed `tokens` as one batch starting at absolute position `first_pos`.
    fn decode(&mut self, tokens: &[TokenId], first_pos: u32) -> Result<(), RuntimeError>;

    /// Deterministically pick the next token from the current logits.
    fn sample_greedy(&mut self) -> TokenId;
}
