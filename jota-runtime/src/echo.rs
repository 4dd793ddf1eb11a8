//! Deterministic development backend.
//!
//! `EchoModel` tokenizes text into whitespace-delimited pieces and, when
//! driven through a context, replays the prompt's pieces in order before
//! signalling end-of-generation. It exists so the full gateway (sessions,
//! dispatch, streaming, abort) can run and be tested on machines without a
//! GPU-grade runtime. An optional per-token delay makes the decode step take
//! real time, which cancellation tests rely on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{ModelContext, RuntimeError, TextModel, TokenId};

/// End-of-generation token.
pub const TOKEN_EOG: TokenId = 0;
/// Beginning-of-sequence token.
pub const TOKEN_BOS: TokenId = 1;

#[derive(Default)]
struct Vocab {
    /// Piece bytes by token id. Ids 0 and 1 are reserved and empty.
    pieces: Vec<Vec<u8>>,
    ids: HashMap<Vec<u8>, TokenId>,
}

struct Inner {
    vocab: Mutex<Vocab>,
    token_delay: Option<Duration>,
}

/// Development model that echoes the prompt back piece by piece.
pub struct EchoModel {
    inner: Arc<Inner>,
}

impl EchoModel {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Like [`EchoModel::new`], but every decode sleeps for `delay`,
    /// simulating forward-pass latency.
    pub fn with_token_delay(delay: Duration) -> Self {
        Self::build(Some(delay))
    }

    fn build(token_delay: Option<Duration>) -> Self {
        let vocab = Vocab {
            pieces: vec![Vec::new(), Vec::new()],
            ids: HashMap::new(),
        };
        Self {
            inner: Arc::new(Inner {
                vocab: Mutex::new(vocab),
                token_delay,
            }),
        }
    }

    fn intern(&self, piece: &[u8]) -> TokenId {
        let mut vocab = self
            .inner
            .vocab
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(&id) = vocab.ids.get(piece) {
            return id;
        }
        let id = vocab.pieces.len() as TokenId;
        vocab.pieces.push(piece.to_vec());
        vocab.ids.insert(piece.to_vec(), id);
        id
    }
}

impl Default for EchoModel {
    fn default() -> Self {
        Self::new()
    }
}

impl TextModel for EchoModel {
    fn tokenize(&self, text: &str, add_bos: bool) -> Vec<TokenId> {
        let mut tokens = Vec::new();
        if add_bos {
            tokens.push(TOKEN_BOS);
        }
        // Keep the trailing space attached so detokenized output
        // concatenates back to the original text.
        for piece in text.split_inclusive(' ') {
            if piece.is_empty() {
                continue;
            }
            tokens.push(self.intern(piece.as_bytes()));
        }
        tokens
    }

    fn token_bytes(&self, token: TokenId) -> Vec<u8> {
        let vocab = self
            .inner
            .vocab
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        vocab
            .pieces
            .get(token as usize)
            .cloned()
            .unwrap_or_default()
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == TOKEN_EOG
    }

    fn new_context(&self, _ctx_size: u32) -> Result<Box<dyn ModelContext>, RuntimeError> {
        Ok(Box::new(EchoContext {
            inner: self.inner.clone(),
            history: Vec::new(),
            prompt_len: None,
        }))
    }
}

struct EchoContext {
    inner: Arc<Inner>,
    history: Vec<TokenId>,
    /// History length at the first sample; everything before it is prompt.
    prompt_len: Option<usize>,
}

impl ModelContext for EchoContext {
    fn clear(&mut self) {
        self.history.clear();
        self.prompt_len = None;
    }

    fn decode(&mut self, tokens: &[TokenId], first_pos: u32) -> Result<(), RuntimeError> {
        if first_pos as usize != self.history.len() {
            return Err(RuntimeError::Decode(format!(
                "position {} does not follow cache length {}",
                first_pos,
                self.history.len()
            )));
        }
        if let Some(delay) = self.inner.token_delay {
            std::thread::sleep(delay);
        }
        self.history.extend_from_slice(tokens);
        Ok(())
    }

    fn sample_greedy(&mut self) -> TokenId {
        let prompt_len = *self.prompt_len.get_or_insert(self.history.len());
        let emitted = self.history.len() - prompt_len;
        self.history[..prompt_len]
            .iter()
            .copied()
            .filter(|&t| t != TOKEN_BOS)
            .nth(emitted)
            .unwrap_or(TOKEN_EOG)
    }
}
