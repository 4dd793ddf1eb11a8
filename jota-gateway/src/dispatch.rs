//! Inference dispatcher: a fixed pool of workers over an unbounded queue.
//!
//! Tasks carry a session id, not a session: the worker re-resolves through
//! the registry at dequeue time and silently drops work whose session is
//! gone. Generations run on blocking threads because the model runtime is
//! synchronous; each worker drives at most one generation at a time, and
//! distinct sessions (each with its own context) run in parallel.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use jota_protocol::{GenerationStats, InferParams};

use crate::session::registry::SessionRegistry;

/// Worker pool size unless configured otherwise.
pub const DEFAULT_WORKERS: usize = 4;

/// Called once per sanitized piece with `(session_id, piece)`; returning
/// `false` stops the generation.
pub type TokenCallback = Box<dyn FnMut(&str, &str) -> bool + Send>;

/// Called once when a generation finishes, with the final stats.
pub type CompletionCallback = Box<dyn FnOnce(&str, GenerationStats) + Send>;

/// A unit of work; consumed exactly once by one worker.
pub struct Task {
    pub session_id: String,
    pub prompt: String,
    pub params: InferParams,
    pub on_token: TokenCallback,
    pub on_complete: CompletionCallback,
}

/// Fixed worker pool that serializes access to the model runtime.
pub struct InferenceDispatcher {
    queue_tx: mpsc::UnboundedSender<Task>,
    registry: Arc<SessionRegistry>,
    active: Arc<AtomicUsize>,
    last_metrics: Arc<Mutex<GenerationStats>>,
    shutdown_tx: watch::Sender<bool>,
    shut_down: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl InferenceDispatcher {
    pub fn new(registry: Arc<SessionRegistry>, num_workers: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<Task>();
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let (shutdown_tx, _) = watch::channel(false);

        let active = Arc::new(AtomicUsize::new(0));
        let last_metrics = Arc::new(Mutex::new(GenerationStats::default()));

        let mut handles = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let queue_rx = queue_rx.clone();
            let registry = registry.clone();
            let active = active.clone();
            let last_metrics = last_metrics.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();

            handles.push(tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = queue_rx.lock().await;
                        tokio::select! {
                            task = rx.recv() => task,
                            _ = shutdown_rx.changed() => None,
                        }
                    };
                    let Some(task) = task else { break };
                    if *shutdown_rx.borrow() {
                        // Shutting down; pending tasks are dropped.
                        break;
                    }
                    process_task(&registry, &active, &last_metrics, task).await;
                }
                tracing::debug!("Inference worker {} stopped", worker_id);
            }));
        }

        tracing::info!("Inference dispatcher started with {} workers", num_workers);

        Self {
            queue_tx,
            registry,
            active,
            last_metrics,
            shutdown_tx,
            shut_down: AtomicBool::new(false),
            workers: Mutex::new(handles),
        }
    }

    /// Queue a task. O(1), thread-safe, never blocks.
    pub fn enqueue(&self, task: Task) {
        if self.queue_tx.send(task).is_err() {
            tracing::warn!("Task enqueued after dispatcher shutdown, dropping");
        }
    }

    /// Set the abort flag of the task's session via the registry.
    pub async fn abort(&self, session_id: &str) -> bool {
        self.registry.abort_session(session_id).await
    }

    /// Generations currently running.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stats of the most recently finished generation.
    pub async fn last_metrics(&self) -> GenerationStats {
        *self.last_metrics.lock().await
    }

    /// Stop the pool. Idempotent; the current task of each worker finishes,
    /// queued tasks are dropped, and all workers are joined.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
        tracing::info!("Inference dispatcher shut down");
    }
}

async fn process_task(
    registry: &Arc<SessionRegistry>,
    active: &Arc<AtomicUsize>,
    last_metrics: &Arc<Mutex<GenerationStats>>,
    mut task: Task,
) {
    let Some(session) = registry.get(&task.session_id).await else {
        tracing::warn!("Session {} not found, dropping task", task.session_id);
        return;
    };

    active.fetch_add(1, Ordering::SeqCst);

    let result = tokio::task::spawn_blocking(move || {
        let stats = session.generate(&task.prompt, &task.params, |piece| {
            let text = sanitize_utf8(piece);
            (task.on_token)(&task.session_id, &text)
        });
        (task.session_id, task.on_complete, stats)
    })
    .await;

    match result {
        Ok((session_id, on_complete, stats)) => {
            *last_metrics.lock().await = stats;
            on_complete(&session_id, stats);
        }
        Err(e) => {
            // A panic kills only this task; the worker keeps running.
            tracing::error!("Generation task panicked: {}", e);
        }
    }

    active.fetch_sub(1, Ordering::SeqCst);
}

/// Drop bytes that do not form complete UTF-8 scalar values.
///
/// Token pieces can split multi-byte sequences at arbitrary boundaries and
/// the JSON encoder refuses invalid text, so each piece is filtered to the
/// valid subsequences it contains. No replacement characters are inserted.
pub fn sanitize_utf8(input: &[u8]) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                output.push_str(valid);
                break;
            }
            Err(e) => {
                let valid_len = e.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&rest[..valid_len]) {
                    output.push_str(valid);
                }
                let skip = match e.error_len() {
                    Some(len) => len,
                    // Truncated sequence at the end of the piece.
                    None => return output,
                };
                rest = &rest[valid_len + skip..];
            }
        }
    }

    output
}
