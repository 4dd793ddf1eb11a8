//! Telemetry broadcasting.
//!
//! One background task samples the hardware probe and the inference
//! counters every second and fans a single `metrics` frame out to every
//! subscribed connection. The broadcaster never touches sockets: each
//! subscriber is an outbound channel drained by its connection task, so a
//! send here is just a queue push.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use jota_protocol::{GpuTelemetry, InferenceTelemetry, ServerMessage};

use crate::dispatch::InferenceDispatcher;
use crate::monitor::{HardwareMonitor, HardwareSnapshot};
use crate::session::registry::SessionRegistry;

const BROADCAST_INTERVAL: Duration = Duration::from_secs(1);

/// Connections that opted into telemetry, keyed by connection id.
#[derive(Default)]
pub struct SubscriberSet {
    inner: StdMutex<HashMap<u64, mpsc::UnboundedSender<ServerMessage>>>,
}

fn relock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn_id: u64, tx: mpsc::UnboundedSender<ServerMessage>) {
        relock(&self.inner).insert(conn_id, tx);
    }

    pub fn remove(&self, conn_id: u64) {
        relock(&self.inner).remove(&conn_id);
    }

    pub fn contains(&self, conn_id: u64) -> bool {
        relock(&self.inner).contains_key(&conn_id)
    }

    pub fn len(&self) -> usize {
        relock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        relock(&self.inner).is_empty()
    }

    /// Queue `message` on every subscriber, pruning closed channels.
    /// Returns the number of live subscribers reached.
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        let mut inner = relock(&self.inner);
        inner.retain(|_, tx| tx.send(message.clone()).is_ok());
        inner.len()
    }
}

/// Periodic telemetry sampler and fan-out task.
pub struct MetricsBroadcaster {
    shutdown_tx: watch::Sender<bool>,
    shut_down: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsBroadcaster {
    /// Start the 1 s sampling loop.
    pub fn spawn(
        monitor: Arc<HardwareMonitor>,
        registry: Arc<SessionRegistry>,
        dispatcher: Arc<InferenceDispatcher>,
        subscribers: Arc<SubscriberSet>,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BROADCAST_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }

                let frame = build_metrics_frame(&monitor, &registry, &dispatcher).await;
                subscribers.broadcast(&frame);
            }
            tracing::debug!("Metrics broadcaster stopped");
        });

        tracing::info!("Metrics broadcaster started");
        Self {
            shutdown_tx,
            shut_down: AtomicBool::new(false),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop the loop and join it. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// Compose one `metrics` frame from the current counters.
pub async fn build_metrics_frame(
    monitor: &Arc<HardwareMonitor>,
    registry: &Arc<SessionRegistry>,
    dispatcher: &Arc<InferenceDispatcher>,
) -> ServerMessage {
    // The probe shells out; keep it off the async threads.
    let probe = monitor.clone();
    let snapshot = tokio::task::spawn_blocking(move || probe.snapshot())
        .await
        .unwrap_or_default();

    let last = dispatcher.last_metrics().await;

    ServerMessage::Metrics {
        timestamp: chrono::Utc::now().timestamp(),
        gpu: gpu_telemetry(&snapshot),
        inference: InferenceTelemetry {
            active_generations: dispatcher.active_count(),
            total_sessions: registry.total().await,
            last_tps: last.tps,
            last_ttft_ms: last.ttft_ms,
            total_tokens_generated: last.tokens,
        },
    }
}

fn gpu_telemetry(snapshot: &HardwareSnapshot) -> GpuTelemetry {
    const MIB: u64 = 1024 * 1024;
    GpuTelemetry {
        temp: snapshot.temp_c,
        vram_total_mb: snapshot.vram_total / MIB,
        vram_used_mb: snapshot.vram_used / MIB,
        vram_free_mb: snapshot.vram_free / MIB,
        power_watts: snapshot.power_mw / 1000,
        fan_percent: snapshot.fan_pct,
        throttling: snapshot.throttling,
    }
}
