//! Hardware telemetry probe.
//!
//! Counters come from `nvidia-smi` so the gateway carries no driver
//! bindings; on hosts without a GPU (or without the tool) every snapshot is
//! zero-filled and the layer heuristic recommends CPU-only execution.

use std::process::Command;

/// Temperature at or above which the GPU is considered throttling.
const MAX_TEMP_SAFE_C: u32 = 80;

/// VRAM held back from the layer heuristic to avoid OOM.
const VRAM_SAFETY_BUFFER: u64 = 500 * 1024 * 1024;

/// Sentinel meaning "offload every layer".
pub const ALL_LAYERS: u32 = 99;

/// Point-in-time GPU counters. Sampled on request, never cached.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HardwareSnapshot {
    pub temp_c: u32,
    pub vram_total: u64,
    pub vram_used: u64,
    pub vram_free: u64,
    pub power_mw: u64,
    pub fan_pct: u32,
    pub throttling: bool,
}

/// Read-only probe over the host GPU.
pub struct HardwareMonitor {
    available: bool,
}

impl HardwareMonitor {
    /// Detect whether a GPU can be queried at all.
    pub fn init() -> Self {
        let available = Command::new("nvidia-smi")
            .arg("-L")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false);

        if available {
            tracing::info!("Hardware monitor initialized (nvidia-smi present)");
        } else {
            tracing::info!("nvidia-smi unavailable, hardware telemetry disabled");
        }

        Self { available }
    }

    /// Probe that always reports zero-filled snapshots.
    pub fn disabled() -> Self {
        Self { available: false }
    }

    pub fn available(&self) -> bool {
        self.available
    }

    /// Current counters, or a zero-filled struct when the probe is
    /// unavailable or the query fails.
    pub fn snapshot(&self) -> HardwareSnapshot {
        if !self.available {
            return HardwareSnapshot::default();
        }
        self.query().unwrap_or_default()
    }

    fn query(&self) -> Option<HardwareSnapshot> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=temperature.gpu,memory.total,memory.used,memory.free,power.draw,fan.speed",
                "--format=csv,noheader,nounits",
                "-i",
                "0",
            ])
            .output()
            .ok()?;

        if !output.status.success() {
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_snapshot(stdout.lines().next()?)
    }

    /// Layer count to offload for a model of `model_bytes`, from current
    /// free VRAM.
    pub fn recommend_gpu_layers(&self, model_bytes: u64) -> u32 {
        let snapshot = self.snapshot();
        let layers = layers_for(&snapshot, model_bytes);
        tracing::info!(
            "GPU layer heuristic: model {} MB, free VRAM {} MB -> {} layers",
            model_bytes / (1024 * 1024),
            snapshot.vram_free / (1024 * 1024),
            layers
        );
        layers
    }
}

/// Parse one CSV line of `nvidia-smi --query-gpu` output. Fields that read
/// `[N/A]` collapse to zero.
fn parse_snapshot(line: &str) -> Option<HardwareSnapshot> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 6 {
        return None;
    }

    let temp_c = fields[0].parse().unwrap_or(0);
    let mib = |s: &str| s.parse::<u64>().unwrap_or(0) * 1024 * 1024;
    let power_mw = (fields[4].parse::<f64>().unwrap_or(0.0) * 1000.0) as u64;

    Some(HardwareSnapshot {
        temp_c,
        vram_total: mib(fields[1]),
        vram_used: mib(fields[2]),
        vram_free: mib(fields[3]),
        power_mw,
        fan_pct: fields[5].parse().unwrap_or(0),
        throttling: temp_c >= MAX_TEMP_SAFE_C,
    })
}

/// Pure layer heuristic: everything fits -> [`ALL_LAYERS`]; otherwise a
/// proportional share of an estimated per-size layer count, at least one
/// layer whenever any VRAM is usable.
pub fn layers_for(snapshot: &HardwareSnapshot, model_bytes: u64) -> u32 {
    let available = snapshot.vram_free.saturating_sub(VRAM_SAFETY_BUFFER);
    if available == 0 {
        return 0;
    }
    if model_bytes <= available {
        return ALL_LAYERS;
    }

    const GIB: u64 = 1024 * 1024 * 1024;
    let estimated_total: u32 = if model_bytes < 2 * GIB {
        22
    } else if model_bytes < 4 * GIB {
        28
    } else {
        32
    };

    let proportion = available as f64 / model_bytes as f64;
    let layers = (proportion * estimated_total as f64) as u32;
    layers.clamp(1, estimated_total)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn snapshot_with_free(vram_free: u64) -> HardwareSnapshot {
        HardwareSnapshot {
            vram_free,
            ..Default::default()
        }
    }

    #[test]
    fn test_layers_no_vram() {
        let snap = snapshot_with_free(0);
        assert_eq!(layers_for(&snap, 3 * GIB), 0);

        // Free VRAM below the safety buffer counts as none.
        let snap = snapshot_with_free(400 * 1024 * 1024);
        assert_eq!(layers_for(&snap, 3 * GIB), 0);
    }

    #[test]
    fn test_layers_model_fits_entirely() {
        let snap = snapshot_with_free(8 * GIB);
        assert_eq!(layers_for(&snap, 3 * GIB), ALL_LAYERS);
    }

    #[test]
    fn test_layers_partial_offload_buckets() {
        // 1 GiB usable against a 4 GiB model (32-layer bucket): 8 layers.
        let snap = snapshot_with_free(GIB + VRAM_SAFETY_BUFFER);
        assert_eq!(layers_for(&snap, 4 * GIB), 8);

        // Same VRAM against a 3 GiB model (28-layer bucket).
        assert_eq!(layers_for(&snap, 3 * GIB), 9);

        // And against a 1.5 GiB model (22-layer bucket) it fits partially.
        let snap = snapshot_with_free(GIB + VRAM_SAFETY_BUFFER);
        let layers = layers_for(&snap, 3 * GIB / 2);
        assert_eq!(layers, 14);
    }

    #[test]
    fn test_layers_at_least_one_when_memory_available() {
        // A sliver of usable VRAM against a huge model still pins one layer.
        let snap = snapshot_with_free(VRAM_SAFETY_BUFFER + 1024);
        assert_eq!(layers_for(&snap, 100 * GIB), 1);
    }

    #[test]
    fn test_parse_snapshot_line() {
        let snap = parse_snapshot("67, 6144, 3800, 2344, 115.67, 44").unwrap();
        assert_eq!(snap.temp_c, 67);
        assert_eq!(snap.vram_total, 6144 * 1024 * 1024);
        assert_eq!(snap.vram_used, 3800 * 1024 * 1024);
        assert_eq!(snap.vram_free, 2344 * 1024 * 1024);
        assert_eq!(snap.power_mw, 115_670);
        assert_eq!(snap.fan_pct, 44);
        assert!(!snap.throttling);
    }

    #[test]
    fn test_parse_snapshot_throttling_at_threshold() {
        let snap = parse_snapshot("80, 6144, 0, 6144, 50.0, 30").unwrap();
        assert!(snap.throttling);

        let snap = parse_snapshot("79, 6144, 0, 6144, 50.0, 30").unwrap();
        assert!(!snap.throttling);
    }

    #[test]
    fn test_parse_snapshot_not_available_fields() {
        let snap = parse_snapshot("55, 6144, 100, 6044, [N/A], [N/A]").unwrap();
        assert_eq!(snap.power_mw, 0);
        assert_eq!(snap.fan_pct, 0);
    }

    #[test]
    fn test_parse_snapshot_malformed() {
        assert!(parse_snapshot("not,enough,fields").is_none());
        assert!(parse_snapshot("").is_none());
    }

    #[test]
    fn test_disabled_monitor_zero_snapshot() {
        let monitor = HardwareMonitor::disabled();
        assert!(!monitor.available());
        assert_eq!(monitor.snapshot(), HardwareSnapshot::default());
        assert_eq!(monitor.recommend_gpu_layers(3 * GIB), 0);
    }
}
