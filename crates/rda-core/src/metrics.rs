//! Session metrics (spec §4.7): atomic frame counters plus EWMA sliding
//! windows for per-stage timings, with a periodic snapshot logger
//! grounded on the teacher's heartbeat-sampling loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);
const EWMA_ALPHA: f64 = 0.2;

/// EWMA sliding window over a single f64 series (encode-ms, capture-ms,
/// scale-ms, bandwidth-KB/s).
#[derive(Default)]
struct Ewma {
    value: f64,
    initialised: bool,
}

impl Ewma {
    fn sample(&mut self, v: f64) {
        if !self.initialised {
            self.value = v;
            self.initialised = true;
        } else {
            self.value = (1.0 - EWMA_ALPHA) * self.value + EWMA_ALPHA * v;
        }
    }

    fn get(&self) -> f64 {
        self.value
    }
}

struct Windows {
    encode_ms: Ewma,
    capture_ms: Ewma,
    scale_ms: Ewma,
    bandwidth_kbps: Ewma,
}

/// Session-scoped metrics. Counters are lock-free atomics so the capture
/// loop never blocks on the metrics logger; the EWMA windows sit behind a
/// small `tokio` mutex since they're only touched a few times per frame.
/// The windows are written from the capture thread (a plain `std::thread`
/// with no tokio runtime attached) via `blocking_lock`, and read from the
/// async snapshot logger via `lock().await`.
pub struct Metrics {
    frames_captured: AtomicU64,
    frames_encoded: AtomicU64,
    frames_sent: AtomicU64,
    frames_skipped: AtomicU64,
    frames_dropped: AtomicU64,
    last_frame_bytes: AtomicU64,
    cumulative_bytes: AtomicU64,
    started_at: Instant,
    windows: Mutex<Windows>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_captured: AtomicU64::new(0),
            frames_encoded: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            last_frame_bytes: AtomicU64::new(0),
            cumulative_bytes: AtomicU64::new(0),
            started_at: Instant::now(),
            windows: Mutex::new(Windows {
                encode_ms: Ewma::default(),
                capture_ms: Ewma::default(),
                scale_ms: Ewma::default(),
                bandwidth_kbps: Ewma::default(),
            }),
        }
    }

    pub fn record_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_encoded(&self, bytes: usize) {
        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
        self.last_frame_bytes.store(bytes as u64, Ordering::Relaxed);
        self.cumulative_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Called from the capture thread (no tokio runtime on that thread),
    /// hence `blocking_lock` rather than `.await`.
    pub fn record_encode_ms(&self, ms: f64) {
        self.windows.blocking_lock().encode_ms.sample(ms);
    }

    pub fn record_capture_ms(&self, ms: f64) {
        self.windows.blocking_lock().capture_ms.sample(ms);
    }

    pub fn record_scale_ms(&self, ms: f64) {
        self.windows.blocking_lock().scale_ms.sample(ms);
    }

    pub fn record_bandwidth_kbps(&self, kbps: f64) {
        self.windows.blocking_lock().bandwidth_kbps.sample(kbps);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let windows = self.windows.lock().await;
        MetricsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            last_frame_bytes: self.last_frame_bytes.load(Ordering::Relaxed),
            cumulative_bytes: self.cumulative_bytes.load(Ordering::Relaxed),
            uptime_secs: self.uptime().as_secs(),
            encode_ms: windows.encode_ms.get(),
            capture_ms: windows.capture_ms.get(),
            scale_ms: windows.scale_ms.get(),
            bandwidth_kbps: windows.bandwidth_kbps.get(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub frames_captured: u64,
    pub frames_encoded: u64,
    pub frames_sent: u64,
    pub frames_skipped: u64,
    pub frames_dropped: u64,
    pub last_frame_bytes: u64,
    pub cumulative_bytes: u64,
    pub uptime_secs: u64,
    pub encode_ms: f64,
    pub capture_ms: f64,
    pub scale_ms: f64,
    pub bandwidth_kbps: f64,
}

/// Spawns the 10 s snapshot logger. Returns the task handle so the
/// session can abort it on stop.
pub fn spawn_snapshot_logger(metrics: Arc<Metrics>, session_id: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
        loop {
            ticker.tick().await;
            let snap = metrics.snapshot().await;
            tracing::info!(
                session = %session_id,
                captured = snap.frames_captured,
                encoded = snap.frames_encoded,
                sent = snap.frames_sent,
                skipped = snap.frames_skipped,
                dropped = snap.frames_dropped,
                cumulative_bytes = snap.cumulative_bytes,
                uptime_secs = snap.uptime_secs,
                encode_ms = %format!("{:.2}", snap.encode_ms),
                capture_ms = %format!("{:.2}", snap.capture_ms),
                scale_ms = %format!("{:.2}", snap.scale_ms),
                bandwidth_kbps = %format!("{:.1}", snap.bandwidth_kbps),
                "metrics snapshot"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = Metrics::new();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let snap = rt.block_on(m.snapshot());
        assert_eq!(snap.frames_captured, 0);
        assert_eq!(snap.frames_encoded, 0);
        assert_eq!(snap.cumulative_bytes, 0);
    }

    #[test]
    fn record_encoded_updates_bytes_and_cumulative() {
        let m = Metrics::new();
        m.record_encoded(1000);
        m.record_encoded(500);
        let rt = tokio::runtime::Runtime::new().unwrap();
        let snap = rt.block_on(m.snapshot());
        assert_eq!(snap.frames_encoded, 2);
        assert_eq!(snap.last_frame_bytes, 500);
        assert_eq!(snap.cumulative_bytes, 1500);
    }

    #[test]
    fn ewma_converges_toward_constant_input() {
        let mut ewma = Ewma::default();
        for _ in 0..50 {
            ewma.sample(16.0);
        }
        assert!((ewma.get() - 16.0).abs() < 0.01);
    }

    #[test]
    fn ewma_first_sample_is_exact() {
        let mut ewma = Ewma::default();
        ewma.sample(42.0);
        assert_eq!(ewma.get(), 42.0);
    }
}
