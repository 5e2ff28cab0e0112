use std::time::Duration;

/// Ring depth: 30 minutes of one-second buckets.
pub const BUCKET_COUNT: usize = 1_800;

/// Reporting windows, in seconds.
pub const WINDOWS: [u32; 4] = [60, 300, 600, 1_800];

pub const SNAPSHOT_VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MetricKind {
    CompressionRatio = 0,
    EncryptionTime = 1,
    DecryptionTime = 2,
    RoundTripTime = 3,
}

pub const KIND_COUNT: usize = 4;

impl MetricKind {
    pub const ALL: [MetricKind; KIND_COUNT] = [
        MetricKind::CompressionRatio,
        MetricKind::EncryptionTime,
        MetricKind::DecryptionTime,
        MetricKind::RoundTripTime,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::CompressionRatio => "compression_ratio",
            MetricKind::EncryptionTime => "encryption_time",
            MetricKind::DecryptionTime => "decryption_time",
            MetricKind::RoundTripTime => "round_trip_time",
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Bucket {
    sum: f64,
    count: u64,
}

/// 30 minutes of per-second `{sum, count}` buckets per metric kind, folded by
/// a single writer. Window averages are sample-weighted: every recorded sample
/// carries the same weight regardless of how bursty its second was.
pub struct TelemetryRing {
    buckets: Vec<[Bucket; KIND_COUNT]>,
    cursor: usize,
    current_second: u64,
}

impl TelemetryRing {
    pub fn new() -> Self {
        Self {
            buckets: vec![[Bucket::default(); KIND_COUNT]; BUCKET_COUNT],
            cursor: 0,
            current_second: 0,
        }
    }

    /// Folds one sample into the bucket for `now_second` (monotone seconds).
    pub fn record(&mut self, now_second: u64, kind: MetricKind, value: f64) {
        self.rotate_to(now_second);
        let bucket = &mut self.buckets[self.cursor][kind as usize];
        bucket.sum += value;
        bucket.count += 1;
    }

    /// Advances the cursor to `now_second`, resetting every skipped bucket.
    pub fn rotate_to(&mut self, now_second: u64) {
        if now_second <= self.current_second {
            return;
        }
        let steps = (now_second - self.current_second).min(BUCKET_COUNT as u64);
        for _ in 0..steps {
            self.cursor = (self.cursor + 1) % BUCKET_COUNT;
            self.buckets[self.cursor] = [Bucket::default(); KIND_COUNT];
        }
        self.current_second = now_second;
    }

    /// Sliding-window averages ending at `now_second`.
    pub fn snapshot(&mut self, now_second: u64) -> TelemetrySnapshot {
        self.rotate_to(now_second);
        let mut windows = Vec::with_capacity(KIND_COUNT * WINDOWS.len());
        for kind in MetricKind::ALL {
            for window in WINDOWS {
                windows.push(WindowAverage {
                    kind,
                    window_seconds: window,
                    average: self.window_average(kind, window as usize),
                });
            }
        }
        TelemetrySnapshot { windows }
    }

    fn window_average(&self, kind: MetricKind, window: usize) -> Option<f64> {
        let mut sum = 0.0;
        let mut count = 0u64;
        for offset in 0..window.min(BUCKET_COUNT) {
            let index = (self.cursor + BUCKET_COUNT - offset) % BUCKET_COUNT;
            let bucket = self.buckets[index][kind as usize];
            sum += bucket.sum;
            count += bucket.count;
        }
        if count == 0 {
            None
        } else {
            Some(sum / count as f64)
        }
    }
}

impl Default for TelemetryRing {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WindowAverage {
    pub kind: MetricKind,
    pub window_seconds: u32,
    pub average: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TelemetrySnapshot {
    pub windows: Vec<WindowAverage>,
}

impl TelemetrySnapshot {
    pub fn average(&self, kind: MetricKind, window_seconds: u32) -> Option<f64> {
        self.windows
            .iter()
            .find(|entry| entry.kind == kind && entry.window_seconds == window_seconds)
            .and_then(|entry| entry.average)
    }

    /// Binary rendering persisted every minute:
    /// `[ver=1 | unix_seconds | (metric_kind, window_s, avg_f64)*]`, all
    /// little-endian. Windows with no samples are omitted.
    pub fn encode(&self, unix_seconds: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + 8 + self.windows.len() * 13);
        bytes.push(SNAPSHOT_VERSION);
        bytes.extend_from_slice(&unix_seconds.to_le_bytes());
        for entry in &self.windows {
            if let Some(average) = entry.average {
                bytes.push(entry.kind as u8);
                bytes.extend_from_slice(&entry.window_seconds.to_le_bytes());
                bytes.extend_from_slice(&average.to_le_bytes());
            }
        }
        bytes
    }
}

/// Millisecond rendering used for duration metrics.
pub fn duration_millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}
