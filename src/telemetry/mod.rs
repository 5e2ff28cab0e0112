mod ring;

pub use ring::{
    duration_millis, MetricKind, TelemetrySnapshot, TelemetryRing, WindowAverage, BUCKET_COUNT,
    SNAPSHOT_VERSION, WINDOWS,
};

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_secs(60);

/// Non-blocking producer half: enqueues samples onto an unbounded channel.
/// The consumer task is the only writer touching the ring.
#[derive(Clone)]
pub struct TelemetrySink {
    tx: Option<mpsc::UnboundedSender<(MetricKind, f64)>>,
}

impl TelemetrySink {
    pub fn record(&self, kind: MetricKind, value: f64) {
        if let Some(tx) = &self.tx {
            let _ = tx.send((kind, value));
        }
    }

    pub fn record_duration(&self, kind: MetricKind, duration: Duration) {
        self.record(kind, duration_millis(duration));
    }

    /// Sink that drops every sample, for contexts without an aggregator.
    pub fn disabled() -> Self {
        Self { tx: None }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TelemetryOptions {
    /// Destination of the periodic binary snapshot; `None` disables persistence.
    pub snapshot_path: Option<PathBuf>,
    pub persist_interval: Option<Duration>,
}

/// Owner of the aggregation task. Dropping the handle stops the task.
pub struct Telemetry {
    sink: TelemetrySink,
    ring: Arc<Mutex<TelemetryRing>>,
    started: Instant,
    task: JoinHandle<()>,
}

impl Telemetry {
    pub fn spawn(options: TelemetryOptions) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(MetricKind, f64)>();
        let ring = Arc::new(Mutex::new(TelemetryRing::new()));
        let started = Instant::now();

        let task_ring = Arc::clone(&ring);
        let persist_interval = options
            .persist_interval
            .unwrap_or(DEFAULT_PERSIST_INTERVAL);
        let snapshot_path = options.snapshot_path.clone();
        let task = tokio::spawn(async move {
            let mut persist_tick = tokio::time::interval(persist_interval);
            persist_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick of a tokio interval fires immediately.
            persist_tick.tick().await;

            loop {
                tokio::select! {
                    sample = rx.recv() => {
                        match sample {
                            Some((kind, value)) => {
                                let second = started.elapsed().as_secs();
                                task_ring.lock().unwrap().record(second, kind, value);
                            }
                            None => break,
                        }
                    }
                    _ = persist_tick.tick() => {
                        if let Some(path) = &snapshot_path {
                            let second = started.elapsed().as_secs();
                            let snapshot = task_ring.lock().unwrap().snapshot(second);
                            let encoded = snapshot.encode(unix_seconds());
                            if let Err(err) = tokio::fs::write(path, encoded).await {
                                log::warn!("telemetry snapshot write failed: {err}");
                            }
                        }
                    }
                }
            }
        });

        Self {
            sink: TelemetrySink { tx: Some(tx) },
            ring,
            started,
            task,
        }
    }

    pub fn sink(&self) -> TelemetrySink {
        self.sink.clone()
    }

    /// Current sliding-window averages.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let second = self.started.elapsed().as_secs();
        self.ring.lock().unwrap().snapshot(second)
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
