//! Telemetry publication: per-channel log appends plus the cooldown-gated
//! controller snapshot.
//!
//! The main loop calls [`TelemetryPublisher::publish`] once per reading.  The
//! snapshot half never runs on the caller: when the gate opens a job is
//! queued for the [`SnapshotWorker`], which captures a frame and appends the
//! `controller` record on its own task.
//!
//! The job queue is bounded.  When it is full the NEW job is dropped (the
//! gate has already fired, so that interval simply gets no snapshot).

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::actuator::RelaySnapshot;
use crate::camera::SnapshotProvider;
use crate::mqtt::Channel;
use crate::sink::{self, SinkError, TelemetrySink};

/// Log key of the controller snapshot records.
pub const CONTROLLER_KEY: &str = "controller";

// ---------------------------------------------------------------------------
// Readings and records
// ---------------------------------------------------------------------------

/// One inbound sensor message after parsing and conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub channel: Channel,
    /// The payload value as received, or the raw payload text when it did
    /// not parse.
    pub raw: Value,
    /// Percent for recognized channels whose value converted.
    pub normalized: Option<f64>,
    pub timestamp: i64,
}

impl SensorReading {
    /// The value that gets logged: the percent when there is one, otherwise
    /// the raw value unchanged.
    pub fn value(&self) -> Value {
        match self.normalized {
            Some(pct) => json!(pct),
            None => self.raw.clone(),
        }
    }
}

/// Entry in a channel log.
#[derive(Debug, Serialize)]
pub struct SensorRecord {
    pub timestamp: i64,
    pub value: Value,
    #[serde(flatten)]
    pub relay: RelaySnapshot,
}

/// Entry in the `controller` log.
#[derive(Debug, Serialize)]
pub struct ControllerRecord {
    pub timestamp: i64,
    #[serde(flatten)]
    pub relay: RelaySnapshot,
    /// Base64 JPEG; empty when the capture failed.
    pub image_base64: String,
}

fn encode<T: Serialize>(key: &str, record: &T) -> Result<Value, SinkError> {
    serde_json::to_value(record).map_err(|source| SinkError::Encode {
        key: key.to_string(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Cooldown gate
// ---------------------------------------------------------------------------

/// Opens at most once per `interval`.  The first call always opens.
#[derive(Debug)]
pub struct CooldownGate {
    interval: Duration,
    last_fire: Option<Instant>,
}

impl CooldownGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fire: None,
        }
    }

    /// Open the gate if strictly more than `interval` has passed since it
    /// last opened.  The fire time is recorded here, not when the snapshot
    /// completes.
    pub fn try_fire(&mut self, now: Instant) -> bool {
        match self.last_fire {
            Some(prev) if now.saturating_duration_since(prev) <= self.interval => false,
            _ => {
                self.last_fire = Some(now);
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot queue + worker
// ---------------------------------------------------------------------------

/// Work item for the snapshot worker: the actuator state at dispatch time.
#[derive(Debug)]
pub struct SnapshotJob {
    pub relay: RelaySnapshot,
}

#[derive(Clone)]
pub struct SnapshotQueue {
    tx: mpsc::Sender<SnapshotJob>,
}

impl SnapshotQueue {
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<SnapshotJob>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    /// Queue a job without waiting.  Returns `false` if it was dropped.
    pub fn submit(&self, job: SnapshotJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("snapshot queue full — dropping new snapshot");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("snapshot worker gone — dropping snapshot");
                false
            }
        }
    }
}

pub struct SnapshotWorker {
    sink: Arc<dyn TelemetrySink>,
    camera: Arc<dyn SnapshotProvider>,
}

impl SnapshotWorker {
    /// Start the worker task.  It runs until every [`SnapshotQueue`] clone is
    /// dropped and the queue has drained.
    pub fn spawn(
        sink: Arc<dyn TelemetrySink>,
        camera: Arc<dyn SnapshotProvider>,
        depth: usize,
    ) -> (SnapshotQueue, JoinHandle<()>) {
        let (queue, rx) = SnapshotQueue::new(depth);
        let worker = Self { sink, camera };
        let handle = tokio::spawn(worker.run(rx));
        (queue, handle)
    }

    async fn run(self, mut rx: mpsc::Receiver<SnapshotJob>) {
        while let Some(job) = rx.recv().await {
            if let Err(e) = self.handle(job).await {
                warn!(key = CONTROLLER_KEY, "controller record not written: {e}");
            }
        }
        debug!("snapshot worker stopped");
    }

    async fn handle(&self, job: SnapshotJob) -> Result<(), SinkError> {
        let image_base64 = match self.camera.capture_encoded().await {
            Ok(jpeg) => STANDARD.encode(jpeg),
            Err(e) => {
                warn!("snapshot capture failed: {e}");
                String::new()
            }
        };
        let record = ControllerRecord {
            timestamp: crate::now_ms(),
            relay: job.relay,
            image_base64,
        };
        let entry = encode(CONTROLLER_KEY, &record)?;
        let len = sink::append(self.sink.as_ref(), CONTROLLER_KEY, entry).await?;
        debug!(entries = len, "controller record appended");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

pub struct TelemetryPublisher {
    sink: Arc<dyn TelemetrySink>,
    gate: CooldownGate,
    snapshots: SnapshotQueue,
}

impl TelemetryPublisher {
    pub fn new(sink: Arc<dyn TelemetrySink>, cooldown: Duration, snapshots: SnapshotQueue) -> Self {
        Self {
            sink,
            gate: CooldownGate::new(cooldown),
            snapshots,
        }
    }

    /// Append `reading` (stamped with `relay`) to its channel log, then run
    /// the cooldown gate.  The gate is checked even if the append failed.
    pub async fn publish(&mut self, reading: &SensorReading, relay: RelaySnapshot) -> Result<(), SinkError> {
        let key = reading.channel.name();
        let record = SensorRecord {
            timestamp: reading.timestamp,
            value: reading.value(),
            relay: relay.clone(),
        };

        let appended = match encode(key, &record) {
            Ok(entry) => sink::append(self.sink.as_ref(), key, entry).await.map(|len| {
                debug!(channel = %reading.channel, entries = len, "telemetry appended");
            }),
            Err(e) => Err(e),
        };

        if self.gate.try_fire(Instant::now()) {
            self.snapshots.submit(SnapshotJob { relay });
        }
        appended
    }
}

// ===========================================================================
// Tests
// ===========================================================================
