//! Per-camera worker loop.
//!
//! Each iteration: make sure the source is open, read one frame, score it and
//! feed the gate (Detect cameras), ask the latch whether to stop, publish the
//! encoded frame, and store a snapshot when due (Capture cameras).
//!
//! Source handle, scorer, gate and snapshot throttle belong to this worker
//! alone. The only shared state it touches is the vehicle state (read), the
//! stop latch, the dispatcher queue and its own frame buffer slot.

use anyhow::{anyhow, Result};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer::SharedFrameBuffer;
use crate::config::CameraConfig;
use crate::danger::{DangerScorer, DangerVerdict};
use crate::detect::ObjectDetector;
use crate::dispatch::{stop_payload, DispatcherHandle};
use crate::frame::Frame;
use crate::gate::{GateState, GateTransition, PersistenceGate};
use crate::ingest::{FrameSource, ReconnectPolicy, ReconnectState};
use crate::latch::StopLatch;
use crate::snapshot::{SnapshotSink, SnapshotThrottle};
use crate::ticker::Ticker;
use crate::vehicle::VehicleStateHandle;
use crate::{CameraId, CameraRole, Facing};

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct WorkerLinks {
    pub buffer: Arc<SharedFrameBuffer>,
    pub latch: Arc<StopLatch>,
    pub vehicle: VehicleStateHandle,
    pub dispatcher: DispatcherHandle,
    pub stop_prefix: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub frames: u64,
    pub misses: u64,
    pub reconnects: u64,
    pub confirmations: u64,
    pub stops_requested: u64,
    pub stops_rejected: u64,
    pub snapshots: u64,
}

/// What one call to [`CameraWorker::step`] did.
#[derive(Debug)]
pub enum StepOutcome {
    /// Source closed and not yet due for another open attempt, or the
    /// attempt failed.
    Offline,
    /// Source open but produced nothing usable.
    NoFrame,
    Processed(FrameReport),
}

#[derive(Debug)]
pub struct FrameReport {
    pub sequence: u64,
    pub verdict: Option<DangerVerdict>,
    pub transition: GateTransition,
    pub confirmed: bool,
    pub stop_enqueued: bool,
}

struct DetectPipeline {
    facing: Facing,
    scorer: DangerScorer,
    gate: PersistenceGate,
}

struct SnapshotPlan {
    sink: Arc<dyn SnapshotSink>,
    throttle: SnapshotThrottle,
    quality: u8,
}

pub struct CameraWorker {
    id: CameraId,
    role: CameraRole,
    frame_interval: Duration,
    stream_quality: u8,
    source: Box<dyn FrameSource>,
    reconnect: ReconnectState,
    opened_before: bool,
    detect: Option<DetectPipeline>,
    snapshots: Option<SnapshotPlan>,
    links: WorkerLinks,
    stats: WorkerStats,
}

impl CameraWorker {
    pub fn new(
        camera: &CameraConfig,
        source: Box<dyn FrameSource>,
        links: WorkerLinks,
        reconnect: ReconnectPolicy,
    ) -> Result<Self> {
        let detect = match camera.role {
            CameraRole::Capture => None,
            CameraRole::Detect => {
                let facing = camera
                    .facing
                    .ok_or_else(|| anyhow!("{}: detect camera without facing", camera.id))?;
                Some(DetectPipeline {
                    facing,
                    scorer: DangerScorer::new(camera.id, camera.detectors.clone()),
                    gate: PersistenceGate::new(camera.gate),
                })
            }
        };
        Ok(Self {
            id: camera.id,
            role: camera.role,
            frame_interval: camera.frame_interval(),
            stream_quality: camera.stream_quality,
            source,
            reconnect: ReconnectState::new(reconnect),
            opened_before: false,
            detect,
            snapshots: None,
            links,
            stats: WorkerStats::default(),
        })
    }

    /// Attach the object detector for the model check. Ignored for Capture
    /// cameras.
    pub fn with_detector(mut self, detector: Box<dyn ObjectDetector>) -> Self {
        if let Some(pipeline) = self.detect.take() {
            self.detect = Some(DetectPipeline {
                scorer: pipeline.scorer.with_detector(detector),
                ..pipeline
            });
        }
        self
    }

    /// Store snapshots through `sink`, encoded at `quality` rather than the
    /// stream quality.
    pub fn with_snapshots(
        mut self,
        sink: Arc<dyn SnapshotSink>,
        throttle: SnapshotThrottle,
        quality: u8,
    ) -> Self {
        self.snapshots = Some(SnapshotPlan {
            sink,
            throttle,
            quality,
        });
        self
    }

    pub fn id(&self) -> CameraId {
        self.id
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    pub fn gate_state(&self) -> Option<GateState> {
        self.detect.as_ref().map(|pipeline| pipeline.gate.state())
    }

    /// One iteration of the worker loop. Never returns an error: device and
    /// encoding faults are logged and counted.
    pub fn step(&mut self) -> StepOutcome {
        let now = Instant::now();
        if !self.source.is_open() && !self.try_open(now) {
            return StepOutcome::Offline;
        }

        match self.source.read() {
            Ok(Some(frame)) => {
                self.reconnect.frame_received();
                StepOutcome::Processed(self.process(frame, now))
            }
            Ok(None) => {
                self.record_miss();
                StepOutcome::NoFrame
            }
            Err(err) => {
                log::debug!("{}: read failed: {:#}", self.id, err);
                self.record_miss();
                StepOutcome::NoFrame
            }
        }
    }

    fn try_open(&mut self, now: Instant) -> bool {
        if !self.reconnect.ready(now) {
            return false;
        }
        match self.source.open() {
            Ok(()) => {
                self.reconnect.opened();
                if self.opened_before {
                    self.stats.reconnects += 1;
                    log::info!("{}: reconnected to {}", self.id, self.source.describe());
                } else {
                    log::info!("{}: {} camera on {}", self.id, self.role, self.source.describe());
                }
                self.opened_before = true;
                true
            }
            Err(err) => {
                let delay = self.reconnect.open_failed(now);
                if self.reconnect.failed_opens() == 1 {
                    log::warn!("{}: open failed, retrying in {:?}: {:#}", self.id, delay, err);
                } else {
                    log::debug!(
                        "{}: open attempt {} failed, retrying in {:?}: {:#}",
                        self.id,
                        self.reconnect.failed_opens(),
                        delay,
                        err
                    );
                }
                false
            }
        }
    }

    fn record_miss(&mut self) {
        self.stats.misses += 1;
        if self.reconnect.missed() {
            log::warn!("{}: source stalled, reopening {}", self.id, self.source.describe());
            self.source.close();
        }
    }

    fn process(&mut self, mut frame: Frame, now: Instant) -> FrameReport {
        self.stats.frames += 1;
        let vehicle = self.links.vehicle.snapshot();

        let mut verdict = None;
        let mut transition = GateTransition::None;
        let mut confirmed = false;
        let mut stop_enqueued = false;

        if let Some(pipeline) = self.detect.as_mut() {
            let scored = pipeline.scorer.score(&frame);
            transition = pipeline.gate.observe(scored.is_danger);
            confirmed = pipeline.gate.is_confirmed();
            log::debug!(
                "{}: frame {} {} (score {:.2}) gate {:?}",
                self.id,
                frame.sequence,
                scored.reason,
                scored.score,
                pipeline.gate.state()
            );
            match transition {
                GateTransition::Confirmed => {
                    self.stats.confirmations += 1;
                    log::warn!(
                        "{}: danger confirmed ({}, score {:.2})",
                        self.id,
                        scored.reason,
                        scored.score
                    );
                }
                GateTransition::Cleared => log::info!("{}: danger cleared", self.id),
                GateTransition::None => {}
            }

            if self.links.latch.should_stop(pipeline.facing, confirmed, &vehicle) {
                let payload = stop_payload(&self.links.stop_prefix);
                if self.links.dispatcher.enqueue(payload.clone()) {
                    stop_enqueued = true;
                    self.stats.stops_requested += 1;
                    log::warn!(
                        "{}: requesting {} (moving {}, segment {})",
                        self.id,
                        payload,
                        vehicle.direction,
                        vehicle.segment
                    );
                } else {
                    self.stats.stops_rejected += 1;
                    self.links.latch.release(pipeline.facing, vehicle.segment);
                }
            }
            verdict = Some(scored);
        }

        if confirmed {
            frame.mark_alarm();
        }

        if let Some(plan) = self.snapshots.as_mut() {
            if plan.throttle.due(vehicle.is_moving(), now) {
                let stored = frame
                    .encode_jpeg(plan.quality)
                    .and_then(|jpeg| plan.sink.store(self.id, frame.captured_at, &jpeg));
                match stored {
                    Ok(()) => self.stats.snapshots += 1,
                    Err(err) => log::warn!("{}: snapshot failed: {:#}", self.id, err),
                }
            }
        }

        match frame.encode_jpeg(self.stream_quality) {
            Ok(jpeg) => {
                self.links.buffer.publish(self.id, jpeg);
            }
            Err(err) => log::warn!("{}: encode failed: {:#}", self.id, err),
        }

        FrameReport {
            sequence: frame.sequence,
            verdict,
            transition,
            confirmed,
            stop_enqueued,
        }
    }

    /// Run until `shutdown` is raised, then close the source.
    pub fn run(mut self, shutdown: Arc<AtomicBool>) -> WorkerStats {
        let mut ticker = Ticker::new(self.frame_interval);
        log::debug!("{}: pacing every {:?}", self.id, ticker.period());
        let mut last_stats_log = Instant::now();
        loop {
            self.step();
            if last_stats_log.elapsed() >= STATS_LOG_INTERVAL {
                self.log_stats();
                last_stats_log = Instant::now();
            }
            if !ticker.wait(&shutdown) {
                break;
            }
        }
        self.source.close();
        self.log_stats();
        self.stats
    }

    fn log_stats(&self) {
        let s = &self.stats;
        log::info!(
            "{} {}: frames={} misses={} reconnects={} confirmations={} stops={} snapshots={}",
            self.id,
            self.role,
            s.frames,
            s.misses,
            s.reconnects,
            s.confirmations,
            s.stops_requested,
            s.snapshots
        );
    }
}
