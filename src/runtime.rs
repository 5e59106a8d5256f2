//! Thread wiring: one worker per camera, one dispatcher, one vehicle monitor.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::buffer::SharedFrameBuffer;
use crate::config::GuardConfig;
use crate::detect;
use crate::dispatch::{build_sink, CommandDispatcher, CommandSink, DispatchStats};
use crate::ingest::{CameraSource, SourceConfig};
use crate::latch::StopLatch;
use crate::snapshot::{DirectorySnapshotSink, SnapshotSink, SnapshotThrottle};
use crate::vehicle::{HttpTelemetrySource, TelemetrySource, VehicleStateHandle, VehicleStateMonitor};
use crate::worker::{CameraWorker, WorkerLinks, WorkerStats};
use crate::{CameraId, CameraRole};

/// Builder for a running guard. Telemetry and command transports default to
/// the configured HTTP/MQTT ones and can be replaced (bench rigs, tests).
pub struct GuardRuntime {
    config: GuardConfig,
    telemetry: Option<Box<dyn TelemetrySource>>,
    sink: Option<Box<dyn CommandSink>>,
    snapshots: Option<Arc<dyn SnapshotSink>>,
}

impl GuardRuntime {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            telemetry: None,
            sink: None,
            snapshots: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Box<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_command_sink(mut self, sink: Box<dyn CommandSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_snapshot_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.snapshots = Some(sink);
        self
    }

    pub fn start(self) -> Result<GuardHandle> {
        let GuardRuntime {
            config,
            telemetry,
            sink,
            snapshots,
        } = self;

        let shutdown = Arc::new(AtomicBool::new(false));
        let buffer = Arc::new(SharedFrameBuffer::new(config.cameras.iter().map(|c| c.id)));
        let vehicle = VehicleStateHandle::new();
        let latch = Arc::new(StopLatch::new());

        let sink = match sink {
            Some(sink) => sink,
            None => build_sink(&config.command)?,
        };
        let dispatcher = CommandDispatcher::start(sink, config.command.queue_capacity)?;

        let snapshots = match snapshots {
            Some(sink) => Some(sink),
            None if config.snapshots.enabled => {
                match DirectorySnapshotSink::create(&config.snapshots.dir) {
                    Ok(sink) => Some(Arc::new(sink) as Arc<dyn SnapshotSink>),
                    Err(err) => {
                        log::error!("snapshots disabled: {:#}", err);
                        None
                    }
                }
            }
            None => None,
        };

        let links = WorkerLinks {
            buffer: buffer.clone(),
            latch,
            vehicle: vehicle.clone(),
            dispatcher: dispatcher.handle(),
            stop_prefix: config.command.stop_prefix.clone(),
        };

        // Owns everything spawned so far: an early return drops it, which
        // raises shutdown and stops the dispatcher.
        let mut guard = GuardHandle {
            shutdown: shutdown.clone(),
            workers: Vec::with_capacity(config.cameras.len()),
            monitor: None,
            dispatcher: Some(dispatcher),
            buffer,
            vehicle: vehicle.clone(),
        };

        let capture_count = config
            .cameras
            .iter()
            .filter(|c| c.role == CameraRole::Capture)
            .count();
        let mut capture_index = 0;

        for camera in &config.cameras {
            let source = Box::new(CameraSource::new(SourceConfig::for_camera(camera)));
            let mut worker =
                CameraWorker::new(camera, source, links.clone(), config.reconnect.clone())?;

            if camera.role == CameraRole::Detect && camera.detectors.model.is_some() {
                if let Some(model) = &config.model {
                    match detect::load_detector(model) {
                        Ok(detector) => worker = worker.with_detector(detector),
                        Err(err) => {
                            log::error!("{}: model check disabled: {:#}", camera.id, err)
                        }
                    }
                }
            }
            if camera.role == CameraRole::Capture {
                if let Some(sink) = &snapshots {
                    let throttle = SnapshotThrottle::new(
                        config.snapshots.interval,
                        capture_index,
                        capture_count,
                    );
                    worker = worker.with_snapshots(sink.clone(), throttle, config.snapshots.quality);
                }
                capture_index += 1;
            }

            let flag = shutdown.clone();
            let handle = std::thread::Builder::new()
                .name(format!("cam{}", camera.id.0))
                .spawn(move || worker.run(flag))
                .with_context(|| format!("spawn worker for {}", camera.id))?;
            guard.workers.push((camera.id, handle));
        }

        let telemetry: Box<dyn TelemetrySource> = match telemetry {
            Some(telemetry) => telemetry,
            None => Box::new(HttpTelemetrySource::new(&config.telemetry)),
        };
        let monitor = VehicleStateMonitor::new(telemetry, vehicle.clone(), config.telemetry.poll_interval);
        let flag = shutdown.clone();
        let monitor = std::thread::Builder::new()
            .name("vehicle-monitor".to_string())
            .spawn(move || monitor.run(flag))
            .context("spawn vehicle monitor")?;
        guard.monitor = Some(monitor);

        log::info!(
            "guard running: {} cameras, {} capture",
            config.cameras.len(),
            capture_count
        );
        Ok(guard)
    }
}

/// Handle to a running guard. Dropping it signals shutdown and stops the
/// dispatcher, but does not wait for the camera workers.
pub struct GuardHandle {
    shutdown: Arc<AtomicBool>,
    workers: Vec<(CameraId, JoinHandle<WorkerStats>)>,
    monitor: Option<JoinHandle<()>>,
    dispatcher: Option<CommandDispatcher>,
    buffer: Arc<SharedFrameBuffer>,
    vehicle: VehicleStateHandle,
}

impl GuardHandle {
    /// Frame slots for the streaming layer.
    pub fn frames(&self) -> Arc<SharedFrameBuffer> {
        self.buffer.clone()
    }

    pub fn vehicle(&self) -> VehicleStateHandle {
        self.vehicle.clone()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher
            .as_ref()
            .map(|d| d.stats())
            .unwrap_or_default()
    }

    /// Signal every thread, close the sources, and wait for them.
    pub fn stop(mut self) -> Vec<(CameraId, WorkerStats)> {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut stats = Vec::with_capacity(self.workers.len());
        for (id, handle) in self.workers.drain(..) {
            match handle.join() {
                Ok(worker_stats) => stats.push((id, worker_stats)),
                Err(_) => log::error!("{}: worker thread panicked", id),
            }
        }
        if let Some(monitor) = self.monitor.take() {
            if monitor.join().is_err() {
                log::error!("vehicle monitor thread panicked");
            }
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown();
        }
        log::info!("guard stopped");
        stats
    }
}

impl Drop for GuardHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
