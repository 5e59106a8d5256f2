use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;

use raiv_guard::danger::DetectorThresholds;
use raiv_guard::dispatch::RecordingSink;
use raiv_guard::gate::GateSettings;
use raiv_guard::snapshot::SnapshotSink;
use raiv_guard::vehicle::{TelemetryReading, TelemetrySource};
use raiv_guard::{
    CameraConfig, CameraId, CommandDispatcher, DangerReason, DangerScorer, DecayPolicy, Direction,
    Facing, Frame, GateState, GuardConfig, GuardRuntime, MotionStatus, PersistenceGate, StopLatch,
    VehicleStateHandle,
};

fn moving(direction: Direction) -> TelemetryReading {
    TelemetryReading {
        status: MotionStatus::Moving,
        direction,
    }
}

fn standby() -> TelemetryReading {
    TelemetryReading {
        status: MotionStatus::Standby,
        direction: Direction::Unknown,
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

fn solid_frame(value: u8) -> Frame {
    Frame::from_rgb(vec![value; 64 * 48 * 3], 64, 48, 1).unwrap()
}

fn textured_frame() -> Frame {
    let mut data = Vec::with_capacity(64 * 48 * 3);
    for y in 0..48u32 {
        for x in 0..64u32 {
            let v = if (x / 4 + y / 4) % 2 == 0 { 210 } else { 50 };
            data.extend_from_slice(&[v, v, v]);
        }
    }
    Frame::from_rgb(data, 64, 48, 1).unwrap()
}

#[test]
fn scenario_a_dark_frames_confirm_and_clear_frame_decays() {
    let thresholds = DetectorThresholds {
        luminance_floor: 10.0,
        ..DetectorThresholds::default()
    };
    let mut scorer = DangerScorer::new(CameraId(3), thresholds);
    let mut decrement = PersistenceGate::new(GateSettings {
        threshold: 3,
        decay: DecayPolicy::Decrement,
    });
    let mut reset = PersistenceGate::new(GateSettings {
        threshold: 3,
        decay: DecayPolicy::Reset,
    });

    let dark = solid_frame(3);
    for expected in [GateState::Accumulating(1), GateState::Accumulating(2), GateState::Confirmed] {
        let verdict = scorer.score(&dark);
        assert!(verdict.is_danger);
        assert_eq!(verdict.reason, DangerReason::Covered);
        decrement.observe(verdict.is_danger);
        reset.observe(verdict.is_danger);
        assert_eq!(decrement.state(), expected);
        assert_eq!(reset.state(), expected);
    }

    let verdict = scorer.score(&textured_frame());
    assert!(!verdict.is_danger);
    decrement.observe(verdict.is_danger);
    reset.observe(verdict.is_danger);

    // Decaying debounce: one unit of evidence removed, still confirmed.
    assert_eq!(decrement.counter(), 2);
    assert_eq!(decrement.state(), GateState::Confirmed);
    // Reset policy: straight back to clear.
    assert_eq!(reset.state(), GateState::Clear);
}

#[test]
fn luminance_floor_overrides_every_other_check() {
    let thresholds = DetectorThresholds {
        luminance_floor: 10.0,
        contrast_floor: None,
        ..DetectorThresholds::default()
    };
    let mut scorer = DangerScorer::new(CameraId(2), thresholds);
    for value in 0..10u8 {
        let verdict = scorer.score(&solid_frame(value));
        assert!(verdict.is_danger, "mean luminance {}", value);
        assert_eq!(verdict.reason, DangerReason::Covered);
    }
    assert!(!scorer.score(&solid_frame(11)).is_danger);
}

#[test]
fn scenario_b_one_stop_per_segment() -> Result<()> {
    let sink = RecordingSink::new();
    let dispatcher = CommandDispatcher::start(Box::new(sink.clone()), 8)?;
    let handle = dispatcher.handle();
    let vehicle = VehicleStateHandle::new();
    let latch = StopLatch::new();
    let mut enqueued = 0;

    let mut cycle = |vehicle: &VehicleStateHandle| {
        if latch.should_stop(Facing::Front, true, &vehicle.snapshot())
            && handle.enqueue(raiv_guard::dispatch::stop_payload("STOP_EMERGENCY"))
        {
            enqueued += 1;
        }
    };

    vehicle.apply(standby());
    vehicle.apply(moving(Direction::Forward));
    cycle(&vehicle);
    for _ in 0..5 {
        cycle(&vehicle);
    }
    vehicle.apply(moving(Direction::Forward));
    cycle(&vehicle);

    vehicle.apply(standby());
    cycle(&vehicle);
    vehicle.apply(moving(Direction::Forward));
    cycle(&vehicle);
    cycle(&vehicle);

    assert_eq!(enqueued, 2);
    assert!(wait_until(Duration::from_secs(5), || sink.sent().len() == 2));
    dispatcher.shutdown();
    Ok(())
}

#[test]
fn rear_camera_never_stops_forward_motion_and_vice_versa() {
    let vehicle = VehicleStateHandle::new();
    let latch = StopLatch::new();
    for _ in 0..10 {
        vehicle.apply(moving(Direction::Forward));
        assert!(!latch.should_stop(Facing::Rear, true, &vehicle.snapshot()));
        vehicle.apply(moving(Direction::Backward));
        assert!(!latch.should_stop(Facing::Front, true, &vehicle.snapshot()));
        vehicle.apply(standby());
    }
}

#[test]
fn enqueue_is_bounded_while_every_delivery_hangs() -> Result<()> {
    let sink = RecordingSink::new().with_delay(Duration::from_secs(2));
    let dispatcher = CommandDispatcher::start(Box::new(sink), 4)?;
    let handle = dispatcher.handle();

    for i in 0..100 {
        let start = Instant::now();
        handle.enqueue(format!("STOP_{}", i));
        assert!(start.elapsed() < Duration::from_millis(50));
    }
    assert!(handle.stats().rejected >= 94);
    Ok(())
}

/// Telemetry whose reading the test flips while the runtime is live.
#[derive(Clone)]
struct SharedTelemetry(Arc<Mutex<TelemetryReading>>);

impl SharedTelemetry {
    fn set(&self, reading: TelemetryReading) {
        *self.0.lock().unwrap() = reading;
    }
}

impl TelemetrySource for SharedTelemetry {
    fn poll(&mut self) -> Result<TelemetryReading> {
        Ok(*self.0.lock().unwrap())
    }
}

#[test]
fn runtime_stops_once_per_segment_and_streams_every_camera() -> Result<()> {
    let snapshots = tempfile::tempdir()?;
    let mut cfg = GuardConfig::defaults()?;
    cfg.cameras = vec![
        CameraConfig::capture(1, "stub://right"),
        CameraConfig::detect(2, "stub://rear?pattern=dark", Facing::Rear),
        CameraConfig::detect(3, "stub://front?pattern=dark", Facing::Front),
        CameraConfig::capture(4, "stub://left"),
    ];
    for camera in &mut cfg.cameras {
        camera.width = 64;
        camera.height = 48;
        camera.target_fps = 30;
    }
    cfg.telemetry.poll_interval = Duration::from_millis(20);
    cfg.snapshots.dir = snapshots.path().join("snaps");
    cfg.snapshots.interval = Duration::from_millis(100);

    let telemetry = SharedTelemetry(Arc::new(Mutex::new(standby())));
    let sink = RecordingSink::new();
    let guard = GuardRuntime::new(cfg)
        .with_telemetry(Box::new(telemetry.clone()))
        .with_command_sink(Box::new(sink.clone()))
        .start()?;

    let frames = guard.frames();
    assert!(wait_until(Duration::from_secs(5), || {
        (1..=4).all(|id| frames.latest(CameraId(id)).is_some())
    }));
    // Confirmed but standing still: nothing sent.
    std::thread::sleep(Duration::from_millis(200));
    assert!(sink.sent().is_empty());

    telemetry.set(moving(Direction::Forward));
    assert!(wait_until(Duration::from_secs(5), || sink.sent().len() == 1));
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(sink.sent().len(), 1, "front camera must fire once per segment");

    telemetry.set(standby());
    assert!(wait_until(Duration::from_secs(5), || !guard.vehicle().snapshot().is_moving()));
    telemetry.set(moving(Direction::Forward));
    assert!(wait_until(Duration::from_secs(5), || sink.sent().len() == 2));
    assert!(wait_until(Duration::from_secs(5), || guard.dispatch_stats().delivered == 2));
    let dispatch = guard.dispatch_stats();
    assert_eq!(dispatch.enqueued, 2);
    assert_eq!(dispatch.rejected, 0);
    assert_eq!(dispatch.failed, 0);

    let stats = guard.stop();
    let stops: u64 = stats.iter().map(|(_, s)| s.stops_requested).sum();
    assert_eq!(stops, 2);
    let rear = stats.iter().find(|(id, _)| *id == CameraId(2)).expect("rear stats");
    assert_eq!(rear.1.stops_requested, 0);

    let stored = std::fs::read_dir(snapshots.path().join("snaps"))?.count();
    assert!(stored > 0);
    Ok(())
}

struct DiscardSnapshots;

impl SnapshotSink for DiscardSnapshots {
    fn store(&self, _camera: CameraId, _captured_at: SystemTime, _jpeg: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[test]
fn failed_start_stops_workers_already_spawned() -> Result<()> {
    let mut cfg = GuardConfig::defaults()?;
    let mut broken = CameraConfig::detect(2, "stub://rear", Facing::Rear);
    broken.facing = None;
    cfg.cameras = vec![CameraConfig::capture(1, "stub://right"), broken];
    for camera in &mut cfg.cameras {
        camera.width = 32;
        camera.height = 24;
    }

    let snapshots: Arc<dyn SnapshotSink> = Arc::new(DiscardSnapshots);
    let result = GuardRuntime::new(cfg)
        .with_telemetry(Box::new(SharedTelemetry(Arc::new(Mutex::new(standby())))))
        .with_command_sink(Box::new(RecordingSink::new()))
        .with_snapshot_sink(snapshots.clone())
        .start();
    assert!(result.is_err());

    // The capture worker held the only other reference; it drops it on exit.
    assert!(wait_until(Duration::from_secs(5), || Arc::strong_count(&snapshots) == 1));
    Ok(())
}
