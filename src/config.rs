use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::danger::{ColorBand, DetectorThresholds, ModelCheck};
use crate::gate::{DecayPolicy, GateSettings};
use crate::ingest::ReconnectPolicy;
use crate::{CameraId, CameraRole, Facing};

const DEFAULT_WIDTH: u32 = 320;
const DEFAULT_HEIGHT: u32 = 240;
const DEFAULT_FPS: u32 = 15;
const MAX_FPS: u32 = 1_000;
const DEFAULT_STREAM_QUALITY: u8 = 30;
const DEFAULT_COMMAND_URL: &str = "http://127.0.0.1:9000/command.json";
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 500;
const DEFAULT_QUEUE_CAPACITY: usize = 16;
const DEFAULT_STOP_PREFIX: &str = "STOP_EMERGENCY";
const DEFAULT_MQTT_TOPIC: &str = "raiv/command";
const DEFAULT_MQTT_CLIENT_ID: &str = "raiv_guard";
const DEFAULT_TELEMETRY_URL: &str = "http://127.0.0.1:9000/telemetry.json";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_TELEMETRY_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_SNAPSHOT_DIR: &str = "snapshots";
const DEFAULT_SNAPSHOT_INTERVAL_MS: u64 = 1_000;
const DEFAULT_SNAPSHOT_QUALITY: u8 = 95;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;
const DEFAULT_MAX_BACKOFF_MS: u64 = 8_000;
const DEFAULT_MAX_CONSECUTIVE_MISSES: u32 = 30;

#[derive(Debug, Deserialize, Default)]
struct GuardConfigFile {
    cameras: Option<Vec<CameraConfigFile>>,
    command: Option<CommandConfigFile>,
    telemetry: Option<TelemetryConfigFile>,
    snapshots: Option<SnapshotConfigFile>,
    model: Option<ModelConfigFile>,
    reconnect: Option<ReconnectConfigFile>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    id: u32,
    source: String,
    role: CameraRole,
    facing: Option<Facing>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    stream_quality: Option<u8>,
    detectors: Option<DetectorConfigFile>,
    gate: Option<GateConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    luminance_floor: Option<f64>,
    contrast_floor: Option<f64>,
    sharpness_floor: Option<f64>,
    color_band: Option<ColorBand>,
    model: Option<ModelCheck>,
}

#[derive(Debug, Deserialize, Default)]
struct GateConfigFile {
    threshold: Option<u32>,
    decay: Option<DecayPolicy>,
}

#[derive(Debug, Deserialize, Default)]
struct CommandConfigFile {
    transport: Option<CommandTransport>,
    url: Option<String>,
    timeout_ms: Option<u64>,
    queue_capacity: Option<usize>,
    stop_prefix: Option<String>,
    mqtt_broker: Option<String>,
    mqtt_topic: Option<String>,
    mqtt_client_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TelemetryConfigFile {
    url: Option<String>,
    poll_interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotConfigFile {
    enabled: Option<bool>,
    dir: Option<PathBuf>,
    interval_ms: Option<u64>,
    quality: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct ModelConfigFile {
    path: PathBuf,
    input_width: u32,
    input_height: u32,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ReconnectConfigFile {
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    max_consecutive_misses: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub cameras: Vec<CameraConfig>,
    pub command: CommandSettings,
    pub telemetry: TelemetrySettings,
    pub snapshots: SnapshotSettings,
    pub model: Option<ModelSettings>,
    pub reconnect: ReconnectPolicy,
}

/// Per-camera configuration. Immutable once the runtime starts.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub id: CameraId,
    /// Device index ("0"), device path ("/dev/video0"), HTTP MJPEG URL, or `stub://`.
    pub source: String,
    pub role: CameraRole,
    pub facing: Option<Facing>,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    /// JPEG quality for frames published to the stream buffer.
    pub stream_quality: u8,
    pub detectors: DetectorThresholds,
    pub gate: GateSettings,
}

impl CameraConfig {
    pub fn detect(id: u32, source: &str, facing: Facing) -> Self {
        Self {
            facing: Some(facing),
            ..Self::base(id, source, CameraRole::Detect)
        }
    }

    pub fn capture(id: u32, source: &str) -> Self {
        Self::base(id, source, CameraRole::Capture)
    }

    fn base(id: u32, source: &str, role: CameraRole) -> Self {
        Self {
            id: CameraId(id),
            source: source.to_string(),
            role,
            facing: None,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            target_fps: DEFAULT_FPS,
            stream_quality: DEFAULT_STREAM_QUALITY,
            detectors: DetectorThresholds::default(),
            gate: GateSettings::default(),
        }
    }

    /// Loop period for `target_fps`, never shorter than one millisecond.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis((1000 / self.target_fps.max(1) as u64).max(1))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandTransport {
    Http,
    Mqtt,
    /// Log the command instead of sending it. For bench runs.
    Log,
}

impl FromStr for CommandTransport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "mqtt" => Ok(Self::Mqtt),
            "log" => Ok(Self::Log),
            other => Err(anyhow!(
                "unknown command transport '{}'; expected http, mqtt or log",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandSettings {
    pub transport: CommandTransport,
    pub url: String,
    pub timeout: Duration,
    pub queue_capacity: usize,
    pub stop_prefix: String,
    pub mqtt: MqttSettings,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: Option<String>,
    pub topic: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub url: String,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub enabled: bool,
    pub dir: PathBuf,
    pub interval: Duration,
    /// JPEG quality for stored snapshots, independent of the stream quality.
    pub quality: u8,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub path: PathBuf,
    pub input_width: u32,
    pub input_height: u32,
    /// Class names by output index; unnamed classes are labelled by index.
    pub labels: Vec<String>,
}

impl GuardConfig {
    /// Load from the file named by `GUARD_CONFIG` (if any), then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("GUARD_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Built-in defaults: the four-camera vehicle layout, no file, no env.
    pub fn defaults() -> Result<Self> {
        let mut cfg = Self::from_file(GuardConfigFile::default())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GuardConfigFile) -> Result<Self> {
        let cameras = match file.cameras {
            Some(entries) => entries.into_iter().map(camera_from_file).collect(),
            None => default_cameras(),
        };

        let command_file = file.command.unwrap_or_default();
        let command = CommandSettings {
            transport: command_file.transport.unwrap_or(CommandTransport::Http),
            url: command_file
                .url
                .unwrap_or_else(|| DEFAULT_COMMAND_URL.to_string()),
            timeout: Duration::from_millis(
                command_file
                    .timeout_ms
                    .unwrap_or(DEFAULT_COMMAND_TIMEOUT_MS),
            ),
            queue_capacity: command_file
                .queue_capacity
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
            stop_prefix: command_file
                .stop_prefix
                .unwrap_or_else(|| DEFAULT_STOP_PREFIX.to_string()),
            mqtt: MqttSettings {
                broker: command_file.mqtt_broker,
                topic: command_file
                    .mqtt_topic
                    .unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
                client_id: command_file
                    .mqtt_client_id
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
            },
        };

        let telemetry_file = file.telemetry.unwrap_or_default();
        let telemetry = TelemetrySettings {
            url: telemetry_file
                .url
                .unwrap_or_else(|| DEFAULT_TELEMETRY_URL.to_string()),
            poll_interval: Duration::from_millis(
                telemetry_file
                    .poll_interval_ms
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            timeout: Duration::from_millis(
                telemetry_file
                    .timeout_ms
                    .unwrap_or(DEFAULT_TELEMETRY_TIMEOUT_MS),
            ),
        };

        let snapshot_file = file.snapshots.unwrap_or_default();
        let snapshots = SnapshotSettings {
            enabled: snapshot_file.enabled.unwrap_or(true),
            dir: snapshot_file
                .dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR)),
            interval: Duration::from_millis(
                snapshot_file
                    .interval_ms
                    .unwrap_or(DEFAULT_SNAPSHOT_INTERVAL_MS),
            ),
            quality: snapshot_file.quality.unwrap_or(DEFAULT_SNAPSHOT_QUALITY),
        };

        let model = file.model.map(|model| ModelSettings {
            path: model.path,
            input_width: model.input_width,
            input_height: model.input_height,
            labels: model.labels,
        });

        let reconnect_file = file.reconnect.unwrap_or_default();
        let reconnect = ReconnectPolicy {
            initial_backoff: Duration::from_millis(
                reconnect_file
                    .initial_backoff_ms
                    .unwrap_or(DEFAULT_INITIAL_BACKOFF_MS),
            ),
            max_backoff: Duration::from_millis(
                reconnect_file
                    .max_backoff_ms
                    .unwrap_or(DEFAULT_MAX_BACKOFF_MS),
            ),
            max_consecutive_misses: reconnect_file
                .max_consecutive_misses
                .unwrap_or(DEFAULT_MAX_CONSECUTIVE_MISSES),
        };

        Ok(Self {
            cameras,
            command,
            telemetry,
            snapshots,
            model,
            reconnect,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(transport) = std::env::var("GUARD_COMMAND_TRANSPORT") {
            if !transport.trim().is_empty() {
                self.command.transport = transport.parse()?;
            }
        }
        if let Ok(url) = std::env::var("GUARD_COMMAND_URL") {
            if !url.trim().is_empty() {
                self.command.url = url;
            }
        }
        if let Ok(timeout) = std::env::var("GUARD_COMMAND_TIMEOUT_MS") {
            let ms: u64 = timeout
                .parse()
                .map_err(|_| anyhow!("GUARD_COMMAND_TIMEOUT_MS must be an integer"))?;
            self.command.timeout = Duration::from_millis(ms);
        }
        if let Ok(url) = std::env::var("GUARD_TELEMETRY_URL") {
            if !url.trim().is_empty() {
                self.telemetry.url = url;
            }
        }
        if let Ok(interval) = std::env::var("GUARD_POLL_INTERVAL_MS") {
            let ms: u64 = interval
                .parse()
                .map_err(|_| anyhow!("GUARD_POLL_INTERVAL_MS must be an integer"))?;
            self.telemetry.poll_interval = Duration::from_millis(ms);
        }
        if let Ok(dir) = std::env::var("GUARD_SNAPSHOT_DIR") {
            if !dir.trim().is_empty() {
                self.snapshots.dir = PathBuf::from(dir);
            }
        }
        if let Ok(broker) = std::env::var("GUARD_MQTT_BROKER") {
            if !broker.trim().is_empty() {
                self.command.mqtt.broker = Some(broker);
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(anyhow!("at least one camera must be configured"));
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.id) {
                return Err(anyhow!("duplicate camera id {}", camera.id.0));
            }
            validate_camera(camera, self.model.is_some())?;
        }

        match self.command.transport {
            CommandTransport::Http => validate_http_url(&self.command.url, "command url")?,
            CommandTransport::Mqtt => {
                let broker = self
                    .command
                    .mqtt
                    .broker
                    .as_deref()
                    .ok_or_else(|| anyhow!("mqtt command transport requires mqtt_broker"))?;
                if !broker.contains(':') {
                    return Err(anyhow!("mqtt_broker must be host:port, got '{}'", broker));
                }
                if self.command.mqtt.topic.trim().is_empty() {
                    return Err(anyhow!("mqtt_topic must not be empty"));
                }
            }
            CommandTransport::Log => {}
        }
        if self.command.timeout.is_zero() {
            return Err(anyhow!("command timeout must be greater than zero"));
        }
        if self.command.queue_capacity == 0 {
            return Err(anyhow!("command queue capacity must be greater than zero"));
        }
        if self.command.stop_prefix.trim().is_empty() {
            return Err(anyhow!("stop_prefix must not be empty"));
        }

        validate_http_url(&self.telemetry.url, "telemetry url")?;
        if self.telemetry.poll_interval.is_zero() || self.telemetry.timeout.is_zero() {
            return Err(anyhow!("telemetry interval and timeout must be greater than zero"));
        }

        if self.snapshots.interval.is_zero() {
            return Err(anyhow!("snapshot interval must be greater than zero"));
        }
        if !(1..=100).contains(&self.snapshots.quality) {
            return Err(anyhow!("snapshot quality must be within 1..=100"));
        }

        if let Some(model) = &self.model {
            if model.input_width == 0 || model.input_height == 0 {
                return Err(anyhow!("model input dimensions must be non-zero"));
            }
        }

        if self.reconnect.initial_backoff.is_zero()
            || self.reconnect.max_backoff < self.reconnect.initial_backoff
        {
            return Err(anyhow!(
                "reconnect backoff must be non-zero with max >= initial"
            ));
        }
        if self.reconnect.max_consecutive_misses == 0 {
            return Err(anyhow!("max_consecutive_misses must be greater than zero"));
        }
        Ok(())
    }

    pub fn camera(&self, id: CameraId) -> Option<&CameraConfig> {
        self.cameras.iter().find(|camera| camera.id == id)
    }
}

/// Right track capture, rear guard, front guard, left track capture.
fn default_cameras() -> Vec<CameraConfig> {
    vec![
        CameraConfig::capture(1, "0"),
        CameraConfig::detect(2, "1", Facing::Rear),
        CameraConfig::detect(3, "2", Facing::Front),
        CameraConfig::capture(4, "3"),
    ]
}

fn camera_from_file(file: CameraConfigFile) -> CameraConfig {
    let mut camera = match (file.role, file.facing) {
        (CameraRole::Detect, Some(facing)) => CameraConfig::detect(file.id, &file.source, facing),
        (role, facing) => CameraConfig {
            facing,
            ..CameraConfig::base(file.id, &file.source, role)
        },
    };
    camera.width = file.width.unwrap_or(DEFAULT_WIDTH);
    camera.height = file.height.unwrap_or(DEFAULT_HEIGHT);
    camera.target_fps = file.target_fps.unwrap_or(DEFAULT_FPS);
    camera.stream_quality = file.stream_quality.unwrap_or(DEFAULT_STREAM_QUALITY);

    let detectors = file.detectors.unwrap_or_default();
    let defaults = DetectorThresholds::default();
    camera.detectors = DetectorThresholds {
        luminance_floor: detectors
            .luminance_floor
            .unwrap_or(defaults.luminance_floor),
        contrast_floor: detectors.contrast_floor.or(defaults.contrast_floor),
        sharpness_floor: detectors.sharpness_floor.or(defaults.sharpness_floor),
        color_band: detectors.color_band,
        model: detectors.model,
    };

    let gate = file.gate.unwrap_or_default();
    let gate_defaults = GateSettings::default();
    camera.gate = GateSettings {
        threshold: gate.threshold.unwrap_or(gate_defaults.threshold),
        decay: gate.decay.unwrap_or(gate_defaults.decay),
    };
    camera
}

fn validate_camera(camera: &CameraConfig, model_configured: bool) -> Result<()> {
    let id = camera.id;
    if camera.source.trim().is_empty() {
        return Err(anyhow!("{}: source must not be empty", id));
    }
    if camera.width == 0 || camera.height == 0 {
        return Err(anyhow!("{}: width and height must be non-zero", id));
    }
    if !(1..=MAX_FPS).contains(&camera.target_fps) {
        return Err(anyhow!("{}: target_fps must be within 1..={}", id, MAX_FPS));
    }
    if !(1..=100).contains(&camera.stream_quality) {
        return Err(anyhow!("{}: stream_quality must be within 1..=100", id));
    }
    if camera.role == CameraRole::Capture {
        return Ok(());
    }

    if camera.facing.is_none() {
        return Err(anyhow!("{}: detect cameras must declare a facing", id));
    }
    if camera.gate.threshold == 0 {
        return Err(anyhow!("{}: gate threshold must be >= 1", id));
    }
    let detectors = &camera.detectors;
    check_non_negative(detectors.luminance_floor, "luminance_floor", id)?;
    if let Some(floor) = detectors.contrast_floor {
        check_non_negative(floor, "contrast_floor", id)?;
    }
    if let Some(floor) = detectors.sharpness_floor {
        check_non_negative(floor, "sharpness_floor", id)?;
    }
    if let Some(band) = &detectors.color_band {
        band.validate()
            .with_context(|| format!("{}: invalid color_band", id))?;
    }
    if let Some(check) = &detectors.model {
        if !model_configured {
            return Err(anyhow!(
                "{}: model check configured but no model section present",
                id
            ));
        }
        check
            .validate()
            .with_context(|| format!("{}: invalid model check", id))?;
    }
    Ok(())
}

fn check_non_negative(value: f64, name: &str, id: CameraId) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(anyhow!("{}: {} must be a finite value >= 0", id, name));
    }
    Ok(())
}

fn validate_http_url(value: &str, name: &str) -> Result<()> {
    let parsed = url::Url::parse(value).with_context(|| format!("parse {} '{}'", name, value))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(anyhow!("{} must use http(s), got '{}'", name, other)),
    }
}

fn read_config_file(path: &Path) -> Result<GuardConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
