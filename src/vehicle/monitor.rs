use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{Direction, MotionStatus, TelemetryReading, VehicleState, VehicleStateHandle};
use crate::config::TelemetrySettings;
use crate::ticker::Ticker;

/// Anything that can report the vehicle's current motion.
pub trait TelemetrySource: Send {
    fn poll(&mut self) -> Result<TelemetryReading>;
}

#[derive(Debug, Deserialize)]
struct TelemetryDocument {
    status: String,
    #[serde(default)]
    direction: Option<String>,
}

/// Parse `{"status": "MOVING", "direction": "FORWARD"}`. Case-insensitive;
/// a missing direction is `Unknown`, an unknown status is an error.
pub fn parse_telemetry(body: &str) -> Result<TelemetryReading> {
    let doc: TelemetryDocument =
        serde_json::from_str(body).context("parse telemetry document")?;
    Ok(TelemetryReading {
        status: doc.status.parse()?,
        direction: doc
            .direction
            .as_deref()
            .map(Direction::parse)
            .unwrap_or(Direction::Unknown),
    })
}

/// Polls a JSON telemetry document over HTTP.
pub struct HttpTelemetrySource {
    agent: ureq::Agent,
    url: String,
}

impl HttpTelemetrySource {
    pub fn new(settings: &TelemetrySettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(settings.timeout)
            .build();
        Self {
            agent,
            url: settings.url.clone(),
        }
    }
}

impl TelemetrySource for HttpTelemetrySource {
    fn poll(&mut self) -> Result<TelemetryReading> {
        let body = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("poll telemetry {}", self.url))?
            .into_string()
            .context("read telemetry body")?;
        parse_telemetry(&body)
    }
}

/// Single writer of [`VehicleState`].
pub struct VehicleStateMonitor {
    source: Box<dyn TelemetrySource>,
    state: VehicleStateHandle,
    interval: Duration,
    consecutive_failures: u32,
}

impl VehicleStateMonitor {
    pub fn new(
        source: Box<dyn TelemetrySource>,
        state: VehicleStateHandle,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            state,
            interval,
            consecutive_failures: 0,
        }
    }

    /// One poll cycle. On error the shared state is left untouched.
    pub fn poll_once(&mut self) -> Result<VehicleState> {
        let reading = match self.source.poll() {
            Ok(reading) => reading,
            Err(err) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures == 1 {
                    log::warn!("telemetry poll failed, keeping last known state: {:#}", err);
                } else {
                    log::debug!(
                        "telemetry poll failed ({} in a row): {:#}",
                        self.consecutive_failures,
                        err
                    );
                }
                return Err(err);
            }
        };
        if self.consecutive_failures > 0 {
            log::info!(
                "telemetry recovered after {} failed polls",
                self.consecutive_failures
            );
            self.consecutive_failures = 0;
        }

        let before = self.state.snapshot();
        let after = self.state.apply(reading);
        if after.segment != before.segment {
            log::info!(
                "vehicle moving {} (segment {}), stop latch rearmed",
                after.direction,
                after.segment
            );
        } else if after.status != before.status {
            log::info!("vehicle {}", after.status);
        } else if after.direction != before.direction {
            log::info!("vehicle direction {}", after.direction);
        }
        Ok(after)
    }

    pub fn run(mut self, shutdown: Arc<AtomicBool>) {
        log::info!("vehicle state monitor started ({:?} interval)", self.interval);
        let mut ticker = Ticker::new(self.interval);
        while !shutdown.load(Ordering::SeqCst) {
            let _ = self.poll_once();
            if !ticker.wait(&shutdown) {
                break;
            }
        }
        log::info!("vehicle state monitor stopped");
    }
}
