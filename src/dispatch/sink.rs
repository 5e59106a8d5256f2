use anyhow::{anyhow, Context, Result};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::CommandSettings;

/// Outbound command channel to the actuator side.
///
/// `send` runs on the dispatcher thread only and must give up within the
/// sink's own timeout.
pub trait CommandSink: Send {
    fn name(&self) -> &'static str;

    fn send(&mut self, payload: &str) -> Result<()>;
}

/// Writes the payload as a JSON string with an HTTP PUT, replacing the
/// command document on the receiving side.
pub struct HttpCommandSink {
    agent: ureq::Agent,
    url: String,
}

impl HttpCommandSink {
    pub fn new(url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            url: url.to_string(),
        }
    }

    pub fn from_settings(settings: &CommandSettings) -> Self {
        Self::new(&settings.url, settings.timeout)
    }
}

impl CommandSink for HttpCommandSink {
    fn name(&self) -> &'static str {
        "http"
    }

    fn send(&mut self, payload: &str) -> Result<()> {
        let body = serde_json::to_string(payload).context("encode command payload")?;
        self.agent
            .put(&self.url)
            .set("Content-Type", "application/json")
            .send_string(&body)
            .with_context(|| format!("put command to {}", self.url))?;
        Ok(())
    }
}

/// Logs commands instead of sending them.
pub struct LogCommandSink;

impl CommandSink for LogCommandSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn send(&mut self, payload: &str) -> Result<()> {
        log::warn!("command (log transport): {}", payload);
        Ok(())
    }
}

/// In-memory sink for tests and bench runs. Clones share the same record.
#[derive(Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<String>>>,
    delay: Duration,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every `send`, simulating a slow network.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make every `send` fail after recording the attempt.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CommandSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn send(&mut self, payload: &str) -> Result<()> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload.to_string());
        if self.fail {
            return Err(anyhow!("recording sink configured to fail"));
        }
        Ok(())
    }
}
