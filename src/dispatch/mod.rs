//! Outbound command dispatch.
//!
//! Camera workers never touch the network. They hand commands to a
//! [`DispatcherHandle`], whose `enqueue` is a non-blocking `try_send` into a
//! bounded queue. One consumer thread drains the queue and delivers each
//! command at most once through a [`CommandSink`]; failures are logged and
//! dropped, never retried.

mod mqtt;
mod sink;

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{CommandSettings, CommandTransport};

pub use mqtt::MqttCommandSink;
pub use sink::{CommandSink, HttpCommandSink, LogCommandSink, RecordingSink};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundCommand {
    pub payload: String,
    pub enqueued_at: Instant,
}

/// Unique stop payload: `{prefix}_{unix_millis}`.
pub fn stop_payload(prefix: &str) -> String {
    format!("{}_{}", prefix, crate::now_ms())
}

/// Build the sink selected by configuration.
pub fn build_sink(settings: &CommandSettings) -> Result<Box<dyn CommandSink>> {
    Ok(match settings.transport {
        CommandTransport::Http => Box::new(HttpCommandSink::from_settings(settings)),
        CommandTransport::Mqtt => Box::new(MqttCommandSink::connect(&settings.mqtt)?),
        CommandTransport::Log => Box::new(LogCommandSink),
    })
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub enqueued: u64,
    /// Refused because the queue was full or the consumer had stopped.
    pub rejected: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Producer side. Cheap to clone, one per camera worker.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: SyncSender<OutboundCommand>,
    counters: Arc<Counters>,
}

impl DispatcherHandle {
    /// Queue a command without blocking. Returns false if it was refused.
    pub fn enqueue(&self, payload: String) -> bool {
        let command = OutboundCommand {
            payload,
            enqueued_at: Instant::now(),
        };
        match self.tx.try_send(command) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(command)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("command queue full, rejected {}", command.payload);
                false
            }
            Err(TrySendError::Disconnected(command)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("command dispatcher stopped, rejected {}", command.payload);
                false
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

/// Owns the consumer thread.
pub struct CommandDispatcher {
    handle: DispatcherHandle,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CommandDispatcher {
    pub fn start(sink: Box<dyn CommandSink>, capacity: usize) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let counters = counters.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("command-dispatch".to_string())
                .spawn(move || consume(sink, rx, counters, shutdown))
                .context("spawn command dispatcher")?
        };

        Ok(Self {
            handle: DispatcherHandle { tx, counters },
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> DispatchStats {
        self.handle.stats()
    }

    /// Stop the consumer. Commands still queued are dropped.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("command dispatcher thread panicked");
            }
        }
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn consume(
    mut sink: Box<dyn CommandSink>,
    rx: Receiver<OutboundCommand>,
    counters: Arc<Counters>,
    shutdown: Arc<AtomicBool>,
) {
    log::info!("command dispatcher started ({} sink)", sink.name());
    while !shutdown.load(Ordering::SeqCst) {
        let command = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(command) => command,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let queued_for = command.enqueued_at.elapsed();
        match sink.send(&command.payload) {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "sent {} via {} (queued {:?}, total {:?})",
                    command.payload,
                    sink.name(),
                    queued_for,
                    command.enqueued_at.elapsed()
                );
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("dropping {}: {:#}", command.payload, err);
            }
        }
    }
    log::info!("command dispatcher stopped");
}
