use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::CommandSink;
use crate::config::MqttSettings;

const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Publishes commands at QoS 1 through a background MQTT connection.
///
/// `try_publish` only queues the packet for the connection thread, so a
/// broker outage never blocks the dispatcher.
pub struct MqttCommandSink {
    client: Client,
    topic: String,
    stopping: Arc<AtomicBool>,
    connection: Option<JoinHandle<()>>,
}

impl MqttCommandSink {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let broker = settings
            .broker
            .as_deref()
            .ok_or_else(|| anyhow!("mqtt transport requires a broker address"))?;
        let (host, port) = parse_broker(broker)?;

        let mut options = MqttOptions::new(&settings.client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_start(true);

        let (client, connection) = Client::new(options, 10);
        let stopping = Arc::new(AtomicBool::new(false));
        let flag = stopping.clone();
        let handle = std::thread::Builder::new()
            .name("mqtt-command".to_string())
            .spawn(move || drive_connection(connection, flag))
            .context("spawn mqtt connection thread")?;

        log::info!(
            "MQTT command sink: broker {}:{} topic {}",
            host,
            port,
            settings.topic
        );
        Ok(Self {
            client,
            topic: settings.topic.clone(),
            stopping,
            connection: Some(handle),
        })
    }
}

fn drive_connection(mut connection: Connection, stopping: Arc<AtomicBool>) {
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
            Err(e) => {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                log::warn!("MQTT connection error: {}", e);
                std::thread::sleep(RECONNECT_PAUSE);
            }
        }
    }
}

fn parse_broker(broker: &str) -> Result<(&str, u16)> {
    let (host, port) = broker
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("mqtt broker must be host:port, got '{}'", broker))?;
    let port = port
        .parse()
        .map_err(|_| anyhow!("invalid mqtt broker port '{}'", port))?;
    if host.is_empty() {
        return Err(anyhow!("mqtt broker host must not be empty"));
    }
    Ok((host, port))
}

impl CommandSink for MqttCommandSink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn send(&mut self, payload: &str) -> Result<()> {
        self.client
            .try_publish(
                self.topic.clone(),
                QoS::AtLeastOnce,
                false,
                payload.as_bytes().to_vec(),
            )
            .with_context(|| format!("publish command to {}", self.topic))?;
        Ok(())
    }
}

impl Drop for MqttCommandSink {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Err(err) = self.client.try_disconnect() {
            log::debug!("MQTT disconnect failed: {}", err);
        }
        if let Some(handle) = self.connection.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_address_parsing() -> Result<()> {
        assert_eq!(parse_broker("127.0.0.1:1883")?, ("127.0.0.1", 1883));
        assert_eq!(parse_broker("broker.local:8883")?, ("broker.local", 8883));
        assert!(parse_broker("broker.local").is_err());
        assert!(parse_broker(":1883").is_err());
        assert!(parse_broker("host:port").is_err());
        Ok(())
    }
}
