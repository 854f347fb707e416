use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, ClientError, Event, MqttOptions, Outgoing, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;

use crate::config::MqttConfig;
use crate::models::{MeterConfig, Reading};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("MQTT client error: {0}")]
    Client(#[from] ClientError),
    #[error("MQTT connection already closed")]
    Closed,
    #[error("MQTT request queue is full")]
    QueueFull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MqttConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct MqttHealthStatus {
    pub status: MqttConnectionStatus,
    pub last_connected: Option<Instant>,
    pub last_message_sent: Option<Instant>,
    pub connection_attempts: u64,
}

impl MqttHealthStatus {
    pub fn new() -> Self {
        Self {
            status: MqttConnectionStatus::Disconnected,
            last_connected: None,
            last_message_sent: None,
            connection_attempts: 0,
        }
    }
}

impl Default for MqttHealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub type MqttHealth = Arc<RwLock<MqttHealthStatus>>;

fn update_health(health: &MqttHealth, f: impl FnOnce(&mut MqttHealthStatus)) {
    let mut h = health.write().unwrap_or_else(PoisonError::into_inner);
    f(&mut h);
}

/// Whatever is able to put a payload on a topic
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, topic: String, payload: String, retain: bool) -> Result<(), PublishError>;

    async fn disconnect(&self) -> Result<(), PublishError> {
        Ok(())
    }
}

/// One poll result on its way to the broker
#[derive(Debug, Clone)]
pub struct MeteringData {
    pub meter: MeterConfig,
    pub reading: Reading,
}

/// Format like the meters display: fewer decimals for bigger values
pub fn format_value(value: f64) -> String {
    let magnitude = value.abs();
    if magnitude >= 100.0 {
        format!("{:.2}", value)
    } else if magnitude >= 1.0 {
        format!("{:.3}", value)
    } else {
        format!("{:.6}", value)
    }
}

/// Turns readings into one retained message per metric below `{prefix}/{slug}/`
#[derive(Clone)]
pub struct MqttSink {
    prefix: String,
    publisher: Arc<dyn MessagePublisher>,
}

impl MqttSink {
    pub fn new(prefix: &str, publisher: Arc<dyn MessagePublisher>) -> Self {
        MqttSink {
            prefix: prefix.trim_end_matches('/').to_string(),
            publisher,
        }
    }

    pub fn topic(&self, meter: &MeterConfig, metric: &str) -> String {
        format!("{}/{}/{}", self.prefix, meter.slug, metric)
    }

    /// Publish every value of the reading, returns how many made it to the client.
    ///
    /// Failures are logged and dropped, the next cycle brings fresh values anyway.
    pub async fn publish(&self, meter: &MeterConfig, reading: &Reading) -> usize {
        let mut sent = 0;
        for (name, value) in reading.values.iter() {
            let topic = self.topic(meter, name);
            match self.publisher.publish(topic.clone(), format_value(*value), true).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!("Dropping {} for {}: {}", topic, meter.display_name, e);
                }
            }
        }

        debug!("Published {}/{} values of {}", sent, reading.values.len(), meter.display_name);
        return sent;
    }

    /// Publish everything arriving on `rx` until all senders are gone
    pub async fn start_thread(self, mut rx: Receiver<MeteringData>) {
        while let Some(data) = rx.recv().await {
            self.publish(&data.meter, &data.reading).await;
        }
        info!("Metering channel closed, MQTT sink stops");
    }

}

/// Broker connection backed by rumqttc
pub struct MqttManager {
    client: AsyncClient,
    health: MqttHealth,
    eventloop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttManager {
    /// Set up the client and start the event loop task, the connection itself is made lazily
    pub fn new(config: &MqttConfig) -> Self {
        info!("MQTT connection to {}:{} starting up", config.host, config.port);
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if let (Some(user), Some(pass)) = (&config.user, &config.pass) {
            mqttoptions.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
        let health: MqttHealth = Arc::new(RwLock::new(MqttHealthStatus::new()));

        let loop_health = health.clone();
        let handle = tokio::spawn(async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                        update_health(&loop_health, |h| {
                            h.status = MqttConnectionStatus::Connected;
                            h.last_connected = Some(Instant::now());
                        });
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(_))) => {
                        update_health(&loop_health, |h| h.last_message_sent = Some(Instant::now()));
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        info!("MQTT disconnect sent, event loop stops");
                        update_health(&loop_health, |h| h.status = MqttConnectionStatus::Disconnected);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting", e);
                        update_health(&loop_health, |h| {
                            h.status = MqttConnectionStatus::Error(e.to_string());
                            h.connection_attempts += 1;
                        });
                        /* do not hammer an unreachable broker */
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        update_health(&loop_health, |h| h.status = MqttConnectionStatus::Reconnecting);
                    }
                }
            }
        });

        return MqttManager {
            client,
            health,
            eventloop: Mutex::new(Some(handle)),
        };
    }

    pub fn health(&self) -> MqttHealth {
        self.health.clone()
    }
}

#[async_trait]
impl MessagePublisher for MqttManager {
    async fn publish(&self, topic: String, payload: String, retain: bool) -> Result<(), PublishError> {
        let closed = self.eventloop.lock().unwrap_or_else(PoisonError::into_inner).is_none();
        if closed {
            return Err(PublishError::Closed);
        }
        /* while the broker is away nothing drains the request queue, old values are worthless then */
        match self.client.try_publish(topic, QoS::AtLeastOnce, retain, payload) {
            Ok(()) => Ok(()),
            Err(ClientError::TryRequest(_)) => Err(PublishError::QueueFull),
            Err(e) => Err(e.into()),
        }
    }

    async fn disconnect(&self) -> Result<(), PublishError> {
        let handle = self.eventloop.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(handle) = handle else {
            return Ok(());
        };

        let result = self.client.try_disconnect();
        /* a broker that is gone never sees the disconnect, don't wait for it forever */
        let abort = handle.abort_handle();
        if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
            warn!("MQTT event loop did not stop in time, aborting it");
            abort.abort();
        }
        update_health(&self.health, |h| h.status = MqttConnectionStatus::Disconnected);
        result?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::MeterModel;
    use tokio::sync::Mutex as AsyncMutex;

    /// Remembers everything, optionally refusing some topics
    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        pub messages: AsyncMutex<Vec<(String, String, bool)>>,
        pub refuse: Vec<String>,
    }

    #[async_trait]
    impl MessagePublisher for RecordingPublisher {
        async fn publish(&self, topic: String, payload: String, retain: bool) -> Result<(), PublishError> {
            if self.refuse.contains(&topic) {
                return Err(PublishError::Closed);
            }
            self.messages.lock().await.push((topic, payload, retain));
            Ok(())
        }
    }

    fn kitchen() -> MeterConfig {
        MeterConfig::new(MeterModel::SDM120, 101, Some("Kitchen".to_string()))
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(230.456), "230.46");
        assert_eq!(format_value(-1234.5), "-1234.50");
        assert_eq!(format_value(49.98), "49.980");
        assert_eq!(format_value(0.98), "0.980000");
        assert_eq!(format_value(0.0), "0.000000");
    }

    #[test]
    fn test_topic() {
        let publisher = Arc::new(RecordingPublisher::default());
        let sink = MqttSink::new("home/energy/sdm/", publisher);
        let panel = MeterConfig::new(MeterModel::SDM630, 100, Some("Main Panel".to_string()));

        assert_eq!(sink.topic(&kitchen(), "Voltage"), "home/energy/sdm/kitchen/Voltage");
        assert_eq!(sink.topic(&panel, "Power/L1"), "home/energy/sdm/main-panel/Power/L1");
    }

    #[tokio::test]
    async fn test_publish_reading() {
        let publisher = Arc::new(RecordingPublisher::default());
        let sink = MqttSink::new("sdm", publisher.clone());

        let mut reading = Reading::new(101);
        reading.values.insert("Voltage".to_string(), 230.0);
        reading.values.insert("Frequency".to_string(), 50.01);

        assert_eq!(sink.publish(&kitchen(), &reading).await, 2);

        let messages = publisher.messages.lock().await;
        assert_eq!(messages.len(), 2);
        assert!(messages.contains(&("sdm/kitchen/Voltage".to_string(), "230.00".to_string(), true)));
        assert!(messages.contains(&("sdm/kitchen/Frequency".to_string(), "50.010".to_string(), true)));
    }

    #[tokio::test]
    async fn test_failed_reading_publishes_nothing() {
        let publisher = Arc::new(RecordingPublisher::default());
        let sink = MqttSink::new("sdm", publisher.clone());

        let reading = Reading::failed(101, "no response".to_string());
        assert_eq!(sink.publish(&kitchen(), &reading).await, 0);
        assert!(publisher.messages.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_errors_are_dropped() {
        let publisher = Arc::new(RecordingPublisher {
            refuse: vec!["sdm/kitchen/Voltage".to_string()],
            ..Default::default()
        });
        let sink = MqttSink::new("sdm", publisher.clone());

        let mut reading = Reading::new(101);
        reading.values.insert("Voltage".to_string(), 230.0);
        reading.values.insert("Current".to_string(), 1.5);

        assert_eq!(sink.publish(&kitchen(), &reading).await, 1);
        assert_eq!(publisher.messages.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_broker_never_blocks() {
        let mut config = crate::config::Config::parse("meters: []").unwrap().mqtt;
        config.host = "127.0.0.1".to_string();
        config.port = 1;
        let mqtt = MqttManager::new(&config);

        let mut dropped = 0;
        for i in 0..150 {
            let sent = tokio::time::timeout(
                Duration::from_millis(500),
                mqtt.publish(format!("sdm/kitchen/{}", i), "1.000".to_string(), true),
            )
            .await
            .expect("publish waited for the broker");
            if matches!(sent, Err(PublishError::QueueFull)) {
                dropped += 1;
            }
        }
        assert!(dropped > 0);

        assert!(tokio::time::timeout(Duration::from_secs(5), mqtt.disconnect()).await.is_ok());
        assert!(matches!(
            mqtt.publish("sdm/kitchen/Voltage".to_string(), "230.00".to_string(), true).await,
            Err(PublishError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_sink_drains_channel() {
        let publisher = Arc::new(RecordingPublisher::default());
        let sink = MqttSink::new("sdm", publisher.clone());
        let (tx, rx) = tokio::sync::mpsc::channel(4);

        let task = tokio::spawn(sink.start_thread(rx));
        let mut reading = Reading::new(101);
        reading.values.insert("Power".to_string(), 1500.0);
        tx.send(MeteringData { meter: kitchen(), reading }).await.unwrap();
        drop(tx);

        task.await.unwrap();
        assert_eq!(publisher.messages.lock().await.len(), 1);
    }
}
