use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::api::{ApiManager, ApiState};
use crate::config::Config;
use crate::db::DataStore;
use crate::metering_modbus::transport::{RegisterTransport, SharedBus, TransportError};
use crate::metering_modbus::PollLoop;
use crate::models::MeterConfig;
use crate::mqtt::{MessagePublisher, MeteringData, MqttHealth, MqttSink};

/// Readings waiting for the broker, more than a few cycles worth is pointless
const METERING_QUEUE_SIZE: usize = 64;

/// How long each shutdown step may take before it is cut short
const SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("cannot open serial port: {0}")]
    Serial(#[from] TransportError),
    #[error("cannot start HTTP API: {0}")]
    Http(#[from] std::io::Error),
}

/// Owns all parts of the application and ties their lifetimes together
pub struct Runner<T> {
    config: Config,
    meters: Vec<MeterConfig>,
    bus: SharedBus<T>,
    store: Arc<DataStore>,
    publisher: Option<Arc<dyn MessagePublisher>>,
    mqtt_health: Option<MqttHealth>,
}

impl<T: RegisterTransport + 'static> Runner<T> {
    pub fn new(config: Config, meters: Vec<MeterConfig>, transport: T) -> Self {
        return Runner {
            config,
            meters,
            bus: SharedBus::new(transport),
            store: Arc::new(DataStore::new()),
            publisher: None,
            mqtt_health: None,
        };
    }

    /// Send readings to `publisher`. Without one readings only end up in the store.
    pub fn with_publisher(mut self, publisher: Arc<dyn MessagePublisher>, health: Option<MqttHealth>) -> Self {
        self.publisher = Some(publisher);
        self.mqtt_health = health;
        return self;
    }

    pub fn store(&self) -> Arc<DataStore> {
        self.store.clone()
    }

    /// Run until `shutdown` turns true, then stop everything in order:
    /// polling, pending MQTT messages, the broker connection and finally the API.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), RunnerError> {
        let (tx, rx) = mpsc::channel::<MeteringData>(METERING_QUEUE_SIZE);

        let mut sink_task = None;
        match &self.publisher {
            Some(publisher) => {
                let sink = MqttSink::new(&self.config.mqtt.topic_prefix, publisher.clone());
                sink_task = Some(tokio::spawn(sink.start_thread(rx)));
            }
            None => {
                info!("MQTT is disabled, readings are only available through the API");
                drop(rx);
            }
        }

        let poll = PollLoop::new(self.bus.clone(), self.meters.clone(), &self.config.polling, self.store.clone(), tx);

        let mut server = None;
        if self.config.httpd.enabled {
            let api = ApiManager::new(
                ApiState {
                    store: self.store.clone(),
                    meters: self.meters.clone(),
                    period: poll.period(),
                    unreachable_after: self.config.polling.unreachable_after,
                    mqtt_health: self.mqtt_health.clone(),
                    started: Instant::now(),
                },
                self.config.httpd.port,
            );
            let srv = api.start()?;
            let handle = srv.handle();
            server = Some((handle, tokio::spawn(srv)));
        }

        let poll_task = tokio::spawn(poll.run(shutdown.clone()));

        info!("All modules started, now waiting for a signal to exit");
        loop {
            let stop = *shutdown.borrow();
            if stop {
                break;
            }
            if shutdown.changed().await.is_err() {
                warn!("Shutdown channel closed, stopping");
                break;
            }
        }
        info!("Shutting down");

        /* the poll loop owns the only sender, once it is gone the sink runs dry */
        if let Err(e) = poll_task.await {
            error!("Poll loop ended abnormally: {}", e);
        }

        if let Some(mut task) = sink_task {
            match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("MQTT sink ended abnormally: {}", e),
                Err(_) => {
                    warn!("MQTT sink still busy after {:?}, dropping what is left", SHUTDOWN_STEP_TIMEOUT);
                    task.abort();
                }
            }
        }

        if let Some(publisher) = &self.publisher {
            match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, publisher.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Error while disconnecting from MQTT: {}", e),
                Err(_) => warn!("MQTT disconnect did not finish in {:?}", SHUTDOWN_STEP_TIMEOUT),
            }
        }

        if let Some((handle, task)) = server {
            handle.stop(true).await;
            match task.await {
                Ok(Err(e)) => error!("HTTP API ended with an error: {}", e),
                Err(e) => error!("HTTP API ended abnormally: {}", e),
                Ok(Ok(())) => {}
            }
        }

        info!("Shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering_modbus::client::tests::FakeMeter;
    use crate::models::MeterModel;
    use crate::mqtt::tests::RecordingPublisher;
    use crate::mqtt::PublishError;

    fn config() -> Config {
        let mut config = Config::parse("meters: []").unwrap();
        config.httpd.enabled = false;
        config.mqtt.topic_prefix = "test".to_string();
        config.polling.interval = 3600;
        config.polling.inter_request_delay_ms = 0;
        config.polling.inter_meter_delay_ms = 0;
        config
    }

    #[tokio::test]
    async fn test_run_and_shutdown() {
        let publisher = Arc::new(RecordingPublisher::default());
        let meters = vec![MeterConfig::new(MeterModel::SDM120, 101, Some("Kitchen".to_string()))];
        let runner = Runner::new(config(), meters, FakeMeter::healthy()).with_publisher(publisher.clone(), None);
        let store = runner.store();

        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(runner.run(shutdown));

        /* the first tick fires right away */
        for _ in 0..200 {
            if store.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.len(), 1);

        stop.send(true).unwrap();
        task.await.unwrap().unwrap();

        /* everything queued before the shutdown reached the publisher */
        let messages = publisher.messages.lock().await;
        assert_eq!(messages.len(), store.get(101).unwrap().values.len());
        assert!(messages.iter().all(|(topic, _, retain)| topic.starts_with("test/kitchen/") && *retain));
    }

    /// A broker that never acknowledges anything
    struct HangingPublisher;

    #[async_trait::async_trait]
    impl MessagePublisher for HangingPublisher {
        async fn publish(&self, _topic: String, _payload: String, _retain: bool) -> Result<(), PublishError> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), PublishError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    async fn wait_for_reading(store: &DataStore) {
        for _ in 0..200 {
            if !store.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no reading arrived");
    }

    #[tokio::test]
    async fn test_shutdown_with_stuck_broker() {
        let meters = vec![MeterConfig::new(MeterModel::SDM630, 100, None)];
        let runner = Runner::new(config(), meters, FakeMeter::healthy()).with_publisher(Arc::new(HangingPublisher), None);
        let store = runner.store();

        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(runner.run(shutdown));
        wait_for_reading(&store).await;

        stop.send(true).unwrap();
        let finished = tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT * 4, task).await;
        assert!(finished.expect("runner hangs on a stuck publisher").unwrap().is_ok());
    }

    #[actix_web::test]
    async fn test_run_with_api() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let mut config = config();
        config.httpd.enabled = true;
        config.httpd.port = port;

        let meters = vec![MeterConfig::new(MeterModel::SDM120, 101, Some("Kitchen".to_string()))];
        let runner = Runner::new(config, meters, FakeMeter::healthy());
        let store = runner.store();

        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(runner.run(shutdown));
        wait_for_reading(&store).await;

        let mut stream = None;
        for _ in 0..100 {
            if let Ok(s) = tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
                stream = Some(s);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let mut stream = stream.expect("API did not come up");
        stream
            .write_all(b"GET /api/meters HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.contains("\"slug\":\"kitchen\""));
        assert!(response.contains("\"state\":\"ok\""));

        stop.send(true).unwrap();
        let finished = tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT * 4, task).await;
        assert!(finished.expect("runner did not stop the API").unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_run_without_mqtt() {
        let meters = vec![MeterConfig::new(MeterModel::SDM630, 100, None)];
        let runner = Runner::new(config(), meters, FakeMeter::healthy());
        let store = runner.store();

        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(runner.run(shutdown));
        for _ in 0..200 {
            if store.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop.send(true).unwrap();
        task.await.unwrap().unwrap();

        assert!(store.get(100).unwrap().ok);
    }
}
