use log::{error, info, warn};
use sdm2mqtt::{config::Config, metering_modbus::transport::SerialTransport, mqtt::MqttManager, runner::{Runner, RunnerError}};
use std::sync::Arc;
use tokio::sync::watch;

async fn wait_for_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        _ = async {
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => { sigterm.recv().await; }
                    Err(e) => {
                        warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down");
        }
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    let default_filter = std::env::var("SDM_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            error!("Unable to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let meters = match config.validate() {
        Ok(m) => m,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    for meter in meters.iter() {
        info!("Meter {} ({} at address {}) publishes as '{}'", meter.display_name, meter.model, meter.address, meter.slug);
    }

    let transport = match SerialTransport::open(&config.serial) {
        Ok(t) => t,
        Err(e) => {
            error!("{} ({})", RunnerError::from(e), config.serial.port);
            std::process::exit(1);
        }
    };

    let mut runner = Runner::new(config.clone(), meters, transport);
    if config.mqtt.enabled {
        let mqtt = Arc::new(MqttManager::new(&config.mqtt));
        let health = mqtt.health();
        runner = runner.with_publisher(mqtt, Some(health));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = runner.run(shutdown_rx).await {
        error!("{}", e);
        std::process::exit(1);
    }
    Ok(())
}
