use meter2mqtt::{Config, Heartbeat, MqttTelemetry, Publisher, RtuBus, Scheduler};
use std::process::ExitCode;
use log::{error, info};


#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    let default_filter = std::env::var("M2M_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let bus = match RtuBus::open(&config.serial) {
        Ok(b) => b,
        Err(e) => {
            error!("Unable to open serial port {}: {}", config.serial.port, e);
            return ExitCode::FAILURE;
        }
    };

    let telemetry = MqttTelemetry::connect(&config.mqtt);
    let publisher = Publisher::new(telemetry, config.mqtt.topic.clone(), Heartbeat::new(config.heartbeat.path.clone()));
    let scheduler = Scheduler::from_config(&config, bus, publisher);

    info!("Polling meters {:?} every {}s", config.meters, config.timing.poll_interval_secs);
    scheduler.run(shutdown_signal()).await;

    info!("Stopped");
    return ExitCode::SUCCESS;
}

/* Ctrl-C everywhere, SIGTERM where there is one */
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => { s.recv().await; },
            Err(e) => {
                error!("Unable to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
