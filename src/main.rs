use chrono::Local;
use color_eyre::{eyre::eyre, Result};
use nodelink::config::NodeConfig;
use nodelink::link::glue::{ConnectivityGlue, GlueSettings};
use nodelink::link::runtime::{Configured, GlueHandle, NodeLink};
use nodelink::link::timer::TokioRetryTimer;
use nodelink::link::{wifi, LinkError};
use nodelink::mqtt::command::{DeviceCommand, JsonCommandDecoder};
use nodelink::mqtt::mqtt_handler::BrokerSession;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = NodeConfig::default_path();
    let created = NodeConfig::ensure_default_config(&config_path).await?;
    let config = NodeConfig::load(&config_path).await?;
    setup_logging(&config)?;

    if created {
        warn!("No configuration found, wrote defaults to {}", config_path.display());
    }
    info!("Loaded configuration from {}", config_path.display());

    info!(
        "Node {} starting, broker {}:{}",
        config.node.id, config.broker.host, config.broker.port
    );

    // Every collaborator reports into this one channel
    let (event_tx, event_rx) = mpsc::channel(256);
    let (command_tx, command_rx) = mpsc::channel(32);

    let session = BrokerSession::spawn(&config.broker, &config.client_id(), event_tx.clone());
    let retry_timer = TokioRetryTimer::new(event_tx.clone());
    let link = wifi::spawn_link(&config.wifi, event_tx);
    let decoder = JsonCommandDecoder::new(command_tx);

    let glue = ConnectivityGlue::new(
        session,
        link,
        retry_timer,
        decoder,
        config.topics(),
        GlueSettings::from_config(&config)?,
    );

    let (node_link, handle) = NodeLink::<Configured>::create(glue, event_rx, 32);
    let runtime = tokio::spawn(node_link.start().run());

    let _commands = tokio::spawn(apply_commands(command_rx, handle.clone()));
    if config.status.interval_secs > 0 {
        let _heartbeat = tokio::spawn(publish_heartbeat(
            handle.clone(),
            config.node.id,
            Duration::from_secs(config.status.interval_secs),
        ));
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
    info!("Ctrl-C received");

    if let Err(e) = handle.shutdown().await {
        warn!("Runtime already stopped: {}", e);
    }
    runtime
        .await
        .map_err(|e| eyre!("Link runtime panicked: {}", e))?;

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

/// `RUST_LOG` defaults to the configured level and wins when it names one
fn setup_logging(config: &NodeConfig) -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", &config.log_level)
    }
    let level = match std::env::var("RUST_LOG")?.parse::<Level>() {
        Ok(level) => level,
        Err(_) => config.log_level()?,
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
    Ok(())
}

/// Logs decoded commands and acknowledges them on the debug topic
async fn apply_commands(mut commands: mpsc::Receiver<DeviceCommand>, handle: GlueHandle) {
    while let Some(command) = commands.recv().await {
        let keys: Vec<&str> = command.fields.keys().map(String::as_str).collect();
        info!("Applying command from {} with keys {:?}", command.topic, keys);

        let ack = serde_json::json!({
            "ack": keys,
            "ts": Local::now().to_rfc3339(),
        });
        match handle.publish_debug(ack.to_string()).await {
            Ok(pkid) => debug!("Command ack sent, packetId: {}", pkid),
            Err(e) => warn!("Command ack not sent: {}", e),
        }
    }
    debug!("Command channel closed");
}

async fn publish_heartbeat(handle: GlueHandle, node_id: u8, period: Duration) {
    let started = Instant::now();
    // first beat after one period
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        ticker.tick().await;
        let status = serde_json::json!({
            "node": node_id,
            "uptime_s": started.elapsed().as_secs(),
            "ts": Local::now().to_rfc3339(),
        });

        match handle.publish_status(status.to_string()).await {
            Ok(pkid) => debug!("Status published, packetId: {}", pkid),
            Err(LinkError::ChannelError(e)) => {
                error!("Link runtime gone, stopping heartbeat: {}", e);
                break;
            }
            Err(e) => warn!("Status not published: {}", e),
        }
    }
}
