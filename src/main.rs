use std::sync::Arc;

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tylohelo_bridge::{
    BusMessage, Gateway, GatewayConfig, GatewayInputs, Result, TracingPublisher, UdpTransport,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("TylöHelo bridge {}", tylohelo_bridge::VERSION);
    let config = GatewayConfig::from_env()?;
    let transport = UdpTransport::bind(&config).await?;
    let (unicast, broadcast, _receive_tasks) = transport.spawn_receivers().split();

    // Without a broker client, commands are read from stdin as "<topic> <payload>"
    let (command_tx, commands) = mpsc::channel(16);
    tokio::spawn(read_commands(command_tx));

    let gateway = Gateway::new(config, Arc::new(transport), Arc::new(TracingPublisher));
    let result = gateway
        .run(
            GatewayInputs {
                unicast,
                broadcast,
                commands,
            },
            async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            },
        )
        .await;

    if let Err(e) = &result {
        error!("Bridge stopped: {}", e);
    }
    result
}

async fn read_commands(sender: mpsc::Sender<BusMessage>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let (topic, payload) = line.split_once(' ').unwrap_or((line, ""));
                let message = BusMessage {
                    topic: topic.to_string(),
                    payload: payload.to_string(),
                    retain: false,
                };
                if sender.send(message).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read command: {}", e);
                break;
            }
        }
    }
}
