//! AMQP CGI Bridge - daemon entry point
//! Consumes AMQP queues and hands every message to a FastCGI application

mod logging;
mod settings;

use amqp_bridge_core::application::Consumer;
use amqp_bridge_infra_amqp::AmqpBroker;
use anyhow::{bail, Context, Result};
use clap::Parser;
use logging::LogFormat;
use settings::BridgeConfig;
use std::sync::Arc;
use tracing::{info, warn};

const APP_NAME: &str = "amqp-cgi-bridge";
const VERSION: &str = env!("CARGO_PKG_VERSION");
const COMMIT: &str = env!("BRIDGE_COMMIT");
const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (commit ",
    env!("BRIDGE_COMMIT"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = APP_NAME, version = LONG_VERSION, about = "Consume AMQP queues and forward messages to FastCGI", long_about = None)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "BRIDGE_CONFIG", default_value = settings::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log format
    #[arg(long = "log", env = "BRIDGE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Logging
    logging::init(cli.log_format)?;
    info!(app = APP_NAME, version = VERSION, commit = COMMIT, "Starting");

    // 2. Configuration
    let config = BridgeConfig::load(&cli.config)?;
    let consumer_config = config.consumer_config()?;
    info!(
        config = %cli.config,
        queues = consumer_config.queues().len(),
        shutdown_timeout = ?config.shutdown_timeout,
        "Configuration loaded"
    );

    // 3. Broker
    let broker = AmqpBroker::connect(config.amqp_url.clone())
        .await
        .context("failed to connect to AMQP broker")?;

    // 4. Consume
    let consumer = Consumer::start(Arc::new(broker), consumer_config).await?;
    if consumer.is_empty() {
        consumer.stop().await;
        bail!("none of the configured queues could be consumed");
    }
    info!(queues = ?consumer.queues(), "Ready");

    // 5. Wait for a termination signal
    let signal = shutdown_signal().await?;
    info!(signal, "Signal received, stopping");

    // 6. Graceful shutdown
    let report = consumer.stop().await;
    if !report.is_clean() {
        warn!(abandoned = ?report.abandoned, "Some queues did not drain before the deadline");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for SIGINT")?;
                Ok("SIGINT")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
        Ok("ctrl-c")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_defaults_and_flags() {
        let cli = Cli::try_parse_from([APP_NAME]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);

        let cli = Cli::try_parse_from([APP_NAME, "-c", "/etc/bridge.yml", "--log", "json"]).unwrap();
        assert_eq!(cli.config, "/etc/bridge.yml");
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn test_version_includes_commit() {
        let version = Cli::command().render_version();
        assert!(version.contains(VERSION));
        assert!(version.contains(&format!("commit {}", COMMIT)));
    }

    #[test]
    fn test_cli_rejects_unknown_log_format() {
        assert!(Cli::try_parse_from([APP_NAME, "--log", "xml"]).is_err());
    }
}
