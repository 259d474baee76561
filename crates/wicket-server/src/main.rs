use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use wicket_dispatch::Dispatcher;
use wicket_gateway::Gateway;

mod config;
mod handlers;
mod logging;

use config::ServerConfig;
use handlers::{register_routes, ConnectionLog, EchoHandler};
use logging::init_logging;

/// How inbound frames are handled
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Write every frame back to its sender
    Echo,
    /// Decode JSON envelopes and dispatch them to named handlers
    Routed,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "wicket-server")]
#[command(about = "WebSocket connection gateway")]
#[command(version)]
struct Cli {
    /// Bind address (overrides config)
    #[arg(long, env = "WICKET_BIND")]
    bind: Option<String>,

    /// Inbound frame handling
    #[arg(long, value_enum, default_value = "echo")]
    mode: Mode,

    /// Config file path (JSON)
    #[arg(long, env = "WICKET_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum concurrent connections (overrides config)
    #[arg(long, env = "WICKET_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Upgrade path, e.g. /ws (overrides config)
    #[arg(long)]
    path: Option<String>,

    /// Log level (overrides config)
    #[arg(long, env = "RUST_LOG")]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

impl Cli {
    /// Apply command line overrides on top of the file configuration
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(bind) = &self.bind {
            config.gateway.bind = bind.clone();
        }
        if let Some(max) = self.max_connections {
            config.gateway.max_connections = max;
        }
        if let Some(path) = &self.path {
            config.gateway.path = Some(path.clone());
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json_logs {
            config.logging.json_format = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    cli.apply(&mut config);
    config.validate()?;

    init_logging(&config.logging)?;
    info!("Starting wicket server in {:?} mode", cli.mode);
    info!("  Bind: {}", config.gateway.bind);
    info!("  Max connections: {}", config.gateway.max_connections);
    info!("  Output buffer: {} frames", config.gateway.output_buffer_size);

    let gateway = Gateway::new(config.gateway.clone())?;
    let (gateway, dispatcher) = match cli.mode {
        Mode::Echo => (gateway.with_handler(EchoHandler), None),
        Mode::Routed => {
            let dispatcher = Arc::new(Dispatcher::new(config.dispatcher.clone())?);
            register_routes(&dispatcher, gateway.registry().clone())?;
            dispatcher.start()?;
            info!(
                "  Dispatcher: {} partitions x {} slots",
                config.dispatcher.partitions, config.dispatcher.queue_capacity
            );
            let gateway = gateway
                .with_handler(ConnectionLog)
                .with_dispatcher(Arc::clone(&dispatcher));
            (gateway, Some(dispatcher))
        }
    };

    let mut server = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.run().await })
    };

    let finished = tokio::select! {
        joined = &mut server => Some(joined),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Received Ctrl-C, shutting down");
            None
        }
    };

    let closed = gateway.shutdown();
    info!("Closing {} connections", closed);
    let grace = config.gateway.close_timeout() * 2;
    if tokio::time::timeout(grace, gateway.wait_closed()).await.is_err() {
        warn!("Connections still open after {:?}", grace);
    }

    if let Some(dispatcher) = dispatcher {
        dispatcher.stop().await?;
    }

    let joined = match finished {
        Some(joined) => joined,
        None => server.await,
    };
    joined??;

    info!("Server stopped");
    Ok(())
}
