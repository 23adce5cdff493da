//! link-daemon: runs a protocol core, or connects to one as a client.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use link_daemon::{
    ClientSession, Config, CoreServer, Credentials, HandshakeStatus, LoggingSyncHandler,
    TcpConnector, TransportSetting, WebSocketConnector, connect,
};

#[derive(Parser, Debug)]
#[command(name = "link-daemon")]
#[command(about = "Client-core synchronization protocol daemon")]
struct Args {
    /// Path to the JSON config file (created with defaults if missing)
    #[arg(short, long, env = "LINK_CONFIG", default_value = "link.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a core and accept clients
    Serve {
        /// Address to listen on (overrides the config)
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Connect to a core and log in
    Connect {
        /// Core address (overrides the config)
        address: Option<String>,

        #[arg(short, long)]
        user: Option<String>,

        #[arg(long, env = "LINK_PASSWORD")]
        password: Option<String>,

        /// Configure the core with this backend if it is not set up yet
        #[arg(long)]
        setup_backend: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,link_daemon=debug"
    } else {
        "info,link_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&args.config)?;

    match args.command {
        Command::Serve { listen } => serve(config, listen).await,
        Command::Connect {
            address,
            user,
            password,
            setup_backend,
        } => {
            let address = address.unwrap_or_else(|| config.client.address.clone());
            let mut credentials = Credentials::new(
                user.unwrap_or_else(|| config.client.user.clone()),
                password.unwrap_or_else(|| config.client.password.clone()),
            );
            credentials.setup_backend = setup_backend.or_else(|| config.client.setup_backend.clone());
            run_client(config, &address, credentials).await
        }
    }
}

async fn serve(config: Config, listen: Option<String>) -> Result<()> {
    let listen = listen.unwrap_or_else(|| config.listen.clone());
    info!(
        "Starting link-daemon core {} (built {})",
        config.core.version, config.core.build_date
    );
    info!("Listen address: {}", listen);
    info!("Transport: {:?}, features: {}", config.transport, config.features());
    if config.users.is_empty() {
        warn!("No users configured; the first client must run setup");
    }

    let server = CoreServer::new(&config, Arc::new(LoggingSyncHandler::new()));
    let listener = CoreServer::bind(&listen).await?;

    tokio::select! {
        result = server.serve(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    }
}

async fn run_client(config: Config, address: &str, credentials: Credentials) -> Result<()> {
    let sync = Arc::new(LoggingSyncHandler::new());
    let features = config.features();
    let heartbeat = config.heartbeat_config();

    let mut session: ClientSession = match config.transport {
        TransportSetting::Websocket => {
            connect(&WebSocketConnector, address, credentials, features, sync, heartbeat).await?
        }
        TransportSetting::Tcp => {
            connect(&TcpConnector, address, credentials, features, sync, heartbeat).await?
        }
    };

    match session.wait_for_handshake().await {
        HandshakeStatus::Established(_) => info!("Logged in to {}", address),
        other => {
            session.handle.close();
            bail!("Handshake with {} did not complete: {:?}", address, other);
        }
    }

    tokio::select! {
        outcome = &mut session.task => {
            info!("Connection ended: {:?}", outcome?);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            session.handle.close();
            let _ = session.task.await;
        }
    }
    Ok(())
}
