use clap::Parser;
use fluxq::{BrokerConfig, BrokerServer, Result, StoreType};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "fluxq")]
#[command(about = "An AMQP 0-9-1 message broker written in Rust")]
struct Args {
    /// Configuration file (TOML, JSON or YAML); FLUXQ_* variables apply on top
    #[arg(short, long)]
    config: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[arg(long)]
    data_dir: Option<String>,

    /// Message store: memory or journal
    #[arg(long)]
    store: Option<StoreType>,

    /// Virtual hosts to create (comma-separated list)
    #[arg(long)]
    virtual_hosts: Option<String>,

    /// Deliveries before a message is dead-lettered (0 disables)
    #[arg(long)]
    max_delivery_count: Option<u32>,

    /// Enable ACL authorization
    #[arg(long)]
    enable_acl: bool,

    /// ACL configuration file path (JSON format)
    #[arg(long)]
    acl_config: Option<String>,

    /// Allow everyone access when no ACL matches
    #[arg(long)]
    acl_allow_everyone: bool,

    /// Super users (comma-separated list)
    #[arg(long)]
    super_users: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    let config = match build_config(args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e);
        }
    };

    info!("Starting FluxQ broker on {}:{}", config.host, config.port);
    info!("Virtual hosts: {}", config.virtual_hosts.join(", "));
    info!("Message store: {}", config.store_type);
    if config.store_type == StoreType::Journal {
        info!("Data directory: {}", config.data_dir);
    }
    info!("ACL enabled: {}", config.enable_acl);

    let server = Arc::new(BrokerServer::new(config).await?);

    // Spawn the server task
    let server_task = Arc::clone(&server);
    let mut server_handle = tokio::spawn(async move {
        if let Err(e) = server_task.run().await {
            error!("Server error: {}", e);
        }
    });

    // Set up signal handlers
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            server.shutdown();
            let _ = (&mut server_handle).await;
        }
        _ = &mut server_handle => {
            info!("Server task completed");
        }
    }

    info!("FluxQ shut down successfully");
    Ok(())
}

fn build_config(args: Args) -> Result<BrokerConfig> {
    let mut config = match args.config {
        Some(ref path) => BrokerConfig::from_file(path)?,
        None => BrokerConfig::from_env()?,
    };

    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(store) = args.store {
        config.store_type = store;
    }
    if let Some(virtual_hosts) = args.virtual_hosts {
        config.virtual_hosts = split_list(&virtual_hosts);
    }
    if let Some(count) = args.max_delivery_count {
        config.default_max_delivery_count = count;
    }
    if args.enable_acl {
        config.enable_acl = true;
        config.allow_everyone = args.acl_allow_everyone;
        config.acl_config_file = args.acl_config;
    }
    if let Some(super_users) = args.super_users {
        config.super_users = split_list(&super_users);
    }

    config.validate().map_err(fluxq::FluxqError::Config)?;
    Ok(config)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            warn!("Invalid log level '{}', defaulting to 'info'", level);
            tracing::Level::INFO
        }
    }
}
