use clap::{Parser, ValueEnum};
use gigpay_core::StorageConfig;
use gigpay_service::{build_router, GatewayConfig, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum GatewayMode {
    Mock,
    Http,
}

#[derive(Debug, Parser)]
#[command(name = "gigpayd", version, about = "GigPay escrow REST service")]
struct Cli {
    /// Socket address to bind, e.g. 127.0.0.1:8094
    #[arg(long, default_value = "127.0.0.1:8094")]
    listen: SocketAddr,
    /// Storage backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "GIGPAY_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for escrow state persistence.
    #[arg(long, env = "GIGPAY_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "GIGPAY_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Payment gateway backend.
    #[arg(long, value_enum, default_value_t = GatewayMode::Mock, env = "GIGPAY_GATEWAY")]
    gateway: GatewayMode,
    /// Base URL of the external payment processor (http gateway only).
    #[arg(long, env = "GIGPAY_GATEWAY_URL")]
    gateway_url: Option<String>,
    /// API key id shared with the payment processor.
    #[arg(long, default_value = "gigpay-local", env = "GIGPAY_GATEWAY_KEY_ID")]
    gateway_key_id: String,
    /// Signing secret shared with the payment processor.
    #[arg(long, default_value = "gigpay-local-dev-secret", env = "GIGPAY_GATEWAY_SECRET")]
    gateway_secret: String,
    /// Gateway request timeout in milliseconds.
    #[arg(long, default_value_t = 5_000, env = "GIGPAY_GATEWAY_TIMEOUT_MS")]
    gateway_timeout_ms: u64,
    /// Users allowed to resolve disputes. Repeatable.
    #[arg(long = "arbiter", env = "GIGPAY_ARBITERS", value_delimiter = ',')]
    arbiters: Vec<String>,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => {
            if let Some(database_url) = resolved_url {
                StorageConfig::postgres(database_url, cli.pg_max_connections)
            } else {
                StorageConfig::Memory
            }
        }
    };

    Ok(storage)
}

fn resolve_gateway(cli: &Cli) -> anyhow::Result<GatewayConfig> {
    match cli.gateway {
        GatewayMode::Mock => Ok(GatewayConfig::Mock {
            secret: cli.gateway_secret.clone(),
        }),
        GatewayMode::Http => {
            let base_url = cli.gateway_url.clone().ok_or_else(|| {
                anyhow::anyhow!("gateway=http requires --gateway-url or GIGPAY_GATEWAY_URL")
            })?;
            Ok(GatewayConfig::Http {
                base_url,
                key_id: cli.gateway_key_id.clone(),
                key_secret: cli.gateway_secret.clone(),
                timeout: Duration::from_millis(cli.gateway_timeout_ms),
            })
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "gigpay_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig {
        storage: resolve_storage(&cli)?,
        gateway: resolve_gateway(&cli)?,
        arbiters: cli.arbiters.clone(),
    };
    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("gigpay-service listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
