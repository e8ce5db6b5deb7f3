use std::net::SocketAddr;

use eyre::WrapErr;
use loadstorm_allocator::{spawn, AllocatorConfig};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let start_index = match std::env::var("INDEX_ALLOCATOR_START") {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .wrap_err_with(|| format!("invalid INDEX_ALLOCATOR_START: {raw} (expected integer >= 0)"))?,
        Err(_) => 0,
    };

    let listen_addr: SocketAddr = std::env::var("LISTEN_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:0".to_string())
        .parse()
        .wrap_err("LISTEN_ADDR must be a valid socket address")?;

    let handle = spawn(AllocatorConfig {
        start_index,
        listen_addr,
    })
    .await?;

    println!("Index allocator running on {}", handle.url());

    tokio::signal::ctrl_c().await?;
    tracing::info!("received shutdown signal");
    handle.shutdown().await?;

    Ok(())
}
