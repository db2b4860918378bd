#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use conflux_server::config::{Args, ServerConfig};
use conflux_server::{DefaultHooks, Server};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config: ServerConfig = args.into();
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let server = Server::bind(config, Arc::new(DefaultHooks)).await?;
    let handle = server.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            handle.shutdown();
        }
    });

    server.run().await?;
    info!("server stopped");
    Ok(())
}
