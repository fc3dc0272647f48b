// p2pnet node daemon: join a rendezvous group, bootstrap, and serve until signalled.

use anyhow::Context;
use p2pnet_node::{config, Network};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("p2pnet-node {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load().context("loading configuration")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let network = Network::new(cfg).await.context("starting node")?;
        println!("peer id: {}", network.peer_id());
        for addr in network.addrs() {
            println!("listening on {}", addr);
        }

        tokio::select! {
            _ = network.wait_for_bootstrap() => {
                tracing::info!(state = ?network.bootstrap_state(), "bootstrap complete");
                shutdown_signal().await?;
            }
            r = shutdown_signal() => r?,
        }
        network.close().await;
        Ok::<(), anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
