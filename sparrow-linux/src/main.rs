// Sparrow daemon: join a hub, serve active mode, log what happens.

use anyhow::Context;
use log::{error, info, warn};
use sparrow::{Client, ClientEvent};
use sparrow_core::escape::unescape;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut hub_arg = None;
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("sparrow {}", VERSION);
            return Ok(());
        }
        hub_arg = Some(arg);
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut cfg = sparrow::config::load();
    if hub_arg.is_some() {
        cfg.hub_address = hub_arg;
    }
    let hub_address = cfg
        .hub_address
        .clone()
        .context("no hub address: pass one as an argument or set SPARROW_HUB")?;

    let client = Client::new(cfg);
    let mut events = client.events();
    match client.start_active_mode().await {
        Ok(ep) => info!("accepting peers on {}", ep.tcp_addr()),
        Err(e) => warn!("active mode unavailable, running passive: {}", e),
    }

    let mut chat = client.subscribe_hub(Some(sparrow::Filter::prefix("<")))?;
    client
        .connect_to_hub(&hub_address)
        .await
        .with_context(|| format!("joining {}", hub_address))?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                info!("shutting down");
                break;
            }
            Some(msg) = chat.recv() => {
                if let Some(line) = msg.as_line() {
                    info!("{}", unescape(line.trim_end_matches('|')));
                }
            }
            ev = events.recv() => match ev {
                Ok(ClientEvent::HubLost { reason }) => {
                    error!("lost hub: {}", reason);
                    break;
                }
                Ok(ev) => info!("{:?}", ev),
                Err(e) => warn!("event stream: {}", e),
            },
        }
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
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
