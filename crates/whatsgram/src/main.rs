use std::{future::Future, sync::Arc};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use wg_core::{
    config::Config,
    messaging::{
        port::{AdminChannel, MessagingPort},
        throttled::{Pacing, ThrottledMessenger},
    },
    modules::{relay, RelayModule},
    orchestrator::Orchestrator,
    session_store::SessionStore,
    store::BlobStore,
};
use wg_store_http::HttpBlobStore;
use wg_telegram::TelegramChannel;
use wg_web_client::{SidecarClientFactory, SidecarConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wg_core::logging::init("whatsgram")?;

    let cfg = Arc::new(Config::load().context("loading configuration")?);

    let remote: Option<Arc<dyn BlobStore>> = match &cfg.store {
        Some(store_cfg) => Some(Arc::new(
            HttpBlobStore::new(store_cfg, cfg.store_timeout).context("remote store client")?,
        )),
        None => {
            warn!("STORE_URL not set; the session will not survive redeploys");
            None
        }
    };
    let store = Arc::new(SessionStore::new(&cfg, remote));

    // The raw channel owns the listener; outbound sends are paced per chat.
    let channel = Arc::new(TelegramChannel::from_token(&cfg.telegram_bot_token));
    let messenger: Arc<dyn MessagingPort> =
        Arc::new(ThrottledMessenger::new(channel.clone(), Pacing::default()));
    let channel: Arc<dyn AdminChannel> = channel;

    let factory = Arc::new(SidecarClientFactory::new(SidecarConfig::from_config(&cfg)));

    let orchestrator = Orchestrator::new(cfg.clone(), channel, messenger, store, factory)
        .with_module(relay::NAME, Arc::new(RelayModule::new()));

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    info!(owner = cfg.owner_id, "whatsgram starting");
    orchestrator
        .run(shutdown)
        .await
        .context("whatsgram stopped with an error")?;
    Ok(())
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                let source = first_signal(tokio::signal::ctrl_c(), async {
                    term.recv().await;
                })
                .await;
                info!("received {source}");
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("failed to listen for ctrl-c: {e}");
                }
            }
        }
    }

    #[cfg(not(unix))]
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
    }

    shutdown.cancel();
}

/// Resolves with the name of the first signal received. A ctrl-c listener
/// that errors out leaves SIGTERM as the only way to stop.
#[cfg_attr(not(unix), allow(dead_code))]
async fn first_signal(
    ctrl_c: impl Future<Output = std::io::Result<()>>,
    term: impl Future<Output = ()>,
) -> &'static str {
    let interrupt = async {
        if let Err(e) = ctrl_c.await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = interrupt => "ctrl-c",
        _ = term => "SIGTERM",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn ctrl_c_stops_the_bridge() {
        let source = first_signal(async { Ok(()) }, std::future::pending()).await;
        assert_eq!(source, "ctrl-c");
    }

    #[tokio::test(start_paused = true)]
    async fn broken_ctrl_c_listener_waits_for_sigterm() {
        let broken = async { Err(std::io::Error::other("no signal driver")) };
        let pending = first_signal(broken, std::future::pending());
        assert!(tokio::time::timeout(Duration::from_secs(60), pending)
            .await
            .is_err());

        let broken = async { Err(std::io::Error::other("no signal driver")) };
        let term = tokio::time::sleep(Duration::from_secs(1));
        assert_eq!(first_signal(broken, term).await, "SIGTERM");
    }
}
