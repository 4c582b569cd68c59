//! `relay`: forwards `/send <recipient> <text>` from the operator to the chat client.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    chat::ClientHandle,
    messaging::{
        port::MessagingPort,
        types::{AdminCommand, OperatorCommand},
    },
    registry::{Module, ModuleContext, ModuleHooks},
    Result,
};

pub const NAME: &str = "relay";

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct RelayModule {
    worker: Mutex<Option<Worker>>,
}

impl RelayModule {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Module for RelayModule {
    fn hooks(&self) -> ModuleHooks {
        ModuleHooks::ALL
    }

    async fn init(&self, ctx: &ModuleContext) -> Result<()> {
        let mut worker = self.worker.lock().await;
        if let Some(old) = worker.take() {
            old.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(relay_loop(
            ctx.subscribe(),
            ctx.client.clone(),
            ctx.admin.clone(),
            cancel.clone(),
        ));
        *worker = Some(Worker { cancel, handle });
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let Some(worker) = self.worker.lock().await.take() else {
            return Ok(());
        };
        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            warn!("relay task ended abnormally: {e}");
        }
        Ok(())
    }
}

async fn relay_loop(
    mut commands: broadcast::Receiver<OperatorCommand>,
    client: ClientHandle,
    admin: Arc<dyn MessagingPort>,
    cancel: CancellationToken,
) {
    loop {
        let cmd = tokio::select! {
            _ = cancel.cancelled() => break,
            res = commands.recv() => match res {
                Ok(cmd) => cmd,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "relay fell behind; commands dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        if let AdminCommand::Send { to, text } = cmd.command {
            let reply = forward(&client, &to, &text).await;
            if let Err(e) = admin.send_text(cmd.chat_id, &reply).await {
                warn!("failed to report relay outcome: {e}");
            }
        }
    }
    debug!("relay stopped");
}

async fn forward(client: &ClientHandle, to: &str, text: &str) -> String {
    let current = client.current().filter(|_| client.is_ready());
    let Some(current) = current else {
        return "⚠️ WhatsApp is not connected yet.".to_string();
    };
    match current.send_text(to, text).await {
        Ok(()) => {
            info!(to, "message relayed");
            format!("✅ Sent to {to}")
        }
        Err(e) => format!("❌ Failed to send: {e}"),
    }
}
