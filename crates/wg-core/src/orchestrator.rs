//! Orchestrator: boots the admin channel, the Connection Supervisor and the
//! modules, in that order, then drives the event loop until shutdown.

use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::{
    sync::{broadcast, mpsc},
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    chat::{ChatClientFactory, ClientEnvelope},
    config::Config,
    domain::{ChatId, UserId},
    messaging::{
        port::{AdminChannel, MessagingPort},
        types::{AdminCommand, IncomingCommand, OperatorCommand},
    },
    registry::{Module, ModuleContext, ModuleRegistry},
    session_store::SessionStore,
    supervisor::{ConnectionState, ConnectionSupervisor},
    Result,
};

const COMMAND_FANOUT: usize = 64;

const USAGE: &str = "Available commands:\n\
/start - Start bot\n\
/restart - Restart WhatsApp client\n\
/send <number> <text> - Send message to WhatsApp";

pub struct Orchestrator {
    cfg: Arc<Config>,
    channel: Arc<dyn AdminChannel>,
    messenger: Arc<dyn MessagingPort>,
    supervisor: ConnectionSupervisor,
    registry: ModuleRegistry,
    pending: Vec<(String, Arc<dyn Module>)>,
    commands_tx: broadcast::Sender<OperatorCommand>,
    incoming_tx: mpsc::UnboundedSender<IncomingCommand>,
    incoming_rx: mpsc::UnboundedReceiver<IncomingCommand>,
    started_at: DateTime<Local>,
}

impl Orchestrator {
    /// `channel` is the raw admin channel (listener lifecycle); `messenger`
    /// is the outbound side everything else sends through, usually a
    /// throttled wrapper around the same channel.
    pub fn new(
        cfg: Arc<Config>,
        channel: Arc<dyn AdminChannel>,
        messenger: Arc<dyn MessagingPort>,
        store: Arc<SessionStore>,
        factory: Arc<dyn ChatClientFactory>,
    ) -> Self {
        let supervisor =
            ConnectionSupervisor::new(cfg.clone(), store, factory, messenger.clone());
        let (commands_tx, _) = broadcast::channel(COMMAND_FANOUT);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            cfg,
            channel,
            messenger,
            supervisor,
            registry: ModuleRegistry::new(),
            pending: Vec::new(),
            commands_tx,
            incoming_tx,
            incoming_rx,
            started_at: Local::now(),
        }
    }

    /// Queue a module for registration during [`Self::start`].
    pub fn with_module(mut self, name: &str, module: Arc<dyn Module>) -> Self {
        self.pending.push((name.to_string(), module));
        self
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    /// Startup sequence. Only a dead admin channel is fatal; a failed restore
    /// or client start and rejected modules are logged and startup goes on.
    pub async fn start(&mut self) -> Result<()> {
        self.channel.start(self.incoming_tx.clone()).await?;
        info!("admin channel listening");

        if let Err(e) = self.supervisor.start().await {
            warn!("continuing without a chat client: {e}");
        }

        let ctx = ModuleContext::new(
            self.messenger.clone(),
            self.supervisor.handle(),
            self.cfg.clone(),
            self.commands_tx.clone(),
        );
        for (name, module) in std::mem::take(&mut self.pending) {
            if let Err(e) = self.registry.register(&name, module, &ctx).await {
                error!(module = %name, "failed to load module: {e}");
            }
        }
        info!(modules = ?self.registry.list().await, "startup complete");
        Ok(())
    }

    /// Run until `shutdown` fires, then tear down.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.start().await?;

        let mut auto_restart = self.cfg.auto_restart.map(|period| {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                Some(env) = self.supervisor.next_event() => {
                    self.on_client_event(env).await;
                }
                Some(cmd) = self.incoming_rx.recv() => {
                    self.handle_command(cmd).await;
                }
                _ = next_tick(&mut auto_restart) => {
                    self.scheduled_restart().await;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Process everything already queued without waiting for more.
    pub async fn drain(&mut self) {
        loop {
            if let Some(env) = self.supervisor.try_next_event() {
                self.on_client_event(env).await;
                continue;
            }
            match self.incoming_rx.try_recv() {
                Ok(cmd) => self.handle_command(cmd).await,
                Err(_) => break,
            }
        }
    }

    /// Periodic refresh of a working client. A failed authentication still
    /// waits for the owner's `/restart`.
    async fn scheduled_restart(&mut self) {
        if self.supervisor.state() == ConnectionState::Failed {
            debug!("authentication failed; skipping scheduled restart");
            return;
        }
        info!("scheduled restart of chat client");
        self.reply(
            ChatId(self.cfg.owner_id),
            "🔄 Scheduled restart of WhatsApp client...",
        )
        .await;
        if let Err(e) = self.supervisor.restart().await {
            warn!("scheduled restart failed: {e}");
        }
    }

    async fn on_client_event(&mut self, env: ClientEnvelope) {
        let state = self.supervisor.handle_event(env).await;
        debug!(?state, "connection state");
    }

    pub async fn handle_command(&mut self, cmd: IncomingCommand) {
        if cmd.user_id != UserId(self.cfg.owner_id) {
            warn!(
                user_id = cmd.user_id.0,
                username = cmd.username.as_deref().unwrap_or("?"),
                command = %cmd.name,
                "unauthorized command ignored"
            );
            return;
        }

        let Some(command) = AdminCommand::parse(&cmd.name, &cmd.args) else {
            self.reply(cmd.chat_id, USAGE).await;
            return;
        };
        info!(command = %cmd.name, "operator command");

        match command {
            AdminCommand::Start => {
                let text = self.status_text().await;
                self.reply(cmd.chat_id, &text).await;
            }
            AdminCommand::Restart => {
                self.reply(cmd.chat_id, "🔄 Restarting WhatsApp client...")
                    .await;
                // The supervisor tells the owner when the new client fails.
                if let Err(e) = self.supervisor.restart().await {
                    warn!("restart failed: {e}");
                }
            }
            command @ AdminCommand::Send { .. } => {
                let forwarded = OperatorCommand {
                    chat_id: cmd.chat_id,
                    command,
                };
                if self.commands_tx.send(forwarded).is_err() {
                    self.reply(cmd.chat_id, "⚠️ No module handles /send.").await;
                }
            }
        }
    }

    async fn status_text(&self) -> String {
        let state = self.supervisor.state();
        let icon = match state {
            ConnectionState::Ready => "🟢",
            ConnectionState::Failed | ConnectionState::Unavailable => "🔴",
            _ => "🟡",
        };
        let modules = self.registry.list().await;
        let modules = if modules.is_empty() {
            "none".to_string()
        } else {
            modules.join(", ")
        };
        let auto_restart = match self.cfg.auto_restart {
            Some(period) => format!("every {}h", period.as_secs() / 3600),
            None => "off".to_string(),
        };
        format!(
            "🤖 WhatsGram is running.\n\n{icon} WhatsApp: {}\n📦 Modules: {modules}\n🕒 Up since: {}\n⏱ Auto restart: {auto_restart}\n\n{USAGE}",
            state.describe(),
            self.started_at.format("%Y-%m-%d %H:%M"),
        )
    }

    async fn reply(&self, chat_id: ChatId, text: &str) {
        if let Err(e) = self.messenger.send_text(chat_id, text).await {
            warn!("failed to reply to operator: {e}");
        }
    }

    /// Destroy the client, stop the channel, unload modules. No session save.
    pub async fn shutdown(&mut self) {
        self.supervisor.shutdown().await;
        if let Err(e) = self.channel.stop().await {
            warn!("failed to stop admin channel: {e}");
        }
        self.registry.unregister_all().await;
        info!("shutdown complete");
    }
}

/// Resolves on the next tick, or never when the timer is off.
async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
