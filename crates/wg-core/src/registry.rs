//! Module Registry: a name-keyed table of feature units.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::{
    chat::ClientHandle,
    config::Config,
    errors::Error,
    messaging::{port::MessagingPort, types::OperatorCommand},
    Result,
};

/// Which optional hooks a module implements. The registry only calls a hook
/// whose flag is set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModuleHooks {
    pub init: bool,
    pub cleanup: bool,
}

impl ModuleHooks {
    pub const NONE: Self = Self {
        init: false,
        cleanup: false,
    };
    pub const ALL: Self = Self {
        init: true,
        cleanup: true,
    };
}

/// A feature unit. Both hooks default to no-ops.
#[async_trait]
pub trait Module: Send + Sync {
    fn hooks(&self) -> ModuleHooks {
        ModuleHooks::NONE
    }

    /// Called exactly once, at registration.
    async fn init(&self, _ctx: &ModuleContext) -> Result<()> {
        Ok(())
    }

    /// Called exactly once, at unregistration.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Shared state injected into every module at registration.
#[derive(Clone)]
pub struct ModuleContext {
    pub admin: Arc<dyn MessagingPort>,
    pub client: ClientHandle,
    pub cfg: Arc<Config>,
    commands: broadcast::Sender<OperatorCommand>,
}

impl ModuleContext {
    pub fn new(
        admin: Arc<dyn MessagingPort>,
        client: ClientHandle,
        cfg: Arc<Config>,
        commands: broadcast::Sender<OperatorCommand>,
    ) -> Self {
        Self {
            admin,
            client,
            cfg,
            commands,
        }
    }

    /// Operator commands forwarded by the Orchestrator from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OperatorCommand> {
        self.commands.subscribe()
    }
}

struct ModuleRecord {
    name: String,
    module: Arc<dyn Module>,
}

#[derive(Default)]
pub struct ModuleRegistry {
    modules: Mutex<Vec<ModuleRecord>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module and run its `init` hook.
    ///
    /// All-or-nothing: a duplicate name or a failing `init` leaves the table
    /// unchanged and is returned to the caller.
    pub async fn register(
        &self,
        name: &str,
        module: Arc<dyn Module>,
        ctx: &ModuleContext,
    ) -> Result<()> {
        let mut modules = self.modules.lock().await;
        if modules.iter().any(|m| m.name == name) {
            return Err(Error::Module {
                name: name.to_string(),
                reason: "already registered".to_string(),
            });
        }

        if module.hooks().init {
            module.init(ctx).await.map_err(|e| Error::Module {
                name: name.to_string(),
                reason: format!("init failed: {e}"),
            })?;
        }

        modules.push(ModuleRecord {
            name: name.to_string(),
            module,
        });
        info!(module = name, "module loaded");
        Ok(())
    }

    pub async fn lookup(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules
            .lock()
            .await
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.module.clone())
    }

    /// Registered names, in registration order.
    pub async fn list(&self) -> Vec<String> {
        self.modules
            .lock()
            .await
            .iter()
            .map(|m| m.name.clone())
            .collect()
    }

    /// Remove a module, running its `cleanup` hook.
    ///
    /// A failing `cleanup` is logged; the module is removed regardless.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let record = {
            let mut modules = self.modules.lock().await;
            let Some(idx) = modules.iter().position(|m| m.name == name) else {
                return Err(Error::Module {
                    name: name.to_string(),
                    reason: "not registered".to_string(),
                });
            };
            modules.remove(idx)
        };

        run_cleanup(&record).await;
        info!(module = name, "module unloaded");
        Ok(())
    }

    /// Unload everything, most recently registered first.
    pub async fn unregister_all(&self) {
        let records = std::mem::take(&mut *self.modules.lock().await);
        for record in records.iter().rev() {
            run_cleanup(record).await;
        }
    }
}

async fn run_cleanup(record: &ModuleRecord) {
    if !record.module.hooks().cleanup {
        return;
    }
    if let Err(e) = record.module.cleanup().await {
        warn!(module = %record.name, "cleanup failed: {e}");
    }
}
