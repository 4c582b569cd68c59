//! Connection Supervisor: owns the authenticated chat client and turns its
//! lifecycle events into Session Store operations and operator notices.
//!
//! ```text
//! Uninitialized --restore, construct--> (client events)
//!   HandshakeNeeded -> AwaitingChallenge   (QR to admin + console)
//!   Ready           -> Ready               (flag, save, drop QR, notify)
//!   AuthFailure     -> Failed              (invalidate; terminal for this instance)
//! construct/initialize error -> Unavailable (owner told to /restart)
//! ```
//!
//! Events come through one channel tagged with the client generation; events
//! from an instance that has since been replaced are dropped.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    chat::{ChatClient, ChatClientFactory, ClientEnvelope, ClientEvent, ClientHandle, EventSink},
    config::{Config, SavePolicy},
    domain::ChatId,
    handshake::{render_png, render_terminal, HANDSHAKE_CAPTION},
    messaging::port::MessagingPort,
    session_store::{RestoreOutcome, RestoreSource, SessionStore},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    AwaitingChallenge,
    Ready,
    Failed,
    /// The client could not be constructed or initialized.
    Unavailable,
}

impl ConnectionState {
    pub fn describe(self) -> &'static str {
        match self {
            ConnectionState::Uninitialized => "starting",
            ConnectionState::AwaitingChallenge => "waiting for QR scan",
            ConnectionState::Ready => "connected",
            ConnectionState::Failed => "authentication failed",
            ConnectionState::Unavailable => "client failed to start",
        }
    }
}

pub struct ConnectionSupervisor {
    cfg: Arc<Config>,
    store: Arc<SessionStore>,
    factory: Arc<dyn ChatClientFactory>,
    admin: Arc<dyn MessagingPort>,

    state: ConnectionState,
    generation: u64,
    handshake_seen: bool,
    last_restore: Option<RestoreOutcome>,

    events_tx: mpsc::UnboundedSender<ClientEnvelope>,
    events_rx: mpsc::UnboundedReceiver<ClientEnvelope>,
    client_tx: watch::Sender<Option<Arc<dyn ChatClient>>>,
    ready_tx: watch::Sender<bool>,
}

impl ConnectionSupervisor {
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<SessionStore>,
        factory: Arc<dyn ChatClientFactory>,
        admin: Arc<dyn MessagingPort>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (client_tx, _) = watch::channel(None);
        let (ready_tx, _) = watch::channel(false);
        Self {
            cfg,
            store,
            factory,
            admin,
            state: ConnectionState::Uninitialized,
            generation: 0,
            handshake_seen: false,
            last_restore: None,
            events_tx,
            events_rx,
            client_tx,
            ready_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_restore(&self) -> Option<RestoreOutcome> {
        self.last_restore
    }

    /// Read-only accessor for modules: current client and readiness.
    pub fn handle(&self) -> ClientHandle {
        ClientHandle::new(self.client_tx.subscribe(), self.ready_tx.subscribe())
    }

    /// Restore the session, then construct and initialize a client.
    ///
    /// The restore is awaited in full, so the client never reads a session
    /// directory that is still being extracted.
    pub async fn start(&mut self) -> Result<RestoreOutcome> {
        let outcome = self.store.restore().await;
        self.last_restore = Some(outcome);
        match outcome {
            RestoreOutcome::Found(RestoreSource::Remote) => {
                info!("session restored; starting client")
            }
            RestoreOutcome::Found(RestoreSource::Local) => {
                info!("starting client with local session")
            }
            RestoreOutcome::NotFound => info!("no session; client will request a handshake"),
            RestoreOutcome::Failed => warn!("session restore failed; starting unauthenticated"),
        }

        if let Err(e) = self.spawn_client().await {
            error!(generation = self.generation, "chat client failed to start: {e}");
            self.destroy_current().await;
            self.state = ConnectionState::Unavailable;
            self.notify(&format!(
                "❌ WhatsApp client failed to start: {e}\nUse /restart to try again."
            ))
            .await;
            return Err(e);
        }
        Ok(outcome)
    }

    /// Tear down the current client and go through [`Self::start`] again.
    ///
    /// This is the manual retry after `Failed`.
    pub async fn restart(&mut self) -> Result<RestoreOutcome> {
        self.destroy_current().await;
        self.start().await
    }

    /// Destroy the client for good. No session save happens here.
    pub async fn shutdown(&mut self) {
        self.destroy_current().await;
        self.state = ConnectionState::Uninitialized;
    }

    async fn spawn_client(&mut self) -> Result<()> {
        self.generation += 1;
        self.handshake_seen = false;
        self.state = ConnectionState::Uninitialized;
        self.ready_tx.send_replace(false);

        let sink = EventSink::new(self.generation, self.events_tx.clone());
        let client = self.factory.create(sink)?;
        self.client_tx.send_replace(Some(client.clone()));

        debug!(generation = self.generation, "initializing chat client");
        client.initialize().await
    }

    async fn destroy_current(&mut self) {
        self.ready_tx.send_replace(false);
        let Some(client) = self.client_tx.send_replace(None) else {
            return;
        };
        if let Err(e) = client.destroy().await {
            warn!(generation = self.generation, "failed to destroy chat client: {e}");
        }
    }

    pub async fn next_event(&mut self) -> Option<ClientEnvelope> {
        self.events_rx.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<ClientEnvelope> {
        self.events_rx.try_recv().ok()
    }

    /// Apply one client event. Side-effect failures are logged, never returned.
    pub async fn handle_event(&mut self, envelope: ClientEnvelope) -> ConnectionState {
        if envelope.generation != self.generation {
            debug!(
                generation = envelope.generation,
                current = self.generation,
                "ignoring event from retired client"
            );
            return self.state;
        }
        if self.state == ConnectionState::Failed {
            debug!("client already failed; ignoring {:?}", envelope.event);
            return self.state;
        }

        match envelope.event {
            ClientEvent::HandshakeNeeded(payload) => self.on_handshake(&payload).await,
            ClientEvent::Ready => self.on_ready().await,
            ClientEvent::AuthFailure(reason) => self.on_auth_failure(&reason).await,
        }
        self.state
    }

    async fn on_handshake(&mut self, payload: &str) {
        info!("handshake requested; sending QR code to admin");
        self.state = ConnectionState::AwaitingChallenge;
        self.handshake_seen = true;
        self.ready_tx.send_replace(false);

        let image = self.cfg.paths.handshake_image.clone();
        let rendered = {
            let payload = payload.to_string();
            let image = image.clone();
            tokio::task::spawn_blocking(move || render_png(&payload, &image)).await
        };
        match rendered {
            Ok(Ok(())) => {
                if let Err(e) = self
                    .admin
                    .send_image(self.owner(), &image, HANDSHAKE_CAPTION)
                    .await
                {
                    warn!("failed to deliver QR code: {e}");
                }
            }
            Ok(Err(e)) => warn!("failed to render QR image: {e}"),
            Err(e) => warn!("QR render task failed: {e}"),
        }

        match render_terminal(payload) {
            Ok(qr) => println!("{qr}"),
            Err(e) => warn!("failed to render QR for console: {e}"),
        }
    }

    async fn on_ready(&mut self) {
        info!(generation = self.generation, "chat client ready");
        self.state = ConnectionState::Ready;
        self.ready_tx.send_replace(true);

        let should_save = match self.cfg.save_policy {
            SavePolicy::Always => true,
            SavePolicy::AfterHandshake => self.handshake_seen,
        };
        if should_save {
            self.store.save().await;
        } else {
            debug!("session unchanged since restore; skipping upload");
        }

        let image = &self.cfg.paths.handshake_image;
        match tokio::fs::remove_file(image).await {
            Ok(()) => debug!("removed handshake image"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %image.display(), "failed to remove handshake image: {e}"),
        }

        self.notify("✅ WhatsApp connected successfully!").await;
    }

    async fn on_auth_failure(&mut self, reason: &str) {
        error!(generation = self.generation, "authentication failed: {reason}");
        self.state = ConnectionState::Failed;
        self.ready_tx.send_replace(false);

        self.store.invalidate().await;

        self.notify(&format!(
            "❌ WhatsApp authentication failed: {reason}\nSaved session cleared. Use /restart to link again."
        ))
        .await;
    }

    fn owner(&self) -> ChatId {
        ChatId(self.cfg.owner_id)
    }

    /// Status line to the owner, copied to the status channel when one is set.
    async fn notify(&self, text: &str) {
        if let Err(e) = self.admin.send_text(self.owner(), text).await {
            warn!("failed to notify admin: {e}");
        }
        if let Some(channel) = self.cfg.channel_id {
            if let Err(e) = self.admin.send_text(ChatId(channel), text).await {
                warn!("failed to notify status channel: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::atomic::Ordering};

    use super::*;
    use crate::{
        store::{BlobStore, MemoryBlobStore},
        testing::{FakeFactory, RecordingMessenger},
    };

    struct Harness {
        _tmp: tempfile::TempDir,
        cfg: Arc<Config>,
        remote: Arc<MemoryBlobStore>,
        admin: Arc<RecordingMessenger>,
        factory: Arc<FakeFactory>,
        sup: ConnectionSupervisor,
    }

    fn harness(tweak: impl FnOnce(&mut Config)) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = Config::with_root(tmp.path(), 7);
        tweak(&mut cfg);
        let cfg = Arc::new(cfg);
        let remote = Arc::new(MemoryBlobStore::new());
        let store = Arc::new(SessionStore::new(&cfg, Some(remote.clone())));
        let admin = Arc::new(RecordingMessenger::default());
        let factory = Arc::new(FakeFactory::new(&cfg.paths.session_dir));
        let sup = ConnectionSupervisor::new(cfg.clone(), store, factory.clone(), admin.clone());
        Harness {
            _tmp: tmp,
            cfg,
            remote,
            admin,
            factory,
            sup,
        }
    }

    async fn pump(sup: &mut ConnectionSupervisor) -> ConnectionState {
        while let Some(env) = sup.try_next_event() {
            sup.handle_event(env).await;
        }
        sup.state()
    }

    fn seed(dir: &Path) {
        std::fs::create_dir_all(dir.join("Default")).unwrap();
        std::fs::write(dir.join("Default/Cookies"), b"existing").unwrap();
    }

    #[tokio::test]
    async fn fresh_start_sends_one_qr_then_saves_on_ready() {
        let mut h = harness(|_| {});
        assert_eq!(h.sup.start().await.unwrap(), RestoreOutcome::NotFound);
        assert_eq!(pump(&mut h.sup).await, ConnectionState::AwaitingChallenge);

        let images = h.admin.images();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].chat_id, ChatId(7));
        assert_eq!(images[0].path, h.cfg.paths.handshake_image);
        assert_eq!(images[0].caption, HANDSHAKE_CAPTION);
        assert!(images[0].existed);
        assert!(!h.sup.handle().is_ready());

        h.factory.last().complete_handshake();
        assert_eq!(pump(&mut h.sup).await, ConnectionState::Ready);

        assert!(h.sup.handle().is_ready());
        assert!(h.remote.contains("session.tar.gz").await);
        assert!(!h.cfg.paths.handshake_image.exists());
        let texts = h.admin.texts();
        assert_eq!(texts.last().unwrap().1, "✅ WhatsApp connected successfully!");
    }

    #[tokio::test]
    async fn local_session_skips_upload_under_default_policy() {
        let mut h = harness(|_| {});
        seed(&h.cfg.paths.session_dir);

        assert_eq!(
            h.sup.start().await.unwrap(),
            RestoreOutcome::Found(RestoreSource::Local)
        );
        assert_eq!(pump(&mut h.sup).await, ConnectionState::Ready);
        assert!(h.admin.images().is_empty());
        assert!(h.remote.keys().await.is_empty());
    }

    #[tokio::test]
    async fn always_policy_uploads_on_every_ready() {
        let mut h = harness(|c| c.save_policy = SavePolicy::Always);
        seed(&h.cfg.paths.session_dir);

        h.sup.start().await.unwrap();
        assert_eq!(pump(&mut h.sup).await, ConnectionState::Ready);
        assert!(h.remote.contains("session.tar.gz").await);
    }

    #[tokio::test]
    async fn remote_session_reaches_ready_without_handshake() {
        let mut h = harness(|_| {});
        // Produce an archive from a linked session, then wipe the local copy.
        seed(&h.cfg.paths.session_dir);
        let producer = SessionStore::new(&h.cfg, Some(h.remote.clone()));
        assert!(producer.save().await);
        std::fs::remove_dir_all(&h.cfg.paths.session_dir).unwrap();

        assert_eq!(
            h.sup.start().await.unwrap(),
            RestoreOutcome::Found(RestoreSource::Remote)
        );
        assert!(h.factory.last().initialized.load(Ordering::SeqCst));
        assert_eq!(pump(&mut h.sup).await, ConnectionState::Ready);
        assert!(h.admin.images().is_empty());
    }

    #[tokio::test]
    async fn auth_failure_invalidates_everything() {
        let mut h = harness(|_| {});
        seed(&h.cfg.paths.session_dir);
        h.remote
            .put("session.tar.gz", b"stale".to_vec())
            .await
            .unwrap();
        h.factory.reject_session.store(true, Ordering::SeqCst);

        h.sup.start().await.unwrap();
        assert_eq!(pump(&mut h.sup).await, ConnectionState::Failed);

        assert!(!h.cfg.paths.session_dir.exists());
        assert!(h.remote.keys().await.is_empty());
        assert!(h.admin.texts().last().unwrap().1.contains("authentication failed"));
        let next_boot = SessionStore::new(&h.cfg, Some(h.remote.clone()));
        assert_eq!(next_boot.restore().await, RestoreOutcome::NotFound);

        // Terminal for this instance: a late Ready is ignored.
        h.factory.last().emit(ClientEvent::Ready);
        assert_eq!(pump(&mut h.sup).await, ConnectionState::Failed);
        assert!(!h.sup.handle().is_ready());
    }

    #[tokio::test]
    async fn client_start_failure_is_reported_to_the_owner() {
        let mut h = harness(|c| c.channel_id = Some(-100123));
        h.factory.fail_initialize.store(true, Ordering::SeqCst);

        assert!(h.sup.start().await.is_err());
        assert_eq!(h.sup.state(), ConnectionState::Unavailable);
        assert!(h.factory.last().destroyed.load(Ordering::SeqCst));
        assert!(h.sup.handle().current().is_none());

        let texts = h.admin.texts();
        assert_eq!(texts.len(), 2);
        assert_eq!(texts[0].0, ChatId(7));
        assert!(texts[0].1.contains("client failed to start"));
        assert!(texts[0].1.contains("/restart"));

        // A manual restart recovers once the client can start.
        h.factory.fail_initialize.store(false, Ordering::SeqCst);
        h.sup.restart().await.unwrap();
        assert_eq!(pump(&mut h.sup).await, ConnectionState::AwaitingChallenge);
    }

    #[tokio::test]
    async fn restart_builds_a_new_instance_and_ignores_the_old_one() {
        let mut h = harness(|_| {});
        h.sup.start().await.unwrap();
        pump(&mut h.sup).await;
        let first = h.factory.last();

        h.sup.restart().await.unwrap();
        assert!(first.destroyed.load(Ordering::SeqCst));
        assert_eq!(h.factory.created(), 2);
        assert_eq!(h.sup.generation(), 2);
        pump(&mut h.sup).await;

        first.emit(ClientEvent::Ready);
        assert_eq!(pump(&mut h.sup).await, ConnectionState::AwaitingChallenge);
        assert_eq!(h.admin.images().len(), 2);
    }

    #[tokio::test]
    async fn status_channel_gets_a_copy() {
        let mut h = harness(|c| c.channel_id = Some(-100123));
        seed(&h.cfg.paths.session_dir);
        h.sup.start().await.unwrap();
        pump(&mut h.sup).await;

        let chats: Vec<ChatId> = h.admin.texts().into_iter().map(|(c, _)| c).collect();
        assert_eq!(chats, vec![ChatId(7), ChatId(-100123)]);
    }

    #[tokio::test]
    async fn shutdown_destroys_client_without_saving() {
        let mut h = harness(|c| c.save_policy = SavePolicy::Always);
        h.sup.start().await.unwrap();
        pump(&mut h.sup).await;
        let client = h.factory.last();

        h.sup.shutdown().await;
        assert!(client.destroyed.load(Ordering::SeqCst));
        assert!(h.sup.handle().current().is_none());
        assert!(h.remote.keys().await.is_empty());
    }
}
