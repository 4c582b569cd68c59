//! Fakes for the ports, shared by the unit tests of this crate.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};

use crate::{
    chat::{ChatClient, ChatClientFactory, ClientEvent, ClientHandle, EventSink},
    config::Config,
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{
        port::{AdminChannel, MessagingPort},
        types::IncomingCommand,
    },
    registry::ModuleContext,
    Result,
};

#[derive(Clone, Debug)]
pub struct SentImage {
    pub chat_id: ChatId,
    pub path: PathBuf,
    pub caption: String,
    pub existed: bool,
}

/// Admin channel that records everything it is asked to send.
#[derive(Default)]
pub struct RecordingMessenger {
    next_id: AtomicUsize,
    texts: Mutex<Vec<(ChatId, String)>>,
    images: Mutex<Vec<SentImage>>,
    listener: Mutex<Option<mpsc::UnboundedSender<IncomingCommand>>>,
    pub started: AtomicBool,
    pub stopped: AtomicBool,
    pub fail_start: bool,
}

impl RecordingMessenger {
    /// Channel whose listener never comes up.
    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Default::default()
        }
    }

    pub fn texts(&self) -> Vec<(ChatId, String)> {
        self.texts.lock().unwrap().clone()
    }

    pub fn images(&self) -> Vec<SentImage> {
        self.images.lock().unwrap().clone()
    }

    /// Simulate the operator typing a command.
    pub fn inject(&self, user_id: i64, name: &str, args: &str) {
        let tx = self.listener.lock().unwrap().clone().expect("channel not started");
        tx.send(IncomingCommand {
            chat_id: ChatId(user_id),
            user_id: crate::domain::UserId(user_id),
            username: None,
            name: name.to_string(),
            args: args.to_string(),
        })
        .unwrap();
    }

    fn alloc(&self, chat_id: ChatId) -> MessageRef {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as i32 + 1;
        MessageRef {
            chat_id,
            message_id: MessageId(id),
        }
    }
}

#[async_trait]
impl MessagingPort for RecordingMessenger {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        self.texts.lock().unwrap().push((chat_id, text.to_string()));
        Ok(self.alloc(chat_id))
    }

    async fn send_image(
        &self,
        chat_id: ChatId,
        image: &Path,
        caption: &str,
    ) -> Result<MessageRef> {
        self.images.lock().unwrap().push(SentImage {
            chat_id,
            path: image.to_path_buf(),
            caption: caption.to_string(),
            existed: image.is_file(),
        });
        Ok(self.alloc(chat_id))
    }
}

#[async_trait]
impl AdminChannel for RecordingMessenger {
    async fn start(&self, commands: mpsc::UnboundedSender<IncomingCommand>) -> Result<()> {
        if self.fail_start {
            return Err(Error::External("telegram unreachable".to_string()));
        }
        *self.listener.lock().unwrap() = Some(commands);
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Chat client that behaves like the web client against a session directory:
/// a present directory authenticates, an absent one asks for a handshake.
pub struct FakeClient {
    sink: EventSink,
    session_dir: PathBuf,
    reject_session: bool,
    fail_initialize: bool,
    pub initialized: AtomicBool,
    pub destroyed: AtomicBool,
    sent: Mutex<Vec<(String, String)>>,
}

impl FakeClient {
    /// The operator scanned the QR code: the client writes its session and goes ready.
    pub fn complete_handshake(&self) {
        std::fs::create_dir_all(self.session_dir.join("Default")).unwrap();
        std::fs::write(self.session_dir.join("Default/Cookies"), b"linked").unwrap();
        self.sink.emit(ClientEvent::Ready).unwrap();
    }

    pub fn emit(&self, event: ClientEvent) {
        self.sink.emit(event).unwrap();
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatClient for FakeClient {
    async fn initialize(&self) -> Result<()> {
        self.initialized.store(true, Ordering::SeqCst);
        if self.fail_initialize {
            return Err(Error::External("client program not found".to_string()));
        }
        let event = if !self.session_dir.is_dir() {
            ClientEvent::HandshakeNeeded(format!("2@fake-qr-{}", self.sink.generation()))
        } else if self.reject_session {
            ClientEvent::AuthFailure("session rejected".to_string())
        } else {
            ClientEvent::Ready
        };
        self.sink.emit(event)
    }

    async fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::External("client destroyed".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), text.to_string()));
        Ok(())
    }
}

pub struct FakeFactory {
    session_dir: PathBuf,
    pub reject_session: AtomicBool,
    pub fail_initialize: AtomicBool,
    created: Mutex<Vec<Arc<FakeClient>>>,
}

impl FakeFactory {
    pub fn new(session_dir: &Path) -> Self {
        Self {
            session_dir: session_dir.to_path_buf(),
            reject_session: AtomicBool::new(false),
            fail_initialize: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<FakeClient> {
        self.created
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no client created")
    }
}

impl ChatClientFactory for FakeFactory {
    fn create(&self, events: EventSink) -> Result<Arc<dyn ChatClient>> {
        let client = Arc::new(FakeClient {
            sink: events,
            session_dir: self.session_dir.clone(),
            reject_session: self.reject_session.load(Ordering::SeqCst),
            fail_initialize: self.fail_initialize.load(Ordering::SeqCst),
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        });
        self.created.lock().unwrap().push(client.clone());
        Ok(client)
    }
}

/// Context with no live client, for registry tests.
pub fn test_context(admin: Arc<dyn MessagingPort>) -> ModuleContext {
    let (_client_tx, client_rx) = watch::channel::<Option<Arc<dyn ChatClient>>>(None);
    let (_ready_tx, ready_rx) = watch::channel(false);
    let (commands, _) = broadcast::channel(16);
    ModuleContext::new(
        admin,
        ClientHandle::new(client_rx, ready_rx),
        Arc::new(Config::with_root(Path::new("/tmp/wg-test"), 42)),
        commands,
    )
}
