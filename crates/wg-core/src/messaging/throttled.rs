//! Outbound pacing for the admin channel.
//!
//! The bridge only ever writes to the owner and the optional status channel,
//! but a restart can queue a QR photo, a connection notice and a command reply
//! back to back. Each send waits for its chat's next free slot so these bursts
//! never trip Telegram's one-message-per-second chat limit.

use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatId, MessageRef},
    messaging::port::MessagingPort,
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct Pacing {
    /// Gap between two messages to the same chat.
    pub per_chat: Duration,
    /// Gap between any two calls, so the status-channel copy trails the owner's notice.
    pub overall: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            per_chat: Duration::from_millis(1050),
            overall: Duration::from_millis(50),
        }
    }
}

#[derive(Debug)]
struct Slots {
    overall: Instant,
    chats: HashMap<ChatId, Instant>,
}

impl Slots {
    fn new(now: Instant) -> Self {
        Self {
            overall: now,
            chats: HashMap::new(),
        }
    }

    /// Book the earliest moment `chat` may send; returns how long to wait for it.
    fn claim(&mut self, chat: ChatId, pacing: Pacing, now: Instant) -> Duration {
        let chat_free = self.chats.get(&chat).copied().unwrap_or(now);
        let at = now.max(self.overall).max(chat_free);
        self.overall = at + pacing.overall;
        self.chats.insert(chat, at + pacing.per_chat);
        at.duration_since(now)
    }
}

/// [`MessagingPort`] wrapper that spaces sends per chat. 429s that still get
/// through are retried by the Telegram adapter.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    pacing: Pacing,
    slots: Mutex<Slots>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, pacing: Pacing) -> Self {
        Self {
            inner,
            pacing,
            slots: Mutex::new(Slots::new(Instant::now())),
        }
    }

    async fn wait_turn(&self, chat_id: ChatId) {
        let wait = {
            let mut slots = self.slots.lock().await;
            slots.claim(chat_id, self.pacing, Instant::now())
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl MessagingPort for ThrottledMessenger {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        self.wait_turn(chat_id).await;
        self.inner.send_text(chat_id, text).await
    }

    async fn send_image(
        &self,
        chat_id: ChatId,
        image: &Path,
        caption: &str,
    ) -> Result<MessageRef> {
        self.wait_turn(chat_id).await;
        self.inner.send_image(chat_id, image, caption).await
    }
}
