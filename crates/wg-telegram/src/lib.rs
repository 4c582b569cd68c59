//! Telegram adapter (teloxide).
//!
//! Implements the `wg-core` admin channel over the Telegram Bot API: outbound
//! text and photos, plus a long-polling listener that forwards `/commands`.

use std::path::Path;

use async_trait::async_trait;
use teloxide::{dispatching::ShutdownToken, prelude::*, types::InputFile};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};

pub mod router;

use wg_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{
        port::{AdminChannel, MessagingPort},
        types::IncomingCommand,
    },
    Result,
};

const MAX_MESSAGE_LEN: usize = 4096;
const MAX_CAPTION_LEN: usize = 1024;

struct Listener {
    shutdown: ShutdownToken,
    handle: JoinHandle<()>,
}

pub struct TelegramChannel {
    bot: Bot,
    listener: Mutex<Option<Listener>>,
}

impl TelegramChannel {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot,
            listener: Mutex::new(None),
        }
    }

    pub fn from_token(token: &str) -> Self {
        Self::new(Bot::new(token))
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::External(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        debug!(wait = ?d, "telegram flood control; retrying");
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[async_trait]
impl MessagingPort for TelegramChannel {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        let text = truncate(text, MAX_MESSAGE_LEN);
        let msg = self
            .with_retry(|| self.bot.send_message(Self::tg_chat(chat_id), text.clone()))
            .await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn send_image(
        &self,
        chat_id: ChatId,
        image: &Path,
        caption: &str,
    ) -> Result<MessageRef> {
        if !image.is_file() {
            return Err(Error::InvalidPath {
                path: image.to_path_buf(),
                reason: "image not found".to_string(),
            });
        }
        let caption = truncate(caption, MAX_CAPTION_LEN);
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_photo(Self::tg_chat(chat_id), InputFile::file(image.to_path_buf()))
                    .caption(caption.clone())
            })
            .await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }
}

#[async_trait]
impl AdminChannel for TelegramChannel {
    async fn start(&self, commands: mpsc::UnboundedSender<IncomingCommand>) -> Result<()> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }

        let me = self.bot.get_me().await.map_err(Self::map_err)?;
        info!(bot = %me.username(), "telegram bot connected");

        self.with_retry(|| self.bot.set_my_commands(router::command_menu()))
            .await?;

        let mut dispatcher = router::build_dispatcher(self.bot.clone(), commands);
        let shutdown = dispatcher.shutdown_token();
        let handle = tokio::spawn(async move {
            dispatcher.dispatch().await;
        });
        *listener = Some(Listener { shutdown, handle });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(listener) = self.listener.lock().await.take() else {
            return Ok(());
        };
        match listener.shutdown.shutdown() {
            Ok(done) => done.await,
            // Not polling yet: nothing to drain.
            Err(_) => listener.handle.abort(),
        }
        if let Err(e) = listener.handle.await {
            if !e.is_cancelled() {
                warn!("telegram dispatcher ended abnormally: {e}");
            }
        }
        info!("telegram listener stopped");
        Ok(())
    }
}
