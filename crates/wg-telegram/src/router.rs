use teloxide::{
    dispatching::{DefaultKey, Dispatcher},
    dptree,
    prelude::*,
    types::BotCommand,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use wg_core::{
    domain::{ChatId, UserId},
    messaging::types::{parse_command, AdminCommand, IncomingCommand},
};

type CommandTx = mpsc::UnboundedSender<IncomingCommand>;

/// The fixed command set registered via `setMyCommands`.
pub fn command_menu() -> Vec<BotCommand> {
    AdminCommand::MENU
        .iter()
        .map(|(name, description)| BotCommand::new(*name, *description))
        .collect()
}

pub fn build_dispatcher(
    bot: Bot,
    commands: CommandTx,
) -> Dispatcher<Bot, teloxide::RequestError, DefaultKey> {
    let handler = dptree::entry().branch(Update::filter_message().endpoint(handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![commands])
        .default_handler(|_| async {})
        .build()
}

async fn handle_message(msg: Message, commands: CommandTx) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let incoming = to_incoming(
        msg.chat.id.0,
        user.id.0 as i64,
        user.username.clone(),
        text,
    );
    let Some(incoming) = incoming else {
        debug!(chat_id = msg.chat.id.0, "ignoring non-command message");
        return Ok(());
    };

    if commands.send(incoming).is_err() {
        warn!("command receiver dropped; ignoring update");
    }
    Ok(())
}

/// Turn a message into a command for the orchestrator. Authorization happens there.
pub fn to_incoming(
    chat_id: i64,
    user_id: i64,
    username: Option<String>,
    text: &str,
) -> Option<IncomingCommand> {
    let (name, args) = parse_command(text)?;
    Some(IncomingCommand {
        chat_id: ChatId(chat_id),
        user_id: UserId(user_id),
        username,
        name,
        args,
    })
}
