use crate::domain::{ChatId, UserId};

/// A `/command args` message received on the administrative channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingCommand {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub username: Option<String>,
    pub name: String,
    pub args: String,
}

/// The fixed operator command set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdminCommand {
    Start,
    Restart,
    Send { to: String, text: String },
}

impl AdminCommand {
    /// Commands registered with the channel, with their descriptions.
    pub const MENU: [(&'static str, &'static str); 3] = [
        ("start", "Start bot"),
        ("restart", "Restart WhatsApp client"),
        ("send", "Send message to WhatsApp"),
    ];

    /// Parse a command name and its raw argument string.
    ///
    /// `send` takes `<recipient> <text...>`; anything malformed is `None`.
    pub fn parse(name: &str, args: &str) -> Option<Self> {
        match name {
            "start" => Some(Self::Start),
            "restart" => Some(Self::Restart),
            "send" => {
                let (to, text) = args.trim().split_once(char::is_whitespace)?;
                let text = text.trim();
                if to.is_empty() || text.is_empty() {
                    return None;
                }
                Some(Self::Send {
                    to: to.to_string(),
                    text: text.to_string(),
                })
            }
            _ => None,
        }
    }
}

/// A parsed command together with the chat it came from, as broadcast to modules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorCommand {
    pub chat_id: ChatId,
    pub command: AdminCommand,
}

/// Split `/cmd@botname arg1 ...` into a lowercase name and the trimmed rest.
pub fn parse_command(text: &str) -> Option<(String, String)> {
    let text = text.trim();
    if !text.starts_with('/') {
        return None;
    }
    let mut parts = text.splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();
    if cmd.is_empty() {
        return None;
    }
    Some((cmd, rest))
}
