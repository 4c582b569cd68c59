use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// When the Connection Supervisor uploads the session on a `Ready` transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SavePolicy {
    /// Upload on every `Ready` event.
    Always,
    /// Upload only when the client went through a fresh handshake first.
    AfterHandshake,
}

impl SavePolicy {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "always" => Some(Self::Always),
            "after-handshake" | "after_handshake" | "handshake" => Some(Self::AfterHandshake),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmGuardAction {
    Mute,
    Block,
}

/// Remote store coordinates. Absent from [`Config`] when no store is configured.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub bucket: String,
}

/// Every filesystem location the core creates or removes.
#[derive(Clone, Debug)]
pub struct SessionPaths {
    /// Live session directory owned by the chat client.
    pub session_dir: PathBuf,
    /// Temporary copy taken before compressing.
    pub snapshot_dir: PathBuf,
    /// Temporary archive (upload source / download target).
    pub archive_path: PathBuf,
    /// Rendered handshake QR image.
    pub handshake_image: PathBuf,
}

impl SessionPaths {
    /// Default layout rooted at `root`.
    pub fn under(root: &Path) -> Self {
        Self {
            session_dir: root.join("WWebJS"),
            snapshot_dir: root.join("WWebJS-Copy"),
            archive_path: root.join("session.tar.gz"),
            handshake_image: root.join("qr.png"),
        }
    }
}

/// Process-wide settings, resolved once at startup and shared read-only.
#[derive(Clone, Debug)]
pub struct Config {
    // Administrative channel
    pub telegram_bot_token: String,
    pub owner_id: i64,
    pub channel_id: Option<i64>,

    // Remote store
    pub store: Option<StoreConfig>,
    pub store_timeout: Duration,
    pub session_key: String,
    pub save_policy: SavePolicy,

    // Filesystem
    pub paths: SessionPaths,

    // Chat client bridge process
    pub client_program: PathBuf,
    pub client_args: Vec<String>,
    /// Period of the scheduled client restart; `None` when `AUTO_RESTART_HOURS=0`.
    pub auto_restart: Option<Duration>,

    // Feature toggles handed to modules
    pub pmguard_enabled: bool,
    pub pmguard_action: PmGuardAction,
    pub max_file_size_mb: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TG_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TG_BOT_TOKEN environment variable is required".to_string(),
            ));
        }
        let owner_id = env_str("TG_OWNER_ID")
            .and_then(|s| s.trim().parse::<i64>().ok())
            .ok_or_else(|| {
                Error::Config("TG_OWNER_ID must be set to a numeric chat id".to_string())
            })?;
        let channel_id = env_str("TG_CHANNEL_ID").and_then(|s| s.trim().parse::<i64>().ok());

        let store = env_str("STORE_URL").and_then(non_empty).map(|url| StoreConfig {
            url: url.trim_end_matches('/').to_string(),
            api_key: env_str("STORE_API_KEY").and_then(non_empty),
            bucket: env_str("STORE_BUCKET")
                .and_then(non_empty)
                .unwrap_or_else(|| "WhatsGram".to_string()),
        });
        let store_timeout = Duration::from_secs(env_u64("STORE_TIMEOUT_SECS").unwrap_or(60));
        let session_key = env_str("SESSION_KEY")
            .and_then(non_empty)
            .unwrap_or_else(|| "session.tar.gz".to_string());
        let save_policy = match env_str("SESSION_SAVE_POLICY").and_then(non_empty) {
            None => SavePolicy::AfterHandshake,
            Some(raw) => SavePolicy::parse(&raw).ok_or_else(|| {
                Error::Config(format!(
                    "SESSION_SAVE_POLICY must be 'always' or 'after-handshake', got '{raw}'"
                ))
            })?,
        };

        let defaults = SessionPaths::under(Path::new("."));
        let paths = SessionPaths {
            session_dir: env_path("SESSION_DIR").unwrap_or(defaults.session_dir),
            snapshot_dir: env_path("SESSION_SNAPSHOT_DIR").unwrap_or(defaults.snapshot_dir),
            archive_path: env_path("SESSION_ARCHIVE_PATH").unwrap_or(defaults.archive_path),
            handshake_image: env_path("HANDSHAKE_IMAGE_PATH").unwrap_or(defaults.handshake_image),
        };
        if paths.session_dir == paths.snapshot_dir {
            return Err(Error::InvalidPath {
                path: paths.snapshot_dir,
                reason: "snapshot directory must differ from the session directory".to_string(),
            });
        }

        let (client_program, client_args) =
            parse_command_line(&env_str("CLIENT_COMMAND").unwrap_or_default())
                .unwrap_or_else(|| {
                    (
                        PathBuf::from("node"),
                        vec!["bridge/index.js".to_string()],
                    )
                });

        let pmguard_enabled = env_bool("PMGUARD_ENABLED").unwrap_or(false);
        let pmguard_action = match env_str("PMGUARD_ACTION").as_deref().map(str::trim) {
            Some("block") => PmGuardAction::Block,
            _ => PmGuardAction::Mute,
        };
        let auto_restart = restart_period(env_u64("AUTO_RESTART_HOURS").unwrap_or(12));
        let max_file_size_mb = env_u64("MAX_FILE_SIZE_MB").unwrap_or(100);

        Ok(Self {
            telegram_bot_token,
            owner_id,
            channel_id,
            store,
            store_timeout,
            session_key,
            save_policy,
            paths,
            client_program,
            client_args,
            auto_restart,
            pmguard_enabled,
            pmguard_action,
            max_file_size_mb,
        })
    }

    /// Settings for tests and embedding: no store, everything under `root`.
    pub fn with_root(root: &Path, owner_id: i64) -> Self {
        Self {
            telegram_bot_token: String::new(),
            owner_id,
            channel_id: None,
            store: None,
            store_timeout: Duration::from_secs(5),
            session_key: "session.tar.gz".to_string(),
            save_policy: SavePolicy::AfterHandshake,
            paths: SessionPaths::under(root),
            client_program: PathBuf::from("node"),
            client_args: vec!["bridge/index.js".to_string()],
            auto_restart: None,
            pmguard_enabled: false,
            pmguard_action: PmGuardAction::Mute,
            max_file_size_mb: 100,
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, strip_quotes(v.trim()));
    }
}

fn strip_quotes(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return &val[1..val.len() - 1];
    }
    val
}

fn parse_command_line(raw: &str) -> Option<(PathBuf, Vec<String>)> {
    let mut parts = raw.split_whitespace();
    let program = parts.next()?;
    Some((
        PathBuf::from(program),
        parts.map(|s| s.to_string()).collect(),
    ))
}

/// Zero hours turns the scheduled restart off.
fn restart_period(hours: u64) -> Option<Duration> {
    (hours > 0).then(|| Duration::from_secs(hours * 3600))
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
