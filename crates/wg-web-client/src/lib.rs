//! WhatsApp web-client adapter.
//!
//! Drives an external bridge process (a headless web client) over stdio:
//! lifecycle events arrive as NDJSON on stdout, commands go out as NDJSON on
//! stdin.

use std::{collections::VecDeque, path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wg_core::{
    chat::{ChatClient, ChatClientFactory, ClientEvent, EventSink},
    config::{Config, PmGuardAction},
    errors::Error,
    Result,
};

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;
const DESTROY_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        // +1 for the '\n' we join with later.
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            if let Some(front) = self.lines.pop_front() {
                self.bytes = self.bytes.saturating_sub(front.len() + 1);
            } else {
                break;
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// How to launch the bridge process.
#[derive(Clone, Debug)]
pub struct SidecarConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub session_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl SidecarConfig {
    pub fn from_config(cfg: &Config) -> Self {
        let action = match cfg.pmguard_action {
            PmGuardAction::Mute => "mute",
            PmGuardAction::Block => "block",
        };
        Self {
            program: cfg.client_program.clone(),
            args: cfg.client_args.clone(),
            session_dir: cfg.paths.session_dir.clone(),
            env: vec![
                ("PMGUARD_ENABLED".to_string(), cfg.pmguard_enabled.to_string()),
                ("PMGUARD_ACTION".to_string(), action.to_string()),
                (
                    "MAX_FILE_SIZE_MB".to_string(),
                    cfg.max_file_size_mb.to_string(),
                ),
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WireEvent {
    Qr {
        data: String,
    },
    Ready,
    AuthFailure {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum WireCommand<'a> {
    Send { to: &'a str, text: &'a str },
    Destroy,
}

/// Parse one stdout line. `Ok(None)` for events the core does not track.
fn parse_event(line: &str) -> Result<Option<ClientEvent>> {
    let ev: WireEvent = serde_json::from_str(line)?;
    Ok(match ev {
        WireEvent::Qr { data } => Some(ClientEvent::HandshakeNeeded(data)),
        WireEvent::Ready => Some(ClientEvent::Ready),
        WireEvent::AuthFailure { message } => Some(ClientEvent::AuthFailure(message)),
        WireEvent::Other => None,
    })
}

pub struct SidecarClient {
    cfg: SidecarConfig,
    sink: EventSink,
    child: Arc<Mutex<Option<Child>>>,
    stdin: Mutex<Option<ChildStdin>>,
    stderr_tail: Arc<Mutex<StderrTail>>,
    cancel: CancellationToken,
}

impl SidecarClient {
    pub fn new(cfg: SidecarConfig, sink: EventSink) -> Self {
        Self {
            cfg,
            sink,
            child: Arc::new(Mutex::new(None)),
            stdin: Mutex::new(None),
            stderr_tail: Arc::new(Mutex::new(StderrTail::default())),
            cancel: CancellationToken::new(),
        }
    }

    async fn write_command(&self, cmd: &WireCommand<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(cmd)?;
        line.push(b'\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| Error::External("web client is not running".to_string()))?;
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn kill_child(&self) -> Result<()> {
        let child = {
            let mut guard = self.child.lock().await;
            guard.take()
        };

        let Some(mut child) = child else {
            return Ok(());
        };

        // If it's already exited, `try_wait` reaps it.
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        match child.kill().await {
            Ok(()) => {
                let _ = child.wait().await?;
            }
            Err(e) => {
                // If it exited between `try_wait` and `kill`, `wait` will reap it.
                if child.try_wait()?.is_none() {
                    let mut guard = self.child.lock().await;
                    *guard = Some(child);
                    return Err(Error::Io(e));
                }
            }
        }

        Ok(())
    }

    /// Wait for a voluntary exit after `destroy`; `false` if it is still running.
    async fn wait_exit(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            {
                let mut guard = self.child.lock().await;
                match guard.as_mut().map(|c| c.try_wait()) {
                    None => return true,
                    Some(Ok(Some(status))) => {
                        debug!(%status, "web client exited");
                        guard.take();
                        return true;
                    }
                    Some(Ok(None)) => {}
                    Some(Err(e)) => {
                        warn!("failed to poll web client: {e}");
                        return false;
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[async_trait]
impl ChatClient for SidecarClient {
    async fn initialize(&self) -> Result<()> {
        if self.child.lock().await.is_some() {
            return Err(Error::External("web client already initialized".to_string()));
        }

        let mut cmd = Command::new(&self.cfg.program);
        cmd.args(&self.cfg.args)
            .env("SESSION_DIR", &self.cfg.session_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &self.cfg.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::External(format!(
                "failed to launch web client {}: {e}",
                self.cfg.program.display()
            ))
        })?;
        let generation = self.sink.generation();
        info!(generation, pid = ?child.id(), "web client started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::External("web client stdout was not captured".to_string()))?;
        *self.stdin.lock().await = child.stdin.take();

        // Drain stderr in background to avoid blocking on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let tail = self.stderr_tail.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    tail.lock().await.push_line(line);
                }
            });
        }

        *self.child.lock().await = Some(child);

        let sink = self.sink.clone();
        let cancel = self.cancel.clone();
        let tail = self.stderr_tail.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => return,
                    line = reader.next_line() => line,
                };
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(generation, "web client stdout read failed: {e}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_event(&line) {
                    Ok(Some(event)) => {
                        if sink.emit(event).is_err() {
                            return;
                        }
                    }
                    Ok(None) => debug!(generation, "web client: {line}"),
                    Err(e) => warn!(generation, "unparseable web client line ({e}): {line}"),
                }
            }
            if !cancel.is_cancelled() {
                let stderr = tail.lock().await.snapshot();
                warn!(generation, "web client exited unexpectedly\nstderr (tail):\n{stderr}");
            }
        });

        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.cancel.cancel();

        if let Err(e) = self.write_command(&WireCommand::Destroy).await {
            debug!("destroy command not delivered: {e}");
        }
        // Closing stdin is the second hint to exit.
        self.stdin.lock().await.take();

        if !self.wait_exit(DESTROY_GRACE).await {
            warn!("web client did not exit in time; killing it");
        }
        self.kill_child().await
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::External("web client destroyed".to_string()));
        }
        self.write_command(&WireCommand::Send { to, text }).await
    }
}

pub struct SidecarClientFactory {
    cfg: SidecarConfig,
}

impl SidecarClientFactory {
    pub fn new(cfg: SidecarConfig) -> Self {
        Self { cfg }
    }
}

impl ChatClientFactory for SidecarClientFactory {
    fn create(&self, events: EventSink) -> Result<Arc<dyn ChatClient>> {
        Ok(Arc::new(SidecarClient::new(self.cfg.clone(), events)))
    }
}
