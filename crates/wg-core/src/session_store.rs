//! Session Store: persists the chat client's on-disk session as a single
//! archive under a fixed key in the remote store.
//!
//! Every operation is best-effort. Failures are logged and surface as a
//! boolean / [`RestoreOutcome`]; a storage outage degrades to "start
//! unauthenticated", never a crash. `save`, `restore` and `invalidate` run one
//! at a time behind a single gate.

use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    archive::{pack_tar_gz, safe_extract_archive, snapshot_dir, ExtractLimits},
    config::{Config, SessionPaths},
    errors::Error,
    store::BlobStore,
    Result,
};

/// Where a restored session came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreSource {
    /// The session directory already existed; nothing was downloaded.
    Local,
    /// The archive was downloaded and extracted.
    Remote,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreOutcome {
    Found(RestoreSource),
    /// No archive under the key (or no store configured): a first run.
    NotFound,
    /// The store or the filesystem failed; the caller starts fresh.
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaveReport {
    pub files: usize,
    pub archive_bytes: usize,
}

pub struct SessionStore {
    paths: SessionPaths,
    key: String,
    store: Option<Arc<dyn BlobStore>>,
    timeout: Duration,
    limits: ExtractLimits,
    gate: Mutex<()>,
}

impl SessionStore {
    pub fn new(cfg: &Config, store: Option<Arc<dyn BlobStore>>) -> Self {
        Self {
            paths: cfg.paths.clone(),
            key: cfg.session_key.clone(),
            store,
            timeout: cfg.store_timeout,
            limits: ExtractLimits::default(),
            gate: Mutex::new(()),
        }
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    /// Snapshot, compress and upload the local session. Returns whether the
    /// upload succeeded; the reason for a failure is logged.
    pub async fn save(&self) -> bool {
        match self.try_save().await {
            Ok(report) => {
                info!(
                    key = %self.key,
                    files = report.files,
                    bytes = report.archive_bytes,
                    "session saved to remote store"
                );
                true
            }
            Err(Error::NoLocalState(dir)) => {
                info!(dir = %dir.display(), "no local session to save");
                false
            }
            Err(Error::StoreUnavailable) => {
                info!("remote store not configured; session not saved");
                false
            }
            Err(e) => {
                error!("failed to save session: {e}");
                false
            }
        }
    }

    /// Like [`SessionStore::save`] but reports why nothing was uploaded.
    ///
    /// The snapshot copy and the archive are removed on every exit path.
    pub async fn try_save(&self) -> Result<SaveReport> {
        let _gate = self.gate.lock().await;
        let _scratch = Scratch::new(vec![
            self.paths.snapshot_dir.clone(),
            self.paths.archive_path.clone(),
        ]);

        if !self.paths.session_dir.is_dir() {
            return Err(Error::NoLocalState(self.paths.session_dir.clone()));
        }
        let store = self.store.as_ref().ok_or(Error::StoreUnavailable)?;

        let src = self.paths.session_dir.clone();
        let snap = self.paths.snapshot_dir.clone();
        let archive = self.paths.archive_path.clone();
        let files = tokio::task::spawn_blocking(move || -> Result<usize> {
            let files = snapshot_dir(&src, &snap)?;
            pack_tar_gz(&snap, &archive)?;
            Ok(files)
        })
        .await
        .map_err(|e| Error::External(format!("snapshot task failed: {e}")))??;

        let bytes = tokio::fs::read(&self.paths.archive_path).await?;
        let archive_bytes = bytes.len();
        debug!(files, archive_bytes, "uploading session archive");

        self.bounded("upload session archive", store.put(&self.key, bytes))
            .await?;

        Ok(SaveReport {
            files,
            archive_bytes,
        })
    }

    /// Make the session directory available before the client starts.
    ///
    /// An existing local directory always wins: no remote call, no overwrite.
    /// Returns only after extraction has finished.
    pub async fn restore(&self) -> RestoreOutcome {
        let _gate = self.gate.lock().await;

        if self.paths.session_dir.exists() {
            info!(dir = %self.paths.session_dir.display(), "using existing local session");
            return RestoreOutcome::Found(RestoreSource::Local);
        }
        let Some(store) = self.store.as_ref() else {
            info!("remote store not configured; starting without a saved session");
            return RestoreOutcome::NotFound;
        };

        info!(key = %self.key, "fetching session from remote store");
        let bytes = match self.bounded("download session archive", store.get(&self.key)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                info!("no saved session found; a new one will be created");
                return RestoreOutcome::NotFound;
            }
            Err(e) => {
                error!("failed to fetch session: {e}");
                return RestoreOutcome::Failed;
            }
        };

        match self.unpack(bytes).await {
            Ok(files) => {
                info!(files, "session restored from remote store");
                RestoreOutcome::Found(RestoreSource::Remote)
            }
            Err(e) => {
                error!("failed to unpack session archive: {e}");
                // A half-extracted directory would be taken as a valid local session next time.
                remove_path(&self.paths.session_dir);
                RestoreOutcome::Failed
            }
        }
    }

    async fn unpack(&self, bytes: Vec<u8>) -> Result<usize> {
        let _scratch = Scratch::new(vec![self.paths.archive_path.clone()]);
        if let Some(parent) = self.paths.archive_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.paths.archive_path, bytes).await?;

        let archive = self.paths.archive_path.clone();
        let dest = self.paths.session_dir.clone();
        let limits = self.limits;
        let report =
            tokio::task::spawn_blocking(move || safe_extract_archive(&archive, &dest, limits))
                .await
                .map_err(|e| Error::External(format!("extract task failed: {e}")))??;
        Ok(report.extracted_files.len())
    }

    /// Drop the session everywhere after an authentication failure.
    ///
    /// The remote delete is best-effort; the local directory is removed either way.
    pub async fn invalidate(&self) {
        let _gate = self.gate.lock().await;

        if let Some(store) = self.store.as_ref() {
            match self.bounded("delete session archive", store.delete(&self.key)).await {
                Ok(()) => info!(key = %self.key, "session cleared from remote store"),
                Err(e) => warn!("failed to clear remote session: {e}"),
            }
        }

        if self.paths.session_dir.exists() {
            match tokio::fs::remove_dir_all(&self.paths.session_dir).await {
                Ok(()) => info!("local session cleared"),
                Err(e) => warn!(
                    dir = %self.paths.session_dir.display(),
                    "failed to clear local session: {e}"
                ),
            }
        }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout {
                op,
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

/// Temporary artifacts removed when the guard drops.
struct Scratch {
    paths: Vec<PathBuf>,
}

impl Scratch {
    fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        for p in &self.paths {
            remove_path(p);
        }
    }
}

fn remove_path(p: &Path) {
    let res = match std::fs::symlink_metadata(p) {
        Ok(md) if md.is_dir() => std::fs::remove_dir_all(p),
        Ok(_) => std::fs::remove_file(p),
        Err(_) => return,
    };
    if let Err(e) = res {
        warn!(path = %p.display(), "failed to remove temporary artifact: {e}");
    }
}
