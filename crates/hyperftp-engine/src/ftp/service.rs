//! High-level orchestrator. Owns the session, its worker pool and the
//! transfer queue.
//!
//! All browsing commands go through one `ControlChannel` behind an async
//! mutex, so exchanges never interleave. Transfers run on worker sessions
//! and never hold that mutex.

use crate::ftp::client::ControlChannel;
use crate::ftp::directory::join_remote;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::events::{EventSink, SessionEvent};
use crate::ftp::local::{LocalFs, TokioFs};
use crate::ftp::pool::SessionPool;
use crate::ftp::queue::{TransferHandle, TransferQueue};
use crate::ftp::types::*;
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// One logical connection: the browsing channel plus everything needed
/// to run transfers next to it. Built fresh on every connect.
pub struct Session {
    pub id: String,
    config: SessionConfig,
    control: Mutex<ControlChannel>,
    pool: Arc<SessionPool>,
    queue: TransferQueue,
}

impl Session {
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

/// A folder upload that stopped early. `dispatched` holds the transfers
/// that were already started; they keep running.
#[derive(Debug)]
pub struct FolderUploadError {
    pub error: FtpError,
    pub dispatched: Vec<TransferHandle>,
}

impl From<FtpError> for FolderUploadError {
    fn from(error: FtpError) -> Self {
        Self {
            error,
            dispatched: Vec::new(),
        }
    }
}

impl std::fmt::Display for FolderUploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} transfers already dispatched)",
            self.error,
            self.dispatched.len()
        )
    }
}

impl std::error::Error for FolderUploadError {}

pub struct SessionManager {
    session: RwLock<Option<Arc<Session>>>,
    state: RwLock<ConnectionState>,
    queue_config: TransferQueueConfig,
    local: Arc<dyn LocalFs>,
    events: EventSink,
}

impl SessionManager {
    pub fn new(queue_config: TransferQueueConfig, events: EventSink) -> Self {
        Self::with_local_fs(queue_config, events, Arc::new(TokioFs))
    }

    pub fn with_local_fs(
        queue_config: TransferQueueConfig,
        events: EventSink,
        local: Arc<dyn LocalFs>,
    ) -> Self {
        Self {
            session: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            queue_config,
            local,
            events,
        }
    }

    // ─── Connection lifecycle ────────────────────────────────────

    /// Open a new session, replacing any existing one. Returns the
    /// server's welcome text.
    pub async fn connect(&self, config: SessionConfig) -> FtpResult<String> {
        if self.session.read().await.is_some() {
            self.disconnect().await;
        }

        info!("Connecting to {}", config.address());
        self.set_state(ConnectionState::Connecting, &config.host, None)
            .await;

        let control = match ControlChannel::open(config.clone()).await {
            Ok(c) => c,
            Err(e) => {
                self.set_state(ConnectionState::Failed, &config.host, Some(e.to_string()))
                    .await;
                return Err(e);
            }
        };
        let welcome = control.welcome().to_string();

        let pool = Arc::new(SessionPool::new(
            config.clone(),
            self.queue_config.max_idle_sessions,
        ));
        let queue = TransferQueue::new(
            self.queue_config.clone(),
            pool.clone(),
            self.local.clone(),
            self.events.clone(),
        );
        let session = Arc::new(Session {
            id: control.id.clone(),
            config: config.clone(),
            control: Mutex::new(control),
            pool,
            queue,
        });

        *self.session.write().await = Some(session);
        self.set_state(ConnectionState::Connected, &config.host, None)
            .await;
        Ok(welcome)
    }

    /// Cancel running transfers, QUIT every connection and forget the
    /// session.
    pub async fn disconnect(&self) {
        let Some(session) = self.session.write().await.take() else {
            return;
        };
        session.queue.cancel_all().await;
        session.queue.wait_all().await;
        session.control.lock().await.quit().await;
        session.pool.close_all().await;
        info!("Session {} closed", session.id);
        self.set_state(ConnectionState::Disconnected, &session.config.host, None)
            .await;
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    pub async fn welcome(&self) -> FtpResult<String> {
        let session = self.session().await?;
        let control = session.control.lock().await;
        Ok(control.welcome().to_string())
    }

    async fn session(&self) -> FtpResult<Arc<Session>> {
        self.session
            .read()
            .await
            .clone()
            .ok_or_else(FtpError::not_connected)
    }

    async fn set_state(&self, state: ConnectionState, host: &str, detail: Option<String>) {
        *self.state.write().await = state;
        self.events.emit(SessionEvent::Connection {
            state,
            host: host.to_string(),
            detail,
        });
    }

    /// A control-level failure ends the session; the caller has to
    /// reconnect. Transfers already running keep their own workers.
    async fn check<T>(&self, session: &Session, result: FtpResult<T>) -> FtpResult<T> {
        if let Err(e) = &result {
            self.note_failure(session, e).await;
        }
        result
    }

    async fn note_failure(&self, session: &Session, e: &FtpError) {
        if !e.requires_reconnect() {
            return;
        }
        let mut current = self.session.write().await;
        if current.as_ref().map(|s| s.id == session.id).unwrap_or(false) {
            *current = None;
            drop(current);
            log::warn!("Session {} lost: {}", session.id, e);
            self.set_state(
                ConnectionState::Failed,
                &session.config.host,
                Some(format!("{} (reconnect required)", e)),
            )
            .await;
        }
    }

    // ─── Navigation / listing ────────────────────────────────────

    pub async fn current_directory(&self) -> FtpResult<String> {
        let session = self.session().await?;
        let result = session.control.lock().await.current_directory().await;
        self.check(&session, result).await
    }

    pub async fn change_directory(&self, path: &str) -> FtpResult<String> {
        let session = self.session().await?;
        let result = session.control.lock().await.change_directory(path).await;
        self.check(&session, result).await
    }

    /// List `path` (or the working directory) and publish the result.
    pub async fn list_directory(
        &self,
        path: Option<&str>,
        options: &ListOptions,
    ) -> FtpResult<Vec<RemoteEntry>> {
        let pattern = match options.filter.as_deref() {
            Some(f) => Some(glob::Pattern::new(f).map_err(|e| {
                FtpError::invalid_config(format!("Invalid filter '{}': {}", f, e))
            })?),
            None => None,
        };

        let session = self.session().await?;
        let result = {
            let mut control = session.control.lock().await;
            list_with_path(&mut control, path).await
        };
        let (listed, mut entries) = self.check(&session, result).await?;

        if let Some(pattern) = pattern {
            entries.retain(|e| pattern.matches(&e.name));
        }
        if !options.show_hidden {
            entries.retain(|e| !e.name.starts_with('.'));
        }

        self.events.emit(SessionEvent::DirectoryListed {
            path: listed,
            entries: entries.clone(),
        });
        Ok(entries)
    }

    // ─── Remote file management ──────────────────────────────────

    pub async fn make_directory(&self, path: &str) -> FtpResult<String> {
        let session = self.session().await?;
        let result = session.control.lock().await.make_directory(path).await;
        self.check(&session, result).await
    }

    pub async fn remove_directory(&self, path: &str) -> FtpResult<()> {
        let session = self.session().await?;
        let result = session.control.lock().await.remove_directory(path).await;
        self.check(&session, result).await
    }

    pub async fn delete_file(&self, path: &str) -> FtpResult<()> {
        let session = self.session().await?;
        let result = session.control.lock().await.delete_file(path).await;
        self.check(&session, result).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> FtpResult<()> {
        let session = self.session().await?;
        let result = session.control.lock().await.rename(from, to).await;
        self.check(&session, result).await
    }

    // ─── Transfers ───────────────────────────────────────────────

    /// Upload one local file into the current remote directory, under
    /// `remote_name` or the local file name.
    pub async fn upload(&self, local: &Path, remote_name: Option<&str>) -> FtpResult<TransferHandle> {
        let meta = self
            .local
            .metadata(local)
            .await
            .map_err(|e| FtpError::local_io(&e, local.display().to_string()))?;
        if meta.is_dir {
            return Err(FtpError::invalid_config(format!(
                "{} is a directory; use upload_folder",
                local.display()
            )));
        }
        let name = match remote_name {
            Some(n) => n.to_string(),
            None => meta.name.clone(),
        };

        let session = self.session().await?;
        let result = session.control.lock().await.current_directory().await;
        let cwd = self.check(&session, result).await?;

        let task = TransferTask::new(
            TransferDirection::Upload,
            local,
            join_remote(&cwd, &name),
            Some(meta.size),
        );
        Ok(session.queue.dispatch(task).await)
    }

    /// Download `remote_name` (relative to the current remote directory,
    /// or absolute) to `local`.
    pub async fn download(&self, remote_name: &str, local: &Path) -> FtpResult<TransferHandle> {
        let session = self.session().await?;
        let result = {
            let mut control = session.control.lock().await;
            resolve_with_size(&mut control, remote_name).await
        };
        let (remote_path, total) = self.check(&session, result).await?;

        let task = TransferTask::new(TransferDirection::Download, local, remote_path, total);
        Ok(session.queue.dispatch(task).await)
    }

    /// Upload `local_dir` as a new directory below the current remote one.
    ///
    /// Directories are created and entered one by one through the browsing
    /// channel, which stays locked for the whole walk; files become
    /// ordinary transfers addressed by absolute path. Whatever happens,
    /// the working directory is set back to where it was. If the walk
    /// stops early the error still carries every transfer already started.
    pub async fn upload_folder(
        &self,
        local_dir: &Path,
    ) -> Result<Vec<TransferHandle>, FolderUploadError> {
        let session = self.session().await?;
        let mut control = session.control.lock().await;

        let result = control.current_directory().await;
        let original = self.check(&session, result).await?;

        let mut handles = Vec::new();
        let walk = self
            .walk_folder(&session, &mut control, local_dir, &original, &mut handles)
            .await;

        let restore = if control.is_usable() {
            control.change_directory(&original).await.map(|_| ())
        } else {
            Err(FtpError::disconnected("Control connection lost during folder upload"))
        };
        drop(control);

        let failure = match (walk, restore) {
            (Err(e), _) => {
                log::warn!("Folder upload of {} stopped: {}", local_dir.display(), e);
                e
            }
            (Ok(()), Err(e)) => e,
            (Ok(()), Ok(())) => return Ok(handles),
        };
        self.note_failure(&session, &failure).await;
        Err(FolderUploadError {
            error: failure,
            dispatched: handles,
        })
    }

    async fn walk_folder(
        &self,
        session: &Session,
        control: &mut ControlChannel,
        root: &Path,
        original: &str,
        handles: &mut Vec<TransferHandle>,
    ) -> FtpResult<()> {
        // (local directory, absolute remote parent)
        let mut pending: Vec<(PathBuf, String)> = vec![(root.to_path_buf(), original.to_string())];

        while let Some((dir, parent)) = pending.pop() {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    FtpError::invalid_config(format!("{} has no directory name", dir.display()))
                })?;

            control.change_directory(&parent).await?;
            if let Err(e) = control.make_directory(&name).await {
                if e.requires_reconnect() {
                    return Err(e);
                }
                log::warn!("MKD {} in {} failed (continuing): {}", name, parent, e);
            }
            let remote_dir = control.change_directory(&name).await?;

            let children = self
                .local
                .read_dir(&dir)
                .await
                .map_err(|e| FtpError::local_io(&e, dir.display().to_string()))?;

            let mut subdirs = Vec::new();
            for child in children {
                if child.is_dir {
                    subdirs.push((child.path, remote_dir.clone()));
                } else {
                    let task = TransferTask::new(
                        TransferDirection::Upload,
                        child.path,
                        join_remote(&remote_dir, &child.name),
                        Some(child.size),
                    );
                    handles.push(session.queue.dispatch(task).await);
                }
            }
            // Reverse so the stack pops them in name order.
            pending.extend(subdirs.into_iter().rev());
        }
        Ok(())
    }

    pub async fn cancel(&self, transfer_id: &str) -> FtpResult<()> {
        self.session().await?.queue.cancel(transfer_id).await
    }

    pub async fn transfer(&self, transfer_id: &str) -> FtpResult<TransferHandle> {
        self.session()
            .await?
            .queue
            .get(transfer_id)
            .await
            .ok_or_else(|| FtpError::not_found(format!("Transfer {} not found", transfer_id)))
    }

    pub async fn transfers(&self) -> FtpResult<Vec<TransferTask>> {
        Ok(self.session().await?.queue.list().await)
    }

    pub async fn clear_finished(&self) -> FtpResult<usize> {
        Ok(self.session().await?.queue.clear_finished().await)
    }

    /// Wait for every transfer dispatched so far.
    pub async fn wait_all(&self) -> FtpResult<Vec<TransferTask>> {
        Ok(self.session().await?.queue.wait_all().await)
    }

    pub async fn idle_workers(&self) -> FtpResult<usize> {
        Ok(self.session().await?.pool.idle_count().await)
    }
}

/// List `path` and report which absolute directory was listed.
async fn list_with_path(
    control: &mut ControlChannel,
    path: Option<&str>,
) -> FtpResult<(String, Vec<RemoteEntry>)> {
    let listed = match path {
        Some(p) if p.starts_with('/') => p.to_string(),
        Some(p) => join_remote(&control.current_directory().await?, p),
        None => control.current_directory().await?,
    };
    let entries = control.list_directory(path).await?;
    Ok((listed, entries))
}

async fn resolve_with_size(
    control: &mut ControlChannel,
    remote_name: &str,
) -> FtpResult<(String, Option<u64>)> {
    let remote_path = if remote_name.starts_with('/') {
        remote_name.to_string()
    } else {
        join_remote(&control.current_directory().await?, remote_name)
    };
    let total = if control.features().size || !control.features().probed {
        control.size(&remote_path).await?
    } else {
        None
    };
    Ok((remote_path, total))
}
