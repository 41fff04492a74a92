//! Transfer scheduler: runs engines as spawned tasks, at most
//! `max_concurrent` at a time, and keeps a handle per transfer.

use crate::ftp::engine::TransferEngine;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::events::EventSink;
use crate::ftp::local::LocalFs;
use crate::ftp::pool::SessionPool;
use crate::ftp::types::*;
use std::sync::Arc;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

/// Read-only view of a dispatched transfer plus its cancel switch.
#[derive(Debug, Clone)]
pub struct TransferHandle {
    id: String,
    rx: watch::Receiver<TransferTask>,
    cancel: CancellationToken,
}

impl TransferHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> TransferTask {
        self.rx.borrow().clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the terminal state.
    pub async fn wait(&self) -> TransferTask {
        let mut rx = self.rx.clone();
        loop {
            {
                let task = rx.borrow_and_update();
                if task.state.is_terminal() {
                    return task.clone();
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }
}

pub struct TransferQueue {
    config: TransferQueueConfig,
    semaphore: Arc<Semaphore>,
    pool: Arc<SessionPool>,
    local: Arc<dyn LocalFs>,
    events: EventSink,
    handles: RwLock<Vec<TransferHandle>>,
}

impl TransferQueue {
    pub fn new(
        config: TransferQueueConfig,
        pool: Arc<SessionPool>,
        local: Arc<dyn LocalFs>,
        events: EventSink,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            semaphore,
            pool,
            local,
            events,
            handles: RwLock::new(Vec::new()),
        }
    }

    /// Spawn `task`. It waits for a free slot, borrows a worker session and
    /// runs; the handle is returned immediately.
    pub async fn dispatch(&self, task: TransferTask) -> TransferHandle {
        let cancel = CancellationToken::new();
        let (engine, rx) = TransferEngine::new(
            task,
            self.events.clone(),
            cancel.clone(),
            self.local.clone(),
            self.config.chunk_size,
        );
        let handle = TransferHandle {
            id: engine.id(),
            rx,
            cancel: cancel.clone(),
        };
        self.handles.write().await.push(handle.clone());

        let semaphore = self.semaphore.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    engine.abandon(FtpError::cancelled());
                    return;
                }
                permit = semaphore.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => {
                        engine.abandon(FtpError::disconnected("Transfer queue closed"));
                        return;
                    }
                },
            };

            let worker = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    engine.abandon(FtpError::cancelled());
                    return;
                }
                worker = pool.checkout() => worker,
            };

            match worker {
                Ok(mut control) => {
                    engine.run(&mut control).await;
                    pool.checkin(control).await;
                }
                Err(e) => {
                    engine.abandon(e);
                }
            }
        });

        handle
    }

    pub async fn get(&self, id: &str) -> Option<TransferHandle> {
        self.handles.read().await.iter().find(|h| h.id == id).cloned()
    }

    pub async fn cancel(&self, id: &str) -> FtpResult<()> {
        let handle = self
            .get(id)
            .await
            .ok_or_else(|| FtpError::not_found(format!("Transfer {} not found", id)))?;
        handle.cancel();
        Ok(())
    }

    pub async fn cancel_all(&self) {
        for handle in self.handles.read().await.iter() {
            handle.cancel();
        }
    }

    /// Snapshots in dispatch order.
    pub async fn list(&self) -> Vec<TransferTask> {
        self.handles.read().await.iter().map(TransferHandle::snapshot).collect()
    }

    /// Forget finished transfers. Returns how many were removed.
    pub async fn clear_finished(&self) -> usize {
        let mut handles = self.handles.write().await;
        let before = handles.len();
        handles.retain(|h| !h.rx.borrow().state.is_terminal());
        before - handles.len()
    }

    /// Wait until every dispatched transfer has reached a terminal state.
    pub async fn wait_all(&self) -> Vec<TransferTask> {
        let handles: Vec<TransferHandle> = self.handles.read().await.clone();
        let mut done = Vec::with_capacity(handles.len());
        for handle in handles {
            done.push(handle.wait().await);
        }
        done
    }

    pub fn config(&self) -> &TransferQueueConfig {
        &self.config
    }
}
