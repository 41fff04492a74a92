//! Worker-session pool.
//!
//! FTP carries one transfer per control connection, so each running
//! transfer borrows its own authenticated `ControlChannel`. Finished
//! workers come back here; a worker whose control channel is no longer
//! usable is dropped instead.

use crate::ftp::client::ControlChannel;
use crate::ftp::error::FtpResult;
use crate::ftp::types::SessionConfig;
use tokio::sync::Mutex;

pub struct SessionPool {
    config: SessionConfig,
    idle: Mutex<Vec<ControlChannel>>,
    max_idle: usize,
}

impl SessionPool {
    pub fn new(config: SessionConfig, max_idle: usize) -> Self {
        Self {
            config,
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Take an idle worker (verified with NOOP) or open a new one.
    pub async fn checkout(&self) -> FtpResult<ControlChannel> {
        loop {
            let candidate = self.idle.lock().await.pop();
            let Some(mut worker) = candidate else {
                break;
            };
            if worker.is_usable() && worker.noop().await.is_ok() {
                log::debug!("Reusing worker session {}", worker.id);
                return Ok(worker);
            }
            log::debug!("Dropping stale worker session {}", worker.id);
            worker.quit().await;
        }

        log::debug!("Opening worker session to {}", self.config.address());
        ControlChannel::open(self.config.clone()).await
    }

    /// Return a worker after its transfer.
    pub async fn checkin(&self, mut worker: ControlChannel) {
        if !worker.is_usable() {
            log::debug!("Worker session {} not returned: {:?}", worker.id, worker.state());
            return;
        }
        let mut idle = self.idle.lock().await;
        if idle.len() < self.max_idle {
            idle.push(worker);
            return;
        }
        drop(idle);
        worker.quit().await;
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// QUIT every idle worker.
    pub async fn close_all(&self) {
        let workers: Vec<ControlChannel> = self.idle.lock().await.drain(..).collect();
        let count = workers.len();
        for mut worker in workers {
            worker.quit().await;
        }
        if count > 0 {
            log::info!("Closed {} idle worker sessions", count);
        }
    }
}
