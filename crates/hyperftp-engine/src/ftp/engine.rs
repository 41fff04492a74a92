//! Single-transfer state machine.
//!
//! ```text
//! Pending → Opening → Streaming → Finalizing → Succeeded
//!    └─────────┴──────────┴───────────┴──────→ Failed | Cancelled
//! ```
//!
//! The engine owns its [`TransferTask`]; the task lives inside a
//! `watch` channel so handles can read snapshots without touching it.
//! Every exit path closes or aborts the data connection, and if the
//! server's completion reply is still outstanding the control channel is
//! brought back in step with ABOR before the worker is handed back.
//! Cancellation never interrupts a command/reply exchange: it is checked
//! between exchanges and while idle-waiting for the completion reply.

use crate::ftp::client::{command_line, ControlChannel};
use crate::ftp::error::{FailureCause, FtpError, FtpResult};
use crate::ftp::events::{EventSink, SessionEvent};
use crate::ftp::local::LocalFs;
use crate::ftp::transfer::{DataChannel, DataConnector};
use crate::ftp::types::*;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub struct TransferEngine {
    task: watch::Sender<TransferTask>,
    events: EventSink,
    cancel: CancellationToken,
    local: Arc<dyn LocalFs>,
    chunk_size: usize,
    /// A 1xx was received and the final reply has not been read yet.
    awaiting_reply: bool,
    /// The download created (or truncated) its local file.
    created_local: bool,
}

impl TransferEngine {
    pub fn new(
        task: TransferTask,
        events: EventSink,
        cancel: CancellationToken,
        local: Arc<dyn LocalFs>,
        chunk_size: usize,
    ) -> (Self, watch::Receiver<TransferTask>) {
        let (tx, rx) = watch::channel(task);
        (
            Self {
                task: tx,
                events,
                cancel,
                local,
                chunk_size: chunk_size.max(1),
                awaiting_reply: false,
                created_local: false,
            },
            rx,
        )
    }

    pub fn id(&self) -> String {
        self.task.borrow().id.clone()
    }

    pub fn state(&self) -> TransferState {
        self.task.borrow().state
    }

    pub fn snapshot(&self) -> TransferTask {
        self.task.borrow().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run the transfer to completion on `control`.
    pub async fn run(mut self, control: &mut ControlChannel) -> TransferTask {
        let direction = self.task.borrow().direction;
        let outcome = if self.cancel.is_cancelled() {
            Err(FtpError::cancelled())
        } else {
            match direction {
                TransferDirection::Upload => self.upload(control).await,
                TransferDirection::Download => self.download(control).await,
            }
        };

        if outcome.is_err() {
            self.clean_up(control).await;
        }
        self.finish(outcome)
    }

    /// Terminate without ever touching a control channel (cancelled while
    /// queued, or no worker session could be opened).
    pub fn abandon(self, reason: FtpError) -> TransferTask {
        self.finish(Err(reason))
    }

    // ─── Upload ──────────────────────────────────────────────────

    async fn upload(&mut self, control: &mut ControlChannel) -> FtpResult<u64> {
        let (local_path, remote_path) = self.paths();
        self.transition(TransferState::Opening);

        let mut source = self
            .guard(self.local.open_read(&local_path))
            .await?
            .map_err(|e| FtpError::local_io(&e, local_path.display().to_string()))?;

        let line = command_line("STOR", Some(&remote_path))?;
        let mut data = self.open_data(control, &line).await?;

        self.transition(TransferState::Streaming);
        let sent = {
            let progress = self.progress_reporter();
            data.send_stream(&mut source, self.chunk_size, &self.cancel, progress)
                .await
        };
        let sent = match sent {
            Ok(n) => n,
            Err(e) => {
                data.abort();
                return Err(e);
            }
        };

        // The server only sees end-of-file once the data connection closes.
        self.transition(TransferState::Finalizing);
        data.close().await?;
        self.complete(control, &line).await?;
        Ok(sent)
    }

    // ─── Download ────────────────────────────────────────────────

    async fn download(&mut self, control: &mut ControlChannel) -> FtpResult<u64> {
        let (local_path, remote_path) = self.paths();
        self.transition(TransferState::Opening);

        let line = command_line("RETR", Some(&remote_path))?;
        let connector = self.negotiate(control, &line).await?;

        let mut sink = self
            .guard(self.local.create(&local_path))
            .await?
            .map_err(|e| FtpError::local_io(&e, local_path.display().to_string()))?;
        self.created_local = true;

        let mut data = self.establish(control, connector).await?;

        self.transition(TransferState::Streaming);
        let received = {
            let progress = self.progress_reporter();
            data.receive_stream(&mut sink, self.chunk_size, &self.cancel, progress)
                .await
        };
        let received = match received {
            Ok(n) => n,
            Err(e) => {
                data.abort();
                return Err(e);
            }
        };
        drop(sink);

        self.transition(TransferState::Finalizing);
        if let Err(e) = data.close().await {
            // Everything was received; the completion reply has the last word.
            log::debug!("Closing download data connection: {}", e);
        }
        self.complete(control, &line).await?;
        Ok(received)
    }

    // ─── Steps ───────────────────────────────────────────────────

    /// Negotiate the data connection, then send `line` and wait for 1xx.
    ///
    /// Control exchanges always run to completion; cancellation is only
    /// looked at between them, so a reply is never left half read.
    async fn negotiate(&mut self, control: &mut ControlChannel, line: &str) -> FtpResult<DataConnector> {
        let connector = DataConnector::negotiate(control).await?;
        self.check_cancelled()?;
        let reply = control.execute(line).await?;
        if !reply.is_preliminary() {
            return Err(FtpError::from_reply(line, reply.code, &reply.text()));
        }
        self.awaiting_reply = true;
        self.check_cancelled()?;
        Ok(connector)
    }

    async fn establish(
        &mut self,
        control: &mut ControlChannel,
        connector: DataConnector,
    ) -> FtpResult<DataChannel> {
        let tls = control.data_tls()?;
        let limit = control.config().data_timeout();
        self.guard(connector.establish(tls.as_ref(), limit)).await?
    }

    async fn open_data(&mut self, control: &mut ControlChannel, line: &str) -> FtpResult<DataChannel> {
        let connector = self.negotiate(control, line).await?;
        self.establish(control, connector).await
    }

    /// Read the final reply; only 2xx (226/250) counts as success.
    async fn complete(&mut self, control: &mut ControlChannel, line: &str) -> FtpResult<()> {
        // Waiting for the first reply byte can be abandoned; reading it cannot.
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(FtpError::cancelled()),
            ready = control.reply_pending() => ready?,
        }
        let reply = control.read_reply().await?;
        self.awaiting_reply = false;
        if reply.is_completion() {
            Ok(())
        } else {
            Err(FtpError::from_reply(line, reply.code, &reply.text()))
        }
    }

    /// Race `fut` against cancellation. Only for local and data-socket work.
    async fn guard<F: Future>(&self, fut: F) -> FtpResult<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FtpError::cancelled()),
            out = fut => Ok(out),
        }
    }

    fn check_cancelled(&self) -> FtpResult<()> {
        if self.cancel.is_cancelled() {
            Err(FtpError::cancelled())
        } else {
            Ok(())
        }
    }

    fn progress_reporter(&self) -> impl FnMut(u64) + '_ {
        let (id, total) = {
            let t = self.task.borrow();
            (t.id.clone(), t.total_bytes)
        };
        let task = &self.task;
        let events = &self.events;
        let mut last = 0u64;
        move |bytes| {
            if bytes <= last {
                return;
            }
            last = bytes;
            task.send_modify(|t| t.bytes_transferred = bytes);
            events.emit(SessionEvent::TransferProgress {
                id: id.clone(),
                bytes_transferred: bytes,
                total_bytes: total,
            });
        }
    }

    fn transition(&self, state: TransferState) {
        self.task.send_modify(|t| t.state = state);
        log::debug!("Transfer {} → {:?}", self.task.borrow().id, state);
    }

    fn paths(&self) -> (std::path::PathBuf, String) {
        let t = self.task.borrow();
        (t.local_path.clone(), t.remote_path.clone())
    }

    // ─── Cleanup / terminal state ────────────────────────────────

    async fn clean_up(&mut self, control: &mut ControlChannel) {
        if self.created_local {
            let (local_path, _) = self.paths();
            if let Err(e) = self.local.remove_file(&local_path).await {
                log::warn!("Could not remove partial file {}: {}", local_path.display(), e);
            }
        }

        // The completion reply is the only one that can still be outstanding.
        if self.awaiting_reply && control.is_usable() {
            if let Err(e) = control.abort_and_resync().await {
                log::warn!("Worker session {} discarded: {}", control.id, e);
            }
        }
        self.awaiting_reply = false;
    }

    fn finish(self, outcome: FtpResult<u64>) -> TransferTask {
        let phase = self.state();
        let (state, error) = match outcome {
            Ok(_) => (TransferState::Succeeded, None),
            Err(e) if e.is_cancelled() => (TransferState::Cancelled, None),
            Err(e) => (TransferState::Failed, Some(self.describe(e, phase))),
        };

        let mut task = self.task.borrow().clone();
        task.state = state;
        task.error = error.clone();
        task.finished_at = Some(Utc::now());

        match &error {
            Some(e) => log::warn!("Transfer {} failed: {}", task.id, e),
            None => log::info!(
                "Transfer {} {:?} ({} bytes): {}",
                task.id,
                state,
                task.bytes_transferred,
                task.remote_path
            ),
        }
        // Event first: anyone woken by the terminal snapshot will find it
        // already queued.
        self.events.emit(SessionEvent::TransferFinished {
            id: task.id.clone(),
            state,
            error,
        });
        self.task.send_replace(task.clone());
        task
    }

    /// Attach phase, cause and the affected path.
    fn describe(&self, e: FtpError, phase: TransferState) -> FtpError {
        let phase = if phase == TransferState::Pending {
            TransferState::Opening
        } else {
            phase
        };
        let e = e.into_transfer(phase);
        if e.path.is_some() {
            return e;
        }
        let t = self.task.borrow();
        match e.cause {
            Some(FailureCause::Local) => e.with_path(t.local_path.display().to_string()),
            _ => e.with_path(t.remote_path.clone()),
        }
    }
}
