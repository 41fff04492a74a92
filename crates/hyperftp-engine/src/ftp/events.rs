//! Observer events pushed to whoever drives the session.

use crate::ftp::error::FtpError;
use crate::ftp::types::{ConnectionState, RemoteEntry, TransferState};
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    Connection {
        state: ConnectionState,
        host: String,
        detail: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    DirectoryListed {
        path: String,
        entries: Vec<RemoteEntry>,
    },
    #[serde(rename_all = "camelCase")]
    TransferProgress {
        id: String,
        bytes_transferred: u64,
        total_bytes: Option<u64>,
    },
    /// Sent exactly once per task, after its last progress event.
    #[serde(rename_all = "camelCase")]
    TransferFinished {
        id: String,
        state: TransferState,
        error: Option<FtpError>,
    },
}

/// Cheap, cloneable event publisher. A sink without a receiver drops
/// events silently.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                log::trace!("Event receiver dropped");
            }
        }
    }
}
