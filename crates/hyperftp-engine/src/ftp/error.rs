//! FTP-specific error type.

use crate::ftp::types::TransferState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised engine error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// FTP reply code that triggered the error, if any.
    pub code: Option<u16>,
    /// Control command whose reply was negative.
    pub command: Option<String>,
    /// Transfer phase the error occurred in.
    pub phase: Option<TransferState>,
    pub cause: Option<FailureCause>,
    /// Local or remote path the operation was working on.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FtpErrorKind {
    /// Host unreachable, refused, timed out, or bad welcome.
    Connect,
    /// Credentials rejected.
    Auth,
    /// AUTH TLS / PBSZ / PROT or handshake failure.
    Tls,
    /// Negative reply to a directory or file management command.
    RemoteOp,
    /// PASV/EPSV/PORT/EPRT negotiation or data connect failure.
    DataChannel,
    /// A transfer failed while opening, streaming or finalizing.
    Transfer,
    /// A listing body could not be parsed at all.
    Parse,
    /// Server broke the reply grammar.
    Protocol,
    /// Control reply did not arrive in time.
    Timeout,
    /// Control connection is gone; reconnect required.
    Disconnected,
    /// Operation cancelled by the caller.
    Cancelled,
    /// Config / parameter validation error.
    InvalidConfig,
    /// No session is connected.
    NotConnected,
    /// Unknown transfer id or local path.
    NotFound,
}

/// Where a transfer failure originated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FailureCause {
    /// Socket error on the control or data connection.
    Network,
    /// Local filesystem error (disk full, permission denied, ...).
    Local,
    /// The server answered with a negative reply.
    Remote,
}

pub type FtpResult<T> = Result<T, FtpError>;

// ── Construction helpers ─────────────────────────────────────────────

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            command: None,
            phase: None,
            cause: None,
            path: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_phase(mut self, phase: TransferState) -> Self {
        self.phase = Some(phase);
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn connect(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Connect, msg)
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Auth, msg)
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Tls, msg)
    }

    /// Negative reply to `command`; the server text is kept verbatim.
    pub fn remote_op(command: impl Into<String>, code: u16, reply: impl Into<String>) -> Self {
        let mut e = Self::new(FtpErrorKind::RemoteOp, reply).with_code(code);
        e.command = Some(command.into());
        e
    }

    pub fn data_channel(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::DataChannel, msg)
    }

    pub fn transfer(phase: TransferState, cause: FailureCause, msg: impl Into<String>) -> Self {
        let mut e = Self::new(FtpErrorKind::Transfer, msg).with_phase(phase);
        e.cause = Some(cause);
        e
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Parse, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Protocol, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Timeout, msg)
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Disconnected, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(FtpErrorKind::Cancelled, "Operation cancelled")
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, msg)
    }

    pub fn not_connected() -> Self {
        Self::new(FtpErrorKind::NotConnected, "Not connected to a server")
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::NotFound, msg)
    }

    /// Local filesystem failure, kept apart from network failures.
    pub fn local_io(e: &std::io::Error, path: impl Into<String>) -> Self {
        let mut err = Self::new(FtpErrorKind::Transfer, e.to_string()).with_path(path);
        err.cause = Some(FailureCause::Local);
        err
    }

    /// Re-label an error as a transfer failure in `phase`, keeping
    /// code/command detail and deriving the cause from the original kind.
    pub fn into_transfer(mut self, phase: TransferState) -> Self {
        if self.kind == FtpErrorKind::Cancelled {
            return self;
        }
        if self.cause.is_none() {
            self.cause = Some(match self.kind {
                FtpErrorKind::RemoteOp => FailureCause::Remote,
                _ if self.code.map(|c| c >= 400).unwrap_or(false) => FailureCause::Remote,
                _ => FailureCause::Network,
            });
        }
        if self.phase.is_none() {
            self.phase = Some(phase);
        }
        if !self.requires_reconnect() {
            self.kind = FtpErrorKind::Transfer;
        }
        self
    }

    /// Control-level failures invalidate the whole session.
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self.kind,
            FtpErrorKind::Disconnected | FtpErrorKind::Timeout | FtpErrorKind::Protocol
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FtpErrorKind::Cancelled
    }

    /// Classify a negative reply to `command`.
    pub fn from_reply(command: &str, code: u16, text: &str) -> Self {
        match code {
            421 => {
                let mut e = Self::disconnected(format!("Server closing connection: {}", text))
                    .with_code(code);
                if !command.is_empty() {
                    e.command = Some(command.to_string());
                }
                e
            }
            425 | 426 => {
                let mut e = Self::data_channel(text).with_code(code);
                e.command = Some(command.to_string());
                e
            }
            430 | 530 => Self::auth(text).with_code(code),
            _ => Self::remote_op(command, code, text),
        }
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[FTP {:?}", self.kind)?;
        if let Some(code) = self.code {
            write!(f, " {}", code)?;
        }
        write!(f, "]")?;
        if let Some(ref cmd) = self.command {
            write!(f, " {}:", cmd)?;
        }
        if let Some(phase) = self.phase {
            write!(f, " ({:?}", phase)?;
            if let Some(cause) = self.cause {
                write!(f, ", {:?}", cause)?;
            }
            write!(f, ")")?;
        }
        write!(f, " {}", self.message)?;
        if let Some(ref path) = self.path {
            write!(f, " [{}]", path)?;
        }
        Ok(())
    }
}

impl std::error::Error for FtpError {}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(format!("I/O timeout: {}", e))
        } else {
            Self::disconnected(e.to_string())
        }
    }
}

impl From<FtpError> for String {
    fn from(e: FtpError) -> String {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_classification() {
        assert_eq!(FtpError::from_reply("PASS", 530, "Login incorrect").kind, FtpErrorKind::Auth);
        assert_eq!(FtpError::from_reply("RETR x", 425, "No data").kind, FtpErrorKind::DataChannel);
        let bye = FtpError::from_reply("NOOP", 421, "bye");
        assert!(bye.requires_reconnect());
        assert_eq!(bye.command.as_deref(), Some("NOOP"));

        let e = FtpError::from_reply("MKD docs", 550, "File exists");
        assert_eq!(e.kind, FtpErrorKind::RemoteOp);
        assert_eq!(e.command.as_deref(), Some("MKD docs"));
        assert_eq!(e.code, Some(550));
    }

    #[test]
    fn into_transfer_keeps_cause() {
        let e = FtpError::remote_op("STOR /a", 553, "denied").into_transfer(TransferState::Opening);
        assert_eq!(e.kind, FtpErrorKind::Transfer);
        assert_eq!(e.cause, Some(FailureCause::Remote));
        assert_eq!(e.phase, Some(TransferState::Opening));

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let local = FtpError::local_io(&io, "/tmp/x").into_transfer(TransferState::Streaming);
        assert_eq!(local.cause, Some(FailureCause::Local));
        assert_eq!(local.path.as_deref(), Some("/tmp/x"));

        let gone = FtpError::disconnected("eof").into_transfer(TransferState::Finalizing);
        assert!(gone.requires_reconnect());
        assert_eq!(gone.cause, Some(FailureCause::Network));
    }

    #[test]
    fn display_includes_detail() {
        let e = FtpError::remote_op("DELE a.txt", 550, "No such file").with_path("/pub/a.txt");
        let s = e.to_string();
        assert!(s.contains("550"));
        assert!(s.contains("DELE a.txt"));
        assert!(s.contains("/pub/a.txt"));
    }
}
