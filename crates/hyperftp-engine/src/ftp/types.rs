//! Shared types for the engine: session configuration, listing entries,
//! transfer tasks and control-channel replies.

use crate::ftp::error::FtpError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ─── Connection / Session ────────────────────────────────────────────

/// Security mode for the control and data channels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SecurityMode {
    /// Plain-text FTP.
    #[default]
    Plain,
    /// Explicit FTPS. Starts plain, upgrades via AUTH TLS, data protected with PROT P.
    ExplicitTls,
}

/// How the data connection is set up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum DataChannelMode {
    /// Server listens (PASV / EPSV), client connects out.
    #[default]
    Passive,
    /// Client listens (PORT / EPRT), server connects in.
    Active,
}

/// Login credentials. Anonymous login is an explicit mode rather than a
/// magic username.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum Credentials {
    Anonymous,
    Login { username: String, password: String },
}

impl Credentials {
    pub const ANONYMOUS_USER: &'static str = "anonymous";
    pub const ANONYMOUS_PASSWORD: &'static str = "anonymous@";

    pub fn login(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Login {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        match self {
            Self::Anonymous => Self::ANONYMOUS_USER,
            Self::Login { username, .. } => username,
        }
    }

    pub fn password(&self) -> &str {
        match self {
            Self::Anonymous => Self::ANONYMOUS_PASSWORD,
            Self::Login { password, .. } => password,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::Anonymous
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => write!(f, "Anonymous"),
            Self::Login { username, .. } => f
                .debug_struct("Login")
                .field("username", username)
                .field("password", &"***")
                .finish(),
        }
    }
}

/// Configuration for one logical session (browsing channel plus the
/// worker channels opened for transfers).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub security: SecurityMode,
    #[serde(default)]
    pub data_mode: DataChannelMode,
    /// TCP connect timeout for the control connection.
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Maximum wait for a single control-channel reply.
    #[serde(default = "default_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Maximum wait while opening a data connection.
    #[serde(default = "default_timeout_ms")]
    pub data_timeout_ms: u64,
    /// Accept self-signed / untrusted certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Send OPTS UTF8 ON when the server advertises it.
    #[serde(default = "default_true")]
    pub utf8: bool,
}

fn default_port() -> u16 {
    21
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, port: u16, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port,
            credentials,
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_millis(self.data_timeout_ms)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            credentials: Credentials::Anonymous,
            security: SecurityMode::Plain,
            data_mode: DataChannelMode::Passive,
            connect_timeout_ms: default_timeout_ms(),
            command_timeout_ms: default_timeout_ms(),
            data_timeout_ms: default_timeout_ms(),
            accept_invalid_certs: false,
            utf8: true,
        }
    }
}

/// Observable state of a session's control connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Failed,
    Disconnected,
}

/// Parsed FEAT response (only the facts the engine acts on).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFeatures {
    /// `false` when FEAT was not answered at all.
    pub probed: bool,
    pub mlsd: bool,
    pub size: bool,
    pub utf8: bool,
    pub epsv: bool,
    pub raw: Vec<String>,
}

// ─── Directory Listing ───────────────────────────────────────────────

/// Type of a remote filesystem entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Directory,
    /// Symbolic link whose target kind is not known.
    Symlink,
}

/// Modification time of a remote entry. Listings that omit the year or use
/// a malformed value keep the server's text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RemoteTimestamp {
    Parsed(DateTime<Utc>),
    Raw(String),
}

/// One entry from a directory listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub name: String,
    pub kind: EntryKind,
    /// Size in bytes; only meaningful for files.
    pub size: u64,
    pub modified: Option<RemoteTimestamp>,
}

impl RemoteEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Options for listing a directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    /// Glob pattern applied to entry names (e.g. `*.txt`).
    #[serde(default)]
    pub filter: Option<String>,
    /// Show hidden ("dot") entries.
    #[serde(default = "default_true")]
    pub show_hidden: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            filter: None,
            show_hidden: true,
        }
    }
}

// ─── Transfer ────────────────────────────────────────────────────────

/// Direction of a file transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Life-cycle of a transfer task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum TransferState {
    Pending,
    Opening,
    Streaming,
    Finalizing,
    Succeeded,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Opening | Self::Streaming | Self::Finalizing)
    }
}

/// Snapshot of one upload or download.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTask {
    pub id: String,
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    /// Absolute path on the server.
    pub remote_path: String,
    /// Fixed when the task is created.
    pub total_bytes: Option<u64>,
    pub bytes_transferred: u64,
    pub state: TransferState,
    pub error: Option<FtpError>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferTask {
    pub fn new(
        direction: TransferDirection,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        total_bytes: Option<u64>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            total_bytes,
            bytes_transferred: 0,
            state: TransferState::Pending,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Final path component of the remote path.
    pub fn remote_name(&self) -> &str {
        self.remote_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.remote_path)
    }
}

/// Configuration for the transfer scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferQueueConfig {
    /// Maximum number of transfers running at once.
    #[serde(default = "default_concurrent")]
    pub max_concurrent: usize,
    /// Chunk size for reads/writes (bytes).
    #[serde(default = "default_chunk")]
    pub chunk_size: usize,
    /// Idle worker sessions kept open between transfers.
    #[serde(default = "default_concurrent")]
    pub max_idle_sessions: usize,
}

fn default_concurrent() -> usize {
    4
}
fn default_chunk() -> usize {
    8192
}

impl Default for TransferQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_concurrent(),
            chunk_size: default_chunk(),
            max_idle_sessions: default_concurrent(),
        }
    }
}

// ─── FTP Reply ───────────────────────────────────────────────────────

/// A complete control-channel reply (possibly multi-line).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl FtpReply {
    /// Full reply text (all lines joined).
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Text of the terminating line without its code.
    pub fn message(&self) -> &str {
        self.lines
            .last()
            .map(|l| l.get(4..).unwrap_or("").trim())
            .unwrap_or("")
    }

    /// 1xx
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// 2xx
    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 3xx
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// 4xx / 5xx
    pub fn is_negative(&self) -> bool {
        self.code >= 400
    }
}
