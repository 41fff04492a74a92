//! # ftp: FTP/FTPS client engine
//!
//! Protocol coverage:
//! - **RFC 959**: control/data connections, multi-line replies
//! - **RFC 2228 / 4217**: AUTH TLS, PBSZ, PROT P (explicit FTPS)
//! - **RFC 2428**: EPSV / EPRT (IPv6)
//! - **RFC 3659**: MLSD, SIZE
//! - **RFC 2389**: FEAT
//!
//! Architecture:
//! - `types`: data model and configuration
//! - `error`: error taxonomy
//! - `protocol`: reply assembler + command/reply codec
//! - `tls`: rustls connector shared by control and data connections
//! - `connection`: TCP connect + welcome banner
//! - `client`: `ControlChannel` (login, TLS upgrade, CWD/PWD, listing)
//! - `directory`: MKD, RMD, DELE, RNFR/RNTO
//! - `parser`: MLSD and LIST grammars
//! - `transfer`: data channel (PASV/EPSV/PORT/EPRT, chunked streaming)
//! - `engine`: per-transfer state machine
//! - `local`: local filesystem seam
//! - `pool`: idle worker sessions
//! - `queue`: bounded transfer scheduler and handles
//! - `events`: observer events
//! - `service`: `SessionManager` façade
//! - `profiles`: saved connection profiles

pub mod types;
pub mod error;
pub mod protocol;
pub mod tls;
pub mod connection;
pub mod client;
pub mod directory;
pub mod parser;
pub mod transfer;
pub mod engine;
pub mod local;
pub mod pool;
pub mod queue;
pub mod events;
pub mod service;
pub mod profiles;

pub use client::ControlChannel;
pub use engine::TransferEngine;
pub use error::{FailureCause, FtpError, FtpErrorKind, FtpResult};
pub use events::{EventSink, SessionEvent};
pub use local::{LocalEntry, LocalFs, TokioFs};
pub use profiles::{ConnectionProfile, ProfileBook};
pub use queue::{TransferHandle, TransferQueue};
pub use service::{FolderUploadError, SessionManager};
pub use transfer::{DataChannel, DataConnector};
pub use types::*;
