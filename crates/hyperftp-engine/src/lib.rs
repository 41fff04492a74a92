//! # HyperFTP transfer-and-session engine
//!
//! FTP / explicit-FTPS client core: control channel, MLSD/LIST parsing,
//! passive and active data channels, and cancellable concurrent transfers
//! with progress reporting.

pub mod ftp;

pub use ftp::*;
