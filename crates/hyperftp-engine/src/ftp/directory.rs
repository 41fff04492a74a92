//! Remote file-system management: MKD, RMD, DELE, RNFR/RNTO.
//!
//! Every negative reply surfaces as a `RemoteOp` error carrying the
//! command and the server's text verbatim; nothing is retried.

use crate::ftp::client::{command_line, ControlChannel};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::FtpReply;

impl ControlChannel {
    // ─── MKD ─────────────────────────────────────────────────────

    /// Create a directory. Returns the path the server reports, or `path`
    /// when the 257 reply carries none.
    pub async fn make_directory(&mut self, path: &str) -> FtpResult<String> {
        let reply = self.remote_op("MKD", path).await?;
        let text = reply.message();
        if let Some(start) = text.find('"') {
            if let Some(end) = text[start + 1..].find('"') {
                return Ok(text[start + 1..start + 1 + end].to_string());
            }
        }
        Ok(path.to_string())
    }

    // ─── RMD ─────────────────────────────────────────────────────

    /// Remove an (empty) directory.
    pub async fn remove_directory(&mut self, path: &str) -> FtpResult<()> {
        self.remote_op("RMD", path).await.map(|_| ())
    }

    // ─── DELE ────────────────────────────────────────────────────

    pub async fn delete_file(&mut self, path: &str) -> FtpResult<()> {
        self.remote_op("DELE", path).await.map(|_| ())
    }

    // ─── RNFR / RNTO ────────────────────────────────────────────

    /// Rename or move. RNFR must be answered with 350 before RNTO is sent.
    pub async fn rename(&mut self, from: &str, to: &str) -> FtpResult<()> {
        let line = command_line("RNFR", Some(from))?;
        let rnfr = self.execute(&line).await?;
        if rnfr.code != 350 {
            return Err(FtpError::remote_op(line, rnfr.code, rnfr.text()).with_path(from));
        }
        self.remote_op("RNTO", to).await.map(|_| ())
    }

    async fn remote_op(&mut self, verb: &str, path: &str) -> FtpResult<FtpReply> {
        let line = command_line(verb, Some(path))?;
        let reply = self.execute(&line).await?;
        if reply.is_completion() {
            Ok(reply)
        } else {
            Err(FtpError::remote_op(line, reply.code, reply.text()).with_path(path))
        }
    }
}

// ─── Path helpers ────────────────────────────────────────────────────

/// Join a remote directory and a child name with exactly one `/`.
pub fn join_remote(dir: &str, name: &str) -> String {
    if name.starts_with('/') {
        return name.to_string();
    }
    if dir.is_empty() {
        return name.to_string();
    }
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}
