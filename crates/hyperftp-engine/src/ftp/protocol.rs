//! Low-level FTP command/reply codec (RFC 959 §4.2).
//!
//! Handles:
//! - Sending commands terminated with `\r\n`
//! - Reassembling single-line and multi-line replies
//! - Parsing the 3-digit reply code

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::FtpReply;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Longest control line we accept before treating the peer as broken.
const MAX_LINE: usize = 8192;

// ─── Reply reassembly ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssemblerState {
    /// Waiting for the first line of a reply.
    Idle,
    /// Inside `NNN-` ... waiting for `NNN `.
    Continuation { code: u16 },
}

/// Line-at-a-time state machine that turns control lines into replies.
///
/// ```text
/// 220-Welcome to my FTP server     opens a multi-line reply
///  any text, even 230 or 220-      continuation, ignored for framing
/// 220 End of greeting              closes it (same code + space)
/// ```
#[derive(Debug)]
pub struct ReplyAssembler {
    state: AssemblerState,
    lines: Vec<String>,
}

impl Default for ReplyAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyAssembler {
    pub fn new() -> Self {
        Self {
            state: AssemblerState::Idle,
            lines: Vec::new(),
        }
    }

    /// Whether a reply is partially assembled.
    pub fn in_progress(&self) -> bool {
        self.state != AssemblerState::Idle
    }

    /// Feed one line (without CRLF). Returns the reply once it is complete.
    pub fn push_line(&mut self, line: &str) -> FtpResult<Option<FtpReply>> {
        match self.state {
            AssemblerState::Idle => {
                let code = parse_code(line)?;
                match line.as_bytes().get(3) {
                    Some(b'-') => {
                        self.lines.push(line.to_string());
                        self.state = AssemblerState::Continuation { code };
                        Ok(None)
                    }
                    None | Some(b' ') => Ok(Some(FtpReply {
                        code,
                        lines: vec![line.to_string()],
                    })),
                    Some(_) => Err(FtpError::protocol(format!(
                        "Malformed reply line: '{}'",
                        line
                    ))),
                }
            }
            AssemblerState::Continuation { code } => {
                self.lines.push(line.to_string());
                if is_terminator(line, code) {
                    let final_code = parse_code(line)?;
                    self.state = AssemblerState::Idle;
                    let lines = std::mem::take(&mut self.lines);
                    Ok(Some(FtpReply {
                        code: final_code,
                        lines,
                    }))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

/// `NNN ` or a bare `NNN` with the opening code ends a multi-line reply.
fn is_terminator(line: &str, code: u16) -> bool {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return false;
    }
    let same_code = line[..3].parse::<u16>().map(|c| c == code).unwrap_or(false);
    same_code && matches!(bytes.get(3), None | Some(b' '))
}

/// Parse the 3-digit reply code from the start of a line.
pub fn parse_code(line: &str) -> FtpResult<u16> {
    let digits = line
        .get(..3)
        .filter(|d| d.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| FtpError::protocol(format!("Invalid reply code in: '{}'", line)))?;
    let code = digits
        .parse::<u16>()
        .map_err(|_| FtpError::protocol(format!("Invalid reply code in: '{}'", line)))?;
    if !(100..600).contains(&code) {
        return Err(FtpError::protocol(format!("Reply code out of range: {}", code)));
    }
    Ok(code)
}

/// Read one complete reply from any buffered reader.
pub async fn read_reply<R>(reader: &mut R) -> FtpResult<FtpReply>
where
    R: AsyncBufRead + Unpin,
{
    let mut assembler = ReplyAssembler::new();
    let mut raw = Vec::with_capacity(128);
    loop {
        raw.clear();
        let n = reader.read_until(b'\n', &mut raw).await?;
        if n == 0 {
            return Err(FtpError::disconnected("Server closed connection"));
        }
        if raw.len() > MAX_LINE {
            return Err(FtpError::protocol("Reply line too long"));
        }
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
        if line.is_empty() && !assembler.in_progress() {
            // Stray blank line between replies.
            continue;
        }
        if let Some(reply) = assembler.push_line(line)? {
            return Ok(reply);
        }
    }
}

// ─── Control stream ──────────────────────────────────────────────────

/// Plain TCP or TLS-wrapped control connection.
pub enum ControlStream {
    Plain(BufReader<TcpStream>),
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
}

/// The FTP command/reply codec.
pub struct FtpCodec {
    stream: ControlStream,
    reply_timeout: Duration,
}

impl FtpCodec {
    /// Create a codec from a plain TCP stream.
    pub fn from_tcp(stream: TcpStream, reply_timeout: Duration) -> Self {
        Self {
            stream: ControlStream::Plain(BufReader::new(stream)),
            reply_timeout,
        }
    }

    /// Create a codec from a TLS-wrapped TCP stream.
    pub fn from_tls(stream: TlsStream<TcpStream>, reply_timeout: Duration) -> Self {
        Self {
            stream: ControlStream::Tls(Box::new(BufReader::new(stream))),
            reply_timeout,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, ControlStream::Tls(_))
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    /// Give back the plain socket for a TLS handshake.
    ///
    /// Fails if the server already sent bytes past the `234` reply: those
    /// would otherwise be read as if they were protected.
    pub fn into_plain(self) -> FtpResult<TcpStream> {
        match self.stream {
            ControlStream::Plain(reader) => {
                if !reader.buffer().is_empty() {
                    return Err(FtpError::tls(
                        "Unexpected data after AUTH TLS reply",
                    ));
                }
                Ok(reader.into_inner())
            }
            ControlStream::Tls(_) => Err(FtpError::tls("Control connection is already TLS")),
        }
    }

    /// Send a raw FTP command (CRLF is appended here).
    pub async fn send_command(&mut self, cmd: &str) -> FtpResult<()> {
        let line = format!("{}\r\n", cmd);
        match &mut self.stream {
            ControlStream::Plain(r) => {
                let w = r.get_mut();
                w.write_all(line.as_bytes()).await?;
                w.flush().await?;
            }
            ControlStream::Tls(r) => {
                let w = r.get_mut();
                w.write_all(line.as_bytes()).await?;
                w.flush().await?;
            }
        }
        if cmd.starts_with("PASS ") {
            log::trace!(">>> PASS ****");
        } else {
            log::trace!(">>> {}", cmd);
        }
        Ok(())
    }

    /// Read a complete FTP reply, bounded by the reply timeout.
    pub async fn read_response(&mut self) -> FtpResult<FtpReply> {
        self.read_response_within(self.reply_timeout).await
    }

    pub async fn read_response_within(&mut self, limit: Duration) -> FtpResult<FtpReply> {
        let fut = async {
            match &mut self.stream {
                ControlStream::Plain(r) => read_reply(r).await,
                ControlStream::Tls(r) => read_reply(&mut **r).await,
            }
        };
        let reply = tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| FtpError::timeout("No reply from server"))??;
        log::trace!(
            "<<< {}",
            reply.lines.last().map(String::as_str).unwrap_or_default()
        );
        Ok(reply)
    }

    /// Wait until reply bytes are buffered, without consuming them.
    ///
    /// Safe to drop at any point: `fill_buf` keeps what it has read.
    pub async fn wait_readable(&mut self) -> FtpResult<()> {
        let limit = self.reply_timeout;
        let fut = async {
            match &mut self.stream {
                ControlStream::Plain(r) => r.fill_buf().await.map(|b| b.len()),
                ControlStream::Tls(r) => r.fill_buf().await.map(|b| b.len()),
            }
        };
        let buffered = tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| FtpError::timeout("No reply from server"))??;
        if buffered == 0 {
            return Err(FtpError::disconnected("Server closed connection"));
        }
        Ok(())
    }

    /// Send a command and return the reply.
    pub async fn execute(&mut self, cmd: &str) -> FtpResult<FtpReply> {
        self.send_command(cmd).await?;
        self.read_response().await
    }

    /// Shut the socket down (best effort).
    pub async fn shutdown(&mut self) {
        let _ = match &mut self.stream {
            ControlStream::Plain(r) => r.get_mut().shutdown().await,
            ControlStream::Tls(r) => r.get_mut().shutdown().await,
        };
    }
}
