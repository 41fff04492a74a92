//! Data-channel management for FTP transfers.
//!
//! Passive (PASV / EPSV) and active (PORT / EPRT) set-up are two branches of
//! [`DataConnector::negotiate`]. The order on the wire is always:
//!
//! 1. negotiate (passive: connect out; active: listen + announce)
//! 2. send the transfer verb (STOR / RETR / MLSD / LIST)
//! 3. read its 1xx reply
//! 4. [`DataConnector::establish`]: accept (active) and TLS-wrap (PROT P)
//!
//! Step 4 comes last because servers only accept or handshake on the data
//! socket once the verb has been answered.

use crate::ftp::client::ControlChannel;
use crate::ftp::error::{FailureCause, FtpError, FtpResult};
use crate::ftp::tls::TlsContext;
use crate::ftp::types::{DataChannelMode, TransferState};
use lazy_static::lazy_static;
use regex::Regex;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;

lazy_static! {
    static ref PASV_ADDR: Regex =
        Regex::new(r"(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3}),(\d{1,3})").unwrap();
    static ref EPSV_PORT: Regex = Regex::new(r"\|\|\|(\d+)\|").unwrap();
}

// ─── Negotiation ─────────────────────────────────────────────────────

/// A data connection that has been negotiated but not yet handed over.
pub enum DataConnector {
    /// Already connected to the server's advertised port.
    Passive(TcpStream),
    /// Listening; the server connects in after the transfer verb.
    Active(TcpListener),
}

impl DataConnector {
    /// Negotiate a data connection on `control` according to its
    /// configured mode.
    pub async fn negotiate(control: &mut ControlChannel) -> FtpResult<Self> {
        // Fails in TLS mode until PROT P has been sent.
        control.data_tls()?;
        let limit = control.config().data_timeout();

        match control.config().data_mode {
            DataChannelMode::Passive => {
                let addr = passive_address(control).await?;
                log::debug!("Passive data connection to {}", addr);
                let tcp = timeout(limit, TcpStream::connect(addr))
                    .await
                    .map_err(|_| FtpError::data_channel(format!("Data connect to {} timed out", addr)))?
                    .map_err(|e| FtpError::data_channel(format!("Data connect to {}: {}", addr, e)))?;
                Ok(Self::Passive(tcp))
            }
            DataChannelMode::Active => {
                // Listen on the interface the control connection uses, so
                // the announced address is one the server can reach.
                let bind = SocketAddr::new(control.local_addr().ip(), 0);
                let listener = TcpListener::bind(bind)
                    .await
                    .map_err(|e| FtpError::data_channel(format!("Bind {}: {}", bind, e)))?;
                let local = listener
                    .local_addr()
                    .map_err(|e| FtpError::data_channel(format!("Listener address: {}", e)))?;

                let cmd = port_command(local);
                let reply = control.execute(&cmd).await?;
                if !reply.is_completion() {
                    return Err(FtpError::data_channel(format!(
                        "{} rejected: {}",
                        cmd,
                        reply.text()
                    ))
                    .with_code(reply.code));
                }
                log::debug!("Active data listener on {}", local);
                Ok(Self::Active(listener))
            }
        }
    }

    /// Finish the connection once the server has answered the transfer
    /// verb with 1xx.
    pub async fn establish(self, tls: Option<&TlsContext>, limit: Duration) -> FtpResult<DataChannel> {
        let tcp = match self {
            Self::Passive(tcp) => tcp,
            Self::Active(listener) => {
                let (tcp, peer) = timeout(limit, listener.accept())
                    .await
                    .map_err(|_| FtpError::data_channel("Server did not connect to the data port"))?
                    .map_err(|e| FtpError::data_channel(format!("Accept data connection: {}", e)))?;
                log::debug!("Server connected from {}", peer);
                tcp
            }
        };

        let stream = match tls {
            Some(ctx) => {
                let tls = timeout(limit, ctx.wrap(tcp, "Data"))
                    .await
                    .map_err(|_| FtpError::tls("Data TLS handshake timed out"))??;
                DataStream::Tls(Box::new(tls))
            }
            None => DataStream::Plain(tcp),
        };

        Ok(DataChannel {
            stream,
            io_timeout: limit,
        })
    }
}

/// PASV (EPSV over IPv6) and the address to connect to.
async fn passive_address(control: &mut ControlChannel) -> FtpResult<SocketAddr> {
    let peer = control.peer_addr();

    if peer.is_ipv6() {
        let reply = control.execute("EPSV").await?;
        if reply.code != 229 {
            return Err(FtpError::data_channel(format!("EPSV rejected: {}", reply.text()))
                .with_code(reply.code));
        }
        let port = parse_epsv_reply(&reply.text())?;
        return Ok(SocketAddr::new(peer.ip(), port));
    }

    let reply = control.execute("PASV").await?;
    if reply.code != 227 {
        return Err(
            FtpError::data_channel(format!("PASV rejected: {}", reply.text())).with_code(reply.code)
        );
    }
    let advertised = parse_pasv_reply(&reply.text())?;
    Ok(resolve_passive(advertised, peer.ip()))
}

/// Parse `h1,h2,h3,h4,p1,p2` out of a 227 reply.
pub fn parse_pasv_reply(text: &str) -> FtpResult<SocketAddr> {
    let caps = PASV_ADDR
        .captures(text)
        .ok_or_else(|| FtpError::data_channel(format!("Cannot parse PASV reply: {}", text)))?;

    let mut nums = [0u8; 6];
    for (i, n) in nums.iter_mut().enumerate() {
        *n = caps[i + 1]
            .parse::<u8>()
            .map_err(|_| FtpError::data_channel(format!("PASV value out of range: {}", text)))?;
    }

    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = u16::from(nums[4]) * 256 + u16::from(nums[5]);
    Ok(SocketAddr::new(ip, port))
}

/// Parse `(|||port|)` out of a 229 reply.
pub fn parse_epsv_reply(text: &str) -> FtpResult<u16> {
    let caps = EPSV_PORT
        .captures(text)
        .ok_or_else(|| FtpError::data_channel(format!("Cannot parse EPSV reply: {}", text)))?;
    caps[1]
        .parse::<u16>()
        .map_err(|_| FtpError::data_channel(format!("EPSV port out of range: {}", text)))
}

/// Servers behind NAT often advertise an unroutable address; connect to
/// the control peer instead.
fn resolve_passive(advertised: SocketAddr, peer: IpAddr) -> SocketAddr {
    let replace = match (advertised.ip(), peer) {
        (IpAddr::V4(adv), _) if adv.is_unspecified() => true,
        (IpAddr::V4(adv), IpAddr::V4(p)) => {
            (adv.is_private() || adv.is_loopback()) && !(p.is_private() || p.is_loopback())
        }
        _ => false,
    };
    if replace {
        log::debug!(
            "PASV advertised {}, using control peer {} instead",
            advertised.ip(),
            peer
        );
        SocketAddr::new(peer, advertised.port())
    } else {
        advertised
    }
}

/// `PORT h1,h2,h3,h4,p1,p2` for IPv4, `EPRT |2|addr|port|` for IPv6.
fn port_command(local: SocketAddr) -> String {
    match local.ip() {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!(
                "PORT {},{},{},{},{},{}",
                o[0],
                o[1],
                o[2],
                o[3],
                local.port() / 256,
                local.port() % 256
            )
        }
        IpAddr::V6(v6) => format!("EPRT |2|{}|{}|", v6, local.port()),
    }
}

// ─── Stream ──────────────────────────────────────────────────────────

/// Plain or TLS-wrapped data socket.
pub enum DataStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for DataStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            // Many servers close data connections without close_notify. The
            // completion reply decides whether everything arrived.
            Self::Tls(s) => match Pin::new(&mut **s).poll_read(cx, buf) {
                Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    log::debug!("Data connection closed without close_notify");
                    Poll::Ready(Ok(()))
                }
                other => other,
            },
        }
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(&mut **s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(&mut **s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(&mut **s).poll_shutdown(cx),
        }
    }
}

// ─── Channel ─────────────────────────────────────────────────────────

/// An open data connection. `close()` and `abort()` consume it.
pub struct DataChannel {
    stream: DataStream,
    io_timeout: Duration,
}

impl DataChannel {
    /// Copy `source` to the server in chunks of `chunk_size`, calling
    /// `on_progress` with the running total after every chunk.
    ///
    /// Each chunk is filled completely before it is written, so only the
    /// last one can be short.
    pub async fn send_stream<R, F>(
        &mut self,
        source: &mut R,
        chunk_size: usize,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> FtpResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
        F: FnMut(u64),
    {
        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut total = 0u64;
        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FtpError::cancelled()),
                r = read_chunk(source, &mut buf) => r.map_err(local_error)?,
            };
            if n == 0 {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FtpError::cancelled()),
                r = timeout(self.io_timeout, self.stream.write_all(&buf[..n])) => match r {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(network_error(&e)),
                    Err(_) => return Err(stalled()),
                },
            }
            total += n as u64;
            on_progress(total);
        }
        Ok(total)
    }

    /// Copy the data connection into `sink` until the server closes it.
    pub async fn receive_stream<W, F>(
        &mut self,
        sink: &mut W,
        chunk_size: usize,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> FtpResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
        F: FnMut(u64),
    {
        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut total = 0u64;
        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FtpError::cancelled()),
                r = timeout(self.io_timeout, self.stream.read(&mut buf)) => match r {
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => return Err(network_error(&e)),
                    Err(_) => return Err(stalled()),
                },
            };
            if n == 0 {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FtpError::cancelled()),
                r = sink.write_all(&buf[..n]) => r.map_err(local_error)?,
            }
            total += n as u64;
            on_progress(total);
        }
        sink.flush().await.map_err(local_error)?;
        Ok(total)
    }

    /// Read everything the server sends (listings).
    pub async fn read_to_end(&mut self) -> FtpResult<Vec<u8>> {
        let mut body = Vec::new();
        timeout(self.io_timeout, self.stream.read_to_end(&mut body))
            .await
            .map_err(|_| stalled())?
            .map_err(|e| network_error(&e))?;
        Ok(body)
    }

    /// Graceful close: flush and shut down (TLS close_notify included).
    pub async fn close(mut self) -> FtpResult<()> {
        match timeout(self.io_timeout, self.stream.shutdown()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Ok(Err(e)) => Err(network_error(&e)),
            Err(_) => Err(stalled()),
        }
    }

    /// Drop the connection without a shutdown handshake.
    pub fn abort(self) {
        log::debug!("Data connection aborted");
    }
}

/// Fill `buf` unless the source ends first.
async fn read_chunk<R>(source: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn local_error(e: io::Error) -> FtpError {
    FtpError::transfer(TransferState::Streaming, FailureCause::Local, e.to_string())
}

fn network_error(e: &io::Error) -> FtpError {
    FtpError::transfer(
        TransferState::Streaming,
        FailureCause::Network,
        format!("Data connection: {}", e),
    )
}

fn stalled() -> FtpError {
    FtpError::transfer(
        TransferState::Streaming,
        FailureCause::Network,
        "Data connection stalled",
    )
}
