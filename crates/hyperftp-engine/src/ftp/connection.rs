//! TCP transport: establishes the FTP control connection.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::protocol::FtpCodec;
use crate::ftp::types::{FtpReply, SessionConfig};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// A freshly opened control connection.
pub struct Connected {
    pub codec: FtpCodec,
    pub banner: FtpReply,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

/// Open the control connection and read the welcome banner.
///
/// Socket failure, timeout, or a welcome other than 2xx is a `Connect`
/// error; the server may be sending `120` (ready in nnn minutes) first.
pub async fn connect(config: &SessionConfig) -> FtpResult<Connected> {
    let addr = config.address();

    let tcp = timeout(config.connect_timeout(), TcpStream::connect(&addr))
        .await
        .map_err(|_| FtpError::connect(format!("TCP connect to {} timed out", addr)))?
        .map_err(|e| FtpError::connect(format!("TCP connect to {}: {}", addr, e)))?;

    tcp.set_nodelay(true).ok();
    let peer_addr = tcp
        .peer_addr()
        .map_err(|e| FtpError::connect(format!("peer address of {}: {}", addr, e)))?;
    let local_addr = tcp
        .local_addr()
        .map_err(|e| FtpError::connect(format!("local address for {}: {}", addr, e)))?;

    let mut codec = FtpCodec::from_tcp(tcp, config.command_timeout());
    let mut banner = codec
        .read_response()
        .await
        .map_err(|e| FtpError::connect(format!("No welcome from {}: {}", addr, e.message)))?;
    if banner.code == 120 {
        log::info!("{} not ready yet: {}", addr, banner.message());
        banner = codec
            .read_response()
            .await
            .map_err(|e| FtpError::connect(format!("No welcome from {}: {}", addr, e.message)))?;
    }
    if !banner.is_completion() {
        return Err(FtpError::connect(format!(
            "Server refused connection: {}",
            banner.text()
        ))
        .with_code(banner.code));
    }

    log::info!("Connected to {} ({})", addr, peer_addr);
    Ok(Connected {
        codec,
        banner,
        peer_addr,
        local_addr,
    })
}
