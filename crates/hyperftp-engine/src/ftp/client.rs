//! Stateful control channel. Owns the command/reply connection.
//!
//! Lifecycle: `connect()` → `authenticate()` (AUTH TLS first in TLS mode)
//! → `upgrade_to_secure()` (PBSZ/PROT) → FEAT / OPTS UTF8 / TYPE I.
//!
//! Any I/O failure, timeout or grammar violation on the socket moves the
//! channel to `Disconnected`; from then on every call fails and the caller
//! has to build a new channel.

use crate::ftp::connection;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::parser;
use crate::ftp::protocol::FtpCodec;
use crate::ftp::tls::TlsContext;
use crate::ftp::transfer::DataConnector;
use crate::ftp::types::*;
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

/// Upper bound on replies discarded while resynchronising after ABOR.
const MAX_DRAINED_REPLIES: usize = 8;

/// A control connection to one server.
pub struct ControlChannel {
    pub id: String,
    codec: Option<FtpCodec>,
    config: SessionConfig,
    tls: Option<TlsContext>,
    authenticated: bool,
    data_protected: bool,
    state: ConnectionState,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    welcome: String,
    features: ServerFeatures,
    mlsd_rejected: bool,
    /// Last command line sent (PASS masked), for error context.
    last_command: Option<String>,
}

impl ControlChannel {
    /// Open the TCP connection and read the welcome banner.
    pub async fn connect(config: SessionConfig) -> FtpResult<Self> {
        if config.host.trim().is_empty() {
            return Err(FtpError::invalid_config("Host must not be empty"));
        }
        let connected = connection::connect(&config).await?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            codec: Some(connected.codec),
            config,
            tls: None,
            authenticated: false,
            data_protected: false,
            state: ConnectionState::Connected,
            peer_addr: connected.peer_addr,
            local_addr: connected.local_addr,
            welcome: connected.banner.text(),
            features: ServerFeatures::default(),
            mlsd_rejected: false,
            last_command: None,
        })
    }

    /// Connect, log in, protect data connections in TLS mode and apply
    /// the post-login settings. Used for browsing and worker sessions alike.
    pub async fn open(config: SessionConfig) -> FtpResult<Self> {
        let mut channel = Self::connect(config).await?;
        let credentials = channel.config.credentials.clone();
        channel.authenticate(&credentials).await?;
        if channel.config.security == SecurityMode::ExplicitTls {
            channel.upgrade_to_secure().await?;
        }
        channel.post_login().await?;
        Ok(channel)
    }

    // ─── Authentication / TLS ────────────────────────────────────

    /// USER / PASS login. In TLS mode the control connection is secured
    /// first so credentials never cross the wire in clear.
    pub async fn authenticate(&mut self, credentials: &Credentials) -> FtpResult<()> {
        if self.config.security == SecurityMode::ExplicitTls && self.tls.is_none() {
            self.secure_control().await?;
        }

        let user = self
            .execute(&command_line("USER", Some(credentials.username()))?)
            .await?;
        match user.code {
            230 => {}
            331 => {
                let pass = self
                    .execute(&command_line("PASS", Some(credentials.password()))?)
                    .await?;
                match pass.code {
                    230 | 202 => {}
                    332 => {
                        return Err(FtpError::auth("Server requires an account (ACCT)")
                            .with_code(pass.code))
                    }
                    _ => {
                        return Err(FtpError::auth(format!("Login failed: {}", pass.text()))
                            .with_code(pass.code))
                    }
                }
            }
            _ => {
                return Err(FtpError::auth(format!("USER rejected: {}", user.text()))
                    .with_code(user.code))
            }
        }

        self.authenticated = true;
        log::info!(
            "Logged in to {} as {}",
            self.config.address(),
            credentials.username()
        );
        Ok(())
    }

    /// `AUTH TLS` + handshake on the control connection.
    async fn secure_control(&mut self) -> FtpResult<()> {
        let reply = self.execute("AUTH TLS").await?;
        if reply.code != 234 {
            return Err(
                FtpError::tls(format!("AUTH TLS rejected: {}", reply.text())).with_code(reply.code)
            );
        }
        let result = self.handshake_control().await;
        if let Err(ref e) = result {
            self.invalidate(&e.message);
        }
        result
    }

    async fn handshake_control(&mut self) -> FtpResult<()> {
        let ctx = TlsContext::new(&self.config.host, self.config.accept_invalid_certs)?;
        let codec = self
            .codec
            .take()
            .ok_or_else(|| FtpError::disconnected("Control connection closed"))?;
        let reply_timeout = codec.reply_timeout();
        let tcp = codec.into_plain()?;
        let tls = ctx.wrap(tcp, "Control").await?;
        self.codec = Some(FtpCodec::from_tls(tls, reply_timeout));
        self.tls = Some(ctx);
        log::debug!("Control connection to {} secured", self.config.address());
        Ok(())
    }

    /// `PBSZ 0` + `PROT P`: every later data connection is TLS-wrapped.
    ///
    /// Only valid on a TLS control connection after authentication.
    pub async fn upgrade_to_secure(&mut self) -> FtpResult<()> {
        if self.tls.is_none() {
            return Err(FtpError::tls(
                "Control connection is not secured; AUTH TLS has not been negotiated",
            ));
        }
        if !self.authenticated {
            return Err(FtpError::tls("Data protection must follow authentication"));
        }
        for cmd in ["PBSZ 0", "PROT P"] {
            let reply = self.execute(cmd).await?;
            if !reply.is_completion() {
                return Err(
                    FtpError::tls(format!("{} rejected: {}", cmd, reply.text())).with_code(reply.code)
                );
            }
        }
        self.data_protected = true;
        Ok(())
    }

    /// TLS context for a new data connection, enforcing that PROT P
    /// came first in TLS mode.
    pub(crate) fn data_tls(&self) -> FtpResult<Option<TlsContext>> {
        match self.config.security {
            SecurityMode::Plain => Ok(None),
            SecurityMode::ExplicitTls if self.data_protected => Ok(self.tls.clone()),
            SecurityMode::ExplicitTls => Err(FtpError::tls(
                "Data connection requested before data protection (PROT P) was negotiated",
            )),
        }
    }

    // ─── Post-login ──────────────────────────────────────────────

    async fn post_login(&mut self) -> FtpResult<()> {
        self.features = self.probe_features().await?;
        if self.config.utf8 && self.features.utf8 {
            let _ = self.execute("OPTS UTF8 ON").await?;
        }
        self.set_binary().await
    }

    async fn probe_features(&mut self) -> FtpResult<ServerFeatures> {
        let reply = self.execute("FEAT").await?;
        if !reply.is_completion() {
            return Ok(ServerFeatures::default());
        }

        let raw: Vec<String> = reply
            .lines
            .iter()
            .skip(1)
            .filter(|l| !l.starts_with("211"))
            .map(|l| l.trim().to_uppercase())
            .collect();
        let has = |feat: &str| raw.iter().any(|l| l.starts_with(feat));

        Ok(ServerFeatures {
            probed: true,
            mlsd: has("MLSD") || has("MLST"),
            size: has("SIZE"),
            utf8: has("UTF8"),
            epsv: has("EPSV"),
            raw: raw.clone(),
        })
    }

    /// Switch to binary (TYPE I).
    pub async fn set_binary(&mut self) -> FtpResult<()> {
        self.expect_completion("TYPE", Some("I")).await.map(|_| ())
    }

    // ─── Commands ────────────────────────────────────────────────

    /// Issue `verb [args]` and return the raw reply, whatever its code.
    pub async fn issue_command(&mut self, verb: &str, args: Option<&str>) -> FtpResult<FtpReply> {
        let line = command_line(verb, args)?;
        self.execute(&line).await
    }

    /// Issue a command that must complete with 2xx; anything else becomes
    /// an error carrying the command and the server's reply.
    pub async fn expect_completion(&mut self, verb: &str, args: Option<&str>) -> FtpResult<FtpReply> {
        let line = command_line(verb, args)?;
        let reply = self.execute(&line).await?;
        if reply.is_completion() {
            Ok(reply)
        } else {
            Err(FtpError::from_reply(&line, reply.code, &reply.text()))
        }
    }

    pub(crate) async fn execute(&mut self, line: &str) -> FtpResult<FtpReply> {
        self.remember(line);
        let result = self.codec_mut()?.execute(line).await;
        self.observe(result)
    }

    pub(crate) async fn send(&mut self, line: &str) -> FtpResult<()> {
        self.remember(line);
        let result = self.codec_mut()?.send_command(line).await;
        if let Err(ref e) = result {
            self.invalidate(&e.message);
        }
        result
    }

    pub(crate) async fn read_reply(&mut self) -> FtpResult<FtpReply> {
        let result = self.codec_mut()?.read_response().await;
        self.observe(result)
    }

    async fn read_reply_within(&mut self, limit: Duration) -> FtpResult<FtpReply> {
        let result = self.codec_mut()?.read_response_within(limit).await;
        self.observe(result)
    }

    /// Resolves once the next reply has started to arrive. Dropping the
    /// future loses nothing, unlike dropping [`read_reply`](Self::read_reply).
    pub(crate) async fn reply_pending(&mut self) -> FtpResult<()> {
        let result = self.codec_mut()?.wait_readable().await;
        if let Err(ref e) = result {
            self.invalidate(&e.message);
        }
        result
    }

    fn remember(&mut self, line: &str) {
        let shown = if line.starts_with("PASS ") { "PASS ****" } else { line };
        self.last_command = Some(shown.to_string());
    }

    fn codec_mut(&mut self) -> FtpResult<&mut FtpCodec> {
        if self.state != ConnectionState::Connected {
            return Err(FtpError::disconnected(
                "Control connection is closed; reconnect required",
            ));
        }
        self.codec
            .as_mut()
            .ok_or_else(|| FtpError::disconnected("Control connection is closed; reconnect required"))
    }

    /// Track control-level failures: they end the session.
    fn observe(&mut self, result: FtpResult<FtpReply>) -> FtpResult<FtpReply> {
        match result {
            Ok(reply) if reply.code == 421 => {
                let command = self.last_command.clone().unwrap_or_default();
                let err = FtpError::from_reply(&command, reply.code, &reply.text());
                self.invalidate(&err.message);
                Err(err)
            }
            Ok(reply) => Ok(reply),
            Err(e) => {
                if e.requires_reconnect() {
                    self.invalidate(&e.message);
                }
                Err(e)
            }
        }
    }

    fn invalidate(&mut self, reason: &str) {
        if self.state == ConnectionState::Connected {
            log::warn!(
                "Control connection to {} lost: {}",
                self.config.address(),
                reason
            );
        }
        self.state = ConnectionState::Disconnected;
        self.codec = None;
    }

    // ─── Working directory ───────────────────────────────────────

    /// CWD, then confirm the new location with PWD.
    pub async fn change_directory(&mut self, path: &str) -> FtpResult<String> {
        self.expect_completion("CWD", Some(path)).await?;
        self.current_directory().await
    }

    /// Always asks the server (PWD); never answered from a local cache.
    pub async fn current_directory(&mut self) -> FtpResult<String> {
        let reply = self.expect_completion("PWD", None).await?;
        parse_pwd(&reply)
    }

    // ─── Listing ─────────────────────────────────────────────────

    /// Structured listing first, legacy listing as the fallback.
    pub async fn list_directory(&mut self, path: Option<&str>) -> FtpResult<Vec<RemoteEntry>> {
        if self.should_try_mlsd() {
            let attempt = match self.retrieve_listing("MLSD", path).await {
                Ok(body) => parser::parse_structured(&body),
                Err(e) => Err(e),
            };
            match attempt {
                Ok(entries) => return Ok(entries),
                Err(e) if e.requires_reconnect() => return Err(e),
                Err(e) => {
                    if matches!(e.code, Some(500) | Some(502) | Some(504)) {
                        self.mlsd_rejected = true;
                    }
                    log::debug!("MLSD unavailable ({}), falling back to LIST", e);
                }
            }
        }

        let body = self.retrieve_listing("LIST", path).await?;
        parser::parse_legacy(&body)
    }

    fn should_try_mlsd(&self) -> bool {
        !self.mlsd_rejected && (!self.features.probed || self.features.mlsd)
    }

    /// Run a listing command over a data connection and collect its body.
    async fn retrieve_listing(&mut self, verb: &str, path: Option<&str>) -> FtpResult<String> {
        let line = command_line(verb, path)?;
        let connector = DataConnector::negotiate(self).await?;

        let reply = self.execute(&line).await?;
        if reply.is_completion() {
            // Nothing to send: some servers skip the data connection for
            // an empty directory.
            return Ok(String::new());
        }
        if !reply.is_preliminary() {
            return Err(FtpError::from_reply(&line, reply.code, &reply.text()));
        }

        let tls = self.data_tls()?;
        let body = match connector.establish(tls.as_ref(), self.config.data_timeout()).await {
            Ok(mut data) => {
                let read = data.read_to_end().await;
                if let Err(e) = data.close().await {
                    log::debug!("Closing listing connection: {}", e);
                }
                read
            }
            Err(e) => Err(e),
        };

        let done = self.read_reply().await?;
        let body = body?;
        if !done.is_completion() {
            return Err(FtpError::from_reply(&line, done.code, &done.text()));
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    // ─── Misc ────────────────────────────────────────────────────

    /// Best-effort SIZE; `None` when the server does not answer 213.
    pub async fn size(&mut self, path: &str) -> FtpResult<Option<u64>> {
        let reply = self.issue_command("SIZE", Some(path)).await?;
        if reply.code != 213 {
            return Ok(None);
        }
        Ok(reply
            .message()
            .split_whitespace()
            .next()
            .and_then(|n| n.parse::<u64>().ok()))
    }

    /// Send a NOOP to keep the control connection alive.
    pub async fn noop(&mut self) -> FtpResult<()> {
        self.expect_completion("NOOP", None).await.map(|_| ())
    }

    /// Abort whatever is in flight and bring the reply stream back in step.
    ///
    /// After `ABOR` the server may send 426, 225, 226 or nothing, depending
    /// on how far the transfer had got. A `NOOP` goes out right behind it;
    /// everything up to its `200` is discarded. Only valid while the one
    /// outstanding reply is a transfer's completion reply, which is never 200.
    pub async fn abort_and_resync(&mut self) -> FtpResult<()> {
        let result = self.drain_after_abort().await;
        if let Err(ref e) = result {
            self.invalidate(&format!("resync after ABOR failed: {}", e.message));
        }
        result
    }

    async fn drain_after_abort(&mut self) -> FtpResult<()> {
        self.send("ABOR").await?;
        self.send("NOOP").await?;
        let limit = self.config.command_timeout().min(Duration::from_secs(10));
        for _ in 0..MAX_DRAINED_REPLIES {
            let reply = self.read_reply_within(limit).await?;
            if reply.code == 200 {
                log::debug!("Control channel {} resynchronised", self.id);
                return Ok(());
            }
            log::debug!("Discarding reply after ABOR: {}", reply.text());
        }
        Err(FtpError::protocol("Control channel did not resynchronise after ABOR"))
    }

    /// Gracefully close the session.
    pub async fn quit(&mut self) {
        if self.state == ConnectionState::Connected {
            let _ = self.execute("QUIT").await;
            if let Some(codec) = self.codec.as_mut() {
                codec.shutdown().await;
            }
            log::info!("Disconnected from {}", self.config.address());
        }
        self.state = ConnectionState::Disconnected;
        self.codec = None;
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_usable(&self) -> bool {
        self.state == ConnectionState::Connected && self.codec.is_some()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn features(&self) -> &ServerFeatures {
        &self.features
    }

    pub fn welcome(&self) -> &str {
        &self.welcome
    }

    pub fn is_secure(&self) -> bool {
        self.codec.as_ref().map(FtpCodec::is_tls).unwrap_or(false)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

/// Build `VERB args`, refusing line breaks that would smuggle a second
/// command onto the wire.
pub fn command_line(verb: &str, args: Option<&str>) -> FtpResult<String> {
    let line = match args {
        Some(a) if !a.is_empty() => format!("{} {}", verb, a),
        _ => verb.to_string(),
    };
    if line.contains(|c| c == '\r' || c == '\n') {
        return Err(FtpError::invalid_config(format!(
            "Line break in {} argument",
            verb
        )));
    }
    Ok(line)
}

/// Parse `257 "/some/path" is current` into the path. Embedded quotes are
/// doubled (`""`) per RFC 959.
pub fn parse_pwd(reply: &FtpReply) -> FtpResult<String> {
    let text = reply.message();
    let bad = || FtpError::parse(format!("Cannot parse PWD reply: {}", reply.text())).with_code(reply.code);
    let start = text.find('"').ok_or_else(bad)?;
    let mut path = String::new();
    let mut chars = text[start + 1..].chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                path.push('"');
                chars.next();
            } else {
                return Ok(path);
            }
        } else {
            path.push(c);
        }
    }
    Err(bad())
}
