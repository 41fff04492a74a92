//! In-process FTP server for integration tests.
//!
//! Keeps an in-memory tree, records every command it receives and counts
//! the data connections it currently holds open. With `tls` set it answers
//! `AUTH TLS` with a self-signed certificate and protects data connections
//! after `PROT P`.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{
    split, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines,
    ReadHalf, WriteHalf,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use hyperftp_engine::{Credentials, SecurityMode, SessionConfig};

#[derive(Debug, Clone)]
pub struct MockOptions {
    /// Refuse USER on a plain connection.
    pub require_tls: bool,
    /// Answer FEAT; without it the client has to try MLSD blindly.
    pub feat: bool,
    /// Support MLSD (and advertise it in FEAT).
    pub mlsd: bool,
    /// STOR of these names is refused with 553.
    pub reject_stor: Vec<String>,
    /// RETR of these names trickles data forever.
    pub endless: Vec<String>,
    /// Answer this exact command line with 421 and hang up.
    pub hangup_on: Option<String>,
    /// Offer `AUTH TLS` and `PROT P`.
    pub tls: bool,
    /// Drop data connections without sending a TLS close_notify.
    pub skip_close_notify: bool,
    /// Sit on these verbs for a while before answering.
    pub slow_replies: Vec<(String, Duration)>,
    /// Hold back the 226 after a finished transfer.
    pub slow_completion: Option<Duration>,
    /// Pause after every chunk received for STOR.
    pub stor_throttle: Option<Duration>,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            require_tls: false,
            feat: true,
            mlsd: true,
            reject_stor: Vec::new(),
            endless: Vec::new(),
            hangup_on: None,
            tls: false,
            skip_close_notify: false,
            slow_replies: Vec::new(),
            slow_completion: None,
            stor_throttle: None,
        }
    }
}

struct Shared {
    opts: MockOptions,
    tls: Option<TlsAcceptor>,
    /// Absolute path → `None` for directories, file contents otherwise.
    fs: Mutex<BTreeMap<String, Option<Vec<u8>>>>,
    log: Mutex<Vec<String>>,
    live_data: AtomicUsize,
    control_connections: AtomicUsize,
}

pub struct MockServer {
    pub addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::with_options(MockOptions::default()).await
    }

    pub async fn with_options(opts: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut fs = BTreeMap::new();
        fs.insert("/".to_string(), None);
        let tls = opts.tls.then(self_signed_acceptor);
        let shared = Arc::new(Shared {
            tls,
            opts,
            fs: Mutex::new(fs),
            log: Mutex::new(Vec::new()),
            live_data: AtomicUsize::new(0),
            control_connections: AtomicUsize::new(0),
        });

        let accept_shared = shared.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_shared.control_connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, accept_shared.clone()));
            }
        });

        Self { addr, shared }
    }

    pub fn config(&self, credentials: Credentials) -> SessionConfig {
        let mut config = SessionConfig::new("127.0.0.1", self.addr.port(), credentials);
        config.connect_timeout_ms = 5_000;
        config.command_timeout_ms = 5_000;
        config.data_timeout_ms = 5_000;
        config
    }

    pub fn anonymous(&self) -> SessionConfig {
        self.config(Credentials::Anonymous)
    }

    /// Explicit FTPS against the self-signed certificate.
    pub fn secure(&self) -> SessionConfig {
        let mut config = self.config(Credentials::Anonymous);
        config.security = SecurityMode::ExplicitTls;
        config.accept_invalid_certs = true;
        config
    }

    pub fn add_dir(&self, path: &str) {
        self.shared.fs.lock().unwrap().insert(path.to_string(), None);
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.shared
            .fs
            .lock()
            .unwrap()
            .insert(path.to_string(), Some(data.to_vec()));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.shared.fs.lock().unwrap().get(path).cloned().flatten()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.shared.fs.lock().unwrap().get(path), Some(None))
    }

    pub fn commands(&self) -> Vec<String> {
        self.shared.log.lock().unwrap().clone()
    }

    /// Commands whose verb is `verb`.
    pub fn commands_named(&self, verb: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.split(' ').next().unwrap_or("").eq_ignore_ascii_case(verb))
            .collect()
    }

    pub fn live_data_connections(&self) -> usize {
        self.shared.live_data.load(Ordering::SeqCst)
    }

    pub fn control_connections(&self) -> usize {
        self.shared.control_connections.load(Ordering::SeqCst)
    }

    /// Poll until no data connection is open, or give up after `limit`.
    pub async fn wait_data_idle(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.live_data_connections() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.live_data_connections() == 0
    }
}

fn self_signed_acceptor() -> TlsAcceptor {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let der = CertificateDer::from(cert.serialize_der().unwrap());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![der], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

// ─── Connection handler ──────────────────────────────────────────────

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Plain TCP or server-side TLS.
type Stream = Box<dyn Io>;

struct LiveGuard(Arc<Shared>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live_data.fetch_sub(1, Ordering::SeqCst);
    }
}

struct DataConn {
    stream: Stream,
    _guard: LiveGuard,
}

enum DataSource {
    Passive(TcpListener),
    Active(SocketAddr),
}

enum Payload {
    Bytes(Vec<u8>),
    Endless,
}

enum Step {
    Continue,
    StartTls,
    Quit,
}

enum Outcome {
    Done(Vec<u8>),
    Broken,
    Aborted,
}

struct Conn {
    shared: Arc<Shared>,
    lines: Lines<BufReader<ReadHalf<Stream>>>,
    w: WriteHalf<Stream>,
    backlog: VecDeque<String>,
    cwd: String,
    data: Option<DataSource>,
    rename_from: Option<String>,
    secure: bool,
    protected: bool,
}

async fn serve(stream: TcpStream, shared: Arc<Shared>) {
    let (r, w) = split(Box::new(stream) as Stream);
    let mut conn = Conn {
        shared,
        lines: BufReader::new(r).lines(),
        w,
        backlog: VecDeque::new(),
        cwd: "/".to_string(),
        data: None,
        rename_from: None,
        secure: false,
        protected: false,
    };
    if conn.reply("220-Mock FTP server\r\n 230 is not a terminator\r\n220 Ready").await.is_err() {
        return;
    }
    loop {
        let line = match conn.backlog.pop_front() {
            Some(l) => l,
            None => match conn.lines.next_line().await {
                Ok(Some(l)) => l,
                _ => return,
            },
        };
        match conn.handle(line.trim_end()).await {
            Ok(Step::Continue) => {}
            Ok(Step::StartTls) => match conn.start_tls().await {
                Ok(upgraded) => conn = upgraded,
                Err(_) => return,
            },
            _ => return,
        }
    }
}

impl Conn {
    async fn reply(&mut self, text: &str) -> std::io::Result<()> {
        self.w.write_all(format!("{}\r\n", text).as_bytes()).await?;
        self.w.flush().await
    }

    /// Put the control connection under TLS after `234`.
    async fn start_tls(self) -> std::io::Result<Self> {
        let acceptor = self
            .shared
            .tls
            .clone()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "TLS not configured"))?;
        let Conn {
            shared,
            lines,
            w,
            backlog,
            cwd,
            data,
            rename_from,
            ..
        } = self;
        let plain = lines.into_inner().into_inner().unsplit(w);
        let tls = acceptor.accept(plain).await?;
        let (r, w) = split(Box::new(tls) as Stream);
        Ok(Conn {
            shared,
            lines: BufReader::new(r).lines(),
            w,
            backlog,
            cwd,
            data,
            rename_from,
            secure: true,
            protected: false,
        })
    }

    fn record(&self, line: &str) {
        let logged = if line.to_uppercase().starts_with("PASS ") {
            "PASS ****".to_string()
        } else {
            line.to_string()
        };
        self.shared.log.lock().unwrap().push(logged);
    }

    fn resolve(&self, arg: &str) -> String {
        let joined = if arg.starts_with('/') {
            arg.to_string()
        } else {
            format!("{}/{}", self.cwd.trim_end_matches('/'), arg)
        };
        let mut parts: Vec<&str> = Vec::new();
        for part in joined.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                p => parts.push(p),
            }
        }
        format!("/{}", parts.join("/"))
    }

    fn is_dir(&self, path: &str) -> bool {
        matches!(self.shared.fs.lock().unwrap().get(path), Some(None))
    }

    fn children(&self, dir: &str) -> Vec<(String, Option<Vec<u8>>)> {
        let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
        self.shared
            .fs
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.len() > prefix.len() && k.starts_with(&prefix))
            .filter(|(k, _)| !k[prefix.len()..].contains('/'))
            .map(|(k, v)| (k[prefix.len()..].to_string(), v.clone()))
            .collect()
    }

    async fn handle(&mut self, line: &str) -> std::io::Result<Step> {
        self.record(line);
        if self.shared.opts.hangup_on.as_deref() == Some(line) {
            self.reply("421 Service not available, closing control connection").await?;
            return Ok(Step::Quit);
        }
        let (verb, arg) = match line.split_once(' ') {
            Some((v, a)) => (v.to_uppercase(), a.to_string()),
            None => (line.to_uppercase(), String::new()),
        };
        let delay = self
            .shared
            .opts
            .slow_replies
            .iter()
            .find(|(v, _)| v.eq_ignore_ascii_case(&verb))
            .map(|(_, d)| *d);
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        match verb.as_str() {
            "USER" => {
                if self.shared.opts.require_tls && !self.secure {
                    self.reply("530 Non-anonymous sessions must use encryption.").await?
                } else {
                    self.reply("331 Password required").await?
                }
            }
            "PASS" => self.reply("230 Logged in").await?,
            "AUTH" if self.shared.tls.is_some() && !self.secure => {
                self.reply("234 Proceed with negotiation").await?;
                return Ok(Step::StartTls);
            }
            "AUTH" => self.reply("502 TLS not available").await?,
            "PBSZ" if self.secure => self.reply("200 PBSZ=0").await?,
            "PROT" if self.secure => {
                self.protected = arg.eq_ignore_ascii_case("P");
                self.reply("200 Protection level set").await?
            }
            "PBSZ" | "PROT" => self.reply("503 Security data exchange not complete").await?,
            "FEAT" if !self.shared.opts.feat => self.reply("502 FEAT not implemented").await?,
            "FEAT" => {
                let mlsd = if self.shared.opts.mlsd { " MLSD\r\n" } else { "" };
                let text = format!("211-Features:\r\n{} SIZE\r\n UTF8\r\n EPSV\r\n211 End", mlsd);
                self.reply(&text).await?
            }
            "OPTS" => self.reply("200 UTF8 set to on").await?,
            "TYPE" => self.reply("200 Type set to I").await?,
            "SYST" => self.reply("215 UNIX Type: L8").await?,
            "NOOP" => self.reply("200 NOOP ok").await?,
            "ABOR" => self.reply("225 No transfer to abort").await?,
            "QUIT" => {
                self.reply("221 Goodbye").await?;
                return Ok(Step::Quit);
            }
            "PWD" => {
                let text = format!("257 \"{}\" is current directory", self.cwd);
                self.reply(&text).await?
            }
            "CWD" => {
                let target = self.resolve(&arg);
                if self.is_dir(&target) {
                    self.cwd = target;
                    self.reply("250 Directory changed").await?
                } else {
                    self.reply("550 No such directory").await?
                }
            }
            "CDUP" => {
                self.cwd = self.resolve("..");
                self.reply("250 Directory changed").await?
            }
            "MKD" => {
                let target = self.resolve(&arg);
                let exists = self.shared.fs.lock().unwrap().contains_key(&target);
                if exists {
                    self.reply("550 File exists").await?
                } else {
                    self.shared.fs.lock().unwrap().insert(target.clone(), None);
                    let text = format!("257 \"{}\" created", target);
                    self.reply(&text).await?
                }
            }
            "RMD" => {
                let target = self.resolve(&arg);
                if self.is_dir(&target) && target != "/" && self.children(&target).is_empty() {
                    self.shared.fs.lock().unwrap().remove(&target);
                    self.reply("250 Directory removed").await?
                } else {
                    self.reply("550 Directory not empty or missing").await?
                }
            }
            "DELE" => {
                let target = self.resolve(&arg);
                let removed = {
                    let mut fs = self.shared.fs.lock().unwrap();
                    match fs.get(&target) {
                        Some(Some(_)) => fs.remove(&target).is_some(),
                        _ => false,
                    }
                };
                if removed {
                    self.reply("250 File deleted").await?
                } else {
                    self.reply("550 No such file").await?
                }
            }
            "RNFR" => {
                let target = self.resolve(&arg);
                if self.shared.fs.lock().unwrap().contains_key(&target) {
                    self.rename_from = Some(target);
                    self.reply("350 Ready for RNTO").await?
                } else {
                    self.reply("550 No such file or directory").await?
                }
            }
            "RNTO" => match self.rename_from.take() {
                Some(from) => {
                    let to = self.resolve(&arg);
                    {
                        let mut fs = self.shared.fs.lock().unwrap();
                        if let Some(v) = fs.remove(&from) {
                            fs.insert(to, v);
                        }
                    }
                    self.reply("250 Renamed").await?
                }
                None => self.reply("503 Bad sequence of commands").await?,
            },
            "SIZE" => {
                let target = self.resolve(&arg);
                let size = self.shared.fs.lock().unwrap().get(&target).cloned().flatten().map(|d| d.len());
                let endless = self.shared.opts.endless.iter().any(|n| target.ends_with(n.as_str()));
                match size {
                    Some(n) if !endless => {
                        let text = format!("213 {}", n);
                        self.reply(&text).await?
                    }
                    _ => self.reply("550 Could not get file size").await?,
                }
            }
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let port = listener.local_addr()?.port();
                self.data = Some(DataSource::Passive(listener));
                let text = format!(
                    "227 Entering Passive Mode (127,0,0,1,{},{})",
                    port / 256,
                    port % 256
                );
                self.reply(&text).await?
            }
            "EPSV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let port = listener.local_addr()?.port();
                self.data = Some(DataSource::Passive(listener));
                let text = format!("229 Entering Extended Passive Mode (|||{}|)", port);
                self.reply(&text).await?
            }
            "PORT" => {
                let nums: Vec<u16> = arg.split(',').filter_map(|n| n.trim().parse().ok()).collect();
                if nums.len() == 6 {
                    let addr: SocketAddr = format!(
                        "{}.{}.{}.{}:{}",
                        nums[0],
                        nums[1],
                        nums[2],
                        nums[3],
                        nums[4] * 256 + nums[5]
                    )
                    .parse()
                    .unwrap();
                    self.data = Some(DataSource::Active(addr));
                    self.reply("200 PORT command successful").await?
                } else {
                    self.reply("501 Bad PORT").await?
                }
            }
            "MLSD" if !self.shared.opts.mlsd => {
                self.data = None;
                self.reply("500 Unknown command").await?
            }
            "MLSD" | "LIST" => {
                let dir = if arg.is_empty() || arg.starts_with('-') {
                    self.cwd.clone()
                } else {
                    self.resolve(&arg)
                };
                if !self.is_dir(&dir) {
                    self.data = None;
                    self.reply("550 No such directory").await?;
                    return Ok(Step::Continue);
                }
                // Reverse name order, so clients cannot rely on the server sorting.
                let mut body = String::new();
                for (name, node) in self.children(&dir).into_iter().rev() {
                    let line = match (verb.as_str(), node) {
                        ("MLSD", None) => format!("type=dir;modify=20240101000000; {}", name),
                        ("MLSD", Some(d)) => {
                            format!("type=file;size={};modify=20240101000000; {}", d.len(), name)
                        }
                        (_, None) => format!("drwxr-xr-x 2 owner group 0 Jan 01 2024 {}", name),
                        (_, Some(d)) => {
                            format!("-rw-r--r-- 1 owner group {} Jan 01 2024 {}", d.len(), name)
                        }
                    };
                    body.push_str(&line);
                    body.push_str("\r\n");
                }
                if verb == "MLSD" {
                    body.insert_str(0, "type=cdir;modify=20240101000000; .\r\n");
                } else {
                    body.insert_str(0, "total 8\r\n");
                }
                self.send_data(Payload::Bytes(body.into_bytes())).await?
            }
            "RETR" => {
                let target = self.resolve(&arg);
                let endless = self.shared.opts.endless.iter().any(|n| target.ends_with(n.as_str()));
                let content = self.shared.fs.lock().unwrap().get(&target).cloned().flatten();
                match content {
                    Some(_) if endless => self.send_data(Payload::Endless).await?,
                    Some(d) => self.send_data(Payload::Bytes(d)).await?,
                    None => {
                        self.data = None;
                        self.reply("550 No such file").await?
                    }
                }
            }
            "STOR" => {
                let target = self.resolve(&arg);
                let name = target.rsplit('/').next().unwrap_or("").to_string();
                if self.shared.opts.reject_stor.contains(&name) {
                    self.data = None;
                    self.reply("553 Permission denied").await?;
                } else {
                    self.receive_data(target).await?
                }
            }
            _ => self.reply("502 Command not implemented").await?,
        }
        Ok(Step::Continue)
    }

    async fn open_data(&mut self) -> std::io::Result<Option<DataConn>> {
        let tcp = match self.data.take() {
            Some(DataSource::Passive(listener)) => {
                match tokio::time::timeout(Duration::from_secs(5), listener.accept()).await {
                    Ok(Ok((s, _))) => s,
                    _ => return Ok(None),
                }
            }
            Some(DataSource::Active(addr)) => match TcpStream::connect(addr).await {
                Ok(s) => s,
                Err(_) => return Ok(None),
            },
            None => return Ok(None),
        };
        let stream: Stream = match (&self.shared.tls, self.protected) {
            (Some(acceptor), true) => {
                let accept = acceptor.accept(tcp);
                match tokio::time::timeout(Duration::from_secs(5), accept).await {
                    Ok(Ok(tls)) => Box::new(tls) as Stream,
                    _ => return Ok(None),
                }
            }
            _ => Box::new(tcp) as Stream,
        };
        self.shared.live_data.fetch_add(1, Ordering::SeqCst);
        Ok(Some(DataConn {
            stream,
            _guard: LiveGuard(self.shared.clone()),
        }))
    }

    async fn send_data(&mut self, payload: Payload) -> std::io::Result<()> {
        if self.data.is_none() {
            return self.reply("425 Use PASV or PORT first").await;
        }
        self.reply("150 Opening BINARY mode data connection").await?;
        let Some(mut conn) = self.open_data().await? else {
            return self.reply("425 Can't open data connection").await;
        };

        let mut offset = 0usize;
        let outcome = loop {
            let chunk: Vec<u8> = match &payload {
                Payload::Bytes(b) if offset >= b.len() => break Outcome::Done(Vec::new()),
                Payload::Bytes(b) => b[offset..(offset + 4096).min(b.len())].to_vec(),
                Payload::Endless => vec![b'x'; 1024],
            };
            tokio::select! {
                line = self.lines.next_line() => match line {
                    Ok(Some(l)) if l.trim().eq_ignore_ascii_case("ABOR") => {
                        self.record(l.trim());
                        break Outcome::Aborted;
                    }
                    Ok(Some(l)) => self.backlog.push_back(l),
                    _ => break Outcome::Broken,
                },
                r = conn.stream.write_all(&chunk) => {
                    if r.is_err() {
                        break Outcome::Broken;
                    }
                    offset += chunk.len();
                    if matches!(payload, Payload::Endless) {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }
            }
        };
        let _ = conn.stream.flush().await;
        if !self.shared.opts.skip_close_notify {
            let _ = conn.stream.shutdown().await;
        }
        drop(conn);
        self.finish(outcome).await
    }

    async fn receive_data(&mut self, target: String) -> std::io::Result<()> {
        if self.data.is_none() {
            return self.reply("425 Use PASV or PORT first").await;
        }
        self.reply("150 Ok to send data").await?;
        let Some(mut conn) = self.open_data().await? else {
            return self.reply("425 Can't open data connection").await;
        };

        let mut received = Vec::new();
        let mut buf = vec![0u8; 4096];
        let outcome = loop {
            tokio::select! {
                line = self.lines.next_line() => match line {
                    Ok(Some(l)) if l.trim().eq_ignore_ascii_case("ABOR") => {
                        self.record(l.trim());
                        break Outcome::Aborted;
                    }
                    Ok(Some(l)) => self.backlog.push_back(l),
                    _ => break Outcome::Broken,
                },
                r = conn.stream.read(&mut buf) => match r {
                    Ok(0) => break Outcome::Done(std::mem::take(&mut received)),
                    Ok(n) => {
                        received.extend_from_slice(&buf[..n]);
                        if let Some(pause) = self.shared.opts.stor_throttle {
                            tokio::time::sleep(pause).await;
                        }
                    }
                    Err(_) => break Outcome::Broken,
                },
            }
        };
        drop(conn);
        if let Outcome::Done(data) = &outcome {
            self.shared.fs.lock().unwrap().insert(target, Some(data.clone()));
        }
        self.finish(outcome).await
    }

    async fn finish(&mut self, outcome: Outcome) -> std::io::Result<()> {
        match outcome {
            Outcome::Done(_) => {
                if let Some(d) = self.shared.opts.slow_completion {
                    tokio::time::sleep(d).await;
                }
                self.reply("226 Transfer complete").await
            }
            Outcome::Broken => self.reply("426 Connection closed; transfer aborted").await,
            Outcome::Aborted => {
                self.reply("426 Transfer aborted").await?;
                self.reply("226 ABOR command successful").await
            }
        }
    }
}
