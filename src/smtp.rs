use async_trait::async_trait;
use std::fs::File;
use std::io::{self, BufReader as StdBufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::dns::MxRecord;
use crate::error::{HostAttempt, SmtpError, VerifyError};

/// Certificates presented by the peer during STARTTLS, leaf first.
/// Empty when the session stayed in plaintext.
pub type CertificateChain = Vec<CertificateDer<'static>>;

/// Connection parameters for outbound SMTP sessions.
#[derive(Debug, Clone)]
pub struct SmtpOptions {
    pub port: u16,
    pub helo_name: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for SmtpOptions {
    fn default() -> Self {
        Self {
            port: 25,
            helo_name: "localhost".to_string(),
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(60),
        }
    }
}

/// A parsed (possibly multi-line) SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl SmtpReply {
    pub fn message(&self) -> String {
        self.lines.join(" ")
    }
}

enum Connection {
    Plain(BufReader<TcpStream>),
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
}

impl Connection {
    async fn read_line(&mut self, buf: &mut String) -> io::Result<usize> {
        match self {
            Connection::Plain(s) => s.read_line(buf).await,
            Connection::Tls(s) => s.read_line(buf).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Connection::Plain(s) => {
                s.write_all(data).await?;
                s.flush().await
            }
            Connection::Tls(s) => {
                s.write_all(data).await?;
                s.flush().await
            }
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Connection::Plain(s) => s.shutdown().await,
            Connection::Tls(s) => s.shutdown().await,
        }
    }
}

/// An open SMTP session with one MX host.
pub struct SmtpClient {
    host: String,
    conn: Connection,
    extensions: Vec<String>,
    peer_certificates: CertificateChain,
    command_timeout: Duration,
}

impl SmtpClient {
    /// Dials `host`, reads the greeting and introduces ourselves.
    pub async fn connect(host: &str, options: &SmtpOptions) -> Result<Self, SmtpError> {
        let stream = tokio::time::timeout(
            options.connect_timeout,
            TcpStream::connect((host, options.port)),
        )
        .await
        .map_err(|_| SmtpError::Timeout("connect"))??;

        let mut client = Self {
            host: host.to_string(),
            conn: Connection::Plain(BufReader::new(stream)),
            extensions: Vec::new(),
            peer_certificates: Vec::new(),
            command_timeout: options.command_timeout,
        };
        let greeting = client.read_reply("greeting").await?;
        expect_code("greeting", &greeting, 220)?;
        client.hello(&options.helo_name).await?;
        Ok(client)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether the server advertised `name` in its EHLO reply.
    pub fn extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e.eq_ignore_ascii_case(name))
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.conn, Connection::Tls(_))
    }

    pub fn peer_certificates(&self) -> &[CertificateDer<'static>] {
        &self.peer_certificates
    }

    /// Upgrades the session in place, verifying the peer as `self.host`.
    pub async fn starttls(mut self, tls: &TlsConnector, helo_name: &str) -> Result<Self, SmtpError> {
        let reply = self.command("STARTTLS", "STARTTLS").await?;
        expect_code("STARTTLS", &reply, 220)?;

        let reader = match self.conn {
            Connection::Plain(reader) => reader,
            Connection::Tls(_) => return Err(SmtpError::Tls("session already encrypted".into())),
        };
        if !reader.buffer().is_empty() {
            return Err(SmtpError::Tls("data pipelined after STARTTLS".into()));
        }
        let server_name = ServerName::try_from(self.host.as_str())
            .map_err(|e| SmtpError::Tls(e.to_string()))?
            .to_owned();
        let stream = tokio::time::timeout(
            self.command_timeout,
            tls.connect(server_name, reader.into_inner()),
        )
        .await
        .map_err(|_| SmtpError::Timeout("TLS handshake"))?
        .map_err(|e| SmtpError::Tls(e.to_string()))?;

        let certs: CertificateChain = stream
            .get_ref()
            .1
            .peer_certificates()
            .map(|chain| chain.iter().map(|c| c.clone().into_owned()).collect())
            .unwrap_or_default();
        log::debug!("{}: TLS established, {} peer certificates", self.host, certs.len());

        let mut client = Self {
            host: self.host,
            conn: Connection::Tls(Box::new(BufReader::new(stream))),
            extensions: Vec::new(),
            peer_certificates: certs,
            command_timeout: self.command_timeout,
        };
        client.hello(helo_name).await?;
        Ok(client)
    }

    pub async fn mail(&mut self, from: &str) -> Result<(), SmtpError> {
        let reply = self.command(&format!("MAIL FROM:<{}>", from), "MAIL").await?;
        expect_code("MAIL", &reply, 250)
    }

    pub async fn rcpt(&mut self, to: &str) -> Result<(), SmtpError> {
        let reply = self.command(&format!("RCPT TO:<{}>", to), "RCPT").await?;
        match reply.code {
            250 | 251 => Ok(()),
            _ => Err(unexpected("RCPT", &reply)),
        }
    }

    /// Sends `payload` as the message content and commits the transaction.
    pub async fn data(&mut self, payload: &[u8]) -> Result<(), SmtpError> {
        let reply = self.command("DATA", "DATA").await?;
        expect_code("DATA", &reply, 354)?;
        let body = dot_stuff(payload);
        self.send(&body, "DATA").await?;
        let reply = self.read_reply("end of DATA").await?;
        expect_code("end of DATA", &reply, 250)
    }

    /// Sends QUIT and closes the connection. Consumes the session.
    pub async fn quit(mut self) -> Result<(), SmtpError> {
        let result = match self.command("QUIT", "QUIT").await {
            Ok(reply) => expect_code("QUIT", &reply, 221),
            Err(e) => Err(e),
        };
        let _ = self.conn.shutdown().await;
        log::debug!("{}: session closed", self.host);
        result
    }

    async fn hello(&mut self, helo_name: &str) -> Result<(), SmtpError> {
        let reply = self.command(&format!("EHLO {}", helo_name), "EHLO").await?;
        if reply.code == 250 {
            self.extensions = reply
                .lines
                .iter()
                .skip(1)
                .filter_map(|l| l.split_whitespace().next())
                .map(|k| k.to_ascii_uppercase())
                .collect();
            return Ok(());
        }
        // Servers without ESMTP support get HELO and no extensions.
        let reply = self.command(&format!("HELO {}", helo_name), "HELO").await?;
        self.extensions.clear();
        expect_code("HELO", &reply, 250)
    }

    async fn command(&mut self, line: &str, name: &'static str) -> Result<SmtpReply, SmtpError> {
        self.send(format!("{}\r\n", line).as_bytes(), name).await?;
        self.read_reply(name).await
    }

    async fn send(&mut self, data: &[u8], stage: &'static str) -> Result<(), SmtpError> {
        tokio::time::timeout(self.command_timeout, self.conn.write_all(data))
            .await
            .map_err(|_| SmtpError::Timeout(stage))??;
        Ok(())
    }

    async fn read_reply(&mut self, stage: &'static str) -> Result<SmtpReply, SmtpError> {
        let timeout = self.command_timeout;
        tokio::time::timeout(timeout, self.read_reply_lines())
            .await
            .map_err(|_| SmtpError::Timeout(stage))?
    }

    async fn read_reply_lines(&mut self) -> Result<SmtpReply, SmtpError> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            if self.conn.read_line(&mut line).await? == 0 {
                return Err(SmtpError::Closed);
            }
            let line = line.trim_end_matches(['\r', '\n']);
            let (code, last, text) = parse_reply_line(line)?;
            lines.push(text.to_string());
            if last {
                return Ok(SmtpReply { code, lines });
            }
        }
    }
}

/// Splits `250-text` / `250 text` into code, final-line flag and text.
fn parse_reply_line(line: &str) -> Result<(u16, bool, &str), SmtpError> {
    let code = line
        .get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| SmtpError::MalformedReply(line.to_string()))?;
    match line.as_bytes().get(3) {
        None => Ok((code, true, "")),
        Some(b' ') => Ok((code, true, &line[4..])),
        Some(b'-') => Ok((code, false, &line[4..])),
        Some(_) => Err(SmtpError::MalformedReply(line.to_string())),
    }
}

fn expect_code(command: &'static str, reply: &SmtpReply, code: u16) -> Result<(), SmtpError> {
    if reply.code == code {
        Ok(())
    } else {
        Err(unexpected(command, reply))
    }
}

fn unexpected(command: &'static str, reply: &SmtpReply) -> SmtpError {
    SmtpError::UnexpectedReply {
        command,
        code: reply.code,
        message: reply.message(),
    }
}

/// Normalizes line endings to CRLF, escapes leading dots and appends the
/// end-of-data marker.
fn dot_stuff(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    let body = payload.strip_suffix(b"\n").unwrap_or(payload);
    if !body.is_empty() {
        for line in body.split(|b| *b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.first() == Some(&b'.') {
                out.push(b'.');
            }
            out.extend_from_slice(line);
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// Where distributions keep their PEM root bundle, checked in order when no
/// bundle is configured.
pub const SYSTEM_CA_BUNDLES: [&str; 6] = [
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem",
    "/etc/ssl/cert.pem",
    "/usr/local/etc/openssl/cert.pem",
];

/// Builds a TLS connector trusting the PEM roots in `ca_bundle`, or in the
/// first system bundle found when none is given.
pub fn tls_connector(ca_bundle: Option<&Path>) -> Result<TlsConnector, VerifyError> {
    let path = match ca_bundle {
        Some(path) => path,
        None => SYSTEM_CA_BUNDLES
            .iter()
            .map(Path::new)
            .find(|p| p.is_file())
            .ok_or_else(|| {
                VerifyError::Config(format!(
                    "no CA bundle configured and none found in {}",
                    SYSTEM_CA_BUNDLES.join(", ")
                ))
            })?,
    };
    let roots = load_root_store(path)?;
    log::debug!("trusting {} roots from {}", roots.len(), path.display());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

fn load_root_store(path: &Path) -> Result<RootCertStore, VerifyError> {
    let config_err =
        |cause: String| VerifyError::Config(format!("CA bundle '{}': {}", path.display(), cause));
    let file = File::open(path).map_err(|e| config_err(e.to_string()))?;
    let certs = rustls_pemfile::certs(&mut StdBufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| config_err(e.to_string()))?;

    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(config_err("no usable certificates".to_string()));
    }
    Ok(roots)
}

/// An established session the verifier can report through.
#[async_trait]
pub trait MailSession: Send + Sized {
    fn peer_certificates(&self) -> CertificateChain;

    /// MAIL, RCPT, DATA and the payload; the caller still owns closing.
    async fn send_mail(&mut self, from: &str, to: &str, payload: &[u8]) -> Result<(), SmtpError>;

    async fn quit(self) -> Result<(), SmtpError>;
}

#[async_trait]
impl MailSession for SmtpClient {
    fn peer_certificates(&self) -> CertificateChain {
        self.peer_certificates.clone()
    }

    async fn send_mail(&mut self, from: &str, to: &str, payload: &[u8]) -> Result<(), SmtpError> {
        self.mail(from).await?;
        self.rcpt(to).await?;
        self.data(payload).await
    }

    async fn quit(self) -> Result<(), SmtpError> {
        SmtpClient::quit(self).await
    }
}

/// Opens sessions to a single named host.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Session: MailSession;

    async fn dial(&self, host: &str) -> Result<Self::Session, SmtpError>;
}

/// Dials port 25 (by default) and upgrades with STARTTLS whenever the server
/// advertises it. A failed handshake fails the host; there is no plaintext
/// retry on the same host.
pub struct SmtpDialer {
    options: SmtpOptions,
    tls: TlsConnector,
}

impl SmtpDialer {
    pub fn new(options: SmtpOptions, tls: TlsConnector) -> Self {
        Self { options, tls }
    }
}

#[async_trait]
impl Dialer for SmtpDialer {
    type Session = SmtpClient;

    async fn dial(&self, host: &str) -> Result<SmtpClient, SmtpError> {
        let client = SmtpClient::connect(host, &self.options).await?;
        if client.extension("STARTTLS") {
            return client.starttls(&self.tls, &self.options.helo_name).await;
        }
        log::debug!("{}: STARTTLS not advertised, staying in plaintext", host);
        Ok(client)
    }
}

/// Tries each exchanger strictly in order and returns the first session.
/// When every host fails, the per-host errors are returned in order.
pub async fn probe_and_connect<D: Dialer>(
    dialer: &D,
    mxs: &[MxRecord],
) -> Result<D::Session, Vec<HostAttempt>> {
    let mut attempts = Vec::new();
    for mx in mxs {
        let host = mx.hostname();
        match dialer.dial(host).await {
            Ok(session) => {
                log::info!("connected to MX {}", host);
                return Ok(session);
            }
            Err(e) => {
                log::debug!("MX {} failed: {}", host, e);
                attempts.push(HostAttempt {
                    host: host.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
    Err(attempts)
}

/// Sends `payload` from `from` to `to` over an already open session.
pub async fn transmit<S: MailSession>(
    session: &mut S,
    from: &str,
    to: &str,
    payload: &[u8],
) -> Result<(), VerifyError> {
    session.send_mail(from, to, payload).await?;
    Ok(())
}
