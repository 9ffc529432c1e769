//! Reversed-role TLS handshake.
//!
//! A FortiGate listening on TCP 541 expects to be talking to a FortiManager
//! or FortiAnalyzer, and in that exchange the appliance is the TLS *client*.
//! We dial the appliance over plain TCP and then run the handshake as the TLS
//! *server*, demanding its client certificate. The certificate subject carries
//! the model and serial number.
//!
//! Two independent knobs shape the server context:
//!
//! - [`CipherPolicy`] lowers the negotiation floor so devices with weak
//!   (sub-2048-bit, SHA-1) certificates can still complete the handshake.
//! - [`PeerVerification`] makes the peer certificate mandatory and checks it
//!   against a [`TrustAnchorSet`]. It has no optional mode.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use openssl::ssl::{
    self, ErrorCode, Ssl, SslContext, SslContextBuilder, SslFiletype, SslMethod, SslRef,
    SslStream, SslVerifyMode,
};
use openssl::x509::{X509Ref, X509VerifyResult, X509};
use tracing::{debug, info};

use crate::error::{ProbeError, Result};
use crate::identity::EphemeralIdentity;
use crate::trust::TrustAnchorSet;
use crate::Stage;

/// FortiGate management port (FGFM).
pub const DEFAULT_PORT: u16 = 541;

/// Budget shared by the connect and the handshake phase.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Accept every cipher OpenSSL knows about, with security level 0.
pub const LEGACY_CIPHER_LIST: &str = "ALL:@SECLEVEL=0";

/// Host and port of the appliance to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into().trim().to_string();
        if host.is_empty() {
            return Err(ProbeError::InvalidInput {
                field: "target",
                reason: "cannot be empty".to_string(),
            });
        }
        if port == 0 {
            return Err(ProbeError::InvalidInput {
                field: "port",
                reason: "must be between 1 and 65535".to_string(),
            });
        }
        Ok(Target { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Cipher negotiation floor of the server context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherPolicy {
    /// OpenSSL cipher list string (TLS 1.2 and below)
    pub cipher_list: String,
    /// OpenSSL security level, 0 disables every key size and digest check
    pub security_level: u32,
}

impl Default for CipherPolicy {
    fn default() -> Self {
        CipherPolicy {
            cipher_list: LEGACY_CIPHER_LIST.to_string(),
            security_level: 0,
        }
    }
}

impl CipherPolicy {
    fn apply(&self, builder: &mut SslContextBuilder) -> Result<()> {
        builder
            .set_cipher_list(&self.cipher_list)
            .map_err(|e| ProbeError::InvalidInput {
                field: "cipher_list",
                reason: e.to_string(),
            })?;
        builder.set_security_level(self.security_level);
        Ok(())
    }
}

/// Mandatory peer certificate check.
#[derive(Debug, Clone)]
pub struct PeerVerification {
    anchors: TrustAnchorSet,
}

impl PeerVerification {
    /// Requires a peer certificate chaining to `anchors`.
    pub fn required(anchors: TrustAnchorSet) -> Self {
        PeerVerification { anchors }
    }

    pub fn anchors(&self) -> &TrustAnchorSet {
        &self.anchors
    }

    fn apply(&self, builder: &mut SslContextBuilder) -> Result<()> {
        builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
        builder.set_cert_store(self.anchors.to_store()?);
        Ok(())
    }
}

/// Complete configuration of the local TLS server.
#[derive(Debug, Clone)]
pub struct ServerPolicy {
    pub ciphers: CipherPolicy,
    pub verification: PeerVerification,
}

impl ServerPolicy {
    /// Legacy cipher floor plus mandatory verification against `anchors`.
    pub fn new(anchors: TrustAnchorSet) -> Self {
        ServerPolicy {
            ciphers: CipherPolicy::default(),
            verification: PeerVerification::required(anchors),
        }
    }

    pub fn with_ciphers(mut self, ciphers: CipherPolicy) -> Self {
        self.ciphers = ciphers;
        self
    }

    /// Builds a server context presenting `identity`.
    ///
    /// The cipher floor is applied first and verification last, so nothing
    /// in the cipher settings can reset the verify mode.
    pub fn build_context(&self, identity: &EphemeralIdentity) -> Result<SslContext> {
        let mut builder =
            SslContext::builder(SslMethod::tls_server()).map_err(|e| ProbeError::HandshakeFailed {
                details: e.to_string(),
            })?;

        // The floor must be lowered before the identity is loaded, OpenSSL
        // checks the key size against the level in force at load time.
        self.ciphers.apply(&mut builder)?;

        builder
            .set_certificate_file(identity.certificate_path(), SslFiletype::PEM)
            .map_err(ProbeError::identity)?;
        builder
            .set_private_key_file(identity.private_key_path(), SslFiletype::PEM)
            .map_err(ProbeError::identity)?;
        builder.check_private_key().map_err(ProbeError::identity)?;
        // One connection, no resumption.
        builder
            .set_num_tickets(0)
            .map_err(|e| ProbeError::HandshakeFailed {
                details: e.to_string(),
            })?;

        self.verification.apply(&mut builder)?;
        Ok(builder.build())
    }
}

/// TCP stream whose every read and write is bounded by one shared deadline.
///
/// A socket timeout restarts on each call, so a peer trickling one byte at a
/// time could otherwise stretch the handshake forever.
#[derive(Debug)]
pub struct DeadlineStream {
    inner: TcpStream,
    deadline: Instant,
}

impl DeadlineStream {
    pub fn new(inner: TcpStream, deadline: Instant) -> Self {
        DeadlineStream { inner, deadline }
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.inner
    }

    fn budget(&self) -> io::Result<Duration> {
        let budget = remaining(self.deadline);
        if budget.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"));
        }
        Ok(budget)
    }
}

impl Read for DeadlineStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let budget = self.budget()?;
        self.inner.set_read_timeout(Some(budget))?;
        self.inner.read(buf)
    }
}

impl Write for DeadlineStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let budget = self.budget()?;
        self.inner.set_write_timeout(Some(budget))?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Established session with a validated peer certificate.
///
/// The certificate can only be reached through this value; closing or
/// dropping it tears down the TLS session and the TCP connection.
pub struct PeerCertificateView {
    stream: SslStream<DeadlineStream>,
    certificate: X509,
    peer: SocketAddr,
    closed: bool,
}

impl PeerCertificateView {
    pub fn certificate(&self) -> &X509Ref {
        &self.certificate
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Negotiated protocol version, e.g. `TLSv1.2`.
    pub fn protocol(&self) -> &'static str {
        self.stream.ssl().version_str()
    }

    /// Negotiated cipher suite name.
    pub fn cipher(&self) -> Option<&'static str> {
        self.stream.ssl().current_cipher().map(|c| c.name())
    }

    /// Sends close-notify and shuts the TCP connection down.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.shutdown() {
            debug!(error = %e, "TLS shutdown incomplete");
        }
        let _ = self.stream.get_ref().get_ref().shutdown(Shutdown::Both);
        debug!(peer = %self.peer, "session closed");
    }
}

impl Drop for PeerCertificateView {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PeerCertificateView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerCertificateView")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol())
            .field("cipher", &self.cipher())
            .finish()
    }
}

/// Connects to `target` and runs the handshake in the server role.
///
/// # Arguments
///
/// * `target` - Appliance host and port
/// * `timeout` - One deadline shared by connect and handshake; every socket
///   read and write during the handshake gets only what is left of it
/// * `identity` - Local server certificate and key
/// * `policy` - Cipher floor and mandatory peer verification
///
/// # Returns
///
/// * `Ok(PeerCertificateView)` - Session with a validated peer certificate
/// * `Err(ProbeError::Connect)` - Resolution or TCP connect failed
/// * `Err(ProbeError::HandshakeTimeout)` - The deadline passed mid-handshake
/// * `Err(ProbeError::PeerValidation)` - No certificate, or not trusted
/// * `Err(ProbeError::HandshakeFailed)` - Any other negotiation failure
///
/// On any failure the connection is dropped before the error is returned.
///
/// Name resolution goes through the system resolver (`ToSocketAddrs`) and is
/// not bounded by `timeout`; a slow resolver can delay a `Connect` error past
/// the deadline. Pass a literal address to avoid it.
pub fn probe(
    target: &Target,
    timeout: Duration,
    identity: &EphemeralIdentity,
    policy: &ServerPolicy,
) -> Result<PeerCertificateView> {
    if timeout.is_zero() {
        return Err(ProbeError::InvalidInput {
            field: "timeout",
            reason: "must be positive".to_string(),
        });
    }
    let deadline = Instant::now() + timeout;
    let address = target.address();

    let context = policy.build_context(identity)?;
    let tcp = connect(target, &address, deadline)?;
    let peer = tcp.peer_addr().map_err(|source| ProbeError::Connect {
        address: address.clone(),
        source,
    })?;
    info!(%peer, stage = %Stage::Connected, "connected");

    let budget = remaining(deadline);
    if budget.is_zero() {
        return Err(ProbeError::HandshakeTimeout { address });
    }

    let ssl = Ssl::new(&context).map_err(|e| ProbeError::HandshakeFailed {
        details: e.to_string(),
    })?;
    let mut stream = SslStream::new(ssl, DeadlineStream::new(tcp, deadline)).map_err(|e| {
        ProbeError::HandshakeFailed {
            details: e.to_string(),
        }
    })?;

    debug!(%peer, budget_ms = budget.as_millis() as u64, "accepting TLS as server");
    if let Err(e) = stream.accept() {
        let err = classify(&e, stream.ssl(), &address);
        let _ = stream.get_ref().get_ref().shutdown(Shutdown::Both);
        debug!(%peer, error = %err, "handshake failed");
        return Err(err);
    }

    let certificate = match established_certificate(stream.ssl()) {
        Ok(cert) => cert,
        Err(err) => {
            let _ = stream.get_ref().get_ref().shutdown(Shutdown::Both);
            return Err(err);
        }
    };
    info!(
        %peer,
        protocol = stream.ssl().version_str(),
        "handshake established"
    );

    Ok(PeerCertificateView {
        stream,
        certificate,
        peer,
        closed: false,
    })
}

fn connect(target: &Target, address: &str, deadline: Instant) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = (target.host(), target.port())
        .to_socket_addrs()
        .map_err(|source| ProbeError::Connect {
            address: address.to_string(),
            source,
        })?
        .collect();

    let mut last_error =
        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses");
    for addr in addrs {
        let budget = remaining(deadline);
        if budget.is_zero() {
            last_error = io::Error::new(io::ErrorKind::TimedOut, "connection timed out");
            break;
        }
        debug!(%addr, "connecting");
        match TcpStream::connect_timeout(&addr, budget) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, error = %e, "connect failed");
                last_error = e;
            }
        }
    }
    Err(ProbeError::Connect {
        address: address.to_string(),
        source: last_error,
    })
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn established_certificate(ssl: &SslRef) -> Result<X509> {
    let verify = ssl.verify_result();
    if verify != X509VerifyResult::OK {
        return Err(ProbeError::PeerValidation {
            reason: verify.error_string().to_string(),
        });
    }
    ssl.peer_certificate()
        .ok_or_else(|| ProbeError::PeerValidation {
            reason: "peer did not present a certificate".to_string(),
        })
}

fn classify(err: &ssl::Error, ssl: &SslRef, address: &str) -> ProbeError {
    let timed_out = err
        .io_error()
        .map(|e| matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut))
        .unwrap_or(false);
    if timed_out || err.code() == ErrorCode::WANT_READ || err.code() == ErrorCode::WANT_WRITE {
        return ProbeError::HandshakeTimeout {
            address: address.to_string(),
        };
    }

    let verify = ssl.verify_result();
    if verify != X509VerifyResult::OK {
        return ProbeError::PeerValidation {
            reason: verify.error_string().to_string(),
        };
    }

    let missing_cert = err
        .ssl_error()
        .map(|stack| {
            stack.errors().iter().any(|e| {
                e.reason()
                    .map(|r| {
                        r.contains("did not return a certificate")
                            || r.contains("certificate required")
                    })
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false);
    if missing_cert {
        return ProbeError::PeerValidation {
            reason: "peer did not present a certificate".to_string(),
        };
    }

    ProbeError::HandshakeFailed {
        details: err.to_string(),
    }
}
