//! tls termination.
//!
//! One terminator per worker. The rustls server config is rebuilt on
//! certificate reload and swapped behind a `RefCell`; connections that
//! already completed their handshake keep the acceptor they started
//! with.

use core::cell::{Cell, RefCell};
use core::fmt;

use std::error;
use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ServerSessionMemoryCache;
use rustls::ServerConfig;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::info;
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;

use crate::config::TlsSettings;

const ALPN_H2: &[u8] = b"h2";
const ALPN_HTTP11: &[u8] = b"http/1.1";

const SESSION_CACHE_SIZE: usize = 1024;

#[derive(Debug)]
pub enum TlsError {
    Io(io::Error),
    NoCertificate,
    NoPrivateKey,
    Rustls(rustls::Error),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsError::Io(e) => write!(f, "tls file error: {e}"),
            TlsError::NoCertificate => f.write_str("certificate file holds no certificate"),
            TlsError::NoPrivateKey => f.write_str("key file holds no private key"),
            TlsError::Rustls(e) => write!(f, "tls setup rejected: {e}"),
        }
    }
}

impl error::Error for TlsError {}

impl From<io::Error> for TlsError {
    fn from(e: io::Error) -> Self {
        TlsError::Io(e)
    }
}

impl From<rustls::Error> for TlsError {
    fn from(e: rustls::Error) -> Self {
        TlsError::Rustls(e)
    }
}

pub struct TlsTerminator {
    acceptor: RefCell<TlsAcceptor>,
    cert_expiry: Cell<i64>,
    settings: TlsSettings,
}

impl TlsTerminator {
    pub fn new(settings: &TlsSettings) -> Result<Self, TlsError> {
        let (acceptor, expiry) = build_acceptor(settings)?;
        log_expiry(expiry);
        Ok(Self {
            acceptor: RefCell::new(acceptor),
            cert_expiry: Cell::new(expiry),
            settings: settings.clone(),
        })
    }

    /// Rebuild the server config from the configured PEM files and swap
    /// it in. Connections created from the old acceptor are unaffected.
    pub fn reload(&self) -> Result<(), TlsError> {
        info!(
            "reloading tls certificate from {} / {}",
            self.settings.cert_file.display(),
            self.settings.key_file.display()
        );
        let (acceptor, expiry) = build_acceptor(&self.settings)?;
        *self.acceptor.borrow_mut() = acceptor;
        self.cert_expiry.set(expiry);
        log_expiry(expiry);
        Ok(())
    }

    pub async fn accept(&self, io: TcpStream) -> io::Result<TlsStream<TcpStream>> {
        let acceptor = self.acceptor.borrow().clone();
        acceptor.accept(io).await
    }

    /// Unix timestamp of the leaf certificate's notAfter; 0 when the
    /// expiry could not be determined.
    pub fn cert_expiry(&self) -> i64 {
        self.cert_expiry.get()
    }

    pub fn cert_days_remaining(&self) -> i64 {
        let expiry = self.cert_expiry.get();
        if expiry == 0 {
            return 0;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        (expiry - now) / 86_400
    }
}

fn log_expiry(expiry: i64) {
    if expiry > 0 {
        info!("tls certificate loaded, expires at unix time {expiry}");
    }
}

fn build_acceptor(settings: &TlsSettings) -> Result<(TlsAcceptor, i64), TlsError> {
    let mut cert_reader = BufReader::new(File::open(&settings.cert_file)?);
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_reader).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate);
    }

    let expiry = cert_expiry_unix(&certs[0]);

    let mut key_reader = BufReader::new(File::open(&settings.key_file)?);
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut key_reader)?.ok_or(TlsError::NoPrivateKey)?;

    // with_single_cert rejects unusable keys; an inconsistent pair is
    // caught no later than the first handshake.
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    config.alpn_protocols = if settings.http2_enabled {
        vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()]
    } else {
        vec![ALPN_HTTP11.to_vec()]
    };
    config.session_storage = ServerSessionMemoryCache::new(SESSION_CACHE_SIZE);

    Ok((TlsAcceptor::from(Arc::new(config)), expiry))
}

fn cert_expiry_unix(cert: &CertificateDer<'_>) -> i64 {
    match X509Certificate::from_der(cert.as_ref()) {
        Ok((_, parsed)) => parsed.validity().not_after.timestamp(),
        Err(_) => 0,
    }
}

/// Did ALPN settle on h2 for this handshake.
pub fn negotiated_h2(stream: &TlsStream<TcpStream>) -> bool {
    stream.get_ref().1.alpn_protocol() == Some(ALPN_H2)
}

/// Label for the negotiated protocol version, for the handshake
/// counters.
pub fn protocol_label(stream: &TlsStream<TcpStream>) -> Option<&'static str> {
    use rustls::ProtocolVersion;

    match stream.get_ref().1.protocol_version() {
        Some(ProtocolVersion::TLSv1_3) => Some("TLSv1.3"),
        Some(ProtocolVersion::TLSv1_2) => Some("TLSv1.2"),
        _ => None,
    }
}
