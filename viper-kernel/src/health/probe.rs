//! Sondes réseau : connexion TCP et HEAD HTTP, derrière le trait `Probe`
//! pour que le checker puisse être testé avec des sondes scriptées.

use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::{lookup_host, TcpStream};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("TCP connection timeout")]
    Timeout,
    #[error("Connection refused")]
    Refused,
    #[error("DNS resolution failed: {0}")]
    Dns(String),
    #[error("OS error: {0}")]
    Os(String),
    #[error("HTTP timeout")]
    HttpTimeout,
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Deux primitives de mesure ; chacune renvoie la durée de l'opération réussie.
pub trait Probe: Send + Sync + 'static {
    fn tcp_connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> impl Future<Output = Result<Duration, ProbeError>> + Send;

    /// N'importe quelle réponse HTTP compte comme un succès, redirections non suivies.
    fn http_head(
        &self,
        url: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Duration, ProbeError>> + Send;
}

/// Sonde réelle : tokio pour TCP, reqwest pour HTTP (certificats non vérifiés).
#[derive(Clone)]
pub struct NetProbe {
    client: reqwest::Client,
}

impl NetProbe {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProbeError::Http(short_error(&e.to_string())))?;
        Ok(Self { client })
    }
}

impl Probe for NetProbe {
    async fn tcp_connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        let attempt = async {
            let addrs: Vec<SocketAddr> = lookup_host((host, port))
                .await
                .map_err(|e| ProbeError::Dns(short_error(&e.to_string())))?
                .collect();
            if addrs.is_empty() {
                return Err(ProbeError::Dns(format!("no address for {host}")));
            }

            let mut last = ProbeError::Os("unreachable".into());
            for addr in addrs {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        drop(stream);
                        return Ok(());
                    }
                    Err(e) => last = classify_io(&e),
                }
            }
            Err(last)
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProbeError::Timeout),
        }
    }

    async fn http_head(&self, url: &str, timeout: Duration) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        match self.client.head(url).timeout(timeout).send().await {
            Ok(_) => Ok(started.elapsed()),
            Err(e) if e.is_timeout() => Err(ProbeError::HttpTimeout),
            Err(e) => Err(ProbeError::Http(short_error(&e.to_string()))),
        }
    }
}

fn classify_io(err: &std::io::Error) -> ProbeError {
    match err.kind() {
        ErrorKind::ConnectionRefused => ProbeError::Refused,
        ErrorKind::TimedOut => ProbeError::Timeout,
        _ => ProbeError::Os(short_error(&err.to_string())),
    }
}

/// Tronque un message d'erreur à 50 caractères.
pub fn short_error(message: &str) -> String {
    message.chars().take(50).collect()
}

/// Les littéraux IPv6 doivent être entre crochets dans une URL.
pub fn url_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

pub fn millis(elapsed: Duration) -> u32 {
    u32::try_from(elapsed.as_millis()).unwrap_or(u32::MAX)
}
