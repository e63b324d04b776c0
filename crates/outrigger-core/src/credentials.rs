//! Credential validation through the local proxy
//!
//! The Shadowsocks process gives no readiness or authentication feedback,
//! so the only way to learn whether the supplied password and cipher are
//! accepted is to push real traffic through it: a SOCKS5 CONNECT to a
//! well-known domain followed by a minimal HTTP HEAD, accepted iff the
//! reply starts with an HTTP status line.
//!
//! A failed probe cannot distinguish "wrong password or cipher" from "that
//! test domain happens to be down"; the conflation is deliberate and
//! callers should not over-interpret the resulting error code. The domain
//! list is shuffled per attempt to spread load and avoid a single point of
//! failure.

use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::Result;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

/// Well-known domains used for the HTTP probe
const TEST_DOMAINS: &[&str] = &[
    "example.com",
    "www.google.com",
    "www.wikipedia.org",
    "www.cloudflare.com",
    "www.amazon.com",
];

/// Credential validation seam for the lifecycle controller
#[async_trait]
pub trait CredentialCheck: Send + Sync {
    /// Returns Ok(true) when an HTTP response was obtained through the
    /// proxy at `proxy_addr`, Ok(false) otherwise.
    async fn validate(&self, proxy_addr: &str) -> Result<bool>;
}

/// Validator issuing an HTTP-over-SOCKS probe through the local endpoint
#[derive(Debug, Clone)]
pub struct SocksCredentialValidator {
    domains: Vec<String>,
    limit: Duration,
}

impl SocksCredentialValidator {
    pub fn new(limit: Duration) -> Self {
        Self {
            domains: TEST_DOMAINS.iter().map(|d| d.to_string()).collect(),
            limit,
        }
    }

    /// Override the probe domains (tests, captive environments)
    pub fn with_domains(mut self, domains: Vec<String>) -> Self {
        self.domains = domains;
        self
    }

    async fn try_domains(&self, proxy_addr: &str, domains: &[String]) -> bool {
        for domain in domains {
            match probe_domain(proxy_addr, domain).await {
                Ok(true) => return true,
                Ok(false) => debug!("credential probe via {} rejected", domain),
                Err(e) => debug!("credential probe via {} failed: {}", domain, e),
            }
        }
        false
    }
}

#[async_trait]
impl CredentialCheck for SocksCredentialValidator {
    async fn validate(&self, proxy_addr: &str) -> Result<bool> {
        let mut domains = self.domains.clone();
        domains.shuffle(&mut rand::thread_rng());

        // The whole probe shares one deadline so a hung proxy cannot stall
        // the connect pipeline.
        match timeout(self.limit, self.try_domains(proxy_addr, &domains)).await {
            Ok(valid) => Ok(valid),
            Err(_) => {
                debug!("credential probe timed out after {:?}", self.limit);
                Ok(false)
            }
        }
    }
}

/// One SOCKS5 CONNECT + HTTP HEAD exchange against a single domain
async fn probe_domain(proxy_addr: &str, domain: &str) -> std::io::Result<bool> {
    let mut stream = TcpStream::connect(proxy_addr).await?;

    // Greeting: offer the no-auth method only.
    stream
        .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
        .await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [SOCKS_VERSION, METHOD_NO_AUTH] {
        return Ok(false);
    }

    // CONNECT <domain>:80
    let mut request = vec![
        SOCKS_VERSION,
        CMD_CONNECT,
        0x00,
        ATYP_DOMAIN,
        domain.len() as u8,
    ];
    request.extend_from_slice(domain.as_bytes());
    request.extend_from_slice(&80u16.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION || reply[1] != REPLY_SUCCEEDED {
        return Ok(false);
    }

    // Consume the bound address so the stream is positioned at the payload.
    let remaining = match reply[3] {
        ATYP_IPV4 => 6,
        ATYP_IPV6 => 18,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        _ => return Ok(false),
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await?;

    let head = format!("HEAD / HTTP/1.1\r\nHost: {domain}\r\nConnection: close\r\n\r\n");
    stream.write_all(head.as_bytes()).await?;

    let mut status = [0u8; 5];
    stream.read_exact(&mut status).await?;
    Ok(&status == b"HTTP/")
}
