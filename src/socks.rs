// src/socks.rs
//
// Speaks SOCKS5 *as the client* against Tor's SOCKS listener, issuing the
// Tor-specific RESOLVE command (0xF0) instead of CONNECT (0x01). This is
// the mirror image of the teacher's `proxy.rs`, which speaks SOCKS5 as the
// *server* side of a different connection; the manual byte-level handshake
// style carries over directly.

use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Tor's RESOLVE command byte, in place of the standard CONNECT (0x01).
const CMD_RESOLVE: u8 = 0xF0;
const ATYP_DOMAIN: u8 = 0x03;

/// Outcome of one SOCKS RESOLVE exchange, before mode-specific (wildcard vs.
/// NXDOMAIN) interpretation is applied by the probe worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// A 4-byte IPv4 answer.
    Answer(Ipv4Addr),
    /// The reply payload did not parse as an IPv4 literal (e.g. the relay
    /// software returned something unexpected). Treated like an unparseable
    /// answer per the probe worker's edge-case rule, never like an error.
    NonIpv4Answer(String),
    /// A SOCKS failure reply, carrying the raw reply code byte so
    /// classification never has to string-match error text.
    SocksError(u8),
    /// No reply arrived within the exchange timeout.
    Timeout,
    /// The connection closed before a full reply was read.
    Eof,
}

/// Minimal async-trait substitute (hand-written to avoid an extra
/// dependency): lets the probe worker's retry loop be generic over a real
/// client or, in tests, a scripted fake.
pub trait SocksResolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        domain: &'a str,
        exchange_timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = ResolveOutcome> + Send + 'a>>;
}

/// Talks to one Tor SOCKS listener. Each call opens its own TCP connection
/// (and hence, via the engine's stream-attach coordination, is bound to
/// exactly one prebuilt circuit) -- no connection reuse across attempts.
#[derive(Debug, Clone)]
pub struct SocksDnsClient {
    socks_addr: String,
}

impl SocksDnsClient {
    pub fn new(socks_addr: impl Into<String>) -> Self {
        Self {
            socks_addr: socks_addr.into(),
        }
    }

    async fn resolve_inner(&self, domain: &str, exchange_timeout: Duration) -> ResolveOutcome {
        let attempt = timeout(exchange_timeout, self.exchange(domain));
        match attempt.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_eof)) => ResolveOutcome::Eof,
            Err(_elapsed) => ResolveOutcome::Timeout,
        }
    }

    async fn exchange(&self, domain: &str) -> std::io::Result<ResolveOutcome> {
        let mut stream = TcpStream::connect(&self.socks_addr).await?;

        // Greeting: version 5, one method, no-auth.
        stream.write_all(&[0x05, 0x01, 0x00]).await?;
        let mut greeting_reply = [0u8; 2];
        stream.read_exact(&mut greeting_reply).await?;
        if greeting_reply[0] != 0x05 || greeting_reply[1] != 0x00 {
            return Ok(ResolveOutcome::SocksError(0x01));
        }

        // RESOLVE request: VER=5, CMD=0xF0, RSV=0, ATYP=3 (domain).
        let mut request = vec![0x05, CMD_RESOLVE, 0x00, ATYP_DOMAIN];
        request.push(domain.len() as u8);
        request.extend_from_slice(domain.as_bytes());
        request.extend_from_slice(&0u16.to_be_bytes()); // port is unused by RESOLVE
        stream.write_all(&request).await?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        let reply_code = header[1];

        if reply_code != 0x00 {
            return Ok(ResolveOutcome::SocksError(reply_code));
        }

        match header[3] {
            0x01 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
                let mut port = [0u8; 2];
                stream.read_exact(&mut port).await?;
                Ok(ResolveOutcome::Answer(Ipv4Addr::from(addr)))
            }
            0x04 => {
                // IPv6 answer: out of scope per spec, but read it off the
                // wire so the connection stays well-formed, and surface it
                // as a non-IPv4 answer for the worker's edge-case rule.
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
                let mut port = [0u8; 2];
                stream.read_exact(&mut port).await?;
                Ok(ResolveOutcome::NonIpv4Answer(
                    std::net::Ipv6Addr::from(addr).to_string(),
                ))
            }
            _ => Ok(ResolveOutcome::SocksError(0x01)),
        }
    }
}

impl SocksResolver for SocksDnsClient {
    fn resolve<'a>(
        &'a self,
        domain: &'a str,
        exchange_timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = ResolveOutcome> + Send + 'a>> {
        Box::pin(self.resolve_inner(domain, exchange_timeout))
    }
}

/// The SOCKS-reply-code -> classification mapping from the external
/// contract (spec section on SOCKS5 with Tor extensions). `nxdomain_is_ok`
/// is true in NXDOMAIN mode, where reply `0x04` means success rather than
/// a `dns` failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksFailClass {
    Dns(&'static str),
    Circuit,
}

pub fn classify_socks_error(code: u8) -> SocksFailClass {
    match code {
        0x01 | 0x02 | 0x03 | 0x06 => SocksFailClass::Circuit,
        0x04 => SocksFailClass::Dns("nxdomain"),
        0x05 => SocksFailClass::Dns("refused"),
        0x07 | 0x08 => SocksFailClass::Dns("unsupported"),
        _ => SocksFailClass::Circuit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_reply_codes_per_contract() {
        assert_eq!(classify_socks_error(0x01), SocksFailClass::Circuit);
        assert_eq!(classify_socks_error(0x02), SocksFailClass::Circuit);
        assert_eq!(classify_socks_error(0x03), SocksFailClass::Circuit);
        assert_eq!(classify_socks_error(0x04), SocksFailClass::Dns("nxdomain"));
        assert_eq!(classify_socks_error(0x05), SocksFailClass::Dns("refused"));
        assert_eq!(classify_socks_error(0x06), SocksFailClass::Circuit);
        assert_eq!(classify_socks_error(0x07), SocksFailClass::Dns("unsupported"));
        assert_eq!(classify_socks_error(0x08), SocksFailClass::Dns("unsupported"));
        assert_eq!(classify_socks_error(0x42), SocksFailClass::Circuit);
    }
}
