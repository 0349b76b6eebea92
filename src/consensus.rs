// src/consensus.rs
//
// In-memory relay record and the "network status" container the selector
// filters over. Fetching the consensus from a directory authority is an
// external collaborator (see spec) -- this module only owns the parsed
// shape and a minimal reader for the `r`/`s` line pairs of a Tor consensus
// document, so tests and operators can feed it a cached document without
// this crate talking to the Tor directory system itself.

use std::collections::HashSet;

use anyhow::{Context, Result};

/// One exit candidate as listed in the consensus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relay {
    /// 40-hex-digit fingerprint, uppercase.
    pub fingerprint: String,
    pub nickname: String,
    /// Primary address (IPv4 or IPv6 literal).
    pub address: String,
    pub flags: HashSet<String>,
}

impl Relay {
    pub fn is_flagged(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_exit(&self) -> bool {
        self.is_flagged("Exit")
    }

    pub fn is_bad_exit(&self) -> bool {
        self.is_flagged("BadExit")
    }

    pub fn is_guard(&self) -> bool {
        self.is_flagged("Guard")
    }
}

/// The parsed set of relays from one consensus document.
#[derive(Debug, Clone, Default)]
pub struct NetworkStatus {
    pub relays: Vec<Relay>,
}

impl NetworkStatus {
    pub fn guards(&self) -> impl Iterator<Item = &Relay> {
        self.relays.iter().filter(|r| r.is_guard())
    }

    pub fn by_fingerprint(&self, fingerprint: &str) -> Option<&Relay> {
        self.relays.iter().find(|r| r.fingerprint == fingerprint)
    }

    /// Parse the router-status portion of a consensus document: each relay
    /// is an `r` line followed by zero or more detail lines, at least one
    /// `s` (flags) line among them. Unrecognized lines are ignored, matching
    /// the tolerant-parser style real consensus consumers use since the
    /// format gains optional fields across Tor versions.
    pub fn parse(document: &str) -> Result<Self> {
        let mut relays = Vec::new();
        let mut current: Option<Relay> = None;

        for line in document.lines() {
            if let Some(rest) = line.strip_prefix("r ") {
                if let Some(r) = current.take() {
                    relays.push(r);
                }
                current = Some(parse_r_line(rest).context("malformed 'r' line in consensus")?);
            } else if let Some(rest) = line.strip_prefix("s ") {
                if let Some(r) = current.as_mut() {
                    r.flags = rest.split_whitespace().map(|s| s.to_string()).collect();
                }
            }
        }
        if let Some(r) = current.take() {
            relays.push(r);
        }

        Ok(NetworkStatus { relays })
    }
}

/// `r nickname identity digest published IP ORPort DirPort`
/// `identity` here is accepted pre-decoded as 40 uppercase hex characters,
/// which is how this crate represents fingerprints everywhere else; a real
/// consensus document base64-encodes it, but converting that encoding is
/// the directory client's job, not this selector's.
fn parse_r_line(rest: &str) -> Result<Relay> {
    let mut fields = rest.split_whitespace();
    let nickname = fields.next().context("missing nickname")?.to_string();
    let fingerprint = fields.next().context("missing fingerprint")?.to_uppercase();
    let _digest = fields.next();
    let _published_date = fields.next();
    let _published_time = fields.next();
    let address = fields.next().context("missing address")?.to_string();

    Ok(Relay {
        fingerprint,
        nickname,
        address,
        flags: HashSet::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_relay_with_flags() {
        let doc = "\
r RelayA AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA 2024-01-01 00:00:00 203.0.113.1 9001 0
s Exit Fast Guard Running Valid
r RelayB BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB 2024-01-01 00:00:00 203.0.113.2 9001 0
s BadExit Exit Running Valid
";
        let status = NetworkStatus::parse(doc).unwrap();
        assert_eq!(status.relays.len(), 2);
        assert_eq!(status.relays[0].fingerprint, "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");
        assert!(status.relays[0].is_exit());
        assert!(!status.relays[0].is_bad_exit());
        assert!(status.relays[1].is_bad_exit());
    }

    #[test]
    fn by_fingerprint_finds_relay() {
        let doc = "r RelayA AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA 2024-01-01 00:00:00 203.0.113.1 9001 0\ns Exit Running Valid\n";
        let status = NetworkStatus::parse(doc).unwrap();
        assert!(status.by_fingerprint("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").is_some());
        assert!(status.by_fingerprint("ZZZZ").is_none());
    }
}
