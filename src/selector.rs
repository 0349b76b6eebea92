// src/selector.rs
//
// Filters a `NetworkStatus` down to the set of relays this run should
// probe: the default Exit-minus-BadExit rule, the explicit overrides, and
// the optional shard predicate.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::consensus::{NetworkStatus, Relay};

/// How the operator wants the exit set narrowed before sharding is applied.
#[derive(Debug, Clone)]
pub enum Selection {
    /// Exit capability, BadExit excluded. The default.
    Default,
    /// `--all-exits`: Exit capability, BadExit included.
    AllExits,
    /// `--bad-exits`: only relays flagged BadExit.
    BadExitsOnly,
    /// `-e FP`: exactly one fingerprint.
    Fingerprint(String),
    /// `-E FILE`: restrict to the fingerprints listed in a file, one per line.
    FingerprintSet(HashSet<String>),
    /// `-C CC`: restrict to a country. This crate has no geo-IP database of
    /// its own; the predicate is supplied by the caller (see `Selection::Country`).
    Country(String),
}

impl Selection {
    pub fn from_fingerprint_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading fingerprint file {path:?}"))?;
        let set = content
            .lines()
            .map(|l| l.trim().to_uppercase())
            .filter(|l| !l.is_empty())
            .collect();
        Ok(Selection::FingerprintSet(set))
    }
}

/// Shard spec parsed from `--shard N/M`.
#[derive(Debug, Clone, Copy)]
pub struct Shard {
    pub n: u32,
    pub m: u32,
}

impl Shard {
    pub fn parse(spec: &str) -> Option<Self> {
        let (n, m) = spec.split_once('/')?;
        let n: u32 = n.parse().ok()?;
        let m: u32 = m.parse().ok()?;
        if m == 0 || n >= m {
            return None;
        }
        Some(Shard { n, m })
    }

    /// `SHA-256(fingerprint_ascii_upper) as big-endian integer mod M == N`.
    /// The full digest is folded byte by byte rather than truncated to a
    /// machine word, so this computes the true 256-bit value mod M instead
    /// of a different (if still uniform) function of the low bits alone.
    pub fn includes(&self, fingerprint: &str) -> bool {
        let mut hasher = Sha256::new();
        hasher.update(fingerprint.to_uppercase().as_bytes());
        let digest = hasher.finalize();
        let m = self.m as u64;
        let mut acc = 0u64;
        for b in digest {
            acc = ((acc << 8) + b as u64) % m;
        }
        acc as u32 == self.n
    }
}

/// Optional country lookup used by `Selection::Country`. The selector has
/// no built-in geo-IP database (out of scope); callers that want `-C`
/// support provide one.
pub trait CountryLookup {
    fn country_of(&self, relay: &Relay) -> Option<String>;
}

pub fn select<'a>(
    status: &'a NetworkStatus,
    selection: &Selection,
    country_lookup: Option<&dyn CountryLookup>,
    shard: Option<Shard>,
) -> Vec<&'a Relay> {
    let mut relays: Vec<&Relay> = status
        .relays
        .iter()
        .filter(|r| match selection {
            Selection::Default => r.is_exit() && !r.is_bad_exit(),
            Selection::AllExits => r.is_exit(),
            Selection::BadExitsOnly => r.is_bad_exit(),
            Selection::Fingerprint(fp) => r.fingerprint.eq_ignore_ascii_case(fp),
            Selection::FingerprintSet(set) => set.contains(&r.fingerprint),
            Selection::Country(cc) => country_lookup
                .and_then(|lookup| lookup.country_of(r))
                .map(|found| found.eq_ignore_ascii_case(cc))
                .unwrap_or(false),
        })
        .collect();

    if let Some(shard) = shard {
        relays.retain(|r| shard.includes(&r.fingerprint));
    }

    relays
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet as Set;

    fn relay(fp: &str, flags: &[&str]) -> Relay {
        Relay {
            fingerprint: fp.to_string(),
            nickname: "R".to_string(),
            address: "203.0.113.1".to_string(),
            flags: flags.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn default_excludes_bad_exit() {
        let status = NetworkStatus {
            relays: vec![
                relay("AAAA", &["Exit", "Running"]),
                relay("BBBB", &["Exit", "BadExit", "Running"]),
            ],
        };
        let selected = select(&status, &Selection::Default, None, None);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].fingerprint, "AAAA");
    }

    #[test]
    fn all_exits_includes_bad_exit() {
        let status = NetworkStatus {
            relays: vec![
                relay("AAAA", &["Exit"]),
                relay("BBBB", &["Exit", "BadExit"]),
            ],
        };
        let selected = select(&status, &Selection::AllExits, None, None);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn explicit_fingerprint_set() {
        let status = NetworkStatus {
            relays: vec![
                relay("AAAA", &["Exit"]),
                relay("BBBB", &["Exit"]),
                relay("CCCC", &["Exit"]),
            ],
        };
        let mut set = Set::new();
        set.insert("AAAA".to_string());
        set.insert("CCCC".to_string());
        let selected = select(&status, &Selection::FingerprintSet(set), None, None);
        let fps: Set<_> = selected.iter().map(|r| r.fingerprint.clone()).collect();
        assert_eq!(fps.len(), 2);
        assert!(fps.contains("AAAA"));
        assert!(fps.contains("CCCC"));
    }

    #[test]
    fn shard_union_is_disjoint_and_complete() {
        let fingerprints: Vec<String> = (0..200)
            .map(|i| format!("{:040X}", i))
            .collect();
        let m = 4;
        let mut seen = Set::new();
        for fp in &fingerprints {
            let mut hit = 0;
            for n in 0..m {
                let shard = Shard { n, m };
                if shard.includes(fp) {
                    hit += 1;
                }
            }
            assert_eq!(hit, 1, "fingerprint {fp} matched {hit} shards, expected exactly 1");
            seen.insert(fp.clone());
        }
        assert_eq!(seen.len(), fingerprints.len());
    }

    #[test]
    fn shard_parse_rejects_invalid() {
        assert!(Shard::parse("1/1").is_none()); // n must be < m
        assert!(Shard::parse("2/1").is_none());
        assert!(Shard::parse("notanumber/4").is_none());
        let shard = Shard::parse("1/4").unwrap();
        assert_eq!((shard.n, shard.m), (1, 4));
    }
}
