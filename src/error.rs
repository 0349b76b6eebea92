// src/error.rs
//
// Fatal, scan-aborting errors only. Per-relay outcomes are never represented
// here -- see `probe::ProbeOutcome` for the closed sum type the retry policy
// dispatches on.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("could not connect to Tor control port at {addr}: {source}")]
    ControlConnect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tor control authentication failed: {0}")]
    ControlAuth(String),

    #[error("analysis directory {0:?} is not writable")]
    AnalysisDirUnwritable(PathBuf),

    #[error("no consensus available to select relays from")]
    NoConsensus,

    #[error("--shard must be of the form N/M with N < M, got {0}")]
    InvalidShard(String),

    #[error("relay fingerprint file {0:?} could not be read")]
    FingerprintFileUnreadable(PathBuf),
}
