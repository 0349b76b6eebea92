// src/query.rs
//
// Per-attempt DNS name generation. Every attempt gets a name nothing has
// ever queried before so a resolver's cache can never mask a repeat failure.

use std::time::Instant;

const MAX_QUERY_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Builds unique query names for one run. Holds `run_id` and the run's
/// monotonic start instant so `offset_ms` is always measured the same way.
#[derive(Debug, Clone)]
pub struct QueryNameGenerator {
    run_id: String,
    run_start_monotonic: Instant,
}

impl QueryNameGenerator {
    pub fn new(run_id: impl Into<String>, run_start_monotonic: Instant) -> Self {
        Self {
            run_id: run_id.into(),
            run_start_monotonic,
        }
    }

    /// `{run_id}.{attempt}.{offset_ms}.{fingerprint}.{base_domain}`.
    ///
    /// Panics if the resulting name or the fingerprint label would violate
    /// the DNS length limits -- callers own fingerprints from the
    /// consensus, which are always 40 hex characters, so this can only
    /// happen with a misconfigured `base_domain`.
    pub fn generate(&self, fingerprint: &str, base_domain: &str, attempt: u32) -> String {
        let offset_ms = self.run_start_monotonic.elapsed().as_millis().max(0);
        let name = format!(
            "{}.{}.{}.{}.{}",
            self.run_id, attempt, offset_ms, fingerprint, base_domain
        );

        assert!(
            name.len() <= MAX_QUERY_LEN,
            "generated query name {name:?} exceeds {MAX_QUERY_LEN} octets"
        );
        for label in name.split('.') {
            assert!(
                label.len() <= MAX_LABEL_LEN,
                "label {label:?} in query name {name:?} exceeds {MAX_LABEL_LEN} octets"
            );
        }

        name
    }
}
