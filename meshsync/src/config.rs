//! Engine configuration.
//!
//! One [`Config`] is constructed at startup and passed by reference into each
//! component; there are no process-wide globals. Defaults are conservative
//! fixed bounds; the election window and lock timeouts in particular are
//! deliberately generous so that slow peers lose liveness, not correctness.

use std::collections::HashMap;
use std::time::Duration;

use crate::resolver::DefaultResolution;

#[derive(Debug, Clone)]
pub struct Config {
    /// Policy applied when no handler matched and last-writer-wins does not
    /// cover the conflict type.
    pub default_resolution: DefaultResolution,
    /// Persist conflict records to the durable sink in addition to the
    /// structured log line.
    pub log_conflicts_to_table: bool,
    /// Include full before/after tuple images in persisted conflict records.
    /// Off by default: images may be large or sensitive.
    pub conflict_logging_include_tuples: bool,
    /// Number of values claimed per sequence chunk election.
    pub chunk_size: u64,
    /// Per-sequence overrides of `chunk_size`.
    pub sequence_chunk_sizes: HashMap<String, u64>,
    /// How long an election round stays open collecting votes before it
    /// closes with whatever arrived.
    pub election_window: Duration,
    /// Total time an acquire call keeps retrying before giving up.
    pub lock_timeout: Duration,
    /// Per-attempt window for collecting lock acknowledgments; the request
    /// is re-broadcast after each expiry.
    pub lock_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_resolution: DefaultResolution::Apply,
            log_conflicts_to_table: false,
            conflict_logging_include_tuples: false,
            chunk_size: 10_000,
            sequence_chunk_sizes: HashMap::new(),
            election_window: Duration::from_millis(500),
            lock_timeout: Duration::from_secs(10),
            lock_backoff: Duration::from_millis(500),
        }
    }
}
