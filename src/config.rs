//! Runtime configuration threaded into the parser, serializer and
//! operators. There is no process-global mutable state: callers build a
//! [`Config`] once and pass it (usually by reference) everywhere.

use serde::{Deserialize, Serialize};

/// Logging categories collected into a bitmask owned by the config
/// record. Categories select which `tracing` events the library emits
/// beyond the always-on error reporting.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogMask(pub u32);

impl LogMask {
    /// Operator completion summaries.
    pub const SHOUT: LogMask = LogMask(1 << 0);
    /// Recoverable oddities in the input.
    pub const WARN: LogMask = LogMask(1 << 1);
    /// Tag and reset fixups performed by operators.
    pub const TAGFIX: LogMask = LogMask(1 << 2);
    /// Per-event deletion reporting from squash/delete.
    pub const DELETE: LogMask = LogMask(1 << 3);
    /// Blob storage traffic.
    pub const BLOB: LogMask = LogMask(1 << 4);
    /// Topological-sort and graph-shape reporting.
    pub const TOPOLOGY: LogMask = LogMask(1 << 5);

    /// True if every category in `other` is enabled here.
    pub fn contains(&self, other: LogMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two masks.
    pub fn with(self, other: LogMask) -> LogMask {
        LogMask(self.0 | other.0)
    }
}

/// Boolean toggles and limits consumed by the core. Mirrors the
/// environment options of the external interface contract; supplied by
/// the embedding application, never read from the process environment.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Rewrite comment line endings to LF and strip trailing whitespace
    /// on read.
    pub canonicalize: bool,
    /// Emit CRLF line endings for comments on write.
    pub crlf: bool,
    /// Gzip-compress materialized blob files in the scratch directory.
    pub compress: bool,
    /// Disable parallel readers; `walk_events` runs in the calling
    /// thread.
    pub serial: bool,
    /// Deterministic identity for reproducible test output.
    pub testmode: bool,
    /// Suppress progress reporting.
    pub quiet: bool,
    /// Enable experimental operator behavior.
    pub experimental: bool,
    /// Running under an interactive front end.
    pub interactive: bool,
    /// Emit progress meters.
    pub progress: bool,
    /// Echo commands as they are executed (front-end concern, carried
    /// through for passthrough fidelity).
    pub echo: bool,
    /// Relax some well-formedness checks on malformed input.
    pub relax: bool,
    /// Worker-pool size for parallel traversal.
    pub max_parallelism: usize,
    /// Enabled logging categories.
    pub logmask: LogMask,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            canonicalize: false,
            crlf: false,
            compress: false,
            serial: false,
            testmode: false,
            quiet: false,
            experimental: false,
            interactive: false,
            progress: false,
            echo: false,
            relax: false,
            max_parallelism: num_cpus::get(),
            logmask: LogMask::SHOUT.with(LogMask::WARN),
        }
    }
}

impl Config {
    /// A configuration suitable for deterministic tests: serial
    /// traversal, fixed identity, no progress chatter.
    pub fn for_tests() -> Self {
        Self {
            serial: true,
            testmode: true,
            quiet: true,
            ..Self::default()
        }
    }
}
