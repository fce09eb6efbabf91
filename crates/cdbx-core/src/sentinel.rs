//! Fixed sentinel markers used to frame a command's output region.
//!
//! The core never guesses at debugger semantics; it recognizes exactly two
//! literal strings injected by the executor itself (see `cdbx-executor`).
//! Resolved Open Question (spec §9): both markers carry a per-command nonce
//! so payload data that happens to contain the literal marker text cannot be
//! mistaken for framing — only a line containing `<marker>-<nonce>` for the
//! *current* command counts.

use std::fmt;

/// Stable, process-wide marker prefixes. Never change these across a release
/// without treating it as a breaking protocol change (spec §6).
pub const START_MARKER_PREFIX: &str = "CDBX_SENTINEL_COMMAND_START";
pub const END_MARKER_PREFIX: &str = "CDBX_SENTINEL_COMMAND_END";
pub const BATCH_START_PREFIX: &str = "CDBX_SENTINEL_BATCH_START";
pub const BATCH_END_PREFIX: &str = "CDBX_SENTINEL_BATCH_END";
pub const COMMAND_SEPARATOR: &str = ";";

/// A start/end sentinel pair scoped to one command execution.
///
/// Constructed once per command by the executor; the nonce is whatever
/// unique id the caller supplies (the command id is a natural choice, and
/// is what `cdbx-queue` passes in).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinels {
    start: String,
    end: String,
}

impl Sentinels {
    /// Build a sentinel pair suffixed with `nonce` (typically the command id).
    pub fn for_nonce(nonce: &str) -> Self {
        Self {
            start: format!("{START_MARKER_PREFIX}_{nonce}"),
            end: format!("{END_MARKER_PREFIX}_{nonce}"),
        }
    }

    /// Build a pair from already-rendered marker strings, e.g. to let an
    /// `OutputParser` watch a [`BatchSentinels`] pair through the same
    /// `Sentinels`-shaped API.
    pub fn from_markers(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn start_marker(&self) -> &str {
        &self.start
    }

    pub fn end_marker(&self) -> &str {
        &self.end
    }

    /// True iff `line` contains this pair's end marker literal.
    pub fn is_end(&self, line: &str) -> bool {
        line.contains(&self.end)
    }

    /// True iff `line` contains this pair's start marker literal.
    pub fn is_start(&self, line: &str) -> bool {
        line.contains(&self.start)
    }
}

impl fmt::Display for Sentinels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} .. {}]", self.start, self.end)
    }
}

/// Batch framing pair: one sentinel wraps a semicolon-joined compound
/// command, with no per-subcommand sentinels (spec §4.5 batch variant).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSentinels {
    start: String,
    end: String,
}

impl BatchSentinels {
    pub fn for_nonce(nonce: &str) -> Self {
        Self {
            start: format!("{BATCH_START_PREFIX}_{nonce}"),
            end: format!("{BATCH_END_PREFIX}_{nonce}"),
        }
    }

    pub fn start_marker(&self) -> &str {
        &self.start
    }

    pub fn end_marker(&self) -> &str {
        &self.end
    }

    pub fn is_end(&self, line: &str) -> bool {
        line.contains(&self.end)
    }

    pub fn is_start(&self, line: &str) -> bool {
        line.contains(&self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn different_nonces_produce_different_markers() {
        let a = Sentinels::for_nonce("cmd-1");
        let b = Sentinels::for_nonce("cmd-2");
        assert_ne!(a.start_marker(), b.start_marker());
        assert_ne!(a.end_marker(), b.end_marker());
    }

    #[test]
    fn recognizes_own_markers_only() {
        let a = Sentinels::for_nonce("cmd-1");
        let b = Sentinels::for_nonce("cmd-2");
        let line = format!("payload line containing {}", a.end_marker());
        assert!(a.is_end(&line));
        assert!(!b.is_end(&line));
    }

    #[test]
    fn start_and_end_are_distinct_strings() {
        let pair = Sentinels::for_nonce("x");
        assert_ne!(pair.start_marker(), pair.end_marker());
    }

    #[test]
    fn batch_markers_are_independent_of_command_markers() {
        let cmd = Sentinels::for_nonce("n");
        let batch = BatchSentinels::for_nonce("n");
        assert_ne!(cmd.start_marker(), batch.start_marker());
        assert_ne!(cmd.end_marker(), batch.end_marker());
    }
}
