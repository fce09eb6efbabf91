//! Classifies lines emitted by the debugger against the sentinel pair framing
//! the command currently in flight (spec §4.2).
//!
//! Precedence is fixed and never reordered: an end sentinel always wins, even
//! if the same line also happens to look like a prompt or a start sentinel;
//! failing that a start sentinel; failing that the prompt shape; failing that
//! a curated structural marker; anything else is payload.

use cdbx_core::sentinel::Sentinels;
use cdbx_patterns::{is_prompt, is_ultra_safe_completion};

/// Why a line was judged to mark the end of the current command's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// The debugger's interactive prompt shape.
    Prompt,
    /// A curated, localization-stable structural marker.
    UltraSafeStructural,
}

/// Result of classifying one line of debugger output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Line contains the current command's start sentinel.
    StartSentinel,
    /// Line contains the current command's end sentinel — authoritative,
    /// never overridden by a heuristic completion signal.
    EndSentinel,
    /// No sentinel present, but the line heuristically looks like the
    /// debugger has gone idle (prompt or structural marker).
    Complete(CompletionReason),
    /// Ordinary output belonging to the command currently in flight.
    Payload,
}

/// Stateful only in which command's sentinel pair it is currently watching
/// for; holds no buffered text itself (the executor owns accumulation).
#[derive(Debug, Default)]
pub struct OutputParser {
    current: Option<Sentinels>,
}

impl OutputParser {
    pub fn new() -> Self {
        Self { current: None }
    }

    /// Begin watching for `sentinels`, replacing whatever command (if any)
    /// was previously in flight.
    pub fn set_current_command(&mut self, sentinels: Sentinels) {
        self.current = Some(sentinels);
    }

    /// Stop watching for any command; subsequent lines classify only against
    /// the heuristic layer.
    pub fn clear_current_command(&mut self) {
        self.current = None;
    }

    pub fn has_current_command(&self) -> bool {
        self.current.is_some()
    }

    /// Classify one line per the fixed precedence: end sentinel, start
    /// sentinel, prompt shape, ultra-safe structural marker, else payload.
    pub fn classify(&self, line: &str) -> Classification {
        if let Some(sentinels) = &self.current {
            if sentinels.is_end(line) {
                return Classification::EndSentinel;
            }
            if sentinels.is_start(line) {
                return Classification::StartSentinel;
            }
        }
        if is_prompt(line) {
            return Classification::Complete(CompletionReason::Prompt);
        }
        if is_ultra_safe_completion(line) {
            return Classification::Complete(CompletionReason::UltraSafeStructural);
        }
        Classification::Payload
    }
}
