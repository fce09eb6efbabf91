//! Pure predicates recognizing the debugger's interactive prompt and a small
//! set of ultra-stable structural lines that also mark command completion
//! (spec §4.1). No state; patterns are compiled once.
//!
//! These are heuristics over free-form text, not a parser of debugger
//! semantics (explicitly out of scope, spec §1) — they only ever answer
//! "does this line look like the debugger going idle".

use std::sync::LazyLock;

use regex::Regex;

/// Matches the classic `<digits>:<exactly-three-digits>[:tag]>` CDB prompt
/// shape at the *start* of a line (after optional leading whitespace).
static PROMPT_AT_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[ \t]*\d+:\d{3}(?::[A-Za-z0-9_-]+)?>").expect("valid regex"));

/// Matches the same prompt shape at the *end* of a line (ignoring a trailing
/// newline), which is how it appears when the debugger emits output then
/// immediately re-prompts on the same flush.
static PROMPT_AT_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+:\d{3}(?::[A-Za-z0-9_-]+)?>[ \t]*$").expect("valid regex"));

/// Curated, localization-stable structural markers. Matched case-insensitively
/// against the start of the trimmed line. These are binary-like artifacts of
/// the debugger's own framing (module load/unload notices, the syntax-error
/// caret line) — never natural-language status prose, which can appear mid
/// dump-load and must never be mistaken for completion (e.g. "Symbol search
/// path is:" is deliberately absent from this list).
const ULTRA_SAFE_STRUCTURAL_PREFIXES: &[&str] = &[
    "^ syntax error",
    "modload:",
    "unloaded modules",
    "quit debugging",
];

/// True iff `line` matches the debugger's interactive prompt shape, either
/// at the start (after optional whitespace) or at the very end of the line.
pub fn is_prompt(line: &str) -> bool {
    let trimmed_end = line.trim_end_matches(['\r', '\n']);
    PROMPT_AT_START.is_match(trimmed_end) || PROMPT_AT_END.is_match(trimmed_end)
}

/// True iff the trimmed line starts with one of the curated structural
/// markers. Comparison is case-insensitive.
pub fn is_ultra_safe_completion(line: &str) -> bool {
    let trimmed = line.trim();
    let lower = trimmed.to_ascii_lowercase();
    ULTRA_SAFE_STRUCTURAL_PREFIXES
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_prompt_at_start() {
        assert!(is_prompt("0:000> "));
        assert!(is_prompt("  0:001:x86> "));
    }

    #[test]
    fn recognizes_prompt_at_end_of_line() {
        assert!(is_prompt("some trailing text 0:000>\n"));
        assert!(is_prompt("some trailing text 0:000>\r\n"));
    }

    #[test]
    fn rejects_non_prompt_lines() {
        assert!(!is_prompt("Symbol search path is: srv*"));
        assert!(!is_prompt("just some text"));
        assert!(!is_prompt("0:00>")); // only two digits, not exactly three
    }

    #[test]
    fn prompt_regex_is_case_sensitive() {
        // The prompt shape has no letters to case-fold except the optional
        // tag; a different-cased tag is still a perfectly valid prompt, so
        // this documents that the *shape* match itself never depends on case.
        assert!(is_prompt("0:000:X86>"));
    }

    #[test]
    fn recognizes_ultra_safe_completion_markers() {
        assert!(is_ultra_safe_completion("ModLoad: 00007ff6 ntdll.dll"));
        assert!(is_ultra_safe_completion("  MODLOAD: something"));
        assert!(is_ultra_safe_completion("^ Syntax error in 'foo'"));
    }

    #[test]
    fn natural_language_status_is_not_a_completion_signal() {
        assert!(!is_ultra_safe_completion("Symbol search path is: srv*"));
        assert!(!is_ultra_safe_completion(
            "Loading unloaded module list..."
        ));
    }

    #[test]
    fn empty_line_is_neither_prompt_nor_structural() {
        assert!(!is_prompt(""));
        assert!(!is_ultra_safe_completion(""));
    }
}
