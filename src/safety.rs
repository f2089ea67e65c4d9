//! Output sanitization for agent text.
//!
//! Agent output comes from a CLI-style runtime and may carry color codes
//! and other terminal control sequences. Everything shown to the user goes
//! through [`strip_ansi`] first.

use std::sync::LazyLock;

use regex::Regex;

/// CSI sequences (`ESC [` or the 8-bit `0x9B` introducer) with numeric params.
static CSI_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x1b\x{9b}]\[[()#;?]*?(?:(?:[0-9]{1,4}(?:;[0-9]{0,4})*)?[0-9A-OR-Zcf-nqry=><])")
        .unwrap()
});

/// OSC sequences (window titles, hyperlinks), terminated by BEL or `ESC \`.
static OSC_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").unwrap());

/// Remove terminal control sequences from `input`.
///
/// Idempotent: stripping one sequence can expose another (`"\x1b\x1b[0m[0m"`),
/// so passes repeat until the text stops changing. Each pass only ever
/// shortens the string. Malformed or dangling escapes are left in place.
pub fn strip_ansi(input: &str) -> String {
    let mut current = input.to_string();
    loop {
        let next = strip_once(&current);
        if next.len() == current.len() {
            return current;
        }
        current = next;
    }
}

fn strip_once(input: &str) -> String {
    if !input.contains(['\x1b', '\u{9b}']) {
        return input.to_string();
    }
    let without_osc = OSC_PATTERN.replace_all(input, "");
    CSI_PATTERN.replace_all(&without_osc, "").into_owned()
}
