//! Output normalization: turn raw CLI text into the command's result.

use std::sync::LazyLock;

use regex::Regex;

use super::buffer::PAGER_MARKER;

/// Pager text some platforms print after the marker itself.
static PAGER_REMNANT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"--More--(?:,\s*next page:[^\n]*?quit:\s*Control-c)?")
        .expect("pager remnant pattern is valid")
});

/// Apply terminal overwrite semantics to one line and drop noise.
///
/// A bare `\r` returns the cursor to column 0, so only the last
/// segment with visible content survives. Backspaces erase the previous
/// character. Pager remnants and control bytes other than tab go away.
pub fn clean_line(line: &str) -> String {
    let line = line
        .split('\r')
        .rev()
        .find(|segment| !segment.trim().is_empty())
        .unwrap_or("");

    let mut out = String::with_capacity(line.len());
    for c in line.chars() {
        match c {
            '\x08' => {
                out.pop();
            }
            '\t' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }

    if out.contains(PAGER_MARKER) {
        out = PAGER_REMNANT.replace_all(&out, "").into_owned();
    }
    out
}

/// Clean a whole block of output line by line.
///
/// Lines that held nothing but a pager marker are dropped entirely.
pub fn clean_text(raw: &str) -> String {
    raw.split('\n')
        .filter_map(|line| {
            let cleaned = clean_line(line);
            let was_pager_only = line.contains(PAGER_MARKER) && cleaned.trim().is_empty();
            (!was_pager_only).then_some(cleaned)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Strip the command echo and the trailing prompt from raw output.
///
/// `is_prompt` decides whether the final line is the device prompt.
pub fn normalize_output(raw: &str, command: &str, is_prompt: impl Fn(&str) -> bool) -> String {
    let text = clean_text(raw);
    let mut lines: Vec<&str> = text.split('\n').collect();

    let echo = command.trim();
    if let Some(pos) = lines.iter().position(|l| l.trim() == echo) {
        lines.remove(pos);
    }

    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    if lines.last().is_some_and(|l| is_prompt(l)) {
        lines.pop();
    }

    let start = lines
        .iter()
        .position(|l| !l.trim().is_empty())
        .unwrap_or(lines.len());
    lines[start..].join("\n").trim_end().to_string()
}
