//! Post-processing: deterministic cleanup of extracted Markdown, and the
//! rewrite of bare image references into absolute service URLs.
//!
//! Text pulled out of a PDF carries the document's own quirks: `\r` line
//! breaks from old producers, runs of empty lines where the layout had
//! whitespace, zero-width characters and soft hyphens used for justification.
//! Each rule is a pure `&str → String` pass, applied in a fixed order:
//! line endings first so every later rule can assume `\n`.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashSet;

/// Apply all cleanup rules to the raw extracted text.
///
/// 1. Normalise line endings (CRLF / CR → LF)
/// 2. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 3. Trim trailing whitespace per line
/// 4. Collapse 3+ consecutive blank lines down to 2
/// 5. Ensure the document ends with exactly one newline
pub fn clean_markdown(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    ensure_final_newline(&s)
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Strip invisible characters ───────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            !matches!(
                c,
                '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}'
            )
        })
        .collect()
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").into_owned()
}

// ── Rule 5: Ensure file ends with single newline ─────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{}\n", trimmed)
    }
}

// ── Image links ──────────────────────────────────────────────────────────────

static RE_IMAGE_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[(?P<alt>[^\]]*)\]\((?P<target>[^)\s]+)\)").unwrap());

/// Point image links at the service's image route.
///
/// `![alt](fig1.png)` becomes `![alt]({images_base}/fig1.png)` when
/// `fig1.png` is one of `names`. Links to anything else (remote URLs, images
/// the converter did not emit) are left untouched.
pub fn rewrite_image_links<S: AsRef<str>>(markdown: &str, images_base: &str, names: &[S]) -> String {
    if names.is_empty() {
        return markdown.to_string();
    }
    let known: HashSet<&str> = names.iter().map(AsRef::as_ref).collect();
    let base = images_base.trim_end_matches('/');
    RE_IMAGE_LINK
        .replace_all(markdown, |caps: &Captures<'_>| {
            let target = &caps["target"];
            let name = target.strip_prefix("./").unwrap_or(target);
            if known.contains(name) {
                format!("![{}]({}/{})", &caps["alt"], base, name)
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}
