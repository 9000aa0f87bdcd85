//! Logging helpers that keep modem chatter and BBS payloads on a single log line.

use std::fmt::Write;

/// Longest preview emitted for a single payload.
const MAX_PREVIEW: usize = 80;

/// Escape a string for single-line logging. CR, LF and TAB become `\r`, `\n`,
/// `\t`; other control characters become `\xNN`. Output is capped at
/// [`MAX_PREVIEW`] characters with a trailing ellipsis.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Same as [`escape_log`] for raw bytes off the wire. Non-ASCII bytes are
/// shown as `\xNN` rather than decoded.
pub fn escape_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().min(MAX_PREVIEW) + 8);
    for (count, &b) in data.iter().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7E => out.push(b as char),
            _ => {
                let _ = write!(&mut out, "\\x{:02X}", b);
            }
        }
    }
    out
}
