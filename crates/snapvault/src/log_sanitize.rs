//! Cleaning of engine output before it reaches logs or error messages.

const MAX_LINE_CHARS: usize = 2048;
const REDACTED: &str = "[redacted]";

/// Strip terminal escape sequences and control characters, cap the length,
/// and replace every occurrence of a secret with a placeholder.
pub fn clean_engine_line(input: &str, secrets: &[&str]) -> String {
    let stripped = strip_escapes(input);
    let mut out = redact(&stripped, secrets);
    if out.chars().count() > MAX_LINE_CHARS {
        out = out.chars().take(MAX_LINE_CHARS).collect();
        out.push_str(" ...[truncated]");
    }
    out
}

pub fn redact(input: &str, secrets: &[&str]) -> String {
    let mut out = input.to_string();
    for secret in secrets.iter().map(|s| s.trim()).filter(|s| s.len() >= 4) {
        if out.contains(secret) {
            out = out.replace(secret, REDACTED);
        }
    }
    out
}

fn strip_escapes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.next() {
                // CSI: parameters until a final byte in '@'..='~'.
                Some('[') => {
                    for n in chars.by_ref() {
                        if ('@'..='~').contains(&n) {
                            break;
                        }
                    }
                }
                // OSC: until BEL or ST.
                Some(']') => {
                    while let Some(n) = chars.next() {
                        if n == '\x07' {
                            break;
                        }
                        if n == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            }
            continue;
        }
        match c {
            '\t' => out.push(' '),
            '\r' | '\n' => {}
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}
