//! Scrub secret-looking tokens from vendor error bodies and bound their
//! length before they are surfaced anywhere.

const MAX_DETAIL_CHARS: usize = 400;

/// Prefixes of credential material that vendors sometimes echo back in error
/// bodies: API keys, Google API keys, and OAuth access tokens.
const SECRET_PREFIXES: [&str; 4] = ["sk-", "AIza", "ya29.", "sk-ant-"];

fn secret_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_')
}

/// Replace every `<prefix><token-chars>` run with `[REDACTED]`.
pub fn scrub_secrets(input: &str) -> String {
    let mut out = input.to_string();
    for prefix in SECRET_PREFIXES {
        let mut from = 0;
        while let Some(rel) = out[from..].find(prefix) {
            let start = from + rel;
            let body_start = start + prefix.len();
            let body_len = out[body_start..]
                .char_indices()
                .take_while(|(_, c)| secret_char(*c))
                .map(|(i, c)| i + c.len_utf8())
                .last()
                .unwrap_or(0);
            if body_len == 0 {
                // A bare prefix is not a secret; keep scanning past it.
                from = body_start;
                continue;
            }
            out.replace_range(start..body_start + body_len, "[REDACTED]");
            from = start + "[REDACTED]".len();
        }
    }
    out
}

/// Sanitize a vendor error body: scrub secrets, then truncate.
pub fn sanitize_api_error(input: &str) -> String {
    let scrubbed = scrub_secrets(input);
    if scrubbed.chars().count() <= MAX_DETAIL_CHARS {
        return scrubbed;
    }
    let cut = scrubbed
        .char_indices()
        .nth(MAX_DETAIL_CHARS)
        .map(|(i, _)| i)
        .unwrap_or(scrubbed.len());
    format!("{}...", &scrubbed[..cut])
}
