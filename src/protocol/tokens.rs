//! Message token helpers
//!
//! The kit wire protocol and the client command protocol are both built from
//! whitespace-delimited tokens, with `key=value` pairs for structured fields.
//! Framed payloads may carry a binary tail after the first newline (tile
//! responses), so helpers here operate on byte slices where needed.

/// First whitespace-delimited token of a command line.
///
/// Returns an empty string for empty input.
pub fn first_token(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or("")
}

/// Split a command line into its whitespace-delimited tokens.
pub fn tokenize(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

/// Look up the value of a `key=value` token in a command line.
pub fn token_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.split_whitespace().find_map(|tok| {
        let rest = tok.strip_prefix(key)?;
        rest.strip_prefix('=')
    })
}

/// Integer variant of [`token_value`].
pub fn token_int(line: &str, key: &str) -> Option<i64> {
    token_value(line, key).and_then(|v| v.parse().ok())
}

/// Split a routing prefix of the form `name-id` into its parts.
///
/// The kit prefixes messages with `client-<sessionId>` and the broker
/// prefixes forwarded commands with `child-<sessionId>`.
pub fn split_prefix(token: &str) -> Option<(&str, &str)> {
    let idx = token.find('-')?;
    let (name, rest) = token.split_at(idx);
    let id = &rest[1..];
    if name.is_empty() || id.is_empty() {
        return None;
    }
    Some((name, id))
}

/// The first line of a framed payload, without the trailing newline.
///
/// Tile responses are a textual header line followed by raw PNG bytes; the
/// header is always valid UTF-8.
pub fn first_line(payload: &[u8]) -> &str {
    let end = payload
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(payload.len());
    std::str::from_utf8(&payload[..end]).unwrap_or("")
}

/// The binary tail of a framed payload, after the first newline.
///
/// Empty when the payload is a pure text frame.
pub fn binary_tail(payload: &[u8]) -> &[u8] {
    match payload.iter().position(|&b| b == b'\n') {
        Some(idx) => &payload[idx + 1..],
        None => &[],
    }
}

/// Abbreviate a payload for logging. Binary tails are elided.
pub fn abbr(payload: &[u8]) -> String {
    const MAX: usize = 128;
    let line = first_line(payload);
    match line.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_token() {
        assert_eq!(first_token("tile part=0 width=256"), "tile");
        assert_eq!(first_token("  save"), "save");
        assert_eq!(first_token(""), "");
    }

    #[test]
    fn test_token_value() {
        let line = "errortoall: cmd=storage kind=savediskfull";
        assert_eq!(token_value(line, "cmd"), Some("storage"));
        assert_eq!(token_value(line, "kind"), Some("savediskfull"));
        assert_eq!(token_value(line, "missing"), None);
    }

    #[test]
    fn test_token_value_does_not_match_suffix() {
        // "kind" must not match the "cmd" token's tail.
        assert_eq!(token_value("procmemstats: dirty=1024", "dirt"), None);
        assert_eq!(token_int("procmemstats: dirty=1024", "dirty"), Some(1024));
    }

    #[test]
    fn test_split_prefix() {
        assert_eq!(split_prefix("client-004a"), Some(("client", "004a")));
        assert_eq!(split_prefix("client-all"), Some(("client", "all")));
        assert_eq!(split_prefix("noprefix"), None);
        assert_eq!(split_prefix("client-"), None);
    }

    #[test]
    fn test_first_line_and_tail() {
        let payload = b"tile: part=0 ver=3\n\x89PNG\r\n";
        assert_eq!(first_line(payload), "tile: part=0 ver=3");
        assert_eq!(binary_tail(payload), b"\x89PNG\r\n");
        assert_eq!(first_line(b"plain text"), "plain text");
        assert!(binary_tail(b"plain text").is_empty());
    }
}
