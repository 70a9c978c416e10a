#![allow(clippy::module_name_repetitions)]
//! Small utilities: header terminators, header-name canonicalization, percent decoding,
//! lexical path cleaning.

pub mod backoff;
pub mod encoding;

pub use backoff::{poll_until, Backoff};

pub fn find_crlfcrlf(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    let pattern: &[u8; 4] = b"\r\n\r\n";
    buf.windows(4).position(|w| w == pattern)
}

/// Find end of HTTP headers, accepting either CRLF-CRLF or LF-LF separators.
/// Returns the index just after the header terminator when found.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    if let Some(pos) = find_crlfcrlf(buf) {
        return Some(pos + 4);
    }
    buf.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2)
}

/// Extract outer single or double quotes if the whole string is wrapped.
pub fn strip_outer_quotes(s: &str) -> String {
    if s.len() >= 2 {
        let b = s.as_bytes();
        let first = b[0] as char;
        let last = b[s.len() - 1] as char;
        if (first == '\'' && last == '\'') || (first == '"' && last == '"') {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

/// `content-type` -> `Content-Type`, `x-filename` -> `X-Filename`.
pub fn canonical_header_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if upper {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push(ch.to_ascii_lowercase());
        }
        upper = ch == '-';
    }
    out
}

/// Percent-decode a URL path. Unlike form decoding, '+' stays literal.
/// Invalid escapes are preserved; invalid UTF-8 is replaced lossily.
pub fn percent_decode_path(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let v1 = (bytes[i + 1] as char).to_digit(16);
            let v2 = (bytes[i + 2] as char).to_digit(16);
            if let (Some(a), Some(b)) = (v1, v2) {
                out.push(((a << 4) + b) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Lexically normalize a '/'-separated relative path: drop empty and '.' segments,
/// resolve '..'. Returns None when '..' would climb above the root.
pub fn clean_relative(path: &str) -> Option<Vec<String>> {
    let mut parts: Vec<String> = Vec::new();
    for seg in path.split(['/', '\\']) {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            s => parts.push(s.to_string()),
        }
    }
    Some(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_crlfcrlf_cases() {
        assert_eq!(find_crlfcrlf(b"\r\n\r\n"), Some(0));
        assert_eq!(find_crlfcrlf(b"abc\r\n\r\ndef"), Some(3));
        assert_eq!(find_crlfcrlf(b"abcdef"), None);
        assert_eq!(find_crlfcrlf(b"\r\n\r"), None);
        assert_eq!(find_header_end(b"GET / HTTP/1.1\n\nbody"), Some(16));
    }

    #[test]
    fn test_strip_outer_quotes_variants() {
        assert_eq!(strip_outer_quotes("\"abc\""), "abc");
        assert_eq!(strip_outer_quotes("noquote"), "noquote");
        assert_eq!(strip_outer_quotes("'mismatch\""), "'mismatch\"");
    }

    #[test]
    fn test_canonical_header_key() {
        assert_eq!(canonical_header_key("content-type"), "Content-Type");
        assert_eq!(canonical_header_key("X-FILENAME"), "X-Filename");
        assert_eq!(canonical_header_key("host"), "Host");
    }

    #[test]
    fn test_percent_decode_path() {
        assert_eq!(percent_decode_path("/a%20b+c"), "/a b+c");
        assert_eq!(percent_decode_path("/%41%42%43"), "/ABC");
        assert_eq!(percent_decode_path("/bad%zz%4"), "/bad%zz%4");
    }

    #[test]
    fn test_clean_relative() {
        assert_eq!(
            clean_relative("a/./b//c/../d"),
            Some(vec!["a".to_string(), "b".to_string(), "d".to_string()])
        );
        assert_eq!(clean_relative("../etc/passwd"), None);
        assert_eq!(clean_relative("a/../../b"), None);
        assert_eq!(clean_relative(""), Some(vec![]));
    }
}
