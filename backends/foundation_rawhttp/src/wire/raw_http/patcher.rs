//! Host and Content-Length patching for caller supplied raw requests.
//!
//! The raw buffer may be malformed on purpose, so the patcher only touches
//! the two fields it owns. Every other line keeps its position and bytes;
//! only the line separator is normalized to `\r\n`.

use super::{parse_request_line, Version};

/// Which automatic fields to fix up in a raw request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchOptions {
    pub automatic_host: bool,
    pub automatic_content_length: bool,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            automatic_host: true,
            automatic_content_length: true,
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn split_lines<'a>(block: &'a [u8], separator: &'a [u8]) -> Vec<&'a [u8]> {
    let mut lines = Vec::new();
    let mut rest = block;
    while let Some(index) = find_subslice(rest, separator) {
        lines.push(&rest[..index]);
        rest = &rest[index + separator.len()..];
    }
    lines.push(rest);
    lines
}

fn starts_with_ignore_case(line: &[u8], prefix: &[u8]) -> bool {
    line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Replaces the first header line starting with `prefix` (skipping the
/// request line) or appends `replacement` when there is none.
fn replace_or_append(lines: &mut Vec<Vec<u8>>, prefix: &[u8], replacement: Vec<u8>, append: bool) {
    let found = lines
        .iter()
        .skip(1)
        .position(|line| starts_with_ignore_case(line, prefix));

    match found {
        Some(index) => lines[index + 1] = replacement,
        None if append => lines.push(replacement),
        None => {}
    }
}

/// Rewrites `raw` so that its `Host` and `Content-Length` headers match the
/// target host and the actual body.
///
/// The separator is `\r\n` when the buffer contains one, `\n` otherwise.
/// The head is split from the body at the first doubled separator; a buffer
/// without one is treated as headers only and never gains a
/// Content-Length line.
///
/// Only the first `Host:` and the first `Content-Length:` line are
/// replaced. Later duplicates are kept untouched, so a buffer that repeats
/// either header still repeats it after patching.
#[must_use]
pub fn patch_raw_request(raw: &[u8], host: &str, options: PatchOptions) -> Vec<u8> {
    let separator: &[u8] = if find_subslice(raw, b"\r\n").is_some() {
        b"\r\n"
    } else {
        b"\n"
    };
    let doubled = [separator, separator].concat();

    let (head, body) = match find_subslice(raw, &doubled) {
        Some(index) => (&raw[..index], Some(&raw[index + doubled.len()..])),
        None => {
            let head = raw.strip_suffix(separator).unwrap_or(raw);
            (head, None)
        }
    };

    let mut lines: Vec<Vec<u8>> = split_lines(head, separator)
        .into_iter()
        .map(<[u8]>::to_vec)
        .collect();

    if options.automatic_host {
        let line = format!("Host: {host}").into_bytes();
        replace_or_append(&mut lines, b"host:", line, true);
    }

    if options.automatic_content_length {
        let length = body.map_or(0, <[u8]>::len);
        let line = format!("Content-Length: {length}").into_bytes();
        replace_or_append(&mut lines, b"content-length:", line, body.is_some());
    }

    let mut out = Vec::with_capacity(raw.len() + host.len() + 40);
    for line in &lines {
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    if let Some(body) = body {
        out.extend_from_slice(body);
    }
    out
}

/// Version token of a raw request's first line, when it parses.
#[must_use]
pub fn raw_request_version(raw: &[u8]) -> Option<Version> {
    let end = raw.iter().position(|byte| *byte == b'\n').unwrap_or(raw.len());
    let line = std::str::from_utf8(&raw[..end]).ok()?;
    parse_request_line(line).ok().map(|(_, _, version)| version)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_only() -> PatchOptions {
        PatchOptions {
            automatic_host: true,
            automatic_content_length: false,
        }
    }

    fn count_lines_starting(bytes: &[u8], prefix: &str) -> usize {
        String::from_utf8_lossy(bytes)
            .split("\r\n")
            .filter(|line| line.to_ascii_lowercase().starts_with(prefix))
            .count()
    }

    #[test]
    fn test_replaces_existing_host_line() {
        let patched = patch_raw_request(
            b"GET /x HTTP/1.1\r\nHost: old\r\n\r\n",
            "example.com:80",
            host_only(),
        );
        assert_eq!(patched, b"GET /x HTTP/1.1\r\nHost: example.com:80\r\n\r\n");
    }

    #[test]
    fn test_appends_host_and_normalizes_separators() {
        let patched = patch_raw_request(
            b"GET / HTTP/1.1\nX-Test: 1\n\n",
            "example.com",
            host_only(),
        );
        assert_eq!(
            patched,
            b"GET / HTTP/1.1\r\nX-Test: 1\r\nHost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn test_host_match_is_case_insensitive_and_keeps_order() {
        let patched = patch_raw_request(
            b"GET / HTTP/1.1\r\nA: 1\r\nhOsT: old\r\nB: 2\r\n\r\n",
            "new",
            host_only(),
        );
        assert_eq!(patched, b"GET / HTTP/1.1\r\nA: 1\r\nHost: new\r\nB: 2\r\n\r\n");
    }

    /// WHY: Duplicate Host lines are a deliberate smuggling shape
    /// WHAT: Only the first Host line is rewritten; the second survives
    #[test]
    fn test_duplicate_host_lines_keep_the_later_ones() {
        let patched = patch_raw_request(
            b"GET / HTTP/1.1\r\nHost: a\r\nHost: b\r\n\r\n",
            "target",
            host_only(),
        );
        assert_eq!(patched, b"GET / HTTP/1.1\r\nHost: target\r\nHost: b\r\n\r\n");
        assert_eq!(count_lines_starting(&patched, "host:"), 2);
    }

    #[test]
    fn test_content_length_matches_body_exactly_once() {
        let raws: [&[u8]; 3] = [
            b"POST / HTTP/1.1\r\nHost: a\r\n\r\nhello world",
            b"POST / HTTP/1.1\r\ncontent-length: 999\r\n\r\nhello world",
            b"POST / HTTP/1.1\nHOST: a\nContent-Length: 1\n\nhello world",
        ];

        for raw in raws {
            let patched = patch_raw_request(raw, "target:8080", PatchOptions::default());
            assert_eq!(count_lines_starting(&patched, "host:"), 1);
            assert_eq!(count_lines_starting(&patched, "content-length:"), 1);

            let text = String::from_utf8(patched).unwrap();
            assert!(text.contains("Host: target:8080\r\n"));
            assert!(text.contains("Content-Length: 11\r\n"));
            assert!(text.ends_with("\r\n\r\nhello world"));
        }
    }

    #[test]
    fn test_body_bytes_are_not_touched() {
        let patched = patch_raw_request(
            b"POST / HTTP/1.1\nHost: a\n\nline1\nline2\n\nline3",
            "a",
            PatchOptions::default(),
        );
        assert!(patched.ends_with(b"\r\n\r\nline1\nline2\n\nline3"));
        assert_eq!(count_lines_starting(&patched, "content-length: 18"), 1);
    }

    #[test]
    fn test_headers_only_buffer_gets_no_content_length() {
        let patched = patch_raw_request(
            b"GET / HTTP/1.1\r\nHost: a\r\n",
            "b",
            PatchOptions::default(),
        );
        assert_eq!(patched, b"GET / HTTP/1.1\r\nHost: b\r\n\r\n");
    }

    #[test]
    fn test_disabled_options_only_normalize() {
        let patched = patch_raw_request(
            b"GET / HTTP/1.1\nHost: a\n\n",
            "b",
            PatchOptions {
                automatic_host: false,
                automatic_content_length: false,
            },
        );
        assert_eq!(patched, b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
    }

    #[test]
    fn test_raw_request_version() {
        assert_eq!(
            raw_request_version(b"GET / HTTP/1.0\r\nHost: a\r\n\r\n"),
            Some(Version::HTTP_1_0)
        );
        assert_eq!(raw_request_version(b"garbage\r\n\r\n"), None);
    }
}
