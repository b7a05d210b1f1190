//! HTTP parsing and body decoding
//!
//! Parses each flow item as an HTTP/1.x request or response. Successfully
//! parsed items tag the flow `http`; encoded response bodies are decoded
//! (gzip, deflate, brotli) and substituted back into the item when the flow
//! stays under the document limit. Unparseable items are left untouched.
//! Cookie fingerprints link related flows across connections.

use std::io::Read;

use flate2::read::{GzDecoder, ZlibDecoder};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::models::{Direction, FlowEntry, DOC_LIMIT};

/// Query escaping keeps the unreserved marks unescaped.
const QUERY_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const VALID_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

/// A parsed HTTP/1.x request head.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    /// Offset of the body within the source bytes.
    pub body_start: usize,
}

/// A parsed HTTP/1.x response head.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: String,
    pub status_code: u16,
    pub status_msg: String,
    pub headers: Vec<(String, String)>,
    pub body_start: usize,
}

/// First value of a header, case-insensitive.
pub fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Split raw bytes into head text and body offset at the blank line.
fn split_head(raw: &[u8]) -> Option<(&str, usize)> {
    let pos = raw.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = std::str::from_utf8(&raw[..pos]).ok()?;
    Some((head, pos + 4))
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<(String, String)> {
    lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Parse an HTTP request from raw payload bytes.
pub fn parse_request(raw: &[u8]) -> Option<HttpRequest> {
    let (head, body_start) = split_head(raw)?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let uri = parts.next()?.to_string();
    let version = parts.next()?.to_string();

    if !VALID_METHODS.contains(&method.as_str()) || !version.starts_with("HTTP/") {
        return None;
    }

    Some(HttpRequest {
        method,
        uri,
        version,
        headers: parse_headers(lines),
        body_start,
    })
}

/// Parse an HTTP response from raw payload bytes.
pub fn parse_response(raw: &[u8]) -> Option<HttpResponse> {
    let (head, body_start) = split_head(raw)?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next()?.to_string();
    let status_code: u16 = parts.next()?.parse().ok()?;
    let status_msg = parts.next().unwrap_or("").to_string();

    if !version.starts_with("HTTP/") {
        return None;
    }

    Some(HttpResponse {
        version,
        status_code,
        status_msg,
        headers: parse_headers(lines),
        body_start,
    })
}

/// Cookie pairs from a request's `Cookie` headers.
pub fn request_cookies(req: &HttpRequest) -> Vec<(String, String)> {
    req.headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("cookie"))
        .flat_map(|(_, v)| v.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// Cookie pairs from a response's `Set-Cookie` headers.
pub fn response_cookies(resp: &HttpResponse) -> Vec<(String, String)> {
    resp.headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("set-cookie"))
        .filter_map(|(_, v)| {
            let pair = v.split(';').next()?;
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// CRC32 over the query-escaped `name=value` pair. Escaping the parts keeps
/// attacker-controlled cookie bytes from forging a separator.
pub fn cookie_fingerprint(name: &str, value: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(utf8_percent_encode(name, QUERY_ESCAPE).to_string().as_bytes());
    hasher.update(b"=");
    hasher.update(utf8_percent_encode(value, QUERY_ESCAPE).to_string().as_bytes());
    hasher.finalize()
}

fn read_limited(reader: impl Read) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    reader
        .take(DOC_LIMIT as u64)
        .read_to_end(&mut out)
        .ok()
        .map(|_| out)
}

/// Decode a response body by content encoding; `None` on failure or an
/// encoding we do not handle.
fn decode_body(encoding: &str, body: &[u8]) -> Option<Vec<u8>> {
    match encoding {
        "gzip" => read_limited(GzDecoder::new(body)),
        // HTTP "deflate" is a zlib stream
        "deflate" => read_limited(ZlibDecoder::new(body)),
        "br" => read_limited(brotli::Decompressor::new(body, 4096)),
        _ => None,
    }
}

/// Rebuild a response's wire form around a replacement body. The stale
/// `Content-Length` is dropped rather than recomputed.
fn rebuild_response(resp: &HttpResponse, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 256);
    out.extend_from_slice(
        format!("{} {} {}\r\n", resp.version, resp.status_code, resp.status_msg).as_bytes(),
    );
    for (name, value) in &resp.headers {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

fn push_fingerprint(fingerprints: &mut Vec<u32>, fp: u32) {
    if !fingerprints.contains(&fp) {
        fingerprints.push(fp);
    }
}

/// Parse and simplify every item in the flow. Items that do not parse are
/// left as-is; decoded bodies replace the wire form only when the flow stays
/// under the document limit.
pub fn parse_http_flow(entry: &mut FlowEntry, experimental: bool) {
    let mut fingerprints: Vec<u32> = Vec::new();

    for idx in 0..entry.flow.len() {
        match entry.flow[idx].from {
            Direction::Client => {
                let Some(req) = parse_request(&entry.flow[idx].raw) else {
                    continue;
                };
                entry.add_tag("http");

                if experimental {
                    for (name, value) in request_cookies(&req) {
                        push_fingerprint(&mut fingerprints, cookie_fingerprint(&name, &value));
                    }
                }
            }
            Direction::Server => {
                let Some(resp) = parse_response(&entry.flow[idx].raw) else {
                    continue;
                };
                entry.add_tag("http");

                if experimental {
                    for (name, value) in response_cookies(&resp) {
                        push_fingerprint(&mut fingerprints, cookie_fingerprint(&name, &value));
                    }
                }

                // No encoding header means plain text already; nothing to do.
                let Some(encoding) = header(&resp.headers, "content-encoding") else {
                    continue;
                };
                let encoding = encoding.to_lowercase();
                if !matches!(encoding.as_str(), "gzip" | "deflate" | "br") {
                    continue;
                }

                let body = &entry.flow[idx].raw[resp.body_start.min(entry.flow[idx].raw.len())..];
                let Some(decoded) = decode_body(&encoding, body) else {
                    continue;
                };

                let replacement = rebuild_response(&resp, &decoded);
                let item_len = entry.flow[idx].raw.len();
                let new_size = entry.size - item_len + replacement.len();
                if new_size <= DOC_LIMIT {
                    entry.flow[idx].raw = replacement;
                    entry.size = new_size;
                }
            }
        }
    }

    if experimental {
        entry.fingerprints = fingerprints;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FlowItem;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn entry_with(items: Vec<FlowItem>) -> FlowEntry {
        let size = items.iter().map(|i| i.raw.len()).sum();
        FlowEntry {
            id: None,
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "10.0.0.2".parse().unwrap(),
            src_port: 40000,
            dst_port: 80,
            time: 0,
            duration: 0,
            num_packets: items.len() as u32,
            blocked: false,
            filename: "t.pcap".to_string(),
            parent_id: None,
            child_id: None,
            fingerprints: vec![],
            suricata: vec![],
            flow: items,
            tags: vec!["tcp".to_string()],
            flags: vec![],
            flagids: vec![],
            size,
        }
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_parse_request() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nCookie: session=abc; theme=dark\r\n\r\n";
        let req = parse_request(raw).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.uri, "/index.html");
        assert_eq!(header(&req.headers, "host"), Some("example.com"));

        let cookies = request_cookies(&req);
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0], ("session".to_string(), "abc".to_string()));
    }

    #[test]
    fn test_parse_request_rejects_garbage() {
        assert!(parse_request(b"NOTAMETHOD / HTTP/1.1\r\n\r\n").is_none());
        assert!(parse_request(b"\x00\x01\x02\x03").is_none());
        // Missing the header terminator
        assert!(parse_request(b"GET / HTTP/1.1\r\nHost: x\r\n").is_none());
    }

    #[test]
    fn test_parse_response() {
        let raw = b"HTTP/1.1 404 Not Found\r\nServer: nginx\r\nSet-Cookie: sid=1; Path=/\r\n\r\nnope";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status_code, 404);
        assert_eq!(resp.status_msg, "Not Found");
        assert_eq!(&raw[resp.body_start..], b"nope");

        let cookies = response_cookies(&resp);
        assert_eq!(cookies, vec![("sid".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_gzip_response_substituted() {
        let body = gzip(b"hello\n");
        let mut raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(&body);

        let request = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n".to_vec();
        let mut entry = entry_with(vec![
            FlowItem::new(Direction::Client, request, 0),
            FlowItem::new(Direction::Server, raw, 5),
        ]);

        parse_http_flow(&mut entry, false);

        assert!(entry.has_tag("http"));
        let server = &entry.flow[1];
        let text = String::from_utf8_lossy(&server.raw);
        assert!(text.contains("hello\n"), "decoded body missing: {text}");
        assert!(!text.to_lowercase().contains("content-length"));
        assert!(text.contains("Content-Encoding: gzip"));
        assert_eq!(entry.size, entry.flow.iter().map(|i| i.raw.len()).sum::<usize>());
    }

    #[test]
    fn test_unknown_encoding_untouched() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Encoding: snappy\r\n\r\nxxxx".to_vec();
        let mut entry = entry_with(vec![FlowItem::new(Direction::Server, raw.clone(), 0)]);
        parse_http_flow(&mut entry, false);
        assert_eq!(entry.flow[0].raw, raw);
        assert!(entry.has_tag("http"));
    }

    #[test]
    fn test_corrupt_gzip_untouched() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\n\r\nnot gzip at all".to_vec();
        let mut entry = entry_with(vec![FlowItem::new(Direction::Server, raw.clone(), 0)]);
        parse_http_flow(&mut entry, false);
        assert_eq!(entry.flow[0].raw, raw);
    }

    #[test]
    fn test_oversize_replacement_skipped() {
        // A small gzip bomb-ish body that inflates past the headroom left in
        // the flow: replacement must not be applied.
        let inflated = vec![b'A'; 64 * 1024];
        let body = gzip(&inflated);
        let mut raw = b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\n\r\n".to_vec();
        raw.extend_from_slice(&body);

        let filler = vec![FlowItem::new(
            Direction::Client,
            vec![b'x'; DOC_LIMIT - raw.len() - 1024],
            0,
        )];
        let mut items = filler;
        items.push(FlowItem::new(Direction::Server, raw.clone(), 1));
        let mut entry = entry_with(items);

        parse_http_flow(&mut entry, false);
        assert_eq!(entry.flow[1].raw, raw, "oversize replacement must be skipped");
        assert!(entry.size <= DOC_LIMIT);
    }

    #[test]
    fn test_non_http_untouched() {
        let raw = b"\x16\x03\x01binary tls stuff".to_vec();
        let mut entry = entry_with(vec![FlowItem::new(Direction::Client, raw.clone(), 0)]);
        parse_http_flow(&mut entry, false);
        assert_eq!(entry.flow[0].raw, raw);
        assert!(!entry.has_tag("http"));
    }

    #[test]
    fn test_fingerprints_collected() {
        let request =
            b"GET / HTTP/1.1\r\nCookie: session=abc\r\n\r\n".to_vec();
        let response =
            b"HTTP/1.1 200 OK\r\nSet-Cookie: session=abc; HttpOnly\r\n\r\nok".to_vec();
        let mut entry = entry_with(vec![
            FlowItem::new(Direction::Client, request, 0),
            FlowItem::new(Direction::Server, response, 1),
        ]);

        parse_http_flow(&mut entry, true);

        // Same cookie on both sides dedupes to one fingerprint.
        assert_eq!(entry.fingerprints.len(), 1);
        assert_eq!(entry.fingerprints[0], cookie_fingerprint("session", "abc"));
    }

    #[test]
    fn test_fingerprints_disabled_without_experimental() {
        let request = b"GET / HTTP/1.1\r\nCookie: a=b\r\n\r\n".to_vec();
        let mut entry = entry_with(vec![FlowItem::new(Direction::Client, request, 0)]);
        parse_http_flow(&mut entry, false);
        assert!(entry.fingerprints.is_empty());
    }

    #[test]
    fn test_deflate_uses_zlib() {
        use flate2::write::ZlibEncoder;
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"deflated!").unwrap();
        let body = enc.finish().unwrap();

        let mut raw = b"HTTP/1.1 200 OK\r\nContent-Encoding: deflate\r\n\r\n".to_vec();
        raw.extend_from_slice(&body);
        let mut entry = entry_with(vec![FlowItem::new(Direction::Server, raw, 0)]);

        parse_http_flow(&mut entry, false);
        assert!(String::from_utf8_lossy(&entry.flow[0].raw).contains("deflated!"));
    }
}
