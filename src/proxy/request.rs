//! Request-line sniffing
//!
//! Reads the first line a client sends and works out where the request is
//! going. Nothing past the line terminator is consumed from the stream: the
//! buffered reader that did the reading is handed on to the relay, so headers
//! and body bytes that arrived in the same packet still reach the destination.

use std::fmt;

use http::Uri;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::trace;

use crate::error::ParseError;

/// Default port for CONNECT targets without one
pub const DEFAULT_TUNNEL_PORT: u16 = 443;

/// Default port for plain HTTP targets without one
pub const DEFAULT_HTTP_PORT: u16 = 80;

const MAX_HEADER_LINES: usize = 100;

/// How a request is proxied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// CONNECT: acknowledge the client, then relay opaque bytes
    Tunnel,
    /// Anything else: replay the request line to the destination, then relay
    Forward,
}

impl ProxyMode {
    pub fn for_method(method: &str) -> Self {
        if method == "CONNECT" {
            Self::Tunnel
        } else {
            Self::Forward
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tunnel => "tunnel",
            Self::Forward => "forward",
        }
    }
}

/// Resolved egress target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The first line of a client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: String,
    pub target: String,
    /// The line exactly as received, without its terminator
    pub raw_line: String,
    pub destination: Destination,
}

impl ProxyRequest {
    /// Classify an already-read request line
    pub fn from_line(raw_line: String) -> Result<Self, ParseError> {
        let mut tokens = raw_line.split(' ');
        let method = tokens.next().unwrap_or_default();
        let target = tokens
            .next()
            .ok_or_else(|| ParseError::Malformed(format!("missing target in '{}'", raw_line)))?;

        if method.is_empty() || target.is_empty() {
            return Err(ParseError::Malformed(format!(
                "empty method or target in '{}'",
                raw_line
            )));
        }

        let destination = match ProxyMode::for_method(method) {
            ProxyMode::Tunnel => parse_authority(target)?,
            ProxyMode::Forward => parse_absolute_uri(target),
        };

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            destination,
            raw_line,
        })
    }

    pub fn mode(&self) -> ProxyMode {
        ProxyMode::for_method(&self.method)
    }
}

/// Reads and classifies request lines
#[derive(Debug, Clone, Copy)]
pub struct RequestSniffer {
    max_line: usize,
}

impl Default for RequestSniffer {
    fn default() -> Self {
        Self::new(8192)
    }
}

impl RequestSniffer {
    pub fn new(max_line: usize) -> Self {
        Self { max_line }
    }

    /// Read exactly one line from `reader` and classify it
    pub async fn parse<R>(&self, reader: &mut R) -> Result<ProxyRequest, ParseError>
    where
        R: AsyncBufRead + Unpin,
    {
        let line = self.read_line(reader).await?;
        let raw_line = String::from_utf8(line)
            .map_err(|_| ParseError::Malformed("request line is not valid UTF-8".into()))?;
        trace!(line = %raw_line, "Read request line");

        ProxyRequest::from_line(raw_line)
    }

    /// Discard header lines up to and including the blank line ending them.
    /// Returns the number of header lines dropped.
    pub async fn skip_headers<R>(&self, reader: &mut R) -> Result<usize, ParseError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut skipped = 0;
        loop {
            let line = self.read_line(reader).await?;
            if line.is_empty() {
                return Ok(skipped);
            }
            skipped += 1;
            if skipped > MAX_HEADER_LINES {
                return Err(ParseError::Malformed(format!(
                    "more than {} header lines",
                    MAX_HEADER_LINES
                )));
            }
        }
    }

    /// One line without its terminator. Never reads past the LF.
    async fn read_line<R>(&self, reader: &mut R) -> Result<Vec<u8>, ParseError>
    where
        R: AsyncBufRead + Unpin,
    {
        // Room for the line plus CRLF; anything longer is rejected.
        let cap = self.max_line as u64 + 2;
        let mut buf = Vec::with_capacity(256);
        let n = reader.take(cap).read_until(b'\n', &mut buf).await?;

        if n == 0 {
            return Err(ParseError::Closed);
        }

        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        } else if n as u64 == cap {
            return Err(ParseError::LineTooLong {
                limit: self.max_line,
            });
        }

        if buf.len() > self.max_line {
            return Err(ParseError::LineTooLong {
                limit: self.max_line,
            });
        }

        Ok(buf)
    }
}

/// `host[:port]` as sent with CONNECT
fn parse_authority(target: &str) -> Result<Destination, ParseError> {
    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| ParseError::Malformed(format!("unterminated IPv6 literal '{}'", target)))?;
        let port = match after {
            "" => None,
            other => Some(other.strip_prefix(':').ok_or_else(|| {
                ParseError::Malformed(format!("unexpected text after IPv6 literal '{}'", target))
            })?),
        };
        (host, port)
    } else {
        match target.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (target, None),
        }
    };

    if host.is_empty() {
        return Err(ParseError::Malformed(format!("missing host in '{}'", target)));
    }

    let port = match port {
        None | Some("") => DEFAULT_TUNNEL_PORT,
        Some(raw) => match raw.parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => {
                return Err(ParseError::Malformed(format!(
                    "invalid port '{}' in '{}'",
                    raw, target
                )))
            }
        },
    };

    Ok(Destination::new(host, port))
}

/// Absolute URI as sent with a plain proxy request. Falls back to the raw
/// target as host when no host component can be extracted.
fn parse_absolute_uri(target: &str) -> Destination {
    match target.parse::<Uri>() {
        Ok(uri) => match uri.host().filter(|h| !h.is_empty()) {
            Some(host) => {
                let host = host
                    .strip_prefix('[')
                    .and_then(|h| h.strip_suffix(']'))
                    .unwrap_or(host);
                Destination::new(host, uri.port_u16().unwrap_or(DEFAULT_HTTP_PORT))
            }
            None => Destination::new(target, DEFAULT_HTTP_PORT),
        },
        Err(_) => Destination::new(target, DEFAULT_HTTP_PORT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse_bytes(input: &[u8]) -> (Result<ProxyRequest, ParseError>, Vec<u8>) {
        let mut reader = BufReader::new(input);
        let result = RequestSniffer::default().parse(&mut reader).await;
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        (result, rest)
    }

    #[tokio::test]
    async fn connect_with_port() {
        let (req, _) = parse_bytes(b"CONNECT example.com:8443 HTTP/1.1\r\n").await;
        let req = req.unwrap();

        assert_eq!(req.mode(), ProxyMode::Tunnel);
        assert_eq!(req.method, "CONNECT");
        assert_eq!(req.target, "example.com:8443");
        assert_eq!(req.destination, Destination::new("example.com", 8443));
    }

    #[tokio::test]
    async fn connect_without_port_defaults_to_443() {
        let (req, _) = parse_bytes(b"CONNECT example.com\r\n").await;
        assert_eq!(req.unwrap().destination, Destination::new("example.com", 443));

        let (req, _) = parse_bytes(b"CONNECT example.com: HTTP/1.1\r\n").await;
        assert_eq!(req.unwrap().destination, Destination::new("example.com", 443));
    }

    #[tokio::test]
    async fn connect_with_bad_port_is_malformed() {
        let (req, _) = parse_bytes(b"CONNECT example.com:https HTTP/1.1\r\n").await;
        assert!(matches!(req, Err(ParseError::Malformed(_))));

        let (req, _) = parse_bytes(b"CONNECT example.com:0 HTTP/1.1\r\n").await;
        assert!(matches!(req, Err(ParseError::Malformed(_))));

        let (req, _) = parse_bytes(b"CONNECT :443 HTTP/1.1\r\n").await;
        assert!(matches!(req, Err(ParseError::Malformed(_))));
    }

    #[tokio::test]
    async fn connect_ipv6_literal() {
        let (req, _) = parse_bytes(b"CONNECT [::1]:9000 HTTP/1.1\r\n").await;
        let req = req.unwrap();
        assert_eq!(req.destination, Destination::new("::1", 9000));
        assert_eq!(req.destination.to_string(), "[::1]:9000");

        let (req, _) = parse_bytes(b"CONNECT [2001:db8::1] HTTP/1.1\r\n").await;
        assert_eq!(req.unwrap().destination.port, 443);
    }

    #[tokio::test]
    async fn forward_absolute_uri() {
        let (req, _) = parse_bytes(b"GET http://example.com/path HTTP/1.1\r\n").await;
        let req = req.unwrap();

        assert_eq!(req.mode(), ProxyMode::Forward);
        assert_eq!(req.destination, Destination::new("example.com", 80));
        assert_eq!(req.raw_line, "GET http://example.com/path HTTP/1.1");
    }

    #[tokio::test]
    async fn forward_explicit_port() {
        let (req, _) = parse_bytes(b"POST http://example.com:8081/api?q=1 HTTP/1.1\n").await;
        assert_eq!(req.unwrap().destination, Destination::new("example.com", 8081));

        let (req, _) = parse_bytes(b"GET https://example.com/ HTTP/1.1\n").await;
        assert_eq!(req.unwrap().destination, Destination::new("example.com", 80));
    }

    #[tokio::test]
    async fn forward_falls_back_to_raw_target() {
        let (req, _) = parse_bytes(b"GET /relative HTTP/1.1\r\n").await;
        assert_eq!(req.unwrap().destination, Destination::new("/relative", 80));
    }

    #[tokio::test]
    async fn single_token_is_malformed() {
        let (req, _) = parse_bytes(b"GET\r\n").await;
        assert!(matches!(req, Err(ParseError::Malformed(_))));

        let (req, _) = parse_bytes(b"GET \r\n").await;
        assert!(matches!(req, Err(ParseError::Malformed(_))));

        let (req, _) = parse_bytes(b"GET  http://example.com/ HTTP/1.1\r\n").await;
        assert!(matches!(req, Err(ParseError::Malformed(_))));
    }

    #[tokio::test]
    async fn empty_stream_is_closed() {
        let (req, _) = parse_bytes(b"").await;
        assert!(matches!(req, Err(ParseError::Closed)));
    }

    #[tokio::test]
    async fn does_not_consume_past_the_line() {
        let input = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\nbody";
        let (req, rest) = parse_bytes(input).await;

        assert_eq!(req.unwrap().raw_line, "GET http://example.com/ HTTP/1.1");
        assert_eq!(rest, b"Host: example.com\r\n\r\nbody");
    }

    #[tokio::test]
    async fn raw_line_is_verbatim() {
        let (req, _) = parse_bytes(b"get http://Example.COM/%7Euser HTTP/1.0\r\n").await;
        let req = req.unwrap();
        assert_eq!(req.mode(), ProxyMode::Forward);
        assert_eq!(req.raw_line, "get http://Example.COM/%7Euser HTTP/1.0");
    }

    #[tokio::test]
    async fn line_split_across_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(b"GET http://exa")
            .read(b"mple.com/ HT")
            .read(b"TP/1.1\r\n")
            .build();
        let mut reader = BufReader::new(mock);

        let req = RequestSniffer::default().parse(&mut reader).await.unwrap();
        assert_eq!(req.raw_line, "GET http://example.com/ HTTP/1.1");
    }

    #[tokio::test]
    async fn overlong_line_is_rejected() {
        let mut input = b"GET http://example.com/".to_vec();
        input.extend(std::iter::repeat(b'a').take(64));
        input.extend_from_slice(b" HTTP/1.1\r\n");

        let mut reader = BufReader::new(&input[..]);
        let result = RequestSniffer::new(32).parse(&mut reader).await;
        assert!(matches!(result, Err(ParseError::LineTooLong { limit: 32 })));
    }

    #[tokio::test]
    async fn non_utf8_line_is_malformed() {
        let (req, _) = parse_bytes(b"GET http://\xff\xfe/ HTTP/1.1\r\n").await;
        assert!(matches!(req, Err(ParseError::Malformed(_))));
    }

    #[tokio::test]
    async fn skip_headers_stops_at_blank_line() {
        let input = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nUser-Agent: test\r\n\r\n\x16\x03\x01";
        let mut reader = BufReader::new(&input[..]);
        let sniffer = RequestSniffer::default();

        let req = sniffer.parse(&mut reader).await.unwrap();
        assert_eq!(req.mode(), ProxyMode::Tunnel);
        assert_eq!(sniffer.skip_headers(&mut reader).await.unwrap(), 2);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"\x16\x03\x01");
    }

    #[tokio::test]
    async fn skip_headers_needs_terminating_blank_line() {
        let mut reader = BufReader::new(&b"Host: example.com\r\n"[..]);
        let result = RequestSniffer::default().skip_headers(&mut reader).await;
        assert!(matches!(result, Err(ParseError::Closed)));
    }

    #[test]
    fn destination_display() {
        assert_eq!(Destination::new("example.com", 80).to_string(), "example.com:80");
        assert_eq!(Destination::new("fe80::1", 443).to_string(), "[fe80::1]:443");
    }
}
