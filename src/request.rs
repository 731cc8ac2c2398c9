use crate::http::{is_valid_version, HeaderMap, Method};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Why a byte sequence failed to parse as an HTTP request. All variants are
/// translated into a 400 reply at the request-processing boundary.
#[derive(Debug, PartialEq)]
pub enum RequestError {
    BadRequestLine,
    UnknownMethod(String),
    BadVersion(String),
    BadHeader(String),
    BadEncoding,
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequestLine => write!(f, "malformed request line"),
            Self::UnknownMethod(method) => write!(f, "unknown method {}", method),
            Self::BadVersion(version) => write!(f, "unsupported protocol version {}", version),
            Self::BadHeader(line) => write!(f, "malformed header line {}", line),
            Self::BadEncoding => write!(f, "request is not valid UTF-8"),
        }
    }
}

/// Offset of the first body byte, if the CRLFCRLF terminator has arrived.
pub fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// The Content-Length announced in the header block, if any. Usable before
/// the request is complete, so over-declared bodies can be refused early.
/// An unparseable value reads as absent; the full parse rejects it later.
pub fn declared_content_length(data: &[u8]) -> Option<u64> {
    let header_end = find_header_end(data)?;
    let headers = std::str::from_utf8(&data[..header_end]).ok()?;
    for line in headers.split("\r\n").skip(1) {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        if key.eq_ignore_ascii_case("content-length") {
            return parts.next().and_then(|value| value.trim().parse().ok());
        }
    }
    None
}

/// Completeness rule: the header terminator must have arrived, and as many
/// body bytes as Content-Length declares (none required when absent).
pub fn is_complete(data: &[u8]) -> bool {
    let header_end = match find_header_end(data) {
        Some(header_end) => header_end,
        None => return false,
    };
    let content_length = declared_content_length(data).unwrap_or(0);
    (data.len() - header_end) as u64 >= content_length
}

/// A fully assembled request. Built once per complete request and immutable
/// for the duration of one request-processing call.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub version: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Request {
    /// Parse a complete request. The caller must have established
    /// completeness with [`is_complete`] first.
    pub fn parse(data: &[u8]) -> Result<Self, RequestError> {
        let header_end = find_header_end(data).ok_or(RequestError::BadRequestLine)?;
        let header_block =
            std::str::from_utf8(&data[..header_end]).map_err(|_| RequestError::BadEncoding)?;

        let mut lines = header_block.split("\r\n");
        let request_line = lines.next().ok_or(RequestError::BadRequestLine)?;
        let (method, uri, version) = parse_request_line(request_line)?;

        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let colon = line.find(':').ok_or_else(|| RequestError::BadHeader(line.to_string()))?;
            let key = line[..colon].trim();
            let value = line[colon + 1..].trim();
            if key.is_empty() {
                return Err(RequestError::BadHeader(line.to_string()));
            }
            headers.append(key, value);
        }

        // The body is truncated to exactly Content-Length bytes; without the
        // header the request carries no body.
        let body = match headers.get("Content-Length") {
            Some(value) => {
                let content_length: usize = value
                    .trim()
                    .parse()
                    .map_err(|_| RequestError::BadHeader(format!("Content-Length: {}", value)))?;
                let body_end = std::cmp::min(header_end + content_length, data.len());
                data[header_end..body_end].to_vec()
            }
            None => Vec::new(),
        };

        Ok(Self {
            method,
            uri,
            version,
            headers,
            body,
        })
    }

    /// URI without the query string.
    pub fn path(&self) -> &str {
        self.uri.splitn(2, '?').next().unwrap()
    }

    /// Query string after `?`, empty if absent.
    pub fn query(&self) -> &str {
        self.uri.splitn(2, '?').nth(1).unwrap_or("")
    }
}

fn parse_request_line(line: &str) -> Result<(Method, String, String), RequestError> {
    let tokens: Vec<&str> = line.split(' ').collect();
    if tokens.len() != 3 || tokens.iter().any(|token| token.is_empty()) {
        return Err(RequestError::BadRequestLine);
    }
    let method =
        Method::from_token(tokens[0]).ok_or_else(|| RequestError::UnknownMethod(tokens[0].to_string()))?;
    if !is_valid_version(tokens[2]) {
        return Err(RequestError::BadVersion(tokens[2].to_string()));
    }
    Ok((method, tokens[1].to_string(), tokens[2].to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    const SIMPLE: &[u8] = b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n";
    const UPLOAD: &[u8] =
        b"POST /upload/a.txt HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";

    #[test]
    fn incomplete_without_terminator() {
        assert!(!is_complete(b"GET / HTTP/1.1\r\nHost: x\r\n"));
        assert!(is_complete(SIMPLE));
    }

    #[test]
    fn incomplete_until_body_arrives() {
        let (head, body) = UPLOAD.split_at(UPLOAD.len() - 5);
        assert!(!is_complete(head));
        assert!(!is_complete(&UPLOAD[..UPLOAD.len() - 1]));
        assert!(is_complete(UPLOAD));
        assert_eq!(body, b"hello");
    }

    #[test]
    fn declared_content_length_works() {
        assert_eq!(declared_content_length(UPLOAD), Some(5));
        assert_eq!(declared_content_length(SIMPLE), None);
        assert_eq!(declared_content_length(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(
            declared_content_length(b"GET / HTTP/1.1\r\ncontent-length: 12\r\n\r\n"),
            Some(12)
        );
    }

    #[test]
    fn parse_simple_get() {
        let request = Request::parse(SIMPLE).unwrap();
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.uri, "/index.html");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.headers.get("host"), Some("localhost"));
        assert!(request.body.is_empty());
    }

    #[test]
    fn parse_body_is_truncated_to_content_length() {
        let mut data = UPLOAD.to_vec();
        data.extend_from_slice(b"TRAILING");
        let request = Request::parse(&data).unwrap();
        assert_eq!(request.body, b"hello");
    }

    #[test]
    fn parse_preserves_header_case_and_order() {
        let data = b"GET / HTTP/1.1\r\nX-First: 1\r\nx-SECOND: 2\r\n\r\n";
        let request = Request::parse(data).unwrap();
        let keys: Vec<_> = request.headers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["X-First", "x-SECOND"]);
        assert_eq!(request.headers.get("x-first"), Some("1"));
    }

    #[test]
    fn path_and_query_work() {
        let data = b"GET /search?q=rust&n=1 HTTP/1.1\r\n\r\n";
        let request = Request::parse(data).unwrap();
        assert_eq!(request.path(), "/search");
        assert_eq!(request.query(), "q=rust&n=1");
    }

    #[test_case(b"GET / HTTP/2.0\r\n\r\n" ; "bad version")]
    #[test_case(b"get / HTTP/1.1\r\n\r\n" ; "lowercase method")]
    #[test_case(b"TRACE / HTTP/1.1\r\n\r\n" ; "unknown method")]
    #[test_case(b"GET /\r\n\r\n" ; "missing version")]
    #[test_case(b"GET  / HTTP/1.1\r\n\r\n" ; "double space")]
    #[test_case(b"GET / HTTP/1.1\r\nNoColonHere\r\n\r\n" ; "header without colon")]
    #[test_case(b"GET / HTTP/1.1\r\n: value\r\n\r\n" ; "empty header key")]
    #[test_case(b"GET / HTTP/1.1\r\nContent-Length: ham\r\n\r\n" ; "bad content length")]
    fn parse_failures(data: &[u8]) {
        assert!(Request::parse(data).is_err());
    }

    #[test]
    fn chunk_size_invariance() {
        let full = UPLOAD;
        for chunk_size in 1..full.len() {
            let mut accumulator: Vec<u8> = Vec::new();
            let mut complete_at = None;
            for chunk in full.chunks(chunk_size) {
                accumulator.extend_from_slice(chunk);
                if is_complete(&accumulator) && complete_at.is_none() {
                    complete_at = Some(accumulator.len());
                }
            }
            // Completeness is reached exactly once all bytes are in.
            assert_eq!(complete_at, Some(full.len()));
            let request = Request::parse(&accumulator).unwrap();
            let reference = Request::parse(full).unwrap();
            assert_eq!(request.method, reference.method);
            assert_eq!(request.uri, reference.uri);
            assert_eq!(request.headers.len(), reference.headers.len());
            assert_eq!(request.body, reference.body);
        }
    }
}
