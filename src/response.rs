use std::time::SystemTime;

use crate::config::ServerConfig;
use crate::http::{status_text, HeaderMap, HttpDate};

pub const SERVER_SOFTWARE: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// A response ready for serialization. Consumed once when its wire form is
/// queued on the connection's outbound buffer.
#[derive(Debug)]
pub struct Response {
    pub code: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Wire format: status line, one line per header in insertion order, a
    /// blank line, then the body with no trailing terminator.
    pub fn serialize(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(self.body.len() + 256);
        wire.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.code, status_text(self.code)).as_bytes(),
        );
        for (key, value) in self.headers.iter() {
            wire.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
        }
        wire.extend_from_slice(b"\r\n");
        wire.extend_from_slice(&self.body);
        wire
    }
}

/// Builds responses for one request, carrying the matched server so error
/// replies can use its configured error pages.
pub struct ResponseBuilder<'a> {
    server: Option<&'a ServerConfig>,
    now: SystemTime,
}

impl<'a> ResponseBuilder<'a> {
    pub fn new(server: Option<&'a ServerConfig>, now: SystemTime) -> Self {
        Self { server, now }
    }

    fn base(&self, code: u16) -> Response {
        let mut response = Response::new(code);
        response.headers.append("Date", HttpDate(self.now).to_string());
        response.headers.append("Server", SERVER_SOFTWARE);
        response
    }

    pub fn success(&self, code: u16, body: Vec<u8>, content_type: &str) -> Response {
        let mut response = self.base(code);
        response.headers.append("Content-Type", content_type);
        response.headers.append("Content-Length", body.len().to_string());
        response.body = body;
        response
    }

    /// 204 carries no body and no Content-Type, only an explicit zero length.
    pub fn no_content(&self) -> Response {
        let mut response = self.base(204);
        response.headers.append("Content-Length", "0");
        response
    }

    pub fn redirect(&self, location: &str) -> Response {
        let body = format!(
            "<html>\r\n<head>\r\n<title>301 Moved Permanently</title>\r\n</head>\r\n\
             <body>\r\n<h1>Moved Permanently</h1>\r\n\
             <p>Moved to: <a href=\"{}\">{}</a></p>\r\n</body>\r\n</html>\r\n",
            location, location,
        );
        let mut response = self.base(301);
        response.headers.append("Location", location);
        response.headers.append("Content-Type", "text/html");
        response.headers.append("Content-Length", body.len().to_string());
        response.body = body.into_bytes();
        response
    }

    /// Error reply: the server's configured page for the code when present
    /// and readable, else a generated minimal HTML page.
    pub fn error(&self, code: u16, reason: &str) -> Response {
        let body = self
            .custom_error_page(code)
            .unwrap_or_else(|| generated_error_page(code, reason));
        let mut response = self.base(code);
        response.headers.append("Content-Type", "text/html");
        response.headers.append("Content-Length", body.len().to_string());
        response.headers.append("Connection", "close");
        response.body = body;
        response
    }

    /// Configured error pages are read relative to the server root.
    fn custom_error_page(&self, code: u16) -> Option<Vec<u8>> {
        let server = self.server?;
        let page = server.error_pages.get(&code)?;
        let path = format!("{}/{}", server.root, page.trim_start_matches('/'));
        std::fs::read(path).ok()
    }
}

fn generated_error_page(code: u16, reason: &str) -> Vec<u8> {
    format!(
        "<html>\r\n<head>\r\n<title>{} {}</title>\r\n</head>\r\n<body>\r\n\
         <h1>{} {}</h1>\r\n<p>{}</p>\r\n</body>\r\n</html>\r\n",
        code,
        status_text(code),
        code,
        status_text(code),
        reason,
    )
    .into_bytes()
}

#[cfg(test)]
mod test {
    use super::*;

    use std::collections::HashMap;
    use std::io::Write;

    fn parse_wire(wire: &[u8]) -> (String, Vec<(String, String)>, Vec<u8>) {
        let split = wire
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .expect("missing header terminator");
        let head = std::str::from_utf8(&wire[..split]).unwrap();
        let body = wire[split + 4..].to_vec();
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap().to_string();
        let headers = lines
            .map(|line| {
                let mut parts = line.splitn(2, ": ");
                (
                    parts.next().unwrap().to_string(),
                    parts.next().unwrap().to_string(),
                )
            })
            .collect();
        (status_line, headers, body)
    }

    fn test_server(root: &str) -> ServerConfig {
        ServerConfig {
            port: 8080,
            host: "127.0.0.1".to_string(),
            server_names: vec!["localhost".to_string()],
            root: root.to_string(),
            max_body_size: 0,
            error_pages: HashMap::new(),
            locations: Vec::new(),
        }
    }

    #[test]
    fn serialize_round_trip() {
        let builder = ResponseBuilder::new(None, SystemTime::now());
        let response = builder.success(200, b"hello".to_vec(), "text/plain");
        let (status_line, headers, body) = parse_wire(&response.serialize());
        assert_eq!(status_line, "HTTP/1.1 200 OK");
        assert_eq!(body, b"hello");
        let headers: HashMap<_, _> = headers.into_iter().collect();
        assert_eq!(headers.get("Content-Type").unwrap(), "text/plain");
        assert_eq!(headers.get("Content-Length").unwrap(), "5");
        assert_eq!(headers.get("Server").unwrap(), SERVER_SOFTWARE);
        assert!(headers.contains_key("Date"));
    }

    #[test]
    fn headers_serialize_in_insertion_order() {
        let builder = ResponseBuilder::new(None, SystemTime::now());
        let response = builder.success(200, Vec::new(), "text/plain");
        let (_, headers, _) = parse_wire(&response.serialize());
        let keys: Vec<_> = headers.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["Date", "Server", "Content-Type", "Content-Length"]);
    }

    #[test]
    fn generated_error_page_is_used_without_config() {
        let builder = ResponseBuilder::new(None, SystemTime::now());
        let response = builder.error(404, "The URL you requested was not found.");
        assert_eq!(response.code, 404);
        let text = String::from_utf8(response.body.clone()).unwrap();
        assert!(text.contains("<h1>404 Not Found</h1>"));
        assert!(text.contains("The URL you requested was not found."));
        assert_eq!(response.headers.get("Connection"), Some("close"));
    }

    #[test]
    fn custom_error_page_is_preferred() {
        let root = tempfile::tempdir().unwrap();
        let mut server = test_server(root.path().to_str().unwrap());
        server
            .error_pages
            .insert(404, "errors/404.html".to_string());
        std::fs::create_dir(root.path().join("errors")).unwrap();
        let mut page = std::fs::File::create(root.path().join("errors/404.html")).unwrap();
        page.write_all(b"<html>custom</html>").unwrap();

        let builder = ResponseBuilder::new(Some(&server), SystemTime::now());
        let response = builder.error(404, "ignored");
        assert_eq!(response.body, b"<html>custom</html>");
    }

    #[test]
    fn unreadable_error_page_falls_back() {
        let mut server = test_server("/nonexistent-root");
        server
            .error_pages
            .insert(404, "errors/404.html".to_string());
        let builder = ResponseBuilder::new(Some(&server), SystemTime::now());
        let response = builder.error(404, "fallback");
        assert!(String::from_utf8(response.body).unwrap().contains("fallback"));
    }

    #[test]
    fn no_content_has_empty_body() {
        let builder = ResponseBuilder::new(None, SystemTime::now());
        let response = builder.no_content();
        assert_eq!(response.code, 204);
        assert!(response.body.is_empty());
        assert_eq!(response.headers.get("Content-Length"), Some("0"));
        let wire = response.serialize();
        assert!(wire.ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn redirect_sets_location() {
        let builder = ResponseBuilder::new(None, SystemTime::now());
        let response = builder.redirect("http://example.com/");
        assert_eq!(response.code, 301);
        assert_eq!(response.headers.get("Location"), Some("http://example.com/"));
    }
}
