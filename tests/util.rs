use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("localhost", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("localhost", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(1));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

/// A webserv instance running against a scratch wwwroot and a config
/// rendered for OS-assigned ports.
pub struct Server {
    _child: ScopedChild,
    ports: Vec<u16>,
    root: TempDir,
}

impl Server {
    /// Spawn the server with a config produced by `render`, which receives
    /// two unused ports and the scratch root directory.
    pub fn with_config<F>(render: F) -> Self
    where
        F: FnOnce(&[u16], &Path) -> String,
    {
        let root = tempdir().expect("failed to create tempdir");

        // Get unused ports. Assumes they won't be reused before we start.
        let ports = vec![
            get_unused_port().expect("failed to get unused port"),
            get_unused_port().expect("failed to get unused port"),
        ];

        let config_path = root.path().join("server.conf");
        std::fs::write(&config_path, render(&ports, root.path()))
            .expect("failed to write config");

        let child = Command::new(env!("CARGO_BIN_EXE_webserv-rs"))
            .arg(config_path.to_str().expect("path is not valid UTF-8"))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn webserv")
            .into();

        // Wait until the first socket is open.
        assert!(wait_for_port(ports[0]), "failed to connect to webserv");

        Self {
            _child: child,
            ports,
            root,
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn port(&self) -> u16 {
        self.ports[0]
    }

    pub fn second_port(&self) -> u16 {
        self.ports[1]
    }

    pub fn create_dir(&self, name: &str) {
        std::fs::create_dir_all(self.root().join(name)).expect("failed to create directory");
    }

    pub fn create_file(&self, name: &str, content: &[u8]) {
        std::fs::write(self.root().join(name), content).expect("failed to create file");
    }

    /// Send raw bytes and collect the whole response; the server closes the
    /// connection once the response is flushed.
    pub fn send_raw_to(&self, port: u16, raw: &[u8]) -> Response {
        let mut stream =
            TcpStream::connect(("localhost", port)).expect("failed to connect to webserv");
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(raw).unwrap();
        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .expect("failed to read response");
        Response::parse(&response)
    }

    pub fn send_raw(&self, raw: &[u8]) -> Response {
        self.send_raw_to(self.port(), raw)
    }

    pub fn request(&self, method: &str, path: &str, body: &[u8]) -> Response {
        let mut raw = format!("{} {} HTTP/1.1\r\nHost: localhost\r\n", method, path);
        if !body.is_empty() {
            raw.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        raw.push_str("\r\n");
        let mut raw = raw.into_bytes();
        raw.extend_from_slice(body);
        self.send_raw(&raw)
    }

    pub fn get(&self, path: &str) -> Response {
        self.request("GET", path, b"")
    }
}

/// HTTP response from webserv.
pub struct Response {
    status_line: String,
    headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn parse(raw: &[u8]) -> Self {
        let split = raw
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .expect("response has no header terminator");
        let head = std::str::from_utf8(&raw[..split]).expect("response head is not valid UTF-8");
        let body = raw[split + 4..].to_vec();

        let mut lines = head.split("\r\n");
        let status_line = lines.next().expect("missing status line").to_string();
        let mut headers = HashMap::new();
        for line in lines {
            let mut header = line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Self {
            status_line,
            headers,
            body,
        }
    }

    pub fn code(&self) -> u16 {
        self.status_line
            .split(' ')
            .nth(1)
            .expect("invalid status line")
            .parse()
            .expect("invalid status code")
    }

    pub fn status(&self) -> &str {
        self.status_line
            .splitn(3, ' ')
            .nth(2)
            .expect("invalid status line")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|value| value.as_str())
    }

    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).expect("body is not valid UTF-8")
    }
}
