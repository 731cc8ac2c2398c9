use std::collections::HashSet;
use std::mem::MaybeUninit;
use std::net::{IpAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::SystemTime;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::socket::{recv, send, MsgFlags};
use nix::sys::time::TimeVal;

use crate::cgi::CgiProcess;
use crate::config::ServerConfig;
use crate::handler::{dispatch, route, Dispatch};
use crate::http::MimeMap;
use crate::log::{ClfDate, LogEncoded, LogSink};
use crate::request::{self, Request};
use crate::response::{Response, ResponseBuilder};

/// Bytes read from a client socket per loop iteration.
const RECV_CHUNK: usize = 4096;

/// Cap on inbound bytes before the header terminator arrives, so a client
/// that never sends one can't grow the accumulator forever.
const MAX_HEADER_LENGTH: usize = 8192;

/// One bound and listening socket. Accepting is the only thing it does;
/// per-client state lives in [`ClientConnection`].
#[derive(Debug)]
pub struct ListeningEndpoint {
    listener: TcpListener,
    port: u16,
}

impl ListeningEndpoint {
    fn bind(host: &str, port: u16) -> Result<Self> {
        // Sets `SO_REUSEADDR` implicitly.
        let listener = TcpListener::bind((host, port))
            .with_context(|| format!("failed to create listening socket for {}:{}", host, port))?;
        listener
            .set_nonblocking(true)
            .context("failed to make listening socket non-blocking")?;
        println!("listening on: http://{}:{}/", host, port);
        Ok(Self { listener, port })
    }

    fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

/// One listening socket per distinct (host, port); duplicates are skipped.
pub fn create_listeners(servers: &[ServerConfig]) -> Result<Vec<ListeningEndpoint>> {
    let mut seen = HashSet::new();
    let mut listeners = Vec::new();
    for server in servers {
        if !seen.insert((server.host.clone(), server.port)) {
            eprintln!(
                "warning: {}:{} is already being listened on, skipping duplicate",
                server.host, server.port
            );
            continue;
        }
        listeners.push(ListeningEndpoint::bind(&server.host, server.port)?);
    }
    Ok(listeners)
}

#[derive(Debug, Default)]
pub struct ServerStats {
    pub num_requests: u64,
    pub total_in: u64,
    pub total_out: u64,
}

impl ServerStats {
    pub fn print(&self) -> Result<()> {
        let rusage = getrusage().context("failed to get resource usage")?;
        println!(
            "CPU time used: {}.{:02} user, {}.{:02} system",
            rusage.ru_utime.tv_sec,
            rusage.ru_utime.tv_usec / 10000,
            rusage.ru_stime.tv_sec,
            rusage.ru_stime.tv_usec / 10000,
        );
        println!("Requests: {}", self.num_requests);
        println!("Bytes: {} in, {} out", self.total_in, self.total_out);
        Ok(())
    }
}

/// Safe wrapper for `libc::getrusage`.
fn getrusage() -> std::io::Result<libc::rusage> {
    let mut rusage = MaybeUninit::<libc::rusage>::zeroed();
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, rusage.as_mut_ptr()) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { rusage.assume_init() })
}

#[derive(Debug)]
enum ConnectionState {
    ReceiveRequest,
    /// Waiting on a CGI child; its pipes are in the readiness set.
    RunCgi(CgiProcess),
    SendResponse,
    Done,
}

/// Per-socket mutable state. Each connection serves exactly one
/// request/response cycle and is closed once the response is flushed.
pub struct ClientConnection {
    stream: TcpStream,
    client: IpAddr,
    port: u16,
    state: ConnectionState,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    outbound_sent: usize,
    method: Option<String>,
    uri: Option<String>,
    http_code: u16,
    total_sent: u64,
}

impl ClientConnection {
    fn new(stream: TcpStream, client: IpAddr, port: u16) -> Self {
        Self {
            stream,
            client,
            port,
            state: ConnectionState::ReceiveRequest,
            inbound: Vec::new(),
            outbound: Vec::new(),
            outbound_sent: 0,
            method: None,
            uri: None,
            http_code: 0,
            total_sent: 0,
        }
    }

    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Everything the request-processing chain needs, owned by the event loop
/// thread. Configuration and the MIME table are read-only after startup.
pub struct Engine {
    pub servers: Vec<ServerConfig>,
    pub mime_map: MimeMap,
    pub log_sink: LogSink,
    pub stats: ServerStats,
}

impl Engine {
    pub fn new(servers: Vec<ServerConfig>, mime_map: MimeMap, log_sink: LogSink) -> Self {
        Self {
            servers,
            mime_map,
            log_sink,
            stats: ServerStats::default(),
        }
    }

    fn server_for_port(&self, port: u16) -> Option<&ServerConfig> {
        self.servers.iter().find(|server| server.port == port)
    }
}

/// One iteration of the reactor: select() on every descriptor of interest,
/// then accept, read, pump CGI pipes and write wherever the OS says we can.
///
/// With `select_timeout` of None the readiness wait is the loop's only
/// suspension point and blocks until a descriptor is ready.
pub fn poll(
    engine: &mut Engine,
    listeners: &[ListeningEndpoint],
    files_exhausted: &mut bool,
    connections: &mut Vec<ClientConnection>,
    select_timeout: Option<std::time::Duration>,
) {
    let mut recv_set = FdSet::new();
    let mut send_set = FdSet::new();

    if !*files_exhausted {
        for endpoint in listeners {
            recv_set.insert(endpoint.fd());
        }
    }

    for conn in connections.iter() {
        match &conn.state {
            ConnectionState::ReceiveRequest => {
                recv_set.insert(conn.fd());
            }
            ConnectionState::RunCgi(cgi) => {
                if let Some(fd) = cgi.stdout_fd() {
                    recv_set.insert(fd);
                }
                if let Some(fd) = cgi.stdin_fd() {
                    send_set.insert(fd);
                }
            }
            ConnectionState::SendResponse => {
                send_set.insert(conn.fd());
            }
            ConnectionState::Done => {}
        }
    }

    let mut timeout = select_timeout.map(|timeout| {
        TimeVal::from(libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        })
    });
    match select(
        None,
        Some(&mut recv_set),
        Some(&mut send_set),
        None,
        timeout.as_mut(),
    ) {
        Ok(_) => {}
        Err(e) => {
            if e.as_errno() != Some(Errno::EINTR) {
                eprintln!("warning: select() failed: {}", e);
            }
            return;
        }
    }

    let now = SystemTime::now();

    for endpoint in listeners {
        if recv_set.contains(endpoint.fd()) {
            accept_connection(engine, endpoint, files_exhausted, now, connections);
        }
    }

    let mut index = 0;
    while index < connections.len() {
        let conn = &mut connections[index];
        let fd = conn.fd();
        let mut cgi_done = false;

        match &mut conn.state {
            ConnectionState::ReceiveRequest => {
                if recv_set.contains(fd) {
                    poll_recv_request(engine, conn, now);
                }
            }
            ConnectionState::RunCgi(cgi) => {
                if let Some(stdin_fd) = cgi.stdin_fd() {
                    if send_set.contains(stdin_fd) {
                        cgi.pump_stdin();
                    }
                }
                if let Some(stdout_fd) = cgi.stdout_fd() {
                    if recv_set.contains(stdout_fd) && cgi.pump_stdout() {
                        cgi_done = true;
                    }
                }
            }
            ConnectionState::SendResponse => {
                if send_set.contains(fd) {
                    poll_send_response(conn, &mut engine.stats);
                }
            }
            ConnectionState::Done => {}
        }

        if cgi_done {
            finish_cgi(engine, conn, now);
        }

        if matches!(conn.state, ConnectionState::Done) {
            log_connection(engine, conn, now);
            connections.remove(index);
            // Try to resume accepting if we ran out of descriptors.
            *files_exhausted = false;
        } else {
            index += 1;
        }
    }
}

/// Accept one pending connection and try to read from it straight away,
/// instead of going through another iteration of the select() loop.
fn accept_connection(
    engine: &mut Engine,
    endpoint: &ListeningEndpoint,
    files_exhausted: &mut bool,
    now: SystemTime,
    connections: &mut Vec<ClientConnection>,
) {
    let (stream, addr) = match endpoint.listener.accept() {
        Ok(pair) => pair,
        Err(e) => {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                // Spurious readiness; retry on a later iteration.
                return;
            }
            if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
                *files_exhausted = true;
            }
            // Failed to accept, but keep serving existing connections.
            eprintln!("warning: accept() failed: {}", e);
            return;
        }
    };
    if let Err(e) = stream.set_nonblocking(true) {
        eprintln!("warning: failed to make client socket non-blocking: {}", e);
        return;
    }

    connections.push(ClientConnection::new(stream, addr.ip(), endpoint.port));
    let index = connections.len() - 1;
    poll_recv_request(engine, &mut connections[index], now);
}

/// Read available bytes into the inbound accumulator and process the request
/// once the assembler reports it complete.
fn poll_recv_request(engine: &mut Engine, conn: &mut ClientConnection, now: SystemTime) {
    let mut buf = [0; RECV_CHUNK];
    let received = match recv(conn.fd(), &mut buf, MsgFlags::empty()) {
        Ok(0) => {
            // Peer closed before sending a full request.
            conn.state = ConnectionState::Done;
            return;
        }
        Ok(received) => received,
        Err(nix::Error::Sys(Errno::EAGAIN)) | Err(nix::Error::Sys(Errno::EINTR)) => {
            return;
        }
        Err(_) => {
            conn.state = ConnectionState::Done;
            return;
        }
    };
    conn.inbound.extend_from_slice(&buf[..received]);
    engine.stats.total_in += received as u64;

    match request::find_header_end(&conn.inbound) {
        None => {
            if conn.inbound.len() > MAX_HEADER_LENGTH {
                let builder = ResponseBuilder::new(engine.server_for_port(conn.port), now);
                let response =
                    builder.error(413, "Your request was dropped because it was too long.");
                queue_response(conn, response);
            }
        }
        Some(_) => {
            // Refuse over-declared bodies without waiting for their bytes.
            let declared = request::declared_content_length(&conn.inbound).unwrap_or(0);
            let too_large = engine
                .server_for_port(conn.port)
                .map(|server| server.max_body_size > 0 && declared > server.max_body_size)
                .unwrap_or(false);
            if too_large {
                let builder = ResponseBuilder::new(engine.server_for_port(conn.port), now);
                let response =
                    builder.error(413, "The request body exceeds the configured limit.");
                queue_response(conn, response);
            } else if request::is_complete(&conn.inbound) {
                engine.stats.num_requests += 1;
                process_request(engine, conn, now);
            }
        }
    }

    // If a response is already queued, try to send it right away.
    if matches!(conn.state, ConnectionState::SendResponse) {
        poll_send_response(conn, &mut engine.stats);
    }
}

/// Assemble, route and dispatch one complete request. Every failure mode is
/// converted into a well-formed HTTP error reply; only the CGI path leaves
/// the connection in a non-sending state.
fn process_request(engine: &mut Engine, conn: &mut ClientConnection, now: SystemTime) {
    let data = std::mem::take(&mut conn.inbound);
    let fallback_builder = ResponseBuilder::new(engine.server_for_port(conn.port), now);

    let response = match Request::parse(&data) {
        Err(e) => Some(fallback_builder.error(
            400,
            &format!("You sent a request that the server couldn't understand: {}.", e),
        )),
        Ok(request) => {
            conn.method = Some(request.method.as_str().to_string());
            conn.uri = Some(request.uri.clone());
            match route(&engine.servers, conn.port, &request) {
                Err(e) => Some(fallback_builder.error(e.status(), e.reason())),
                Ok(matched) => {
                    let builder = ResponseBuilder::new(Some(matched.server), now);
                    match dispatch(&request, &matched, &engine.mime_map, &builder) {
                        Dispatch::Response(response) => Some(response),
                        Dispatch::Cgi(process) => {
                            conn.state = ConnectionState::RunCgi(process);
                            None
                        }
                    }
                }
            }
        }
    };

    if let Some(response) = response {
        queue_response(conn, response);
    }
}

/// The CGI child closed its stdout: reap it and turn the capture into a
/// response. Success wraps the output; anything else is a server error.
fn finish_cgi(engine: &mut Engine, conn: &mut ClientConnection, now: SystemTime) {
    let result = match &mut conn.state {
        ConnectionState::RunCgi(cgi) => cgi.finish(),
        _ => return,
    };
    let builder = ResponseBuilder::new(engine.server_for_port(conn.port), now);
    let response = if result.success {
        builder.success(200, result.output, "text/html")
    } else {
        builder.error(500, "The request handler exited abnormally.")
    };
    queue_response(conn, response);
    poll_send_response(conn, &mut engine.stats);
}

fn queue_response(conn: &mut ClientConnection, response: Response) {
    conn.http_code = response.code;
    conn.outbound = response.serialize();
    conn.outbound_sent = 0;
    conn.state = ConnectionState::SendResponse;
}

/// Drain the outbound accumulator. Partial writes stay queued and resume on
/// the next write-readiness report.
fn poll_send_response(conn: &mut ClientConnection, stats: &mut ServerStats) {
    let sent = match send(
        conn.fd(),
        &conn.outbound[conn.outbound_sent..],
        MsgFlags::empty(),
    ) {
        Ok(sent) if sent > 0 => sent,
        Err(nix::Error::Sys(Errno::EAGAIN)) | Err(nix::Error::Sys(Errno::EINTR)) => {
            return;
        }
        _ => {
            // closure or other error
            conn.state = ConnectionState::Done;
            return;
        }
    };
    conn.outbound_sent += sent;
    conn.total_sent += sent as u64;
    stats.total_out += sent as u64;

    if conn.outbound_sent == conn.outbound.len() {
        conn.state = ConnectionState::Done;
    }
}

/// Add a connection's details to the access log.
fn log_connection(engine: &mut Engine, conn: &ClientConnection, now: SystemTime) {
    if conn.http_code == 0 {
        return; // died before a response was queued
    }
    let method = match &conn.method {
        Some(method) => method,
        // didn't parse; nothing meaningful to log
        None => return,
    };
    let message = format!(
        "{} - - {} \"{} {} HTTP/1.1\" {} {}\n",
        conn.client,
        ClfDate(now),
        LogEncoded(method),
        LogEncoded(conn.uri.as_deref().unwrap_or("")),
        conn.http_code,
        conn.total_sent,
    );
    if let Err(e) = engine.log_sink.log(&message) {
        eprintln!("warning: failed to write log message: {}", e);
    }
}

/// Log whatever is still in flight and drop it. Called once at shutdown.
pub fn shutdown(engine: &mut Engine, connections: &mut Vec<ClientConnection>) {
    let now = SystemTime::now();
    for conn in connections.drain(..) {
        log_connection(engine, &conn, now);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::thread::sleep;
    use std::time::Duration;

    use crate::config::LocationConfig;

    /// An engine with one server bound to an OS-assigned port on localhost.
    fn test_engine(root: &str) -> (Engine, Vec<ListeningEndpoint>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();
        let location = LocationConfig {
            path: "/".to_string(),
            root: root.to_string(),
            allowed_methods: vec!["GET".to_string(), "POST".to_string()],
            index: String::new(),
            auto_index: false,
            redirect_url: String::new(),
            allow_upload: false,
            upload_store: String::new(),
            cgi_handlers: HashMap::new(),
        };
        let server = ServerConfig {
            port,
            host: "127.0.0.1".to_string(),
            server_names: vec!["localhost".to_string()],
            root: root.to_string(),
            max_body_size: 1024,
            error_pages: HashMap::new(),
            locations: vec![location],
        };
        let engine = Engine::new(vec![server], MimeMap::default(), LogSink::Stdout);
        let listeners = vec![ListeningEndpoint { listener, port }];
        (engine, listeners)
    }

    fn drive<F>(root: &str, client: F) -> String
    where
        F: FnOnce(u16) -> Vec<u8> + Send + 'static,
    {
        let (mut engine, listeners) = test_engine(root);
        let port = listeners[0].port;
        let handle = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream.write_all(&client(port)).unwrap();
            let mut response = Vec::new();
            stream.read_to_end(&mut response).unwrap();
            response
        });
        let mut connections = Vec::new();
        let mut files_exhausted = false;
        while !handle.is_finished() {
            poll(
                &mut engine,
                &listeners,
                &mut files_exhausted,
                &mut connections,
                Some(Duration::from_millis(10)),
            );
        }
        String::from_utf8(handle.join().unwrap()).unwrap()
    }

    #[test]
    fn serves_a_request_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello world").unwrap();
        let response = drive(dir.path().to_str().unwrap(), |_| {
            b"GET /hello.txt HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec()
        });
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Type: text/plain"));
        assert!(response.ends_with("hello world"));
    }

    #[test]
    fn malformed_request_gets_400_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let response = drive(dir.path().to_str().unwrap(), |_| {
            b"NONSENSE\r\n\r\n".to_vec()
        });
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.contains("Connection: close"));
    }

    #[test]
    fn request_delivered_byte_by_byte_still_parses() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"chunked ok").unwrap();
        let (mut engine, listeners) = test_engine(dir.path().to_str().unwrap());
        let port = listeners[0].port;
        let handle = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            for byte in b"GET /a.txt HTTP/1.1\r\nHost: x\r\n\r\n".iter() {
                stream.write_all(&[*byte]).unwrap();
                stream.flush().unwrap();
                sleep(Duration::from_millis(1));
            }
            let mut response = Vec::new();
            stream.read_to_end(&mut response).unwrap();
            response
        });
        let mut connections = Vec::new();
        let mut files_exhausted = false;
        while !handle.is_finished() {
            poll(
                &mut engine,
                &listeners,
                &mut files_exhausted,
                &mut connections,
                Some(Duration::from_millis(10)),
            );
        }
        let response = String::from_utf8(handle.join().unwrap()).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("chunked ok"));
    }

    #[test]
    fn declared_oversized_body_is_refused_early() {
        let dir = tempfile::tempdir().unwrap();
        let response = drive(dir.path().to_str().unwrap(), |_| {
            // Declares far more than max_body_size but never sends it.
            b"POST /x HTTP/1.1\r\nContent-Length: 999999\r\n\r\n".to_vec()
        });
        assert!(response.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }
}
