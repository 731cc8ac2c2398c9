use std::ffi::{CStr, CString};
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, execve, fork, pipe, read, write, ForkResult, Pid};

use crate::config::{LocationConfig, ServerConfig};
use crate::request::Request;
use crate::response::SERVER_SOFTWARE;

const PIPE_CHUNK: usize = 4096;

#[derive(Debug)]
pub enum CgiError {
    Pipe(nix::Error),
    Fork(nix::Error),
    BadScriptPath,
}

impl std::fmt::Display for CgiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pipe(e) => write!(f, "failed to create pipe: {}", e),
            Self::Fork(e) => write!(f, "failed to fork: {}", e),
            Self::BadScriptPath => write!(f, "script path contains a NUL byte"),
        }
    }
}

/// The interpreter configured for the target's extension, if any. This is
/// the detection step: a path whose extension has no handler is served as a
/// static file instead.
pub fn interpreter_for<'a>(path: &str, location: &'a LocationConfig) -> Option<&'a str> {
    let dot = path.rfind('.')?;
    location
        .cgi_handlers
        .get(&path[dot..])
        .map(|interpreter| interpreter.as_str())
}

/// Outcome of one CGI invocation.
#[derive(Debug)]
pub struct CgiResult {
    pub exit_code: i32,
    pub output: Vec<u8>,
    pub success: bool,
}

/// A running CGI child with its two pipe ends. Both parent-side descriptors
/// are non-blocking; the event loop registers them in its readiness set and
/// pumps them alongside client sockets.
#[derive(Debug)]
pub struct CgiProcess {
    child: Option<Pid>,
    stdin: Option<RawFd>,
    stdout: Option<RawFd>,
    stdin_buf: Vec<u8>,
    stdin_sent: usize,
    output: Vec<u8>,
}

impl CgiProcess {
    /// Descriptor to watch for write-readiness, while body bytes remain.
    pub fn stdin_fd(&self) -> Option<RawFd> {
        self.stdin
    }

    /// Descriptor to watch for read-readiness until EOF.
    pub fn stdout_fd(&self) -> Option<RawFd> {
        self.stdout
    }

    /// Drain pending body bytes into the child's stdin; closes it when done
    /// or when the child stops reading.
    pub fn pump_stdin(&mut self) {
        let fd = match self.stdin {
            Some(fd) => fd,
            None => return,
        };
        if self.stdin_sent < self.stdin_buf.len() {
            match write(fd, &self.stdin_buf[self.stdin_sent..]) {
                Ok(sent) => self.stdin_sent += sent,
                Err(nix::Error::Sys(Errno::EAGAIN)) | Err(nix::Error::Sys(Errno::EINTR)) => {
                    return;
                }
                // EPIPE: the child closed stdin without reading everything.
                Err(_) => self.stdin_sent = self.stdin_buf.len(),
            }
        }
        if self.stdin_sent >= self.stdin_buf.len() {
            close(fd).ok();
            self.stdin = None;
        }
    }

    /// Read one chunk of child output. Returns true once stdout reaches EOF,
    /// at which point the caller should `finish()` the invocation.
    pub fn pump_stdout(&mut self) -> bool {
        let fd = match self.stdout {
            Some(fd) => fd,
            None => return true,
        };
        let mut buf = [0; PIPE_CHUNK];
        match read(fd, &mut buf) {
            Ok(0) => {
                close(fd).ok();
                self.stdout = None;
                true
            }
            Ok(received) => {
                self.output.extend_from_slice(&buf[..received]);
                false
            }
            Err(nix::Error::Sys(Errno::EAGAIN)) | Err(nix::Error::Sys(Errno::EINTR)) => false,
            Err(_) => {
                close(fd).ok();
                self.stdout = None;
                true
            }
        }
    }

    /// Reap the child and hand back its captured output. A non-zero or
    /// abnormal exit yields a failed result with empty output.
    pub fn finish(&mut self) -> CgiResult {
        if let Some(fd) = self.stdin.take() {
            close(fd).ok();
        }
        if let Some(fd) = self.stdout.take() {
            close(fd).ok();
        }
        let mut result = CgiResult {
            exit_code: -1,
            output: std::mem::take(&mut self.output),
            success: false,
        };
        if let Some(child) = self.child.take() {
            if let Ok(WaitStatus::Exited(_, code)) = waitpid(child, None) {
                result.exit_code = code;
                result.success = code == 0;
            }
        }
        if !result.success {
            result.output.clear();
        }
        result
    }
}

impl Drop for CgiProcess {
    fn drop(&mut self) {
        if let Some(fd) = self.stdin.take() {
            close(fd).ok();
        }
        if let Some(fd) = self.stdout.take() {
            close(fd).ok();
        }
        if let Some(child) = self.child.take() {
            waitpid(child, Some(WaitPidFlag::WNOHANG)).ok();
        }
    }
}

/// Fork the interpreter with the request body wired to its stdin and its
/// stdout captured, argv `[interpreter, script]`, RFC 3875 environment.
pub fn spawn(
    interpreter: &str,
    script_name: &str,
    script_filename: &str,
    request: &Request,
    server: &ServerConfig,
) -> Result<CgiProcess, CgiError> {
    let argv: Vec<CString> = vec![
        CString::new(interpreter).map_err(|_| CgiError::BadScriptPath)?,
        CString::new(script_filename).map_err(|_| CgiError::BadScriptPath)?,
    ];
    let env = build_environment(request, script_name, script_filename, server);

    let (stdin_read, stdin_write) = pipe().map_err(CgiError::Pipe)?;
    let (stdout_read, stdout_write) = match pipe() {
        Ok(fds) => fds,
        Err(e) => {
            close(stdin_read).ok();
            close(stdin_write).ok();
            return Err(CgiError::Pipe(e));
        }
    };

    let child = match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            dup2(stdin_read, libc::STDIN_FILENO).ok();
            dup2(stdout_write, libc::STDOUT_FILENO).ok();
            close(stdin_read).ok();
            close(stdin_write).ok();
            close(stdout_read).ok();
            close(stdout_write).ok();
            let argv_refs: Vec<&CStr> = argv.iter().map(|arg| arg.as_c_str()).collect();
            let env_refs: Vec<&CStr> = env.iter().map(|var| var.as_c_str()).collect();
            execve(&argv[0], &argv_refs, &env_refs).ok();
            unsafe { libc::_exit(127) }
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => {
            close(stdin_read).ok();
            close(stdin_write).ok();
            close(stdout_read).ok();
            close(stdout_write).ok();
            return Err(CgiError::Fork(e));
        }
    };

    close(stdin_read).ok();
    close(stdout_write).ok();
    fcntl(stdin_write, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).ok();
    fcntl(stdout_read, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).ok();

    let mut process = CgiProcess {
        child: Some(child),
        stdin: Some(stdin_write),
        stdout: Some(stdout_read),
        stdin_buf: request.body.clone(),
        stdin_sent: 0,
        output: Vec::new(),
    };
    // Nothing to feed: close stdin right away so the child sees EOF.
    if process.stdin_buf.is_empty() {
        process.pump_stdin();
    }
    Ok(process)
}

/// RFC 3875 subset plus one HTTP_* variable per request header.
fn build_environment(
    request: &Request,
    script_name: &str,
    script_filename: &str,
    server: &ServerConfig,
) -> Vec<CString> {
    let mut env: Vec<(String, String)> = vec![
        ("REQUEST_METHOD".to_string(), request.method.as_str().to_string()),
        ("SCRIPT_NAME".to_string(), script_name.to_string()),
        ("SCRIPT_FILENAME".to_string(), script_filename.to_string()),
        ("SERVER_NAME".to_string(), server.server_name().to_string()),
        ("SERVER_PORT".to_string(), server.port.to_string()),
        ("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string()),
        ("SERVER_SOFTWARE".to_string(), SERVER_SOFTWARE.to_string()),
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        ("QUERY_STRING".to_string(), request.query().to_string()),
        ("PATH_INFO".to_string(), path_info(script_name, request.path())),
    ];
    // Interpreters need a search path to run anything but builtins.
    if let Ok(path) = std::env::var("PATH") {
        env.push(("PATH".to_string(), path));
    }
    if let Some(content_length) = request.headers.get("Content-Length") {
        env.push(("CONTENT_LENGTH".to_string(), content_length.to_string()));
    }
    if let Some(content_type) = request.headers.get("Content-Type") {
        env.push(("CONTENT_TYPE".to_string(), content_type.to_string()));
    }
    for (key, value) in request.headers.iter() {
        let mut env_key = String::with_capacity(key.len() + 5);
        env_key.push_str("HTTP_");
        for c in key.chars() {
            match c {
                '-' => env_key.push('_'),
                c => env_key.push(c.to_ascii_uppercase()),
            }
        }
        env.push((env_key, value.to_string()));
    }
    env.into_iter()
        .filter_map(|(key, value)| CString::new(format!("{}={}", key, value)).ok())
        .collect()
}

/// URI remainder after the script path, empty when the URI is the script.
fn path_info(script_name: &str, uri_path: &str) -> String {
    uri_path
        .strip_prefix(script_name)
        .unwrap_or("")
        .to_string()
}
