use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};

use webserv_rs::config;
use webserv_rs::http::{MimeMap, DEFAULT_MIME_TYPE};
use webserv_rs::log::LogSink;
use webserv_rs::server::{self, Engine};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

struct Options {
    config_path: PathBuf,
    log_sink: LogSink,
    mimetypes_file: Option<OsString>,
    default_mimetype: Option<String>,
}

impl Options {
    fn from_command_line() -> Result<Self> {
        let mut options = Self {
            config_path: PathBuf::from(config::DEFAULT_CONFIG_PATH),
            log_sink: LogSink::default(),
            mimetypes_file: None,
            default_mimetype: None,
        };
        let mut args = std::env::args();
        let name = args.next().expect("expected at least one argument");
        let mut config_path_given = false;
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--help" => {
                    usage(&name);
                    std::process::exit(0);
                }
                "--log" => {
                    let filename = args.next().context("missing filename after --log")?;
                    options.log_sink = LogSink::open_file(&filename)?;
                }
                "--syslog" => options.log_sink = LogSink::Syslog,
                "--mimetypes" => {
                    let filename = args.next().context("missing filename after --mimetypes")?;
                    options.mimetypes_file = Some(OsString::from(filename));
                }
                "--default-mimetype" => {
                    options.default_mimetype = Some(
                        args.next()
                            .context("missing string after --default-mimetype")?,
                    );
                }
                arg if !arg.starts_with("--") && !config_path_given => {
                    options.config_path = PathBuf::from(arg);
                    config_path_given = true;
                }
                arg => {
                    return Err(anyhow!("unknown argument `{}'", arg));
                }
            }
        }
        Ok(options)
    }
}

fn usage(argv0: &str) {
    print!(
        "usage:\t{} [/path/to/server.conf] [flags]\n\n\
        \tThe configuration path defaults to {}.\n\n\
        flags:\t--log filename (default: stdout)\n\
        \t\tSpecifies which file to append the access log to.\n\n\
        \t--syslog\n\
        \t\tUse syslog for the access log.\n\n\
        \t--mimetypes filename (optional)\n\
        \t\tParses specified file for extension-MIME associations.\n\n\
        \t--default-mimetype string (optional, default: {})\n\
        \t\tFiles with unknown extensions are served as this mimetype.\n\n",
        argv0,
        config::DEFAULT_CONFIG_PATH,
        DEFAULT_MIME_TYPE,
    );
}

fn main() -> Result<()> {
    println!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let options = Options::from_command_line()?;
    let servers = config::load(&options.config_path)?;

    let mut mime_map = MimeMap::default();
    if let Some(filename) = &options.mimetypes_file {
        mime_map.parse_extension_map_file(filename)?;
    }
    if let Some(default_mimetype) = options.default_mimetype {
        mime_map.default_mimetype = default_mimetype;
    }

    let listeners = server::create_listeners(&servers)?;

    // set signal handlers; SIGPIPE must be ignored so a CGI child that exits
    // without reading its stdin can't kill the server
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    let mut engine = Engine::new(servers, mime_map, options.log_sink);
    let mut connections = Vec::new();
    let mut files_exhausted = false;

    // main loop
    while is_running() {
        server::poll(
            &mut engine,
            &listeners,
            &mut files_exhausted,
            &mut connections,
            None,
        );
    }

    server::shutdown(&mut engine, &mut connections);
    engine.stats.print()?;
    Ok(())
}
