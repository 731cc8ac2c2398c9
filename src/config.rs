use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};

use crate::http::Method;

pub const DEFAULT_CONFIG_PATH: &str = "config/server.conf";
const DEFAULT_MAX_BODY_SIZE: u64 = 1 << 20;

/// One virtual server: a listening (host, port) plus its routing table.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub server_names: Vec<String>,
    pub root: String,
    /// Maximum accepted request body size in bytes; 0 means unlimited.
    pub max_body_size: u64,
    pub error_pages: HashMap<u16, String>,
    pub locations: Vec<LocationConfig>,
}

impl ServerConfig {
    fn new() -> Self {
        Self {
            port: 0,
            host: "0.0.0.0".to_string(),
            server_names: Vec::new(),
            root: String::new(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            error_pages: HashMap::new(),
            locations: Vec::new(),
        }
    }

    pub fn server_name(&self) -> &str {
        self.server_names
            .first()
            .map(|name| name.as_str())
            .unwrap_or(&self.host)
    }
}

/// A URI-prefix-scoped routing block within a server.
#[derive(Debug, Clone)]
pub struct LocationConfig {
    pub path: String,
    pub root: String,
    pub allowed_methods: Vec<String>,
    pub index: String,
    pub auto_index: bool,
    pub redirect_url: String,
    pub allow_upload: bool,
    pub upload_store: String,
    /// Extension (with leading dot) to interpreter path, e.g. ".py" -> "/usr/bin/python3".
    pub cgi_handlers: HashMap<String, String>,
}

impl LocationConfig {
    fn new(path: String) -> Self {
        Self {
            path,
            root: String::new(),
            allowed_methods: vec!["GET".to_string()],
            index: String::new(),
            auto_index: false,
            redirect_url: String::new(),
            allow_upload: false,
            upload_store: String::new(),
            cgi_handlers: HashMap::new(),
        }
    }
}

/// Load and validate a configuration file.
pub fn load(path: &Path) -> Result<Vec<ServerConfig>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;
    parse(&content).with_context(|| format!("in configuration file {}", path.display()))
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    OpenBrace,
    CloseBrace,
    Semicolon,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Word(word) => write!(f, "`{}'", word),
            Self::OpenBrace => write!(f, "`{{'"),
            Self::CloseBrace => write!(f, "`}}'"),
            Self::Semicolon => write!(f, "`;'"),
        }
    }
}

struct Tokenizer<'a> {
    content: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(content: &'a str) -> Self {
        Self {
            content: content.chars().peekable(),
            line: 1,
        }
    }

    /// Skip whitespace and `#` comments, counting lines.
    fn skip_blanks(&mut self) {
        while let Some(&c) = self.content.peek() {
            if c == '\n' {
                self.line += 1;
                self.content.next();
            } else if c.is_whitespace() {
                self.content.next();
            } else if c == '#' {
                while let Some(&c) = self.content.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.content.next();
                }
            } else {
                break;
            }
        }
    }

    fn next(&mut self) -> Option<Token> {
        self.skip_blanks();
        let c = *self.content.peek()?;
        match c {
            '{' => {
                self.content.next();
                Some(Token::OpenBrace)
            }
            '}' => {
                self.content.next();
                Some(Token::CloseBrace)
            }
            ';' => {
                self.content.next();
                Some(Token::Semicolon)
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = self.content.peek() {
                    if c.is_whitespace() || matches!(c, '{' | '}' | ';' | '#') {
                        break;
                    }
                    word.push(c);
                    self.content.next();
                }
                Some(Token::Word(word))
            }
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => bail!("line {}: expected {}, found {}", self.line, expected, token),
            None => bail!("line {}: expected {}, found end of file", self.line, expected),
        }
    }

    fn expect_word(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Word(word)) => Ok(word),
            Some(token) => bail!("line {}: expected a value, found {}", self.line, token),
            None => bail!("line {}: expected a value, found end of file", self.line),
        }
    }

    /// Words up to the terminating semicolon; at least one is required.
    fn expect_words(&mut self) -> Result<Vec<String>> {
        let mut words = Vec::new();
        loop {
            match self.next() {
                Some(Token::Word(word)) => words.push(word),
                Some(Token::Semicolon) if !words.is_empty() => return Ok(words),
                Some(token) => bail!("line {}: unexpected {} in directive", self.line, token),
                None => bail!("line {}: unterminated directive", self.line),
            }
        }
    }
}

fn parse(content: &str) -> Result<Vec<ServerConfig>> {
    let mut tokenizer = Tokenizer::new(content);
    let mut servers = Vec::new();
    while let Some(token) = tokenizer.next() {
        match token {
            Token::Word(ref word) if word == "server" => {
                tokenizer.expect(Token::OpenBrace)?;
                servers.push(parse_server(&mut tokenizer)?);
            }
            token => bail!(
                "line {}: expected `server' block, found {}",
                tokenizer.line,
                token
            ),
        }
    }
    if servers.is_empty() {
        bail!("no server blocks defined");
    }
    Ok(servers)
}

fn parse_server(tokenizer: &mut Tokenizer) -> Result<ServerConfig> {
    let mut server = ServerConfig::new();
    loop {
        let line = tokenizer.line;
        match tokenizer.next() {
            Some(Token::CloseBrace) => break,
            Some(Token::Word(directive)) => match directive.as_str() {
                "listen" => {
                    let port = tokenizer.expect_word()?;
                    server.port = port
                        .parse()
                        .map_err(|_| anyhow!("line {}: port number {} is invalid", line, port))?;
                    tokenizer.expect(Token::Semicolon)?;
                }
                "host" => {
                    server.host = tokenizer.expect_word()?;
                    tokenizer.expect(Token::Semicolon)?;
                }
                "server_name" => {
                    server.server_names = tokenizer.expect_words()?;
                }
                "root" => {
                    server.root = strip_trailing_slash(tokenizer.expect_word()?);
                    tokenizer.expect(Token::Semicolon)?;
                }
                "max_body_size" => {
                    let size = tokenizer.expect_word()?;
                    server.max_body_size = size
                        .parse()
                        .map_err(|_| anyhow!("line {}: body size {} is invalid", line, size))?;
                    tokenizer.expect(Token::Semicolon)?;
                }
                "error_page" => {
                    let code = tokenizer.expect_word()?;
                    let code: u16 = code
                        .parse()
                        .map_err(|_| anyhow!("line {}: status code {} is invalid", line, code))?;
                    let page = tokenizer.expect_word()?;
                    server.error_pages.insert(code, page);
                    tokenizer.expect(Token::Semicolon)?;
                }
                "location" => {
                    let path = tokenizer.expect_word()?;
                    if !path.starts_with('/') {
                        bail!("line {}: location path {} must start with `/'", line, path);
                    }
                    tokenizer.expect(Token::OpenBrace)?;
                    server.locations.push(parse_location(tokenizer, path)?);
                }
                directive => bail!("line {}: unknown server directive `{}'", line, directive),
            },
            Some(token) => bail!("line {}: unexpected {} in server block", line, token),
            None => bail!("line {}: unterminated server block", line),
        }
    }
    if server.port == 0 {
        bail!("server block is missing a `listen' directive");
    }
    Ok(server)
}

fn parse_location(tokenizer: &mut Tokenizer, path: String) -> Result<LocationConfig> {
    let mut location = LocationConfig::new(path);
    loop {
        let line = tokenizer.line;
        match tokenizer.next() {
            Some(Token::CloseBrace) => break,
            Some(Token::Word(directive)) => match directive.as_str() {
                "root" => {
                    location.root = strip_trailing_slash(tokenizer.expect_word()?);
                    tokenizer.expect(Token::Semicolon)?;
                }
                "methods" => {
                    let methods = tokenizer.expect_words()?;
                    for method in &methods {
                        if Method::from_token(method).is_none() {
                            bail!("line {}: unknown HTTP method `{}'", line, method);
                        }
                    }
                    location.allowed_methods = methods;
                }
                "index" => {
                    location.index = tokenizer.expect_word()?;
                    tokenizer.expect(Token::Semicolon)?;
                }
                "autoindex" => {
                    location.auto_index = parse_switch(tokenizer, line)?;
                }
                "redirect" => {
                    location.redirect_url = tokenizer.expect_word()?;
                    tokenizer.expect(Token::Semicolon)?;
                }
                "allow_upload" => {
                    location.allow_upload = parse_switch(tokenizer, line)?;
                }
                "upload_store" => {
                    location.upload_store = strip_trailing_slash(tokenizer.expect_word()?);
                    tokenizer.expect(Token::Semicolon)?;
                }
                "cgi" => {
                    let extension = tokenizer.expect_word()?;
                    if !extension.starts_with('.') {
                        bail!("line {}: CGI extension {} must start with `.'", line, extension);
                    }
                    let interpreter = tokenizer.expect_word()?;
                    location.cgi_handlers.insert(extension, interpreter);
                    tokenizer.expect(Token::Semicolon)?;
                }
                directive => bail!("line {}: unknown location directive `{}'", line, directive),
            },
            Some(token) => bail!("line {}: unexpected {} in location block", line, token),
            None => bail!("line {}: unterminated location block", line),
        }
    }
    Ok(location)
}

fn parse_switch(tokenizer: &mut Tokenizer, line: usize) -> Result<bool> {
    let value = tokenizer.expect_word()?;
    tokenizer.expect(Token::Semicolon)?;
    match value.as_str() {
        "on" => Ok(true),
        "off" => Ok(false),
        value => bail!("line {}: expected `on' or `off', found `{}'", line, value),
    }
}

fn strip_trailing_slash(mut path: String) -> String {
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    path
}
