use crate::cgi::{self, CgiProcess};
use crate::config::{LocationConfig, ServerConfig};
use crate::http::{Method, MimeMap};
use crate::request::Request;
use crate::response::{Response, ResponseBuilder};
use crate::url::{decode_url, make_safe_url, HtmlEscaped, UrlEncoded};

const DEFAULT_UPLOAD_NAME: &str = "uploaded_file.bin";

/// The configuration pair a request resolved to. Produced once per request
/// and used for the whole handler chain.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub server: &'a ServerConfig,
    pub location: &'a LocationConfig,
}

#[derive(Debug, PartialEq)]
pub enum RouteError {
    NoServer,
    NoLocation,
    MethodNotAllowed,
    BodyTooLarge,
}

impl RouteError {
    pub fn status(&self) -> u16 {
        match self {
            Self::NoServer => 500,
            Self::NoLocation => 404,
            Self::MethodNotAllowed => 405,
            Self::BodyTooLarge => 413,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoServer => "No server is configured for this port.",
            Self::NoLocation => "The URL you requested was not found.",
            Self::MethodNotAllowed => "The method is not allowed for this URL.",
            Self::BodyTooLarge => "The request body exceeds the configured limit.",
        }
    }
}

/// Find the server for the accepting port, then the location whose path is
/// the longest prefix of the request URI, then enforce method and body-size
/// policy. The match is read-only configuration; nothing here is mutated.
pub fn route<'a>(
    servers: &'a [ServerConfig],
    port: u16,
    request: &Request,
) -> Result<RouteMatch<'a>, RouteError> {
    let server = servers
        .iter()
        .find(|server| server.port == port)
        .ok_or(RouteError::NoServer)?;
    let location = server
        .locations
        .iter()
        .filter(|location| request.path().starts_with(&location.path))
        .max_by_key(|location| location.path.len())
        .ok_or(RouteError::NoLocation)?;
    let allowed = location
        .allowed_methods
        .iter()
        .any(|method| method == request.method.as_str());
    if !allowed {
        return Err(RouteError::MethodNotAllowed);
    }
    if server.max_body_size > 0 && request.body.len() as u64 > server.max_body_size {
        return Err(RouteError::BodyTooLarge);
    }
    Ok(RouteMatch { server, location })
}

/// What a handler produced: a finished response, or a CGI child whose pipes
/// the event loop must now pump.
pub enum Dispatch {
    Response(Response),
    Cgi(CgiProcess),
}

pub fn dispatch(
    request: &Request,
    route: &RouteMatch,
    mime_map: &MimeMap,
    builder: &ResponseBuilder,
) -> Dispatch {
    match request.method {
        Method::Get => handle_get(request, route, mime_map, builder),
        Method::Post => handle_post(request, route, builder),
        Method::Delete => Dispatch::Response(handle_delete(request, route, builder)),
        // Allowed by configuration but without a handler.
        _ => Dispatch::Response(builder.error(405, "The method you specified is not implemented.")),
    }
}

/// Decoded, traversal-safe request path, or None for a 400.
fn safe_path(request: &Request) -> Option<String> {
    make_safe_url(&decode_url(request.path())?)
}

fn target_path(location: &LocationConfig, safe_path: &str) -> String {
    format!("{}{}", location.root, safe_path)
}

fn try_cgi(
    request: &Request,
    route: &RouteMatch,
    builder: &ResponseBuilder,
    script_name: &str,
    target: &str,
) -> Option<Dispatch> {
    let interpreter = cgi::interpreter_for(target, route.location)?;
    match cgi::spawn(interpreter, script_name, target, request, route.server) {
        Ok(process) => Some(Dispatch::Cgi(process)),
        Err(e) => Some(Dispatch::Response(
            builder.error(500, &format!("Failed to run the request handler: {}.", e)),
        )),
    }
}

fn handle_get(
    request: &Request,
    route: &RouteMatch,
    mime_map: &MimeMap,
    builder: &ResponseBuilder,
) -> Dispatch {
    if !route.location.redirect_url.is_empty() {
        return Dispatch::Response(builder.redirect(&route.location.redirect_url));
    }
    let safe = match safe_path(request) {
        Some(safe) => safe,
        None => {
            return Dispatch::Response(builder.error(400, "You requested an invalid URL."));
        }
    };
    let target = target_path(route.location, &safe);

    if let Some(dispatch) = try_cgi(request, route, builder, &safe, &target) {
        return dispatch;
    }

    let metadata = match std::fs::metadata(&target) {
        Ok(metadata) => metadata,
        Err(e) => return Dispatch::Response(file_error(builder, &e)),
    };
    if metadata.is_dir() {
        if !route.location.index.is_empty() {
            let index = format!("{}/{}", target.trim_end_matches('/'), route.location.index);
            if std::fs::metadata(&index).map(|m| m.is_file()).unwrap_or(false) {
                return Dispatch::Response(serve_file(&index, mime_map, builder));
            }
        }
        if route.location.auto_index {
            return Dispatch::Response(autoindex(&target, &safe, builder));
        }
        // Missing index with listing disabled reads as absent.
        return Dispatch::Response(builder.error(404, "The URL you requested was not found."));
    }
    Dispatch::Response(serve_file(&target, mime_map, builder))
}

fn serve_file(path: &str, mime_map: &MimeMap, builder: &ResponseBuilder) -> Response {
    match std::fs::read(path) {
        Ok(content) => builder.success(200, content, mime_map.content_type(path)),
        Err(e) => file_error(builder, &e),
    }
}

fn file_error(builder: &ResponseBuilder, e: &std::io::Error) -> Response {
    match e.kind() {
        std::io::ErrorKind::NotFound => {
            builder.error(404, "The URL you requested was not found.")
        }
        std::io::ErrorKind::PermissionDenied => {
            builder.error(403, "You don't have permission to access this URL.")
        }
        _ => builder.error(
            500,
            &format!("The URL you requested cannot be returned: {}.", e),
        ),
    }
}

/// Directory listing body.
struct Listing<'a> {
    uri: &'a str,
    entries: Vec<std::fs::DirEntry>,
}

impl<'a> std::fmt::Display for Listing<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let base = self.uri.trim_end_matches('/');
        writeln!(
            f,
            "<html><head><title>Index of {}</title></head><body>",
            HtmlEscaped(self.uri)
        )?;
        writeln!(f, "<h1>Index of {}</h1>", HtmlEscaped(self.uri))?;
        writeln!(f, "<table border='1'><tr><th>Name</th><th>Size</th></tr>")?;
        for entry in &self.entries {
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            let name = entry.file_name();
            let name = name.to_string_lossy();
            write!(
                f,
                "<tr><td><a href='{}/{}'>{}</a></td>",
                base,
                UrlEncoded(&name),
                HtmlEscaped(&name)
            )?;
            if metadata.is_dir() {
                writeln!(f, "<td>[DIR]</td></tr>")?;
            } else {
                writeln!(f, "<td>{}</td></tr>", metadata.len())?;
            }
        }
        write!(f, "</table></body></html>")
    }
}

fn autoindex(path: &str, uri: &str, builder: &ResponseBuilder) -> Response {
    let mut entries: Vec<_> = match std::fs::read_dir(path) {
        Ok(entries) => entries.filter_map(|entry| entry.ok()).collect(),
        Err(e) => {
            return builder.error(500, &format!("Couldn't list directory: {}.", e));
        }
    };
    entries.sort_by_key(|entry| entry.file_name());
    let listing = Listing { uri, entries }.to_string();
    builder.success(200, listing.into_bytes(), "text/html")
}

fn handle_post(request: &Request, route: &RouteMatch, builder: &ResponseBuilder) -> Dispatch {
    let server = route.server;
    // Second guard; the router already refused oversized bodies.
    if server.max_body_size > 0 && request.body.len() as u64 > server.max_body_size {
        return Dispatch::Response(
            builder.error(413, "The request body exceeds the configured limit."),
        );
    }
    let safe = match safe_path(request) {
        Some(safe) => safe,
        None => {
            return Dispatch::Response(builder.error(400, "You requested an invalid URL."));
        }
    };
    let target = target_path(route.location, &safe);
    if let Some(dispatch) = try_cgi(request, route, builder, &safe, &target) {
        return dispatch;
    }
    if !route.location.allow_upload {
        return Dispatch::Response(builder.error(405, "Uploads are not allowed for this URL."));
    }
    if route.location.upload_store.is_empty() {
        return Dispatch::Response(builder.error(500, "No upload directory is configured."));
    }
    let upload_path = format!("{}/{}", route.location.upload_store, upload_name(&safe));
    match std::fs::write(&upload_path, &request.body) {
        Ok(()) => {
            let body = b"<html><body><h1>File uploaded successfully</h1></body></html>".to_vec();
            Dispatch::Response(builder.success(201, body, "text/html"))
        }
        Err(e) => Dispatch::Response(
            builder.error(500, &format!("Failed to store the uploaded file: {}.", e)),
        ),
    }
}

/// Last path segment of the upload target, with a fallback name.
fn upload_name(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or("");
    if name.is_empty() {
        DEFAULT_UPLOAD_NAME
    } else {
        name
    }
}

fn handle_delete(request: &Request, route: &RouteMatch, builder: &ResponseBuilder) -> Response {
    let safe = match safe_path(request) {
        Some(safe) => safe,
        None => return builder.error(400, "You requested an invalid URL."),
    };
    let target = target_path(route.location, &safe);
    let metadata = match std::fs::metadata(&target) {
        Ok(metadata) => metadata,
        Err(_) => return builder.error(404, "The URL you requested was not found."),
    };
    if metadata.is_dir() {
        return builder.error(403, "You can't delete a directory.");
    }
    match std::fs::remove_file(&target) {
        Ok(()) => builder.no_content(),
        Err(e) => builder.error(500, &format!("Failed to delete the file: {}.", e)),
    }
}
