// src/request.rs
use crate::auth::{hash_password, verify_password};
use crate::buffer::Buffer;
use crate::sqlpool::SqlConnPool;
use crate::{log_debug, log_error, log_warn};
use std::collections::HashMap;

/// Request targets that map to `<name>.html` under the static root.
const DEFAULT_HTML: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// A full request is buffered and parsed.
    Complete,
    /// More input is required; the caller rearms for read.
    Incomplete,
    /// Malformed request; the caller answers 400.
    Error,
}

enum Verify {
    Accepted,
    Rejected,
    Unavailable,
}

/// One HTTP/1.1 request, parsed incrementally off the ingress buffer.
///
/// The parser is a pull parser over CRLF-delimited lines: it consumes each
/// complete unit as it goes and keeps its state across calls, so a request
/// split over several reads resumes where it left off.
pub struct HttpRequest {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: String,
    post: HashMap<String, String>,
    db_unavailable: bool,
}

impl HttpRequest {
    pub fn new() -> HttpRequest {
        HttpRequest {
            state: ParseState::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: String::new(),
            post: HashMap::new(),
            db_unavailable: false,
        }
    }

    pub fn parse(&mut self, buff: &mut Buffer) -> ParseStatus {
        loop {
            match self.state {
                ParseState::Finish => return ParseStatus::Complete,
                ParseState::Body => {
                    let need = self.content_length();
                    if need == 0 {
                        self.state = ParseState::Finish;
                        continue;
                    }
                    if buff.readable_len() < need {
                        return ParseStatus::Incomplete;
                    }
                    self.body = String::from_utf8_lossy(&buff.peek()[..need]).into_owned();
                    buff.consume(need);
                    self.parse_post();
                    self.state = ParseState::Finish;
                }
                ParseState::RequestLine | ParseState::Headers => {
                    let Some(line) = buff.consume_until(b"\r\n") else {
                        return ParseStatus::Incomplete;
                    };

                    if self.state == ParseState::RequestLine {
                        if !self.parse_request_line(&line) {
                            return ParseStatus::Error;
                        }
                        log_debug!("request: {} {} HTTP/{}", self.method, self.path, self.version);
                        self.state = ParseState::Headers;
                    } else if line.is_empty() {
                        // Blank line terminates the header block.
                        self.state = if self.method == "POST" {
                            ParseState::Body
                        } else {
                            ParseState::Finish
                        };
                    } else if !self.parse_header(&line) {
                        return ParseStatus::Error;
                    }
                }
            }
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_finished(&self) -> bool {
        self.state == ParseState::Finish
    }

    /// Header lookup, case-insensitive in the field name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn post_field(&self, key: &str) -> Option<&str> {
        self.post.get(key).map(String::as_str)
    }

    pub fn is_keep_alive(&self) -> bool {
        self.version == "1.1"
            && self
                .header("Connection")
                .map_or(false, |v| v.eq_ignore_ascii_case("keep-alive"))
    }

    /// The dynamic handler could not reach the database; answer 500.
    pub fn db_unavailable(&self) -> bool {
        self.db_unavailable
    }

    fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    fn parse_request_line(&mut self, line: &[u8]) -> bool {
        let Ok(line) = std::str::from_utf8(line) else {
            return false;
        };
        let parts: Vec<&str> = line.split(' ').collect();
        if parts.len() != 3 {
            return false;
        }
        let Some(version) = parts[2].strip_prefix("HTTP/") else {
            return false;
        };
        self.method = parts[0].to_string();
        self.path = parts[1].to_string();
        self.version = version.to_string();
        self.map_path();
        true
    }

    fn map_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if DEFAULT_HTML.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    fn parse_header(&mut self, line: &[u8]) -> bool {
        let Ok(line) = std::str::from_utf8(line) else {
            return false;
        };
        let Some((name, value)) = line.split_once(':') else {
            return false;
        };
        self.headers
            .insert(name.trim().to_string(), value.trim().to_string());
        true
    }

    fn parse_post(&mut self) {
        if self.method != "POST" {
            return;
        }
        let is_form = self
            .header("Content-Type")
            .map_or(false, |v| v.starts_with("application/x-www-form-urlencoded"));
        if !is_form {
            return;
        }
        self.post = parse_urlencoded(&self.body);

        let is_login = match self.path.as_str() {
            "/login.html" => true,
            "/register.html" => false,
            _ => return,
        };
        let username = self.post.get("username").cloned().unwrap_or_default();
        let password = self.post.get("password").cloned().unwrap_or_default();
        match user_verify(&username, &password, is_login) {
            Verify::Accepted => self.path = "/welcome.html".to_string(),
            Verify::Rejected => self.path = "/error.html".to_string(),
            Verify::Unavailable => self.db_unavailable = true,
        }
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        HttpRequest::new()
    }
}

/// Decode an `application/x-www-form-urlencoded` body into a field map.
fn parse_urlencoded(body: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for pair in body.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        fields.insert(decode_component(key), decode_component(value));
    }
    fields
}

fn decode_component(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            // Decode %XX when two hex digits follow; keep the raw byte otherwise.
            b'%' if i + 2 < bytes.len() => match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi * 16 + lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Check credentials against the `users` table; on registration also
/// insert the freshly hashed password.
fn user_verify(username: &str, password: &str, is_login: bool) -> Verify {
    if username.is_empty() || password.is_empty() {
        return Verify::Rejected;
    }
    let Some(mut client) = SqlConnPool::instance().try_acquire() else {
        log_warn!("sql pool busy, refusing {} for {}", if is_login { "login" } else { "register" }, username);
        return Verify::Unavailable;
    };

    let row = match client.query_opt("SELECT password FROM users WHERE username = $1", &[&username]) {
        Ok(row) => row,
        Err(e) => {
            log_error!("user lookup failed: {}", e);
            return Verify::Unavailable;
        }
    };

    if is_login {
        let Some(row) = row else {
            return Verify::Rejected;
        };
        let stored: String = row.get(0);
        match verify_password(password, &stored) {
            Ok(true) => Verify::Accepted,
            _ => Verify::Rejected,
        }
    } else {
        if row.is_some() {
            // Username taken.
            return Verify::Rejected;
        }
        let hash = match hash_password(password) {
            Ok(hash) => hash,
            Err(e) => {
                log_error!("password hash failed: {}", e);
                return Verify::Unavailable;
            }
        };
        match client.execute(
            "INSERT INTO users (username, password) VALUES ($1, $2)",
            &[&username, &hash],
        ) {
            Ok(_) => Verify::Accepted,
            Err(e) => {
                log_error!("user insert failed: {}", e);
                Verify::Rejected
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(data: &[u8]) -> Buffer {
        let mut buff = Buffer::new();
        buff.append(data);
        buff
    }

    #[test]
    fn test_parse_basic_get() {
        let mut buff = buffer_with(
            b"GET /picture?from=top HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n",
        );
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(&mut buff), ParseStatus::Complete);
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/picture?from=top");
        assert_eq!(req.version(), "1.1");
        assert_eq!(req.header("host"), Some("localhost"));
        assert!(req.is_keep_alive());
        assert_eq!(buff.readable_len(), 0);
    }

    #[test]
    fn test_path_mapping() {
        for (target, expect) in [
            ("/", "/index.html"),
            ("/index", "/index.html"),
            ("/login", "/login.html"),
            ("/static/app.js", "/static/app.js"),
        ] {
            let raw = format!("GET {} HTTP/1.1\r\n\r\n", target);
            let mut buff = buffer_with(raw.as_bytes());
            let mut req = HttpRequest::new();
            assert_eq!(req.parse(&mut buff), ParseStatus::Complete);
            assert_eq!(req.path(), expect);
        }
    }

    #[test]
    fn test_incremental_parse_resumes() {
        let mut buff = buffer_with(b"GET /index.html HT");
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(&mut buff), ParseStatus::Incomplete);

        buff.append(b"TP/1.1\r\nHost: x");
        assert_eq!(req.parse(&mut buff), ParseStatus::Incomplete);

        buff.append(b"\r\n\r\n");
        assert_eq!(req.parse(&mut buff), ParseStatus::Complete);
        assert_eq!(req.header("Host"), Some("x"));
    }

    #[test]
    fn test_post_form_decoding() {
        let body = "name=ada+lovelace&note=100%25";
        let raw = format!(
            "POST /submit.html HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let mut buff = buffer_with(raw.as_bytes());
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(&mut buff), ParseStatus::Complete);
        assert_eq!(req.post_field("name"), Some("ada lovelace"));
        assert_eq!(req.post_field("note"), Some("100%"));
    }

    #[test]
    fn test_post_body_waits_for_content_length() {
        let raw = b"POST /submit.html HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 7\r\n\r\na=1&";
        let mut buff = buffer_with(raw);
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(&mut buff), ParseStatus::Incomplete);

        buff.append(b"b=2");
        assert_eq!(req.parse(&mut buff), ParseStatus::Complete);
        assert_eq!(req.post_field("b"), Some("2"));
    }

    #[test]
    fn test_login_without_database_flags_unavailable() {
        let body = "username=grieg&password=peer-gynt";
        let raw = format!(
            "POST /login HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let mut buff = buffer_with(raw.as_bytes());
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(&mut buff), ParseStatus::Complete);
        // The process-wide pool is never initialized under test.
        assert!(req.db_unavailable());
    }

    #[test]
    fn test_malformed_request_line() {
        let mut buff = buffer_with(b"THIS IS NOT HTTP\r\n\r\n");
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(&mut buff), ParseStatus::Error);
    }

    #[test]
    fn test_close_by_default() {
        let mut buff = buffer_with(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(&mut buff), ParseStatus::Complete);
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn test_urlencoded_edge_cases() {
        let fields = parse_urlencoded("a=&=b&lone&x=%4");
        assert_eq!(fields.get("a").map(String::as_str), Some(""));
        assert_eq!(fields.get("lone").map(String::as_str), Some(""));
        assert_eq!(fields.get("x").map(String::as_str), Some("%4"));
    }
}
