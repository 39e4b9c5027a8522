use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error as _;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// One outbound HTTP exchange, fully resolved: absolute URL, headers, body.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub ticket: u64,
    pub method: Method,
    pub url: String,
    pub authorization: Option<String>,
    pub basic_auth: Option<(String, Option<String>)>,
    pub form: Option<Vec<(String, String)>>,
}

impl HttpRequest {
    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form
            .as_ref()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            body: value.to_string().into_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Resolve,
    Connect,
    Tls,
    Io,
    Timeout,
    TooManyRedirects,
    Other,
}

/// A failure before any HTTP status was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub detail: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Human readable cause followed by the request line, e.g. for a retry
    /// dialog.
    pub fn describe(&self, method: &Method, url: &str) -> String {
        let start = match self.kind {
            TransportErrorKind::Resolve => "Can not resolve host name".to_string(),
            TransportErrorKind::Connect => "Can not connect to the host".to_string(),
            TransportErrorKind::Tls => format!("TLS Error {}", self.detail),
            TransportErrorKind::Io => "IO Error (aka turn your WiFi back on)".to_string(),
            TransportErrorKind::Timeout => "Request timed out".to_string(),
            TransportErrorKind::TooManyRedirects => "Too many redirects".to_string(),
            TransportErrorKind::Other => format!("General Transport Error ({})", self.detail),
        };
        format!("{}\n Message {} {}", start, method, url)
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        let mut chain = err.to_string();
        let mut source = err.source();
        while let Some(inner) = source {
            chain.push_str(": ");
            chain.push_str(&inner.to_string());
            source = inner.source();
        }
        let lower = chain.to_ascii_lowercase();
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_redirect() {
            TransportErrorKind::TooManyRedirects
        } else if lower.contains("certificate") || lower.contains("tls") {
            TransportErrorKind::Tls
        } else if lower.contains("dns") || lower.contains("resolve") {
            TransportErrorKind::Resolve
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_body() || err.is_decode() || err.is_request() {
            TransportErrorKind::Io
        } else {
            TransportErrorKind::Other
        };
        Self::new(kind, chain)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

pub type Completion = Box<dyn FnOnce(Result<HttpResponse, TransportError>) + Send>;

/// Issues HTTP requests off the dispatch thread.
///
/// `start` must return promptly; `done` is called exactly once from any
/// thread, unless the request was aborted, in which case it may be dropped.
pub trait Transport: Send + Sync {
    fn start(&self, request: HttpRequest, done: Completion);

    fn abort(&self, _ticket: u64) {}
}

#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    pub user_agent: String,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

#[derive(Default)]
struct Tickets {
    running: HashSet<u64>,
    aborted: HashSet<u64>,
}

impl Tickets {
    /// Forgets `ticket`; returns whether it was aborted.
    fn finish(&mut self, ticket: u64) -> bool {
        self.running.remove(&ticket);
        self.aborted.remove(&ticket)
    }
}

/// Blocking `reqwest` client, one worker thread per request.
pub struct HttpTransport {
    http: HttpClient,
    user_agent: String,
    tickets: Arc<Mutex<Tickets>>,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        anyhow::ensure!(
            !config.user_agent.trim().is_empty(),
            "transport: user agent required"
        );
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(DEFAULT_TIMEOUT))
                .build()
                .context("transport: build http client")?,
        };
        Ok(Self {
            http,
            user_agent: config.user_agent,
            tickets: Arc::new(Mutex::new(Tickets::default())),
        })
    }

    #[cfg(test)]
    fn pending_aborts(&self) -> usize {
        self.tickets.lock().aborted.len()
    }
}

impl Transport for HttpTransport {
    fn start(&self, request: HttpRequest, done: Completion) {
        let http = self.http.clone();
        let user_agent = self.user_agent.clone();
        let tickets = self.tickets.clone();
        tickets.lock().running.insert(request.ticket);
        thread::spawn(move || {
            if tickets.lock().aborted.contains(&request.ticket) {
                tickets.lock().finish(request.ticket);
                debug!(ticket = request.ticket, "transport: skipped aborted request");
                return;
            }
            let result = execute(&http, &user_agent, &request);
            if tickets.lock().finish(request.ticket) {
                return;
            }
            done(result);
        });
    }

    /// Only tickets still running are remembered, so aborting a request that
    /// already finished leaves nothing behind.
    fn abort(&self, ticket: u64) {
        let mut tickets = self.tickets.lock();
        if tickets.running.contains(&ticket) {
            tickets.aborted.insert(ticket);
        }
    }
}

fn execute(
    http: &HttpClient,
    user_agent: &str,
    request: &HttpRequest,
) -> Result<HttpResponse, TransportError> {
    let mut req = http
        .request(request.method.clone(), &request.url)
        .header(USER_AGENT, user_agent);
    if let Some(value) = &request.authorization {
        req = req.header(AUTHORIZATION, value.as_str());
    }
    if let Some((user, password)) = &request.basic_auth {
        req = req.basic_auth(user, password.as_deref());
    }
    if let Some(form) = &request.form {
        req = req.header(CONTENT_TYPE, "application/x-www-form-urlencoded");
        req = req.form(form);
    }

    let resp = req.send().map_err(|err| TransportError::from_reqwest(&err))?;
    let status = resp.status().as_u16();
    let body = resp
        .bytes()
        .map_err(|err| TransportError::from_reqwest(&err))?
        .to_vec();
    Ok(HttpResponse { status, body })
}

type Reply = Result<HttpResponse, TransportError>;

#[derive(Default)]
struct MockState {
    routes: HashMap<String, VecDeque<Reply>>,
    held: VecDeque<(HttpRequest, Completion)>,
    history: Vec<HttpRequest>,
    aborted: Vec<u64>,
}

/// In-process transport for tests and offline runs.
///
/// Requests whose URL has a queued route are answered immediately from
/// `start`; anything else is held until `complete_next`/`fail_next`.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply for the exact URL. Multiple replies for the same URL are
    /// used in order.
    pub fn route(&self, url: impl Into<String>, status: u16, body: serde_json::Value) {
        self.push_route(url.into(), Ok(HttpResponse::json(status, &body)));
    }

    pub fn route_raw(&self, url: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) {
        self.push_route(
            url.into(),
            Ok(HttpResponse {
                status,
                body: body.into(),
            }),
        );
    }

    pub fn route_error(&self, url: impl Into<String>, error: TransportError) {
        self.push_route(url.into(), Err(error));
    }

    fn push_route(&self, url: String, reply: Reply) {
        self.state
            .lock()
            .routes
            .entry(url)
            .or_default()
            .push_back(reply);
    }

    pub fn complete_next(&self, status: u16, body: serde_json::Value) -> Option<HttpRequest> {
        self.finish_next(Ok(HttpResponse::json(status, &body)))
    }

    pub fn fail_next(&self, error: TransportError) -> Option<HttpRequest> {
        self.finish_next(Err(error))
    }

    fn finish_next(&self, reply: Reply) -> Option<HttpRequest> {
        let (request, done) = self.state.lock().held.pop_front()?;
        done(reply);
        Some(request)
    }

    pub fn held(&self) -> usize {
        self.state.lock().held.len()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().history.clone()
    }

    pub fn aborted(&self) -> Vec<u64> {
        self.state.lock().aborted.clone()
    }
}

impl Transport for MockTransport {
    fn start(&self, request: HttpRequest, done: Completion) {
        let reply = {
            let mut state = self.state.lock();
            state.history.push(request.clone());
            let reply = state
                .routes
                .get_mut(&request.url)
                .and_then(|queue| queue.pop_front());
            if reply.is_none() {
                state.held.push_back((request, done));
                return;
            }
            reply.map(|r| (r, done))
        };
        if let Some((reply, done)) = reply {
            done(reply);
        }
    }

    fn abort(&self, ticket: u64) {
        self.state.lock().aborted.push(ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;

    fn request(url: &str) -> HttpRequest {
        HttpRequest {
            ticket: 1,
            method: Method::GET,
            url: url.into(),
            authorization: None,
            basic_auth: None,
            form: None,
        }
    }

    #[test]
    fn routed_requests_answer_immediately() {
        let mock = MockTransport::new();
        mock.route("https://api.reddit.com/r/rust", 200, json!({"ok": true}));
        let (tx, rx) = mpsc::channel();
        mock.start(
            request("https://api.reddit.com/r/rust"),
            Box::new(move |reply| {
                let _ = tx.send(reply);
            }),
        );
        let reply = rx.try_recv().unwrap().unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(mock.held(), 0);
    }

    #[test]
    fn unrouted_requests_are_held() {
        let mock = MockTransport::new();
        let (tx, rx) = mpsc::channel();
        mock.start(
            request("https://api.reddit.com/hot"),
            Box::new(move |reply| {
                let _ = tx.send(reply);
            }),
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(mock.held(), 1);
        let req = mock.complete_next(200, json!({})).unwrap();
        assert_eq!(req.url, "https://api.reddit.com/hot");
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn describe_includes_request_line() {
        let err = TransportError::new(TransportErrorKind::Resolve, "dns error");
        let text = err.describe(&Method::GET, "https://api.reddit.com/r/all");
        assert_eq!(
            text,
            "Can not resolve host name\n Message GET https://api.reddit.com/r/all"
        );
    }

    #[test]
    fn aborting_finished_request_keeps_nothing() {
        let transport = HttpTransport::new(TransportConfig {
            user_agent: "snoolink-test/0.1".into(),
            ..TransportConfig::default()
        })
        .unwrap();
        transport.abort(42);
        assert_eq!(transport.pending_aborts(), 0);

        transport.tickets.lock().running.insert(7);
        transport.abort(7);
        assert_eq!(transport.pending_aborts(), 1);
        assert!(transport.tickets.lock().finish(7));
        assert_eq!(transport.pending_aborts(), 0);
        assert!(!transport.tickets.lock().finish(7));
    }

    #[test]
    fn form_value_lookup() {
        let mut req = request("https://www.reddit.com/api/v1/access_token");
        req.form = Some(vec![("grant_type".into(), "refresh_token".into())]);
        assert_eq!(req.form_value("grant_type"), Some("refresh_token"));
        assert_eq!(req.form_value("code"), None);
    }
}
