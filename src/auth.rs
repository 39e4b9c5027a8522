use std::collections::HashMap;
use std::fmt;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use crossbeam_channel::{bounded, Receiver, Sender};
use once_cell::sync::Lazy;
use rand::RngCore;
use reqwest::Method;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tiny_http::{Header, Response, Server};
use url::Url;

use crate::error::RequestError;
use crate::transport::{HttpRequest, HttpResponse};

pub const TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";
pub const AUTHORIZE_URL: &str = "https://www.reddit.com/api/v1/authorize";

static HTML_SUCCESS: Lazy<String> = Lazy::new(|| {
    r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <title>snoolink: signed in</title>
    <style>
      body {
        margin: 0;
        min-height: 100vh;
        display: flex;
        align-items: center;
        justify-content: center;
        background: #11151d;
        color: #e8edf5;
        font-family: "Inter", "Segoe UI", -apple-system, sans-serif;
      }
      .card {
        background: #1c2230;
        padding: 2.5rem 3rem;
        border-radius: 16px;
        max-width: 480px;
        text-align: center;
      }
      h1 { margin: 0 0 1rem; color: #ff6314; }
      p { margin: 0; color: #9aa3b7; line-height: 1.5; }
    </style>
  </head>
  <body>
    <main class="card">
      <h1>Signed in</h1>
      <p>snoolink received your authorization. You can close this tab and return to the terminal.</p>
    </main>
  </body>
</html>"#
        .to_string()
});

#[derive(Debug, Clone)]
pub struct Config {
    pub client_id: String,
    pub client_secret: String,
    pub scope: Vec<String>,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            scope: vec![
                "edit".into(),
                "history".into(),
                "identity".into(),
                "mysubreddits".into(),
                "privatemessages".into(),
                "submit".into(),
                "subscribe".into(),
                "vote".into(),
                "read".into(),
                "save".into(),
            ],
            auth_url: AUTHORIZE_URL.into(),
            token_url: TOKEN_URL.into(),
            redirect_uri: "http://127.0.0.1:65010/snoolink/callback".into(),
        }
    }
}

/// Successful answer from the token endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub scope: String,
}

#[derive(Debug, Deserialize)]
struct TokenError {
    #[serde(default)]
    error: serde_json::Value,
    #[serde(default, rename = "error_description")]
    description: String,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match &self.error {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match (code.is_empty(), self.description.is_empty()) {
            (true, true) => write!(f, "unknown token error"),
            (false, true) => write!(f, "{}", code),
            (true, false) => write!(f, "{}", self.description),
            (false, false) => write!(f, "{} ({})", code, self.description),
        }
    }
}

/// Builds token endpoint requests. The dispatcher assigns the ticket and
/// ships them without any credential attached.
#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    cfg: Config,
}

impl TokenEndpoint {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn code_request(&self, code: &str, verifier: Option<&str>) -> HttpRequest {
        let mut form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
            ("redirect_uri".to_string(), self.cfg.redirect_uri.clone()),
        ];
        if let Some(verifier) = verifier {
            form.push(("code_verifier".to_string(), verifier.to_string()));
        }
        self.request(form)
    }

    pub fn refresh_request(&self, refresh_token: &str) -> HttpRequest {
        self.request(vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
        ])
    }

    fn request(&self, form: Vec<(String, String)>) -> HttpRequest {
        HttpRequest {
            ticket: 0,
            method: Method::POST,
            url: self.cfg.token_url.clone(),
            authorization: None,
            basic_auth: Some((
                self.cfg.client_id.clone(),
                Some(self.cfg.client_secret.clone()),
            )),
            form: Some(form),
        }
    }

    pub fn authorize_url(&self, state: &str, challenge: &str) -> Result<String> {
        let mut auth = Url::parse(&self.cfg.auth_url)?;
        auth.query_pairs_mut()
            .append_pair("client_id", &self.cfg.client_id)
            .append_pair("response_type", "code")
            .append_pair("state", state)
            .append_pair("redirect_uri", &self.cfg.redirect_uri)
            .append_pair("duration", "permanent")
            .append_pair("scope", &self.cfg.scope.join(" "))
            .append_pair("code_challenge", challenge)
            .append_pair("code_challenge_method", "S256");
        Ok(auth.to_string())
    }
}

/// Classifies a token endpoint response the same way API responses are.
pub fn parse_grant(resp: &HttpResponse) -> std::result::Result<TokenGrant, RequestError> {
    if resp.body.is_empty() {
        return Err(RequestError::EmptyBody {
            status: resp.status,
        });
    }
    let value: serde_json::Value = serde_json::from_slice(&resp.body)
        .map_err(|err| RequestError::MalformedResponse(format!("token response: {}", err)))?;
    if value.get("error").is_some() {
        let err: TokenError = serde_json::from_value(value).map_err(|err| {
            RequestError::MalformedResponse(format!("token error response: {}", err))
        })?;
        return Err(RequestError::Api {
            code: err.to_string(),
        });
    }
    let grant: TokenGrant = serde_json::from_value(value)
        .map_err(|err| RequestError::MalformedResponse(format!("token response: {}", err)))?;
    if grant.access_token.trim().is_empty() {
        return Err(RequestError::MalformedResponse(
            "token response missing access_token".into(),
        ));
    }
    Ok(grant)
}

/// A browser sign-in in progress: the URL to open and a loopback listener
/// waiting for the redirect.
pub struct AuthorizationRequest {
    pub browser_url: String,
    pub verifier: String,
    rx: Receiver<Result<String>>,
    shutdown: Sender<()>,
}

impl Drop for AuthorizationRequest {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

impl AuthorizationRequest {
    pub fn wait_for_code(&self, timeout: Duration) -> Result<String> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(err) => Err(anyhow!("auth: no redirect received: {}", err)),
        }
    }
}

pub fn begin(endpoint: &TokenEndpoint) -> Result<AuthorizationRequest> {
    let cfg = endpoint.config();
    if cfg.client_id.trim().is_empty() {
        bail!("auth: client id is required");
    }
    let verifier = random_string(64);
    let challenge = code_challenge(&verifier);
    let state = random_string(32);

    let redirect = Url::parse(&cfg.redirect_uri)?;
    let host = redirect.host_str().unwrap_or("127.0.0.1");
    let port = redirect.port().unwrap_or(0);
    let listen_addr = format!("{}:{}", host, port);
    let server = Server::http(&listen_addr).map_err(|err| anyhow!("auth: listen: {}", err))?;

    let browser_url = endpoint.authorize_url(&state, &challenge)?;

    let (result_tx, result_rx) = bounded::<Result<String>>(1);
    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

    thread::spawn(move || {
        for request in server.incoming_requests() {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }
            let outcome = handle_redirect(request, &state);
            let _ = result_tx.send(outcome);
            break;
        }
    });

    Ok(AuthorizationRequest {
        browser_url,
        verifier,
        rx: result_rx,
        shutdown: shutdown_tx,
    })
}

fn handle_redirect(req: tiny_http::Request, state: &str) -> Result<String> {
    let url = Url::parse(&format!("http://loopback{}", req.url()))?;
    let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
    match extract_code(&params, state) {
        Ok(code) => {
            let response = Response::from_string(HTML_SUCCESS.clone());
            let response = match Header::from_bytes(
                &b"Content-Type"[..],
                &b"text/html; charset=utf-8"[..],
            ) {
                Ok(header) => response.with_header(header),
                Err(_) => response,
            };
            let _ = req.respond(response);
            Ok(code)
        }
        Err(err) => {
            let _ = req.respond(Response::from_string(err.to_string()).with_status_code(400));
            Err(err)
        }
    }
}

fn extract_code(params: &HashMap<String, String>, state: &str) -> Result<String> {
    if params.get("state").map(String::as_str) != Some(state) {
        bail!("authorization state mismatch");
    }
    if let Some(error) = params.get("error") {
        bail!("authorization error: {}", error);
    }
    match params.get("code") {
        Some(code) if !code.is_empty() => Ok(code.clone()),
        _ => bail!("authorization code missing"),
    }
}

fn random_string(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}
