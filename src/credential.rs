use std::time::{Duration, SystemTime};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::auth::TokenGrant;

pub const ANONYMOUS_ORIGIN: &str = "https://api.reddit.com";
pub const OAUTH_ORIGIN: &str = "https://oauth.reddit.com";
pub const ANONYMOUS_NAME: &str = "Anonymous";

const LOADING_NAME: &str = "**loading username**";

/// Hosts a request may be sent to, picked per credential kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origins {
    pub anonymous: String,
    pub oauth: String,
}

impl Default for Origins {
    fn default() -> Self {
        Self {
            anonymous: ANONYMOUS_ORIGIN.to_string(),
            oauth: OAUTH_ORIGIN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Anonymous,
    OAuth,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Credential {
    Anonymous,
    OAuth(OAuthCredential),
}

/// A bearer credential as persisted in the identity file.
///
/// Field names follow the token endpoint's response so a fresh grant can be
/// written out without translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthCredential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default, rename = "username", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, rename = "time")]
    pub issued_utc: f64,
}

fn default_token_type() -> String {
    "bearer".into()
}

impl OAuthCredential {
    pub fn from_grant(grant: TokenGrant) -> Result<Self> {
        if grant.access_token.trim().is_empty() {
            bail!("credential: access token is required");
        }
        Ok(Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.filter(|t| !t.is_empty()),
            token_type: grant.token_type.unwrap_or_else(default_token_type),
            scope: grant.scope,
            expires_in: grant.expires_in,
            display_name: None,
            issued_utc: now_utc_secs(),
        })
    }

    /// Folds a refresh response into this credential.
    ///
    /// The server does not always resend the refresh token, so an absent one
    /// keeps the current value.
    pub fn apply_refresh(&mut self, grant: TokenGrant) -> Result<()> {
        if grant.access_token.trim().is_empty() {
            bail!("credential: refresh response missing access token");
        }
        self.access_token = grant.access_token;
        if let Some(refresh) = grant.refresh_token.filter(|t| !t.is_empty()) {
            self.refresh_token = Some(refresh);
        }
        if let Some(kind) = grant.token_type {
            self.token_type = kind;
        }
        if !grant.scope.is_empty() {
            self.scope = grant.scope;
        }
        self.expires_in = grant.expires_in;
        self.issued_utc = now_utc_secs();
        Ok(())
    }

    pub fn issued_at(&self) -> Option<SystemTime> {
        if self.issued_utc <= 0.0 {
            return None;
        }
        let since_epoch = Duration::try_from_secs_f64(self.issued_utc).ok()?;
        SystemTime::UNIX_EPOCH.checked_add(since_epoch)
    }

    pub fn is_valid(&self) -> bool {
        !self.access_token.trim().is_empty()
    }
}

impl Credential {
    pub fn kind(&self) -> CredentialKind {
        match self {
            Credential::Anonymous => CredentialKind::Anonymous,
            Credential::OAuth(_) => CredentialKind::OAuth,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credential::Anonymous)
    }

    pub fn origin<'a>(&self, origins: &'a Origins) -> &'a str {
        match self {
            Credential::Anonymous => &origins.anonymous,
            Credential::OAuth(_) => &origins.oauth,
        }
    }

    /// Puts the host for this credential in front of `path`.
    pub fn wrap_path(&self, origins: &Origins, path: &str) -> String {
        format!("{}{}", self.origin(origins).trim_end_matches('/'), path)
    }

    /// Value for the `Authorization` header, if this credential presents one.
    pub fn authorization(&self) -> Option<String> {
        match self {
            Credential::Anonymous => None,
            Credential::OAuth(token) => Some(format!("bearer {}", token.access_token)),
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            Credential::Anonymous => ANONYMOUS_NAME,
            Credential::OAuth(token) => token.display_name.as_deref().unwrap_or(LOADING_NAME),
        }
    }

    pub fn refresh_token(&self) -> Option<&str> {
        match self {
            Credential::Anonymous => None,
            Credential::OAuth(token) => token.refresh_token.as_deref(),
        }
    }
}

fn now_utc_secs() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
