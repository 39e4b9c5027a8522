use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::RngCore;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::Api;
use crate::auth::{self, TokenEndpoint};
use crate::credential::{Credential, OAuthCredential};
use crate::error::{PersistenceError, RequestError};
use crate::signal::Signal;
use crate::transport::{HttpResponse, TransportError};

pub const IDENTITY_FILE: &str = "identity";

pub type RefreshDone = Box<dyn FnOnce(&Api, Result<(), RequestError>)>;
pub type SignInDone = Box<dyn FnOnce(&Api, Result<String, RequestError>)>;

/// On-disk shape of the identity file.
#[derive(Debug, Default, Serialize)]
struct IdentityFile {
    tokens: BTreeMap<String, OAuthCredential>,
    active: Option<String>,
}

/// The identity file as read back. Accounts are decoded one by one so a
/// damaged entry only loses itself.
#[derive(Debug, Deserialize)]
struct RawIdentityFile {
    #[serde(default)]
    tokens: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    active: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSummary {
    pub id: String,
    pub display_name: String,
    pub active: bool,
}

/// Every signed-in account plus which one requests go out as.
///
/// `active` always names a key of `tokens`; `None` means anonymous.
pub struct IdentityController {
    path: PathBuf,
    endpoint: TokenEndpoint,
    state: RefCell<IdentityFile>,
    /// Fired once per change of who the active credential presents as:
    /// load, switch, sign-in and removal. Token refreshes do not fire it.
    pub token_changed: Signal<()>,
}

impl IdentityController {
    /// Opens the store, treating an unreadable or malformed file as empty.
    pub fn open(path: PathBuf, endpoint: TokenEndpoint) -> Self {
        let controller = Self::empty(path, endpoint);
        if let Err(err) = controller.load() {
            warn!(error = %err, "identity: starting without saved accounts");
        }
        controller
    }

    pub fn empty(path: PathBuf, endpoint: TokenEndpoint) -> Self {
        Self {
            path,
            endpoint,
            state: RefCell::new(IdentityFile::default()),
            token_changed: Signal::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn endpoint(&self) -> &TokenEndpoint {
        &self.endpoint
    }

    /// Replaces in-memory state with the file's contents.
    ///
    /// A missing file is an empty store. On a malformed file the in-memory
    /// state is reset to anonymous before the error is returned.
    pub fn load(&self) -> Result<(), PersistenceError> {
        let loaded = read_identity_file(&self.path);
        let outcome = match loaded {
            Ok(file) => {
                *self.state.borrow_mut() = file;
                Ok(())
            }
            Err(err) => {
                *self.state.borrow_mut() = IdentityFile::default();
                Err(err)
            }
        };
        self.token_changed.emit(&());
        outcome
    }

    pub fn save(&self) -> Result<(), PersistenceError> {
        let contents = {
            let state = self.state.borrow();
            serde_json::to_string(&*state).map_err(|err| PersistenceError::Write {
                path: self.path.clone(),
                source: err.into(),
            })?
        };
        write_atomic(&self.path, contents.as_bytes())
    }

    fn save_or_warn(&self) {
        if let Err(err) = self.save() {
            warn!(error = %err, "identity: failed to persist accounts");
        }
    }

    pub fn active_id(&self) -> Option<String> {
        self.state.borrow().active.clone()
    }

    pub fn active_credential(&self) -> Credential {
        let state = self.state.borrow();
        state
            .active
            .as_ref()
            .and_then(|id| state.tokens.get(id))
            .map(|token| Credential::OAuth(token.clone()))
            .unwrap_or(Credential::Anonymous)
    }

    pub fn accounts(&self) -> Vec<AccountSummary> {
        let state = self.state.borrow();
        state
            .tokens
            .iter()
            .map(|(id, token)| AccountSummary {
                id: id.clone(),
                display_name: Credential::OAuth(token.clone()).display_name().to_string(),
                active: state.active.as_deref() == Some(id.as_str()),
            })
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.borrow().tokens.contains_key(id)
    }

    /// Makes `id` (or anonymous for `None`) the active credential.
    ///
    /// Switching to an account refreshes its token first; `token_changed`
    /// fires when that refresh completes. Returns `false` for an unknown id.
    pub fn switch_active(&self, api: &Api, id: Option<&str>) -> bool {
        if self.state.borrow().active.as_deref() == id {
            return true;
        }
        if let Some(id) = id {
            if !self.contains(id) {
                return false;
            }
        }

        self.state.borrow_mut().active = id.map(str::to_string);
        self.save_or_warn();
        match id {
            Some(id) => {
                debug!(account = id, "identity: switching account");
                self.refresh_entry(
                    api,
                    id.to_string(),
                    Box::new(|api, result| {
                        if let Err(err) = result {
                            warn!(error = %err, "identity: refresh after switch failed");
                        }
                        api.identity().token_changed.emit(&());
                    }),
                );
            }
            None => self.token_changed.emit(&()),
        }
        true
    }

    /// Deletes an account, falling back to anonymous if it was active.
    pub fn remove_account(&self, id: &str) -> bool {
        {
            let mut state = self.state.borrow_mut();
            if state.tokens.remove(id).is_none() {
                return false;
            }
            if state.active.as_deref() == Some(id) {
                state.active = None;
            }
        }
        self.save_or_warn();
        self.token_changed.emit(&());
        true
    }

    /// Exchanges an authorization code for a token and makes the new account
    /// active. `done` receives the new account id.
    pub fn add_from_authorization_code(
        &self,
        api: &Api,
        code: &str,
        verifier: Option<&str>,
        done: SignInDone,
    ) {
        let request = self.endpoint.code_request(code, verifier);
        api.send_raw(
            request,
            Box::new(move |api, result| {
                let outcome = api.identity().finish_sign_in(result);
                if let Err(err) = &outcome {
                    warn!(error = %err, "identity: sign in failed");
                }
                done(api, outcome);
            }),
        );
    }

    fn finish_sign_in(
        &self,
        result: Result<HttpResponse, TransportError>,
    ) -> Result<String, RequestError> {
        let grant = self.grant_from(result)?;
        let token = OAuthCredential::from_grant(grant)
            .map_err(|err| RequestError::MalformedResponse(err.to_string()))?;
        let id = new_account_id();
        {
            let mut state = self.state.borrow_mut();
            state.tokens.insert(id.clone(), token);
            state.active = Some(id.clone());
        }
        self.save_or_warn();
        self.token_changed.emit(&());
        Ok(id)
    }

    /// Refreshes the active credential. Anonymous completes immediately.
    pub fn refresh_active(&self, api: &Api, done: RefreshDone) {
        match self.active_id() {
            Some(id) => self.refresh_entry(api, id, done),
            None => done(api, Ok(())),
        }
    }

    fn refresh_entry(&self, api: &Api, id: String, done: RefreshDone) {
        let refresh_token = self
            .state
            .borrow()
            .tokens
            .get(&id)
            .and_then(|token| token.refresh_token.clone());
        let Some(refresh_token) = refresh_token else {
            done(
                api,
                Err(RequestError::AuthExpired(format!(
                    "account {} has no refresh token",
                    id
                ))),
            );
            return;
        };

        let request = self.endpoint.refresh_request(&refresh_token);
        api.send_raw(
            request,
            Box::new(move |api, result| {
                let outcome = api.identity().finish_refresh(&id, result);
                done(api, outcome);
            }),
        );
    }

    fn finish_refresh(
        &self,
        id: &str,
        result: Result<HttpResponse, TransportError>,
    ) -> Result<(), RequestError> {
        let grant = self.grant_from(result)?;
        {
            let mut state = self.state.borrow_mut();
            let Some(token) = state.tokens.get_mut(id) else {
                debug!(account = id, "identity: refreshed account was removed");
                return Ok(());
            };
            token
                .apply_refresh(grant)
                .map_err(|err| RequestError::MalformedResponse(err.to_string()))?;
        }
        self.save_or_warn();
        debug!(account = id, "identity: token refreshed");
        Ok(())
    }

    fn grant_from(
        &self,
        result: Result<HttpResponse, TransportError>,
    ) -> Result<auth::TokenGrant, RequestError> {
        let resp = result.map_err(|err| {
            RequestError::Transport(err.describe(&Method::POST, &self.endpoint.config().token_url))
        })?;
        auth::parse_grant(&resp)
    }

    /// Records the display name reported by `/api/v1/me`.
    pub fn set_display_name(&self, id: &str, name: &str) {
        {
            let mut state = self.state.borrow_mut();
            let Some(token) = state.tokens.get_mut(id) else {
                return;
            };
            token.display_name = Some(name.to_string());
        }
        self.save_or_warn();
    }
}

fn read_identity_file(path: &Path) -> Result<IdentityFile, PersistenceError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(IdentityFile::default())
        }
        Err(err) => {
            return Err(PersistenceError::Read {
                path: path.to_path_buf(),
                source: err,
            })
        }
    };
    let raw: RawIdentityFile =
        serde_json::from_str(&data).map_err(|err| PersistenceError::Malformed {
            path: path.to_path_buf(),
            source: err,
        })?;

    let mut file = IdentityFile {
        tokens: BTreeMap::new(),
        active: raw.active,
    };
    for (id, entry) in raw.tokens {
        match serde_json::from_value::<OAuthCredential>(entry) {
            Ok(token) if token.is_valid() => {
                file.tokens.insert(id, token);
            }
            Ok(_) => warn!(account = %id, "identity: dropping account without access token"),
            Err(err) => warn!(account = %id, error = %err, "identity: dropping unreadable account"),
        }
    }
    if let Some(active) = &file.active {
        if !file.tokens.contains_key(active) {
            warn!(account = %active, "identity: active account missing, using anonymous");
            file.active = None;
        }
    }
    Ok(file)
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PersistenceError> {
    let to_err = |source: std::io::Error| PersistenceError::Write {
        path: path.to_path_buf(),
        source,
    };
    let parent = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(to_err)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(to_err)?;
    temp.write_all(contents).map_err(to_err)?;
    temp.persist(path).map_err(|err| to_err(err.error))?;
    Ok(())
}

fn new_account_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
