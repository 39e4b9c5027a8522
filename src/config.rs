use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth;
use crate::credential::{Origins, ANONYMOUS_ORIGIN, OAUTH_ORIGIN};
use crate::transport::DEFAULT_TIMEOUT;

const DEFAULT_ENV_PREFIX: &str = "SNOOLINK";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub reddit: RedditConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedditConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_api_origin")]
    pub api_origin: String,
    #[serde(default = "default_oauth_origin")]
    pub oauth_origin: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
}

impl Default for RedditConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            user_agent: default_user_agent(),
            scopes: default_scopes(),
            redirect_uri: default_redirect_uri(),
            api_origin: default_api_origin(),
            oauth_origin: default_oauth_origin(),
            token_url: default_token_url(),
            authorize_url: default_authorize_url(),
        }
    }
}

impl RedditConfig {
    pub fn origins(&self) -> Origins {
        Origins {
            anonymous: self.api_origin.clone(),
            oauth: self.oauth_origin.clone(),
        }
    }

    pub fn auth_config(&self) -> auth::Config {
        auth::Config {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            scope: self.scopes.clone(),
            auth_url: self.authorize_url.clone(),
            token_url: self.token_url.clone(),
            redirect_uri: self.redirect_uri.clone(),
        }
    }
}

fn default_user_agent() -> String {
    format!("snoolink/{} (by snoolink developers)", crate::VERSION)
}

fn default_scopes() -> Vec<String> {
    auth::Config::default().scope
}

fn default_redirect_uri() -> String {
    auth::Config::default().redirect_uri
}

fn default_api_origin() -> String {
    ANONYMOUS_ORIGIN.into()
}

fn default_oauth_origin() -> String {
    OAUTH_ORIGIN.into()
}

fn default_token_url() -> String {
    auth::TOKEN_URL.into()
}

fn default_authorize_url() -> String {
    auth::AUTHORIZE_URL.into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpConfig {
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
        }
    }
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".into()
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    cfg = apply_env(cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    let reddit = other.reddit;
    for (target, value) in [
        (&mut base.reddit.client_id, reddit.client_id),
        (&mut base.reddit.client_secret, reddit.client_secret),
        (&mut base.reddit.user_agent, reddit.user_agent),
        (&mut base.reddit.redirect_uri, reddit.redirect_uri),
        (&mut base.reddit.api_origin, reddit.api_origin),
        (&mut base.reddit.oauth_origin, reddit.oauth_origin),
        (&mut base.reddit.token_url, reddit.token_url),
        (&mut base.reddit.authorize_url, reddit.authorize_url),
    ] {
        if !value.is_empty() {
            *target = value;
        }
    }
    if !reddit.scopes.is_empty() {
        base.reddit.scopes = reddit.scopes;
    }

    if !other.http.timeout.is_zero() {
        base.http.timeout = other.http.timeout;
    }
    if other.storage.data_dir.is_some() {
        base.storage.data_dir = other.storage.data_dir;
    }
    if !other.log.level.is_empty() {
        base.log.level = other.log.level;
    }

    base
}

/// Environment values override whatever the file set. Unknown keys and
/// unparsable values are ignored.
fn apply_env(mut cfg: Config, prefix: &str) -> Config {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(&mut cfg, &key, value);
    }
    cfg
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "reddit.client_id" => cfg.reddit.client_id = value,
        "reddit.client_secret" => cfg.reddit.client_secret = value,
        "reddit.user_agent" => cfg.reddit.user_agent = value,
        "reddit.redirect_uri" => cfg.reddit.redirect_uri = value,
        "reddit.api_origin" => cfg.reddit.api_origin = value,
        "reddit.oauth_origin" => cfg.reddit.oauth_origin = value,
        "reddit.token_url" => cfg.reddit.token_url = value,
        "reddit.authorize_url" => cfg.reddit.authorize_url = value,
        "reddit.scopes" => {
            cfg.reddit.scopes = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        "http.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.http.timeout = duration;
            }
        }
        "storage.data_dir" => cfg.storage.data_dir = Some(PathBuf::from(value)),
        "log.level" => cfg.log.level = value,
        "debug" => {
            if matches!(value.as_str(), "1" | "true" | "TRUE" | "True") {
                cfg.log.level = "debug".into();
            }
        }
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("snoolink").join("config.yaml"))
}

/// Stores the registered application's client id (and user agent) so
/// sign-in works on the next run.
pub fn save_client_id(
    path: Option<PathBuf>,
    client_id: &str,
    user_agent: &str,
) -> Result<PathBuf> {
    let client_id = client_id.trim();
    let user_agent = user_agent.trim();

    anyhow::ensure!(
        !client_id.is_empty(),
        "config: reddit.client_id is required"
    );

    let path = if let Some(path) = path {
        path
    } else {
        default_config_path().context("config: unable to determine default config path")?
    };

    let mut cfg = if path.exists() {
        read_config_file(&path)?
    } else {
        Config::default()
    };

    cfg.reddit.client_id = client_id.to_string();
    if !user_agent.is_empty() {
        cfg.reddit.user_agent = user_agent.to_string();
    }
    if cfg.reddit.scopes.is_empty() {
        cfg.reddit.scopes = default_scopes();
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: failed to create directory {}", parent.display()))?;
    }

    let contents = serde_yaml::to_string(&cfg).context("config: failed to serialize config")?;
    fs::write(&path, contents)
        .with_context(|| format!("config: failed to write file {}", path.display()))?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::tempdir;

    fn isolated() -> LoadOptions {
        LoadOptions {
            config_file: Some(PathBuf::from("/nonexistent/snoolink/config.yaml")),
            env_prefix: Some("SNOOLINK_UNSET_TEST".into()),
        }
    }

    #[test]
    fn load_defaults_without_files() {
        let cfg = load(isolated()).unwrap();
        assert_eq!(cfg.reddit.redirect_uri, default_redirect_uri());
        assert_eq!(cfg.reddit.oauth_origin, "https://oauth.reddit.com");
        assert_eq!(cfg.http.timeout, Duration::from_secs(20));
        assert_eq!(cfg.log.level, "warn");
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "reddit:\n  client_id: abc\n  api_origin: http://localhost:9000\nhttp:\n  timeout: 5s\n",
        )
        .unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("SNOOLINK_UNSET_TEST".into()),
        })
        .unwrap();
        assert_eq!(cfg.reddit.client_id, "abc");
        assert_eq!(cfg.reddit.origins().anonymous, "http://localhost:9000");
        assert_eq!(cfg.reddit.token_url, auth::TOKEN_URL);
        assert_eq!(cfg.http.timeout, Duration::from_secs(5));
    }

    #[test]
    fn save_client_id_creates_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        save_client_id(Some(path.clone()), " client ", "agent/1.0").unwrap();
        let saved = read_config_file(&path).unwrap();
        assert_eq!(saved.reddit.client_id, "client");
        assert_eq!(saved.reddit.user_agent, "agent/1.0");

        assert!(save_client_id(Some(path), "  ", "").is_err());
    }

    #[test]
    fn env_overrides() {
        env::set_var("SNOOLINK_ENVTEST_HTTP__TIMEOUT", "2s");
        env::set_var("SNOOLINK_ENVTEST_REDDIT__SCOPES", "read, identity");
        env::set_var("SNOOLINK_ENVTEST_DEBUG", "1");
        let cfg = load(LoadOptions {
            config_file: Some(PathBuf::from("/nonexistent/config.yaml")),
            env_prefix: Some("SNOOLINK_ENVTEST".into()),
        })
        .unwrap();
        assert_eq!(cfg.http.timeout, Duration::from_secs(2));
        assert_eq!(cfg.reddit.scopes, vec!["read", "identity"]);
        assert_eq!(cfg.log.level, "debug");
        env::remove_var("SNOOLINK_ENVTEST_HTTP__TIMEOUT");
        env::remove_var("SNOOLINK_ENVTEST_REDDIT__SCOPES");
        env::remove_var("SNOOLINK_ENVTEST_DEBUG");
    }
}
