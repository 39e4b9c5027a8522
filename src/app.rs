use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::api::{self, Api, ApiConfig, Request};
use crate::auth::{self, TokenEndpoint};
use crate::config;
use crate::identity::{IdentityController, IDENTITY_FILE};
use crate::storage;
use crate::transport::{HttpTransport, TransportConfig};

const SIGN_IN_TIMEOUT: Duration = Duration::from_secs(300);

pub const USAGE: &str = "snoolink: authenticated reddit requests from the terminal.

Usage: snoolink <command> [args]

Commands:
  login                Sign in through the browser and make the account active
  accounts             List signed-in accounts
  switch <id|anon>     Make an account (or anonymous) active
  logout <id>          Forget an account
  get <path>           GET an API path as the active account and print the JSON
  subs                 List the active account's subscriptions
  read <fullname>      Mark a message read, locally and on reddit

  --version, -V        Show version and exit
  --help,    -h        Show this help message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login,
    Accounts,
    Switch(Option<String>),
    Logout(String),
    Get(String),
    Subs,
    Read(String),
}

impl Command {
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut iter = args.iter().map(String::as_str);
        let name = iter.next().ok_or_else(|| anyhow!("missing command\n\n{}", USAGE))?;
        let mut arg = |what: &str| {
            iter.next()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("{} requires <{}>", name, what))
        };
        let command = match name {
            "login" => Command::Login,
            "accounts" => Command::Accounts,
            "switch" => {
                let id = arg("id")?;
                if matches!(id.as_str(), "anon" | "anonymous") {
                    Command::Switch(None)
                } else {
                    Command::Switch(Some(id))
                }
            }
            "logout" => Command::Logout(arg("id")?),
            "get" => Command::Get(arg("path")?),
            "subs" => Command::Subs,
            "read" => Command::Read(arg("fullname")?),
            other => bail!("unknown command {:?}\n\n{}", other, USAGE),
        };
        Ok(command)
    }
}

pub fn run(args: Vec<String>) -> Result<()> {
    let command = Command::parse(&args)?;
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    init_tracing(&cfg.log.level);

    let session = Session::open(&cfg)?;
    match command {
        Command::Login => session.login(),
        Command::Accounts => {
            session.print_accounts();
            Ok(())
        }
        Command::Switch(id) => session.switch(id.as_deref()),
        Command::Logout(id) => {
            if !session.api.identity().remove_account(&id) {
                bail!("no account with id {}", id);
            }
            println!("Removed {}", id);
            Ok(())
        }
        Command::Get(path) => session.get(&path),
        Command::Subs => session.subs(),
        Command::Read(name) => session.read(&name),
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Everything one CLI invocation needs: the dispatcher bound to the stored
/// identities, and the local state database.
struct Session {
    api: Rc<Api>,
    store: storage::Store,
    timeout: Duration,
    failures: Rc<RefCell<Vec<String>>>,
}

impl Session {
    fn open(cfg: &config::Config) -> Result<Self> {
        let dir = storage::data_dir(cfg.storage.data_dir.as_deref())
            .context("unable to determine data directory")?;
        let store = storage::Store::open(storage::Options {
            path: Some(dir.join(storage::STATE_FILE)),
        })
        .context("open storage")?;

        let endpoint = TokenEndpoint::new(cfg.reddit.auth_config());
        let identity = Rc::new(IdentityController::open(dir.join(IDENTITY_FILE), endpoint));
        let transport = HttpTransport::new(TransportConfig {
            user_agent: cfg.reddit.user_agent.clone(),
            timeout: Some(cfg.http.timeout),
            http_client: None,
        })?;
        let api = Api::new(
            identity,
            Arc::new(transport),
            ApiConfig {
                origins: cfg.reddit.origins(),
            },
        );

        let failures = Rc::new(RefCell::new(Vec::new()));
        let sink = failures.clone();
        api.request_failed.connect(move |failed| {
            sink.borrow_mut()
                .push(format!("{} {}: {}", failed.request.method, failed.request.path, failed.message()));
        });

        Ok(Self {
            api,
            store,
            // Room for a token refresh and the replay on top of one request.
            timeout: cfg.http.timeout * 3,
            failures,
        })
    }

    /// Runs the dispatch loop and turns any surfaced failure into an error.
    fn wait(&self) -> Result<()> {
        if !self.api.run_until_idle(self.timeout) {
            bail!("timed out waiting for reddit");
        }
        let failures = self.failures.borrow();
        if failures.is_empty() {
            Ok(())
        } else {
            bail!(failures.join("\n"))
        }
    }

    fn login(&self) -> Result<()> {
        let pending = auth::begin(self.api.identity().endpoint())?;
        println!("Opening your browser to authorize snoolink:\n{}", pending.browser_url);
        if let Err(err) = webbrowser::open(&pending.browser_url) {
            eprintln!("Could not open a browser ({}); open the URL above manually.", err);
        }
        let code = pending.wait_for_code(SIGN_IN_TIMEOUT)?;

        let signed_in: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
        let sink = signed_in.clone();
        self.api.identity().add_from_authorization_code(
            &self.api,
            &code,
            Some(&pending.verifier),
            Box::new(move |api, result| match result {
                Ok(id) => *sink.borrow_mut() = Some(id),
                Err(err) => api.fail(Request::post("/api/v1/access_token", Vec::new()), err),
            }),
        );
        self.wait()?;

        let id = signed_in
            .borrow()
            .clone()
            .ok_or_else(|| anyhow!("sign in did not complete"))?;
        println!("Signed in as {} ({})", self.api.user_name(), id);
        Ok(())
    }

    fn print_accounts(&self) {
        let accounts = self.api.identity().accounts();
        if accounts.is_empty() {
            println!("No accounts. Run `snoolink login` to add one.");
            return;
        }
        for account in accounts {
            let marker = if account.active { "*" } else { " " };
            println!("{} {}  {}", marker, account.id, account.display_name);
        }
    }

    fn switch(&self, id: Option<&str>) -> Result<()> {
        if !self.api.identity().switch_active(&self.api, id) {
            bail!("no account with id {}", id.unwrap_or_default());
        }
        self.wait()?;
        println!("Active: {}", self.api.user_name());
        Ok(())
    }

    fn get(&self, path: &str) -> Result<()> {
        let body: Rc<RefCell<Option<serde_json::Value>>> = Rc::new(RefCell::new(None));
        let sink = body.clone();
        self.api
            .get_list(path, move |_, json| *sink.borrow_mut() = Some(json));
        self.wait()?;

        let body = body.borrow();
        let json = body.as_ref().ok_or_else(|| anyhow!("no response for {}", path))?;
        println!("{}", serde_json::to_string_pretty(json)?);
        Ok(())
    }

    fn subs(&self) -> Result<()> {
        if !self.api.identity().active_credential().is_anonymous() {
            self.api.collect_subscriptions();
            self.wait()?;
        }
        for sub in self.api.display_subs() {
            let tag = if api::is_special_sub(&sub) { " (special)" } else { "" };
            println!("{}{}", sub, tag);
        }
        Ok(())
    }

    fn read(&self, name: &str) -> Result<()> {
        if self.store.is_read(name)? {
            println!("{} already marked read", name);
            return Ok(());
        }
        self.api.read_message(name);
        self.wait()?;
        self.store.mark_read(name)?;
        println!("Marked {} read", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_commands() {
        assert_eq!(Command::parse(&args(&["login"])).unwrap(), Command::Login);
        assert_eq!(
            Command::parse(&args(&["switch", "anon"])).unwrap(),
            Command::Switch(None)
        );
        assert_eq!(
            Command::parse(&args(&["switch", "abc"])).unwrap(),
            Command::Switch(Some("abc".into()))
        );
        assert_eq!(
            Command::parse(&args(&["get", "/r/rust/about"])).unwrap(),
            Command::Get("/r/rust/about".into())
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(Command::parse(&[]).is_err());
        assert!(Command::parse(&args(&["logout"])).is_err());
        let err = Command::parse(&args(&["frobnicate"])).unwrap_err();
        assert!(err.to_string().contains("unknown command"));
    }
}
