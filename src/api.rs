use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::comments::{self, Thing};
use crate::credential::Origins;
use crate::error::RequestError;
use crate::identity::IdentityController;
use crate::signal::Signal;
use crate::transport::{HttpRequest, HttpResponse, Transport, TransportError};

pub const PREPEND_SUBS: [&str; 2] = ["/r/all", "/inbox"];
pub const DEFAULT_SUBS: [&str; 2] = ["/r/gnome", "/r/gnu+linux"];
pub const SUBSCRIPTIONS_PATH: &str = "/subreddits/mine/subscriber?limit=100";

const SPECIAL_SUBS: [&str; 11] = [
    "/message/inbox",
    "/message/unread",
    "/message/sent",
    "/user/USER/overview",
    "/user/USER/submitted",
    "/user/USER/commented",
    "/user/USER/upvoted",
    "/user/USER/downvoted",
    "/user/USER/hidden",
    "/user/USER/saved",
    "/user/USER/gilded",
];

static SPECIAL_SUB_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    SPECIAL_SUBS
        .iter()
        .filter_map(|sub| Regex::new(&format!("^{}", sub.replace("USER", ".+"))).ok())
        .collect()
});

/// Inbox and per-user listings, which are not subreddits.
pub fn is_special_sub(sub: &str) -> bool {
    SPECIAL_SUBS.contains(&sub) || SPECIAL_SUB_PATTERNS.iter().any(|re| re.is_match(sub))
}

pub type JsonCallback = Rc<dyn Fn(&Api, Value)>;
pub type UserDataCallback = Rc<dyn Fn(&Api, Value, Value)>;
pub type RawCallback = Box<dyn FnOnce(&Api, Result<HttpResponse, TransportError>)>;

/// What to call with the decoded body. A request either passes user data or
/// it does not; the variant decides which callback shape is used.
#[derive(Clone)]
pub enum OnSuccess {
    Json(JsonCallback),
    WithUserData(UserDataCallback, Value),
}

/// A logical API call, as handed to `send` and as carried by the
/// `request_failed` signal so it can be resent verbatim.
#[derive(Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub form: Option<Vec<(String, String)>>,
    pub handle_errors: bool,
    pub on_success: Option<OnSuccess>,
}

impl Request {
    pub fn new(method: Method, path: &str) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Self {
            method,
            path,
            form: None,
            handle_errors: true,
            on_success: None,
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: &str, form: Vec<(String, String)>) -> Self {
        Self::new(Method::POST, path).form(form)
    }

    pub fn form(mut self, form: Vec<(String, String)>) -> Self {
        self.form = Some(form);
        self
    }

    pub fn handle_errors(mut self, handle: bool) -> Self {
        self.handle_errors = handle;
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Api, Value) + 'static,
    {
        self.on_success = Some(OnSuccess::Json(Rc::new(callback)));
        self
    }

    pub fn on_success_with<F>(mut self, user_data: Value, callback: F) -> Self
    where
        F: Fn(&Api, Value, Value) + 'static,
    {
        self.on_success = Some(OnSuccess::WithUserData(Rc::new(callback), user_data));
        self
    }

    pub fn user_data(&self) -> Option<&Value> {
        match &self.on_success {
            Some(OnSuccess::WithUserData(_, data)) => Some(data),
            _ => None,
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("form", &self.form)
            .field("handle_errors", &self.handle_errors)
            .field("has_callback", &self.on_success.is_some())
            .field("user_data", &self.user_data())
            .finish()
    }
}

/// Payload of `request_failed`.
#[derive(Debug, Clone)]
pub struct FailedRequest {
    pub request: Request,
    pub error: RequestError,
}

impl FailedRequest {
    pub fn message(&self) -> String {
        self.error.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(u64);

#[derive(Debug, Clone, Default)]
pub struct ApiConfig {
    pub origins: Origins,
}

struct InFlight {
    request: Request,
    ticket: Option<u64>,
    /// Absolute URL the current attempt went to.
    url: String,
    replayed: bool,
}

enum Ticket {
    Api(RequestHandle),
    Raw(RawCallback),
}

#[derive(Default)]
struct DispatchState {
    next_handle: u64,
    next_ticket: u64,
    requests: HashMap<RequestHandle, InFlight>,
    tickets: HashMap<u64, Ticket>,
}

type CompletionMsg = (u64, Result<HttpResponse, TransportError>);

#[derive(Deserialize)]
struct Me {
    name: String,
}

#[derive(Deserialize)]
struct SubscriptionPage {
    data: SubscriptionPageData,
}

#[derive(Deserialize)]
struct SubscriptionPageData {
    children: Vec<SubscriptionThing>,
    #[serde(default)]
    after: Option<String>,
}

#[derive(Deserialize)]
struct SubscriptionThing {
    data: SubscriptionData,
}

#[derive(Deserialize)]
struct SubscriptionData {
    url: String,
}

/// Dispatches API requests for the active credential.
///
/// Lives on the dispatch thread. Transport completions queue up on a channel
/// and are only acted on from `pump`/`run_until_idle`, so every callback and
/// signal runs on that thread.
pub struct Api {
    identity: Rc<IdentityController>,
    transport: Arc<dyn Transport>,
    origins: Origins,
    state: RefCell<DispatchState>,
    completions_tx: Sender<CompletionMsg>,
    completions_rx: Receiver<CompletionMsg>,
    user_subs: RefCell<Vec<String>>,
    lower_user_subs: RefCell<Vec<String>>,
    collecting: Cell<bool>,
    responding: RefCell<Option<Request>>,
    pub request_failed: Signal<FailedRequest>,
    pub subs_changed: Signal<()>,
    pub user_changed: Signal<()>,
}

impl Api {
    /// Builds the dispatcher and follows the identity controller: every
    /// `token_changed` reloads the user name and subscriptions.
    pub fn new(
        identity: Rc<IdentityController>,
        transport: Arc<dyn Transport>,
        config: ApiConfig,
    ) -> Rc<Self> {
        let (completions_tx, completions_rx) = unbounded();
        let api = Rc::new(Self {
            identity,
            transport,
            origins: config.origins,
            state: RefCell::new(DispatchState::default()),
            completions_tx,
            completions_rx,
            user_subs: RefCell::new(Vec::new()),
            lower_user_subs: RefCell::new(Vec::new()),
            collecting: Cell::new(false),
            responding: RefCell::new(None),
            request_failed: Signal::new(),
            subs_changed: Signal::new(),
            user_changed: Signal::new(),
        });
        api.set_user_subs(DEFAULT_SUBS.iter().map(|s| s.to_string()).collect());

        let weak: Weak<Api> = Rc::downgrade(&api);
        api.identity.token_changed.connect(move |_| {
            if let Some(api) = weak.upgrade() {
                api.token_changed();
            }
        });
        api
    }

    pub fn identity(&self) -> &Rc<IdentityController> {
        &self.identity
    }

    pub fn origins(&self) -> &Origins {
        &self.origins
    }

    /// Issues `request` against the active credential. The network call runs
    /// asynchronously; the handle can cancel it until it completes.
    pub fn send(&self, request: Request) -> RequestHandle {
        let handle = {
            let mut state = self.state.borrow_mut();
            state.next_handle += 1;
            RequestHandle(state.next_handle)
        };
        self.issue(handle, request, false);
        handle
    }

    /// Sends a request from a `request_failed` notification again, unchanged.
    pub fn resend(&self, request: Request) -> RequestHandle {
        self.send(request)
    }

    /// After this returns, no callback of `handle` will run.
    pub fn cancel(&self, handle: RequestHandle) -> bool {
        let ticket = {
            let mut state = self.state.borrow_mut();
            let Some(flight) = state.requests.remove(&handle) else {
                return false;
            };
            if let Some(ticket) = flight.ticket {
                state.tickets.remove(&ticket);
            }
            flight.ticket
        };
        debug!(handle = handle.0, "api: cancelled");
        if let Some(ticket) = ticket {
            self.transport.abort(ticket);
        }
        true
    }

    /// Sends a fully built request with no credential attached and hands the
    /// raw outcome to `callback`. Used for the token endpoint.
    pub fn send_raw(&self, mut request: HttpRequest, callback: RawCallback) {
        let ticket = {
            let mut state = self.state.borrow_mut();
            state.next_ticket += 1;
            let ticket = state.next_ticket;
            state.tickets.insert(ticket, Ticket::Raw(callback));
            ticket
        };
        request.ticket = ticket;
        debug!(ticket, method = %request.method, url = %request.url, "api: raw request");
        self.start(request);
    }

    fn issue(&self, handle: RequestHandle, request: Request, replayed: bool) {
        let credential = self.identity.active_credential();
        let url = credential.wrap_path(&self.origins, &request.path);
        let http = {
            let mut state = self.state.borrow_mut();
            state.next_ticket += 1;
            let ticket = state.next_ticket;
            state.tickets.insert(ticket, Ticket::Api(handle));
            let http = HttpRequest {
                ticket,
                method: request.method.clone(),
                url: url.clone(),
                authorization: credential.authorization(),
                basic_auth: None,
                form: request.form.clone(),
            };
            state.requests.insert(
                handle,
                InFlight {
                    request,
                    ticket: Some(ticket),
                    url,
                    replayed,
                },
            );
            http
        };
        debug!(
            handle = handle.0,
            ticket = http.ticket,
            method = %http.method,
            url = %http.url,
            replayed,
            "api: request"
        );
        self.start(http);
    }

    fn start(&self, request: HttpRequest) {
        let tx = self.completions_tx.clone();
        let ticket = request.ticket;
        self.transport.start(
            request,
            Box::new(move |result| {
                let _ = tx.send((ticket, result));
            }),
        );
    }

    /// Handles every completion that has already arrived. Returns how many.
    pub fn pump(&self) -> usize {
        let mut handled = 0;
        while let Ok((ticket, result)) = self.completions_rx.try_recv() {
            self.complete(ticket, result);
            handled += 1;
        }
        handled
    }

    /// Pumps until nothing is outstanding or `timeout` passes. Returns
    /// whether the dispatcher went idle.
    pub fn run_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if self.is_idle() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.completions_rx.recv_timeout(remaining) {
                Ok((ticket, result)) => self.complete(ticket, result),
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => return self.is_idle(),
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state.borrow();
        state.tickets.is_empty() && state.requests.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.state.borrow().requests.len()
    }

    fn complete(&self, ticket: u64, result: Result<HttpResponse, TransportError>) {
        let entry = self.state.borrow_mut().tickets.remove(&ticket);
        let handle = match entry {
            None => {
                debug!(ticket, "api: dropped completion for cancelled request");
                return;
            }
            Some(Ticket::Raw(callback)) => {
                callback(self, result);
                return;
            }
            Some(Ticket::Api(handle)) => handle,
        };
        let Some(flight) = self.state.borrow_mut().requests.remove(&handle) else {
            return;
        };

        let resp = match result {
            Ok(resp) => resp,
            Err(err) => {
                let message = err.describe(&flight.request.method, &flight.url);
                self.fail(flight.request, RequestError::Transport(message));
                return;
            }
        };

        let json = match decode_body(&resp) {
            Ok(json) => json,
            Err(err) => {
                self.fail(flight.request, err);
                return;
            }
        };

        if flight.request.handle_errors {
            if let Some(code) = json.get("error").map(error_code) {
                if code == "401" {
                    if flight.replayed {
                        self.fail(
                            flight.request,
                            RequestError::AuthExpired("still unauthorized after refresh".into()),
                        );
                    } else {
                        self.refresh_and_replay(handle, flight.request);
                    }
                } else {
                    self.fail(flight.request, RequestError::Api { code });
                }
                return;
            }
        }

        debug!(handle = handle.0, status = resp.status, "api: done");
        let Some(on_success) = flight.request.on_success.clone() else {
            return;
        };
        let previous = self.responding.replace(Some(flight.request));
        match on_success {
            OnSuccess::Json(callback) => callback(self, json),
            OnSuccess::WithUserData(callback, data) => callback(self, json, data),
        }
        *self.responding.borrow_mut() = previous;
    }

    fn refresh_and_replay(&self, handle: RequestHandle, request: Request) {
        debug!(handle = handle.0, path = %request.path, "api: 401, refreshing token");
        self.state.borrow_mut().requests.insert(
            handle,
            InFlight {
                request,
                ticket: None,
                url: String::new(),
                replayed: false,
            },
        );
        self.identity.refresh_active(
            self,
            Box::new(move |api, result| api.replay(handle, result)),
        );
    }

    fn replay(&self, handle: RequestHandle, refreshed: Result<(), RequestError>) {
        let Some(flight) = self.state.borrow_mut().requests.remove(&handle) else {
            debug!(handle = handle.0, "api: cancelled during refresh");
            return;
        };
        match refreshed {
            Ok(()) => self.issue(handle, flight.request, true),
            Err(err) => {
                let reason = match err {
                    RequestError::AuthExpired(reason) => reason,
                    other => format!("token refresh failed: {}", other),
                };
                self.fail(flight.request, RequestError::AuthExpired(reason));
            }
        }
    }

    /// Fails the request whose success callback is running, for callbacks
    /// that find the body unusable. The request is reported exactly as sent,
    /// callback and user data included, so `resend` picks up where it left
    /// off.
    pub fn fail_response(&self, error: RequestError) {
        let request = self.responding.borrow().clone();
        match request {
            Some(request) => self.fail(request, error),
            None => warn!(error = %error, "api: fail_response outside a success callback"),
        }
    }

    /// Surfaces a failure through `request_failed`.
    pub fn fail(&self, request: Request, error: RequestError) {
        warn!(method = %request.method, path = %request.path, error = %error, "api: request failed");
        self.request_failed.emit(&FailedRequest { request, error });
    }

    fn token_changed(&self) {
        if self.identity.active_credential().is_anonymous() {
            self.set_user_subs(DEFAULT_SUBS.iter().map(|s| s.to_string()).collect());
            self.user_changed.emit(&());
            self.subs_changed.emit(&());
        } else {
            self.collect_subscriptions();
            self.whoami();
        }
    }

    pub fn user_name(&self) -> String {
        self.identity.active_credential().display_name().to_string()
    }

    /// Loads `/api/v1/me` and records the name on the active account.
    /// Anonymous has no name to load; `user_changed` fires right away and no
    /// request is made.
    pub fn whoami(&self) -> Option<RequestHandle> {
        let Some(account) = self.identity.active_id() else {
            self.user_changed.emit(&());
            return None;
        };
        Some(self.send(Request::get("/api/v1/me").on_success(move |api, json| {
            match serde_json::from_value::<Me>(json) {
                Ok(me) => {
                    api.identity.set_display_name(&account, &me.name);
                    api.user_changed.emit(&());
                }
                Err(err) => api.fail_response(RequestError::MalformedResponse(format!(
                    "/api/v1/me: {}",
                    err
                ))),
            }
        })))
    }

    /// Walks every page of the user's subscriptions, then publishes the list
    /// once and fires `subs_changed`.
    pub fn collect_subscriptions(&self) -> RequestHandle {
        self.collecting.set(true);
        self.send(subscription_page(SUBSCRIPTIONS_PATH, Vec::new()))
    }

    fn collect_page(&self, path: &str, page: Value, collected: Value) {
        let mut subs: Vec<String> = serde_json::from_value(collected).unwrap_or_default();
        let page: SubscriptionPage = match serde_json::from_value(page) {
            Ok(page) => page,
            Err(err) => {
                self.collecting.set(false);
                self.fail_response(RequestError::MalformedResponse(format!("{}: {}", path, err)));
                return;
            }
        };
        subs.extend(page.data.children.into_iter().map(|thing| thing.data.url));

        match page.data.after {
            Some(after) => {
                let next = format!(
                    "{}&{}",
                    SUBSCRIPTIONS_PATH,
                    form_urlencoded::Serializer::new(String::new())
                        .append_pair("after", &after)
                        .finish()
                );
                self.send(subscription_page(&next, subs));
            }
            None => {
                self.collecting.set(false);
                debug!(count = subs.len(), "api: subscriptions collected");
                self.set_user_subs(subs);
                self.subs_changed.emit(&());
            }
        }
    }

    pub fn is_collecting_subscriptions(&self) -> bool {
        self.collecting.get()
    }

    fn set_user_subs(&self, subs: Vec<String>) {
        *self.lower_user_subs.borrow_mut() = subs.iter().map(|s| s.to_lowercase()).collect();
        *self.user_subs.borrow_mut() = subs;
    }

    pub fn user_subs(&self) -> Vec<String> {
        self.user_subs.borrow().clone()
    }

    /// Subscriptions with the always-present entries in front.
    pub fn display_subs(&self) -> Vec<String> {
        PREPEND_SUBS
            .iter()
            .map(|s| s.to_string())
            .chain(self.user_subs.borrow().iter().cloned())
            .collect()
    }

    pub fn is_subscribed(&self, sub: &str) -> bool {
        let wanted = sub.trim_end_matches('/').to_lowercase();
        self.lower_user_subs
            .borrow()
            .iter()
            .any(|s| s.trim_end_matches('/') == wanted)
    }

    /// `name` without the `/r/` prefix.
    pub fn subreddit_info<F>(&self, name: &str, callback: F) -> RequestHandle
    where
        F: Fn(&Api, Value) + 'static,
    {
        self.send(Request::get(&format!("/r/{}/about", name)).on_success(callback))
    }

    pub fn user_info<F>(&self, name: &str, callback: F) -> RequestHandle
    where
        F: Fn(&Api, Value) + 'static,
    {
        self.send(Request::get(&format!("/user/{}/about", name)).on_success(callback))
    }

    /// A listing such as `/r/rust`, `/r/all` or `/r/rust/top?t=all`.
    pub fn get_list<F>(&self, sub: &str, callback: F) -> RequestHandle
    where
        F: Fn(&Api, Value) + 'static,
    {
        self.send(Request::get(sub).on_success(callback))
    }

    pub fn vote(&self, fullname: &str, direction: i32) -> RequestHandle {
        self.send(Request::post(
            "/api/vote",
            vec![
                ("id".into(), fullname.into()),
                ("dir".into(), direction.clamp(-1, 1).to_string()),
            ],
        ))
    }

    pub fn set_subscribed<F>(&self, name: &str, subscribed: bool, callback: F) -> RequestHandle
    where
        F: Fn(&Api, Value) + 'static,
    {
        let action = if subscribed { "sub" } else { "unsub" };
        self.send(
            Request::post(
                "/api/subscribe",
                vec![
                    ("sr_name".into(), name.into()),
                    ("action".into(), action.into()),
                ],
            )
            .on_success(callback),
        )
    }

    pub fn reply<F>(&self, thing_id: &str, text: &str, callback: F) -> RequestHandle
    where
        F: Fn(&Api, Value) + 'static,
    {
        self.send(
            Request::post(
                "/api/comment",
                vec![
                    ("thing_id".into(), thing_id.into()),
                    ("text".into(), text.into()),
                    ("api_type".into(), "json".into()),
                ],
            )
            .on_success(callback),
        )
    }

    pub fn set_saved<F>(&self, thing_id: &str, saved: bool, callback: F) -> RequestHandle
    where
        F: Fn(&Api, Value) + 'static,
    {
        let path = if saved { "/api/save" } else { "/api/unsave" };
        self.send(Request::post(path, vec![("id".into(), thing_id.into())]).on_success(callback))
    }

    /// Submissions report their own validation errors, so the error field is
    /// left for the callback.
    pub fn submit<F>(&self, mut form: Vec<(String, String)>, callback: F) -> RequestHandle
    where
        F: Fn(&Api, Value) + 'static,
    {
        form.push(("api_type".into(), "json".into()));
        self.send(
            Request::post("/api/submit", form)
                .handle_errors(false)
                .on_success(callback),
        )
    }

    pub fn read_message(&self, name: &str) -> RequestHandle {
        self.send(Request::post(
            "/api/read_message",
            vec![("id".into(), name.into())],
        ))
    }

    /// Loads the comments behind a "more" stub and delivers them nested.
    pub fn load_more<F>(&self, link_name: &str, more: &Thing, callback: F) -> RequestHandle
    where
        F: Fn(&Api, Vec<Thing>) + 'static,
    {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("api_type", "json")
            .append_pair("children", &more.more_children().join(","))
            .append_pair("link_id", link_name)
            .finish();
        let path = format!("/api/morechildren?{}", query);
        self.send(Request::get(&path).on_success(move |api, json| {
            match comments::decode_more_children(json) {
                Ok(flat) => callback(api, comments::build_tree(flat)),
                Err(err) => api.fail_response(RequestError::MalformedResponse(err)),
            }
        }))
    }
}

fn subscription_page(path: &str, collected: Vec<String>) -> Request {
    let page_path = path.to_string();
    Request::get(path).on_success_with(Value::from(collected), move |api, page, collected| {
        api.collect_page(&page_path, page, collected)
    })
}

fn decode_body(resp: &HttpResponse) -> Result<Value, RequestError> {
    if resp.body.is_empty() {
        return Err(RequestError::EmptyBody {
            status: resp.status,
        });
    }
    serde_json::from_slice(&resp.body).map_err(|err| {
        RequestError::MalformedResponse(format!("status {}: {}", resp.status, err))
    })
}

fn error_code(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{self, TokenEndpoint};
    use crate::transport::{MockTransport, TransportErrorKind};
    use serde_json::json;
    use std::path::PathBuf;

    fn anonymous_api() -> (Rc<Api>, Arc<MockTransport>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("identity");
        let identity = Rc::new(IdentityController::open(
            path,
            TokenEndpoint::new(auth::Config::default()),
        ));
        let mock = Arc::new(MockTransport::new());
        let api = Api::new(identity, mock.clone(), ApiConfig::default());
        (api, mock, dir)
    }

    fn failures(api: &Api) -> Rc<RefCell<Vec<FailedRequest>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        api.request_failed
            .connect(move |failed| sink.borrow_mut().push(failed.clone()));
        seen
    }

    #[test]
    fn special_subs() {
        assert!(is_special_sub("/message/inbox"));
        assert!(!is_special_sub("/r/something"));
        assert!(is_special_sub("/user/somebody/hidden"));
    }

    #[test]
    fn path_is_normalized() {
        assert_eq!(Request::get("r/rust").path, "/r/rust");
        assert_eq!(Request::get("/r/rust").path, "/r/rust");
    }

    #[test]
    fn anonymous_defaults() {
        let (api, _mock, _dir) = anonymous_api();
        assert_eq!(api.user_subs(), vec!["/r/gnome", "/r/gnu+linux"]);
        assert_eq!(api.display_subs()[0], "/r/all");
        assert!(api.is_subscribed("/r/GNOME"));
        assert_eq!(api.user_name(), "Anonymous");
    }

    #[test]
    fn success_with_user_data() {
        let (api, mock, _dir) = anonymous_api();
        let got = Rc::new(RefCell::new(None));
        let sink = got.clone();
        api.send(
            Request::get("/r/rust/about").on_success_with(json!("tag"), move |_, body, data| {
                *sink.borrow_mut() = Some((body, data));
            }),
        );
        mock.complete_next(200, json!({"kind": "t5"}));
        api.pump();
        assert_eq!(
            got.borrow().clone(),
            Some((json!({"kind": "t5"}), json!("tag")))
        );
        assert!(api.is_idle());
    }

    #[test]
    fn transport_error_is_surfaced_with_request() {
        let (api, mock, _dir) = anonymous_api();
        let failed = failures(&api);
        api.send(Request::post("/api/vote", vec![("id".into(), "t3_x".into())]));
        mock.fail_next(crate::transport::TransportError::new(
            TransportErrorKind::Connect,
            "refused",
        ));
        api.pump();

        let failed = failed.borrow();
        assert_eq!(failed.len(), 1);
        assert!(matches!(failed[0].error, RequestError::Transport(_)));
        assert!(failed[0]
            .message()
            .ends_with("Message POST https://api.reddit.com/api/vote"));
        assert_eq!(failed[0].request.path, "/api/vote");
    }

    #[test]
    fn empty_and_malformed_bodies() {
        let (api, mock, _dir) = anonymous_api();
        let failed = failures(&api);
        mock.route_raw("https://api.reddit.com/empty", 200, Vec::new());
        mock.route_raw("https://api.reddit.com/html", 200, b"<html>".to_vec());
        api.send(Request::get("/empty"));
        api.send(Request::get("/html"));
        api.pump();

        let failed = failed.borrow();
        assert_eq!(failed[0].error, RequestError::EmptyBody { status: 200 });
        assert!(matches!(
            failed[1].error,
            RequestError::MalformedResponse(_)
        ));
    }

    #[test]
    fn api_error_and_unhandled_errors() {
        let (api, mock, _dir) = anonymous_api();
        let failed = failures(&api);
        mock.route("https://api.reddit.com/r/private/about", 200, json!({"error": 403}));
        mock.route("https://api.reddit.com/api/submit", 200, json!({"error": 403}));

        api.subreddit_info("private", |_, _| panic!("must not succeed"));
        let seen = Rc::new(Cell::new(false));
        let flag = seen.clone();
        api.submit(vec![("kind".into(), "self".into())], move |_, body| {
            assert_eq!(body["error"], 403);
            flag.set(true);
        });
        api.pump();

        assert_eq!(
            failed.borrow()[0].error,
            RequestError::Api { code: "403".into() }
        );
        assert!(seen.get());
        let submitted = mock.requests();
        assert_eq!(submitted[1].form_value("api_type"), Some("json"));
    }

    #[test]
    fn load_more_delivers_nested_comments() {
        let (api, mock, _dir) = anonymous_api();
        let more: Thing = serde_json::from_value(json!({
            "kind": "more",
            "data": {"name": "t1_m", "parent_id": "t3_link", "children": ["a", "b"]}
        }))
        .unwrap();

        let roots = Rc::new(RefCell::new(Vec::new()));
        let sink = roots.clone();
        api.load_more("t3_link", &more, move |_, tree| *sink.borrow_mut() = tree);

        let req = mock.complete_next(
            200,
            json!({"json": {"errors": [], "data": {"things": [
                {"kind": "t1", "data": {"name": "t1_a", "parent_id": "t3_link", "body": "a", "replies": ""}},
                {"kind": "t1", "data": {"name": "t1_b", "parent_id": "t1_a", "body": "b", "replies": ""}}
            ]}}}),
        )
        .unwrap();
        assert!(req.url.contains("children=a%2Cb"));
        assert!(req.url.contains("link_id=t3_link"));
        api.pump();

        let roots = roots.borrow();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].data.replies.children()[0].data.name, "t1_b");
    }

    #[test]
    fn endpoint_helpers_build_expected_requests() {
        let (api, mock, _dir) = anonymous_api();
        api.user_info("spez", |_, _| {});
        api.set_subscribed("rust", true, |_, _| {});
        api.set_subscribed("rust", false, |_, _| {});
        api.set_saved("t3_abc", true, |_, _| {});
        api.set_saved("t3_abc", false, |_, _| {});

        let sent = mock.requests();
        assert_eq!(sent[0].method, Method::GET);
        assert_eq!(sent[0].url, "https://api.reddit.com/user/spez/about");

        assert_eq!(sent[1].method, Method::POST);
        assert_eq!(sent[1].url, "https://api.reddit.com/api/subscribe");
        assert_eq!(sent[1].form_value("sr_name"), Some("rust"));
        assert_eq!(sent[1].form_value("action"), Some("sub"));
        assert_eq!(sent[2].form_value("action"), Some("unsub"));

        assert_eq!(sent[3].url, "https://api.reddit.com/api/save");
        assert_eq!(sent[3].form_value("id"), Some("t3_abc"));
        assert_eq!(sent[4].url, "https://api.reddit.com/api/unsave");
        assert_eq!(sent[4].form_value("id"), Some("t3_abc"));
    }

    #[test]
    fn whoami_is_skipped_for_anonymous() {
        let (api, mock, _dir) = anonymous_api();
        let fired = Rc::new(Cell::new(0));
        let counter = fired.clone();
        api.user_changed
            .connect(move |_| counter.set(counter.get() + 1));

        assert_eq!(api.whoami(), None);
        assert_eq!(fired.get(), 1);
        assert!(mock.requests().is_empty());
    }

    #[test]
    fn unusable_more_children_body_can_be_resent() {
        let (api, mock, _dir) = anonymous_api();
        let failed = failures(&api);
        let more: Thing = serde_json::from_value(json!({
            "kind": "more",
            "data": {"name": "t1_m", "parent_id": "t3_link", "children": ["a"]}
        }))
        .unwrap();
        let delivered = Rc::new(Cell::new(0));
        let counter = delivered.clone();
        api.load_more("t3_link", &more, move |_, tree| {
            counter.set(counter.get() + tree.len())
        });
        mock.complete_next(200, json!({"json": {"errors": [["RATELIMIT"]]}}));
        api.pump();

        let request = {
            let failed = failed.borrow();
            assert_eq!(failed.len(), 1);
            assert!(matches!(failed[0].error, RequestError::MalformedResponse(_)));
            failed[0].request.clone()
        };
        assert!(request.on_success.is_some());
        assert!(request.path.starts_with("/api/morechildren?"));

        api.resend(request);
        mock.complete_next(
            200,
            json!({"json": {"errors": [], "data": {"things": [
                {"kind": "t1", "data": {"name": "t1_a", "parent_id": "t3_link", "replies": ""}}
            ]}}}),
        );
        api.pump();
        assert_eq!(delivered.get(), 1);
    }

    #[test]
    fn fail_response_outside_callback_is_ignored() {
        let (api, _mock, _dir) = anonymous_api();
        let failed = failures(&api);
        api.fail_response(RequestError::MalformedResponse("late".into()));
        assert!(failed.borrow().is_empty());
    }

    #[test]
    fn cancel_unknown_handle_is_noop() {
        let (api, _mock, _dir) = anonymous_api();
        assert!(!api.cancel(RequestHandle(42)));
    }
}
