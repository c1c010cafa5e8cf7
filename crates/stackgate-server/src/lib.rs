//! HTTP front end for stackgate.
//!
//! Routes:
//!
//! ```text
//! GET  /health
//! GET  /environments
//! POST /environments
//! GET  /environments/{id}
//! GET  /environments/{id}/changes/{change_id}
//! POST /environments/{id}/plan     {"revision": ".."} or a push webhook body
//! POST /environments/{id}/apply    {"change_id": n} (optional)
//! ```
//!
//! Plan and apply requests are validated, answered with `202 Accepted`, and
//! run on a worker thread. Runs for one environment queue behind its gate.
//!
//! The [`TestServer`] helper starts a server on a random port for integration testing.

use serde::Deserialize;
use stackgate_core::{shutdown_requested, CoreError, Engine, StoreLock};
use stackgate_runtime::TracingSink;
use stackgate_schema::{ChangeId, Environment, EnvironmentId, EnvironmentSummary, Revision};
use stackgate_store::StoreError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Body of `POST /environments`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub id: Option<EnvironmentId>,
    pub name: String,
    pub repo: String,
    pub branch: Option<String>,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub auto_apply: bool,
    #[serde(default)]
    pub variables: std::collections::BTreeMap<String, String>,
}

/// Body of `POST /environments/{id}/plan`. Push webhooks carry the commit in
/// `head_commit.id`; any other fields they send are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct PlanRequest {
    pub revision: Option<String>,
    pub head_commit: Option<HeadCommit>,
}

#[derive(Debug, Deserialize)]
pub struct HeadCommit {
    pub id: String,
}

impl PlanRequest {
    pub fn revision(&self) -> Option<&str> {
        self.revision
            .as_deref()
            .or(self.head_commit.as_ref().map(|c| c.id.as_str()))
            .filter(|r| !r.is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplyRequest {
    pub change_id: Option<ChangeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Health,
    Environments,
    Environment(EnvironmentId),
    Change(EnvironmentId, ChangeId),
    Plan(EnvironmentId),
    Apply(EnvironmentId),
}

/// Parse a request path (query string ignored) into a route.
pub fn parse_route(url: &str) -> Option<Route> {
    let path = url.split('?').next().unwrap_or_default();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["health"] => Some(Route::Health),
        ["environments"] => Some(Route::Environments),
        ["environments", id] => Some(Route::Environment(id.parse().ok()?)),
        ["environments", id, "plan"] => Some(Route::Plan(id.parse().ok()?)),
        ["environments", id, "apply"] => Some(Route::Apply(id.parse().ok()?)),
        ["environments", id, "changes", change] => {
            Some(Route::Change(id.parse().ok()?, change.parse().ok()?))
        }
        _ => None,
    }
}

/// HTTP status for a core error.
pub fn status_for(err: &CoreError) -> u16 {
    match err {
        CoreError::Store(StoreError::EnvNotFound(_)) | CoreError::UnknownChange { .. } => 404,
        CoreError::Schema(_) | CoreError::MissingChange => 400,
        CoreError::AlreadyExists(_) | CoreError::NameConflict { .. } | CoreError::NoChanges(_) => {
            409
        }
        _ => 500,
    }
}

struct Workers {
    active: Mutex<usize>,
    idle: Condvar,
}

/// Decrements the worker count when a background run ends, however it ends.
struct WorkerSlot(Arc<App>);

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        let mut active = self
            .0
            .workers
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *active = active.saturating_sub(1);
        self.0.workers.idle.notify_all();
    }
}

/// Shared server state: the engine plus bookkeeping of background runs.
pub struct App {
    engine: Engine,
    workers: Workers,
}

impl App {
    pub fn new(engine: Engine) -> Arc<Self> {
        Arc::new(Self {
            engine,
            workers: Workers {
                active: Mutex::new(0),
                idle: Condvar::new(),
            },
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn active_runs(&self) -> usize {
        *self
            .workers
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until every background run has finished.
    pub fn wait_idle(&self) {
        let mut active = self
            .workers
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *active > 0 {
            active = self
                .workers
                .idle
                .wait(active)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn spawn_run<F>(self: &Arc<Self>, name: String, run: F) -> Result<(), std::io::Error>
    where
        F: FnOnce(&Engine) + Send + 'static,
    {
        *self
            .workers
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
        let slot = WorkerSlot(Arc::clone(self));
        std::thread::Builder::new().name(name).spawn(move || {
            run(&slot.0.engine);
            drop(slot);
        })?;
        Ok(())
    }
}

/// Log every change notification along with the environment's latest status.
pub fn spawn_event_logger(app: &Arc<App>) -> JoinHandle<()> {
    let events = app.engine.notifier().subscribe();
    let app = Arc::clone(app);
    std::thread::spawn(move || {
        for env_id in events {
            match app.engine.get(env_id) {
                Ok(env) => match env.changes.latest() {
                    Some(change) => info!(
                        env_id = %env_id,
                        change_id = %change.id,
                        status = %change.status,
                        "environment '{}' changed",
                        env.name
                    ),
                    None => info!(env_id = %env_id, "environment '{}' changed", env.name),
                },
                Err(e) => warn!(env_id = %env_id, "change event for unreadable environment: {e}"),
            }
        }
        debug!("event logger stopped");
    })
}

fn json_header() -> Option<Header> {
    Header::from_bytes("Content-Type", "application/json").ok()
}

fn respond_json(req: Request, code: u16, value: &impl serde::Serialize) {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::from_data(body).with_status_code(StatusCode(code));
    if let Some(header) = json_header() {
        response = response.with_header(header);
    }
    let _ = req.respond(response);
}

fn respond_err(req: Request, code: u16, msg: &str) {
    respond_json(req, code, &serde_json::json!({ "error": msg }));
}

fn respond_core_err(req: Request, err: &CoreError) {
    let code = status_for(err);
    if code >= 500 {
        error!("{err}");
    }
    respond_err(req, code, &err.to_string());
}

fn read_body(req: &mut Request) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    req.as_reader().read_to_end(&mut body).ok().map(|_| body)
}

/// Parse a JSON body; an empty body yields the default.
fn parse_body<T: serde::de::DeserializeOwned + Default>(body: &[u8]) -> Result<T, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| format!("invalid request body: {e}"))
}

fn handle_register(app: &App, mut req: Request) {
    let Some(body) = read_body(&mut req) else {
        respond_err(req, 400, "read error");
        return;
    };
    let request: RegisterRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            respond_err(req, 400, &format!("invalid request body: {e}"));
            return;
        }
    };

    let _lock = match app.engine.layout().map(|l| StoreLock::acquire(&l.lock_file())).transpose() {
        Ok(lock) => lock,
        Err(e) => {
            respond_core_err(req, &e);
            return;
        }
    };
    let id = match request.id.map_or_else(|| app.engine.next_id(), Ok) {
        Ok(id) => id,
        Err(e) => {
            respond_core_err(req, &e);
            return;
        }
    };
    let mut env = Environment::new(id, request.name, request.repo)
        .with_path(request.path)
        .with_auto_apply(request.auto_apply);
    if let Some(branch) = request.branch {
        env = env.with_branch(branch);
    }
    env.variables = request.variables;

    match app.engine.register(&env) {
        Ok(()) => respond_json(req, 201, &EnvironmentSummary::from(&env)),
        Err(e) => respond_core_err(req, &e),
    }
}

fn handle_plan(app: &Arc<App>, mut req: Request, env_id: EnvironmentId) {
    let Some(body) = read_body(&mut req) else {
        respond_err(req, 400, "read error");
        return;
    };
    let request: PlanRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(msg) => {
            respond_err(req, 400, &msg);
            return;
        }
    };
    let Some(revision) = request.revision().map(Revision::new) else {
        respond_err(req, 400, "missing revision");
        return;
    };
    if let Err(e) = app.engine.get(env_id) {
        respond_core_err(req, &e);
        return;
    }

    let accepted = serde_json::json!({
        "environment": env_id,
        "revision": revision,
        "action": "plan",
    });
    let queued = revision.clone();
    let spawned = app.spawn_run(format!("plan-{env_id}"), move |engine| {
        let mut sink = TracingSink::new(env_id);
        match engine.plan(env_id, queued, &mut sink) {
            Ok(change) => info!(
                env_id = %env_id,
                change_id = %change.id,
                status = %change.status,
                "plan finished"
            ),
            Err(e) => error!(env_id = %env_id, "plan failed: {e}"),
        }
    });
    match spawned {
        Ok(()) => {
            info!(env_id = %env_id, revision = %revision, "plan accepted");
            respond_json(req, 202, &accepted);
        }
        Err(e) => respond_err(req, 500, &format!("failed to start worker: {e}")),
    }
}

fn handle_apply(app: &Arc<App>, mut req: Request, env_id: EnvironmentId) {
    let Some(body) = read_body(&mut req) else {
        respond_err(req, 400, "read error");
        return;
    };
    let request: ApplyRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(msg) => {
            respond_err(req, 400, &msg);
            return;
        }
    };
    let env = match app.engine.get(env_id) {
        Ok(env) => env,
        Err(e) => {
            respond_core_err(req, &e);
            return;
        }
    };
    let target = match request.change_id {
        Some(change) if !env.changes.contains(change) => {
            respond_core_err(req, &CoreError::UnknownChange { env: env_id, change });
            return;
        }
        Some(change) => change,
        None => match env.changes.latest() {
            Some(latest) => latest.id,
            None => {
                respond_core_err(req, &CoreError::NoChanges(env_id));
                return;
            }
        },
    };

    let spawned = app.spawn_run(format!("apply-{env_id}"), move |engine| {
        let mut sink = TracingSink::new(env_id);
        match engine.apply(env_id, Some(target), &mut sink) {
            Ok(change) => info!(
                env_id = %env_id,
                change_id = %change.id,
                status = %change.status,
                "apply finished"
            ),
            Err(e) => error!(env_id = %env_id, "apply failed: {e}"),
        }
    });
    match spawned {
        Ok(()) => respond_json(
            req,
            202,
            &serde_json::json!({
                "environment": env_id,
                "change_id": target,
                "action": "apply",
            }),
        ),
        Err(e) => respond_err(req, 500, &format!("failed to start worker: {e}")),
    }
}

/// Handle a single HTTP request, dispatching to the appropriate route handler.
pub fn handle_request(app: &Arc<App>, req: Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    match (parse_route(&url), &method) {
        (Some(Route::Health), Method::Get) => respond_json(
            req,
            200,
            &serde_json::json!({ "status": "ok", "active_runs": app.active_runs() }),
        ),
        (Some(Route::Environments), Method::Get) => match app.engine.list() {
            Ok(envs) => {
                let summaries: Vec<EnvironmentSummary> =
                    envs.iter().map(EnvironmentSummary::from).collect();
                respond_json(req, 200, &summaries);
            }
            Err(e) => respond_core_err(req, &e),
        },
        (Some(Route::Environments), Method::Post) => handle_register(app, req),
        (Some(Route::Environment(id)), Method::Get) => match app.engine.get(id) {
            Ok(env) => respond_json(req, 200, &env),
            Err(e) => respond_core_err(req, &e),
        },
        (Some(Route::Change(id, change_id)), Method::Get) => match app.engine.get(id) {
            Ok(env) => match env.changes.get(change_id) {
                Some(change) => respond_json(req, 200, change),
                None => respond_core_err(
                    req,
                    &CoreError::UnknownChange {
                        env: id,
                        change: change_id,
                    },
                ),
            },
            Err(e) => respond_core_err(req, &e),
        },
        (Some(Route::Plan(id)), Method::Post) => handle_plan(app, req, id),
        (Some(Route::Apply(id)), Method::Post) => handle_apply(app, req, id),
        (Some(_), _) => respond_err(req, 405, "method not allowed"),
        (None, _) => respond_err(req, 404, "not found"),
    }
}

pub fn bind(addr: &str) -> Result<Server, ServerError> {
    Server::http(addr).map_err(|e| ServerError::Bind {
        addr: addr.to_owned(),
        reason: e.to_string(),
    })
}

/// Serve requests until `stop` is set or a shutdown signal arrives, then wait
/// for background runs to finish.
pub fn serve(app: &Arc<App>, server: &Server, stop: &AtomicBool) -> Result<(), ServerError> {
    while !stop.load(Ordering::SeqCst) && !shutdown_requested() {
        if let Some(request) = server.recv_timeout(POLL_INTERVAL)? {
            handle_request(app, request);
        }
    }
    let active = app.active_runs();
    if active > 0 {
        info!("waiting for {active} running change(s) to finish");
    }
    app.wait_idle();
    Ok(())
}

/// A test helper that starts a stackgate server on a random port in a background thread.
///
/// Drop the `TestServer` to stop the server; dropping waits for running changes.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub app: Arc<App>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Start a test server for `engine`. Binds to `127.0.0.1:0` (random port).
    pub fn start(engine: Engine) -> Result<Self, ServerError> {
        let server = bind("127.0.0.1:0")?;
        let port = server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .ok_or_else(|| ServerError::Bind {
                addr: "127.0.0.1:0".to_owned(),
                reason: "not an IP address".to_owned(),
            })?;
        let url = format!("http://127.0.0.1:{port}");

        let app = App::new(engine);
        spawn_event_logger(&app);
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let app = Arc::clone(&app);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                if let Err(e) = serve(&app, &server, &stop) {
                    error!("test server stopped: {e}");
                }
            })
        };

        Ok(Self {
            url,
            port,
            app,
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
