//! The daemon host: accepts connections on the local socket, serves
//! §4.D's protocol against a `Runtime`, evicts idle keep-alive sessions, and
//! shuts down cleanly on a signal or a `stop` request.
//!
//! Grounded on the teacher's `Arc<RwLock<...>>`/`Arc<Mutex<...>>` shared-state
//! pattern (`server/mod.rs`) for the per-connection task layout, generalized
//! from "serve MCP over this socket" to "serve the daemon envelope protocol".

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Lifecycle, ServerDefinition};
use crate::daemon::{metadata, protocol};
use crate::error::{HubError, Result};
use crate::runtime::Runtime;

const IDLE_EVICTION_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
struct ServerActivity {
    connected: bool,
    last_used_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// CLI/env inputs that decide whether daemon logging turns on at all, and
/// which servers' served calls get mirrored to it.
#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    pub log: bool,
    pub log_file: Option<PathBuf>,
    pub log_servers: Vec<String>,
}

impl LoggingOptions {
    /// Fold in the env-var equivalents of `--log`/`--log-file`/`--log-servers`.
    pub fn merge_env(mut self) -> Self {
        if std::env::var("MCPORTER_DAEMON_LOG").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true")) {
            self.log = true;
        }
        if let Some(path) = std::env::var_os("MCPORTER_DAEMON_LOG_FILE") {
            self.log_file.get_or_insert_with(|| PathBuf::from(path));
        }
        if let Ok(list) = std::env::var("MCPORTER_DAEMON_LOG_SERVERS") {
            self.log_servers.extend(
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            );
        }
        self
    }
}

/// Resolved enablement/filtering decision, per §4.E: logging is enabled if any
/// explicit `--log`/`--log-file` signal fired (in which case every served call
/// is logged), or if a server opted in individually (in which case only that
/// server's calls are logged), or if `--log-servers` names a server.
struct ResolvedLogging {
    enabled: bool,
    log_all_servers: bool,
    filter: HashSet<String>,
    log_path: Option<PathBuf>,
}

fn resolve_logging(
    options: &LoggingOptions,
    config_path: &std::path::Path,
    definitions: &[ServerDefinition],
) -> ResolvedLogging {
    let mut filter: HashSet<String> = options.log_servers.iter().cloned().collect();
    filter.extend(
        definitions
            .iter()
            .filter(|def| def.logging.daemon_enabled)
            .map(|def| def.name.clone()),
    );

    let log_all_servers = options.log || options.log_file.is_some();
    let enabled = log_all_servers || !filter.is_empty();
    let log_path = options
        .log_file
        .clone()
        .or_else(|| enabled.then(|| default_log_path(config_path)).flatten());

    ResolvedLogging {
        enabled,
        log_all_servers,
        filter,
        log_path,
    }
}

/// Minimal logger matching §4.E: `[daemon] <iso8601> <text>` lines, appended to
/// a file and mirrored to stdout, only when logging is enabled, with optional
/// per-server filtering of served-call entries.
pub struct DaemonLogger {
    enabled: bool,
    log_all_servers: bool,
    filter: HashSet<String>,
    file: Option<Mutex<std::fs::File>>,
    log_path: Option<PathBuf>,
}

impl DaemonLogger {
    pub fn disabled() -> Self {
        DaemonLogger {
            enabled: false,
            log_all_servers: false,
            filter: HashSet::new(),
            file: None,
            log_path: None,
        }
    }

    /// Build a logger from resolved CLI/env options and the catalog's managed
    /// server definitions. Returns a disabled logger when none of §4.E's
    /// enablement conditions hold.
    pub fn from_options(
        options: &LoggingOptions,
        config_path: &std::path::Path,
        definitions: &[ServerDefinition],
    ) -> Self {
        let resolved = resolve_logging(options, config_path, definitions);
        if !resolved.enabled {
            return Self::disabled();
        }
        let file = resolved.log_path.as_ref().and_then(|path| {
            open_log_file(path)
                .inspect_err(|e| tracing::warn!(error = %e, path = %path.display(), "failed to open daemon log file"))
                .ok()
        });
        DaemonLogger {
            enabled: true,
            log_all_servers: resolved.log_all_servers,
            filter: resolved.filter,
            file: file.map(Mutex::new),
            log_path: resolved.log_path,
        }
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.log_path.clone()
    }

    /// Whether a served call for `server` should be logged under the current
    /// enablement and per-server filter.
    pub fn should_log_server(&self, server: &str) -> bool {
        self.enabled && (self.log_all_servers || self.filter.contains(server))
    }

    /// Whether calls with no particular server (e.g. `status`, `stop`) should
    /// be logged — only when logging is on for every server, since the
    /// per-server filter has nothing to match against.
    pub fn should_log_host_call(&self) -> bool {
        self.enabled && self.log_all_servers
    }

    /// Lifecycle log line (startup/shutdown), gated only on overall enablement.
    pub async fn log(&self, text: &str) {
        if !self.enabled {
            return;
        }
        self.write(text).await;
    }

    /// Served-call log line, additionally gated on the per-server filter.
    pub async fn log_call(&self, server: &str, text: &str) {
        if !self.should_log_server(server) {
            return;
        }
        self.write(text).await;
    }

    async fn write(&self, text: &str) {
        let line = format!("[daemon] {} {text}\n", chrono::Utc::now().to_rfc3339());
        print!("{line}");
        if let Some(file) = &self.file {
            use std::io::Write;
            let mut guard = file.lock().await;
            let _ = guard.write_all(line.as_bytes());
        }
    }

    pub async fn flush(&self) {
        if let Some(file) = &self.file {
            use std::io::Write;
            let mut guard = file.lock().await;
            let _ = guard.flush();
        }
    }
}

fn open_log_file(log_path: &std::path::Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(log_path)
}

/// Default log path: `~/.mcporter/daemon/<hash>.log`, matching the metadata
/// file's naming scheme.
pub fn default_log_path(config_path: &std::path::Path) -> Option<PathBuf> {
    metadata::daemon_dir().map(|dir| dir.join(format!("{}.log", metadata::config_hash(config_path))))
}

pub struct DaemonHost {
    runtime: Arc<Runtime>,
    activity: Arc<Mutex<HashMap<String, ServerActivity>>>,
    keep_alive_servers: Vec<String>,
    config_path: PathBuf,
    socket_path: PathBuf,
    metadata_path: PathBuf,
    logger: Arc<DaemonLogger>,
}

impl DaemonHost {
    /// Build a host over an already-populated `Runtime`. Refuses to start if no
    /// managed server has a keep-alive lifecycle, per §4.E startup step 1.
    pub async fn new(
        runtime: Runtime,
        config_path: PathBuf,
        socket_path: PathBuf,
        metadata_path: PathBuf,
        logger: DaemonLogger,
    ) -> Result<Self> {
        let mut keep_alive_servers = Vec::new();
        for name in runtime.list_servers().await {
            if let Ok(def) = runtime.get_definition(&name).await {
                if def.lifecycle.is_keep_alive() {
                    keep_alive_servers.push(name);
                }
            }
        }
        if keep_alive_servers.is_empty() {
            return Err(HubError::RuntimeError(
                "no keep-alive servers configured; refusing to start daemon".to_string(),
            ));
        }

        let mut activity = HashMap::new();
        for name in &keep_alive_servers {
            activity.insert(name.clone(), ServerActivity::default());
        }

        Ok(DaemonHost {
            runtime: Arc::new(runtime),
            activity: Arc::new(Mutex::new(activity)),
            keep_alive_servers,
            config_path,
            socket_path,
            metadata_path,
            logger: Arc::new(logger),
        })
    }

    /// Bind the socket, write metadata, serve connections until a termination
    /// signal or a `stop` request arrives, then shut down once.
    #[cfg(unix)]
    pub async fn run(self) -> Result<()> {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.metadata_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = tokio::net::UnixListener::bind(&self.socket_path)?;

        let meta = metadata::DaemonMetadata {
            pid: std::process::id(),
            socket_path: self.socket_path.clone(),
            config_path: self.config_path.clone(),
            started_at: chrono::Utc::now(),
            log_path: self.logger.log_path(),
        };
        metadata::write(&self.metadata_path, &meta)?;
        self.logger.log("Daemon host started").await;

        let shutdown = CancellationToken::new();

        let eviction_token = shutdown.child_token();
        let eviction_handle = tokio::spawn(run_idle_eviction(
            self.runtime.clone(),
            self.activity.clone(),
            self.keep_alive_servers.clone(),
            eviction_token,
        ));

        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            wait_for_termination_signal().await;
            signal_token.cancel();
        });

        let runtime = self.runtime.clone();
        let activity = self.activity.clone();
        let keep_alive_servers = Arc::new(self.keep_alive_servers.clone());
        let logger = self.logger.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let runtime = runtime.clone();
                            let activity = activity.clone();
                            let keep_alive_servers = keep_alive_servers.clone();
                            let logger = logger.clone();
                            let stop = shutdown.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, runtime, activity, keep_alive_servers, logger, stop).await;
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "daemon accept failed"),
                    }
                }
            }
        }

        eviction_handle.abort();
        let _ = self.runtime.close(None).await;
        self.logger.flush().await;
        let _ = std::fs::remove_file(&self.socket_path);
        metadata::unlink(&self.metadata_path);
        Ok(())
    }

    #[cfg(windows)]
    pub async fn run(self) -> Result<()> {
        Err(HubError::RuntimeError(
            "daemon host is not implemented on this platform".to_string(),
        ))
    }
}

async fn handle_connection(
    mut stream: tokio::net::UnixStream,
    runtime: Arc<Runtime>,
    activity: Arc<Mutex<HashMap<String, ServerActivity>>>,
    keep_alive_servers: Arc<Vec<String>>,
    logger: Arc<DaemonLogger>,
    stop: CancellationToken,
) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    let request = loop {
        match stream.read(&mut chunk).await {
            Ok(0) => match protocol::parse_at_eof(&buffer) {
                Ok(req) => break req,
                Err(e) => {
                    respond(&mut stream, Value::Null, Err(e)).await;
                    return;
                }
            },
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                match protocol::try_parse(&buffer) {
                    Ok(Some(req)) => break req,
                    Ok(None) => continue,
                    Err(e) => {
                        respond(&mut stream, Value::Null, Err(e)).await;
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "daemon connection read failed");
                return;
            }
        }
    };

    let id = request.id.clone();
    let method = request.method.clone();
    let server_name = request_server_name(&request);
    let (result, is_stop) = dispatch(&request, &runtime, &activity, &keep_alive_servers).await;

    let text = format!(
        "served {method}{} ok={}",
        server_name.as_deref().map(|s| format!(" server={s}")).unwrap_or_default(),
        result.is_ok()
    );
    match &server_name {
        Some(name) => logger.log_call(name, &text).await,
        None if logger.should_log_host_call() => logger.log(&text).await,
        None => {}
    }

    respond(&mut stream, id, result).await;

    if is_stop {
        stop.cancel();
    }
}

async fn respond(stream: &mut tokio::net::UnixStream, id: Value, result: Result<Value>) {
    let response = match result {
        Ok(value) => protocol::Response::ok(id, value),
        Err(e) => protocol::Response::err(id, &e),
    };
    if let Ok(bytes) = serde_json::to_vec(&response) {
        let _ = stream.write_all(&bytes).await;
    }
    let _ = stream.shutdown().await;
}

/// Best-effort extraction of a `server` field from the request params, used
/// only to decide per-server log filtering — dispatch re-validates it.
fn request_server_name(request: &protocol::Request) -> Option<String> {
    request
        .params
        .get("server")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[derive(Deserialize)]
struct ServerParam {
    server: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallToolParams {
    server: String,
    tool: String,
    #[serde(default)]
    arguments: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

async fn dispatch(
    request: &protocol::Request,
    runtime: &Runtime,
    activity: &Mutex<HashMap<String, ServerActivity>>,
    keep_alive_servers: &[String],
) -> (Result<Value>, bool) {
    match request.method.as_str() {
        protocol::METHOD_STATUS => (status(runtime, activity, keep_alive_servers).await, false),
        protocol::METHOD_CALL_TOOL => (
            call_tool(request, runtime, activity, keep_alive_servers).await,
            false,
        ),
        protocol::METHOD_LIST_TOOLS => (
            list_tools(request, runtime, activity, keep_alive_servers).await,
            false,
        ),
        protocol::METHOD_LIST_RESOURCES => (
            list_resources(request, runtime, activity, keep_alive_servers).await,
            false,
        ),
        protocol::METHOD_CLOSE_SERVER => (
            close_server(request, runtime, activity, keep_alive_servers).await,
            false,
        ),
        protocol::METHOD_STOP => (Ok(serde_json::json!({"stopping": true})), true),
        other => (Err(HubError::UnknownMethod(other.to_string())), false),
    }
}

fn ensure_managed(name: &str, keep_alive_servers: &[String]) -> Result<()> {
    if keep_alive_servers.iter().any(|s| s == name) {
        Ok(())
    } else {
        Err(HubError::RuntimeError(format!(
            "server '{name}' is not managed by the daemon"
        )))
    }
}

async fn mark_used(activity: &Mutex<HashMap<String, ServerActivity>>, name: &str) {
    let mut guard = activity.lock().await;
    let entry = guard.entry(name.to_string()).or_default();
    entry.connected = true;
    entry.last_used_at = Some(chrono::Utc::now());
}

async fn status(
    runtime: &Runtime,
    activity: &Mutex<HashMap<String, ServerActivity>>,
    keep_alive_servers: &[String],
) -> Result<Value> {
    let _ = runtime;
    let guard = activity.lock().await;
    let servers: HashMap<String, Value> = keep_alive_servers
        .iter()
        .map(|name| {
            let a = guard.get(name).cloned().unwrap_or_default();
            (
                name.clone(),
                serde_json::json!({"connected": a.connected, "lastUsedAt": a.last_used_at}),
            )
        })
        .collect();
    Ok(serde_json::json!({"managedServers": keep_alive_servers, "activity": servers}))
}

async fn call_tool(
    request: &protocol::Request,
    runtime: &Runtime,
    activity: &Mutex<HashMap<String, ServerActivity>>,
    keep_alive_servers: &[String],
) -> Result<Value> {
    let params: CallToolParams = serde_json::from_value(request.params.clone())?;
    ensure_managed(&params.server, keep_alive_servers)?;
    let timeout = params
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(crate::runtime::DEFAULT_CALL_TIMEOUT);
    let result = runtime
        .call_tool(&params.server, &params.tool, params.arguments, timeout)
        .await?;
    mark_used(activity, &params.server).await;
    Ok(serde_json::to_value(&result.0)?)
}

async fn list_tools(
    request: &protocol::Request,
    runtime: &Runtime,
    activity: &Mutex<HashMap<String, ServerActivity>>,
    keep_alive_servers: &[String],
) -> Result<Value> {
    let params: ServerParam = serde_json::from_value(request.params.clone())?;
    ensure_managed(&params.server, keep_alive_servers)?;
    let tools = runtime.list_tools(&params.server).await?;
    mark_used(activity, &params.server).await;
    Ok(serde_json::to_value(&tools)?)
}

async fn list_resources(
    request: &protocol::Request,
    runtime: &Runtime,
    activity: &Mutex<HashMap<String, ServerActivity>>,
    keep_alive_servers: &[String],
) -> Result<Value> {
    let params: ServerParam = serde_json::from_value(request.params.clone())?;
    ensure_managed(&params.server, keep_alive_servers)?;
    let resources = runtime.list_resources(&params.server).await?;
    mark_used(activity, &params.server).await;
    Ok(serde_json::to_value(&resources)?)
}

async fn close_server(
    request: &protocol::Request,
    runtime: &Runtime,
    activity: &Mutex<HashMap<String, ServerActivity>>,
    keep_alive_servers: &[String],
) -> Result<Value> {
    let params: ServerParam = serde_json::from_value(request.params.clone())?;
    ensure_managed(&params.server, keep_alive_servers)?;
    runtime.close(Some(&params.server)).await?;
    let mut guard = activity.lock().await;
    if let Some(entry) = guard.get_mut(&params.server) {
        entry.connected = false;
    }
    Ok(serde_json::json!({"closed": true}))
}

async fn run_idle_eviction(
    runtime: Arc<Runtime>,
    activity: Arc<Mutex<HashMap<String, ServerActivity>>>,
    keep_alive_servers: Vec<String>,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(IDLE_EVICTION_PERIOD);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {
                for name in &keep_alive_servers {
                    let Ok(def) = runtime.get_definition(name).await else { continue };
                    let idle_timeout_ms = match def.lifecycle {
                        Lifecycle::KeepAlive { idle_timeout_ms: Some(ms) } => ms,
                        _ => continue,
                    };

                    let should_evict = {
                        let guard = activity.lock().await;
                        match guard.get(name) {
                            Some(ServerActivity { connected: true, last_used_at: Some(last) }) => {
                                let elapsed_ms = chrono::Utc::now()
                                    .signed_duration_since(*last)
                                    .num_milliseconds()
                                    .max(0) as u64;
                                elapsed_ms >= idle_timeout_ms
                            }
                            _ => false,
                        }
                    };

                    if should_evict {
                        let _ = runtime.close(Some(name)).await;
                        let mut guard = activity.lock().await;
                        if let Some(entry) = guard.get_mut(name) {
                            entry.connected = false;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
        _ = sigquit.recv() => {}
    }
}

#[cfg(windows)]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_managed_rejects_unlisted_server() {
        let managed = vec!["a".to_string()];
        assert!(ensure_managed("a", &managed).is_ok());
        let err = ensure_managed("b", &managed).unwrap_err();
        assert!(err.to_string().contains("not managed"));
    }

    #[tokio::test]
    async fn idle_eviction_never_triggers_on_a_never_used_server() {
        let mut activity = HashMap::new();
        activity.insert("x".to_string(), ServerActivity::default());
        let guard = activity;
        assert!(!guard.get("x").unwrap().connected);
        assert!(guard.get("x").unwrap().last_used_at.is_none());
    }

    #[tokio::test]
    async fn default_log_path_is_deterministic_per_config() {
        let path = std::path::Path::new("/home/u/.mcporter/catalog.toml");
        let a = default_log_path(path);
        let b = default_log_path(path);
        assert_eq!(a, b);
    }

    fn stub_definition(name: &str, daemon_enabled: bool) -> ServerDefinition {
        ServerDefinition {
            name: name.to_string(),
            description: None,
            command: crate::catalog::Command::Stdio {
                executable: "true".into(),
                args: vec![],
                cwd: None,
            },
            env: HashMap::new(),
            auth: None,
            token_cache_dir: None,
            client_name: None,
            oauth_redirect_url: None,
            lifecycle: Lifecycle::Transient,
            logging: crate::catalog::LoggingConfig { daemon_enabled },
            source: "test".into(),
            sources: vec!["test".into()],
        }
    }

    #[test]
    fn logging_disabled_with_no_signal() {
        let resolved = resolve_logging(
            &LoggingOptions::default(),
            std::path::Path::new("/tmp/catalog.toml"),
            &[stub_definition("a", false)],
        );
        assert!(!resolved.enabled);
    }

    #[test]
    fn explicit_log_flag_enables_and_logs_all_servers() {
        let options = LoggingOptions {
            log: true,
            ..Default::default()
        };
        let resolved = resolve_logging(
            &options,
            std::path::Path::new("/tmp/catalog.toml"),
            &[stub_definition("a", false)],
        );
        assert!(resolved.enabled);
        assert!(resolved.log_all_servers);
    }

    #[test]
    fn per_server_opt_in_enables_without_logging_all_servers() {
        let resolved = resolve_logging(
            &LoggingOptions::default(),
            std::path::Path::new("/tmp/catalog.toml"),
            &[stub_definition("noisy", true), stub_definition("quiet", false)],
        );
        assert!(resolved.enabled);
        assert!(!resolved.log_all_servers);
        assert!(resolved.filter.contains("noisy"));
        assert!(!resolved.filter.contains("quiet"));
    }

    #[test]
    fn log_servers_flag_adds_to_filter_without_enabling_all() {
        let options = LoggingOptions {
            log_servers: vec!["picked".to_string()],
            ..Default::default()
        };
        let resolved = resolve_logging(
            &options,
            std::path::Path::new("/tmp/catalog.toml"),
            &[stub_definition("picked", false), stub_definition("other", false)],
        );
        assert!(resolved.enabled);
        assert!(!resolved.log_all_servers);
        assert!(resolved.filter.contains("picked"));
        assert!(!resolved.filter.contains("other"));
    }

    #[test]
    fn disabled_logger_filters_out_every_server() {
        let logger = DaemonLogger::disabled();
        assert!(!logger.should_log_server("anything"));
        assert!(!logger.should_log_host_call());
    }
}
