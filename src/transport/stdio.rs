//! Stdio Transport Supervisor: owns a spawned child MCP process end to end.
//!
//! Grounded on the teacher's `server/stdio.rs` spawn/pipe/filter machinery, with
//! the lifecycle re-architected around an explicit three-step escalating shutdown
//! instead of an immediate `child.kill()`, and the restart/backoff loop removed
//! (continuous restart is a daemon/keep-alive concern, not a transport concern).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Command as CatalogCommand, ServerDefinition};
use crate::error::{HubError, Result};

/// Step 1: destroy streams, cancel readers, wait for exit.
pub const CLOSE_STEP1_WAIT: Duration = Duration::from_millis(700);
/// Step 2: polite termination signal, wait for exit.
pub const CLOSE_STEP2_WAIT: Duration = Duration::from_millis(700);
/// Step 3: forceful termination signal, final wait.
pub const CLOSE_STEP3_WAIT: Duration = Duration::from_millis(500);

/// Controls whether a dead child's captured stderr is printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPolicy {
    Auto,
    Always,
    Silent,
}

const POLICY_AUTO: u8 = 0;
const POLICY_ALWAYS: u8 = 1;
const POLICY_SILENT: u8 = 2;

/// Process-wide runtime-selected policy, mutated by `LogPolicy::set_current`.
/// Starts at `Auto` until a caller (e.g. a CLI flag) changes it.
static CURRENT_POLICY: AtomicU8 = AtomicU8::new(POLICY_AUTO);

impl LogPolicy {
    /// The environment flag that forces `Always` and makes runtime mutation a no-op.
    pub const FORCE_ENV_VAR: &'static str = "MCPHUB_STDIO_LOG_ALWAYS";

    fn env_forced() -> bool {
        std::env::var(Self::FORCE_ENV_VAR).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
    }

    /// The effective policy: the env flag wins when set, otherwise the current
    /// runtime-selected value (`Auto` until `set_current` is called).
    pub fn from_env() -> Self {
        Self::current()
    }

    /// The effective policy: the env flag wins when set, otherwise the current
    /// runtime-selected value.
    pub fn current() -> Self {
        if Self::env_forced() {
            return LogPolicy::Always;
        }
        match CURRENT_POLICY.load(Ordering::Relaxed) {
            POLICY_ALWAYS => LogPolicy::Always,
            POLICY_SILENT => LogPolicy::Silent,
            _ => LogPolicy::Auto,
        }
    }

    /// Mutate the process-wide runtime policy. A no-op while the force-env-var
    /// is set, so the env flag always wins regardless of call order.
    pub fn set_current(policy: LogPolicy) {
        if Self::env_forced() {
            return;
        }
        let value = match policy {
            LogPolicy::Auto => POLICY_AUTO,
            LogPolicy::Always => POLICY_ALWAYS,
            LogPolicy::Silent => POLICY_SILENT,
        };
        CURRENT_POLICY.store(value, Ordering::Relaxed);
    }

    /// Whether the forced-always environment flag is set — when true, callers
    /// must not let runtime configuration change the effective policy.
    pub fn is_forced(&self) -> bool {
        Self::env_forced()
    }

    pub fn should_surface(&self, stderr_nonempty: bool, exit_code: Option<i32>) -> bool {
        match self {
            LogPolicy::Silent => false,
            LogPolicy::Always => stderr_nonempty,
            LogPolicy::Auto => stderr_nonempty && matches!(exit_code, Some(code) if code != 0),
        }
    }
}

/// Per-process bookkeeping, owned by value on the supervisor — no weak-map indirection.
#[derive(Debug, Default)]
pub struct ProcessStreamMeta {
    pub command: String,
    pub stderr_chunks: Vec<String>,
    pub exit_code: Option<i32>,
    pub flushed: bool,
}

impl ProcessStreamMeta {
    fn stderr_joined(&self) -> String {
        self.stderr_chunks.join("\n")
    }

    pub fn stderr_tail(&self, max_chunks: usize) -> String {
        self.stderr_chunks
            .iter()
            .rev()
            .take(max_chunks)
            .rev()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Owns one spawned child process and its three standard streams.
///
/// Callers must drop the MCP client session (which owns the stdin write half
/// and the filtered stdout reader) before calling `close` — step 1 of the
/// escalation assumes those handles are already gone and only waits out the
/// stdout/stderr drain tasks via `io_cancel` plus the process itself.
pub struct StdioSupervisor {
    name: String,
    child: Child,
    meta: Arc<Mutex<ProcessStreamMeta>>,
    io_cancel: CancellationToken,
    log_policy: LogPolicy,
}

/// The byte-level conduit handed to the MCP client session.
pub type TransportIo = (tokio::io::ReadHalf<tokio::io::DuplexStream>, ChildStdin);

fn build_command(def: &ServerDefinition) -> Result<(Command, String)> {
    let CatalogCommand::Stdio { executable, args, cwd } = &def.command else {
        return Err(HubError::MissingCommandOrUrl(def.name.clone()));
    };

    let resolved_env = crate::env_subst::resolve_map(&def.env)?;

    let mut cmd = Command::new(executable);
    cmd.args(args);
    cmd.envs(resolved_env);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let label = std::iter::once(executable.clone())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ");
    Ok((cmd, label))
}

/// Filters non-JSON noise out of the child's stdout before it reaches the MCP
/// client session. Mixed stdout (banners, progress bars) is common among
/// poorly-behaved stdio MCP servers.
fn start_stdout_filter(
    stdout: tokio::process::ChildStdout,
    name: String,
    cancel: CancellationToken,
) -> tokio::io::ReadHalf<tokio::io::DuplexStream> {
    let (client_side, server_side) = tokio::io::duplex(65536);
    let (reader, _unused_client_writer) = tokio::io::split(client_side);
    let (_unused_server_reader, mut writer) = tokio::io::split(server_side);

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if serde_json::from_str::<serde_json::Value>(&line).is_ok() {
                                let framed = format!("{line}\n");
                                if writer.write_all(framed.as_bytes()).await.is_err() {
                                    break;
                                }
                            } else {
                                tracing::debug!(server = %name, %line, "discarding non-JSON stdout line");
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    });

    reader
}

fn start_stderr_drain(
    stderr: tokio::process::ChildStderr,
    name: String,
    meta: Arc<Mutex<ProcessStreamMeta>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            tracing::debug!(server = %name, %line, "server stderr");
                            meta.lock().await.stderr_chunks.push(line);
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    });
}

impl StdioSupervisor {
    /// Spawn the child and wire its three streams. On success the returned
    /// `TransportIo` is ready for an MCP client session to speak JSON-RPC over.
    pub fn spawn(def: &ServerDefinition, log_policy: LogPolicy) -> Result<(Self, TransportIo)> {
        let (mut cmd, label) = build_command(def)?;
        let mut child = cmd
            .spawn()
            .map_err(|e| HubError::StartupFailed {
                server: def.name.clone(),
                command: label.clone(),
                exit_code: None,
                stderr_tail: e.to_string(),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| HubError::StartupFailed {
            server: def.name.clone(),
            command: label.clone(),
            exit_code: None,
            stderr_tail: "failed to open stdin pipe".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| HubError::StartupFailed {
            server: def.name.clone(),
            command: label.clone(),
            exit_code: None,
            stderr_tail: "failed to open stdout pipe".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| HubError::StartupFailed {
            server: def.name.clone(),
            command: label.clone(),
            exit_code: None,
            stderr_tail: "failed to open stderr pipe".to_string(),
        })?;

        let meta = Arc::new(Mutex::new(ProcessStreamMeta {
            command: label,
            ..Default::default()
        }));
        let io_cancel = CancellationToken::new();

        let reader = start_stdout_filter(stdout, def.name.clone(), io_cancel.child_token());
        start_stderr_drain(stderr, def.name.clone(), meta.clone(), io_cancel.child_token());

        let supervisor = StdioSupervisor {
            name: def.name.clone(),
            child,
            meta,
            io_cancel,
            log_policy,
        };

        Ok((supervisor, (reader, stdin)))
    }

    /// Idempotent escalating shutdown. Always returns, even if the child never exits.
    pub async fn close(mut self) -> Option<i32> {
        self.io_cancel.cancel();

        if let Ok(status) = tokio::time::timeout(CLOSE_STEP1_WAIT, self.child.wait()).await {
            return self.finish(status.ok().and_then(exit_code)).await;
        }

        send_terminate(&self.child);
        if let Ok(status) = tokio::time::timeout(CLOSE_STEP2_WAIT, self.child.wait()).await {
            return self.finish(status.ok().and_then(exit_code)).await;
        }

        let _ = self.child.start_kill();
        let status = tokio::time::timeout(CLOSE_STEP3_WAIT, self.child.wait()).await;
        self.finish(status.ok().and_then(|r| r.ok()).and_then(exit_code))
            .await
    }

    async fn finish(&mut self, exit_code: Option<i32>) -> Option<i32> {
        let mut meta = self.meta.lock().await;
        meta.exit_code = exit_code;
        if !meta.flushed {
            meta.flushed = true;
            let stderr = meta.stderr_joined();
            if self
                .log_policy
                .should_surface(!stderr.is_empty(), exit_code)
            {
                tracing::warn!(server = %self.name, command = %meta.command, exit_code = ?exit_code, "{}", stderr);
            }
        }
        exit_code
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    status.code()
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is a live child PID we own; SIGTERM is a well-defined signal.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(windows)]
fn send_terminate(_child: &Child) {
    // Windows has no polite-termination signal distinct from forceful kill;
    // the step-3 `start_kill` call covers both steps 2 and 3.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_policy_boundary_table() {
        assert!(LogPolicy::Auto.should_surface(true, Some(1)));
        assert!(!LogPolicy::Auto.should_surface(true, Some(0)));
        assert!(!LogPolicy::Auto.should_surface(false, Some(1)));
        assert!(LogPolicy::Always.should_surface(true, Some(0)));
        assert!(!LogPolicy::Always.should_surface(false, Some(0)));
        assert!(!LogPolicy::Silent.should_surface(true, Some(2)));
    }

    #[test]
    fn set_current_changes_the_effective_policy() {
        // SAFETY: test-only, single-threaded assertion around this var.
        unsafe { std::env::remove_var(LogPolicy::FORCE_ENV_VAR) };
        LogPolicy::set_current(LogPolicy::Silent);
        assert_eq!(LogPolicy::current(), LogPolicy::Silent);
        LogPolicy::set_current(LogPolicy::Always);
        assert_eq!(LogPolicy::current(), LogPolicy::Always);
        LogPolicy::set_current(LogPolicy::Auto);
        assert_eq!(LogPolicy::current(), LogPolicy::Auto);
    }

    #[test]
    fn forced_env_var_makes_set_current_a_no_op() {
        // SAFETY: test-only, single-threaded assertion around this var.
        unsafe { std::env::set_var(LogPolicy::FORCE_ENV_VAR, "1") };
        LogPolicy::set_current(LogPolicy::Silent);
        assert_eq!(LogPolicy::current(), LogPolicy::Always);
        assert!(LogPolicy::current().is_forced());
        // SAFETY: test-only cleanup.
        unsafe { std::env::remove_var(LogPolicy::FORCE_ENV_VAR) };
        LogPolicy::set_current(LogPolicy::Auto);
    }

    #[test]
    fn stderr_tail_keeps_last_n_chunks() {
        let mut meta = ProcessStreamMeta::default();
        for i in 0..10 {
            meta.stderr_chunks.push(format!("line{i}"));
        }
        let tail = meta.stderr_tail(3);
        assert_eq!(tail, "line7\nline8\nline9");
    }

    #[tokio::test]
    async fn spawn_missing_executable_reports_startup_failed() {
        let def = ServerDefinition {
            name: "ghost".into(),
            description: None,
            command: CatalogCommand::Stdio {
                executable: "/no/such/executable-mcphub-test".into(),
                args: vec![],
                cwd: None,
            },
            env: std::collections::HashMap::new(),
            auth: None,
            token_cache_dir: None,
            client_name: None,
            oauth_redirect_url: None,
            lifecycle: crate::catalog::Lifecycle::Transient,
            logging: crate::catalog::LoggingConfig::default(),
            source: "test".into(),
            sources: vec!["test".into()],
        };
        let result = StdioSupervisor::spawn(&def, LogPolicy::Silent);
        assert!(matches!(result, Err(HubError::StartupFailed { .. })));
    }

    #[tokio::test]
    async fn close_reaps_a_real_child_within_step1() {
        let def = ServerDefinition {
            name: "sleeper".into(),
            description: None,
            command: CatalogCommand::Stdio {
                executable: "true".into(),
                args: vec![],
                cwd: None,
            },
            env: std::collections::HashMap::new(),
            auth: None,
            token_cache_dir: None,
            client_name: None,
            oauth_redirect_url: None,
            lifecycle: crate::catalog::Lifecycle::Transient,
            logging: crate::catalog::LoggingConfig::default(),
            source: "test".into(),
            sources: vec!["test".into()],
        };
        let (supervisor, _io) = StdioSupervisor::spawn(&def, LogPolicy::Silent).unwrap();
        let code = supervisor.close().await;
        assert_eq!(code, Some(0));
    }
}
