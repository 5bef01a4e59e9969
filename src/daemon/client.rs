//! Client side of the daemon protocol: send one request, read one response,
//! probe whether a daemon is alive, and auto-launch one when it is not.
//!
//! Grounded on the teacher's detached-process spawn pattern for its own
//! background workers, adapted to the status-then-spawn probe described in
//! the component design's daemon auto-launch behavior.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::daemon::protocol;
use crate::error::{HubError, Result};

/// Set on the daemon host process itself so the auto-launch path never recurses
/// when a keep-alive call happens to run from inside the daemon.
pub const INSIDE_DAEMON_ENV: &str = "MCPORTER_DAEMON_CHILD";

const AUTO_LAUNCH_POLL_INTERVAL: Duration = Duration::from_millis(100);
const AUTO_LAUNCH_DEADLINE: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    ok: bool,
    #[serde(default)]
    result: Value,
    error: Option<ClientErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ClientErrorBody {
    code: String,
    message: String,
}

/// Send one request and return its `result` value, or a `RuntimeError` wrapping
/// the daemon's reported code and message on failure.
#[cfg(unix)]
pub async fn send_request(socket_path: &Path, method: &str, params: Value) -> Result<Value> {
    let mut stream = tokio::net::UnixStream::connect(socket_path)
        .await
        .map_err(HubError::Io)?;

    let request = serde_json::json!({"id": 1, "method": method, "params": params});
    let bytes = serde_json::to_vec(&request)?;
    stream.write_all(&bytes).await.map_err(HubError::Io)?;
    stream.shutdown().await.map_err(HubError::Io)?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.map_err(HubError::Io)?;

    let envelope: ResponseEnvelope = serde_json::from_slice(&buf)?;
    if envelope.ok {
        Ok(envelope.result)
    } else {
        let body = envelope.error.unwrap_or(ClientErrorBody {
            code: "runtime_error".to_string(),
            message: "daemon returned no error detail".to_string(),
        });
        Err(HubError::RuntimeError(format!("{}: {}", body.code, body.message)))
    }
}

/// Named-pipe transport is not implemented in this build; Windows callers get a
/// clear `RuntimeError` instead of a silent no-op.
#[cfg(windows)]
pub async fn send_request(_socket_path: &Path, _method: &str, _params: Value) -> Result<Value> {
    Err(HubError::RuntimeError(
        "daemon socket transport is not implemented on this platform".to_string(),
    ))
}

/// Whether a daemon is alive and responsive at `socket_path`. Any failure
/// (connection refused, timeout, malformed response) counts as "not running".
pub async fn probe_status(socket_path: &Path) -> bool {
    tokio::time::timeout(
        PROBE_TIMEOUT,
        send_request(socket_path, protocol::METHOD_STATUS, serde_json::json!({})),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false)
}

/// Spawn a detached daemon host re-executing the current binary with
/// `daemon start --foreground`. Refuses if already running inside a daemon
/// process, preventing the soft auto-launch cycle described in the design notes.
pub fn spawn_daemon(config_path: &Path) -> Result<()> {
    if std::env::var_os(INSIDE_DAEMON_ENV).is_some() {
        return Err(HubError::RuntimeError(
            "refusing to auto-launch a daemon from inside the daemon process".to_string(),
        ));
    }

    let exe = std::env::current_exe().map_err(HubError::Io)?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("daemon")
        .arg("start")
        .arg("--foreground")
        .arg("--config")
        .arg(config_path)
        .env(INSIDE_DAEMON_ENV, "1")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    command.spawn().map_err(HubError::Io)?;
    Ok(())
}

/// Probe, and if absent, spawn-and-poll until the daemon responds or
/// `AUTO_LAUNCH_DEADLINE` elapses.
pub async fn ensure_daemon_running(config_path: &Path, socket_path: &Path) -> Result<()> {
    if probe_status(socket_path).await {
        return Ok(());
    }

    spawn_daemon(config_path)?;

    let deadline = tokio::time::Instant::now() + AUTO_LAUNCH_DEADLINE;
    while tokio::time::Instant::now() < deadline {
        if probe_status(socket_path).await {
            return Ok(());
        }
        tokio::time::sleep(AUTO_LAUNCH_POLL_INTERVAL).await;
    }
    Err(HubError::DaemonStartTimeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_status_against_nonexistent_socket_is_false() {
        let path = std::env::temp_dir().join("mcphub-test-no-such-socket.sock");
        assert!(!probe_status(&path).await);
    }

    #[test]
    fn spawn_daemon_refuses_when_already_inside_daemon() {
        // SAFETY: test-only, single-threaded assertion around this var.
        unsafe { std::env::set_var(INSIDE_DAEMON_ENV, "1") };
        let err = spawn_daemon(Path::new("/tmp/catalog.toml")).unwrap_err();
        assert!(matches!(err, HubError::RuntimeError(_)));
        // SAFETY: test-only cleanup.
        unsafe { std::env::remove_var(INSIDE_DAEMON_ENV) };
    }
}
