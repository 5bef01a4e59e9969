//! Error types shared across the runtime, transports, and the daemon.

use thiserror::Error;

/// Main error type for mcphub operations.
#[derive(Error, Debug)]
pub enum HubError {
    /// No server is registered under this name.
    #[error("unknown server: {0}")]
    UnknownServer(String),

    /// A server definition with this name already exists and `overwrite` was not set.
    #[error("duplicate server: {0}")]
    DuplicateServer(String),

    /// Neither `command` nor `url` was given for a server definition.
    #[error("server '{0}' must declare exactly one of 'command' or 'url'")]
    MissingCommandOrUrl(String),

    /// One or more `${VAR}` / `$env:VAR` placeholders referenced unset variables.
    #[error("missing environment variable(s): {0:?}")]
    MissingEnv(Vec<String>),

    /// The transport was already closed (or the process already exited) when a call was issued.
    #[error("server '{0}' transport closed (exit code: {1:?})")]
    TransportClosed(String, Option<i32>),

    /// Writing to the transport failed — usually a closed stdin pipe.
    #[error("write to server '{0}' failed: {1}")]
    TransportWriteError(String, String),

    /// The server process or connection never reached a ready state.
    #[error("server '{server}' failed to start ({command}, exit code: {exit_code:?}): {stderr_tail}")]
    StartupFailed {
        server: String,
        command: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    /// MCP protocol error: malformed request. Non-fatal for keep-alive retry purposes.
    #[error("invalid request to server '{0}': {1}")]
    InvalidRequest(String, String),

    /// MCP protocol error: no such tool/resource/method. Non-fatal for keep-alive retry purposes.
    #[error("method not found on server '{0}': {1}")]
    MethodNotFound(String, String),

    /// MCP protocol error: bad parameters. Non-fatal for keep-alive retry purposes.
    #[error("invalid params for server '{0}': {1}")]
    InvalidParams(String, String),

    /// A call exceeded its allotted timeout.
    #[error("call to server '{0}' timed out")]
    TimeoutError(String),

    /// The server requires OAuth authorization that has not been completed.
    #[error("server '{0}' requires authorization")]
    AuthRequired(String),

    /// The OAuth loopback callback received a `state` parameter that did not match.
    #[error("oauth callback rejected: state parameter mismatch")]
    AuthCallbackStateMismatch,

    /// Auto-launching the daemon did not produce a responsive socket within the deadline.
    #[error("daemon did not become ready within the startup deadline")]
    DaemonStartTimeout,

    /// Daemon protocol envelope error: the client sent zero bytes.
    #[error("empty_request")]
    EmptyRequest,

    /// Daemon protocol envelope error: the request body was not valid JSON.
    #[error("invalid_json: {0}")]
    InvalidJsonRequest(String),

    /// Daemon protocol envelope error: the request named a method the host does not implement.
    #[error("unknown_method: {0}")]
    UnknownMethod(String),

    /// Daemon protocol envelope error: a lower-level error wrapped for transit over the socket.
    #[error("runtime_error: {0}")]
    RuntimeError(String),

    /// Underlying I/O failure (spawn, socket, file).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HubError {
    /// MCP protocol errors that the keep-alive wrapper treats as non-fatal: the session is
    /// reusable and the call itself simply did not succeed. Everything else is fatal and
    /// triggers a `closeServer` + single retry (see `keepalive`).
    pub fn is_non_fatal_protocol_error(&self) -> bool {
        matches!(
            self,
            HubError::InvalidRequest(_, _) | HubError::MethodNotFound(_, _) | HubError::InvalidParams(_, _)
        )
    }

    /// The stable error code used in the daemon's `{ok:false, error:{code,...}}` envelope.
    pub fn daemon_code(&self) -> &'static str {
        match self {
            HubError::EmptyRequest => "empty_request",
            HubError::InvalidJsonRequest(_) => "invalid_json",
            HubError::UnknownMethod(_) => "unknown_method",
            _ => "runtime_error",
        }
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_fatal_set_is_exactly_three_protocol_errors() {
        assert!(HubError::InvalidRequest("s".into(), "m".into()).is_non_fatal_protocol_error());
        assert!(HubError::MethodNotFound("s".into(), "m".into()).is_non_fatal_protocol_error());
        assert!(HubError::InvalidParams("s".into(), "m".into()).is_non_fatal_protocol_error());
        assert!(!HubError::TimeoutError("s".into()).is_non_fatal_protocol_error());
        assert!(!HubError::TransportClosed("s".into(), None).is_non_fatal_protocol_error());
    }

    #[test]
    fn daemon_envelope_codes() {
        assert_eq!(HubError::EmptyRequest.daemon_code(), "empty_request");
        assert_eq!(
            HubError::InvalidJsonRequest("oops".into()).daemon_code(),
            "invalid_json"
        );
        assert_eq!(
            HubError::UnknownMethod("frobnicate".into()).daemon_code(),
            "unknown_method"
        );
        assert_eq!(
            HubError::UnknownServer("x".into()).daemon_code(),
            "runtime_error"
        );
    }

    #[test]
    fn missing_env_display_lists_names() {
        let err = HubError::MissingEnv(vec!["A".into(), "B".into()]);
        assert!(err.to_string().contains('A'));
        assert!(err.to_string().contains('B'));
    }
}
