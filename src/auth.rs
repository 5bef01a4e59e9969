//! `AuthProvider`: the OAuth collaborator abstraction, plus the one piece of the
//! OAuth flow this crate implements directly — the loopback authorization-code
//! callback listener and its `state` verification.
//!
//! Token exchange, refresh, and the on-disk token cache are out of scope; a real
//! `AuthProvider` implementation supplies those. Grounded on the teacher's axum
//! usage in `cli/src/main.rs` (the `serve` subcommand's router) for the listener
//! shape, generalized from "serve the aggregator" to "serve one redirect".

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::oneshot;

use crate::error::{HubError, Result};

/// Acquires (but does not cache or refresh) an OAuth access token for a server.
#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync {
    /// Exchange an authorization code (obtained via `LoopbackCallback`) for a token.
    async fn exchange_code(&self, server: &str, code: &str) -> Result<String>;
}

#[derive(Debug, serde::Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

struct CallbackState {
    expected_state: String,
    result: std::sync::Mutex<Option<oneshot::Sender<Result<String>>>>,
}

/// A one-shot local HTTP listener for an OAuth authorization-code redirect.
///
/// Binds to the port in the server's `oauth_redirect_url`, accepts exactly one
/// callback, verifies `state`, and resolves `wait_for_authorization_code`.
pub struct LoopbackCallback {
    addr: std::net::SocketAddr,
    expected_state: String,
}

impl LoopbackCallback {
    pub fn new(addr: std::net::SocketAddr, expected_state: impl Into<String>) -> Self {
        LoopbackCallback {
            addr,
            expected_state: expected_state.into(),
        }
    }

    /// Start listening and return the authorization code from the first valid
    /// callback. A `state` mismatch responds with HTTP 400 and this call errors
    /// with `AuthCallbackStateMismatch` — the message mentions "state" per the
    /// documented boundary behavior.
    pub async fn wait_for_authorization_code(self) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(CallbackState {
            expected_state: self.expected_state,
            result: std::sync::Mutex::new(Some(tx)),
        });

        let app = Router::new()
            .route("/callback", get(handle_callback))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(HubError::Io)?;

        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let outcome = rx
            .await
            .unwrap_or_else(|_| Err(HubError::RuntimeError("callback channel dropped".into())));
        server.abort();
        outcome
    }
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let mut guard = state.result.lock().expect("callback state poisoned");
    let Some(sender) = guard.take() else {
        return Html("already handled").into_response();
    };

    if let Some(err) = params.error {
        let _ = sender.send(Err(HubError::RuntimeError(format!("authorization denied: {err}"))));
        return Html("authorization denied").into_response();
    }

    let Some(returned_state) = params.state else {
        let _ = sender.send(Err(HubError::AuthCallbackStateMismatch));
        return (axum::http::StatusCode::BAD_REQUEST, "missing state").into_response();
    };

    if returned_state != state.expected_state {
        let _ = sender.send(Err(HubError::AuthCallbackStateMismatch));
        return (axum::http::StatusCode::BAD_REQUEST, "state parameter mismatch").into_response();
    }

    match params.code {
        Some(code) => {
            let _ = sender.send(Ok(code));
            Html("<html><body>authorization complete, you may close this window</body></html>")
                .into_response()
        }
        None => {
            let _ = sender.send(Err(HubError::RuntimeError("callback missing code".into())));
            (axum::http::StatusCode::BAD_REQUEST, "missing code").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mismatched_state_is_rejected_with_state_in_message() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let callback = LoopbackCallback::new(addr, "expected-state-123");
        let handle = tokio::spawn(callback.wait_for_authorization_code());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let resp = reqwest::get(format!(
            "http://{addr}/callback?code=abc&state=wrong-state"
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        let result = handle.await.unwrap();
        let err = result.unwrap_err();
        assert!(matches!(err, HubError::AuthCallbackStateMismatch));
        assert!(err.to_string().contains("state"));
    }

    #[tokio::test]
    async fn matching_state_resolves_with_code() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let callback = LoopbackCallback::new(addr, "match-me");
        let handle = tokio::spawn(callback.wait_for_authorization_code());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let resp = reqwest::get(format!("http://{addr}/callback?code=the-code&state=match-me"))
            .await
            .unwrap();
        assert!(resp.status().is_success());

        let code = handle.await.unwrap().unwrap();
        assert_eq!(code, "the-code");
    }
}
