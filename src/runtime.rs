//! `Runtime`: the registry of server definitions plus the connection pool of
//! live `McpClient`s, with single-flight `connect` and the schema cache.
//!
//! Grounded on the teacher's `PorterRegistry`, re-architected from eager
//! spawn-everything-at-startup to lazy on-demand `connect`, and from namespaced
//! flat tool aggregation to per-server operations (no cross-server tool namespace
//! exists anywhere in this design).

use std::collections::HashMap;
use std::time::Duration;

use rmcp::model::{CallToolRequestParams, ListResourcesResult, Tool};
use tokio::sync::{oneshot, Mutex, RwLock};

use crate::catalog::ServerDefinition;
use crate::error::{HubError, Result};
use crate::mcp_client::{CallResult, McpClient};
use crate::schema_cache;

/// Default per-call tool timeout when the caller does not specify one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

enum Slot {
    /// A connection attempt is in progress; late arrivals await its broadcast result.
    Connecting(Vec<oneshot::Sender<Result<()>>>),
    Ready(McpClient),
}

/// Registry of `ServerDefinition`s plus a pool of live `McpClient` sessions.
pub struct Runtime {
    definitions: RwLock<HashMap<String, ServerDefinition>>,
    order: RwLock<Vec<String>>,
    clients: Mutex<HashMap<String, Slot>>,
}

impl Runtime {
    pub fn new(definitions: Vec<ServerDefinition>) -> Self {
        let order = definitions.iter().map(|d| d.name.clone()).collect();
        let map = definitions.into_iter().map(|d| (d.name.clone(), d)).collect();
        Runtime {
            definitions: RwLock::new(map),
            order: RwLock::new(order),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub async fn list_servers(&self) -> Vec<String> {
        self.order.read().await.clone()
    }

    pub async fn get_definition(&self, name: &str) -> Result<ServerDefinition> {
        self.definitions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| HubError::UnknownServer(name.to_string()))
    }

    /// Register a new definition, or replace an existing one when `overwrite` is set.
    pub async fn register_definition(&self, def: ServerDefinition, overwrite: bool) -> Result<()> {
        let mut defs = self.definitions.write().await;
        if defs.contains_key(&def.name) && !overwrite {
            return Err(HubError::DuplicateServer(def.name));
        }
        let is_new = !defs.contains_key(&def.name);
        let name = def.name.clone();
        defs.insert(name.clone(), def);
        drop(defs);
        if is_new {
            self.order.write().await.push(name);
        }
        Ok(())
    }

    /// Connect to a server, reusing an existing ready session if present.
    ///
    /// Concurrent callers for the same name share one in-progress attempt:
    /// only the first caller actually dials out; the rest await its result.
    /// On failure, the slot is cleared so a later call tries again from scratch.
    pub async fn connect(&self, name: &str) -> Result<()> {
        let def = self.get_definition(name).await?;

        let wait_rx = {
            let mut clients = self.clients.lock().await;
            match clients.get_mut(name) {
                Some(Slot::Ready(_)) => return Ok(()),
                Some(Slot::Connecting(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    clients.insert(name.to_string(), Slot::Connecting(Vec::new()));
                    None
                }
            }
        };

        if let Some(rx) = wait_rx {
            return rx.await.unwrap_or(Err(HubError::RuntimeError(
                "connection attempt dropped".to_string(),
            )));
        }

        let result = McpClient::connect(&def).await;

        let mut clients = self.clients.lock().await;
        let waiters = match clients.remove(name) {
            Some(Slot::Connecting(waiters)) => waiters,
            other => {
                // Another path replaced the slot concurrently — put it back and bail.
                if let Some(slot) = other {
                    clients.insert(name.to_string(), slot);
                }
                Vec::new()
            }
        };

        match result {
            Ok(client) => {
                clients.insert(name.to_string(), Slot::Ready(client));
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                for waiter in waiters {
                    let _ = waiter.send(Err(HubError::RuntimeError(message.clone())));
                }
                Err(e)
            }
        }
    }

    async fn with_client<F, T>(&self, name: &str, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a McpClient) -> futures::future::BoxFuture<'a, Result<T>>,
    {
        self.connect(name).await?;
        let clients = self.clients.lock().await;
        match clients.get(name) {
            Some(Slot::Ready(client)) => f(client).await,
            _ => Err(HubError::TransportClosed(name.to_string(), None)),
        }
    }

    pub async fn list_tools(&self, name: &str) -> Result<Vec<Tool>> {
        let tools = self
            .with_client(name, |client| Box::pin(client.list_tools()))
            .await?;

        if let Ok(def) = self.get_definition(name).await {
            if let Some(dir) = def.effective_token_cache_dir() {
                let schemas: HashMap<String, serde_json::Value> = tools
                    .iter()
                    .map(|t| (t.name.to_string(), serde_json::to_value(&t.input_schema).unwrap_or_default()))
                    .collect();
                if let Err(e) = schema_cache::write(&dir, &schemas) {
                    tracing::debug!(server = %name, error = %e, "failed to write schema cache");
                }
            }
        }

        Ok(tools)
    }

    /// Read the on-disk schema cache without requiring a live connection.
    /// Advisory only — never consulted automatically by `list_tools`.
    pub async fn cached_schema(&self, name: &str) -> Option<schema_cache::SchemaCache> {
        let def = self.get_definition(name).await.ok()?;
        let dir = def.effective_token_cache_dir()?;
        schema_cache::read(&dir)
    }

    pub async fn list_resources(&self, name: &str) -> Result<ListResourcesResult> {
        self.with_client(name, |client| Box::pin(client.list_resources())).await
    }

    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
        timeout: Duration,
    ) -> Result<CallResult> {
        let def = self.get_definition(name).await?;
        let overlay = crate::env_subst::resolve_map(&def.env)?;

        let guard = EnvOverlayGuard::apply(&overlay);
        let result = self
            .with_client(name, move |client| {
                let params = CallToolRequestParams {
                    name: tool.to_string().into(),
                    arguments,
                    task: None,
                    meta: None,
                };
                Box::pin(client.call_tool(params, timeout))
            })
            .await;
        drop(guard);
        result
    }

    /// Close one server's session, or all sessions when `name` is `None`. Idempotent.
    pub async fn close(&self, name: Option<&str>) -> Result<()> {
        let mut clients = self.clients.lock().await;
        match name {
            Some(name) => {
                if let Some(Slot::Ready(mut client)) = clients.remove(name) {
                    client.close().await?;
                }
            }
            None => {
                for (_, slot) in clients.drain() {
                    if let Slot::Ready(mut client) = slot {
                        let _ = client.close().await;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Scoped ambient-environment overlay: sets only currently-unset keys and
/// removes exactly the keys it added, on every exit path including panics.
///
/// Grounded on the design note that ambient-env mutation, where unavoidable,
/// must be guarded by an explicit save/restore helper serialized by a
/// process-wide mutex (here, the `Runtime`'s call path serializes overlay
/// application by awaiting `with_client` sequentially per call).
struct EnvOverlayGuard {
    added_keys: Vec<String>,
}

impl EnvOverlayGuard {
    fn apply(overlay: &HashMap<String, String>) -> Self {
        let mut added_keys = Vec::new();
        for (key, value) in overlay {
            if std::env::var_os(key).is_none() {
                // SAFETY: guarded by this process-wide overlay discipline; the
                // guard always removes exactly the keys it added, on drop.
                unsafe { std::env::set_var(key, value) };
                added_keys.push(key.clone());
            }
        }
        EnvOverlayGuard { added_keys }
    }
}

impl Drop for EnvOverlayGuard {
    fn drop(&mut self) {
        for key in &self.added_keys {
            // SAFETY: see `apply`.
            unsafe { std::env::remove_var(key) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Command, Lifecycle, LoggingConfig};

    fn def(name: &str) -> ServerDefinition {
        ServerDefinition {
            name: name.to_string(),
            description: None,
            command: Command::Stdio {
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
            logging: LoggingConfig::default(),
            source: "test".into(),
            sources: vec!["test".into()],
        }
    }

    #[tokio::test]
    async fn list_servers_preserves_registration_order() {
        let runtime = Runtime::new(vec![def("b"), def("a"), def("c")]);
        assert_eq!(runtime.list_servers().await, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn get_definition_unknown_server_errors() {
        let runtime = Runtime::new(vec![]);
        let err = runtime.get_definition("ghost").await.unwrap_err();
        assert!(matches!(err, HubError::UnknownServer(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn register_definition_duplicate_without_overwrite_errors() {
        let runtime = Runtime::new(vec![def("a")]);
        let err = runtime
            .register_definition(def("a"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::DuplicateServer(name) if name == "a"));
    }

    #[tokio::test]
    async fn register_definition_overwrite_replaces_without_duplicating_order() {
        let runtime = Runtime::new(vec![def("a")]);
        runtime.register_definition(def("a"), true).await.unwrap();
        assert_eq!(runtime.list_servers().await, vec!["a"]);
    }

    #[tokio::test]
    async fn env_overlay_guard_sets_and_restores_only_added_keys() {
        // SAFETY: test-only; no other thread in this test touches this var.
        unsafe { std::env::remove_var("MCPHUB_TEST_OVERLAY_VAR") };
        let mut overlay = HashMap::new();
        overlay.insert("MCPHUB_TEST_OVERLAY_VAR".to_string(), "value".to_string());
        {
            let _guard = EnvOverlayGuard::apply(&overlay);
            assert_eq!(std::env::var("MCPHUB_TEST_OVERLAY_VAR").unwrap(), "value");
        }
        assert!(std::env::var("MCPHUB_TEST_OVERLAY_VAR").is_err());
    }

    #[tokio::test]
    async fn env_overlay_guard_never_clobbers_an_already_set_key() {
        // SAFETY: test-only.
        unsafe { std::env::set_var("MCPHUB_TEST_OVERLAY_VAR2", "preexisting") };
        let mut overlay = HashMap::new();
        overlay.insert("MCPHUB_TEST_OVERLAY_VAR2".to_string(), "overlay-value".to_string());
        {
            let _guard = EnvOverlayGuard::apply(&overlay);
            assert_eq!(std::env::var("MCPHUB_TEST_OVERLAY_VAR2").unwrap(), "preexisting");
        }
        assert_eq!(std::env::var("MCPHUB_TEST_OVERLAY_VAR2").unwrap(), "preexisting");
        // SAFETY: test-only cleanup.
        unsafe { std::env::remove_var("MCPHUB_TEST_OVERLAY_VAR2") };
    }
}
