//! `KeepAliveRuntime`: wraps a base `Runtime`, routing calls for keep-alive
//! servers through the daemon (auto-launching it on demand) and retrying once
//! on a fatal failure.
//!
//! Grounded on the teacher's registry-level routing decisions (stdio vs HTTP
//! dispatch in `PorterRegistry`), generalized to a daemon-vs-direct routing
//! decision keyed on `lifecycle` instead of transport kind.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use rmcp::model::{CallToolResult, ListResourcesResult, Tool};
use tokio::sync::RwLock;

use crate::catalog::ServerDefinition;
use crate::daemon::{client, protocol};
use crate::error::Result;
use crate::mcp_client::CallResult;
use crate::runtime::Runtime;

pub struct KeepAliveRuntime {
    base: Runtime,
    config_path: PathBuf,
    socket_path: PathBuf,
    keep_alive_servers: RwLock<HashSet<String>>,
}

impl KeepAliveRuntime {
    pub fn new(
        base: Runtime,
        config_path: PathBuf,
        socket_path: PathBuf,
        keep_alive_servers: HashSet<String>,
    ) -> Self {
        KeepAliveRuntime {
            base,
            config_path,
            socket_path,
            keep_alive_servers: RwLock::new(keep_alive_servers),
        }
    }

    async fn uses_daemon(&self, name: &str) -> bool {
        self.keep_alive_servers.read().await.contains(name)
    }

    pub async fn list_servers(&self) -> Vec<String> {
        self.base.list_servers().await
    }

    pub async fn get_definition(&self, name: &str) -> Result<ServerDefinition> {
        self.base.get_definition(name).await
    }

    /// Register a definition with the base runtime and rebalance the
    /// keep-alive subset (§4.F).
    pub async fn register_definition(&self, def: ServerDefinition, overwrite: bool) -> Result<()> {
        let is_keep_alive = def.lifecycle.is_keep_alive();
        let name = def.name.clone();
        self.base.register_definition(def, overwrite).await?;
        let mut set = self.keep_alive_servers.write().await;
        if is_keep_alive {
            set.insert(name);
        } else {
            set.remove(&name);
        }
        Ok(())
    }

    /// Ensure the daemon is reachable, call `f`, and on a fatal (non-protocol)
    /// failure log a retry notice, issue `closeServer`, and call `f` once more.
    async fn via_daemon<F, Fut, T>(&self, name: &str, operation: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        client::ensure_daemon_running(&self.config_path, &self.socket_path).await?;

        match f().await {
            Ok(value) => Ok(value),
            Err(e) if e.is_non_fatal_protocol_error() => Err(e),
            Err(e) => {
                tracing::warn!(
                    server = %name,
                    operation = %operation,
                    error = %e,
                    "keep-alive call failed, restarting session and retrying once"
                );
                let _ = client::send_request(
                    &self.socket_path,
                    protocol::METHOD_CLOSE_SERVER,
                    serde_json::json!({"server": name}),
                )
                .await;
                f().await
            }
        }
    }

    pub async fn list_tools(&self, name: &str) -> Result<Vec<Tool>> {
        if self.uses_daemon(name).await {
            self.via_daemon(name, "listTools", || async {
                let result = client::send_request(
                    &self.socket_path,
                    protocol::METHOD_LIST_TOOLS,
                    serde_json::json!({"server": name}),
                )
                .await?;
                Ok(serde_json::from_value::<Vec<Tool>>(result)?)
            })
            .await
        } else {
            self.base.list_tools(name).await
        }
    }

    pub async fn list_resources(&self, name: &str) -> Result<ListResourcesResult> {
        if self.uses_daemon(name).await {
            self.via_daemon(name, "listResources", || async {
                let result = client::send_request(
                    &self.socket_path,
                    protocol::METHOD_LIST_RESOURCES,
                    serde_json::json!({"server": name}),
                )
                .await?;
                Ok(serde_json::from_value::<ListResourcesResult>(result)?)
            })
            .await
        } else {
            self.base.list_resources(name).await
        }
    }

    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
        timeout: Duration,
    ) -> Result<CallResult> {
        if self.uses_daemon(name).await {
            self.via_daemon(name, "callTool", || async {
                let params = serde_json::json!({
                    "server": name,
                    "tool": tool,
                    "arguments": arguments,
                    "timeoutMs": timeout.as_millis() as u64,
                });
                let result =
                    client::send_request(&self.socket_path, protocol::METHOD_CALL_TOOL, params).await?;
                Ok(CallResult(serde_json::from_value::<CallToolResult>(result)?))
            })
            .await
        } else {
            self.base.call_tool(name, tool, arguments, timeout).await
        }
    }

    /// Close one server or all. Keep-alive servers route through the daemon;
    /// everything else closes directly against the base runtime.
    pub async fn close(&self, name: Option<&str>) -> Result<()> {
        match name {
            Some(name) if self.uses_daemon(name).await => {
                client::send_request(
                    &self.socket_path,
                    protocol::METHOD_CLOSE_SERVER,
                    serde_json::json!({"server": name}),
                )
                .await?;
                Ok(())
            }
            Some(name) => self.base.close(Some(name)).await,
            None => self.base.close(None).await,
        }
    }
}
