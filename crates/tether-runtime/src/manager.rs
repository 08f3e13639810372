//! The manager facade: the runtime's only public surface.
//!
//! Holds the current server set (deduplicated by id, insertion order kept)
//! and routes operations through the pool with an acquire/release bracket.
//! Aggregate operations swallow per-server failures and return partial
//! results; targeted operations report their error verbatim.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::broadcast;

use tether_session::{McpSession, PromptInfo, ResourceInfo, ToolInfo};
use tether_types::{McpConfig, McpError, McpEvent, PoolConfig, ServerConfig};

use crate::pool::SessionPool;

/// Facade over a fleet of MCP servers.
pub struct McpManager {
    pool: Arc<SessionPool>,
    servers: StdMutex<Vec<ServerConfig>>,
}

impl McpManager {
    pub fn new(pool_config: PoolConfig) -> Self {
        Self {
            pool: SessionPool::new(pool_config),
            servers: StdMutex::new(Vec::new()),
        }
    }

    /// Build a manager preloaded with a configuration's server set.
    pub fn from_config(config: &McpConfig, pool_config: PoolConfig) -> Self {
        let manager = Self::new(pool_config);
        manager.set_servers(config.servers.clone());
        manager
    }

    /// Replace the known server set. Later duplicates of an id are dropped
    /// with a log line; order is otherwise preserved.
    pub fn set_servers(&self, configs: Vec<ServerConfig>) {
        let mut unique: Vec<ServerConfig> = Vec::with_capacity(configs.len());
        for config in configs {
            if unique.iter().any(|existing| existing.id == config.id) {
                tracing::warn!(server_id = %config.id, "duplicate server id, keeping the first");
                continue;
            }
            unique.push(config);
        }
        *self.servers.lock().unwrap_or_else(|e| e.into_inner()) = unique;
    }

    /// The known servers, in insertion order.
    pub fn servers(&self) -> Vec<ServerConfig> {
        self.servers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn server_config(&self, server_id: &str) -> Result<ServerConfig, McpError> {
        self.servers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|config| config.id == server_id)
            .cloned()
            .ok_or_else(|| McpError::UnknownServer(server_id.to_string()))
    }

    /// Subscribe to lifecycle events for the whole fleet.
    pub fn subscribe(&self) -> broadcast::Receiver<McpEvent> {
        self.pool.subscribe()
    }

    /// Acquire-use-release bracket; release runs even when `f`'s result is
    /// an error.
    async fn with_session<T, F, Fut>(&self, server_id: &str, f: F) -> Result<T, McpError>
    where
        F: FnOnce(Arc<McpSession>) -> Fut,
        Fut: std::future::Future<Output = Result<T, McpError>>,
    {
        let config = self.server_config(server_id)?;
        let session = self.pool.acquire(&config).await?;
        let result = f(session).await;
        self.pool.release(server_id).await;
        result
    }

    /// Find the first server exposing a tool with this name, scanning in
    /// insertion order. Per-server failures are logged, not propagated.
    pub async fn find_tool(&self, name: &str) -> Option<(String, ToolInfo)> {
        for config in self.servers() {
            let found = self
                .with_session(&config.id, |session| async move {
                    session.list_tools().await
                })
                .await;
            match found {
                Ok(tools) => {
                    if let Some(tool) = tools.into_iter().find(|t| t.name == name) {
                        return Some((config.id, tool));
                    }
                }
                Err(e) => {
                    tracing::warn!(server_id = %config.id, error = %e, "skipping server during tool lookup");
                }
            }
        }
        None
    }

    /// All tools across all servers; settle-all, partial results on failure.
    pub async fn list_tools(&self) -> Vec<(String, ToolInfo)> {
        let lookups = self.servers().into_iter().map(|config| async move {
            let tools = self
                .with_session(&config.id, |session| async move {
                    session.list_tools().await
                })
                .await;
            (config.id, tools)
        });

        let mut all = Vec::new();
        for (server_id, tools) in join_all(lookups).await {
            match tools {
                Ok(tools) => {
                    all.extend(tools.into_iter().map(|t| (server_id.clone(), t)));
                }
                Err(e) => {
                    tracing::warn!(server_id = %server_id, error = %e, "tool listing failed");
                }
            }
        }
        all
    }

    /// Resources for one server, or fanned out across all of them.
    pub async fn list_resources(&self, server_id: Option<&str>) -> Vec<(String, ResourceInfo)> {
        let targets = match server_id {
            Some(id) => self
                .servers()
                .into_iter()
                .filter(|c| c.id == id)
                .collect::<Vec<_>>(),
            None => self.servers(),
        };

        let lookups = targets.into_iter().map(|config| async move {
            let resources = self
                .with_session(&config.id, |session| async move {
                    session.list_resources().await
                })
                .await;
            (config.id, resources)
        });

        let mut all = Vec::new();
        for (server_id, resources) in join_all(lookups).await {
            match resources {
                Ok(resources) => {
                    all.extend(resources.into_iter().map(|r| (server_id.clone(), r)));
                }
                Err(e) => {
                    tracing::warn!(server_id = %server_id, error = %e, "resource listing failed");
                }
            }
        }
        all
    }

    /// Prompts across all servers; settle-all like the other aggregates.
    pub async fn list_prompts(&self) -> Vec<(String, PromptInfo)> {
        let lookups = self.servers().into_iter().map(|config| async move {
            let prompts = self
                .with_session(&config.id, |session| async move {
                    session.list_prompts().await
                })
                .await;
            (config.id, prompts)
        });

        let mut all = Vec::new();
        for (server_id, prompts) in join_all(lookups).await {
            match prompts {
                Ok(prompts) => {
                    all.extend(prompts.into_iter().map(|p| (server_id.clone(), p)));
                }
                Err(e) => {
                    tracing::debug!(server_id = %server_id, error = %e, "prompt listing failed");
                }
            }
        }
        all
    }

    /// Run a tool on a specific server. Targeted: errors reach the caller.
    pub async fn execute_tool(
        &self,
        server_id: &str,
        name: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        self.with_session(server_id, |session| async move {
            session.execute_tool(name, arguments).await
        })
        .await
    }

    /// Read a resource from a specific server. Targeted.
    pub async fn get_resource(&self, server_id: &str, uri: &str) -> Result<Value, McpError> {
        self.with_session(server_id, |session| async move {
            session.get_resource(uri).await
        })
        .await
    }

    /// Fetch a prompt from a specific server. Targeted.
    pub async fn get_prompt(
        &self,
        server_id: &str,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, McpError> {
        self.with_session(server_id, |session| async move {
            session.get_prompt(name, arguments).await
        })
        .await
    }

    /// Probe one server; every error coalesces to `false`.
    pub async fn test_connection(&self, server_id: &str) -> bool {
        self.with_session(server_id, |session| async move {
            Ok(session.ping().await)
        })
        .await
        .unwrap_or(false)
    }

    /// Ping every pooled session; see [`SessionPool::health_check`].
    pub async fn health_check(&self) -> HashMap<String, bool> {
        self.pool.health_check().await
    }

    /// Dispose the pool and disconnect every session.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
