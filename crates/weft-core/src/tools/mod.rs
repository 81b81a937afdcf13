//! Tool manager interface — discoverable tool schemas and a uniform
//! invocation primitive.
//!
//! The engine is agnostic to what backs a tool server (an MCP endpoint, the
//! skill subsystem, an in-process function). Sources register into a
//! [`ToolRegistry`] under a server name; steps see a server-filtered view.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A discoverable tool: name, discovery text, and a JSON-schema parameter
/// description in the shape providers expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Failure surfaced by a tool invocation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("tool call '{tool}' failed: {message}")]
pub struct ToolError {
    pub tool: String,
    pub message: String,
}

impl ToolError {
    pub fn new(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Uniform tool capability: enumerate schemas, dispatch calls.
#[async_trait]
pub trait ToolManager: Send + Sync {
    fn list_tools(&self) -> Vec<ToolSchema>;

    async fn call(&self, name: &str, arguments: serde_json::Value) -> Result<String, ToolError>;
}

/// Aggregates tool sources under server names and serves filtered views.
///
/// Read-mostly: built once at engine init, rebuilt on configuration reload.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    servers: HashMap<String, Arc<dyn ToolManager>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, server: impl Into<String>, source: Arc<dyn ToolManager>) {
        self.servers.insert(server.into(), source);
    }

    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.keys().cloned().collect();
        names.sort();
        names
    }

    /// A view over a subset of servers.
    ///
    /// `None` exposes every registered server (inherit-everything);
    /// `Some(&[])` exposes nothing, matching a step that declared
    /// `servers: []`.
    pub fn view(&self, servers: Option<&[String]>) -> ToolView {
        let selected: Vec<Arc<dyn ToolManager>> = match servers {
            None => self.servers.values().cloned().collect(),
            Some(filter) => filter
                .iter()
                .filter_map(|name| self.servers.get(name).cloned())
                .collect(),
        };
        ToolView { sources: selected }
    }
}

/// A server-filtered window onto the registry.
#[derive(Clone)]
pub struct ToolView {
    sources: Vec<Arc<dyn ToolManager>>,
}

impl ToolView {
    pub fn empty() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl ToolManager for ToolView {
    fn list_tools(&self) -> Vec<ToolSchema> {
        self.sources
            .iter()
            .flat_map(|source| source.list_tools())
            .collect()
    }

    async fn call(&self, name: &str, arguments: serde_json::Value) -> Result<String, ToolError> {
        for source in &self.sources {
            if source.list_tools().iter().any(|t| t.name == name) {
                return source.call(name, arguments).await;
            }
        }
        Err(ToolError::new(name, "no registered tool by that name"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        tool: String,
    }

    #[async_trait]
    impl ToolManager for Echo {
        fn list_tools(&self) -> Vec<ToolSchema> {
            vec![ToolSchema {
                name: self.tool.clone(),
                description: "echoes arguments".into(),
                parameters: serde_json::json!({"type": "object"}),
            }]
        }

        async fn call(&self, name: &str, arguments: serde_json::Value) -> Result<String, ToolError> {
            if name == self.tool {
                Ok(arguments.to_string())
            } else {
                Err(ToolError::new(name, "unknown tool"))
            }
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register("alpha", Arc::new(Echo { tool: "a_echo".into() }));
        reg.register("beta", Arc::new(Echo { tool: "b_echo".into() }));
        reg
    }

    #[test]
    fn test_view_filtering() {
        let reg = registry();
        assert_eq!(reg.view(None).list_tools().len(), 2);
        assert_eq!(reg.view(Some(&[])).list_tools().len(), 0);

        let only_alpha = reg.view(Some(&["alpha".to_string()]));
        let tools = only_alpha.list_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "a_echo");
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_owning_server() {
        let reg = registry();
        let view = reg.view(None);
        let result = view
            .call("b_echo", serde_json::json!({"k": 1}))
            .await
            .unwrap();
        assert_eq!(result, "{\"k\":1}");

        let missing = view.call("nope", serde_json::json!({})).await;
        assert!(missing.is_err());
    }
}
