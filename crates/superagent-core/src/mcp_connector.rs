//! MCP servers as stateful session connections
//!
//! Connects, handshakes and discovers tools inside the connection's owner
//! task; `tools/list` doubles as the health check.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use superagent_mcp::{
    ClientInfo, HttpTransport, McpClient, McpError, ServerInfo, StdioTransport, ToolCallResult,
    Transport,
};

use crate::config::{ConnectionConfig, TransportKind};
use crate::session::{Connection, Connector, Session};

/// Information about a tool provided by an MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolInfo {
    /// Tool name
    pub name: String,
    /// Tool description
    pub description: String,
    /// Input schema (JSON Schema)
    pub input_schema: Value,
    /// Server that provides this tool
    pub server: String,
}

/// Establishes an MCP connection from its configuration
#[derive(Debug, Clone)]
pub struct McpConnector {
    name: String,
    config: ConnectionConfig,
    client_info: ClientInfo,
}

impl McpConnector {
    pub fn new(name: impl Into<String>, config: ConnectionConfig) -> Self {
        Self {
            name: name.into(),
            config,
            client_info: ClientInfo::default(),
        }
    }

    pub fn with_client_info(mut self, client_info: ClientInfo) -> Self {
        self.client_info = client_info;
        self
    }

    async fn open_transport(&self) -> anyhow::Result<Box<dyn Transport>> {
        match self.config.transport {
            TransportKind::Stdio => {
                let command = self.config.command.as_deref().unwrap_or_default();
                let transport =
                    StdioTransport::spawn(command, &self.config.args, &self.config.env).await?;
                Ok(Box::new(transport))
            }
            TransportKind::Http => {
                let url = self.config.url.clone().unwrap_or_default();
                Ok(Box::new(HttpTransport::new(url, self.config.headers.clone())))
            }
        }
    }
}

#[async_trait]
impl Connector for McpConnector {
    type Connection = McpConnection;

    async fn connect(&self) -> anyhow::Result<McpConnection> {
        self.config.validate(&self.name)?;

        let transport = self.open_transport().await?;
        let mut client = McpClient::new(transport);
        let server = client.initialize(self.client_info.clone()).await?;
        debug!(connection = %self.name, server = %server.name, version = %server.version, "MCP handshake done");

        let tools = client
            .list_tools()
            .await?
            .into_iter()
            .map(|tool| McpToolInfo {
                name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema,
                server: self.name.clone(),
            })
            .collect::<Vec<_>>();
        info!(connection = %self.name, tools = tools.len(), "MCP server connected");

        Ok(McpConnection {
            name: self.name.clone(),
            client,
            server,
            tools,
        })
    }
}

/// A live MCP client session
pub struct McpConnection {
    name: String,
    client: McpClient<Box<dyn Transport>>,
    server: ServerInfo,
    tools: Vec<McpToolInfo>,
}

impl McpConnection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server
    }

    /// Tools discovered at connect time
    pub fn tools(&self) -> &[McpToolInfo] {
        &self.tools
    }

    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        self.client.call_tool(tool, arguments).await
    }
}

#[async_trait]
impl Connection for McpConnection {
    async fn health_check(&self) -> anyhow::Result<()> {
        self.client.list_tools().await?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.client.close().await?;
        Ok(())
    }
}

impl Session {
    /// Acquire an MCP connection described by `config`
    pub async fn acquire_configured(
        &self,
        name: &str,
        config: &ConnectionConfig,
    ) -> Option<Arc<McpConnection>> {
        self.acquire(name, McpConnector::new(name, config.clone())).await
    }
}
