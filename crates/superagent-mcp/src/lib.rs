//! Superagent MCP - Model Context Protocol client
//!
//! This crate provides the MCP client used for stateful tool connections:
//! JSON-RPC framing, stdio and streamable-HTTP transports, and the
//! initialize / tools / ping request set.

pub mod client;
pub mod protocol;
pub mod transport;

use serde::{Deserialize, Serialize};

pub use client::{ClientInfo, McpClient, McpError, ServerInfo, ToolCallResult};
pub use transport::{HttpTransport, StdioTransport, Transport};

/// MCP protocol version
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Tool definition in MCP format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: serde_json::Value,
}

/// Server capabilities
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptsCapability>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsCapability {
    #[serde(rename = "listChanged", default)]
    pub list_changed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourcesCapability {
    #[serde(default)]
    pub subscribe: bool,
    #[serde(rename = "listChanged", default)]
    pub list_changed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptsCapability {
    #[serde(rename = "listChanged", default)]
    pub list_changed: bool,
}
