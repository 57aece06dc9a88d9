//! JSON-RPC 2.0 message types used by MCP

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP method names
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

/// JSON-RPC request identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

/// JSON-RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// JSON-RPC notification (no id, no response)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: None,
        }
    }
}

/// JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Whether a raw message is a response to `id` (as opposed to a server
/// notification or a server-initiated request interleaved on the stream).
pub fn is_response_to(message: &Value, id: &RequestId) -> bool {
    if message.get("method").is_some() {
        return false;
    }
    match message.get("id") {
        Some(raw) => serde_json::from_value::<RequestId>(raw.clone())
            .map(|got| &got == id)
            .unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_without_empty_params() {
        let request = JsonRpcRequest::new(RequestId::Number(7), methods::TOOLS_LIST);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 7);
        assert_eq!(json["method"], "tools/list");
        assert!(json.get("params").is_none());
    }

    #[test]
    fn response_matching_skips_notifications() {
        let id = RequestId::Number(3);
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/progress",
            "params": {}
        });
        let other = serde_json::json!({"jsonrpc": "2.0", "id": 2, "result": {}});
        let matching = serde_json::json!({"jsonrpc": "2.0", "id": 3, "result": {}});

        assert!(!is_response_to(&notification, &id));
        assert!(!is_response_to(&other, &id));
        assert!(is_response_to(&matching, &id));
    }

    #[test]
    fn string_ids_round_trip() {
        let response: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"abc","error":{"code":-32601,"message":"nope"}}"#)
                .unwrap();
        assert_eq!(response.id, Some(RequestId::String("abc".to_string())));
        assert_eq!(response.error.unwrap().code, -32601);
    }
}
