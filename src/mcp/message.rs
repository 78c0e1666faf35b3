//! JSON-RPC 2.0 envelope.
//!
//! One struct covers requests (`id` + `method`), notifications (`method`
//! only), and responses (`id` + `result` or `error`). Params and results
//! stay as `serde_json::Value` until a handler decodes them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC code for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl Message {
    pub fn request(id: Value, method: &str, params: Option<Value>) -> Self {
        Message {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: Some(method.to_string()),
            params,
            ..Message::default()
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Message {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: Some(method.to_string()),
            params,
            ..Message::default()
        }
    }

    pub fn response(id: Value, result: Value) -> Self {
        Message {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            ..Message::default()
        }
    }

    pub fn error_response(id: Option<Value>, error: RpcError) -> Self {
        Message {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error: Some(error),
            ..Message::default()
        }
    }

    /// A request carries both an id and a method.
    pub fn is_request(&self) -> bool {
        self.id.is_some() && self.method.is_some()
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none() && self.method.is_some()
    }

    /// A response carries an id and either a result or an error.
    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    /// Reads `params._meta.progressToken`, if present.
    pub fn progress_token(&self) -> Option<Value> {
        let token = self.params.as_ref()?.get("_meta")?.get("progressToken")?;
        if token.is_null() {
            None
        } else {
            Some(token.clone())
        }
    }

    /// Injects a progress token under `params._meta.progressToken`,
    /// creating the surrounding objects as needed.
    pub fn set_progress_token(&mut self, token: Value) {
        let params = self
            .params
            .get_or_insert_with(|| Value::Object(serde_json::Map::new()));
        let Some(map) = params.as_object_mut() else {
            return;
        };
        let meta = map
            .entry("_meta".to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("progressToken".to_string(), token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_round_trips() {
        let msg = Message::request(json!("abc"), "tools/call", Some(json!({"name": "echo"})));
        let text = serde_json::to_string(&msg).expect("serialize");
        let back: Message = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back.id, Some(json!("abc")));
        assert_eq!(back.method.as_deref(), Some("tools/call"));
        assert_eq!(back.params, Some(json!({"name": "echo"})));
        assert!(back.result.is_none());
        assert!(back.error.is_none());
    }

    #[test]
    fn notification_omits_id() {
        let msg = Message::notification("notifications/initialized", None);
        let text = serde_json::to_string(&msg).expect("serialize");
        assert!(!text.contains("\"id\""));
        assert!(msg.is_notification());
        assert!(!msg.is_request());
    }

    #[test]
    fn progress_token_round_trips() {
        let mut msg = Message::request(json!(1), "tools/call", Some(json!({"name": "x"})));
        assert!(msg.progress_token().is_none());
        msg.set_progress_token(json!("tok-1"));
        assert_eq!(msg.progress_token(), Some(json!("tok-1")));
        // Existing params survive the injection.
        assert_eq!(msg.params.as_ref().unwrap()["name"], json!("x"));
    }

    #[test]
    fn progress_token_set_without_params() {
        let mut msg = Message::request(json!(1), "ping", None);
        msg.set_progress_token(json!(7));
        assert_eq!(msg.progress_token(), Some(json!(7)));
    }

    #[test]
    fn response_classification() {
        let ok = Message::response(json!(1), json!({}));
        assert!(ok.is_response());
        let err = Message::error_response(Some(json!(1)), RpcError::new(METHOD_NOT_FOUND, "nope"));
        assert!(err.is_response());
        assert!(!ok.is_request());
    }
}
