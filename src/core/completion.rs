//! Provider-agnostic completion model.
//!
//! One conversation item union covers both request input and response
//! output; adapters translate it to their provider's shape. The
//! [`Completer`] trait is the seam between the agent driver and any
//! LLM backend.

use crate::error::Result;
use crate::mcp::session::Session;
use crate::mcp::types::{CallToolResult, Content, ModelPreferences};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<CompletionItem>,
    #[serde(default)]
    pub model_preferences: ModelPreferences,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_choice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<OutputSchema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub truncation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolUseDefinition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<CompletionItem>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
}

/// One conversation item. The `type` tag is the single discriminant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CompletionItem {
    #[serde(rename_all = "camelCase")]
    Message { role: String, content: Vec<Content> },
    ToolCall(ToolCall),
    ToolCallOutput(ToolCallOutput),
    Reasoning(Reasoning),
}

impl CompletionItem {
    pub fn user_text(text: impl Into<String>) -> Self {
        CompletionItem::Message {
            role: "user".to_string(),
            content: vec![Content::text(text)],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        CompletionItem::Message {
            role: "assistant".to_string(),
            content: vec![Content::text(text)],
        }
    }

    /// Whether a response item may be echoed back as next-turn input.
    /// Raw reasoning streams must not be replayed to the provider.
    pub fn echoable(&self) -> bool {
        !matches!(self, CompletionItem::Reasoning(_))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub call_id: String,
    pub name: String,
    /// Raw JSON-encoded arguments as emitted by the model.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arguments: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallOutput {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_role: String,
    #[serde(default)]
    pub output: CallToolResult,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reasoning {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encrypted_content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub summary: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutputSchema {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub schema: Value,
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseDefinition {
    pub name: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Provider-specific attributes; never serialized onto the wire.
    #[serde(skip)]
    pub attributes: Option<Value>,
}

#[derive(Clone, Default)]
pub struct CompletionOptions {
    pub progress_token: Option<Value>,
    /// Provider deltas, republished upward by the sampler.
    pub progress: Option<mpsc::UnboundedSender<Value>>,
    /// Per-call override of the agent's chat-history flag.
    pub chat_history: Option<bool>,
}

#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(
        &self,
        session: &Arc<Session>,
        req: CompletionRequest,
        opts: CompletionOptions,
    ) -> Result<CompletionResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn item_union_uses_type_tag() {
        let call = CompletionItem::ToolCall(ToolCall {
            call_id: "c1".to_string(),
            name: "add".to_string(),
            arguments: r#"{"a":2,"b":3}"#.to_string(),
            ..ToolCall::default()
        });
        let value = serde_json::to_value(&call).expect("serialize");
        assert_eq!(value["type"], json!("toolCall"));
        assert_eq!(value["callId"], json!("c1"));

        let back: CompletionItem = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, call);
    }

    #[test]
    fn reasoning_items_are_not_echoable() {
        let reasoning = CompletionItem::Reasoning(Reasoning {
            id: "r1".to_string(),
            ..Reasoning::default()
        });
        assert!(!reasoning.echoable());
        assert!(CompletionItem::user_text("hi").echoable());
    }

    #[test]
    fn tool_attributes_stay_off_the_wire() {
        let def = ToolUseDefinition {
            name: "browser".to_string(),
            parameters: json!({"type": "object"}),
            description: String::new(),
            attributes: Some(json!({"type": "computer_use_preview"})),
        };
        let value = serde_json::to_value(&def).expect("serialize");
        assert!(value.get("attributes").is_none());
    }
}
