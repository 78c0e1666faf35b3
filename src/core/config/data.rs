//! The configuration tree.
//!
//! Several slots accept either a bare string or a full object on the
//! wire (`StringList`, `DynamicInstructions`, `AgentCall`, `EnvDef`,
//! `Field`); custom serde impls keep both forms round-trippable.

use crate::mcp::types::McpServer;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extends: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, EnvDef>,
    #[serde(default, skip_serializing_if = "Publish::is_empty")]
    pub publish: Publish,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub agents: HashMap<String, Agent>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub mcp_servers: HashMap<String, McpServer>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub flows: HashMap<String, Flow>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub profiles: HashMap<String, Config>,
}

/// A list slot that also accepts a single bare string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StringList(pub Vec<String>);

impl std::ops::Deref for StringList {
    type Target = Vec<String>;
    fn deref(&self) -> &Vec<String> {
        &self.0
    }
}

impl From<Vec<String>> for StringList {
    fn from(items: Vec<String>) -> Self {
        StringList(items)
    }
}

impl Serialize for StringList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StringList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(StringList(vec![s])),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    other => Err(D::Error::custom(format!("expected string, got {other}"))),
                })
                .collect::<Result<_, _>>()
                .map(StringList),
            Value::Null => Ok(StringList::default()),
            other => Err(D::Error::custom(format!(
                "expected string or list of strings, got {other}"
            ))),
        }
    }
}

/// Top-level env entry: a bare description string or the full form.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvDef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitive: Option<bool>,
    #[serde(default)]
    pub use_bearer_token: bool,
}

impl<'de> Deserialize<'de> for EnvDef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Full {
            #[serde(default)]
            default: String,
            #[serde(default)]
            description: String,
            #[serde(default)]
            options: Vec<String>,
            #[serde(default)]
            optional: bool,
            #[serde(default)]
            sensitive: Option<bool>,
            #[serde(default)]
            use_bearer_token: bool,
        }
        match Value::deserialize(deserializer)? {
            Value::String(description) => Ok(EnvDef {
                description,
                ..EnvDef::default()
            }),
            other => {
                let full: Full = serde_json::from_value(other).map_err(D::Error::custom)?;
                Ok(EnvDef {
                    default: full.default,
                    description: full.description,
                    options: full.options,
                    optional: full.optional,
                    sensitive: full.sensitive,
                    use_bearer_token: full.use_bearer_token,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Publish {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "DynamicInstructions::is_unset")]
    pub introduction: DynamicInstructions,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instructions: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: StringList,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prompts: StringList,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: StringList,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_templates: StringList,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: StringList,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub entrypoint: String,
}

impl Publish {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
            && self.entrypoint.is_empty()
            && self.tools.is_empty()
            && self.prompts.is_empty()
            && self.resources.is_empty()
            && self.resource_templates.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "DynamicInstructions::is_unset")]
    pub instructions: DynamicInstructions,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: StringList,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agents: StringList,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flows: StringList,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_history: Option<bool>,
    /// Provider-specific attributes keyed by published tool name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tool_extensions: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_choice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<SchemaDef>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub truncation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    // Selection criteria.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub cost: f64,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub speed: f64,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub intelligence: f64,
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "SchemaDef::is_empty")]
    pub input: SchemaDef,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_role: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "AgentCall::is_empty")]
    pub agent: AgentCall,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flow: String,
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub if_: Option<Value>,
    #[serde(rename = "while", default, skip_serializing_if = "Option::is_none")]
    pub while_: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub for_each_var: String,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub set: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
}

impl Step {
    /// The step's call target, if it has one.
    pub fn call(&self) -> Option<&str> {
        if !self.agent.name.is_empty() {
            Some(&self.agent.name)
        } else if !self.tool.is_empty() {
            Some(&self.tool)
        } else if !self.flow.is_empty() {
            Some(&self.flow)
        } else {
            None
        }
    }
}

/// An agent call site: a bare agent name or per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct AgentCall {
    pub name: String,
    pub output: Option<SchemaDef>,
    pub chat_history: Option<bool>,
    pub tool_choice: String,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
}

impl AgentCall {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
            && self.output.is_none()
            && self.chat_history.is_none()
            && self.tool_choice.is_empty()
            && self.temperature.is_none()
            && self.top_p.is_none()
    }
}

impl Serialize for AgentCall {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.output.is_none()
            && self.chat_history.is_none()
            && self.tool_choice.is_empty()
            && self.temperature.is_none()
            && self.top_p.is_none()
        {
            return self.name.serialize(serializer);
        }
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Full<'a> {
            name: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            output: &'a Option<SchemaDef>,
            #[serde(skip_serializing_if = "Option::is_none")]
            chat_history: &'a Option<bool>,
            #[serde(skip_serializing_if = "str::is_empty")]
            tool_choice: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            temperature: &'a Option<f64>,
            #[serde(skip_serializing_if = "Option::is_none")]
            top_p: &'a Option<f64>,
        }
        Full {
            name: &self.name,
            output: &self.output,
            chat_history: &self.chat_history,
            tool_choice: &self.tool_choice,
            temperature: &self.temperature,
            top_p: &self.top_p,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AgentCall {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Full {
            #[serde(default)]
            name: String,
            #[serde(default)]
            output: Option<SchemaDef>,
            #[serde(default)]
            chat_history: Option<bool>,
            #[serde(default)]
            tool_choice: String,
            #[serde(default)]
            temperature: Option<f64>,
            #[serde(default)]
            top_p: Option<f64>,
        }
        match Value::deserialize(deserializer)? {
            Value::String(name) => Ok(AgentCall {
                name,
                ..AgentCall::default()
            }),
            other => {
                let full: Full = serde_json::from_value(other).map_err(D::Error::custom)?;
                Ok(AgentCall {
                    name: full.name,
                    output: full.output,
                    chat_history: full.chat_history,
                    tool_choice: full.tool_choice,
                    temperature: full.temperature,
                    top_p: full.top_p,
                })
            }
        }
    }
}

/// A system prompt: a literal string or a `{mcpServer, prompt, args}`
/// reference resolved through `prompts/get`.
#[derive(Debug, Clone, Default)]
pub struct DynamicInstructions {
    pub instructions: String,
    pub mcp_server: String,
    pub prompt: String,
    pub args: HashMap<String, String>,
}

impl DynamicInstructions {
    pub fn is_prompt(&self) -> bool {
        !self.mcp_server.is_empty() && !self.prompt.is_empty()
    }

    pub fn is_set(&self) -> bool {
        self.is_prompt() || !self.instructions.is_empty()
    }

    pub fn is_unset(&self) -> bool {
        !self.is_set()
    }
}

impl Serialize for DynamicInstructions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !self.instructions.is_empty() {
            return self.instructions.serialize(serializer);
        }
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Full<'a> {
            mcp_server: &'a str,
            prompt: &'a str,
            #[serde(skip_serializing_if = "HashMap::is_empty")]
            args: &'a HashMap<String, String>,
        }
        Full {
            mcp_server: &self.mcp_server,
            prompt: &self.prompt,
            args: &self.args,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DynamicInstructions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Full {
            #[serde(default)]
            mcp_server: String,
            #[serde(default)]
            prompt: String,
            #[serde(default)]
            args: HashMap<String, String>,
        }
        match Value::deserialize(deserializer)? {
            Value::String(instructions) => Ok(DynamicInstructions {
                instructions,
                ..DynamicInstructions::default()
            }),
            other => {
                let full: Full = serde_json::from_value(other).map_err(D::Error::custom)?;
                Ok(DynamicInstructions {
                    instructions: String::new(),
                    mcp_server: full.mcp_server,
                    prompt: full.prompt,
                    args: full.args,
                })
            }
        }
    }
}

/// Schema declaration: a raw JSON schema or a shorthand field map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub schema: Value,
    #[serde(default)]
    pub strict: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub fields: HashMap<String, Field>,
}

impl SchemaDef {
    pub fn is_empty(&self) -> bool {
        self.schema.is_null() && self.fields.is_empty()
    }

    pub fn to_schema(&self) -> Value {
        if !self.fields.is_empty() {
            return build_simple_schema(&self.name, &self.description, &self.fields);
        }
        self.schema.clone()
    }
}

/// A shorthand field: a description string or nested fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Field {
    pub description: String,
    pub fields: HashMap<String, Field>,
}

impl Serialize for Field {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.fields.is_empty() {
            return self.description.serialize(serializer);
        }
        #[derive(Serialize)]
        struct Full<'a> {
            #[serde(skip_serializing_if = "str::is_empty")]
            description: &'a str,
            fields: &'a HashMap<String, Field>,
        }
        Full {
            description: &self.description,
            fields: &self.fields,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Field {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Full {
            #[serde(default)]
            description: String,
            #[serde(default)]
            fields: HashMap<String, Field>,
        }
        match Value::deserialize(deserializer)? {
            Value::String(description) => Ok(Field {
                description,
                fields: HashMap::new(),
            }),
            other => {
                let full: Full = serde_json::from_value(other).map_err(D::Error::custom)?;
                Ok(Field {
                    description: full.description,
                    fields: full.fields,
                })
            }
        }
    }
}

/// Expands the shorthand field map into a JSON schema. Field names may
/// carry a type suffix: `name[]`, `name(int)`, `name(number)`,
/// `name(bool)`; everything else is a string.
pub fn build_simple_schema(name: &str, description: &str, fields: &HashMap<String, Field>) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required: Vec<String> = Vec::new();

    let mut names: Vec<&String> = fields.keys().collect();
    names.sort();

    for raw_name in names {
        let field = &fields[raw_name];
        let (key, schema) = if let Some(base) = raw_name.strip_suffix("[]") {
            let items = if field.fields.is_empty() {
                serde_json::json!({"type": "string"})
            } else {
                build_simple_schema("", &field.description, &field.fields)
            };
            (
                base.to_string(),
                serde_json::json!({
                    "type": "array",
                    "description": field.description,
                    "items": items,
                }),
            )
        } else if let Some(base) = strip_type_suffix(raw_name, &["(int)", "(integer)"]) {
            (
                base,
                serde_json::json!({"type": "integer", "description": field.description}),
            )
        } else if let Some(base) = strip_type_suffix(raw_name, &["(float)", "(number)"]) {
            (
                base,
                serde_json::json!({"type": "number", "description": field.description}),
            )
        } else if let Some(base) = strip_type_suffix(raw_name, &["(bool)", "(boolean)"]) {
            (
                base,
                serde_json::json!({"type": "boolean", "description": field.description}),
            )
        } else if !field.fields.is_empty() {
            (
                raw_name.clone(),
                build_simple_schema("", &field.description, &field.fields),
            )
        } else {
            (
                raw_name.clone(),
                serde_json::json!({"type": "string", "description": field.description}),
            )
        };
        required.push(key.clone());
        properties.insert(key, schema);
    }

    let mut schema = serde_json::Map::new();
    schema.insert("type".to_string(), Value::String("object".to_string()));
    if !name.is_empty() {
        schema.insert("title".to_string(), Value::String(name.to_string()));
    }
    if !description.is_empty() {
        schema.insert(
            "description".to_string(),
            Value::String(description.to_string()),
        );
    }
    schema.insert("properties".to_string(), Value::Object(properties));
    schema.insert("required".to_string(), serde_json::json!(required));
    schema.insert("additionalProperties".to_string(), Value::Bool(false));
    Value::Object(schema)
}

fn strip_type_suffix(name: &str, suffixes: &[&str]) -> Option<String> {
    suffixes
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .map(|base| base.to_string())
}

/// A parsed `server[/tool][:alias]` reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolRef {
    pub server: String,
    pub tool: String,
    pub alias: String,
}

impl ToolRef {
    pub fn parse(reference: &str) -> ToolRef {
        let (name, alias) = match reference.split_once(':') {
            Some((name, alias)) => (name, alias),
            None => (reference, ""),
        };
        let (server, tool) = match name.split_once('/') {
            Some((server, tool)) => (server, tool),
            None => (name, ""),
        };
        ToolRef {
            server: server.to_string(),
            tool: tool.to_string(),
            alias: alias.to_string(),
        }
    }

    /// The name this reference publishes a target under.
    pub fn published_name(&self, name: &str) -> String {
        if !self.alias.is_empty() {
            self.alias.clone()
        } else if !self.tool.is_empty() {
            self.tool.clone()
        } else {
            name.to_string()
        }
    }
}

/// The fixed name the entrypoint agent is published under.
pub const AGENT_TOOL: &str = "agent";

/// The fixed chat-style input schema for agents published as tools.
pub fn chat_input_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "required": ["prompt"],
        "properties": {
            "prompt": {
                "description": "The input prompt",
                "type": "string"
            },
            "attachments": {
                "type": "array",
                "items": {
                    "description": "An attachment to the prompt (optional)",
                    "type": "object",
                    "required": ["url"],
                    "properties": {
                        "url": {
                            "description": "The URL of the attachment or data URI",
                            "type": "string"
                        },
                        "mimeType": {
                            "description": "The MIME type of the attachment",
                            "type": "string"
                        }
                    }
                }
            }
        }
    })
}

/// Arguments accepted by agent-backed tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleCallRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
}
