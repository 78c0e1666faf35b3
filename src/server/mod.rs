//! Top-level MCP dispatch.
//!
//! `initialize` resolves the publish block into tool, prompt, resource,
//! and resource-template mappings and caches them on the session; the
//! remaining methods are table lookups plus a registry or client call.

pub mod uri_template;

use crate::error::{Error, Result};
use crate::mcp::message::{Message, RpcError, INTERNAL_ERROR, METHOD_NOT_FOUND};
use crate::mcp::session::{MessageHandler, Session};
use crate::mcp::types::{
    CallToolRequest, GetPromptRequest, InitializeRequest, InitializeResult, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, LoggingCapability,
    PromptsCapability, ReadResourceRequest, ResourcesCapability, ServerCapabilities, ServerInfo,
    ToolsCapability,
};
use crate::runtime::Runtime;
use crate::tools::{CallOptions, TargetDescriptor, TargetMapping, ToolMappings};
use crate::core::config::ToolRef;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

const TOOL_MAPPING_KEY: &str = "toolMapping";
const PROMPT_MAPPING_KEY: &str = "promptMapping";
const RESOURCE_MAPPING_KEY: &str = "resourceMapping";
const RESOURCE_TEMPLATE_MAPPING_KEY: &str = "resourceTemplateMapping";

pub struct Server {
    runtime: Arc<Runtime>,
}

impl Server {
    pub fn new(runtime: Arc<Runtime>) -> Arc<Server> {
        Arc::new(Server { runtime })
    }

    async fn dispatch(
        &self,
        session: &Arc<Session>,
        msg: &Message,
        method: &str,
    ) -> Result<Option<Value>> {
        match method {
            "initialize" => {
                let payload: InitializeRequest = decode_params(msg)?;
                self.handle_initialize(session, payload).await.map(Some)
            }
            "ping" => Ok(Some(Value::Object(serde_json::Map::new()))),
            "tools/list" => self.handle_list_tools(session).map(Some),
            "tools/call" => {
                let payload: CallToolRequest = decode_params(msg)?;
                self.handle_call_tool(session, msg, payload).await.map(Some)
            }
            "prompts/list" => self.handle_list_prompts(session).map(Some),
            "prompts/get" => {
                let payload: GetPromptRequest = decode_params(msg)?;
                self.handle_get_prompt(session, payload).await.map(Some)
            }
            "resources/list" => self.handle_list_resources(session).map(Some),
            "resources/templates/list" => self.handle_list_resource_templates(session).map(Some),
            "resources/read" => {
                let payload: ReadResourceRequest = decode_params(msg)?;
                self.handle_read_resource(session, payload).await.map(Some)
            }
            method if method.starts_with("notifications/") => Ok(None),
            method => Err(Error::Rpc {
                code: METHOD_NOT_FOUND,
                message: format!("method {method:?} not found"),
            }),
        }
    }

    async fn handle_initialize(
        &self,
        session: &Arc<Session>,
        payload: InitializeRequest,
    ) -> Result<Value> {
        let config = self.runtime.config().clone();

        // Env defaults seed the session before anything substitutes.
        for (key, def) in &config.env {
            if !def.default.is_empty() && !session.env_map().contains_key(key) {
                session.set_env(key.clone(), def.default.clone());
            }
        }

        let mut tool_mappings = self
            .runtime
            .registry()
            .build_tool_mappings(session, &config.publish.tools)
            .await?;
        let entrypoint = self
            .runtime
            .registry()
            .get_entry_point(session, &tool_mappings)
            .await?;
        tool_mappings.insert(crate::core::config::AGENT_TOOL.to_string(), entrypoint);
        set_mappings(session, TOOL_MAPPING_KEY, &tool_mappings)?;

        let prompt_mappings = self.build_prompt_mappings(session, &config).await?;
        set_mappings(session, PROMPT_MAPPING_KEY, &prompt_mappings)?;

        let resource_mappings = self.build_resource_mappings(session, &config).await?;
        set_mappings(session, RESOURCE_MAPPING_KEY, &resource_mappings)?;

        let template_mappings = self.build_resource_template_mappings(session, &config).await?;
        set_mappings(session, RESOURCE_TEMPLATE_MAPPING_KEY, &template_mappings)?;

        let result = InitializeResult {
            protocol_version: payload.protocol_version,
            capabilities: ServerCapabilities {
                logging: Some(LoggingCapability {}),
                prompts: Some(PromptsCapability::default()),
                resources: Some(ResourcesCapability::default()),
                tools: Some(ToolsCapability::default()),
            },
            server_info: ServerInfo {
                name: config.publish.name.clone(),
                version: config.publish.version.clone(),
            },
            instructions: config.publish.instructions.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn build_prompt_mappings(
        &self,
        session: &Arc<Session>,
        config: &crate::core::config::Config,
    ) -> Result<ToolMappings> {
        let mut cached: HashMap<String, ListPromptsResult> = HashMap::new();
        let mut result = ToolMappings::new();

        for reference in config.publish.prompts.iter() {
            let tool_ref = ToolRef::parse(reference);
            if tool_ref.server.is_empty() {
                continue;
            }

            if !cached.contains_key(&tool_ref.server) {
                let client = self
                    .runtime
                    .registry()
                    .get_client(session, &tool_ref.server)
                    .await?;
                let prompts = client.list_prompts().await.map_err(|err| {
                    Error::semantic(format!(
                        "failed to get prompts for server {}: {err}",
                        tool_ref.server
                    ))
                })?;
                cached.insert(tool_ref.server.clone(), prompts);
            }

            for prompt in &cached[&tool_ref.server].prompts {
                if tool_ref.tool.is_empty() || prompt.name == tool_ref.tool {
                    result.insert(
                        tool_ref.published_name(&prompt.name),
                        TargetMapping {
                            mcp_server: tool_ref.server.clone(),
                            target_name: prompt.name.clone(),
                            target: TargetDescriptor::Prompt(prompt.clone()),
                        },
                    );
                }
            }
        }

        Ok(result)
    }

    async fn build_resource_mappings(
        &self,
        session: &Arc<Session>,
        config: &crate::core::config::Config,
    ) -> Result<ToolMappings> {
        let mut result = ToolMappings::new();
        for reference in config.publish.resources.iter() {
            let tool_ref = ToolRef::parse(reference);
            if tool_ref.server.is_empty() {
                continue;
            }
            let client = self
                .runtime
                .registry()
                .get_client(session, &tool_ref.server)
                .await?;
            let resources = client.list_resources().await.map_err(|err| {
                Error::semantic(format!(
                    "failed to get resources for server {}: {err}",
                    tool_ref.server
                ))
            })?;
            for resource in resources.resources {
                result.insert(
                    tool_ref.published_name(&resource.uri),
                    TargetMapping {
                        mcp_server: tool_ref.server.clone(),
                        target_name: resource.uri.clone(),
                        target: TargetDescriptor::Resource(resource),
                    },
                );
            }
        }
        Ok(result)
    }

    async fn build_resource_template_mappings(
        &self,
        session: &Arc<Session>,
        config: &crate::core::config::Config,
    ) -> Result<ToolMappings> {
        let mut result = ToolMappings::new();
        for reference in config.publish.resource_templates.iter() {
            let tool_ref = ToolRef::parse(reference);
            if tool_ref.server.is_empty() {
                continue;
            }
            let client = self
                .runtime
                .registry()
                .get_client(session, &tool_ref.server)
                .await?;
            let templates = client.list_resource_templates().await.map_err(|err| {
                Error::semantic(format!(
                    "failed to get resource templates for server {}: {err}",
                    tool_ref.server
                ))
            })?;
            for template in templates.resource_templates {
                // Compiles now to reject bad templates at initialize.
                uri_template::compile(&template.uri_template)?;
                result.insert(
                    tool_ref.published_name(&template.uri_template),
                    TargetMapping {
                        mcp_server: tool_ref.server.clone(),
                        target_name: template.uri_template.clone(),
                        target: TargetDescriptor::ResourceTemplate(template),
                    },
                );
            }
        }
        Ok(result)
    }

    fn handle_list_tools(&self, session: &Arc<Session>) -> Result<Value> {
        let mappings = get_mappings(session, TOOL_MAPPING_KEY);
        let mut names: Vec<&String> = mappings.keys().collect();
        names.sort();

        let tools = names
            .into_iter()
            .filter_map(|name| mappings[name].target.as_tool().cloned())
            .collect();
        Ok(serde_json::to_value(ListToolsResult { tools })?)
    }

    async fn handle_call_tool(
        &self,
        session: &Arc<Session>,
        msg: &Message,
        payload: CallToolRequest,
    ) -> Result<Value> {
        let mappings = get_mappings(session, TOOL_MAPPING_KEY);
        let Some(mapping) = mappings.get(&payload.name) else {
            return Err(Error::semantic(format!("tool {} not found", payload.name)));
        };

        let result = self
            .runtime
            .registry()
            .call(
                session,
                &mapping.mcp_server,
                &mapping.target_name,
                payload.arguments.unwrap_or(Value::Null),
                CallOptions {
                    progress_token: msg.progress_token(),
                    ..CallOptions::default()
                },
            )
            .await?;
        Ok(serde_json::to_value(result)?)
    }

    fn handle_list_prompts(&self, session: &Arc<Session>) -> Result<Value> {
        let mappings = get_mappings(session, PROMPT_MAPPING_KEY);
        let mut names: Vec<&String> = mappings.keys().collect();
        names.sort();

        let prompts = names
            .into_iter()
            .filter_map(|name| match &mappings[name].target {
                TargetDescriptor::Prompt(prompt) => Some(prompt.clone()),
                _ => None,
            })
            .collect();
        Ok(serde_json::to_value(ListPromptsResult { prompts })?)
    }

    async fn handle_get_prompt(
        &self,
        session: &Arc<Session>,
        payload: GetPromptRequest,
    ) -> Result<Value> {
        let mappings = get_mappings(session, PROMPT_MAPPING_KEY);
        let Some(mapping) = mappings.get(&payload.name) else {
            return Err(Error::semantic(format!(
                "prompt {} not found",
                payload.name
            )));
        };

        let client = self
            .runtime
            .registry()
            .get_client(session, &mapping.mcp_server)
            .await?;
        let result = client
            .get_prompt(&mapping.target_name, payload.arguments)
            .await?;
        Ok(serde_json::to_value(result)?)
    }

    fn handle_list_resources(&self, session: &Arc<Session>) -> Result<Value> {
        let mappings = get_mappings(session, RESOURCE_MAPPING_KEY);
        let mut names: Vec<&String> = mappings.keys().collect();
        names.sort();

        let resources = names
            .into_iter()
            .filter_map(|name| match &mappings[name].target {
                TargetDescriptor::Resource(resource) => Some(resource.clone()),
                _ => None,
            })
            .collect();
        Ok(serde_json::to_value(ListResourcesResult { resources })?)
    }

    fn handle_list_resource_templates(&self, session: &Arc<Session>) -> Result<Value> {
        let mappings = get_mappings(session, RESOURCE_TEMPLATE_MAPPING_KEY);
        let mut names: Vec<&String> = mappings.keys().collect();
        names.sort();

        let resource_templates = names
            .into_iter()
            .filter_map(|name| match &mappings[name].target {
                TargetDescriptor::ResourceTemplate(template) => Some(template.clone()),
                _ => None,
            })
            .collect();
        Ok(serde_json::to_value(ListResourceTemplatesResult {
            resource_templates,
        })?)
    }

    /// Exact URI match first, then the templates in name order until
    /// one regex matches.
    async fn handle_read_resource(
        &self,
        session: &Arc<Session>,
        payload: ReadResourceRequest,
    ) -> Result<Value> {
        let mappings = get_mappings(session, RESOURCE_MAPPING_KEY);
        let mapping = match mappings.get(&payload.uri) {
            Some(mapping) => mapping.clone(),
            None => {
                let templates = get_mappings(session, RESOURCE_TEMPLATE_MAPPING_KEY);
                match_template(&templates, &payload.uri)
                    .ok_or_else(|| Error::semantic(format!("resource {} not found", payload.uri)))?
            }
        };

        let client = self
            .runtime
            .registry()
            .get_client(session, &mapping.mcp_server)
            .await?;
        let result = client.read_resource(&mapping.target_name).await?;
        Ok(serde_json::to_value(result)?)
    }
}

fn match_template(templates: &ToolMappings, uri: &str) -> Option<TargetMapping> {
    let mut names: Vec<&String> = templates.keys().collect();
    names.sort();

    for name in names {
        let mapping = &templates[name];
        let TargetDescriptor::ResourceTemplate(template) = &mapping.target else {
            continue;
        };
        let Ok(re) = uri_template::compile(&template.uri_template) else {
            continue;
        };
        if re.is_match(uri) {
            let mut mapping = mapping.clone();
            mapping.target_name = uri.to_string();
            return Some(mapping);
        }
    }
    None
}

fn decode_params<T: DeserializeOwned + Default>(msg: &Message) -> Result<T> {
    match &msg.params {
        Some(params) if !params.is_null() => serde_json::from_value(params.clone())
            .map_err(|err| Error::protocol(format!("invalid params: {err}"))),
        _ => Ok(T::default()),
    }
}

fn set_mappings(session: &Arc<Session>, key: &str, mappings: &ToolMappings) -> Result<()> {
    session.set_attribute(key, serde_json::to_value(mappings)?);
    Ok(())
}

fn get_mappings(session: &Arc<Session>, key: &str) -> ToolMappings {
    session
        .get_attribute(key)
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default()
}

#[async_trait]
impl MessageHandler for Server {
    async fn on_message(&self, session: Arc<Session>, msg: Message) {
        let Some(method) = msg.method.clone() else {
            // Stray responses were already offered to the pending table.
            return;
        };
        debug!(session = %session.id(), %method, "dispatching");

        match self.dispatch(&session, &msg, &method).await {
            Ok(Some(result)) => {
                if let Some(id) = msg.id.clone() {
                    if let Err(err) = session.reply(id, &result).await {
                        error!(%err, %method, "failed to send reply");
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                error!(%err, %method, "request failed");
                if msg.id.is_some() {
                    let rpc_error = match err {
                        Error::Rpc { code, message } => RpcError::new(code, message),
                        other => RpcError::new(INTERNAL_ERROR, other.to_string()),
                    };
                    session.reply_error(msg.id.clone(), rpc_error).await;
                }
            }
        }
    }
}
