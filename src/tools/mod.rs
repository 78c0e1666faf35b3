//! The tool registry.
//!
//! Resolves published names to their backing target — an external MCP
//! server, an in-process agent, or a flow — caches one client per
//! external server per top-level session, and routes invocations,
//! emitting `nanobot/call` progress events around every call.

use crate::core::config::{
    chat_input_schema, AgentCall, Config, DynamicInstructions, SampleCallRequest, ToolRef,
    AGENT_TOOL,
};
use crate::core::env;
use crate::error::{Error, Result};
use crate::mcp::client::{CallOptions as McpCallOptions, Client, ClientOptions};
use crate::mcp::message::Message;
use crate::mcp::runner::ServerRunner;
use crate::mcp::session::Session;
use crate::mcp::types::{
    CallToolResult, Content, CreateMessageRequest, CreateMessageResult, GetPromptResult,
    ListRootsResult, LoggingMessage, ModelHint, ModelPreferences, ProgressNotification, Root,
    SamplingMessage, Tool,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

mod flows;

/// What a published name is backed by.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "spec", rename_all = "camelCase")]
pub enum TargetDescriptor {
    Tool(Tool),
    Prompt(crate::mcp::types::Prompt),
    Resource(crate::mcp::types::Resource),
    ResourceTemplate(crate::mcp::types::ResourceTemplate),
}

impl TargetDescriptor {
    pub fn as_tool(&self) -> Option<&Tool> {
        match self {
            TargetDescriptor::Tool(tool) => Some(tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetMapping {
    pub mcp_server: String,
    pub target_name: String,
    pub target: TargetDescriptor,
}

pub type ToolMappings = HashMap<String, TargetMapping>;

#[derive(Debug, Clone, Default)]
pub struct SamplerOptions {
    pub progress_token: Option<Value>,
    pub agent_override: AgentCall,
}

/// Model selection lives behind this seam; the registry needs it for
/// `sampling/createMessage` reverse calls while the sampler needs the
/// registry's completion driver, so the binding happens after
/// construction.
#[async_trait]
pub trait Sampler: Send + Sync {
    async fn sample(
        &self,
        session: &Arc<Session>,
        req: CreateMessageRequest,
        opts: SamplerOptions,
    ) -> Result<CreateMessageResult>;
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub progress_token: Option<Value>,
    pub agent_override: AgentCall,
    pub log_data: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    pub roots: Vec<Root>,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ListToolsOptions {
    pub servers: Vec<String>,
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerTools {
    pub server: String,
    pub tools: Vec<Tool>,
}

const DEFAULT_CONCURRENCY: usize = 10;

pub struct Service {
    config: Config,
    clients: Mutex<HashMap<String, HashMap<String, Arc<Client>>>>,
    roots: Vec<Root>,
    pub(crate) concurrency: usize,
    sampler: OnceLock<Arc<dyn Sampler>>,
    runner: ServerRunner,
    pub(crate) evaluator: Arc<dyn crate::core::expr::Evaluator>,
}

impl Service {
    pub fn new(config: Config, opts: ServiceOptions) -> Arc<Self> {
        Arc::new(Service {
            config,
            clients: Mutex::new(HashMap::new()),
            roots: opts.roots,
            concurrency: if opts.concurrency == 0 {
                DEFAULT_CONCURRENCY
            } else {
                opts.concurrency
            },
            sampler: OnceLock::new(),
            runner: ServerRunner::new(),
            evaluator: Arc::new(crate::core::expr::TemplateEvaluator),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Late binding; see [`Sampler`].
    pub fn set_sampler(&self, sampler: Arc<dyn Sampler>) {
        let _ = self.sampler.set(sampler);
    }

    fn sampler(&self) -> Result<Arc<dyn Sampler>> {
        self.sampler
            .get()
            .cloned()
            .ok_or_else(|| Error::fatal("no sampler installed"))
    }

    /// One client per external server per top-level session, created on
    /// first use under the registry lock.
    pub async fn get_client(&self, session: &Arc<Session>, name: &str) -> Result<Arc<Client>> {
        let mut clients = self.clients.lock().await;

        let top_key = session
            .id()
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        if let Some(client) = clients.get(&top_key).and_then(|servers| servers.get(name)) {
            return Ok(client.clone());
        }

        let config = self
            .config
            .mcp_servers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::semantic(format!("MCP server {name} not found in config")))?;

        // The serving client may contribute roots of its own.
        let mut roots = self.roots.clone();
        if session
            .client_capabilities()
            .is_some_and(|caps| caps.roots.is_some())
        {
            let listed: ListRootsResult = session
                .exchange("roots/list", &json!({}), Default::default())
                .await
                .map_err(|err| Error::transport(format!("failed to list roots: {err}")))?;
            roots.extend(listed.roots);
        }

        let server_name = name.to_string();
        let reply_roots = roots.clone();
        let sampler = self.sampler.get().cloned();

        let mut options = ClientOptions {
            env: session.env_map(),
            parent_session: Some(session.clone()),
            session_id: Some(format!("{}/{}", session.id(), uuid::Uuid::new_v4())),
            on_roots: Some(Arc::new(move |_session| {
                let roots = reply_roots.clone();
                Box::pin(async move { Ok(ListRootsResult { roots }) })
            })),
            on_logging: Some(Arc::new(move |session: Arc<Session>, log: LoggingMessage| {
                let server = server_name.clone();
                Box::pin(async move {
                    let relabeled = LoggingMessage {
                        level: log.level,
                        logger: log.logger,
                        data: json!({"server": server, "data": log.data}),
                    };
                    session
                        .top()
                        .send_payload("notifications/message", &relabeled)
                        .await
                })
            })),
            on_notify: Some(Arc::new(|session: Arc<Session>, msg: Message| {
                Box::pin(async move {
                    let Some(method) = msg.method.clone() else {
                        return Ok(());
                    };
                    session
                        .top()
                        .send_payload(&method, &msg.params.unwrap_or(Value::Null))
                        .await
                })
            })),
            ..ClientOptions::default()
        };
        if let Some(sampler) = sampler {
            options.on_sampling = Some(Arc::new(move |session: Arc<Session>, request| {
                let sampler = sampler.clone();
                Box::pin(async move {
                    sampler
                        .sample(
                            &session,
                            request,
                            SamplerOptions {
                                progress_token: Some(Value::String(
                                    uuid::Uuid::new_v4().to_string(),
                                )),
                                ..SamplerOptions::default()
                            },
                        )
                        .await
                })
            }));
        }

        let client = Arc::new(Client::connect(name, &config, &self.runner, options).await?);
        clients
            .entry(top_key)
            .or_default()
            .insert(name.to_string(), client.clone());
        Ok(client)
    }

    /// Routes a call to its backing target, bracketed by progress
    /// events when a token is present.
    pub async fn call(
        &self,
        session: &Arc<Session>,
        server: &str,
        tool: &str,
        args: Value,
        opts: CallOptions,
    ) -> Result<CallToolResult> {
        let target = if tool.is_empty() {
            server.to_string()
        } else {
            format!("{server}/{tool}")
        };
        let call_id = uuid::Uuid::new_v4().to_string();

        if let Some(token) = &opts.progress_token {
            let _ = session
                .send_payload(
                    "notifications/progress",
                    &ProgressNotification {
                        progress_token: token.clone(),
                        data: Some(json!({
                            "type": "nanobot/call",
                            "id": call_id,
                            "target": target,
                            "input": args.clone(),
                            "data": opts.log_data.clone(),
                        })),
                        ..ProgressNotification::default()
                    },
                )
                .await;
        }

        let result = self.dispatch(session, server, tool, args, &opts).await;

        if let Some(token) = &opts.progress_token {
            let data = match &result {
                Ok(output) => json!({
                    "type": "nanobot/call/complete",
                    "id": call_id,
                    "target": target,
                    "output": output,
                    "data": opts.log_data.clone(),
                }),
                Err(err) => json!({
                    "type": "nanobot/toolcall/error",
                    "id": call_id,
                    "target": target,
                    "error": err.to_string(),
                    "data": opts.log_data.clone(),
                }),
            };
            let _ = session
                .send_payload(
                    "notifications/progress",
                    &ProgressNotification {
                        progress_token: token.clone(),
                        data: Some(data),
                        ..ProgressNotification::default()
                    },
                )
                .await;
        }

        result.map(|mut output| {
            attach_structured_content(&mut output);
            output
        })
    }

    async fn dispatch(
        &self,
        session: &Arc<Session>,
        server: &str,
        tool: &str,
        args: Value,
        opts: &CallOptions,
    ) -> Result<CallToolResult> {
        if self.config.agents.contains_key(server) {
            return self.sample_call(session, server, args, opts).await;
        }
        if self.config.flows.contains_key(server) {
            return self.run_flow(session, server, args, opts).await;
        }

        let client = self.get_client(session, server).await?;
        let args = if args.is_null() { None } else { Some(args) };
        client
            .call(
                tool,
                args,
                McpCallOptions {
                    progress_token: opts.progress_token.clone(),
                },
            )
            .await
    }

    /// An agent behind a tool name: arguments become a sampling request
    /// with a model hint naming the agent.
    async fn sample_call(
        &self,
        session: &Arc<Session>,
        agent: &str,
        args: Value,
        opts: &CallOptions,
    ) -> Result<CallToolResult> {
        let request = self.convert_to_sample_request(agent, args)?;
        let result = self
            .sampler()?
            .sample(
                session,
                request,
                SamplerOptions {
                    progress_token: opts.progress_token.clone(),
                    agent_override: opts.agent_override.clone(),
                },
            )
            .await?;
        Ok(CallToolResult {
            is_error: false,
            content: vec![result.content],
            structured_content: None,
        })
    }

    pub async fn list_tools(
        &self,
        session: &Arc<Session>,
        opts: ListToolsOptions,
    ) -> Result<Vec<ServerTools>> {
        let mut server_names: Vec<&String> = self.config.mcp_servers.keys().collect();
        server_names.sort();
        let mut agent_names: Vec<&String> = self.config.agents.keys().collect();
        agent_names.sort();
        let mut flow_names: Vec<&String> = self.config.flows.keys().collect();
        flow_names.sort();

        let selected: Vec<String> = if opts.servers.is_empty() {
            server_names
                .iter()
                .chain(agent_names.iter())
                .chain(flow_names.iter())
                .map(|name| name.to_string())
                .collect()
        } else {
            opts.servers.clone()
        };

        let mut result = Vec::new();

        for name in &selected {
            if !self.config.mcp_servers.contains_key(name) {
                continue;
            }
            let client = self.get_client(session, name).await?;
            let tools = filter_tools(client.list_tools().await?.tools, &opts.tools);
            if tools.is_empty() {
                continue;
            }
            result.push(ServerTools {
                server: name.clone(),
                tools,
            });
        }

        for name in &selected {
            let Some(agent) = self.config.agents.get(name) else {
                continue;
            };
            let tools = filter_tools(
                vec![Tool {
                    name: name.clone(),
                    description: agent.description.clone(),
                    input_schema: chat_input_schema(),
                    annotations: None,
                }],
                &opts.tools,
            );
            if tools.is_empty() {
                continue;
            }
            result.push(ServerTools {
                server: name.clone(),
                tools,
            });
        }

        for name in &selected {
            let Some(flow) = self.config.flows.get(name) else {
                continue;
            };
            let tools = filter_tools(
                vec![Tool {
                    name: name.clone(),
                    description: flow.description.clone(),
                    input_schema: flow.input.to_schema(),
                    annotations: None,
                }],
                &opts.tools,
            );
            if tools.is_empty() {
                continue;
            }
            result.push(ServerTools {
                server: name.clone(),
                tools,
            });
        }

        Ok(result)
    }

    fn get_matches(&self, reference: &str, tools: &[ServerTools]) -> ToolMappings {
        let tool_ref = ToolRef::parse(reference);
        let mut result = ToolMappings::new();

        for server_tools in tools {
            if server_tools.server != tool_ref.server {
                continue;
            }
            for tool in &server_tools.tools {
                if !tool_ref.tool.is_empty() && tool.name != tool_ref.tool {
                    continue;
                }
                let original_name = tool.name.clone();
                let mut tool = tool.clone();
                if !tool_ref.alias.is_empty() {
                    tool.name = tool_ref.alias.clone();
                }
                result.insert(
                    tool.name.clone(),
                    TargetMapping {
                        mcp_server: tool_ref.server.clone(),
                        target_name: original_name,
                        target: TargetDescriptor::Tool(tool),
                    },
                );
            }
        }

        result
    }

    async fn list_tools_for_references(
        &self,
        session: &Arc<Session>,
        references: &[String],
    ) -> Result<Vec<ServerTools>> {
        if references.is_empty() {
            return Ok(Vec::new());
        }
        let servers: Vec<String> = references
            .iter()
            .map(|reference| ToolRef::parse(reference).server)
            .filter(|server| !server.is_empty())
            .collect();
        self.list_tools(
            session,
            ListToolsOptions {
                servers,
                tools: Vec::new(),
            },
        )
        .await
    }

    /// Resolves a reference list into the published-name table.
    pub async fn build_tool_mappings(
        &self,
        session: &Arc<Session>,
        references: &[String],
    ) -> Result<ToolMappings> {
        let tools = self.list_tools_for_references(session, references).await?;
        let mut result = ToolMappings::new();
        for reference in references {
            result.extend(self.get_matches(reference, &tools));
        }
        Ok(result)
    }

    /// The entrypoint agent, published under the fixed name `agent`.
    pub async fn get_entry_point(
        &self,
        session: &Arc<Session>,
        existing: &ToolMappings,
    ) -> Result<TargetMapping> {
        if let Some(mapping) = existing.get(AGENT_TOOL) {
            return Ok(mapping.clone());
        }

        let entrypoint = self.config.publish.entrypoint.clone();
        if entrypoint.is_empty() {
            return Err(Error::semantic("no entrypoint specified"));
        }

        let tools = self
            .list_tools_for_references(session, &[entrypoint.clone()])
            .await?;
        let matches = self.get_matches(&entrypoint, &tools);
        if matches.len() != 1 {
            return Err(Error::semantic(format!(
                "expected one agent for entrypoint {entrypoint}, got {}",
                matches.len()
            )));
        }

        let mut mapping = matches.into_values().next().expect("len checked above");
        if let TargetDescriptor::Tool(tool) = &mut mapping.target {
            tool.name = AGENT_TOOL.to_string();
        }
        Ok(mapping)
    }

    pub async fn get_prompt(
        &self,
        session: &Arc<Session>,
        target: &str,
        prompt: &str,
        args: HashMap<String, String>,
    ) -> Result<GetPromptResult> {
        let client = self.get_client(session, target).await?;
        client.get_prompt(prompt, args).await
    }

    /// A literal instruction string passes through; the prompt form is
    /// resolved through `prompts/get` and must yield exactly one
    /// message.
    pub async fn get_dynamic_instruction(
        &self,
        session: &Arc<Session>,
        instructions: &DynamicInstructions,
    ) -> Result<String> {
        if !instructions.is_set() {
            return Ok(String::new());
        }
        if !instructions.is_prompt() {
            return Ok(instructions.instructions.clone());
        }

        let args = env::replace_map(&session.env_map(), &instructions.args);
        let prompt = self
            .get_prompt(session, &instructions.mcp_server, &instructions.prompt, args)
            .await
            .map_err(|err| Error::semantic(format!("failed to get prompt: {err}")))?;
        if prompt.messages.len() != 1 {
            return Err(Error::semantic(format!(
                "prompt {}/{} returned {} messages, expected 1",
                instructions.mcp_server,
                instructions.prompt,
                prompt.messages.len()
            )));
        }
        Ok(prompt.messages[0]
            .content
            .as_text()
            .unwrap_or_default()
            .to_string())
    }

    /// Agent tools accept a bare prompt string, the full
    /// `{prompt, attachments}` shape, or any other JSON value, which is
    /// stringified into the prompt.
    fn convert_to_sample_request(&self, agent: &str, args: Value) -> Result<CreateMessageRequest> {
        let sample_args: SampleCallRequest = match args {
            Value::String(prompt) => SampleCallRequest {
                prompt,
                attachments: Vec::new(),
            },
            Value::Object(map) if has_only_sample_keys(&map) => {
                serde_json::from_value(Value::Object(map))?
            }
            Value::Null => SampleCallRequest::default(),
            other => SampleCallRequest {
                prompt: serde_json::to_string(&other)?,
                attachments: Vec::new(),
            },
        };

        let mut request = CreateMessageRequest {
            max_tokens: self
                .config
                .agents
                .get(agent)
                .and_then(|a| a.max_tokens)
                .unwrap_or(0),
            model_preferences: ModelPreferences {
                hints: vec![ModelHint {
                    name: agent.to_string(),
                }],
                ..ModelPreferences::default()
            },
            ..CreateMessageRequest::default()
        };

        if !sample_args.prompt.is_empty() {
            request.messages.push(SamplingMessage {
                role: "user".to_string(),
                content: Content::text(sample_args.prompt),
            });
        }

        for attachment in &sample_args.attachments {
            let (mime_type, data) = parse_data_uri(&attachment.url, &attachment.mime_type)?;
            request.messages.push(SamplingMessage {
                role: "user".to_string(),
                content: Content::Image { data, mime_type },
            });
        }

        Ok(request)
    }

    pub fn confirm_is_external(&self, server: &str) -> bool {
        !self.config.agents.contains_key(server) && !self.config.flows.contains_key(server)
    }

    #[cfg(test)]
    pub(crate) fn get_matches_for_test(
        &self,
        reference: &str,
        tools: &[ServerTools],
    ) -> ToolMappings {
        self.get_matches(reference, tools)
    }
}

fn has_only_sample_keys(map: &serde_json::Map<String, Value>) -> bool {
    map.keys().all(|key| key == "prompt" || key == "attachments")
}

/// Attachment URLs must be base64 data URIs; the embedded MIME type
/// wins over the declared one.
fn parse_data_uri(url: &str, declared_mime: &str) -> Result<(String, String)> {
    use base64::Engine;

    let rest = url.strip_prefix("data:").ok_or_else(|| {
        Error::semantic(format!(
            "invalid attachment URL: {url}, only data URI are supported"
        ))
    })?;
    let (mime, payload) = rest.split_once(',').ok_or_else(|| {
        Error::semantic(format!(
            "invalid attachment URL: {url}, only data URI are supported"
        ))
    })?;
    if !rest.contains("base64") {
        return Err(Error::semantic(format!(
            "invalid attachment URL: {url}, only base64 data URI are supported"
        )));
    }
    let data = payload.strip_prefix("base64,").unwrap_or(payload);
    let mime = mime.strip_suffix(";base64").unwrap_or(mime);

    if base64::engine::general_purpose::STANDARD.decode(data).is_err() {
        return Err(Error::semantic(format!(
            "invalid attachment URL: {url}, payload is not valid base64"
        )));
    }

    let mime_type = if mime.is_empty() {
        declared_mime.to_string()
    } else {
        mime.to_string()
    };
    Ok((mime_type, data.to_string()))
}

fn filter_tools(tools: Vec<Tool>, filter: &[String]) -> Vec<Tool> {
    if filter.is_empty() {
        return tools;
    }
    tools
        .into_iter()
        .filter(|tool| filter.iter().any(|name| name == &tool.name))
        .collect()
}

/// Text content that parses as JSON becomes the structured form of the
/// result; the last parseable item wins.
fn attach_structured_content(result: &mut CallToolResult) {
    if result.structured_content.is_some() {
        return;
    }
    for content in &result.content {
        if let Some(text) = content.as_text() {
            if let Ok(value) = serde_json::from_str::<Value>(text) {
                result.structured_content = Some(value);
            }
        }
    }
}
