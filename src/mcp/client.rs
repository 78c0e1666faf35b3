//! High-level MCP client.
//!
//! Connecting builds the right wire from the launch spec (child process
//! over stdio, or HTTP when a base URL is given), performs the
//! initialize handshake, and installs reverse-call handlers. Typed
//! operations wrap the session's exchange.

use crate::core::env;
use crate::error::{Error, Result};
use crate::mcp::message::{Message, RpcError, INTERNAL_ERROR, METHOD_NOT_FOUND};
use crate::mcp::runner::ServerRunner;
use crate::mcp::session::{ExchangeOptions, MessageHandler, Session};
use crate::mcp::transport::http::HttpWire;
use crate::mcp::transport::stdio::StdioWire;
use crate::mcp::transport::Wire;
use crate::mcp::types::{
    CallToolResult, ClientCapabilities, ClientInfo, CreateMessageRequest, CreateMessageResult,
    GetPromptRequest, GetPromptResult, InitializeRequest, InitializeResult, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListRootsResult, ListToolsResult,
    LoggingMessage, McpServer, ReadResourceRequest, ReadResourceResult, RootsCapability,
    SamplingCapability, PROTOCOL_VERSION,
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

pub type SamplingHandler = Arc<
    dyn Fn(Arc<Session>, CreateMessageRequest) -> BoxFuture<'static, Result<CreateMessageResult>>
        + Send
        + Sync,
>;
pub type RootsHandler =
    Arc<dyn Fn(Arc<Session>) -> BoxFuture<'static, Result<ListRootsResult>> + Send + Sync>;
pub type LoggingHandler =
    Arc<dyn Fn(Arc<Session>, LoggingMessage) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type NotifyHandler =
    Arc<dyn Fn(Arc<Session>, Message) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ClientOptions {
    pub on_sampling: Option<SamplingHandler>,
    pub on_roots: Option<RootsHandler>,
    pub on_logging: Option<LoggingHandler>,
    pub on_notify: Option<NotifyHandler>,
    pub env: HashMap<String, String>,
    pub parent_session: Option<Arc<Session>>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub progress_token: Option<Value>,
}

struct ClientHandler {
    opts: ClientOptions,
}

#[async_trait]
impl MessageHandler for ClientHandler {
    async fn on_message(&self, session: Arc<Session>, msg: Message) {
        match msg.method.as_deref() {
            Some("sampling/createMessage") => {
                let Some(on_sampling) = &self.opts.on_sampling else {
                    self.unhandled(&session, msg).await;
                    return;
                };
                let id = msg.id.clone();
                let request: CreateMessageRequest = match msg
                    .params
                    .clone()
                    .map(serde_json::from_value)
                    .transpose()
                {
                    Ok(request) => request.unwrap_or_default(),
                    Err(err) => {
                        session
                            .reply_error(
                                id,
                                RpcError::new(
                                    INTERNAL_ERROR,
                                    format!("failed to decode sampling/createMessage: {err}"),
                                ),
                            )
                            .await;
                        return;
                    }
                };
                match on_sampling(session.clone(), request).await {
                    Ok(result) => {
                        if let Some(id) = id {
                            if let Err(err) = session.reply(id, &result).await {
                                error!(%err, "failed to reply to sampling/createMessage");
                            }
                        }
                    }
                    Err(err) => {
                        session
                            .reply_error(
                                id,
                                RpcError::new(
                                    INTERNAL_ERROR,
                                    format!("failed to handle sampling/createMessage: {err}"),
                                ),
                            )
                            .await;
                    }
                }
            }
            Some("roots/list") => {
                let Some(on_roots) = &self.opts.on_roots else {
                    self.unhandled(&session, msg).await;
                    return;
                };
                let id = msg.id.clone();
                match on_roots(session.clone()).await {
                    Ok(result) => {
                        if let Some(id) = id {
                            if let Err(err) = session.reply(id, &result).await {
                                error!(%err, "failed to reply to roots/list");
                            }
                        }
                    }
                    Err(err) => {
                        session
                            .reply_error(
                                id,
                                RpcError::new(
                                    INTERNAL_ERROR,
                                    format!("failed to handle roots/list: {err}"),
                                ),
                            )
                            .await;
                    }
                }
            }
            Some("notifications/message") if self.opts.on_logging.is_some() => {
                let Some(on_logging) = self.opts.on_logging.as_ref() else {
                    return;
                };
                let payload: LoggingMessage = match msg
                    .params
                    .clone()
                    .map(serde_json::from_value)
                    .transpose()
                {
                    Ok(payload) => payload.unwrap_or_default(),
                    Err(err) => {
                        debug!(%err, "dropping malformed notifications/message");
                        return;
                    }
                };
                if let Err(err) = on_logging(session, payload).await {
                    error!(%err, "failed to handle notifications/message");
                }
            }
            Some(method) if method.starts_with("notifications/") => {
                if let Some(on_notify) = &self.opts.on_notify {
                    if let Err(err) = on_notify(session, msg).await {
                        error!(%err, "failed to handle notification");
                    }
                }
            }
            _ => self.unhandled(&session, msg).await,
        }
    }
}

impl ClientHandler {
    async fn unhandled(&self, session: &Arc<Session>, msg: Message) {
        if msg.is_request() {
            session
                .reply_error(
                    msg.id.clone(),
                    RpcError::new(
                        METHOD_NOT_FOUND,
                        format!("method {:?} not supported", msg.method.as_deref().unwrap_or("")),
                    ),
                )
                .await;
        } else {
            debug!(method = ?msg.method, "dropping unhandled server message");
        }
    }
}

pub struct Client {
    pub session: Arc<Session>,
}

impl Client {
    /// Builds a wire from the launch spec and performs the initialize
    /// handshake. Command/args/headers/base URL undergo env
    /// substitution first; an HTTP server that also declares a command
    /// is launched (once, process-wide) through the runner.
    pub async fn connect(
        name: &str,
        config: &McpServer,
        runner: &ServerRunner,
        opts: ClientOptions,
    ) -> Result<Client> {
        let session_env = &opts.env;
        let headers = env::replace_map(session_env, &config.headers);

        let wire: Arc<dyn Wire> = if !config.base_url.is_empty() {
            let config = if config.command.is_empty() {
                config.clone()
            } else {
                runner.ensure_running(name, config, session_env).await?
            };
            let base_url = env::replace_string(session_env, &config.base_url);
            HttpWire::new(name, base_url, headers)?
        } else if !config.command.is_empty() {
            let (command, args, env_pairs) =
                env::replace_env(session_env, &config.command, &config.args, &config.env);
            Arc::new(StdioWire::spawn(name, &command, &args, &env_pairs)?)
        } else {
            return Err(Error::semantic(format!(
                "MCP server {name}: no command or base URL provided"
            )));
        };

        let capabilities = ClientCapabilities {
            sampling: opts.on_sampling.as_ref().map(|_| SamplingCapability {}),
            roots: opts
                .on_roots
                .as_ref()
                .map(|_| RootsCapability { list_changed: false }),
        };
        let session_id = opts
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let parent = opts.parent_session.clone();

        let session = Session::start(wire, Arc::new(ClientHandler { opts }), session_id, parent)
            .await?;
        let client = Client { session };
        client
            .initialize(InitializeRequest {
                protocol_version: PROTOCOL_VERSION.to_string(),
                capabilities,
                client_info: ClientInfo {
                    name: "nanobot".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
            })
            .await?;
        Ok(client)
    }

    pub async fn initialize(&self, params: InitializeRequest) -> Result<InitializeResult> {
        let result: InitializeResult = self
            .session
            .exchange("initialize", &params, ExchangeOptions::default())
            .await?;
        self.session
            .send(Message::notification("notifications/initialized", None))
            .await?;
        self.session.set_server_capabilities(result.capabilities.clone());
        Ok(result)
    }

    pub async fn list_tools(&self) -> Result<ListToolsResult> {
        self.session
            .exchange("tools/list", &json!({}), ExchangeOptions::default())
            .await
    }

    pub async fn call(
        &self,
        tool: &str,
        args: Option<Value>,
        opts: CallOptions,
    ) -> Result<CallToolResult> {
        self.session
            .exchange(
                "tools/call",
                &json!({"name": tool, "arguments": args}),
                ExchangeOptions {
                    progress_token: opts.progress_token,
                },
            )
            .await
    }

    pub async fn list_prompts(&self) -> Result<ListPromptsResult> {
        if !self.supports(|caps| caps.prompts.is_some()) {
            return Ok(ListPromptsResult::default());
        }
        self.session
            .exchange("prompts/list", &json!({}), ExchangeOptions::default())
            .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        args: HashMap<String, String>,
    ) -> Result<GetPromptResult> {
        self.session
            .exchange(
                "prompts/get",
                &GetPromptRequest {
                    name: name.to_string(),
                    arguments: args,
                },
                ExchangeOptions::default(),
            )
            .await
    }

    pub async fn list_resources(&self) -> Result<ListResourcesResult> {
        if !self.supports(|caps| caps.resources.is_some()) {
            return Ok(ListResourcesResult::default());
        }
        self.session
            .exchange("resources/list", &json!({}), ExchangeOptions::default())
            .await
    }

    pub async fn list_resource_templates(&self) -> Result<ListResourceTemplatesResult> {
        if !self.supports(|caps| caps.resources.is_some()) {
            return Ok(ListResourceTemplatesResult::default());
        }
        self.session
            .exchange(
                "resources/templates/list",
                &json!({}),
                ExchangeOptions::default(),
            )
            .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        self.session
            .exchange(
                "resources/read",
                &ReadResourceRequest {
                    uri: uri.to_string(),
                },
                ExchangeOptions::default(),
            )
            .await
    }

    fn supports(&self, check: impl Fn(&crate::mcp::types::ServerCapabilities) -> bool) -> bool {
        self.session
            .server_capabilities()
            .map(|caps| check(&caps))
            .unwrap_or(false)
    }
}
