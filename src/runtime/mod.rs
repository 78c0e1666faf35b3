//! Wiring.
//!
//! The registry needs the sampler for `sampling/createMessage` reverse
//! calls and the sampler needs the agent driver, which needs the
//! registry; the cycle resolves through the registry's late-bound
//! sampler slot rather than a mutually-owning reference.

use crate::agents::Agents;
use crate::confirm;
use crate::core::completion::Completer;
use crate::core::config::{Config, ToolRef};
use crate::error::{Error, Result};
use crate::mcp::session::Session;
use crate::mcp::types::{CallToolResult, Root};
use crate::sampling::Sampler;
use crate::tools::{CallOptions, ListToolsOptions, Service, ServiceOptions};
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct RuntimeOptions {
    pub confirmations: Option<Arc<confirm::Service>>,
    pub roots: Vec<Root>,
    pub max_concurrency: usize,
}

pub struct Runtime {
    config: Config,
    registry: Arc<Service>,
    agents: Arc<Agents>,
    confirmations: Option<Arc<confirm::Service>>,
}

impl Runtime {
    pub fn new(completer: Arc<dyn Completer>, config: Config, opts: RuntimeOptions) -> Arc<Runtime> {
        let registry = Service::new(
            config.clone(),
            ServiceOptions {
                roots: opts.roots.clone(),
                concurrency: opts.max_concurrency,
            },
        );
        let agents = Agents::new(
            completer,
            registry.clone(),
            opts.confirmations.clone(),
            config.clone(),
        );
        let sampler = Sampler::new(config.clone(), agents.clone());
        registry.set_sampler(sampler);

        Arc::new(Runtime {
            config,
            registry,
            agents,
            confirmations: opts.confirmations,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Service> {
        &self.registry
    }

    pub fn agents(&self) -> &Arc<Agents> {
        &self.agents
    }

    pub fn confirmations(&self) -> Option<&Arc<confirm::Service>> {
        self.confirmations.as_ref()
    }

    /// A wire-less session for embedding hosts.
    pub fn temp_session(&self) -> Arc<Session> {
        Session::empty("temp")
    }

    pub async fn call(
        &self,
        session: &Arc<Session>,
        server: &str,
        tool: &str,
        args: Value,
        opts: CallOptions,
    ) -> Result<CallToolResult> {
        self.registry.call(session, server, tool, args, opts).await
    }

    /// Resolves a `server[/tool]` reference to exactly one tool and
    /// invokes it.
    pub async fn call_from_ref(
        &self,
        session: &Arc<Session>,
        reference: &str,
        args: Value,
    ) -> Result<CallToolResult> {
        let tool_ref = ToolRef::parse(reference);
        let (server, tool) = if tool_ref.tool.is_empty() {
            (tool_ref.server.clone(), String::new())
        } else {
            (tool_ref.server.clone(), tool_ref.tool.clone())
        };

        let listed = self
            .registry
            .list_tools(
                session,
                ListToolsOptions {
                    servers: vec![server.clone()],
                    tools: if tool.is_empty() {
                        Vec::new()
                    } else {
                        vec![tool.clone()]
                    },
                },
            )
            .await?;
        let total: usize = listed.iter().map(|st| st.tools.len()).sum();
        if listed.len() != 1 || total != 1 {
            return Err(Error::semantic(format!(
                "found {total} tools for reference {reference}"
            )));
        }

        let name = listed[0].tools[0].name.clone();
        let tool = if self.config.agents.contains_key(&server)
            || self.config.flows.contains_key(&server)
        {
            String::new()
        } else {
            name
        };
        self.registry
            .call(session, &server, &tool, args, CallOptions::default())
            .await
    }
}
