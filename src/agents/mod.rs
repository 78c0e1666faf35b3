//! The agent completion driver.
//!
//! One `complete` call may span several provider turns: each response's
//! tool calls are resolved through the registry, their outputs folded
//! into the next request in ascending callID order, and the loop runs
//! until the model stops calling tools. Completed runs persist on the
//! session under `previous_run/<model>` unless chat history is off.

use crate::confirm;
use crate::core::completion::{
    CompletionItem, CompletionOptions, CompletionRequest, CompletionResponse, Completer,
    OutputSchema, ToolCall, ToolCallOutput, ToolUseDefinition,
};
use crate::core::config::{Config, DynamicInstructions};
use crate::error::{Error, Result};
use crate::mcp::session::Session;
use crate::tools::{CallOptions, Service, ToolMappings};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const PREVIOUS_RUN_KEY: &str = "previous_run";

/// Per-turn state. Serializable so a completed run can live in the
/// session attribute map between calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub request: CompletionRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub populated_request: Option<CompletionRequest>,
    #[serde(default, skip_serializing_if = "ToolMappings::is_empty")]
    pub tool_mappings: ToolMappings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<CompletionResponse>,
    /// Keyed by callID; the sorted order is the fold order.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_outputs: BTreeMap<String, ToolOutput>,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolOutput {
    pub output: Vec<CompletionItem>,
    pub done: bool,
}

pub struct Agents {
    config: Config,
    completer: Arc<dyn Completer>,
    registry: Arc<Service>,
    confirmations: Option<Arc<confirm::Service>>,
}

impl Agents {
    pub fn new(
        completer: Arc<dyn Completer>,
        registry: Arc<Service>,
        confirmations: Option<Arc<confirm::Service>>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Agents {
            config,
            completer,
            registry,
            confirmations,
        })
    }

    pub async fn complete(
        &self,
        session: &Arc<Session>,
        req: CompletionRequest,
        opts: CompletionOptions,
    ) -> Result<CompletionResponse> {
        let previous_key = format!("{PREVIOUS_RUN_KEY}/{}", req.model);

        let mut stateful = true;
        if let Some(agent) = self.config.agents.get(&req.model) {
            if agent.chat_history == Some(false) {
                stateful = false;
            }
        }
        if let Some(chat_history) = opts.chat_history {
            stateful = chat_history;
        }

        let mut previous: Option<Run> = if stateful {
            session
                .get_attribute(&previous_key)
                .and_then(|value| serde_json::from_value(value).ok())
        } else {
            None
        };

        let mut current = Run {
            request: req.clone(),
            ..Run::default()
        };

        loop {
            self.run(session, &mut current, previous.as_ref(), &opts)
                .await?;
            self.tool_calls(session, &mut current, &opts).await?;

            if current.done {
                if stateful {
                    session.set_attribute(&previous_key, serde_json::to_value(&current)?);
                }
                return Ok(current.response.clone().unwrap_or_default());
            }

            previous = Some(current);
            let mut request = req.clone();
            // Only the first turn carries the caller's input; follow-on
            // turns are driven by the folded history.
            request.input = Vec::new();
            current = Run {
                request,
                ..Run::default()
            };
        }
    }

    async fn run(
        &self,
        session: &Arc<Session>,
        run: &mut Run,
        previous: Option<&Run>,
        opts: &CompletionOptions,
    ) -> Result<()> {
        let (populated, mappings) = self.populate_request(session, run, previous).await?;
        run.populated_request = Some(populated.clone());
        run.tool_mappings = mappings;

        let response = self
            .completer
            .complete(session, populated, opts.clone())
            .await?;
        run.response = Some(response);
        Ok(())
    }

    async fn populate_request(
        &self,
        session: &Arc<Session>,
        run: &Run,
        previous: Option<&Run>,
    ) -> Result<(CompletionRequest, ToolMappings)> {
        let mut req = run.request.clone();

        if let Some(previous) = previous {
            let mut input = previous
                .populated_request
                .as_ref()
                .map(|request| request.input.clone())
                .unwrap_or_default();

            if let Some(response) = &previous.response {
                input.extend(
                    response
                        .output
                        .iter()
                        .filter(|item| item.echoable())
                        .cloned(),
                );
            }

            // BTreeMap iteration is ascending callID order, which keeps
            // follow-on prompts deterministic regardless of completion
            // order.
            for output in previous.tool_outputs.values() {
                if output.done {
                    input.extend(output.output.iter().cloned());
                }
            }

            input.extend(req.input);
            req.input = input;
        }

        let Some(agent) = self.config.agents.get(&req.model) else {
            // Unknown model names pass through to the provider as-is.
            return Ok((req, ToolMappings::new()));
        };
        let mut agent = agent.clone();

        // A system prompt that is itself a dynamic-instruction object
        // replaces the agent's configured instructions.
        if !req.system_prompt.is_empty() {
            if let Ok(instructions) =
                serde_json::from_str::<DynamicInstructions>(req.system_prompt.trim())
            {
                if instructions.is_prompt() {
                    req.system_prompt = String::new();
                    agent.instructions = instructions;
                }
            }
        }

        if req.system_prompt.is_empty() && agent.instructions.is_set() {
            req.system_prompt = self
                .registry
                .get_dynamic_instruction(session, &agent.instructions)
                .await?;
        }

        if req.top_p.is_none() {
            req.top_p = agent.top_p;
        }
        if req.temperature.is_none() {
            req.temperature = agent.temperature;
        }
        if req.truncation.is_empty() {
            req.truncation = agent.truncation.clone();
        }
        if req.max_tokens.is_none() {
            req.max_tokens = agent.max_tokens;
        }
        if req.tool_choice.is_empty() {
            req.tool_choice = agent.tool_choice.clone();
        }
        if previous.is_some() {
            // Forcing a tool on a follow-on turn would loop forever.
            req.tool_choice = String::new();
        }

        if req.output_schema.is_none() {
            if let Some(output) = &agent.output {
                let schema = output.to_schema();
                if !schema.is_null() {
                    req.output_schema = Some(OutputSchema {
                        name: output.name.clone(),
                        description: output.description.clone(),
                        schema,
                        strict: output.strict,
                    });
                }
            }
        }
        if let Some(schema) = &mut req.output_schema {
            if schema.name.is_empty() {
                schema.name = "output_schema".to_string();
            }
        }

        req.model = agent.model.clone();

        let mappings = self.add_tools(session, &mut req, &agent).await?;
        Ok((req, mappings))
    }

    async fn add_tools(
        &self,
        session: &Arc<Session>,
        req: &mut CompletionRequest,
        agent: &crate::core::config::Agent,
    ) -> Result<ToolMappings> {
        let references: Vec<String> = agent
            .tools
            .iter()
            .chain(agent.agents.iter())
            .chain(agent.flows.iter())
            .cloned()
            .collect();
        let mappings = self
            .registry
            .build_tool_mappings(session, &references)
            .await
            .map_err(|err| Error::semantic(format!("failed to build tool mappings: {err}")))?;

        let mut names: Vec<&String> = mappings.keys().collect();
        names.sort();
        for name in names {
            let mapping = &mappings[name];
            let Some(tool) = mapping.target.as_tool() else {
                continue;
            };
            req.tools.push(ToolUseDefinition {
                name: name.clone(),
                parameters: tool.input_schema.clone(),
                description: tool.description.clone(),
                attributes: agent.tool_extensions.get(name).cloned(),
            });
        }

        Ok(mappings)
    }

    /// Resolves every unresolved tool call in the current response.
    /// External targets pass the confirmation gate first; in-process
    /// agents and flows are always accepted.
    async fn tool_calls(
        &self,
        session: &Arc<Session>,
        run: &mut Run,
        opts: &CompletionOptions,
    ) -> Result<()> {
        let calls: Vec<ToolCall> = run
            .response
            .as_ref()
            .map(|response| {
                response
                    .output
                    .iter()
                    .filter_map(|item| match item {
                        CompletionItem::ToolCall(call) => Some(call.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        for call in calls {
            if run
                .tool_outputs
                .get(&call.call_id)
                .is_some_and(|output| output.done)
            {
                continue;
            }

            let Some(target) = run.tool_mappings.get(&call.name).cloned() else {
                return Err(Error::semantic(format!(
                    "can not map tool {} to a MCP server",
                    call.name
                )));
            };

            if self.registry.confirm_is_external(&target.mcp_server) {
                if let Some(confirmations) = &self.confirmations {
                    confirmations.confirm(session, &target, &call).await?;
                }
            }

            debug!(tool = %call.name, call_id = %call.call_id, server = %target.mcp_server, "invoking tool");
            let output = self.invoke(session, &target, &call, opts).await.map_err(|err| {
                Error::semantic(format!(
                    "failed to invoke tool {} on MCP server {}: {err}",
                    call.name, target.mcp_server
                ))
            })?;

            run.tool_outputs.insert(
                call.call_id.clone(),
                ToolOutput {
                    output,
                    done: true,
                },
            );
        }

        if run.tool_outputs.is_empty() {
            run.done = true;
        }
        Ok(())
    }

    async fn invoke(
        &self,
        session: &Arc<Session>,
        target: &crate::tools::TargetMapping,
        call: &ToolCall,
        opts: &CompletionOptions,
    ) -> Result<Vec<CompletionItem>> {
        let args: Value = if call.arguments.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&call.arguments).map_err(|err| {
                Error::semantic(format!("failed to decode tool call arguments: {err}"))
            })?
        };

        let result = self
            .registry
            .call(
                session,
                &target.mcp_server,
                &target.target_name,
                args,
                CallOptions {
                    progress_token: opts.progress_token.clone(),
                    ..CallOptions::default()
                },
            )
            .await?;

        Ok(vec![CompletionItem::ToolCallOutput(ToolCallOutput {
            call_id: call.call_id.clone(),
            output_role: String::new(),
            output: result,
        })])
    }
}

#[async_trait]
impl Completer for Agents {
    async fn complete(
        &self,
        session: &Arc<Session>,
        req: CompletionRequest,
        opts: CompletionOptions,
    ) -> Result<CompletionResponse> {
        Agents::complete(self, session, req, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::completion::Reasoning;
    use crate::mcp::types::{CallToolResult, Content, CreateMessageRequest, CreateMessageResult};
    use crate::tools::{Sampler, SamplerOptions, ServiceOptions};
    use serde_json::json;
    use std::sync::Mutex;

    /// Plays back scripted responses and records every request.
    struct Scripted {
        responses: Mutex<Vec<CompletionResponse>>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl Scripted {
        fn new(responses: Vec<CompletionResponse>) -> Arc<Self> {
            Arc::new(Scripted {
                responses: Mutex::new(responses),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().expect("lock").len()
        }

        fn request(&self, index: usize) -> CompletionRequest {
            self.seen.lock().expect("lock")[index].clone()
        }
    }

    #[async_trait]
    impl Completer for Scripted {
        async fn complete(
            &self,
            _session: &Arc<Session>,
            req: CompletionRequest,
            _opts: CompletionOptions,
        ) -> Result<CompletionResponse> {
            self.seen.lock().expect("lock").push(req);
            let mut responses = self.responses.lock().expect("lock");
            if responses.is_empty() {
                return Err(Error::semantic("script exhausted"));
            }
            Ok(responses.remove(0))
        }
    }

    /// Routes agent-backed tool calls straight back as text.
    struct SubAgentSampler;

    #[async_trait]
    impl Sampler for SubAgentSampler {
        async fn sample(
            &self,
            _session: &Arc<Session>,
            req: CreateMessageRequest,
            _opts: SamplerOptions,
        ) -> Result<CreateMessageResult> {
            let prompt = req
                .messages
                .last()
                .and_then(|m| m.content.as_text())
                .unwrap_or_default();
            Ok(CreateMessageResult {
                content: Content::text(format!("sub:{prompt}")),
                role: "assistant".to_string(),
                model: "sub".to_string(),
                stop_reason: String::new(),
            })
        }
    }

    fn driver(
        config: Value,
        completer: Arc<dyn Completer>,
        confirmations: Option<Arc<confirm::Service>>,
    ) -> Arc<Agents> {
        let config: Config = serde_json::from_value(config).expect("config");
        let registry = Service::new(config.clone(), ServiceOptions::default());
        registry.set_sampler(Arc::new(SubAgentSampler));
        Agents::new(completer, registry, confirmations, config)
    }

    fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            output: vec![CompletionItem::assistant_text(text)],
            model: "m".to_string(),
        }
    }

    fn tool_call_response(name: &str, call_id: &str, args: Value) -> CompletionResponse {
        CompletionResponse {
            output: vec![CompletionItem::ToolCall(ToolCall {
                id: String::new(),
                call_id: call_id.to_string(),
                name: name.to_string(),
                arguments: args.to_string(),
            })],
            model: "m".to_string(),
        }
    }

    #[tokio::test]
    async fn toolless_turn_completes_and_persists_the_run() {
        let completer = Scripted::new(vec![text_response("hi")]);
        let agents = driver(
            json!({"agents": {"bot": {"model": "echo"}}}),
            completer.clone(),
            None,
        );
        let session = Session::empty("s");

        let response = agents
            .complete(
                &session,
                CompletionRequest {
                    model: "bot".to_string(),
                    input: vec![CompletionItem::user_text("hi")],
                    ..CompletionRequest::default()
                },
                CompletionOptions::default(),
            )
            .await
            .expect("complete");

        assert_eq!(response.output, vec![CompletionItem::assistant_text("hi")]);
        assert_eq!(completer.calls(), 1);
        // The underlying model id replaced the agent name on the wire.
        assert_eq!(completer.request(0).model, "echo");
        assert!(session.get_attribute("previous_run/bot").is_some());
    }

    #[tokio::test]
    async fn agent_defaults_fill_unset_fields_only() {
        let completer = Scripted::new(vec![text_response("ok")]);
        let agents = driver(
            json!({"agents": {"bot": {
                "model": "m",
                "temperature": 0.5,
                "topP": 0.9,
                "maxTokens": 256,
                "truncation": "auto",
                "instructions": "be brief",
            }}}),
            completer.clone(),
            None,
        );
        let session = Session::empty("s");

        agents
            .complete(
                &session,
                CompletionRequest {
                    model: "bot".to_string(),
                    temperature: Some(0.1),
                    ..CompletionRequest::default()
                },
                CompletionOptions::default(),
            )
            .await
            .expect("complete");

        let sent = completer.request(0);
        assert_eq!(sent.temperature, Some(0.1));
        assert_eq!(sent.top_p, Some(0.9));
        assert_eq!(sent.max_tokens, Some(256));
        assert_eq!(sent.truncation, "auto");
        assert_eq!(sent.system_prompt, "be brief");
    }

    #[tokio::test]
    async fn tool_round_trip_folds_outputs_in_call_id_order() {
        let completer = Scripted::new(vec![
            CompletionResponse {
                output: vec![
                    CompletionItem::ToolCall(ToolCall {
                        id: String::new(),
                        call_id: "call_b".to_string(),
                        name: "sub".to_string(),
                        arguments: json!({"prompt": "two"}).to_string(),
                    }),
                    CompletionItem::ToolCall(ToolCall {
                        id: String::new(),
                        call_id: "call_a".to_string(),
                        name: "sub".to_string(),
                        arguments: json!({"prompt": "one"}).to_string(),
                    }),
                ],
                model: "m".to_string(),
            },
            text_response("done"),
        ]);
        let agents = driver(
            json!({"agents": {
                "bot": {"model": "m", "agents": ["sub"]},
                "sub": {"model": "m2"},
            }}),
            completer.clone(),
            None,
        );
        let session = Session::empty("s");

        let response = agents
            .complete(
                &session,
                CompletionRequest {
                    model: "bot".to_string(),
                    input: vec![CompletionItem::user_text("go")],
                    ..CompletionRequest::default()
                },
                CompletionOptions::default(),
            )
            .await
            .expect("complete");

        assert_eq!(response.output, vec![CompletionItem::assistant_text("done")]);
        assert_eq!(completer.calls(), 2);

        // The follow-on request replays history then tool outputs
        // sorted by callID (call_a before call_b), despite emission
        // order being b, a.
        let follow_on = completer.request(1);
        let call_ids: Vec<String> = follow_on
            .input
            .iter()
            .filter_map(|item| match item {
                CompletionItem::ToolCallOutput(output) => Some(output.call_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(call_ids, vec!["call_a".to_string(), "call_b".to_string()]);
    }

    #[tokio::test]
    async fn reasoning_items_are_not_replayed() {
        let completer = Scripted::new(vec![
            CompletionResponse {
                output: vec![
                    CompletionItem::Reasoning(Reasoning {
                        id: "r1".to_string(),
                        encrypted_content: "opaque".to_string(),
                        summary: Vec::new(),
                    }),
                    CompletionItem::ToolCall(ToolCall {
                        id: String::new(),
                        call_id: "c1".to_string(),
                        name: "sub".to_string(),
                        arguments: json!({"prompt": "x"}).to_string(),
                    }),
                ],
                model: "m".to_string(),
            },
            text_response("done"),
        ]);
        let agents = driver(
            json!({"agents": {
                "bot": {"model": "m", "agents": ["sub"]},
                "sub": {},
            }}),
            completer.clone(),
            None,
        );
        let session = Session::empty("s");

        agents
            .complete(
                &session,
                CompletionRequest {
                    model: "bot".to_string(),
                    input: vec![CompletionItem::user_text("go")],
                    ..CompletionRequest::default()
                },
                CompletionOptions::default(),
            )
            .await
            .expect("complete");

        let follow_on = completer.request(1);
        assert!(follow_on
            .input
            .iter()
            .all(|item| !matches!(item, CompletionItem::Reasoning(_))));
        // The tool call itself is replayed.
        assert!(follow_on
            .input
            .iter()
            .any(|item| matches!(item, CompletionItem::ToolCall(_))));
    }

    #[tokio::test]
    async fn tool_choice_clears_on_follow_on_turns() {
        let completer = Scripted::new(vec![
            tool_call_response("sub", "c1", json!({"prompt": "x"})),
            text_response("done"),
        ]);
        let agents = driver(
            json!({"agents": {
                "bot": {"model": "m", "agents": ["sub"], "toolChoice": "sub"},
                "sub": {},
            }}),
            completer.clone(),
            None,
        );
        let session = Session::empty("s");

        agents
            .complete(
                &session,
                CompletionRequest {
                    model: "bot".to_string(),
                    input: vec![CompletionItem::user_text("go")],
                    ..CompletionRequest::default()
                },
                CompletionOptions::default(),
            )
            .await
            .expect("complete");

        assert_eq!(completer.request(0).tool_choice, "sub");
        assert_eq!(completer.request(1).tool_choice, "");
    }

    #[tokio::test]
    async fn unknown_tool_names_fail_the_turn() {
        let completer = Scripted::new(vec![tool_call_response("ghost", "c1", json!({}))]);
        let agents = driver(
            json!({"agents": {"bot": {"model": "m"}}}),
            completer.clone(),
            None,
        );
        let session = Session::empty("s");

        let err = agents
            .complete(
                &session,
                CompletionRequest {
                    model: "bot".to_string(),
                    input: vec![CompletionItem::user_text("go")],
                    ..CompletionRequest::default()
                },
                CompletionOptions::default(),
            )
            .await
            .expect_err("unmapped tool");
        assert!(err.to_string().contains("can not map tool"));
    }

    #[tokio::test]
    async fn chat_history_replays_previous_turns() {
        let completer = Scripted::new(vec![text_response("first"), text_response("second")]);
        let agents = driver(
            json!({"agents": {"bot": {"model": "m"}}}),
            completer.clone(),
            None,
        );
        let session = Session::empty("s");

        for prompt in ["one", "two"] {
            agents
                .complete(
                    &session,
                    CompletionRequest {
                        model: "bot".to_string(),
                        input: vec![CompletionItem::user_text(prompt)],
                        ..CompletionRequest::default()
                    },
                    CompletionOptions::default(),
                )
                .await
                .expect("complete");
        }

        let second = completer.request(1);
        assert_eq!(
            second.input,
            vec![
                CompletionItem::user_text("one"),
                CompletionItem::assistant_text("first"),
                CompletionItem::user_text("two"),
            ]
        );
    }

    #[tokio::test]
    async fn chat_history_off_forgets_previous_turns() {
        let completer = Scripted::new(vec![text_response("first"), text_response("second")]);
        let agents = driver(
            json!({"agents": {"bot": {"model": "m", "chatHistory": false}}}),
            completer.clone(),
            None,
        );
        let session = Session::empty("s");

        for prompt in ["one", "two"] {
            agents
                .complete(
                    &session,
                    CompletionRequest {
                        model: "bot".to_string(),
                        input: vec![CompletionItem::user_text(prompt)],
                        ..CompletionRequest::default()
                    },
                    CompletionOptions::default(),
                )
                .await
                .expect("complete");
        }

        let second = completer.request(1);
        assert_eq!(second.input, vec![CompletionItem::user_text("two")]);
        assert!(session.get_attribute("previous_run/bot").is_none());
    }

    #[tokio::test]
    async fn unknown_models_pass_through_untouched() {
        let completer = Scripted::new(vec![text_response("raw")]);
        let agents = driver(json!({}), completer.clone(), None);
        let session = Session::empty("s");

        agents
            .complete(
                &session,
                CompletionRequest {
                    model: "gpt-raw".to_string(),
                    ..CompletionRequest::default()
                },
                CompletionOptions::default(),
            )
            .await
            .expect("complete");
        assert_eq!(completer.request(0).model, "gpt-raw");
    }
}
