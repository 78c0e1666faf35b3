//! The flow interpreter.
//!
//! A flow runs its steps in order and returns the last step's result.
//! Each step's output lands in the data map under the step id and is
//! mirrored to `previous`; `forEach` may fan out in parallel over
//! cloned data maps so workers never race on writes.

use super::{CallOptions, Service};
use crate::core::config::{Step, ToolRef};
use crate::error::{Error, Result};
use crate::mcp::session::Session;
use crate::mcp::types::{CallToolResult, ProgressNotification};
use futures_util::future::BoxFuture;
use futures_util::{StreamExt, TryStreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) struct FlowContext {
    session: Arc<Session>,
    progress_token: Option<Value>,
    env: HashMap<String, String>,
    data: HashMap<String, Value>,
}

impl Service {
    pub(crate) async fn run_flow(
        &self,
        session: &Arc<Session>,
        flow_name: &str,
        args: Value,
        opts: &CallOptions,
    ) -> Result<CallToolResult> {
        let flow = self
            .config
            .flows
            .get(flow_name)
            .cloned()
            .ok_or_else(|| Error::semantic(format!("failed to find flow {flow_name} in config")))?;

        let data = HashMap::from([
            ("id".to_string(), json!(uuid::Uuid::new_v4().to_string())),
            ("flow".to_string(), json!(flow_name)),
            ("input".to_string(), args),
        ]);
        let mut ctx = FlowContext {
            session: session.clone(),
            progress_token: opts.progress_token.clone(),
            env: session.env_map(),
            data,
        };

        self.run_steps(&mut ctx, &flow.steps).await
    }

    async fn run_steps(&self, ctx: &mut FlowContext, steps: &[Step]) -> Result<CallToolResult> {
        for (index, step) in steps.iter().enumerate() {
            let mut step = step.clone();
            if step.id.is_empty() {
                step.id = uuid::Uuid::new_v4().to_string();
            }
            let id = step.id.clone();

            let out = self
                .run_step(ctx, step)
                .await
                .map_err(|err| Error::semantic(format!("failed to run step {index} ({id}): {err}")))?;

            if index == steps.len() - 1 {
                return Ok(out);
            }
        }

        Ok(CallToolResult::default())
    }

    /// Boxed because nested `steps` and loop bodies recurse.
    fn run_step<'a>(
        &'a self,
        ctx: &'a mut FlowContext,
        mut step: Step,
    ) -> BoxFuture<'a, Result<CallToolResult>> {
        Box::pin(async move {
            if step.id.is_empty() {
                step.id = uuid::Uuid::new_v4().to_string();
            }

            if let Some(call) = step.call() {
                if !step.steps.is_empty() {
                    return Err(Error::semantic(format!(
                        "step {} cannot have both a call target ({call}) and nested steps",
                        step.id
                    )));
                }
            }

            let mut set_keys: Vec<&String> = step.set.keys().collect();
            set_keys.sort();
            for key in set_keys {
                let value = &step.set[key];
                if value.is_null() {
                    ctx.data.remove(key.as_str());
                } else {
                    let evaluated = self.evaluator.eval_any(&ctx.env, &ctx.data, value)?;
                    ctx.data.insert(key.clone(), evaluated);
                }
            }

            let result = if step.for_each.is_some() {
                self.run_step_for_each(ctx, step.clone()).await
            } else if step.while_.is_some() {
                self.run_step_while(ctx, step.clone()).await
            } else {
                self.run_step_call(ctx, &step).await
            };

            if let Ok(out) = &result {
                let output = to_output(out);
                ctx.data.insert(step.id.clone(), output.clone());
                ctx.data.insert("previous".to_string(), output);
                self.log_flow_state(ctx).await;
            }
            result
        })
    }

    async fn run_step_call(&self, ctx: &mut FlowContext, step: &Step) -> Result<CallToolResult> {
        if let Some(condition) = &step.if_ {
            let proceed = self
                .evaluator
                .eval_bool(&ctx.env, &ctx.data, condition)
                .map_err(|err| {
                    Error::semantic(format!(
                        "failed to evaluate if condition for step {}: {err}",
                        step.id
                    ))
                })?;
            if !proceed {
                return Ok(CallToolResult::default());
            }
        }

        let input = self
            .evaluator
            .eval_object(&ctx.env, &ctx.data, step.input.as_ref())
            .map_err(|err| {
                Error::semantic(format!("failed to evaluate input for step {}: {err}", step.id))
            })?
            .unwrap_or(Value::Null);

        if let Some(call) = step.call() {
            let tool_ref = ToolRef::parse(call);
            return self
                .call(
                    &ctx.session,
                    &tool_ref.server,
                    &tool_ref.tool,
                    input,
                    CallOptions {
                        progress_token: ctx.progress_token.clone(),
                        agent_override: step.agent.clone(),
                        log_data: None,
                    },
                )
                .await;
        }

        self.run_steps(ctx, &step.steps).await
    }

    async fn run_step_for_each(
        &self,
        ctx: &mut FlowContext,
        mut step: Step,
    ) -> Result<CallToolResult> {
        let for_each = step.for_each.take().expect("checked by caller");
        let items = self
            .evaluator
            .eval_list(&ctx.env, &ctx.data, &for_each)
            .map_err(|err| {
                Error::semantic(format!("failed to evaluate forEach for step {}: {err}", step.id))
            })?;

        let parallel = step.parallel;
        step.parallel = false;
        if parallel {
            self.run_items_parallel(ctx, &step, items).await
        } else {
            self.run_items_sequential(ctx, &step, items).await
        }
    }

    /// Loop iterations are always sequential; the condition re-reads
    /// the data map each pass, so the body can end the loop through
    /// `set` or nested steps.
    async fn run_step_while(&self, ctx: &mut FlowContext, mut step: Step) -> Result<CallToolResult> {
        let condition = step.while_.take().expect("checked by caller");
        step.parallel = false;

        let var = item_var(&step);
        let saved = ctx.data.get(&var).cloned();
        let mut results = Vec::new();
        let mut iteration: u64 = 0;

        loop {
            let proceed = self.evaluator.eval_bool(&ctx.env, &ctx.data, &condition)?;
            if !proceed {
                break;
            }
            ctx.data.insert(var.clone(), json!(iteration));
            let out = self.run_step(ctx, step.clone()).await.map_err(|err| {
                Error::semantic(format!("failed to run while step {}: {err}", step.id))
            })?;
            results.push(to_output(&out));
            iteration += 1;
        }

        restore_var(ctx, &var, saved);
        Ok(aggregate(results))
    }

    async fn run_items_sequential(
        &self,
        ctx: &mut FlowContext,
        step: &Step,
        items: Vec<Value>,
    ) -> Result<CallToolResult> {
        let var = item_var(step);
        let saved = ctx.data.get(&var).cloned();
        let mut results = Vec::new();

        for item in items {
            ctx.data.insert(var.clone(), item);
            let out = self.run_step(ctx, step.clone()).await.map_err(|err| {
                Error::semantic(format!("failed to run forEach step {}: {err}", step.id))
            })?;
            results.push(to_output(&out));
        }

        restore_var(ctx, &var, saved);
        Ok(aggregate(results))
    }

    /// Bounded, order-preserving fan-out. Each worker runs over its own
    /// clone of the data map; the first error cancels the remaining
    /// work and discards collected results.
    async fn run_items_parallel(
        &self,
        ctx: &mut FlowContext,
        step: &Step,
        items: Vec<Value>,
    ) -> Result<CallToolResult> {
        let var = item_var(step);

        let workers = items.into_iter().map(|item| {
            let mut worker_ctx = FlowContext {
                session: ctx.session.clone(),
                progress_token: ctx.progress_token.clone(),
                env: ctx.env.clone(),
                data: ctx.data.clone(),
            };
            worker_ctx.data.insert(var.clone(), item);
            let step = step.clone();
            async move {
                let out = self
                    .run_step(&mut worker_ctx, step.clone())
                    .await
                    .map_err(|err| {
                        Error::semantic(format!("failed to run forEach step {}: {err}", step.id))
                    })?;
                Ok::<Value, Error>(to_output(&out))
            }
        });

        let results: Vec<Value> = futures_util::stream::iter(workers)
            .buffered(self.concurrency)
            .try_collect()
            .await?;
        Ok(aggregate(results))
    }

    async fn log_flow_state(&self, ctx: &FlowContext) {
        let Some(token) = &ctx.progress_token else {
            return;
        };
        let _ = ctx
            .session
            .send_payload(
                "notifications/progress",
                &ProgressNotification {
                    progress_token: token.clone(),
                    data: Some(json!({
                        "type": "nanobot/flow/state",
                        "flow": ctx.data,
                    })),
                    ..ProgressNotification::default()
                },
            )
            .await;
    }
}

fn item_var(step: &Step) -> String {
    if step.for_each_var.is_empty() {
        "item".to_string()
    } else {
        step.for_each_var.clone()
    }
}

fn restore_var(ctx: &mut FlowContext, var: &str, saved: Option<Value>) {
    match saved {
        Some(value) => {
            ctx.data.insert(var.to_string(), value);
        }
        None => {
            ctx.data.remove(var);
        }
    }
}

fn aggregate(results: Vec<Value>) -> CallToolResult {
    CallToolResult {
        is_error: false,
        content: Vec::new(),
        structured_content: Some(Value::Array(results)),
    }
}

/// The step-output shape stored in the data map: the raw content plus
/// an `output` convenience slot preferring structured content over the
/// trailing text item.
fn to_output(result: &CallToolResult) -> Value {
    let mut output = json!({
        "content": result.content,
        "isError": result.is_error,
    });
    let best = result.structured_content.clone().or_else(|| {
        result
            .content
            .iter()
            .find_map(|content| content.as_text().map(|text| json!(text)))
    });
    if let Some(best) = best {
        output["output"] = best;
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::mcp::session::NullHandler;
    use crate::mcp::transport::tests::ChannelWire;
    use crate::mcp::types::{Content, CreateMessageRequest, CreateMessageResult};
    use crate::tools::{Sampler, SamplerOptions, Service, ServiceOptions};
    use async_trait::async_trait;

    /// Echoes the last user message back; stands in for a real agent.
    struct EchoSampler;

    #[async_trait]
    impl Sampler for EchoSampler {
        async fn sample(
            &self,
            _session: &Arc<Session>,
            req: CreateMessageRequest,
            _opts: SamplerOptions,
        ) -> crate::error::Result<CreateMessageResult> {
            let text = req
                .messages
                .last()
                .and_then(|m| m.content.as_text())
                .unwrap_or_default()
                .to_string();
            Ok(CreateMessageResult {
                content: Content::text(text),
                role: "assistant".to_string(),
                model: "echo".to_string(),
                stop_reason: String::new(),
            })
        }
    }

    fn service(config: Value) -> Arc<Service> {
        let config: Config = serde_json::from_value(config).expect("config");
        let service = Service::new(config, ServiceOptions::default());
        service.set_sampler(Arc::new(EchoSampler));
        service
    }

    async fn wired_session() -> (
        Arc<Session>,
        tokio::sync::mpsc::UnboundedReceiver<crate::mcp::message::Message>,
    ) {
        let (wire, outbound) = ChannelWire::pair();
        let session = Session::start(wire, Arc::new(NullHandler), "flow-test", None)
            .await
            .expect("session");
        (session, outbound)
    }

    #[tokio::test]
    async fn sequential_steps_thread_previous_output() {
        let service = service(json!({
            "agents": {"echo": {}},
            "flows": {
                "pipeline": {
                    "steps": [
                        {"id": "first", "tool": "echo", "input": {"prompt": "one"}},
                        {"id": "second", "tool": "echo", "input": {"prompt": "again: ${previous.output}"}},
                    ],
                },
            },
        }));
        let (session, _outbound) = wired_session().await;

        let result = service
            .call(&session, "pipeline", "", Value::Null, CallOptions::default())
            .await
            .expect("flow");
        assert_eq!(result.content[0].as_text(), Some("again: one"));
    }

    #[tokio::test]
    async fn empty_flow_returns_empty_content() {
        let service = service(json!({"flows": {"nothing": {"steps": []}}}));
        let (session, _outbound) = wired_session().await;

        let result = service
            .call(&session, "nothing", "", Value::Null, CallOptions::default())
            .await
            .expect("flow");
        assert!(result.content.is_empty());
    }

    #[tokio::test]
    async fn for_each_parallel_preserves_input_order() {
        let service = service(json!({
            "agents": {"echo": {}},
            "flows": {
                "fanout": {
                    "steps": [
                        {"id": "spread", "tool": "echo", "forEach": [1, 2, 3], "parallel": true, "input": "${item}"},
                    ],
                },
            },
        }));
        let (session, mut outbound) = wired_session().await;

        let result = service
            .call(
                &session,
                "fanout",
                "",
                Value::Null,
                CallOptions {
                    progress_token: Some(json!("tok")),
                    ..CallOptions::default()
                },
            )
            .await
            .expect("flow");

        let outputs: Vec<Value> = result.structured_content.expect("structured")
            .as_array()
            .expect("array")
            .iter()
            .map(|entry| entry["output"].clone())
            .collect();
        assert_eq!(outputs, vec![json!(1), json!(2), json!(3)]);

        // One enclosing flow call plus one per element.
        let mut call_events = 0;
        while let Ok(msg) = outbound.try_recv() {
            if msg.method.as_deref() != Some("notifications/progress") {
                continue;
            }
            let params = msg.params.unwrap_or_default();
            if params["data"]["type"] == json!("nanobot/call") {
                call_events += 1;
            }
        }
        assert_eq!(call_events, 4);
    }

    #[tokio::test]
    async fn for_each_sequential_matches_parallel_output() {
        let config = json!({
            "agents": {"echo": {}},
            "flows": {
                "fanout": {
                    "steps": [
                        {"id": "spread", "tool": "echo", "forEach": ["a", "b"], "input": "${item}"},
                    ],
                },
            },
        });
        let sequential = service(config.clone());
        let (session, _outbound) = wired_session().await;
        let seq_result = sequential
            .call(&session, "fanout", "", Value::Null, CallOptions::default())
            .await
            .expect("sequential");

        let mut parallel_config = config;
        parallel_config["flows"]["fanout"]["steps"][0]["parallel"] = json!(true);
        let parallel = service(parallel_config);
        let par_result = parallel
            .call(&session, "fanout", "", Value::Null, CallOptions::default())
            .await
            .expect("parallel");

        assert_eq!(seq_result.structured_content, par_result.structured_content);
    }

    #[tokio::test]
    async fn while_loops_run_until_the_condition_clears() {
        let service = service(json!({
            "flows": {
                "looped": {
                    "steps": [
                        {"id": "init", "set": {"keep": true}},
                        {"id": "loop", "while": "${keep}", "steps": [
                            {"id": "body", "set": {"keep": false}},
                        ]},
                    ],
                },
            },
        }));
        let (session, _outbound) = wired_session().await;

        let result = service
            .call(&session, "looped", "", Value::Null, CallOptions::default())
            .await
            .expect("flow");
        let iterations = result.structured_content.expect("structured");
        assert_eq!(iterations.as_array().expect("array").len(), 1);
    }

    #[tokio::test]
    async fn false_guard_short_circuits_without_calling() {
        let service = service(json!({
            "agents": {"echo": {}},
            "flows": {
                "guarded": {
                    "steps": [
                        {"id": "skipped", "if": false, "tool": "echo", "input": {"prompt": "x"}},
                    ],
                },
            },
        }));
        let (session, mut outbound) = wired_session().await;

        let result = service
            .call(
                &session,
                "guarded",
                "",
                Value::Null,
                CallOptions {
                    progress_token: Some(json!("tok")),
                    ..CallOptions::default()
                },
            )
            .await
            .expect("flow");
        assert!(result.content.is_empty());

        // Only the enclosing flow call shows up.
        let mut call_events = 0;
        while let Ok(msg) = outbound.try_recv() {
            if msg.method.as_deref() != Some("notifications/progress") {
                continue;
            }
            let params = msg.params.unwrap_or_default();
            if params["data"]["type"] == json!("nanobot/call") {
                call_events += 1;
            }
        }
        assert_eq!(call_events, 1);
    }

    #[tokio::test]
    async fn set_with_null_deletes_and_ids_land_in_data() {
        let service = service(json!({
            "agents": {"echo": {}},
            "flows": {
                "stateful": {
                    "steps": [
                        {"id": "seed", "set": {"greeting": "hello"}, "tool": "echo", "input": {"prompt": "say ${greeting}"}},
                        {"id": "drop", "set": {"greeting": null}, "tool": "echo", "input": {"prompt": "say ${greeting}"}},
                    ],
                },
            },
        }));
        let (session, _outbound) = wired_session().await;

        let result = service
            .call(&session, "stateful", "", Value::Null, CallOptions::default())
            .await
            .expect("flow");
        // The binding is gone, so the template stays unexpanded; had the
        // delete not happened this would read "say hello".
        assert_eq!(result.content[0].as_text(), Some("say ${greeting}"));
    }
}
