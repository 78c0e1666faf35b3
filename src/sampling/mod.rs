//! Model selection for `sampling/createMessage`.
//!
//! Hints are matched against agent names, then aliases. Without a hit
//! every agent is scored as `cost·costPriority + speed·speedPriority +
//! intelligence·intelligencePriority` (absent priorities default to 1)
//! and the best score wins, ties going to the lexicographically first
//! name. The chosen agent's completion runs through the agent driver.

use crate::core::completion::{
    CompletionItem, CompletionOptions, CompletionRequest, Completer,
};
use crate::core::config::Config;
use crate::error::{Error, Result};
use crate::mcp::session::Session;
use crate::mcp::types::{
    Content, CreateMessageRequest, CreateMessageResult, ModelPreferences, ProgressNotification,
};
use crate::tools::{Sampler as SamplerSeam, SamplerOptions};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub struct Sampler {
    config: Config,
    completer: Arc<dyn Completer>,
}

impl Sampler {
    pub fn new(config: Config, completer: Arc<dyn Completer>) -> Arc<Self> {
        Arc::new(Sampler { config, completer })
    }

    fn matching_model(&self, preferences: &ModelPreferences) -> Option<String> {
        // Agent by name.
        for hint in &preferences.hints {
            if self.config.agents.contains_key(&hint.name) {
                return Some(hint.name.clone());
            }
        }

        let mut names: Vec<&String> = self.config.agents.keys().collect();
        names.sort();

        // Agent by alias.
        for hint in &preferences.hints {
            for name in &names {
                if self.config.agents[*name]
                    .aliases
                    .iter()
                    .any(|alias| alias == &hint.name)
                {
                    return Some((*name).clone());
                }
            }
        }

        // Weighted selection scores; hint weights never override names.
        let cost_priority = preferences.cost_priority.unwrap_or(1.0);
        let speed_priority = preferences.speed_priority.unwrap_or(1.0);
        let intelligence_priority = preferences.intelligence_priority.unwrap_or(1.0);

        let mut best: Option<(f64, &String)> = None;
        for name in &names {
            let agent = &self.config.agents[*name];
            let score = agent.cost * cost_priority
                + agent.speed * speed_priority
                + agent.intelligence * intelligence_priority;
            match best {
                Some((best_score, _)) if score <= best_score => {}
                _ => best = Some((score, name)),
            }
        }
        best.map(|(_, name)| name.clone())
    }

    fn build_request(&self, model: String, req: &CreateMessageRequest, opts: &SamplerOptions) -> CompletionRequest {
        let mut request = CompletionRequest {
            model,
            ..CompletionRequest::default()
        };
        if req.max_tokens != 0 {
            request.max_tokens = Some(req.max_tokens);
        }
        if !req.system_prompt.is_empty() {
            request.system_prompt = req.system_prompt.clone();
        }
        request.temperature = req.temperature;

        // Call-site overrides from flow steps.
        let overrides = &opts.agent_override;
        if overrides.temperature.is_some() {
            request.temperature = overrides.temperature;
        }
        if overrides.top_p.is_some() {
            request.top_p = overrides.top_p;
        }
        if !overrides.tool_choice.is_empty() {
            request.tool_choice = overrides.tool_choice.clone();
        }
        if let Some(output) = &overrides.output {
            request.output_schema = Some(crate::core::completion::OutputSchema {
                name: output.name.clone(),
                description: output.description.clone(),
                schema: output.to_schema(),
                strict: output.strict,
            });
        }

        for message in &req.messages {
            let content = match &message.content {
                Content::Text { .. } | Content::Image { .. } => message.content.clone(),
                _ => continue,
            };
            request.input.push(CompletionItem::Message {
                role: message.role.clone(),
                content: vec![content],
            });
        }
        request
    }
}

#[async_trait]
impl SamplerSeam for Sampler {
    async fn sample(
        &self,
        session: &Arc<Session>,
        req: CreateMessageRequest,
        opts: SamplerOptions,
    ) -> Result<CreateMessageResult> {
        let Some(model) = self.matching_model(&req.model_preferences) else {
            return Err(Error::semantic("no matching model found"));
        };
        debug!(%model, "sampling");

        let request = self.build_request(model.clone(), &req, &opts);

        let mut completion_opts = CompletionOptions {
            progress_token: opts.progress_token.clone(),
            chat_history: opts.agent_override.chat_history,
            progress: None,
        };

        // Provider deltas republish upward as progress notifications
        // with a session-monotone counter.
        let mut fanout = None;
        if let Some(token) = opts.progress_token.clone() {
            let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
            completion_opts.progress = Some(tx);
            let top = session.top();
            fanout = Some(tokio::spawn(async move {
                let mut counter = 0.0_f64;
                while let Some(payload) = rx.recv().await {
                    counter += 1.0;
                    let _ = top
                        .send_payload(
                            "notifications/progress",
                            &ProgressNotification {
                                progress_token: token.clone(),
                                progress: counter,
                                data: Some(payload),
                                ..ProgressNotification::default()
                            },
                        )
                        .await;
                }
            }));
        }

        let response = self.completer.complete(session, request, completion_opts).await;
        if let Some(fanout) = fanout {
            // All senders are gone once complete() returns; drain fully
            // so no delta publishes after this call resolves.
            let _ = fanout.await;
        }
        let response = response?;

        let mut role = String::new();
        let mut text: Option<String> = None;
        for output in &response.output {
            if let CompletionItem::Message { role: r, content } = output {
                role = r.clone();
                for item in content {
                    if let Some(t) = item.as_text() {
                        text = Some(t.to_string());
                    }
                }
            }
        }

        Ok(CreateMessageResult {
            content: Content::text(text.unwrap_or_else(|| "[NO CONTENT]".to_string())),
            role: if role.is_empty() {
                "assistant".to_string()
            } else {
                role
            },
            model,
            stop_reason: String::new(),
        })
    }
}
