//! Completer routing.
//!
//! Concrete provider adapters live behind the [`Completer`] trait and
//! register here under a model-id prefix; the longest matching prefix
//! wins. The bundled [`EchoCompleter`] answers with the last user text
//! and exists for wiring checks and local demos.

use crate::core::completion::{
    CompletionItem, CompletionOptions, CompletionRequest, CompletionResponse, Completer,
};
use crate::error::{Error, Result};
use crate::mcp::session::Session;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Default)]
pub struct Client {
    routes: Vec<(String, Arc<dyn Completer>)>,
    fallback: Option<Arc<dyn Completer>>,
}

impl Client {
    pub fn new() -> Self {
        Client::default()
    }

    /// Routes models whose id starts with `prefix` to `adapter`.
    pub fn with_adapter(mut self, prefix: impl Into<String>, adapter: Arc<dyn Completer>) -> Self {
        self.routes.push((prefix.into(), adapter));
        self
    }

    pub fn with_fallback(mut self, adapter: Arc<dyn Completer>) -> Self {
        self.fallback = Some(adapter);
        self
    }

    fn route(&self, model: &str) -> Option<&Arc<dyn Completer>> {
        self.routes
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, adapter)| adapter)
            .or(self.fallback.as_ref())
    }
}

#[async_trait]
impl Completer for Client {
    async fn complete(
        &self,
        session: &Arc<Session>,
        req: CompletionRequest,
        opts: CompletionOptions,
    ) -> Result<CompletionResponse> {
        let Some(adapter) = self.route(&req.model) else {
            return Err(Error::semantic(format!(
                "no completer registered for model {:?}",
                req.model
            )));
        };
        adapter.complete(session, req, opts).await
    }
}

/// Returns the last user text message verbatim as one assistant message.
pub struct EchoCompleter;

#[async_trait]
impl Completer for EchoCompleter {
    async fn complete(
        &self,
        _session: &Arc<Session>,
        req: CompletionRequest,
        _opts: CompletionOptions,
    ) -> Result<CompletionResponse> {
        let text = req
            .input
            .iter()
            .rev()
            .find_map(|item| match item {
                CompletionItem::Message { role, content } if role == "user" => {
                    content.iter().find_map(|c| c.as_text().map(str::to_string))
                }
                _ => None,
            })
            .unwrap_or_default();
        Ok(CompletionResponse {
            output: vec![CompletionItem::assistant_text(text)],
            model: req.model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::types::Content;

    struct Named(&'static str);

    #[async_trait]
    impl Completer for Named {
        async fn complete(
            &self,
            _session: &Arc<Session>,
            _req: CompletionRequest,
            _opts: CompletionOptions,
        ) -> Result<CompletionResponse> {
            Ok(CompletionResponse {
                model: self.0.to_string(),
                ..CompletionResponse::default()
            })
        }
    }

    #[tokio::test]
    async fn longest_prefix_wins() {
        let client = Client::new()
            .with_adapter("gpt", Arc::new(Named("responses")))
            .with_adapter("gpt-4.1-mini", Arc::new(Named("mini")))
            .with_fallback(Arc::new(Named("fallback")));
        let session = Session::empty("t");

        let req = CompletionRequest {
            model: "gpt-4.1-mini".to_string(),
            ..CompletionRequest::default()
        };
        let resp = client
            .complete(&session, req, CompletionOptions::default())
            .await
            .expect("routed");
        assert_eq!(resp.model, "mini");

        let other = CompletionRequest {
            model: "claude-sonnet".to_string(),
            ..CompletionRequest::default()
        };
        let resp = client
            .complete(&session, other, CompletionOptions::default())
            .await
            .expect("fallback");
        assert_eq!(resp.model, "fallback");
    }

    #[tokio::test]
    async fn missing_route_is_a_semantic_error() {
        let client = Client::new();
        let session = Session::empty("t");
        let err = client
            .complete(
                &session,
                CompletionRequest {
                    model: "mystery".to_string(),
                    ..CompletionRequest::default()
                },
                CompletionOptions::default(),
            )
            .await
            .expect_err("no adapters");
        assert!(err.to_string().contains("no completer registered"));
    }

    #[tokio::test]
    async fn echo_returns_the_last_user_text() {
        let session = Session::empty("t");
        let req = CompletionRequest {
            model: "echo".to_string(),
            input: vec![
                CompletionItem::user_text("first"),
                CompletionItem::assistant_text("ignored"),
                CompletionItem::Message {
                    role: "user".to_string(),
                    content: vec![Content::text("hi")],
                },
            ],
            ..CompletionRequest::default()
        };
        let resp = EchoCompleter
            .complete(&session, req, CompletionOptions::default())
            .await
            .expect("echo");
        assert_eq!(
            resp.output,
            vec![CompletionItem::assistant_text("hi")]
        );
    }
}
