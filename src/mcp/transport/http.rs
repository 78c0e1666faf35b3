//! HTTP client wire.
//!
//! Speaks both server dialects. Streamable HTTP: every request is a
//! POST; the response body is one envelope as JSON or a single SSE
//! event; a GET to the same URL opens the reverse stream. Legacy SSE:
//! the initial GET yields an `endpoint` event naming the POST URL and
//! all server traffic arrives on that original stream. Dialect choice
//! happens at initialize time: a non-2xx POST falls back to legacy.

use crate::error::{Error, Result};
use crate::mcp::message::Message;
use crate::mcp::transport::sse::{is_event_stream, SseDecoder, SseEvent};
use crate::mcp::transport::{Wire, WireHandler};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POST_TIMEOUT: Duration = Duration::from_secs(120);
const SESSION_ID_HEADER: &str = "Mcp-Session-Id";

pub struct HttpWire {
    server_name: String,
    base_url: String,
    message_url: Mutex<String>,
    headers: Mutex<HashMap<String, String>>,
    client: reqwest::Client,
    handler: Mutex<Option<WireHandler>>,
    cancel: CancellationToken,
    initialized: AtomicBool,
    legacy_sse: AtomicBool,
    self_handle: Weak<HttpWire>,
}

impl HttpWire {
    pub fn new(
        server_name: impl Into<String>,
        base_url: impl Into<String>,
        headers: HashMap<String, String>,
    ) -> Result<Arc<Self>> {
        // No whole-request timeout on the shared client: it would sever
        // long-lived SSE streams. POSTs set their own deadline.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| Error::transport(format!("failed to build HTTP client: {err}")))?;
        let base_url = base_url.into();
        let server_name = server_name.into();
        Ok(Arc::new_cyclic(|weak| HttpWire {
            server_name,
            message_url: Mutex::new(base_url.clone()),
            base_url,
            headers: Mutex::new(headers),
            client,
            handler: Mutex::new(None),
            cancel: CancellationToken::new(),
            initialized: AtomicBool::new(false),
            legacy_sse: AtomicBool::new(false),
            self_handle: weak.clone(),
        }))
    }

    fn self_arc(&self) -> Result<Arc<HttpWire>> {
        self.self_handle
            .upgrade()
            .ok_or_else(|| Error::transport("wire dropped"))
    }

    fn handler(&self) -> Result<WireHandler> {
        self.handler
            .lock()
            .expect("handler lock poisoned")
            .clone()
            .ok_or_else(|| Error::transport("wire not started"))
    }

    fn dispatch(&self, msg: Message) {
        if let Ok(handler) = self.handler() {
            tokio::spawn(handler(msg));
        }
    }

    fn message_url(&self) -> String {
        self.message_url
            .lock()
            .expect("message url lock poisoned")
            .clone()
    }

    fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in self.headers.lock().expect("headers lock poisoned").iter() {
            request = request.header(key, value);
        }
        request
    }

    async fn post(&self, url: &str, msg: &Message) -> Result<reqwest::Response> {
        let request = self
            .client
            .post(url)
            .timeout(POST_TIMEOUT)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(msg);
        let response = self.apply_headers(request).send().await?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.headers
                .lock()
                .expect("headers lock poisoned")
                .insert(SESSION_ID_HEADER.to_string(), session_id.to_string());
        }
        Ok(response)
    }

    /// Decodes a POST response body into at most one envelope.
    async fn read_response(response: reqwest::Response) -> Result<Option<Message>> {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(None);
        }
        if is_event_stream(&content_type) {
            let mut decoder = SseDecoder::new();
            let mut events = decoder.push(&body);
            if events.is_empty() {
                if let Some(event) = decoder.finish() {
                    events.push(event);
                }
            }
            let Some(event) = events.into_iter().find(|e| !e.data.is_empty()) else {
                return Ok(None);
            };
            return Ok(Some(serde_json::from_str(&event.data)?));
        }
        Ok(Some(serde_json::from_slice(&body)?))
    }

    async fn initialize(self: &Arc<Self>, msg: Message) -> Result<()> {
        let response = self.post(&self.base_url, &msg).await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            debug!(
                server = %self.server_name,
                %status,
                "streamable initialize refused, falling back to SSE dialect"
            );
            return self.start_sse(Some(msg)).await.map_err(|err| {
                Error::transport(format!(
                    "failed to initialize streamable client ({status}: {body}); SSE fallback failed: {err}"
                ))
            });
        }

        if let Some(reply) = Self::read_response(response).await? {
            self.dispatch(reply);
        }

        // Reverse channel; a 405 means the server has none.
        self.start_sse(None).await
    }

    /// Opens the SSE stream and spawns the reader. For the legacy
    /// dialect this also consumes the `endpoint` event and replays the
    /// initialize POST against the advertised URL before returning.
    async fn start_sse(self: &Arc<Self>, init_msg: Option<Message>) -> Result<()> {
        let mut init_msg = init_msg;
        let (response, decoder, pending_events) =
            match self.connect_stream(init_msg.as_mut(), None).await? {
                Some(connected) => connected,
                None => return Ok(()),
            };

        let wire = self.clone();
        tokio::spawn(wire.read_stream(response, decoder, pending_events, init_msg));
        Ok(())
    }

    /// One GET + (for legacy) endpoint handling. Returns `None` when the
    /// server answered 405 to a reverse-channel GET: the session then
    /// operates without server-initiated traffic.
    async fn connect_stream(
        &self,
        init_msg: Option<&mut Message>,
        last_event_id: Option<String>,
    ) -> Result<Option<(reqwest::Response, SseDecoder, Vec<SseEvent>)>> {
        let legacy = init_msg.is_some();
        let mut request = self
            .client
            .get(&self.base_url)
            .header("Accept", "text/event-stream");
        if let Some(last) = &last_event_id {
            request = request.header("Last-Event-ID", last);
        }
        let response = self.apply_headers(request).send().await?;

        if response.status() != reqwest::StatusCode::OK {
            if !legacy && response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED {
                debug!(server = %self.server_name, "no reverse SSE channel (405)");
                return Ok(None);
            }
            return Err(Error::transport(format!(
                "failed to connect to SSE server: {}",
                response.status()
            )));
        }

        let mut decoder = SseDecoder::new();
        let mut pending = Vec::new();

        if let Some(init_msg) = init_msg {
            let mut response = response;
            let endpoint = loop {
                if let Some(index) = pending.iter().position(|e: &SseEvent| e.event == "endpoint") {
                    break pending.remove(index);
                }
                let chunk = response
                    .chunk()
                    .await?
                    .ok_or_else(|| Error::transport("SSE stream ended before endpoint event"))?;
                pending.extend(decoder.push(&chunk));
            };

            let message_url = join_endpoint(&self.base_url, &endpoint.data)?;
            debug!(server = %self.server_name, %message_url, "SSE endpoint received");
            *self.message_url.lock().expect("message url lock poisoned") = message_url.clone();
            self.legacy_sse.store(true, Ordering::SeqCst);

            // Replays carry a fresh id so the server treats them as new.
            if last_event_id.is_some() {
                init_msg.id = Some(Value::String(uuid::Uuid::new_v4().to_string()));
            }
            let init_response = self.post(&message_url, init_msg).await?;
            let status = init_response.status();
            if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::ACCEPTED {
                let body = init_response.text().await.unwrap_or_default();
                return Err(Error::transport(format!(
                    "failed to POST initialize message, got status {status}: {body}"
                )));
            }
            return Ok(Some((response, decoder, pending)));
        }

        Ok(Some((response, decoder, pending)))
    }

    /// Reads envelopes off the stream until it ends, then reconnects
    /// with `Last-Event-ID` set to the id of the last envelope seen.
    /// Permanent reconnect failure closes the wire. Boxed because the
    /// reconnect path respawns itself.
    fn read_stream(
        self: Arc<Self>,
        response: reqwest::Response,
        mut decoder: SseDecoder,
        pending_events: Vec<SseEvent>,
        mut init_msg: Option<Message>,
    ) -> futures_util::future::BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut last_event_id: Option<String> = None;
            for event in pending_events {
                self.handle_event(event, &mut last_event_id);
            }

            let mut stream = response.bytes_stream();
            loop {
                let chunk = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    chunk = stream.next() => chunk,
                };
                match chunk {
                    Some(Ok(chunk)) => {
                        for event in decoder.push(&chunk) {
                            self.handle_event(event, &mut last_event_id);
                        }
                    }
                    Some(Err(err)) => {
                        warn!(server = %self.server_name, %err, "SSE read failed");
                        break;
                    }
                    None => break,
                }
            }

            if self.cancel.is_cancelled() {
                return;
            }

            debug!(server = %self.server_name, last_event_id = ?last_event_id, "SSE stream ended, reconnecting");
            match self
                .connect_stream(init_msg.as_mut(), last_event_id.clone())
                .await
            {
                Ok(Some((response, decoder, pending))) => {
                    let wire = self.clone();
                    tokio::spawn(wire.read_stream(response, decoder, pending, init_msg));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(server = %self.server_name, %err, "failed to reconnect to SSE server");
                    self.cancel.cancel();
                }
            }
        })
    }

    fn handle_event(&self, event: SseEvent, last_event_id: &mut Option<String>) {
        if !event.event.is_empty() && event.event != "message" {
            return;
        }
        if event.data.is_empty() {
            return;
        }
        let msg: Message = match serde_json::from_str(&event.data) {
            Ok(msg) => msg,
            Err(_) => return,
        };
        if let Some(id) = &msg.id {
            *last_event_id = Some(id_to_header(id));
        }
        debug!(server = %self.server_name, method = ?msg.method, id = ?msg.id, "<- sse");
        self.dispatch(msg);
    }
}

fn id_to_header(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The endpoint event names a relative URL; only its path and query are
/// taken, grafted onto the base URL's scheme and authority.
fn join_endpoint(base_url: &str, endpoint: &str) -> Result<String> {
    let base = reqwest::Url::parse(base_url)
        .map_err(|err| Error::transport(format!("failed to parse SSE URL: {err}")))?;
    let target = base
        .join(endpoint)
        .map_err(|err| Error::transport(format!("failed to parse returned SSE URL: {err}")))?;
    let mut result = base;
    result.set_path(target.path());
    result.set_query(target.query());
    Ok(result.to_string())
}

#[async_trait]
impl Wire for HttpWire {
    async fn start(&self, handler: WireHandler) -> Result<()> {
        *self.handler.lock().expect("handler lock poisoned") = Some(handler);
        Ok(())
    }

    async fn send(&self, msg: Message) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            if msg.method.as_deref() != Some("initialize") {
                return Err(Error::protocol(
                    "client not initialized, must send initialize first",
                ));
            }
            let this = self.self_arc()?;
            this.initialize(msg).await?;
            self.initialized.store(true, Ordering::SeqCst);
            return Ok(());
        }

        let url = self.message_url();
        let response = self.post(&url, &msg).await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::ACCEPTED {
            return Err(Error::transport(format!("failed to send message: {status}")));
        }

        if self.legacy_sse.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(reply) = Self::read_response(response).await? {
            self.dispatch(reply);
        }
        Ok(())
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    async fn wait(&self) {
        self.cancel.cancelled().await;
    }
}
