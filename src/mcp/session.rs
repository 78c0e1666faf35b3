//! Sessions multiplex one wire.
//!
//! Outbound requests register in the pending table and block on a
//! oneshot channel; inbound messages either resolve a pending entry or
//! are dispatched to the session handler on their own task so a slow
//! handler cannot hold up the next message.

use crate::error::{Error, Result};
use crate::mcp::message::{Message, RpcError, JSONRPC_VERSION};
use crate::mcp::transport::{Wire, WireHandler};
use crate::mcp::types::{ClientCapabilities, InitializeRequest, ProgressNotification, ServerCapabilities};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, session: Arc<Session>, msg: Message);
}

/// Handler for sessions that never receive server-initiated traffic.
pub struct NullHandler;

#[async_trait]
impl MessageHandler for NullHandler {
    async fn on_message(&self, session: Arc<Session>, msg: Message) {
        debug!(session = %session.id(), method = ?msg.method, "dropping unhandled message");
    }
}

#[derive(Default)]
pub(crate) struct PendingRequests {
    inner: Mutex<HashMap<String, oneshot::Sender<Message>>>,
}

fn id_key(id: &Value) -> String {
    id.to_string()
}

impl PendingRequests {
    pub fn wait_for(&self, id: &Value) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .expect("pending lock poisoned")
            .insert(id_key(id), tx);
        rx
    }

    /// Delivers a response to its waiter. At most one response per id by
    /// construction; the send never blocks and a second response for the
    /// same id is discarded.
    pub fn notify(&self, msg: &Message) -> bool {
        let Some(id) = &msg.id else {
            return false;
        };
        let sender = self
            .inner
            .lock()
            .expect("pending lock poisoned")
            .remove(&id_key(id));
        match sender {
            Some(sender) => {
                let _ = sender.send(msg.clone());
                true
            }
            None => false,
        }
    }

    pub fn done(&self, id: &Value) {
        self.inner
            .lock()
            .expect("pending lock poisoned")
            .remove(&id_key(id));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending lock poisoned").len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExchangeOptions {
    pub progress_token: Option<Value>,
}

pub struct Session {
    session_id: String,
    wire: Option<Arc<dyn Wire>>,
    handler: Arc<dyn MessageHandler>,
    pending: PendingRequests,
    cancel: CancellationToken,
    pub parent: Option<Arc<Session>>,
    client_capabilities: Mutex<Option<ClientCapabilities>>,
    server_capabilities: Mutex<Option<ServerCapabilities>>,
    attributes: Mutex<HashMap<String, Value>>,
    env: Mutex<HashMap<String, String>>,
}

impl Session {
    /// Starts a session over a wire. The wire's read side feeds
    /// [`Session::on_wire`]; the session closes when the wire does.
    pub async fn start(
        wire: Arc<dyn Wire>,
        handler: Arc<dyn MessageHandler>,
        session_id: impl Into<String>,
        parent: Option<Arc<Session>>,
    ) -> Result<Arc<Session>> {
        let session = Arc::new(Session {
            session_id: session_id.into(),
            wire: Some(wire.clone()),
            handler,
            pending: PendingRequests::default(),
            cancel: CancellationToken::new(),
            parent,
            client_capabilities: Mutex::new(None),
            server_capabilities: Mutex::new(None),
            attributes: Mutex::new(HashMap::new()),
            env: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&session);
        let wire_handler: WireHandler = Arc::new(move |msg| match weak.upgrade() {
            Some(session) => session.on_wire(msg),
            None => Box::pin(async {}),
        });
        wire.start(wire_handler).await?;

        let cancel = session.cancel.clone();
        tokio::spawn(async move {
            wire.wait().await;
            cancel.cancel();
        });

        Ok(session)
    }

    /// A session with no wire: carries attributes and env for embedding
    /// hosts that call the runtime directly.
    pub fn empty(session_id: impl Into<String>) -> Arc<Session> {
        Arc::new(Session {
            session_id: session_id.into(),
            wire: None,
            handler: Arc::new(NullHandler),
            pending: PendingRequests::default(),
            cancel: CancellationToken::new(),
            parent: None,
            client_capabilities: Mutex::new(None),
            server_capabilities: Mutex::new(None),
            attributes: Mutex::new(HashMap::new()),
            env: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// The root of the parent chain.
    pub fn top(self: &Arc<Self>) -> Arc<Session> {
        let mut current = self.clone();
        loop {
            let Some(parent) = current.parent.clone() else {
                return current;
            };
            current = parent;
        }
    }

    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn close(&self) {
        if let Some(wire) = &self.wire {
            wire.close();
        }
        self.cancel.cancel();
    }

    pub async fn wait(&self) {
        match &self.wire {
            Some(wire) => wire.wait().await,
            None => self.cancel.cancelled().await,
        }
    }

    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.client_capabilities
            .lock()
            .expect("capabilities lock poisoned")
            .clone()
    }

    pub fn set_server_capabilities(&self, caps: ServerCapabilities) {
        *self
            .server_capabilities
            .lock()
            .expect("capabilities lock poisoned") = Some(caps);
    }

    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.server_capabilities
            .lock()
            .expect("capabilities lock poisoned")
            .clone()
    }

    pub fn get_attribute(&self, key: &str) -> Option<Value> {
        self.attributes
            .lock()
            .expect("attributes lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: Value) {
        self.attributes
            .lock()
            .expect("attributes lock poisoned")
            .insert(key.into(), value);
    }

    pub fn env_map(&self) -> HashMap<String, String> {
        self.env.lock().expect("env lock poisoned").clone()
    }

    pub fn set_env(&self, key: impl Into<String>, value: impl Into<String>) {
        self.env
            .lock()
            .expect("env lock poisoned")
            .insert(key.into(), value.into());
    }

    pub fn extend_env(&self, entries: impl IntoIterator<Item = (String, String)>) {
        self.env.lock().expect("env lock poisoned").extend(entries);
    }

    /// Routes one inbound message: responses resolve the pending table,
    /// everything else goes to the handler. The returned future performs
    /// the handling; wires spawn it so dispatch stays in arrival order
    /// without head-of-line blocking.
    pub fn on_wire(self: Arc<Self>, msg: Message) -> BoxFuture<'static, ()> {
        if self.pending.notify(&msg) {
            return Box::pin(async {});
        }
        Box::pin(async move {
            let handler = self.handler.clone();
            handler.on_message(self, msg).await;
        })
    }

    pub async fn send(&self, mut msg: Message) -> Result<()> {
        let Some(wire) = &self.wire else {
            return Err(Error::transport("empty session: wire is not initialized"));
        };
        msg.jsonrpc = JSONRPC_VERSION.to_string();
        if msg.method.as_deref() == Some("initialize") {
            if let Some(params) = &msg.params {
                let init: InitializeRequest =
                    serde_json::from_value(params.clone()).map_err(|err| {
                        Error::protocol(format!("failed to decode initialize request: {err}"))
                    })?;
                *self
                    .client_capabilities
                    .lock()
                    .expect("capabilities lock poisoned") = Some(init.capabilities);
            }
        }
        wire.send(msg).await
    }

    /// Sends a notification, normalizing progress payloads so that the
    /// reported progress stays strictly monotone per token.
    pub async fn send_payload<T: Serialize>(&self, method: &str, payload: &T) -> Result<()> {
        let mut params = serde_json::to_value(payload)?;
        if method == "notifications/progress" {
            if let Ok(mut progress) =
                serde_json::from_value::<ProgressNotification>(params.clone())
            {
                self.normalize_progress(&mut progress);
                params = serde_json::to_value(&progress)?;
            }
        }
        self.send(Message::notification(method, Some(params))).await
    }

    /// Providers sometimes reset their counters; progress per token must
    /// only ever move forward. Bumps by 1 without a total, and by 0.01
    /// when a total is present so a pretty percentage is not wrecked.
    fn normalize_progress(&self, progress: &mut ProgressNotification) {
        let key = format!("progress-token:{}", progress.progress_token);
        let last = self
            .get_attribute(&key)
            .and_then(|value| value.as_f64())
            .unwrap_or(0.0);
        let mut next = progress.progress;
        if next <= last {
            next = if progress.total.is_none() {
                last + 1.0
            } else {
                last + 0.01
            };
        }
        progress.progress = next;
        self.set_attribute(key, Value::from(next));
    }

    pub async fn reply<T: Serialize>(&self, id: Value, result: &T) -> Result<()> {
        self.send(Message::response(id, serde_json::to_value(result)?))
            .await
    }

    /// Best-effort error reply; failures are logged, not propagated.
    pub async fn reply_error(&self, id: Option<Value>, rpc_error: RpcError) {
        if let Err(err) = self.send(Message::error_response(id, rpc_error)).await {
            error!(session = %self.id(), %err, "failed to send error response");
        }
    }

    /// Sends a request and blocks until the matching response arrives,
    /// the session closes, or the wire dies. Missing ids get a fresh
    /// UUID; a progress token is injected under `params._meta`.
    pub async fn exchange_raw(&self, mut msg: Message, opts: ExchangeOptions) -> Result<Message> {
        let id = match msg.id.clone() {
            Some(id) if id != Value::String(String::new()) => id,
            _ => {
                let id = Value::String(uuid::Uuid::new_v4().to_string());
                msg.id = Some(id.clone());
                id
            }
        };
        if let Some(token) = opts.progress_token {
            msg.set_progress_token(token);
        }

        let rx = self.pending.wait_for(&id);
        if let Err(err) = self.send(msg).await {
            self.pending.done(&id);
            return Err(err);
        }

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::transport("session closed while awaiting response")),
            received = rx => {
                received.map_err(|_| Error::transport("session closed while awaiting response"))
            }
        };
        self.pending.done(&id);
        result
    }

    pub async fn exchange<In, Out>(
        &self,
        method: &str,
        params: &In,
        opts: ExchangeOptions,
    ) -> Result<Out>
    where
        In: Serialize + Sync,
        Out: DeserializeOwned,
    {
        let msg = Message {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: Some(method.to_string()),
            params: Some(serde_json::to_value(params)?),
            ..Message::default()
        };
        let response = self.exchange_raw(msg, opts).await?;
        if let Some(err) = response.error {
            return Err(Error::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        let result = response
            .result
            .ok_or_else(|| Error::protocol("no result in response"))?;
        Ok(serde_json::from_value(result)?)
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::tests::ChannelWire;
    use serde_json::json;

    #[tokio::test]
    async fn exchange_resolves_on_matching_response() {
        let (wire, mut outbound) = ChannelWire::pair();
        let session = Session::start(wire.clone(), Arc::new(NullHandler), "s1", None)
            .await
            .expect("session");

        let exchange = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .exchange::<_, Value>("ping", &json!({}), ExchangeOptions::default())
                    .await
            }
        });

        let sent = outbound.recv().await.expect("request sent");
        assert_eq!(sent.method.as_deref(), Some("ping"));
        let id = sent.id.clone().expect("fresh id assigned");

        wire.inject(Message::response(id, json!({"ok": true})));
        let result = exchange.await.expect("join").expect("exchange");
        assert_eq!(result, json!({"ok": true}));
        assert_eq!(session.pending_len(), 0);
    }

    #[tokio::test]
    async fn exchange_surfaces_error_envelopes() {
        let (wire, mut outbound) = ChannelWire::pair();
        let session = Session::start(wire.clone(), Arc::new(NullHandler), "s1", None)
            .await
            .expect("session");

        let exchange = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .exchange::<_, Value>("tools/call", &json!({}), ExchangeOptions::default())
                    .await
            }
        });

        let sent = outbound.recv().await.expect("request sent");
        wire.inject(Message::error_response(
            sent.id.clone(),
            RpcError::new(-32000, "boom"),
        ));

        let err = exchange.await.expect("join").expect_err("rpc error");
        assert!(matches!(err, Error::Rpc { code: -32000, .. }));
        assert_eq!(session.pending_len(), 0);
    }

    #[tokio::test]
    async fn closing_the_wire_wakes_pending_exchanges() {
        let (wire, mut outbound) = ChannelWire::pair();
        let session = Session::start(wire.clone(), Arc::new(NullHandler), "s1", None)
            .await
            .expect("session");

        let exchange = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .exchange::<_, Value>("ping", &json!({}), ExchangeOptions::default())
                    .await
            }
        });

        let _ = outbound.recv().await.expect("request sent");
        wire.close();

        let err = exchange.await.expect("join").expect_err("terminal error");
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(session.pending_len(), 0);
    }

    #[tokio::test]
    async fn progress_token_is_injected_on_exchange() {
        let (wire, mut outbound) = ChannelWire::pair();
        let session = Session::start(wire.clone(), Arc::new(NullHandler), "s1", None)
            .await
            .expect("session");

        let _exchange = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .exchange::<_, Value>(
                        "tools/call",
                        &json!({"name": "x"}),
                        ExchangeOptions {
                            progress_token: Some(json!("tok")),
                        },
                    )
                    .await
            }
        });

        let sent = outbound.recv().await.expect("request sent");
        assert_eq!(sent.progress_token(), Some(json!("tok")));
        session.close();
    }

    #[tokio::test]
    async fn progress_normalization_is_strictly_monotone() {
        let (wire, mut outbound) = ChannelWire::pair();
        let session = Session::start(wire.clone(), Arc::new(NullHandler), "s1", None)
            .await
            .expect("session");

        let payload = ProgressNotification {
            progress_token: json!("t"),
            progress: 5.0,
            ..ProgressNotification::default()
        };
        session
            .send_payload("notifications/progress", &payload)
            .await
            .expect("send");
        let first = outbound.recv().await.expect("first");

        // A provider that resets to zero still moves forward.
        let reset = ProgressNotification {
            progress_token: json!("t"),
            progress: 0.0,
            ..ProgressNotification::default()
        };
        session
            .send_payload("notifications/progress", &reset)
            .await
            .expect("send");
        let second = outbound.recv().await.expect("second");

        let p1 = first.params.unwrap()["progress"].as_f64().unwrap();
        let p2 = second.params.unwrap()["progress"].as_f64().unwrap();
        assert_eq!(p1, 5.0);
        assert!(p2 > p1);
    }

    #[tokio::test]
    async fn initialize_records_client_capabilities() {
        let (wire, mut outbound) = ChannelWire::pair();
        let session = Session::start(wire.clone(), Arc::new(NullHandler), "s1", None)
            .await
            .expect("session");

        let params = json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {"sampling": {}},
            "clientInfo": {"name": "test", "version": "0"},
        });
        session
            .send(Message::request(json!(1), "initialize", Some(params)))
            .await
            .expect("send");
        let _ = outbound.recv().await;

        let caps = session.client_capabilities().expect("captured");
        assert!(caps.sampling.is_some());
        assert!(caps.roots.is_none());
    }
}
