//! The MCP HTTP endpoint.
//!
//! One path serves the whole protocol: POST submits envelopes (a POST
//! without a session id must be `initialize` and creates the session),
//! GET opens the session's outbound SSE stream, DELETE closes the
//! session. Bearer tokens and `X-Nanobot-Env-*` headers become
//! session-scoped env entries visible to child servers.

use crate::error::{Error, Result};
use crate::mcp::message::{Message, RpcError, INTERNAL_ERROR};
use crate::mcp::server_session::ServerSession;
use crate::mcp::session::MessageHandler;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::IntoFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SESSION_ID_HEADER: &str = "Mcp-Session-Id";
const ENV_HEADER_PREFIX: &str = "x-nanobot-env-";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct HttpServer {
    handler: Arc<dyn MessageHandler>,
    env: HashMap<String, String>,
    sessions: Mutex<HashMap<String, Arc<ServerSession>>>,
}

impl HttpServer {
    pub fn new(env: HashMap<String, String>, handler: Arc<dyn MessageHandler>) -> Arc<Self> {
        Arc::new(HttpServer {
            handler,
            env,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", any(handle))
            .with_state(self.clone())
    }

    /// Serves until the token fires, then drains connections within the
    /// shutdown grace period.
    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let router = self.router();
        info!(addr = ?listener.local_addr().ok(), "serving MCP over HTTP");
        let graceful = {
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        };
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(graceful)
            .into_future();
        tokio::pin!(serve);

        tokio::select! {
            result = &mut serve => result.map_err(|err| Error::transport(err.to_string())),
            _ = shutdown.cancelled() => {
                if tokio::time::timeout(SHUTDOWN_GRACE, &mut serve).await.is_err() {
                    warn!("shutdown grace period expired, dropping open connections");
                }
                Ok(())
            }
        }
    }

    fn session(&self, id: &str) -> Option<Arc<ServerSession>> {
        self.sessions
            .lock()
            .expect("sessions lock poisoned")
            .get(id)
            .cloned()
    }

    /// Session-scoped env from the request: configured entries first,
    /// then the bearer token and any `X-Nanobot-Env-<KEY>` headers.
    fn request_env(&self, headers: &HeaderMap) -> HashMap<String, String> {
        let mut env = self.env.clone();
        if let Some(token) = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        {
            env.insert("http:bearer-token".to_string(), token.to_string());
        }
        for (name, value) in headers {
            let name = name.as_str();
            if let Some(key) = strip_prefix_ignore_case(name, ENV_HEADER_PREFIX) {
                if let Ok(value) = value.to_str() {
                    env.insert(key.to_string(), value.to_string());
                }
            }
        }
        env
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

fn session_id_from(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    if let Some(id) = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|id| !id.is_empty())
    {
        return Some(id.to_string());
    }
    uri.query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("id="))
        .filter(|id| !id.is_empty())
        .map(|id| id.to_string())
}

async fn handle(
    State(server): State<Arc<HttpServer>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let session_id = session_id_from(&headers, &uri);

    match method {
        Method::GET => stream_events(server, session_id).await,
        Method::DELETE => delete_session(server, session_id).await,
        Method::POST => post_message(server, session_id, &headers, body).await,
        _ => (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed").into_response(),
    }
}

async fn stream_events(server: Arc<HttpServer>, session_id: Option<String>) -> Response {
    let Some(id) = session_id else {
        return (StatusCode::BAD_REQUEST, "Session ID is required").into_response();
    };
    let Some(session) = server.session(&id) else {
        return (StatusCode::NOT_FOUND, "Session not found").into_response();
    };

    let stream = futures_util::stream::unfold(session, |session| async move {
        let msg = session.recv().await?;
        let data = serde_json::to_string(&msg).ok()?;
        Some((Ok::<_, Infallible>(Event::default().data(data)), session))
    });
    Sse::new(stream).into_response()
}

async fn delete_session(server: Arc<HttpServer>, session_id: Option<String>) -> Response {
    let Some(id) = session_id else {
        return (StatusCode::BAD_REQUEST, "Session ID is required").into_response();
    };
    let removed = server
        .sessions
        .lock()
        .expect("sessions lock poisoned")
        .remove(&id);
    match removed {
        Some(session) => {
            session.close();
            StatusCode::NO_CONTENT.into_response()
        }
        None => (StatusCode::NOT_FOUND, "Session not found").into_response(),
    }
}

async fn post_message(
    server: Arc<HttpServer>,
    session_id: Option<String>,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let msg: Message = match serde_json::from_slice(&body) {
        Ok(msg) => msg,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("Failed to decode message: {err}"),
            )
                .into_response();
        }
    };

    if let Some(id) = session_id {
        let Some(session) = server.session(&id) else {
            return (StatusCode::NOT_FOUND, "Session not found").into_response();
        };
        return dispatch(&session, msg).await;
    }

    // No session yet: only initialize may create one.
    if msg.method.as_deref() != Some("initialize") {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            format!("Method {:?} not allowed", msg.method.as_deref().unwrap_or("")),
        )
            .into_response();
    }

    let session = match ServerSession::new(server.handler.clone()).await {
        Ok(session) => session,
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to create session: {err}"),
            )
                .into_response();
        }
    };
    session
        .session()
        .extend_env(server.request_env(headers));

    let response = match session.exchange(msg).await {
        Ok(Some(response)) => response,
        Ok(None) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "initialize produced no response",
            )
                .into_response();
        }
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to handle message: {err}"),
            )
                .into_response();
        }
    };

    let id = session.session().id().to_string();
    debug!(session = %id, "created HTTP session");
    server
        .sessions
        .lock()
        .expect("sessions lock poisoned")
        .insert(id.clone(), session);

    ([(SESSION_ID_HEADER, id)], Json(response)).into_response()
}

async fn dispatch(session: &Arc<ServerSession>, msg: Message) -> Response {
    let envelope = msg.clone();
    match session.exchange(msg).await {
        Ok(Some(response)) => Json(response).into_response(),
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(err) => Json(Message::error_response(
            envelope.id,
            RpcError::new(INTERNAL_ERROR, err.to_string()),
        ))
        .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::session::{ExchangeOptions, NullHandler, Session};
    use crate::mcp::transport::http::HttpWire;
    use crate::mcp::types::{InitializeRequest, InitializeResult, ServerInfo};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct TestDispatch;

    #[async_trait]
    impl MessageHandler for TestDispatch {
        async fn on_message(&self, session: Arc<Session>, msg: Message) {
            match msg.method.as_deref() {
                Some("initialize") => {
                    let result = InitializeResult {
                        protocol_version: "2025-03-26".to_string(),
                        server_info: ServerInfo {
                            name: "test".to_string(),
                            version: "0".to_string(),
                        },
                        ..InitializeResult::default()
                    };
                    let id = msg.id.clone().expect("id");
                    session.reply(id, &result).await.expect("reply");
                }
                Some("ping") => {
                    let id = msg.id.clone().expect("id");
                    session.reply(id, &json!({})).await.expect("reply");
                }
                Some("emit/notification") => {
                    // Queue something on the event stream, then ack.
                    session
                        .send(Message::notification(
                            "notifications/message",
                            Some(json!({"level": "info", "data": "hello"})),
                        ))
                        .await
                        .expect("send");
                    let id = msg.id.clone().expect("id");
                    session.reply(id, &json!({})).await.expect("reply");
                }
                _ => {}
            }
        }
    }

    async fn spawn_server() -> (String, CancellationToken) {
        let server = HttpServer::new(HashMap::new(), Arc::new(TestDispatch));
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let shutdown = CancellationToken::new();
        let serve_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = server.serve(listener, serve_shutdown).await;
        });
        (format!("http://{addr}/"), shutdown)
    }

    #[tokio::test]
    async fn initialize_creates_a_session_and_ping_round_trips() {
        let (url, shutdown) = spawn_server().await;

        let wire = HttpWire::new("test", url, HashMap::new()).expect("wire");
        let session = Session::start(wire, Arc::new(NullHandler), "client", None)
            .await
            .expect("session");

        let init: InitializeResult = session
            .exchange(
                "initialize",
                &InitializeRequest {
                    protocol_version: "2025-03-26".to_string(),
                    ..InitializeRequest::default()
                },
                ExchangeOptions::default(),
            )
            .await
            .expect("initialize");
        assert_eq!(init.server_info.name, "test");

        let pong: Value = session
            .exchange("ping", &json!({}), ExchangeOptions::default())
            .await
            .expect("ping");
        assert_eq!(pong, json!({}));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn post_without_session_must_be_initialize() {
        let (url, shutdown) = spawn_server().await;

        let client = reqwest::Client::new();
        let response = client
            .post(&url)
            .json(&Message::request(json!(1), "tools/list", None))
            .send()
            .await
            .expect("post");
        assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn bearer_and_env_headers_become_session_env() {
        let (url, shutdown) = spawn_server().await;

        let client = reqwest::Client::new();
        let init = Message::request(
            json!(1),
            "initialize",
            Some(json!({"protocolVersion": "2025-03-26"})),
        );
        let response = client
            .post(&url)
            .header("Authorization", "Bearer sekrit")
            .header("X-Nanobot-Env-Region", "eu-1")
            .json(&init)
            .send()
            .await
            .expect("post");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .expect("session header")
            .to_str()
            .expect("ascii")
            .to_string();
        assert!(!session_id.is_empty());

        // DELETE closes it out.
        let deleted = client
            .delete(&url)
            .header(SESSION_ID_HEADER, &session_id)
            .send()
            .await
            .expect("delete");
        assert_eq!(deleted.status(), reqwest::StatusCode::NO_CONTENT);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn get_streams_queued_messages_as_sse() {
        let (url, shutdown) = spawn_server().await;
        let client = reqwest::Client::new();

        let init = Message::request(
            json!(1),
            "initialize",
            Some(json!({"protocolVersion": "2025-03-26"})),
        );
        let created = client.post(&url).json(&init).send().await.expect("post");
        let session_id = created
            .headers()
            .get(SESSION_ID_HEADER)
            .expect("session header")
            .to_str()
            .expect("ascii")
            .to_string();

        // Trigger a queued notification, then read it off the stream.
        let _ = client
            .post(&url)
            .header(SESSION_ID_HEADER, &session_id)
            .json(&Message::request(json!(2), "emit/notification", None))
            .send()
            .await
            .expect("post");

        let mut stream = client
            .get(&url)
            .header(SESSION_ID_HEADER, &session_id)
            .send()
            .await
            .expect("get");
        let chunk = stream.chunk().await.expect("read").expect("chunk");
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.contains("notifications/message"), "got: {text}");

        shutdown.cancel();
    }
}
