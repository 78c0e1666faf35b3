//! Out-of-band confirmation of external tool calls.
//!
//! `confirm` surfaces a `nanobot/confirm` request to the end user over
//! the top session's logging channel and blocks until someone calls
//! `reply` or the request ages out. A reaper tick wakes blocked waiters
//! every few seconds so they can also observe session cancellation.

use crate::core::completion::ToolCall;
use crate::error::{Error, Result};
use crate::mcp::session::Session;
use crate::mcp::types::LoggingMessage;
use crate::tools::TargetMapping;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub const TIMEOUT: Duration = Duration::from_secs(15 * 60);
const REAPER_TICK: Duration = Duration::from_secs(5);

#[derive(Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mcp_server: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tool_name: String,
    pub invocation: ToolCall,
}

struct Pending {
    accepted: Option<bool>,
    requested_at: Instant,
}

#[derive(Default)]
pub struct Service {
    requests: Mutex<HashMap<String, Pending>>,
    notify: Notify,
}

impl Service {
    pub fn new() -> Arc<Self> {
        Arc::new(Service::default())
    }

    /// Starts the reaper. Unanswered requests older than [`TIMEOUT`]
    /// are evicted; every tick broadcasts so waiters re-check their
    /// cancellation.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let service = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAPER_TICK);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {}
                }
                {
                    let mut requests = service.requests.lock().expect("confirm lock poisoned");
                    requests.retain(|_, pending| pending.requested_at.elapsed() < TIMEOUT);
                }
                service.notify.notify_waiters();
            }
        });
    }

    /// Resolves a pending confirmation.
    pub fn reply(&self, id: &str, accepted: bool) {
        {
            let mut requests = self.requests.lock().expect("confirm lock poisoned");
            if let Some(pending) = requests.get_mut(id) {
                pending.accepted = Some(accepted);
            }
        }
        self.notify.notify_waiters();
    }

    /// Asks the end user to approve an external tool call. Blocks until
    /// a reply arrives; rejection and timeout are semantic errors.
    pub async fn confirm(
        &self,
        session: &Arc<Session>,
        target: &TargetMapping,
        call: &ToolCall,
    ) -> Result<()> {
        let id = uuid::Uuid::new_v4().to_string();
        let request = ConfirmRequest {
            id: id.clone(),
            mcp_server: target.mcp_server.clone(),
            tool_name: target.target_name.clone(),
            invocation: call.clone(),
        };

        self.requests.lock().expect("confirm lock poisoned").insert(
            id.clone(),
            Pending {
                accepted: None,
                requested_at: Instant::now(),
            },
        );

        let top = session.top();
        top.send_payload(
            "notifications/message",
            &LoggingMessage {
                level: "info".to_string(),
                logger: String::new(),
                data: json!({
                    "type": "nanobot/confirm",
                    "request": request,
                }),
            },
        )
        .await
        .map_err(|err| Error::transport(format!("failed to send confirmation message: {err}")))?;

        self.wait_accepted(session, &id).await
    }

    async fn wait_accepted(&self, session: &Arc<Session>, id: &str) -> Result<()> {
        let cancelled = session.cancelled();
        loop {
            // Register interest before checking so a reply between the
            // check and the wait is never missed.
            let notified = self.notify.notified();

            {
                let mut requests = self.requests.lock().expect("confirm lock poisoned");
                match requests.get(id) {
                    Some(pending) => match pending.accepted {
                        Some(true) => {
                            requests.remove(id);
                            return Ok(());
                        }
                        Some(false) => {
                            requests.remove(id);
                            return Err(Error::semantic(format!("request {id} was rejected")));
                        }
                        None => {}
                    },
                    None => {
                        return Err(Error::semantic(format!("confirmation {id} timed out")));
                    }
                }
            }

            tokio::select! {
                _ = cancelled.cancelled() => {
                    self.requests.lock().expect("confirm lock poisoned").remove(id);
                    return Err(Error::Cancelled);
                }
                _ = notified => {}
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.requests.lock().expect("confirm lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::session::NullHandler;
    use crate::mcp::transport::tests::ChannelWire;
    use crate::tools::TargetDescriptor;
    use crate::mcp::types::Tool;

    fn target() -> TargetMapping {
        TargetMapping {
            mcp_server: "calc".to_string(),
            target_name: "add".to_string(),
            target: TargetDescriptor::Tool(Tool {
                name: "add".to_string(),
                ..Tool::default()
            }),
        }
    }

    fn call() -> ToolCall {
        ToolCall {
            call_id: "c1".to_string(),
            name: "add".to_string(),
            arguments: "{}".to_string(),
            ..ToolCall::default()
        }
    }

    #[tokio::test]
    async fn accepted_confirmations_unblock() {
        let (wire, mut outbound) = ChannelWire::pair();
        let session = Session::start(wire, Arc::new(NullHandler), "s", None)
            .await
            .expect("session");
        let service = Service::new();

        let waiter = tokio::spawn({
            let service = service.clone();
            let session = session.clone();
            async move { service.confirm(&session, &target(), &call()).await }
        });

        // The confirm request goes out as a logging notification.
        let sent = outbound.recv().await.expect("notification");
        assert_eq!(sent.method.as_deref(), Some("notifications/message"));
        let request_id = sent.params.unwrap()["data"]["request"]["id"]
            .as_str()
            .expect("request id")
            .to_string();

        service.reply(&request_id, true);
        waiter.await.expect("join").expect("accepted");
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test]
    async fn rejection_is_a_semantic_error() {
        let (wire, mut outbound) = ChannelWire::pair();
        let session = Session::start(wire, Arc::new(NullHandler), "s", None)
            .await
            .expect("session");
        let service = Service::new();

        let waiter = tokio::spawn({
            let service = service.clone();
            let session = session.clone();
            async move { service.confirm(&session, &target(), &call()).await }
        });

        let sent = outbound.recv().await.expect("notification");
        let request_id = sent.params.unwrap()["data"]["request"]["id"]
            .as_str()
            .expect("request id")
            .to_string();

        service.reply(&request_id, false);
        let err = waiter.await.expect("join").expect_err("rejected");
        assert!(err.to_string().contains("was rejected"));
    }

    #[tokio::test]
    async fn session_cancellation_releases_waiters() {
        let (wire, mut outbound) = ChannelWire::pair();
        let session = Session::start(wire, Arc::new(NullHandler), "s", None)
            .await
            .expect("session");
        let service = Service::new();

        let waiter = tokio::spawn({
            let service = service.clone();
            let session = session.clone();
            async move { service.confirm(&session, &target(), &call()).await }
        });

        let _ = outbound.recv().await.expect("notification");
        session.close();

        let err = waiter.await.expect("join").expect_err("cancelled");
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(service.pending_count(), 0);
    }
}
