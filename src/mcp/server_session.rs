//! The in-process wire behind every served session.
//!
//! `exchange` feeds one inbound envelope to the session and resolves
//! with whatever reply the handler sends for it; a handler that
//! finishes without replying yields `None` (the HTTP server answers
//! 202 in that case). Outbound traffic nobody is waiting on — reverse
//! calls, notifications — queues on a channel the SSE stream drains.

use crate::error::{Error, Result};
use crate::mcp::message::Message;
use crate::mcp::session::{MessageHandler, Session};
use crate::mcp::transport::{Wire, WireHandler};
use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::session::PendingRequests;

pub struct ServerSession {
    session: Arc<Session>,
    wire: Arc<ServerWire>,
}

impl ServerSession {
    pub async fn new(handler: Arc<dyn MessageHandler>) -> Result<Arc<ServerSession>> {
        let session_id = uuid::Uuid::new_v4().to_string();
        Self::with_id(handler, session_id).await
    }

    pub async fn with_id(
        handler: Arc<dyn MessageHandler>,
        session_id: impl Into<String>,
    ) -> Result<Arc<ServerSession>> {
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let wire = Arc::new(ServerWire {
            pending: PendingRequests::default(),
            read_tx,
            read_rx: Mutex::new(read_rx),
            handler: StdMutex::new(None),
            cancel: CancellationToken::new(),
        });
        let session = Session::start(wire.clone(), handler, session_id, None).await?;
        Ok(Arc::new(ServerSession { session, wire }))
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Dispatches one envelope and waits for its direct reply, if any.
    pub async fn exchange(&self, msg: Message) -> Result<Option<Message>> {
        self.wire.exchange(msg).await
    }

    /// Next outbound message destined for the client's event stream.
    /// Returns `None` once the session is closed.
    pub async fn recv(&self) -> Option<Message> {
        let mut rx = self.wire.read_rx.lock().await;
        tokio::select! {
            _ = self.wire.cancel.cancelled() => None,
            msg = rx.recv() => msg,
        }
    }

    pub fn close(&self) {
        self.session.close();
    }
}

struct ServerWire {
    pending: PendingRequests,
    read_tx: mpsc::UnboundedSender<Message>,
    read_rx: Mutex<mpsc::UnboundedReceiver<Message>>,
    handler: StdMutex<Option<WireHandler>>,
    cancel: CancellationToken,
}

impl ServerWire {
    fn handler(&self) -> Result<WireHandler> {
        self.handler
            .lock()
            .expect("handler lock poisoned")
            .clone()
            .ok_or_else(|| Error::transport("wire not started"))
    }

    async fn exchange(&self, msg: Message) -> Result<Option<Message>> {
        let handler = self.handler()?;

        let Some(id) = msg.id.clone() else {
            // Notifications cannot be replied to; just handle them.
            handler(msg).await;
            return Ok(None);
        };

        let mut rx = self.pending.wait_for(&id);
        let handled = handler(msg);
        tokio::pin!(handled);

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::transport("session closed")),
            response = &mut rx => Ok(response.ok()),
            _ = &mut handled => {
                // The handler finished; a reply may still have landed
                // concurrently with its completion.
                Ok(rx.try_recv().ok())
            }
        };
        self.pending.done(&id);
        result
    }
}

#[async_trait]
impl Wire for ServerWire {
    async fn start(&self, handler: WireHandler) -> Result<()> {
        *self.handler.lock().expect("handler lock poisoned") = Some(handler);
        Ok(())
    }

    /// Replies claim their pending exchange; everything else queues for
    /// the client's event stream.
    async fn send(&self, msg: Message) -> Result<()> {
        if self.pending.notify(&msg) {
            return Ok(());
        }
        self.read_tx
            .send(msg)
            .map_err(|_| Error::transport("session closed"))
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    async fn wait(&self) {
        self.cancel.cancelled().await;
    }
}
