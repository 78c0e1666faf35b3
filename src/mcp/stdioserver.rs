//! MCP served over the process's own stdio.
//!
//! One server session behind a raw pipe wire: inbound lines go through
//! the session handler, direct replies and server-initiated traffic
//! both come back out on stdout.

use crate::error::Result;
use crate::mcp::server_session::ServerSession;
use crate::mcp::session::MessageHandler;
use crate::mcp::transport::stdio::StdioWire;
use crate::mcp::transport::{Wire, WireHandler};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::error;

pub struct StdioServer {
    handler: Arc<dyn MessageHandler>,
}

impl StdioServer {
    pub fn new(handler: Arc<dyn MessageHandler>) -> Self {
        StdioServer { handler }
    }

    /// Serves until the pipe closes.
    pub async fn run(
        &self,
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
    ) -> Result<()> {
        let session = ServerSession::new(self.handler.clone()).await?;
        let wire = Arc::new(StdioWire::from_pipes("stdio", reader, writer));

        // Server-initiated messages drain onto stdout alongside replies.
        {
            let session = session.clone();
            let wire = wire.clone();
            tokio::spawn(async move {
                while let Some(msg) = session.recv().await {
                    if let Err(err) = wire.send(msg).await {
                        error!(%err, "failed to write server message");
                        break;
                    }
                }
            });
        }

        let exchange_session = session.clone();
        let exchange_wire = wire.clone();
        let handler: WireHandler = Arc::new(move |msg| {
            let session = exchange_session.clone();
            let wire = exchange_wire.clone();
            Box::pin(async move {
                match session.exchange(msg).await {
                    Ok(Some(response)) => {
                        if let Err(err) = wire.send(response).await {
                            error!(%err, "failed to send reply");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => error!(%err, "failed to exchange message"),
                }
            })
        });
        wire.start(handler).await?;
        wire.wait().await;
        session.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::message::Message;
    use crate::mcp::session::Session;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct Pong;

    #[async_trait]
    impl MessageHandler for Pong {
        async fn on_message(&self, session: Arc<Session>, msg: Message) {
            if msg.method.as_deref() == Some("ping") {
                let id = msg.id.clone().expect("id");
                session.reply(id, &json!({})).await.expect("reply");
            }
        }
    }

    #[tokio::test]
    async fn replies_flow_back_over_the_pipe() {
        let (mut client_write, server_read) = tokio::io::duplex(4096);
        let (server_write, client_read) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let _ = StdioServer::new(Arc::new(Pong))
                .run(server_read, server_write)
                .await;
        });

        client_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":\"a\",\"method\":\"ping\"}\n")
            .await
            .expect("write");
        client_write.flush().await.expect("flush");

        let mut lines = BufReader::new(client_read).lines();
        let line = lines.next_line().await.expect("read").expect("line");
        let response: Message = serde_json::from_str(&line).expect("envelope");
        assert_eq!(response.id, Some(json!("a")));
        assert_eq!(response.result, Some(json!({})));
    }
}
