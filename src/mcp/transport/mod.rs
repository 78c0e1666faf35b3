//! Byte-level transports beneath a session.
//!
//! A wire moves JSON-RPC envelopes; the session layered on top owns
//! correlation and dispatch. Implementations must serialize sends (one
//! writer at a time) and deliver inbound messages to the handler in
//! arrival order, spawning the returned future so handling never blocks
//! the read loop.

use crate::error::Result;
use crate::mcp::message::Message;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;

pub mod http;
pub mod sse;
pub mod stdio;

/// Invoked for every inbound envelope. The returned future completes
/// when the message has been fully handled.
pub type WireHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait Wire: Send + Sync {
    async fn start(&self, handler: WireHandler) -> Result<()>;
    async fn send(&self, msg: Message) -> Result<()>;
    fn close(&self);
    async fn wait(&self);
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// In-memory wire for session tests: outbound messages land on a
    /// channel, inbound ones are injected by the test.
    pub struct ChannelWire {
        handler: Mutex<Option<WireHandler>>,
        out_tx: mpsc::UnboundedSender<Message>,
        cancel: CancellationToken,
    }

    impl ChannelWire {
        pub fn pair() -> (Arc<ChannelWire>, mpsc::UnboundedReceiver<Message>) {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            (
                Arc::new(ChannelWire {
                    handler: Mutex::new(None),
                    out_tx,
                    cancel: CancellationToken::new(),
                }),
                out_rx,
            )
        }

        /// Feeds a message to the session as if it arrived on the wire.
        pub fn inject(&self, msg: Message) {
            let handler = self
                .handler
                .lock()
                .expect("handler lock")
                .clone()
                .expect("wire started");
            tokio::spawn(handler(msg));
        }
    }

    #[async_trait]
    impl Wire for ChannelWire {
        async fn start(&self, handler: WireHandler) -> Result<()> {
            *self.handler.lock().expect("handler lock") = Some(handler);
            Ok(())
        }

        async fn send(&self, msg: Message) -> Result<()> {
            self.out_tx
                .send(msg)
                .map_err(|_| Error::transport("wire closed"))
        }

        fn close(&self) {
            self.cancel.cancel();
        }

        async fn wait(&self) {
            self.cancel.cancelled().await;
        }
    }
}
