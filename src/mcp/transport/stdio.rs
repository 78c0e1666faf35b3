//! Line-delimited JSON over a byte pipe.
//!
//! One wire per child process (or per raw pipe pair when serving on our
//! own stdio). Writes hold an exclusive lock; the read loop parses each
//! line and spawns the handler so one slow message never stalls the
//! stream.

use crate::error::{Error, Result};
use crate::mcp::message::Message;
use crate::mcp::transport::{Wire, WireHandler};
use async_trait::async_trait;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Reader = Pin<Box<dyn AsyncRead + Send>>;
type Writer = Pin<Box<dyn AsyncWrite + Send>>;

pub struct StdioWire {
    server_name: String,
    writer: Mutex<Writer>,
    reader: StdMutex<Option<Reader>>,
    child: StdMutex<Option<Child>>,
    cancel: CancellationToken,
}

impl StdioWire {
    /// Spawns a child process and wires up its stdio. Stderr is drained
    /// to our own so child diagnostics stay visible.
    pub fn spawn(
        server_name: impl Into<String>,
        command: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| Error::fatal(format!("failed to start command {command}: {err}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::fatal("child stdout not piped"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::fatal("child stdin not piped"))?;

        Ok(StdioWire {
            server_name: server_name.into(),
            writer: Mutex::new(Box::pin(stdin)),
            reader: StdMutex::new(Some(Box::pin(stdout))),
            child: StdMutex::new(Some(child)),
            cancel: CancellationToken::new(),
        })
    }

    /// A wire over arbitrary pipes, e.g. the process's own stdio when
    /// serving MCP to a parent process.
    pub fn from_pipes(
        server_name: impl Into<String>,
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
    ) -> Self {
        StdioWire {
            server_name: server_name.into(),
            writer: Mutex::new(Box::pin(writer)),
            reader: StdMutex::new(Some(Box::pin(reader))),
            child: StdMutex::new(None),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Wire for StdioWire {
    async fn start(&self, handler: WireHandler) -> Result<()> {
        let reader = self
            .reader
            .lock()
            .expect("reader lock poisoned")
            .take()
            .ok_or_else(|| Error::transport("wire already started"))?;
        let cancel = self.cancel.clone();
        let server_name = self.server_name.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        let text = line.trim();
                        if text.is_empty() {
                            continue;
                        }
                        debug!(server = %server_name, %text, "<- stdio");
                        match serde_json::from_str::<Message>(text) {
                            Ok(msg) => {
                                tokio::spawn(handler(msg));
                            }
                            Err(err) => {
                                warn!(server = %server_name, %err, "failed to decode message");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(server = %server_name, %err, "stdio read failed");
                        break;
                    }
                }
            }
            cancel.cancel();
        });

        Ok(())
    }

    async fn send(&self, msg: Message) -> Result<()> {
        let data = serde_json::to_string(&msg)?;
        debug!(server = %self.server_name, text = %data, "-> stdio");
        let mut writer = self.writer.lock().await;
        writer.write_all(data.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    fn close(&self) {
        self.cancel.cancel();
        if let Some(mut child) = self.child.lock().expect("child lock poisoned").take() {
            let _ = child.start_kill();
        }
    }

    async fn wait(&self) {
        self.cancel.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn round_trips_line_delimited_messages() {
        let (their_write, our_read) = tokio::io::duplex(4096);
        let (our_write, mut their_read) = {
            let (a, b) = tokio::io::duplex(4096);
            (a, BufReader::new(b).lines())
        };

        let wire = Arc::new(StdioWire::from_pipes("test", our_read, our_write));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: WireHandler = Arc::new(move |msg| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(msg);
            })
        });
        wire.start(handler).await.expect("start");

        wire.send(Message::request(json!(1), "ping", None))
            .await
            .expect("send");
        let written = their_read.next_line().await.expect("read").expect("line");
        let sent: Message = serde_json::from_str(&written).expect("valid json line");
        assert_eq!(sent.method.as_deref(), Some("ping"));

        let mut their_write = their_write;
        their_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n")
            .await
            .expect("write");
        their_write.flush().await.expect("flush");

        let received = rx.recv().await.expect("message delivered");
        assert_eq!(received.id, Some(json!(1)));
        assert!(received.result.is_some());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let (their_write, our_read) = tokio::io::duplex(4096);
        let (our_write, _their_read) = tokio::io::duplex(4096);

        let wire = Arc::new(StdioWire::from_pipes("test", our_read, our_write));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: WireHandler = Arc::new(move |msg| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(msg);
            })
        });
        wire.start(handler).await.expect("start");

        let mut their_write = their_write;
        their_write
            .write_all(b"not json\n{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n")
            .await
            .expect("write");
        their_write.flush().await.expect("flush");

        let received = rx.recv().await.expect("good line still delivered");
        assert_eq!(
            received.method.as_deref(),
            Some("notifications/initialized")
        );
    }
}
