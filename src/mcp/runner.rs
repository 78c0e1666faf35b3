//! Child-server supervision.
//!
//! One table of running child servers per handle, keyed by server name.
//! The handle is process-scoped by convention: the runtime constructs a
//! single `ServerRunner` and shares it across sessions, so a server
//! launched for one session is reused by every other.

use crate::core::env;
use crate::error::{Error, Result};
use crate::mcp::types::McpServer;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

const READINESS_ATTEMPTS: u32 = 120;
const READINESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Default)]
pub struct ServerRunner {
    running: Arc<Mutex<HashMap<String, McpServer>>>,
}

impl ServerRunner {
    pub fn new() -> Self {
        ServerRunner::default()
    }

    /// Launches the server's command once and waits until its base URL
    /// answers. Returns the effective config with allocated `ports` and
    /// env substitution applied to the base URL. A server already in the
    /// table is returned as-is.
    pub async fn ensure_running(
        &self,
        name: &str,
        config: &McpServer,
        session_env: &HashMap<String, String>,
    ) -> Result<McpServer> {
        let mut running = self.running.lock().await;
        if let Some(existing) = running.get(name) {
            return Ok(existing.clone());
        }

        let mut launch_env = session_env.clone();
        for port_name in &config.ports {
            let port = allocate_port().await?;
            launch_env.insert(format!("port:{port_name}"), port.to_string());
        }

        let mut effective = config.clone();
        effective.base_url = env::replace_string(&launch_env, &config.base_url);

        let (command, args, env_pairs) =
            env::replace_env(&launch_env, &config.command, &config.args, &config.env);
        info!(server = name, %command, "starting MCP server");

        let mut cmd = tokio::process::Command::new(&command);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        for (key, value) in &env_pairs {
            cmd.env(key, value);
        }
        let mut child = cmd
            .spawn()
            .map_err(|err| Error::fatal(format!("failed to start command {command}: {err}")))?;

        running.insert(name.to_string(), effective.clone());
        drop(running);

        // Reap the table entry when the child exits.
        let table = self.running.clone();
        let server_name = name.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(server = %server_name, "MCP server exited");
                }
                Ok(status) => {
                    error!(server = %server_name, %status, "MCP server exited with error");
                }
                Err(err) => {
                    error!(server = %server_name, %err, "failed to wait for MCP server");
                }
            }
            table.lock().await.remove(&server_name);
        });

        self.wait_ready(name, &effective.base_url).await?;
        Ok(effective)
    }

    /// Polls the base URL until anything answers. Any HTTP response
    /// counts as ready; only connection failures keep the poll going.
    async fn wait_ready(&self, name: &str, base_url: &str) -> Result<()> {
        let client = reqwest::Client::builder()
            .connect_timeout(READINESS_INTERVAL)
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|err| Error::transport(format!("failed to build probe client: {err}")))?;

        for attempt in 0..READINESS_ATTEMPTS {
            if client.get(base_url).send().await.is_ok() {
                debug!(server = name, attempt, "MCP server ready");
                return Ok(());
            }
            tokio::time::sleep(READINESS_INTERVAL).await;
        }
        Err(Error::fatal(format!(
            "MCP server {name} did not become ready at {base_url}"
        )))
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, name: &str) -> bool {
        self.running.lock().await.contains_key(name)
    }
}

/// Binds an ephemeral localhost port and releases it immediately so the
/// child can claim the number.
async fn allocate_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|err| Error::transport(format!("failed to allocate port: {err}")))?;
    let port = listener
        .local_addr()
        .map_err(|err| Error::transport(format!("failed to read allocated port: {err}")))?
        .port();
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocated_ports_are_nonzero_and_distinct_enough() {
        let a = allocate_port().await.expect("port");
        assert_ne!(a, 0);
    }

    #[tokio::test]
    async fn running_table_reuses_existing_entries() {
        let runner = ServerRunner::new();
        // Seed the table directly: launching real children is the
        // integration suite's job.
        runner.running.lock().await.insert(
            "calc".to_string(),
            McpServer {
                base_url: "http://localhost:9/mcp".to_string(),
                ..McpServer::default()
            },
        );

        let config = McpServer {
            command: "definitely-not-a-real-binary".to_string(),
            base_url: "http://localhost:9/other".to_string(),
            ..McpServer::default()
        };
        let got = runner
            .ensure_running("calc", &config, &HashMap::new())
            .await
            .expect("reuses table entry instead of launching");
        assert_eq!(got.base_url, "http://localhost:9/mcp");
        assert!(runner.contains("calc").await);
    }
}
