use nanobot::core::config::Config;
use nanobot::llm;
use nanobot::mcp::httpserver::HttpServer;
use nanobot::mcp::stdioserver::StdioServer;
use nanobot::runtime::{Runtime, RuntimeOptions};
use nanobot::server::Server;
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

struct Args {
    config_path: String,
    listen: Option<String>,
    profiles: Vec<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        config_path: "nanobot.json".to_string(),
        listen: None,
        profiles: Vec::new(),
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                args.config_path = iter.next().ok_or("--config requires a path")?;
            }
            "--listen" | "-l" => {
                args.listen = Some(iter.next().ok_or("--listen requires an address")?);
            }
            "--profile" | "-p" => {
                args.profiles.push(iter.next().ok_or("--profile requires a name")?);
            }
            "--help" | "-h" => {
                return Err("usage: nanobot [--config FILE] [--listen ADDR] [--profile NAME]"
                    .to_string());
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

fn load_config(path: &str, profiles: &[String]) -> Result<Config, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read config {path}: {err}"))?;
    let config: Config =
        serde_json::from_str(&raw).map_err(|err| format!("invalid config {path}: {err}"))?;
    let config = config
        .apply_profiles(profiles)
        .map_err(|err| format!("failed to apply profiles: {err}"))?;
    config
        .validate(true)
        .map_err(|err| format!("invalid config: {err}"))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };
    let config = match load_config(&args.config_path, &args.profiles) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    // Providers are registered by embedding hosts; the bare binary
    // ships with the echo adapter for local smoke runs.
    let completer = Arc::new(llm::Client::new().with_adapter("echo", Arc::new(llm::EchoCompleter)));
    let runtime = Runtime::new(completer, config, RuntimeOptions::default());
    let dispatch = Server::new(runtime);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down");
                shutdown.cancel();
            }
        });
    }

    let result = match &args.listen {
        Some(addr) => match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                HttpServer::new(HashMap::new(), dispatch)
                    .serve(listener, shutdown)
                    .await
            }
            Err(err) => {
                error!(%err, %addr, "failed to bind");
                return ExitCode::FAILURE;
            }
        },
        None => {
            StdioServer::new(dispatch)
                .run(tokio::io::stdin(), tokio::io::stdout())
                .await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "server failed");
            ExitCode::FAILURE
        }
    }
}
