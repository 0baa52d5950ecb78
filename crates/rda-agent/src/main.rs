//! # rda-agent
//!
//! Thin local harness around `rda_core::SessionManager`. The real
//! signalling transport (HTTP/IPC/whatever carries `start`/
//! `add_ice_candidate`/`stop` calls to a browser peer) is out of scope for
//! this core; this binary exposes those three operations as JSON-lines
//! commands over stdin/stdout so the pipeline can be driven end to end
//! without one.

use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use rda_common::AgentConfig;
use rda_core::SessionManager;
use rda_protocol::signalling::{AddIceCandidateRequest, StartRequest, StopRequest};

/// One line of stdin input, dispatched to the matching `SessionManager` call.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Command {
    Start(StartRequest),
    AddIceCandidate(AddIceCandidateRequest),
    Stop(StopRequest),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let config = AgentConfig::load()?;
    rda_common::logging::init(&config.log_level);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "rda-agent starting"
    );

    let manager = Arc::new(SessionManager::new(config));

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let manager = manager.clone();
        let line = line.to_string();
        tokio::spawn(async move {
            dispatch(&manager, &line).await;
        });
    }

    tracing::info!("stdin closed, shutting down");
    Ok(())
}

async fn dispatch(manager: &SessionManager, line: &str) {
    let command: Command = match serde_json::from_str(line) {
        Ok(cmd) => cmd,
        Err(e) => {
            tracing::warn!(error = %e, "malformed command line");
            print_error(&e.to_string());
            return;
        }
    };

    match command {
        Command::Start(req) => {
            let session_id = req.session_id.clone();
            match manager.start(req).await {
                Ok(resp) => {
                    tracing::info!(session_id = %session_id, "session started");
                    print_ok(&resp);
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "start failed");
                    print_error(&e.to_string());
                }
            }
        }
        Command::AddIceCandidate(req) => match manager.add_ice_candidate(req).await {
            Ok(()) => print_ok(&serde_json::json!({})),
            Err(e) => {
                tracing::warn!(error = %e, "add_ice_candidate failed");
                print_error(&e.to_string());
            }
        },
        Command::Stop(req) => match manager.stop(&req.session_id).await {
            Ok(()) => {
                tracing::info!(session_id = %req.session_id, "session stopped");
                print_ok(&serde_json::json!({}));
            }
            Err(e) => {
                tracing::warn!(session_id = %req.session_id, error = %e, "stop failed");
                print_error(&e.to_string());
            }
        },
    }
}

fn print_ok<T: serde::Serialize>(result: &T) {
    let envelope = serde_json::json!({ "ok": true, "result": result });
    println!("{envelope}");
}

fn print_error(message: &str) {
    let envelope = serde_json::json!({ "ok": false, "error": message });
    println!("{envelope}");
}
