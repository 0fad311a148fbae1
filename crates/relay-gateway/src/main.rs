use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use relay_core::config::RelayConfig;
use relay_core::SessionId;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

mod app;
mod broadcast;
mod commands;
mod stop;

use commands::{parse_line, run_command, Input};
use relay_agent::SubmitOutcome;

/// Console host for the relay turn pipeline.
///
/// Reads one message or slash command per stdin line and writes the event
/// stream as JSON lines on stdout. Logs go to stderr.
#[derive(Debug, Parser)]
#[command(name = "relay-gateway", version, about)]
struct Args {
    /// Config file path (falls back to RELAY_CONFIG, then ~/.relay/relay.toml).
    #[arg(long)]
    config: Option<String>,

    /// Session used for plain-text lines. A fresh id is generated when omitted.
    #[arg(long)]
    session: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "relay_gateway=info,relay_agent=info,relay_sessions=info".into()
            }),
        )
        .init();

    let args = Args::parse();

    // load config: explicit path > RELAY_CONFIG env > ~/.relay/relay.toml
    let config_path = args
        .config
        .clone()
        .or_else(|| std::env::var("RELAY_CONFIG").ok());
    let config = RelayConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), error = %e, "config load failed, using defaults");
        RelayConfig::default()
    });

    let default_session = SessionId::from(
        args.session
            .clone()
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string()),
    );
    let state = Arc::new(app::AppState::new(config));
    info!(
        session = %default_session,
        provider = %state.config.provider.command,
        idle_timeout_ms = state.config.pipeline.idle_timeout_ms,
        "relay gateway ready"
    );

    // Event printer: broadcaster -> stdout, one JSON object per line.
    let mut events = state.broadcaster.subscribe();
    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        loop {
            match events.recv().await {
                Ok(line) => {
                    if stdout.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                stop::execute_stop(&state, None);
                break;
            }
        };
        let Some(line) = line else { break };

        let input = match parse_line(&line, &default_session) {
            Ok(input) => input,
            Err(e) => {
                warn!(error = %e, "ignoring input line");
                continue;
            }
        };

        if let Input::Message {
            session_id,
            message,
        } = input
        {
            match state.dispatcher.submit(&session_id, message) {
                SubmitOutcome::Started => info!(session = %session_id, "turn started"),
                SubmitOutcome::Queued { position } => {
                    info!(session = %session_id, position, "message queued")
                }
                SubmitOutcome::Rejected { code, reason } => {
                    warn!(session = %session_id, code, %reason, "message rejected")
                }
            }
        } else if let Some(report) = run_command(&state, &input) {
            state.broadcaster.send(&serde_json::json!({
                "type": "command_report",
                "content": report,
            }));
        }
    }

    // stdin closed: let running turns finish before exiting.
    state.dispatcher.wait_idle().await;
    drop(state);
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    Ok(())
}
