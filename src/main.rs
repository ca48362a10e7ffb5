use std::sync::Arc;

use anyhow::{Context, Result};
use pulse::telemetry::context::{AppState, NetworkType, StaticSensors};
use pulse::telemetry::storage::FileStore;
use pulse::telemetry::transport::{HttpTransport, StaticAuth};
use pulse::telemetry::{Collaborators, EventRecorder, Priority};
use pulse::TelemetryConfig;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Setup Logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")?;

    // 2. Config + Collaborators
    let config = TelemetryConfig::from_env().context("invalid PULSE_* configuration")?;
    let state_dir = std::env::var("PULSE_STATE_DIR").unwrap_or_else(|_| ".pulse".to_string());
    let store = FileStore::open(&state_dir)
        .await
        .with_context(|| format!("cannot open state dir {state_dir}"))?;

    let network = match std::env::var("PULSE_NETWORK").ok().as_deref() {
        Some("wifi") => NetworkType::Wifi,
        Some("cellular") => NetworkType::Cellular,
        Some("ethernet") => NetworkType::Ethernet,
        Some("none") => NetworkType::None,
        _ => NetworkType::Unknown,
    };
    let sensors = StaticSensors { network, ..StaticSensors::default() };

    let transport = HttpTransport::new(&config).context("cannot build HTTP client")?;
    let collaborators = Collaborators::new(
        Arc::new(store),
        Arc::new(transport),
        Arc::new(StaticAuth::new(std::env::var("PULSE_TOKEN").ok())),
    )
    .with_sensors(Arc::new(sensors));

    let recorder = EventRecorder::start(config, collaborators).await?;
    let user_id = std::env::var("PULSE_USER").ok();

    tracing::info!(session_id = %recorder.session_id(), "pulse recorder active");
    println!("Type '<event_name> [json]' to log, ':critical <event_name> [json]', ':background', ':active', ':close', ':flush' or ':quit'.");

    // 3. Stdin Producer
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            ":quit" => break,
            ":background" => {
                recorder.on_app_state_change(AppState::Background);
            }
            ":active" => {
                recorder.on_app_state_change(AppState::Active);
            }
            ":close" => {
                recorder.close_session();
            }
            ":flush" => {
                let outcome = recorder.flush().await?;
                println!("[FLUSH] {:?}", outcome);
            }
            _ => {
                let (priority, rest) = match line.strip_prefix(":critical ") {
                    Some(rest) => (Priority::Critical, rest),
                    None => (Priority::Normal, line),
                };
                let (name, payload) = parse_event(rest);
                recorder.log_event(name, user_id.as_deref(), payload, priority);
                println!("[QUEUED] {} ({} pending)", name, recorder.pending_events().len());
            }
        }
    }

    // 4. Last Delivery Attempt
    let outcome = recorder.shutdown().await;
    tracing::info!(?outcome, "pulse recorder stopped");
    Ok(())
}

fn parse_event(input: &str) -> (&str, Value) {
    match input.split_once(char::is_whitespace) {
        Some((name, json)) => {
            let payload = serde_json::from_str(json.trim()).unwrap_or_else(|e| {
                tracing::warn!("Ignoring malformed payload: {}", e);
                Value::Object(Default::default())
            });
            (name, payload)
        }
        None => (input, Value::Object(Default::default())),
    }
}
