//! Runs a demonstration batch against the in-memory backend and prints each
//! result as JSON.
//!
//! Configuration comes from `SETTLE_*` environment variables (or `.env`);
//! log verbosity from `RUST_LOG`.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use settle::testing::SimulatedBackend;
use settle::{to_attributes, Engine, EngineConfig, MutationRequest, Operation, OperationResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,settle=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let config = EngineConfig::from_env().context("Failed to load engine configuration")?;
    tracing::info!(?config, "Starting settle simulation");

    let sim = SimulatedBackend::new();
    sim.set_latency(Duration::from_millis(120));
    sim.seed(
        "light.living_room",
        json!({"state": "off", "brightness": 0, "friendly_name": "Living Room"}),
    );
    sim.seed(
        "registry.device.hallway_sensor",
        json!({"name": "Hallway Sensor", "labels": ["downstairs"]}),
    );
    sim.seed("registry.device.old_plug", json!({"name": "Old Plug", "labels": []}));

    let handle = Engine::builder()
        .with_config(config)
        .with_backend(sim.clone())
        .with_event_source(sim.clone())
        .build()
        .context("Failed to build engine")?
        .start()
        .context("Failed to start engine")?;

    // Give the subscriber a moment to connect
    let mut connection = handle.watch_connection();
    tokio::time::timeout(
        Duration::from_secs(5),
        connection.wait_for(|state| *state == settle::ConnectionState::Connected),
    )
    .await
    .context("Event stream did not connect in time")?
    .context("Event stream subscriber stopped")?;

    // Brightness change
    let brightness = handle
        .execute(
            MutationRequest::new(
                "light.living_room",
                Operation::TurnOn {
                    attributes: to_attributes(json!({"brightness": 80})),
                },
            )
            .with_deadline(Duration::from_secs(5)),
        )
        .await;
    print_result("turn on living room light", &brightness)?;

    // Concurrent label additions on one registry entry
    let mut tasks = Vec::new();
    for label in ["motion", "battery", "zigbee"] {
        let dispatcher = handle.dispatcher().clone();
        tasks.push(tokio::spawn(async move {
            let result = dispatcher
                .execute(MutationRequest::new(
                    "registry.device.hallway_sensor",
                    Operation::AddMember {
                        attribute: "labels".into(),
                        member: json!(label),
                    },
                ))
                .await;
            (label, result)
        }));
    }
    for task in tasks {
        let (label, result) = task.await.context("Label task panicked")?;
        print_result(&format!("add label {label}"), &result)?;
    }

    // Removal
    let removal = handle
        .execute(MutationRequest::new("registry.device.old_plug", Operation::Delete))
        .await;
    print_result("delete old plug", &removal)?;

    let labels = sim
        .state("registry.device.hallway_sensor")
        .and_then(|attrs| attrs.get("labels").cloned())
        .unwrap_or_default();
    tracing::info!(%labels, "Final hallway sensor labels");

    handle.stop().await.context("Failed to stop engine")?;
    Ok(())
}

fn print_result(step: &str, result: &OperationResult) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("Failed to serialize result")?;
    println!("# {step}\n{json}");
    Ok(())
}
