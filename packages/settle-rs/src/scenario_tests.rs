//! End-to-end scenarios against the simulated backend, on paused time.

#[cfg(test)]
mod scenario_tests {
    use crate::backend::{IssueRejection, RejectionKind};
    use crate::config::EngineConfig;
    use crate::core::{to_attributes, MutationRequest, Operation};
    use crate::engine::{Engine, EngineHandle};
    use crate::error::{OutcomeCode, Remediation};
    use crate::retry::RetryPolicy;
    use crate::subscriber::ConnectionState;
    use crate::testing::{Behavior, SimulatedBackend};
    use crate::wait::VerificationStatus;
    use serde_json::json;
    use std::time::Duration;

    fn start(sim: &SimulatedBackend, config: EngineConfig) -> EngineHandle {
        Engine::builder()
            .with_config(config)
            .with_backend(sim.clone())
            .with_event_source(sim.clone())
            .build()
            .unwrap()
            .start()
            .unwrap()
    }

    async fn connected(handle: &EngineHandle) {
        let mut state = handle.watch_connection();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
    }

    fn set_brightness(level: i64) -> MutationRequest {
        MutationRequest::new(
            "light.kitchen",
            Operation::Set {
                attributes: to_attributes(json!({ "brightness": level })),
            },
        )
    }

    // ==========================================================================
    // Scenario A: effect observed well inside the deadline
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_brightness_observed_after_1200ms() {
        let sim = SimulatedBackend::new();
        sim.seed("light.kitchen", json!({"state": "on", "brightness": 20}));
        sim.set_latency(Duration::from_millis(1200));
        let handle = start(&sim, EngineConfig::default());
        connected(&handle).await;

        let result = handle
            .execute(set_brightness(80).with_deadline(Duration::from_secs(5)))
            .await;

        assert_eq!(result.code, OutcomeCode::Satisfied, "{}", result.explanation);
        assert_eq!(result.verification, Some(VerificationStatus::Satisfied));
        assert_eq!(result.attempts, 1);
        assert_eq!(result.final_attributes.unwrap()["brightness"], json!(80));
        assert!(
            result.elapsed_ms >= 1200 && result.elapsed_ms < 1300,
            "elapsed {}ms",
            result.elapsed_ms
        );
        handle.stop().await.unwrap();
    }

    // ==========================================================================
    // Scenario B: rapid label additions are serialized
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_rapid_label_adds_run_serially() {
        let sim = SimulatedBackend::new();
        sim.seed("light.kitchen", json!({"state": "on", "labels": []}));
        sim.set_latency(Duration::from_millis(300));
        let handle = start(
            &sim,
            EngineConfig {
                max_queue_depth: 10,
                ..EngineConfig::default()
            },
        );
        connected(&handle).await;

        let mut tasks = Vec::new();
        for i in 0..5u64 {
            let dispatcher = handle.dispatcher().clone();
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(i * 100)).await;
                dispatcher
                    .execute(MutationRequest::new(
                        "light.kitchen",
                        Operation::AddMember {
                            attribute: "labels".into(),
                            member: json!(format!("label-{i}")),
                        },
                    ))
                    .await
            }));
        }

        for task in tasks {
            let result = task.await.unwrap();
            assert_ne!(result.code, OutcomeCode::ResourceBusy);
            assert_eq!(result.code, OutcomeCode::Satisfied, "{}", result.explanation);
        }

        // Each command is issued only after the previous one was verified.
        let issued = sim.issued();
        assert_eq!(issued.len(), 5);
        for pair in issued.windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_millis(300));
        }

        let labels = sim.state("light.kitchen").unwrap()["labels"].clone();
        assert_eq!(
            labels,
            json!(["label-0", "label-1", "label-2", "label-3", "label-4"])
        );
        handle.stop().await.unwrap();
    }

    // ==========================================================================
    // Scenario C: transport failures exhaust the retry budget
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_exhausts_retries() {
        let sim = SimulatedBackend::new();
        sim.seed("light.kitchen", json!({"state": "on", "brightness": 20}));
        for _ in 0..3 {
            sim.reject_next(IssueRejection::new(
                RejectionKind::ConnectionReset,
                "connection reset by peer",
            ));
        }
        let handle = start(
            &sim,
            EngineConfig {
                retry: RetryPolicy {
                    max_attempts: 3,
                    initial_backoff: Duration::from_millis(100),
                    multiplier: 4,
                    max_backoff: Duration::from_secs(2),
                },
                ..EngineConfig::default()
            },
        );
        connected(&handle).await;

        let result = handle.execute(set_brightness(80)).await;

        assert_eq!(result.code, OutcomeCode::CommandRejected);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.verification, None);
        assert_eq!(result.remediation, Some(Remediation::CheckConnectivity));
        assert!(result.elapsed_ms >= 500 && result.elapsed_ms < 550);

        let issued = sim.issued();
        assert_eq!(issued.len(), 3);
        let first_backoff = issued[1].at - issued[0].at;
        let second_backoff = issued[2].at - issued[1].at;
        assert!(first_backoff >= Duration::from_millis(100) && first_backoff < Duration::from_millis(110));
        assert!(second_backoff >= Duration::from_millis(400) && second_backoff < Duration::from_millis(410));
        assert_eq!(sim.state("light.kitchen").unwrap()["brightness"], json!(20));
        handle.stop().await.unwrap();
    }

    // ==========================================================================
    // Scenario D: a feed outage during the wait makes the outcome unknown
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_wait_without_cursor_is_unknown() {
        let sim = SimulatedBackend::new();
        sim.seed("light.kitchen", json!({"state": "on", "brightness": 20}));
        sim.set_latency(Duration::from_millis(500));
        let handle = start(&sim, EngineConfig::default());
        connected(&handle).await;

        let outage = sim.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            outage.refuse_connects(u32::MAX);
            outage.disconnect_all();
        });

        let result = handle
            .execute(set_brightness(80).with_deadline(Duration::from_secs(3)))
            .await;

        assert_eq!(result.code, OutcomeCode::Unknown, "{}", result.explanation);
        assert_ne!(result.code, OutcomeCode::TimedOut);
        assert_eq!(result.verification, Some(VerificationStatus::Unknown));
        assert!(result.explanation.contains("missed"));
        // The command did take effect; only the evidence was lost.
        assert_eq!(sim.state("light.kitchen").unwrap()["brightness"], json!(80));
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_wait_with_cursor_replays_and_satisfies() {
        let sim = SimulatedBackend::resumable();
        sim.seed("light.kitchen", json!({"state": "on", "brightness": 20}));
        sim.set_latency(Duration::from_millis(500));
        let handle = start(&sim, EngineConfig::default());
        connected(&handle).await;

        // Gives the subscriber a cursor to resume from.
        sim.set_state("light.hall", json!({"state": "off"}));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outage = sim.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            outage.refuse_connects(1);
            outage.disconnect_all();
        });

        let result = handle
            .execute(set_brightness(80).with_deadline(Duration::from_secs(5)))
            .await;

        assert_eq!(result.code, OutcomeCode::Satisfied, "{}", result.explanation);
        assert_eq!(result.final_attributes.unwrap()["brightness"], json!(80));
        assert!(result.elapsed_ms > 500);
        handle.stop().await.unwrap();
    }

    // ==========================================================================
    // Divergence and silence
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_overridden_state_diverges() {
        let sim = SimulatedBackend::new();
        sim.seed("light.kitchen", json!({"state": "on", "brightness": 20}));
        sim.set_behavior(
            "light.kitchen",
            Behavior::Override(to_attributes(json!({"brightness": 35}))),
        );
        let handle = start(&sim, EngineConfig::default());
        connected(&handle).await;

        let result = handle
            .execute(set_brightness(80).with_deadline(Duration::from_secs(3)))
            .await;

        assert_eq!(result.code, OutcomeCode::Diverged, "{}", result.explanation);
        assert_eq!(result.final_attributes.unwrap()["brightness"], json!(35));
        assert!(result.elapsed_ms >= 3000);
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_resource_is_unknown_at_deadline() {
        let sim = SimulatedBackend::new();
        sim.seed("light.kitchen", json!({"state": "on", "brightness": 20}));
        sim.set_behavior("light.kitchen", Behavior::Silent);
        let handle = start(&sim, EngineConfig::default());
        connected(&handle).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = handle
            .execute(set_brightness(80).with_deadline(Duration::from_secs(2)))
            .await;

        assert_eq!(result.code, OutcomeCode::Unknown);
        assert_eq!(result.attempts, 1);
        assert!(result.explanation.contains("before the deadline"));
        handle.stop().await.unwrap();
    }

    // ==========================================================================
    // Presence
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_delete_undone_by_another_actor_diverges() {
        let sim = SimulatedBackend::new();
        sim.seed("registry.device.old_plug", json!({"name": "Old Plug"}));
        sim.set_behavior(
            "registry.device.old_plug",
            Behavior::Override(to_attributes(json!({"name": "Old Plug"}))),
        );
        let handle = start(&sim, EngineConfig::default());
        connected(&handle).await;

        let result = handle
            .execute(
                MutationRequest::new("registry.device.old_plug", Operation::Delete)
                    .with_deadline(Duration::from_secs(3)),
            )
            .await;

        assert_eq!(result.code, OutcomeCode::Diverged, "{}", result.explanation);
        assert_eq!(result.verification, Some(VerificationStatus::Diverged));
        assert!(sim.state("registry.device.old_plug").is_some());
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_observed_as_removal() {
        let sim = SimulatedBackend::new();
        sim.seed("registry.device.old_plug", json!({"name": "Old Plug"}));
        let handle = start(&sim, EngineConfig::default());
        connected(&handle).await;

        let result = handle
            .execute(MutationRequest::new("registry.device.old_plug", Operation::Delete))
            .await;

        assert_eq!(result.code, OutcomeCode::Satisfied, "{}", result.explanation);
        assert!(sim.state("registry.device.old_plug").is_none());
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_over_present_resource_is_not_satisfied_by_update() {
        let sim = SimulatedBackend::new();
        let handle = start(&sim, EngineConfig::default());
        connected(&handle).await;

        // Make the resource known to the event stream before the create.
        sim.set_state("registry.device.porch", json!({"name": "Porch"}));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = handle
            .execute(
                MutationRequest::new(
                    "registry.device.porch",
                    Operation::Create {
                        attributes: to_attributes(json!({"name": "Porch Light"})),
                    },
                )
                .with_deadline(Duration::from_secs(2)),
            )
            .await;

        assert_eq!(result.code, OutcomeCode::TimedOut, "{}", result.explanation);
        assert_eq!(result.attempts, 1);
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_of_new_resource_is_satisfied() {
        let sim = SimulatedBackend::new();
        let handle = start(&sim, EngineConfig::default());
        connected(&handle).await;

        let result = handle
            .execute(MutationRequest::new(
                "registry.device.porch",
                Operation::Create {
                    attributes: to_attributes(json!({"name": "Porch"})),
                },
            ))
            .await;

        assert_eq!(result.code, OutcomeCode::Satisfied, "{}", result.explanation);
        assert_eq!(result.final_attributes.unwrap()["name"], json!("Porch"));
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_reaches_target_before_deadline() {
        let sim = SimulatedBackend::new();
        sim.seed("cover.garage", json!({"position": 0}));
        sim.set_behavior(
            "cover.garage",
            Behavior::Ramp {
                attribute: "position".into(),
                through: vec![json!(25), json!(50), json!(75)],
                interval: Duration::from_millis(400),
            },
        );
        let handle = start(&sim, EngineConfig::default());
        connected(&handle).await;

        let result = handle
            .execute(
                MutationRequest::new(
                    "cover.garage",
                    Operation::Set {
                        attributes: to_attributes(json!({"position": 100})),
                    },
                )
                .with_deadline(Duration::from_secs(5)),
            )
            .await;

        assert_eq!(result.code, OutcomeCode::Satisfied, "{}", result.explanation);
        assert_eq!(result.final_sequence, Some(5));
        assert!(result.elapsed_ms >= 1250);
        handle.stop().await.unwrap();
    }
}
