//! Contract tests for schema-enforced dispatch and failure isolation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use griot_live::a2a::{self, ChunkStream};
use griot_live::{CircuitBreaker, CircuitState, Error, registry};

// ─── Scenario: retry with correction ───────────────────────────────

#[tokio::test]
async fn story_producer_is_retried_with_correction_and_succeeds_second_attempt() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_clone = attempts.clone();

    // A producer that forgets the required `culture` on its first try.
    let flaky_story = move |input: Value| {
        let attempts = attempts_clone.clone();
        async move {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(json!({"text": "Once, the tortoise...", "cultural_claims": []}))
            } else {
                let correction = input
                    .get("_correction")
                    .and_then(Value::as_str)
                    .expect("retry must carry the correction");
                assert!(correction.contains("culture"));
                Ok(json!({"text": "Once, the tortoise...", "culture": "yoruba"}))
            }
        }
    };

    let report = a2a::dispatch_with_schema(
        flaky_story,
        json!({"culture": "yoruba", "theme": "trickster"}),
        "StoryRequest",
        "StoryChunk",
        "story_agent",
        2,
    )
    .await
    .unwrap();

    assert_eq!(report.attempts, 2);
    assert!(!report.fell_back);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(report.value["culture"], "yoruba");
}

#[tokio::test]
async fn persistent_schema_failure_substitutes_validating_fallback() {
    let report = a2a::dispatch_with_schema(
        |_| async { Ok(json!({"gibberish": 42})) },
        json!({"culture": "swahili"}),
        "RiddleRequest",
        "RiddlePayload",
        "riddle_agent",
        2,
    )
    .await
    .unwrap();

    assert!(report.fell_back);
    assert_eq!(report.attempts, 3);

    // The fallback is itself schema-valid and carries the generic riddle.
    let (ok, errors) = registry().validate("RiddlePayload", &report.value);
    assert!(ok, "fallback invalid: {errors:?}");
    assert_eq!(report.value["answer"], "A mountain");
    assert_eq!(report.value["hints"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn invalid_input_is_the_callers_bug_and_propagates() {
    let result = a2a::dispatch_with_schema(
        |_| async { Ok(json!({})) },
        json!({"culture": "swahili", "difficulty": "impossible"}),
        "RiddleRequest",
        "RiddlePayload",
        "riddle_agent",
        2,
    )
    .await;

    match result {
        Err(Error::SchemaViolation { schema, .. }) => assert_eq!(schema, "RiddleRequest"),
        other => panic!("expected input schema violation, got {other:?}"),
    }
}

// ─── Scenario: streaming repair ────────────────────────────────────

#[tokio::test]
async fn streaming_dispatch_repairs_what_it_can_and_drops_the_rest() {
    use futures::StreamExt;

    let chunks: Vec<griot_live::Result<Value>> = vec![
        Ok(json!({"text": "Kwesukesukela, there was a hare.", "culture": "zulu"})),
        Ok(json!({"text": "he ran and ran"})), // repairable: culture defaulted
        Ok(json!({"mood": "tense"})),          // irreparable: dropped
        Ok(json!({"text": "Cosu cosu iyaphela.", "culture": "zulu", "is_final": true})),
    ];
    let upstream: ChunkStream = Box::pin(futures::stream::iter(chunks));

    let validated = a2a::dispatch_streaming_with_schema(
        upstream,
        &json!({"culture": "zulu", "theme": "trickster"}),
        "StoryRequest",
        "StoryChunk",
        "story_agent",
    )
    .unwrap();

    let out: Vec<Value> = validated.map(|c| c.unwrap()).collect().await;
    assert_eq!(out.len(), 3);
    for chunk in &out {
        let (ok, errors) = registry().validate("StoryChunk", chunk);
        assert!(ok, "chunk failed schema after dispatch: {errors:?}");
    }
    assert_eq!(out[1]["culture"], "african");
}

// ─── Scenario: circuit breaker self-heal ───────────────────────────

#[tokio::test]
async fn tripped_breaker_probes_after_reset_timeout_and_recovers() {
    let breaker = CircuitBreaker::new("cultural", 5, Duration::from_millis(50));

    // Five consecutive failures trip the breaker.
    for i in 0..5 {
        assert!(!breaker.is_open(), "opened early at failure {i}");
        breaker.record_failure();
    }
    assert!(breaker.is_open());
    assert_eq!(breaker.state(), CircuitState::Open);

    // Before the reset timeout it stays open.
    assert!(breaker.is_open());

    // After the timeout, one probe is allowed through.
    tokio::time::sleep(Duration::from_millis(70)).await;
    assert!(!breaker.is_open());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    // Probe success closes the breaker; failure counting restarts.
    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.status().failure_count, 0);
}

#[tokio::test]
async fn failed_probe_reopens_for_a_full_reset_window() {
    let breaker = CircuitBreaker::new("visual", 3, Duration::from_millis(50));

    for _ in 0..3 {
        breaker.record_failure();
    }
    tokio::time::sleep(Duration::from_millis(70)).await;
    assert!(!breaker.is_open()); // probe allowed

    breaker.record_failure(); // probe fails
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(breaker.is_open()); // open-time was reset; still rejecting
}

// ─── Agent cards ───────────────────────────────────────────────────

#[test]
fn agent_cards_match_registered_schemas() {
    let schemas = registry().list_schemas();
    for card in a2a::agent_cards() {
        for schema in card.input_schemas.iter().chain(card.output_schemas) {
            assert!(
                schemas.contains(&schema.to_string()),
                "card {} advertises unregistered schema {}",
                card.name,
                schema
            );
        }
    }

    let cultural = a2a::get_agent_card("cultural_grounding").unwrap();
    assert!(cultural.streaming);
    assert_eq!(cultural.max_latency_ms, 50);
}
