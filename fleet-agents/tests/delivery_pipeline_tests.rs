//! Queue processing end to end: file-backed queue, scripted device, real
//! directory inboxes.
//!
//! The property at the bottom checks the eventual outcome guarantee: with a
//! finite failure script every message ends `Delivered` or dead-lettered,
//! never stuck in between.

use fleet_agents::{shared_device, DeliveryAdapter, InputDevice, MessageQueueProcessor};
use fleet_core::{Message, MessageStatus};
use fleet_storage::InboxStore;
use fleet_test_utils::assertions::{assert_all_terminal, assert_delivery_error};
use fleet_test_utils::fixtures::FleetHarness;
use fleet_test_utils::{SilentDevice, Step};
use proptest::prelude::*;
use std::time::Duration;
use tokio::runtime::Runtime;

fn fail(reason: &str) -> Step {
    Step::Fail(reason.to_string())
}

#[tokio::test]
async fn test_fails_twice_then_delivers() {
    let harness = FleetHarness::new(3).unwrap();
    let processor = harness.processor(harness.scripted_device(vec![fail("busy"), fail("busy")]));
    let id = harness
        .queue
        .enqueue(Message::new("Captain", "Agent-3", "m1 payload").with_max_attempts(3))
        .unwrap();

    let summary = processor.run_until_idle().await.unwrap();
    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.retried, 2);

    let record = harness.queue.delivery(id).unwrap().unwrap();
    assert_eq!(record.attempt_count, 3);
    // The inbox keeps the message; the queue only keeps the record
    assert!(harness.queue.snapshot().unwrap().messages.is_empty());

    let envelope = harness.inbox.find("Agent-3", id).unwrap().unwrap();
    assert_eq!(envelope.content, "m1 payload");
    assert_eq!(envelope.sender, "Captain");
}

#[tokio::test]
async fn test_adapter_success_without_artifact_is_not_trusted() {
    let harness = FleetHarness::new(1).unwrap();
    let processor = harness.processor(SilentDevice);
    let id = harness
        .queue
        .enqueue(Message::new("Captain", "Agent-1", "ghost").with_max_attempts(2))
        .unwrap();

    let summary = processor.run_until_idle().await.unwrap();
    assert_eq!(summary.delivered, 0);
    assert_eq!(summary.dead_lettered, 1);
    assert!(harness.queue.get(id).unwrap().is_none());

    let dead = harness.queue.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message.id, id);
    assert_eq!(dead[0].message.attempt_count, 2);
    assert!(dead[0].reason.contains("No inbox artifact"));
}

#[tokio::test]
async fn test_hung_device_times_out_then_recovers() {
    let harness = FleetHarness::new(1).unwrap();
    // Longer than the harness' 500ms delivery budget
    let processor = harness.processor(harness.scripted_device(vec![Step::Hang(Duration::from_secs(2))]));
    let id = harness
        .queue
        .enqueue(Message::new("Captain", "Agent-1", "slow"))
        .unwrap();

    let first = processor.process_once().await.unwrap();
    assert_eq!(first.retried, 1);
    let msg = harness.queue.get(id).unwrap().unwrap();
    assert_eq!(msg.status, MessageStatus::Queued);
    assert!(msg.last_error.as_deref().unwrap_or("").contains("budget"));

    processor.run_until_idle().await.unwrap();
    assert!(harness.queue.delivery(id).unwrap().is_some());
}

#[tokio::test]
async fn test_adapter_reports_hang_and_failure_as_delivery_errors() {
    let harness = FleetHarness::new(1).unwrap();
    let device = harness.scripted_device(vec![Step::Hang(Duration::from_secs(2)), fail("busy")]);
    let adapter = DeliveryAdapter::new(shared_device(device), Duration::from_millis(100));
    let endpoint = harness.registry.resolve("Agent-1").unwrap();
    let payload = fleet_agents::frame_payload(&Message::new("Captain", "Agent-1", "x"));

    assert_delivery_error(&adapter.deliver(endpoint, &payload).await);
    assert_delivery_error(&adapter.deliver(endpoint, &payload).await);
    assert!(adapter.deliver(endpoint, &payload).await.is_ok());
}

#[tokio::test]
async fn test_per_recipient_order_is_preserved() {
    let harness = FleetHarness::new(2).unwrap();
    let device = harness.scripted_device(vec![fail("busy")]);
    let calls = device.calls();
    let processor = harness.processor(device);

    for content in ["first", "second", "third"] {
        harness
            .queue
            .enqueue(Message::new("Captain", "Agent-1", content))
            .unwrap();
    }
    harness
        .queue
        .enqueue(Message::new("Captain", "Agent-2", "other"))
        .unwrap();

    processor.run_until_idle().await.unwrap();

    let delivered: Vec<String> = harness
        .inbox
        .list_all("Agent-1")
        .unwrap()
        .into_iter()
        .map(|e| e.content)
        .collect();
    assert_eq!(delivered, vec!["first", "second", "third"]);

    let injected: Vec<String> = calls
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.starts_with("inject ") && !c.ends_with("other"))
        .cloned()
        .collect();
    // First message failed once and was retried before anything behind it
    assert_eq!(injected.len(), 4);
    assert!(injected[0].ends_with("first"));
    assert!(injected[1].ends_with("first"));
    assert!(injected[2].ends_with("second"));
    assert!(injected[3].ends_with("third"));
}

#[tokio::test]
async fn test_unregistered_recipient_does_not_block_others() {
    let harness = FleetHarness::new(1).unwrap();
    let processor = harness.processor(harness.drop_device());
    let lost = harness
        .queue
        .enqueue(Message::new("Captain", "Agent-42", "nobody home").with_max_attempts(1))
        .unwrap();
    let ok = harness
        .queue
        .enqueue(Message::new("Captain", "Agent-1", "hello"))
        .unwrap();

    let summary = processor.run_until_idle().await.unwrap();
    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.dead_lettered, 1);
    assert!(harness.queue.get(lost).unwrap().is_none());
    assert!(harness.queue.delivery(ok).unwrap().is_some());
}

#[tokio::test]
async fn test_redelivery_after_lost_acknowledgement_keeps_one_envelope() {
    let harness = FleetHarness::new(1).unwrap();
    let msg = Message::new("Captain", "Agent-1", "once");
    let id = msg.id;

    // Drop the envelope directly, as if a previous process delivered it and
    // died before recording the outcome.
    let mut device = harness.drop_device();
    device
        .focus(harness.registry.resolve("Agent-1").unwrap().injection_target)
        .await
        .unwrap();
    device.clear().await.unwrap();
    device.inject(&fleet_agents::frame_payload(&msg)).await.unwrap();

    harness.queue.enqueue(msg).unwrap();
    let processor = harness.processor(harness.drop_device());
    processor.run_until_idle().await.unwrap();

    assert!(harness.queue.delivery(id).unwrap().is_some());
    assert_eq!(harness.inbox.list_all("Agent-1").unwrap().len(), 1);
}

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

fn drain(processor: &MessageQueueProcessor) -> Result<(), TestCaseError> {
    test_runtime()?
        .block_on(processor.run_until_idle())
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_every_message_reaches_an_outcome(
        failures in prop::collection::vec(any::<bool>(), 0..8),
        recipients in prop::collection::vec(1usize..=3, 1..6),
        max_attempts in 1u32..=3,
    ) {
        let harness = FleetHarness::new(3).unwrap();
        let script = failures
            .into_iter()
            .map(|f| if f { fail("flaky") } else { Step::Deliver })
            .collect();
        let processor = harness.processor(harness.scripted_device(script));

        let mut ids = Vec::new();
        for r in &recipients {
            let msg = Message::new("Captain", &format!("Agent-{r}"), "payload")
                .with_max_attempts(max_attempts);
            ids.push(harness.queue.enqueue(msg).unwrap());
        }

        drain(&processor)?;

        let doc = harness.queue.snapshot().unwrap();
        assert_all_terminal(&doc.messages);
        prop_assert!(doc.messages.is_empty());
        let dead = harness.queue.dead_letters().unwrap();
        prop_assert_eq!(doc.delivered.len() + dead.len(), ids.len());
        for record in &doc.delivered {
            prop_assert!(record.attempt_count <= max_attempts);
            prop_assert!(harness.inbox.find(&record.recipient, record.message_id).unwrap().is_some());
        }
        for d in &dead {
            prop_assert_eq!(d.message.status, MessageStatus::Dead);
            prop_assert_eq!(d.message.attempt_count, d.message.max_attempts);
        }
    }
}
