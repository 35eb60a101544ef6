//! Status snapshots, staleness and corruption scans over files on disk.

use chrono::{Duration, Utc};
use fleet_agents::{CorruptionDetector, FindingKind, StatusMonitor};
use fleet_core::{FleetError, HealthClass, StatusSnapshot, ValidationError};
use fleet_test_utils::fixtures::{contract_board, FleetHarness};
use std::fs;

#[test]
fn test_status_roundtrip_and_classification() {
    let harness = FleetHarness::new(3).unwrap();
    let now = Utc::now();
    harness
        .status
        .upsert(&StatusSnapshot::new("Agent-1", "ACTIVE", now - Duration::minutes(30)))
        .unwrap();
    harness
        .status
        .upsert(&StatusSnapshot::new("Agent-2", "ACTIVE", now - Duration::minutes(31)))
        .unwrap();
    harness
        .status
        .upsert(&StatusSnapshot::new("Agent-3", "IDLE", now - Duration::hours(3)))
        .unwrap();

    let monitor = StatusMonitor::from_config(&harness.config.monitor);
    let report = monitor.report(&harness.status.list().unwrap(), now);
    let class_of = |id: &str| {
        report
            .agents
            .iter()
            .find(|a| a.agent_id == id)
            .map(|a| a.class)
    };
    assert_eq!(class_of("Agent-1"), Some(HealthClass::Healthy));
    assert_eq!(class_of("Agent-2"), Some(HealthClass::Stale));
    assert_eq!(class_of("Agent-3"), Some(HealthClass::Critical));
    assert!((report.score - 1.0 / 3.0).abs() < 1e-9);
}

#[test]
fn test_older_snapshot_is_rejected() {
    let harness = FleetHarness::new(1).unwrap();
    let now = Utc::now();
    harness
        .status
        .upsert(&StatusSnapshot::new("Agent-1", "ACTIVE", now))
        .unwrap();
    let err = harness
        .status
        .upsert(&StatusSnapshot::new("Agent-1", "IDLE", now - Duration::seconds(1)))
        .unwrap_err();
    assert!(matches!(
        err,
        FleetError::Validation(ValidationError::StaleSnapshot { .. })
    ));
    assert_eq!(harness.status.get("Agent-1").unwrap().unwrap().status, "ACTIVE");
}

#[test]
fn test_hand_edited_store_is_reported_not_repaired() {
    let harness = FleetHarness::new(1).unwrap();
    harness.seed_contracts(&contract_board()).unwrap();

    // Simulate a manual edit: duplicate id, string points, a claimed record
    // without a claimant.
    let path = &harness.config.paths.contracts;
    let mut raw: serde_json::Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
    let testing = raw["contracts"]["testing"]["contracts"].as_array_mut().unwrap();
    testing.push(serde_json::json!({
        "contract_id": "C-100", "title": "Copy", "points": 10, "status": "available"
    }));
    testing.push(serde_json::json!({
        "contract_id": "C-500", "title": "Stringly", "points": "40", "status": "Claimed"
    }));
    let edited = serde_json::to_vec_pretty(&raw).unwrap();
    fs::write(path, &edited).unwrap();

    let report = CorruptionDetector::default()
        .scan_store(harness.contracts.as_ref())
        .unwrap();
    assert!(!report.is_clean());
    assert_eq!(report.count(FindingKind::DuplicateId), 1);
    assert!(report.count(FindingKind::CoercedValue) >= 2);
    assert!(report.count(FindingKind::Violation) >= 1);
    assert!(!report.suggested_actions.is_empty());

    // The scan never writes
    assert_eq!(fs::read(path).unwrap(), edited);
}
