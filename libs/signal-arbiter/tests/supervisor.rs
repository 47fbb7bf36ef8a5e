//! Supervisor tests on paused tokio time
//!
//! The arbiter reads a `ManualClock`; tests move it in step with tokio's
//! paused clock so workers and reversion timers see consistent time.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use std::time::Duration;

use common::{at, two_phase, Harness};
use signal_arbiter::{
    ArbiterSupervisor, Direction, EmergencyRequest, EmergencyStatus, SignalMode, VehicleType,
};

fn request(vehicle_id: &str, vehicle_type: VehicleType, intersection_id: i64) -> EmergencyRequest {
    EmergencyRequest {
        vehicle_id: vehicle_id.to_string(),
        vehicle_type,
        intersection_id,
        direction: Direction::North,
        notes: None,
        priority_level: None,
    }
}

fn corridor() -> Harness {
    let h = Harness::without_rules(at(5, 12, 0, 0));
    h.register(two_phase(1, Some("corridor")));
    h.register(two_phase(2, Some("corridor")));
    h
}

/// Move both clocks forward one second at a time
async fn run_for(h: &Harness, secs: u64) {
    for _ in 0..secs {
        h.clock.advance_secs(1);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_timer_reverts_override_without_clear() {
    let h = corridor();
    let supervisor = ArbiterSupervisor::new(h.arbiter.clone(), Duration::from_secs(1));

    supervisor
        .trigger_emergency(request("AMB-1", VehicleType::Ambulance, 1))
        .unwrap();
    assert_eq!(supervisor.pending_timers(), vec!["AMB-1".to_string()]);

    run_for(&h, 59).await;
    assert_eq!(
        h.arbiter.get_runtime_state(1).unwrap().mode,
        SignalMode::EmergencyOverride
    );

    run_for(&h, 2).await;
    for id in [1, 2] {
        assert_eq!(h.arbiter.get_runtime_state(id).unwrap().mode, SignalMode::Normal);
    }
    assert_eq!(
        h.arbiter.get_emergency("AMB-1").unwrap().status,
        EmergencyStatus::Cleared
    );
    assert!(supervisor.pending_timers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_clear_cancels_pending_timer() {
    let h = corridor();
    let supervisor = ArbiterSupervisor::new(h.arbiter.clone(), Duration::from_secs(1));

    supervisor
        .trigger_emergency(request("AMB-1", VehicleType::Ambulance, 1))
        .unwrap();
    run_for(&h, 10).await;

    assert!(supervisor.clear_emergency("AMB-1").unwrap().is_success());
    assert!(supervisor.pending_timers().is_empty());
    assert!(!supervisor.clear_emergency("AMB-1").unwrap().is_success());

    // Nothing fires later
    let before = h.arbiter.ledger().len();
    run_for(&h, 70).await;
    assert_eq!(h.arbiter.ledger().len(), before);
}

#[tokio::test(start_paused = true)]
async fn test_promoted_request_gets_its_own_timer() {
    let h = corridor();
    let supervisor = ArbiterSupervisor::new(h.arbiter.clone(), Duration::from_secs(1));

    supervisor
        .trigger_emergency(request("POL-1", VehicleType::Police, 1))
        .unwrap();
    supervisor
        .trigger_emergency(request("AMB-2", VehicleType::Ambulance, 2))
        .unwrap();

    run_for(&h, 61).await;
    assert_eq!(
        h.arbiter.get_runtime_state(2).unwrap().mode,
        SignalMode::EmergencyOverride
    );
    assert_eq!(supervisor.pending_timers(), vec!["AMB-2".to_string()]);

    run_for(&h, 61).await;
    assert_eq!(h.arbiter.get_runtime_state(2).unwrap().mode, SignalMode::Normal);
    assert!(h.arbiter.list_active_emergencies().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_workers_cycle_phases() {
    let h = Harness::without_rules(at(5, 12, 0, 0));
    h.register(two_phase(1, None));
    let supervisor = ArbiterSupervisor::new(h.arbiter.clone(), Duration::from_secs(1));
    assert_eq!(supervisor.start().unwrap(), 1);
    supervisor.report_vehicle_count(1, 12).unwrap();
    assert!(supervisor.report_vehicle_count(1, -1).is_err());

    run_for(&h, 35).await;
    assert_eq!(h.arbiter.get_runtime_state(1).unwrap().current_phase, Some(2));

    supervisor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_queued_emergencies() {
    let h = corridor();
    let supervisor = ArbiterSupervisor::new(h.arbiter.clone(), Duration::from_secs(1));
    supervisor.start().unwrap();

    supervisor
        .trigger_emergency(request("AMB-1", VehicleType::Ambulance, 1))
        .unwrap();
    supervisor
        .trigger_emergency(request("FT-2", VehicleType::FireTruck, 2))
        .unwrap();

    supervisor.stop().await;
    assert!(supervisor.shutdown_token().is_cancelled());
    assert!(supervisor.pending_timers().is_empty());
    assert_eq!(
        h.arbiter.get_emergency("FT-2").unwrap().status,
        EmergencyStatus::Cancelled
    );
}
