//! Public engine surface tests: locations, statuses, knobs

use mongodb::bson::Bson;
use shardshift::metadata::{ShardStatus, MIGRATION_PHASES};
use shardshift::migration::{MigrationControls, MigrationPhase, MigrationRequest, RecoveryKnobs};
use shardshift::topology::Location;
use std::time::Duration;

#[test]
fn test_location_parse_and_render() {
    let location: Location = "cluster-1/appdb".parse().unwrap();
    assert_eq!(location, Location::new("cluster-1", "appdb"));
    assert_eq!(location.to_string(), "cluster-1/appdb");
    assert!("not-a-location".parse::<Location>().is_err());
}

#[test]
fn test_shard_status_surface() {
    assert_eq!(ShardStatus::AtRest.to_string(), "at_rest");
    assert!(!ShardStatus::AtRest.is_migration_phase());
    for status in MIGRATION_PHASES {
        assert!(status.is_migration_phase());
        assert_eq!(status.as_str().parse::<ShardStatus>().unwrap(), status);
    }
}

#[test]
fn test_request_defaults_match_operational_surface() {
    let request = MigrationRequest::new(
        "users",
        Bson::Int64(7),
        Location::new("B", "appdb"),
    );
    assert_eq!(request.insert_batch_size, 1000);
    assert_eq!(request.delete_batch_size, 1000);
    assert_eq!(request.insert_throttle, Duration::ZERO);
    assert_eq!(request.delete_throttle, Duration::ZERO);
}

#[test]
fn test_recovery_knob_defaults() {
    let knobs = RecoveryKnobs::default();
    assert_eq!(knobs.delete_batch_size, 500);
    assert_eq!(knobs.delete_throttle, Duration::from_millis(50));
}

#[test]
fn test_controls_are_live_tunable() {
    let controls = MigrationControls::new(Duration::ZERO, Duration::ZERO, 1000, 1000);
    assert_eq!(controls.phase(), MigrationPhase::Pending);

    controls.set_insert_batch_size(100);
    controls.set_delete_batch_size(50);
    controls.set_insert_throttle(Duration::from_millis(25));
    assert_eq!(controls.insert_batch_size(), 100);
    assert_eq!(controls.delete_batch_size(), 50);
    assert_eq!(controls.insert_throttle(), Duration::from_millis(25));

    // A zero batch size is clamped rather than accepted
    controls.set_delete_batch_size(0);
    assert_eq!(controls.delete_batch_size(), 1);
}
