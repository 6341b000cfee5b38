mod common;

use std::path::PathBuf;
use std::time::Duration;

use common::{FakeRunner, SpawnPlan};
use gluster_entry::error::EntryError;
use gluster_entry::resolver::ResolvedBinary;
use gluster_entry::supervisor;

const GRACE: Duration = Duration::from_millis(10);

fn resolved(path: &str, explicit: bool) -> ResolvedBinary {
    ResolvedBinary {
        path: PathBuf::from(path),
        explicit,
    }
}

#[test]
fn first_surviving_variant_wins() {
    let runner = FakeRunner::new();
    let supervised =
        supervisor::start(&runner, &resolved("/opt/sbin/glusterd", true), GRACE).unwrap();

    assert_eq!(supervised.cmd.program(), "/opt/sbin/glusterd");
    assert_eq!(supervised.cmd.argv(), ["-N"]);
    assert_eq!(runner.spawned.lock().unwrap().len(), 1);
}

#[test]
fn dying_variant_advances_to_the_next() {
    let runner = FakeRunner::new();
    runner.plan_spawn(SpawnPlan::ExitsImmediately(1));
    runner.plan_spawn(SpawnPlan::Alive);

    let supervised =
        supervisor::start(&runner, &resolved("/opt/sbin/glusterd", true), GRACE).unwrap();

    assert_eq!(supervised.cmd.argv(), ["--no-daemon"]);
    let spawned = runner.spawned.lock().unwrap();
    assert_eq!(spawned.len(), 2);
    assert_eq!(spawned[0], "/opt/sbin/glusterd -N");
    assert_eq!(spawned[1], "/opt/sbin/glusterd --no-daemon");
}

#[test]
fn exhausting_all_variants_is_fatal_with_last_rc() {
    let runner = FakeRunner::new();
    runner.plan_spawn(SpawnPlan::ExitsImmediately(1));
    runner.plan_spawn(SpawnPlan::ExitsImmediately(2));
    runner.plan_spawn(SpawnPlan::ExitsImmediately(3));

    let err = supervisor::start(&runner, &resolved("/opt/sbin/glusterd", true), GRACE).unwrap_err();

    match err.downcast_ref::<EntryError>().unwrap() {
        EntryError::AllVariantsFailed { last_rc } => assert_eq!(*last_rc, Some(3)),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(runner.spawned.lock().unwrap().len(), 3);
}

#[test]
fn explicit_override_never_falls_back_to_other_binaries() {
    let runner = FakeRunner::new();
    for _ in 0..3 {
        runner.plan_spawn(SpawnPlan::ExitsImmediately(1));
    }

    let err = supervisor::start(&runner, &resolved("/opt/sbin/glusterd", true), GRACE).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<EntryError>().unwrap(),
        EntryError::AllVariantsFailed { .. }
    ));
    let spawned = runner.spawned.lock().unwrap();
    assert!(spawned.iter().all(|cmd| cmd.starts_with("/opt/sbin/glusterd")));
}

#[test]
fn surviving_client_binary_is_rejected_and_terminated() {
    let runner = FakeRunner::new().with_client_help();

    let err = supervisor::start(&runner, &resolved("/opt/sbin/glusterd", true), GRACE).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<EntryError>().unwrap(),
        EntryError::WrongBinaryVariant { .. }
    ));
    let children = runner.children.lock().unwrap();
    assert_eq!(children.len(), 1);
    assert!(children[0].terminated.load(std::sync::atomic::Ordering::SeqCst));
}
