mod common;

use std::thread;
use std::time::Duration as StdDuration;

use cairn_core::{JobStoreConfig, LockHandlerKind};
use cairn_jobstore::{
    JobDetail, JobStore, JobStoreError, Key, LocalTransaction, StoreEvent, TriggerState,
    RECOVERING_JOBS_GROUP,
};
use chrono::{Duration, Utc};
use common::{clustered_config, drain, job, once, TestDb};

#[test]
fn failed_peer_work_is_recovered() {
    let db = TestDb::new();
    let (a, _ea) = db.open(clustered_config("A"));
    assert!(!a.check_in().unwrap());

    let j = job("nightly").with_requests_recovery(true);
    let t1 = once("t1", &j, Utc::now());
    let t2 = once("t2", &j, Utc::now());
    a.store_job(&j, false).unwrap();
    a.store_trigger(&t1, false).unwrap();
    a.store_trigger(&t2, false).unwrap();

    let acquired = a
        .acquire_next_triggers(Utc::now(), 2, Duration::zero())
        .unwrap();
    assert_eq!(acquired.len(), 2);
    let running: Vec<_> = acquired.into_iter().filter(|t| t.key == t2.key).collect();
    a.triggers_fired(&running).unwrap();

    // A stops checking in.
    thread::sleep(StdDuration::from_millis(400));

    let (b, mut eb) = db.open(clustered_config("B"));
    assert!(b.check_in().unwrap());

    assert_eq!(b.get_trigger_state(&t1.key).unwrap(), TriggerState::Waiting);
    assert_eq!(b.get_trigger_state(&t2.key).unwrap(), TriggerState::Deleted);
    let recovery = b.get_trigger_keys(Some(RECOVERING_JOBS_GROUP)).unwrap();
    assert_eq!(recovery.len(), 1);
    assert!(recovery[0].name.starts_with("recover_A_"));

    let members: Vec<_> = b
        .get_scheduler_states()
        .unwrap()
        .into_iter()
        .map(|s| s.instance_id)
        .collect();
    assert_eq!(members, ["B"]);
    assert!(drain(&mut eb).is_empty());
}

#[test]
fn healthy_peer_is_left_alone() {
    let db = TestDb::new();
    let (a, _ea) = db.open(JobStoreConfig {
        cluster_checkin_interval_ms: 60_000,
        ..clustered_config("A")
    });
    a.check_in().unwrap();
    let j = job("busy");
    let t = once("busy", &j, Utc::now());
    a.store_job_and_trigger(&j, &t).unwrap();
    a.acquire_next_triggers(Utc::now(), 1, Duration::zero())
        .unwrap();

    let (b, _eb) = db.open(clustered_config("B"));
    assert!(!b.check_in().unwrap());
    assert!(!b.check_in().unwrap());
    assert_eq!(b.get_trigger_state(&t.key).unwrap(), TriggerState::Acquired);

    let mut members: Vec<_> = b
        .get_scheduler_states()
        .unwrap()
        .into_iter()
        .map(|s| s.instance_id)
        .collect();
    members.sort();
    assert_eq!(members, ["A", "B"]);
}

#[test]
fn orphaned_fired_records_are_recovered_on_first_check_in() {
    let db = TestDb::new();
    let (ghost, _eg) = db.open(clustered_config("ghost"));
    let j = job("orphan");
    let t = once("orphan", &j, Utc::now());
    ghost.store_job_and_trigger(&j, &t).unwrap();
    ghost
        .acquire_next_triggers(Utc::now(), 1, Duration::zero())
        .unwrap();
    drop(ghost);

    let (b, _eb) = db.open(clustered_config("B"));
    assert!(b.check_in().unwrap());
    assert_eq!(b.get_trigger_state(&t.key).unwrap(), TriggerState::Waiting);
}

#[test]
fn shutdown_withdraws_from_the_cluster() {
    let db = TestDb::new();
    let (a, _ea) = db.open(clustered_config("A"));
    let (b, _eb) = db.open(JobStoreConfig {
        cluster_failure_grace_ms: 10_000,
        ..clustered_config("B")
    });
    a.scheduler_started().unwrap();
    b.check_in().unwrap();
    assert_eq!(b.get_scheduler_states().unwrap().len(), 2);

    a.shutdown();
    let members: Vec<_> = b
        .get_scheduler_states()
        .unwrap()
        .into_iter()
        .map(|s| s.instance_id)
        .collect();
    assert_eq!(members, ["B"]);
}

#[test]
fn cluster_manager_recovers_and_signals() {
    let db = TestDb::new();
    let (a, _ea) = db.open(clustered_config("A"));
    a.check_in().unwrap();
    let j = job("handover");
    let t = once("handover", &j, Utc::now());
    a.store_job_and_trigger(&j, &t).unwrap();
    a.acquire_next_triggers(Utc::now(), 1, Duration::zero())
        .unwrap();

    let (b, mut eb) = db.open(clustered_config("B"));
    b.scheduler_started().unwrap();

    let mut recovered = false;
    for _ in 0..50 {
        thread::sleep(StdDuration::from_millis(50));
        if b.get_trigger_state(&t.key).unwrap() == TriggerState::Waiting {
            recovered = true;
            break;
        }
    }
    b.shutdown();
    assert!(recovered);
    assert!(drain(&mut eb).contains(&StoreEvent::SchedulingChange(None)));
}

#[test]
fn clustering_requires_the_row_lock() {
    let db = TestDb::new();
    let result = JobStore::builder(JobStoreConfig {
        lock_handler: Some(LockHandlerKind::InProcess),
        ..clustered_config("A")
    })
    .connection_provider(db.provider())
    .build();
    assert!(matches!(result, Err(JobStoreError::Config(_))));
}

#[test]
fn job_of_recovered_fire_must_still_exist() {
    let db = TestDb::new();
    let (a, _ea) = db.open(clustered_config("A"));
    a.check_in().unwrap();
    let j = JobDetail::new(Key::named("gone"), "noop").with_requests_recovery(true);
    let t = once("gone", &j, Utc::now());
    a.store_job_and_trigger(&j, &t).unwrap();
    let acquired = a
        .acquire_next_triggers(Utc::now(), 1, Duration::zero())
        .unwrap();
    a.triggers_fired(&acquired).unwrap();
    a.remove_job(&j.key).unwrap();

    thread::sleep(StdDuration::from_millis(400));
    let (b, _eb) = db.open(clustered_config("B"));
    assert!(b.check_in().unwrap());
    assert!(b
        .get_trigger_keys(Some(RECOVERING_JOBS_GROUP))
        .unwrap()
        .is_empty());
}

#[test]
fn row_lock_waits_out_a_busy_database() {
    let db = TestDb::new();
    let (store, _events) = db.open_with(
        JobStoreConfig {
            lock_retry_count: 50,
            lock_retry_period_ms: 20,
            ..clustered_config("A")
        },
        db.impatient_provider(),
    );

    let writer = LocalTransaction::begin(db.provider().as_ref()).unwrap();
    let handle = thread::spawn(move || {
        thread::sleep(StdDuration::from_millis(100));
        writer.commit().unwrap();
    });
    store.store_job(&job("patient"), false).unwrap();
    handle.join().unwrap();
    assert!(store.check_job_exists(&Key::named("patient")).unwrap());
}

#[test]
fn row_lock_gives_up_after_its_retries() {
    let db = TestDb::new();
    let (store, _events) = db.open_with(
        JobStoreConfig {
            lock_retry_count: 2,
            lock_retry_period_ms: 10,
            ..clustered_config("A")
        },
        db.impatient_provider(),
    );

    let writer = LocalTransaction::begin(db.provider().as_ref()).unwrap();
    let err = store.store_job(&job("hasty"), false).unwrap_err();
    assert_eq!(err.code(), "LOCK_FAILURE");
    writer.rollback().unwrap();
    assert!(!store.check_job_exists(&Key::named("hasty")).unwrap());
}
