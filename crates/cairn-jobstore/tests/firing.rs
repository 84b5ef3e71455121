mod common;

use std::thread;

use cairn_jobstore::{
    CompletedExecutionInstruction, JobDetail, JobStoreError, Key, StoreEvent, TriggerState,
};
use chrono::{Duration, Utc};
use common::{config, drain, job, once, TestDb};

#[test]
fn trigger_moves_through_acquire_fire_complete() {
    let db = TestDb::new();
    let (store, _events) = db.open(config("A"));
    let j = JobDetail::new(Key::named("report"), "noop");
    let t = once("report-now", &j, Utc::now() - Duration::seconds(1));
    store.store_job_and_trigger(&j, &t).unwrap();

    let acquired = store
        .acquire_next_triggers(Utc::now(), 1, Duration::zero())
        .unwrap();
    assert_eq!(acquired.len(), 1);
    assert!(acquired[0].fire_instance_id.is_some());
    assert_eq!(store.get_trigger_state(&t.key).unwrap(), TriggerState::Acquired);

    let mut results = store.triggers_fired(&acquired).unwrap();
    let bundle = results.remove(0).unwrap().unwrap();
    assert_eq!(bundle.job.key, j.key);
    assert_eq!(bundle.scheduled_fire_time, t.next_fire_time);
    assert!(bundle.next_fire_time.is_none());
    assert!(!bundle.recovering);
    assert_eq!(store.get_trigger_state(&t.key).unwrap(), TriggerState::Complete);

    store
        .triggered_job_complete(&bundle.trigger, &bundle.job, bundle.trigger.execution_complete())
        .unwrap();
    assert_eq!(store.get_trigger_state(&t.key).unwrap(), TriggerState::Deleted);
    assert!(!store.check_job_exists(&j.key).unwrap());
}

#[test]
fn non_concurrent_job_fires_one_trigger_at_a_time() {
    let db = TestDb::new();
    let (store, _events) = db.open(config("A"));
    let j = job("serial").with_concurrent_execution_disallowed(true);
    let now = Utc::now();
    let first = once("tr1", &j, now);
    let second = once("tr2", &j, now);
    store.store_job(&j, false).unwrap();
    store.store_trigger(&first, false).unwrap();
    store.store_trigger(&second, false).unwrap();

    let acquired = store
        .acquire_next_triggers(Utc::now(), 10, Duration::zero())
        .unwrap();
    assert_eq!(acquired.len(), 1);
    let fired_key = acquired[0].key.clone();
    let other_key = if fired_key == first.key {
        second.key.clone()
    } else {
        first.key.clone()
    };

    let bundle = store
        .triggers_fired(&acquired)
        .unwrap()
        .remove(0)
        .unwrap()
        .unwrap();
    assert_eq!(store.get_trigger_state(&other_key).unwrap(), TriggerState::Blocked);
    assert!(store
        .acquire_next_triggers(Utc::now(), 10, Duration::zero())
        .unwrap()
        .is_empty());

    store
        .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::SetTriggerComplete)
        .unwrap();
    assert_eq!(store.get_trigger_state(&fired_key).unwrap(), TriggerState::Complete);
    assert_eq!(store.get_trigger_state(&other_key).unwrap(), TriggerState::Waiting);

    let next = store
        .acquire_next_triggers(Utc::now(), 10, Duration::zero())
        .unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].key, other_key);
}

#[test]
fn competing_stores_never_acquire_the_same_trigger() {
    let db = TestDb::new();
    let (a, _ea) = db.open(config("A"));
    let (b, _eb) = db.open(config("B"));
    let j = job("shared");
    a.store_job_and_trigger(&j, &once("only", &j, Utc::now()))
        .unwrap();

    let handles: Vec<_> = [a, b]
        .into_iter()
        .map(|store| {
            thread::spawn(move || {
                store
                    .acquire_next_triggers(Utc::now(), 1, Duration::zero())
                    .unwrap()
                    .len()
            })
        })
        .collect();
    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 1);
}

#[test]
fn acquisition_prefers_earlier_then_higher_priority() {
    let db = TestDb::new();
    let (store, _events) = db.open(config("A"));
    let j = job("ranked");
    store.store_job(&j, false).unwrap();
    let due = Utc::now() - Duration::seconds(5);
    store.store_trigger(&once("low", &j, due).with_priority(1), false).unwrap();
    store.store_trigger(&once("high", &j, due).with_priority(10), false).unwrap();
    store
        .store_trigger(&once("earliest", &j, due - Duration::seconds(1)).with_priority(0), false)
        .unwrap();

    let acquired = store
        .acquire_next_triggers(Utc::now(), 3, Duration::zero())
        .unwrap();
    let names: Vec<_> = acquired.iter().map(|t| t.key.name.as_str()).collect();
    assert_eq!(names, ["earliest", "high", "low"]);
}

#[test]
fn time_window_extends_the_batch() {
    let db = TestDb::new();
    let (store, _events) = db.open(config("A"));
    let j = job("windowed");
    store.store_job(&j, false).unwrap();
    let now = Utc::now();
    store.store_trigger(&once("now", &j, now), false).unwrap();
    store
        .store_trigger(&once("soon", &j, now + Duration::seconds(10)), false)
        .unwrap();
    store
        .store_trigger(&once("later", &j, now + Duration::hours(1)), false)
        .unwrap();

    let acquired = store
        .acquire_next_triggers(Utc::now(), 5, Duration::seconds(30))
        .unwrap();
    let names: Vec<_> = acquired.iter().map(|t| t.key.name.as_str()).collect();
    assert_eq!(names, ["now", "soon"]);
}

#[test]
fn released_trigger_can_be_acquired_again() {
    let db = TestDb::new();
    let (store, _events) = db.open(config("A"));
    let j = job("retry");
    let t = once("retry", &j, Utc::now());
    store.store_job_and_trigger(&j, &t).unwrap();

    let first = store
        .acquire_next_triggers(Utc::now(), 1, Duration::zero())
        .unwrap();
    store.release_acquired_trigger(&first[0]).unwrap();
    assert_eq!(store.get_trigger_state(&t.key).unwrap(), TriggerState::Waiting);

    let second = store
        .acquire_next_triggers(Utc::now(), 1, Duration::zero())
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_ne!(second[0].fire_instance_id, first[0].fire_instance_id);
}

#[test]
fn trigger_paused_after_acquisition_does_not_fire() {
    let db = TestDb::new();
    let (store, _events) = db.open(config("A"));
    let j = job("paused");
    let t = once("paused", &j, Utc::now());
    store.store_job_and_trigger(&j, &t).unwrap();

    let acquired = store
        .acquire_next_triggers(Utc::now(), 1, Duration::zero())
        .unwrap();
    store.pause_trigger(&t.key).unwrap();
    let results = store.triggers_fired(&acquired).unwrap();
    assert!(matches!(results.as_slice(), [Ok(None)]));
    assert_eq!(store.get_trigger_state(&t.key).unwrap(), TriggerState::Paused);
}

#[test]
fn repeating_trigger_returns_to_waiting_with_next_time() {
    let db = TestDb::new();
    let (store, _events) = db.open(config("A"));
    let j = job("heartbeat");
    let start = Utc::now() - Duration::milliseconds(500);
    let t = cairn_jobstore::Trigger::new(
        Key::named("heartbeat"),
        j.key.clone(),
        cairn_jobstore::Schedule::every(Duration::minutes(1), -1),
        start,
    );
    store.store_job_and_trigger(&j, &t).unwrap();

    let acquired = store
        .acquire_next_triggers(Utc::now(), 1, Duration::zero())
        .unwrap();
    let bundle = store
        .triggers_fired(&acquired)
        .unwrap()
        .remove(0)
        .unwrap()
        .unwrap();
    assert_eq!(bundle.next_fire_time, t.next_fire_time.map(|n| n + Duration::minutes(1)));
    assert_eq!(store.get_trigger_state(&t.key).unwrap(), TriggerState::Waiting);

    store
        .triggered_job_complete(&bundle.trigger, &bundle.job, bundle.trigger.execution_complete())
        .unwrap();
    let stored = store.retrieve_trigger(&t.key).unwrap().unwrap();
    assert_eq!(stored.next_fire_time, bundle.next_fire_time);
}

#[test]
fn changed_job_data_is_persisted_on_completion() {
    let db = TestDb::new();
    let (store, _events) = db.open(config("A"));
    let j = job("counter").with_persist_data_after_execution(true);
    store
        .store_job_and_trigger(&j, &once("counter", &j, Utc::now()))
        .unwrap();

    let acquired = store
        .acquire_next_triggers(Utc::now(), 1, Duration::zero())
        .unwrap();
    let mut bundle = store
        .triggers_fired(&acquired)
        .unwrap()
        .remove(0)
        .unwrap()
        .unwrap();
    bundle.job.job_data.put("runs", 1);
    store
        .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::NoInstruction)
        .unwrap();

    let stored = store.retrieve_job(&j.key).unwrap().unwrap();
    assert_eq!(stored.job_data.get("runs"), Some(&serde_json::Value::from(1)));
}

#[test]
fn error_instruction_marks_all_job_triggers() {
    let db = TestDb::new();
    let (store, mut events) = db.open(config("A"));
    let j = job("broken");
    store.store_job(&j, false).unwrap();
    let t1 = once("b1", &j, Utc::now());
    let t2 = once("b2", &j, Utc::now() + Duration::hours(1));
    store.store_trigger(&t1, false).unwrap();
    store.store_trigger(&t2, false).unwrap();
    drain(&mut events);

    let acquired = store
        .acquire_next_triggers(Utc::now(), 1, Duration::zero())
        .unwrap();
    let bundle = store
        .triggers_fired(&acquired)
        .unwrap()
        .remove(0)
        .unwrap()
        .unwrap();
    store
        .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::SetAllJobTriggersError)
        .unwrap();

    assert_eq!(store.get_trigger_state(&t1.key).unwrap(), TriggerState::Error);
    assert_eq!(store.get_trigger_state(&t2.key).unwrap(), TriggerState::Error);
    assert!(drain(&mut events).contains(&StoreEvent::SchedulingChange(None)));
}

#[test]
fn zero_sized_batch_claims_nothing() {
    let db = TestDb::new();
    let (store, _events) = db.open(config("A"));
    let j = job("idle");
    let t = once("idle", &j, Utc::now() - Duration::seconds(1));
    store.store_job_and_trigger(&j, &t).unwrap();

    let acquired = store
        .acquire_next_triggers(Utc::now(), 0, Duration::zero())
        .unwrap();
    assert!(acquired.is_empty());
    assert_eq!(store.get_trigger_state(&t.key).unwrap(), TriggerState::Waiting);
    assert_eq!(
        store
            .acquire_next_triggers(Utc::now(), 1, Duration::zero())
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn unreadable_job_fails_only_its_own_trigger() {
    let db = TestDb::new();
    let (store, _events) = db.open(config("A"));
    let broken = job("broken");
    let healthy = job("healthy");
    let bt = once("broken", &broken, Utc::now() - Duration::seconds(2));
    let ht = once("healthy", &healthy, Utc::now() - Duration::seconds(1));
    store.store_job_and_trigger(&broken, &bt).unwrap();
    store.store_job_and_trigger(&healthy, &ht).unwrap();

    let acquired = store
        .acquire_next_triggers(Utc::now(), 2, Duration::zero())
        .unwrap();
    assert_eq!(acquired.len(), 2);

    let raw = rusqlite::Connection::open(db.path()).unwrap();
    raw.execute(
        "UPDATE CAIRN_JOB_DETAILS SET JOB_DATA = 'not json' WHERE JOB_NAME = 'broken'",
        [],
    )
    .unwrap();
    drop(raw);

    let results = store.triggers_fired(&acquired).unwrap();
    for (trigger, result) in acquired.iter().zip(&results) {
        if trigger.key == bt.key {
            assert!(matches!(result, Err(JobStoreError::Serialization(_))));
        } else {
            let bundle = result.as_ref().unwrap().as_ref().unwrap();
            assert_eq!(bundle.job.key, healthy.key);
        }
    }
    assert_eq!(store.get_trigger_state(&bt.key).unwrap(), TriggerState::Error);
    assert_eq!(store.get_trigger_state(&ht.key).unwrap(), TriggerState::Complete);
}

#[test]
fn completion_after_shutdown_is_refused() {
    let db = TestDb::new();
    let (store, _events) = db.open(config("A"));
    let j = job("late-report");
    let t = once("late-report", &j, Utc::now() - Duration::seconds(1));
    store.store_job_and_trigger(&j, &t).unwrap();
    let acquired = store
        .acquire_next_triggers(Utc::now(), 1, Duration::zero())
        .unwrap();
    let bundle = store
        .triggers_fired(&acquired)
        .unwrap()
        .remove(0)
        .unwrap()
        .unwrap();

    store.shutdown();
    assert!(matches!(
        store.triggered_job_complete(&bundle.trigger, &bundle.job, bundle.trigger.execution_complete()),
        Err(JobStoreError::ShuttingDown)
    ));
    assert!(matches!(
        store.release_acquired_trigger(&acquired[0]),
        Err(JobStoreError::ShuttingDown)
    ));
}

#[test]
fn single_acquire_pass_still_claims_due_triggers() {
    let db = TestDb::new();
    let (store, _events) = db.open(cairn_core::JobStoreConfig {
        acquire_retry_count: 1,
        ..config("A")
    });
    let j = job("one-pass");
    let t = once("one-pass", &j, Utc::now() - Duration::seconds(1));
    store.store_job_and_trigger(&j, &t).unwrap();
    let acquired = store
        .acquire_next_triggers(Utc::now(), 1, Duration::zero())
        .unwrap();
    assert_eq!(acquired.len(), 1);
}
