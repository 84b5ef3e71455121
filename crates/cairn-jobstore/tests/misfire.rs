mod common;

use cairn_core::JobStoreConfig;
use cairn_jobstore::{
    CompletedExecutionInstruction, JobDetail, Key, LocalTransaction, MisfireInstruction,
    RecoverMisfiredResult, Schedule, StoreEvent, Trigger, TriggerState, DEFAULT_GROUP,
    FAILED_JOB_ORIGINAL_TRIGGER_NAME, RECOVERING_JOBS_GROUP,
};
use chrono::{Duration, Utc};
use common::{config, drain, job, once, TestDb};

fn short_threshold(instance_id: &str) -> JobStoreConfig {
    JobStoreConfig {
        misfire_threshold_ms: 1_000,
        ..config(instance_id)
    }
}

#[test]
fn overdue_one_shot_fires_now() {
    let db = TestDb::new();
    let (store, mut events) = db.open(short_threshold("A"));
    let j = job("late");
    let t = once("late", &j, Utc::now() - Duration::seconds(10));
    store.store_job_and_trigger(&j, &t).unwrap();
    drain(&mut events);

    let before = Utc::now() - Duration::milliseconds(1);
    let result = store.recover_misfires().unwrap();
    assert_eq!(result.processed_misfired_trigger_count, 1);
    assert!(!result.has_more_misfired_triggers);

    let stored = store.retrieve_trigger(&t.key).unwrap().unwrap();
    let next = stored.next_fire_time.unwrap();
    assert!(next >= before);
    assert_eq!(result.earliest_new_time, Some(next));
    assert_eq!(store.get_trigger_state(&t.key).unwrap(), TriggerState::Waiting);

    let seen = drain(&mut events);
    assert_eq!(seen[0], StoreEvent::TriggerMisfired(t.key.clone()));
    assert!(seen.contains(&StoreEvent::SchedulingChange(Some(next))));

    assert_eq!(store.recover_misfires().unwrap(), RecoverMisfiredResult::NO_OP);
}

#[test]
fn repeating_trigger_skips_missed_fires() {
    let db = TestDb::new();
    let (store, _events) = db.open(short_threshold("A"));
    let j = job("tick");
    let t = Trigger::new(
        Key::named("tick"),
        j.key.clone(),
        Schedule::every(Duration::minutes(1), -1),
        Utc::now() - Duration::minutes(10) - Duration::seconds(30),
    )
    .with_misfire_instruction(MisfireInstruction::DoNothing);
    store.store_job_and_trigger(&j, &t).unwrap();

    let now = Utc::now();
    store.recover_misfires().unwrap();
    let next = store
        .retrieve_trigger(&t.key)
        .unwrap()
        .unwrap()
        .next_fire_time
        .unwrap();
    assert!(next > now);
    assert!(next <= now + Duration::minutes(1));
}

#[test]
fn sweeps_are_bounded_by_batch_size() {
    let db = TestDb::new();
    let (store, _events) = db.open(JobStoreConfig {
        max_misfires_to_handle_at_a_time: 2,
        ..short_threshold("A")
    });
    let j = job("bulk");
    store.store_job(&j, false).unwrap();
    for i in 0..5 {
        let t = once(&format!("bulk-{i}"), &j, Utc::now() - Duration::minutes(5 + i));
        store.store_trigger(&t, false).unwrap();
    }

    let first = store.recover_misfires().unwrap();
    assert_eq!(first.processed_misfired_trigger_count, 2);
    assert!(first.has_more_misfired_triggers);

    let mut total = first.processed_misfired_trigger_count;
    let mut sweeps = 1;
    loop {
        let r = store.recover_misfires().unwrap();
        total += r.processed_misfired_trigger_count;
        sweeps += 1;
        if !r.has_more_misfired_triggers {
            break;
        }
    }
    assert_eq!(total, 5);
    assert_eq!(sweeps, 3);
}

#[test]
fn ignore_policy_is_never_misfired_and_still_acquirable() {
    let db = TestDb::new();
    let (store, _events) = db.open(short_threshold("A"));
    let j = job("patient");
    let t = once("patient", &j, Utc::now() - Duration::minutes(30))
        .with_misfire_instruction(MisfireInstruction::IgnoreMisfirePolicy);
    store.store_job_and_trigger(&j, &t).unwrap();

    assert_eq!(store.recover_misfires().unwrap(), RecoverMisfiredResult::NO_OP);
    let acquired = store
        .acquire_next_triggers(Utc::now(), 1, Duration::zero())
        .unwrap();
    assert_eq!(acquired.len(), 1);
    assert_eq!(acquired[0].next_fire_time, t.next_fire_time);
}

#[test]
fn misfired_trigger_past_its_end_completes() {
    let db = TestDb::new();
    let (store, mut events) = db.open(short_threshold("A"));
    let j = job("expired");
    let t = once("expired", &j, Utc::now() - Duration::seconds(20))
        .with_end_time(Utc::now() - Duration::seconds(5));
    store.store_job_and_trigger(&j, &t).unwrap();
    drain(&mut events);

    let result = store.recover_misfires().unwrap();
    assert_eq!(result.processed_misfired_trigger_count, 1);
    assert_eq!(result.earliest_new_time, None);
    assert_eq!(store.get_trigger_state(&t.key).unwrap(), TriggerState::Complete);
    assert!(drain(&mut events).contains(&StoreEvent::TriggerFinalized(t.key.clone())));
}

#[test]
fn startup_recovers_interrupted_work() {
    let db = TestDb::new();
    let (crashed, _events) = db.open(config("A"));
    let idle = job("idle");
    let important = JobDetail::new(Key::named("important"), "noop").with_requests_recovery(true);
    let t1 = once("t1", &idle, Utc::now());
    let t2 = once("t2", &important, Utc::now());
    crashed.store_job_and_trigger(&idle, &t1).unwrap();
    crashed.store_job_and_trigger(&important, &t2).unwrap();

    let acquired = crashed
        .acquire_next_triggers(Utc::now(), 2, Duration::zero())
        .unwrap();
    assert_eq!(acquired.len(), 2);
    let running: Vec<_> = acquired.into_iter().filter(|t| t.key == t2.key).collect();
    crashed.triggers_fired(&running).unwrap();
    drop(crashed);

    let (store, _events) = db.open(config("A"));
    store.scheduler_started().unwrap();

    assert_eq!(store.get_trigger_state(&t1.key).unwrap(), TriggerState::Waiting);
    assert_eq!(store.get_trigger_state(&t2.key).unwrap(), TriggerState::Deleted);
    let recovery = store.get_trigger_keys(Some(RECOVERING_JOBS_GROUP)).unwrap();
    assert_eq!(recovery.len(), 1);
    let rt = store.retrieve_trigger(&recovery[0]).unwrap().unwrap();
    assert_eq!(rt.job_key, important.key);
    assert_eq!(
        rt.job_data.get(FAILED_JOB_ORIGINAL_TRIGGER_NAME),
        Some(&serde_json::Value::from("t2"))
    );
    assert_eq!(rt.next_fire_time, t2.next_fire_time);
    assert_eq!(rt.misfire_instruction, MisfireInstruction::IgnoreMisfirePolicy);

    let acquired = store
        .acquire_next_triggers(Utc::now(), 5, Duration::zero())
        .unwrap();
    let bundle = store
        .triggers_fired(&acquired)
        .unwrap()
        .into_iter()
        .filter_map(|r| r.unwrap())
        .find(|b| b.trigger.key == rt.key)
        .unwrap();
    assert!(bundle.recovering);
    store
        .triggered_job_complete(&bundle.trigger, &bundle.job, CompletedExecutionInstruction::DeleteTrigger)
        .unwrap();

    store.shutdown();
}

#[test]
fn resuming_an_overdue_trigger_applies_its_misfire_instruction() {
    let db = TestDb::new();
    let (store, _events) = db.open(short_threshold("A"));
    store.scheduler_started().unwrap();
    let j = job("held");
    store.store_job(&j, false).unwrap();
    store.pause_trigger_group(DEFAULT_GROUP).unwrap();

    let t = once("held", &j, Utc::now() - Duration::minutes(10));
    store.store_trigger(&t, false).unwrap();
    assert_eq!(store.get_trigger_state(&t.key).unwrap(), TriggerState::Paused);

    let before = Utc::now() - Duration::milliseconds(1);
    store.resume_trigger(&t.key).unwrap();
    let stored = store.retrieve_trigger(&t.key).unwrap().unwrap();
    assert!(stored.next_fire_time.unwrap() >= before);
    assert_eq!(store.get_trigger_state(&t.key).unwrap(), TriggerState::Waiting);

    store.shutdown();
}

#[test]
fn quiet_misfire_check_does_not_wait_for_writers() {
    let db = TestDb::new();
    let (store, _events) = db.open_with(short_threshold("A"), db.impatient_provider());
    let j = job("future");
    store
        .store_job_and_trigger(&j, &once("future", &j, Utc::now() + Duration::hours(1)))
        .unwrap();

    let writer = LocalTransaction::begin(db.provider().as_ref()).unwrap();
    assert_eq!(store.recover_misfires().unwrap(), RecoverMisfiredResult::NO_OP);
    writer.rollback().unwrap();
}
