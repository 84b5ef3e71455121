//! Minimal scheduling loop on top of the job store: acquire what is due,
//! fire it, run it, report completion.

use std::sync::Arc;
use std::time::Duration;

use cairn_jobstore::{
    CompletedExecutionInstruction, JobStore, StoreEvent, TriggerFiredBundle,
};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct RunOptions {
    pub batch_size: usize,
    pub idle_wait: Duration,
    pub time_window: chrono::Duration,
}

/// Run store calls on the blocking pool; they take database locks and sleep.
async fn blocking<T, F>(store: &Arc<JobStore>, f: F) -> anyhow::Result<T>
where
    F: FnOnce(&Arc<JobStore>) -> cairn_jobstore::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
}

pub async fn run(
    store: Arc<JobStore>,
    mut events: mpsc::Receiver<StoreEvent>,
    options: RunOptions,
) -> anyhow::Result<()> {
    blocking(&store, |s| s.scheduler_started()).await?;
    info!(instance = %store.instance_id(), "node running, press Ctrl-C to stop");

    loop {
        let (batch, window) = (options.batch_size, options.time_window);
        let fired = blocking(&store, move |s| fire_due(s, batch, window)).await?;
        let wait = if fired > 0 {
            Duration::ZERO
        } else {
            options.idle_wait
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            event = events.recv() => match event {
                Some(StoreEvent::TriggerMisfired(key)) => info!(trigger = %key, "trigger misfired"),
                Some(StoreEvent::TriggerFinalized(key)) => debug!(trigger = %key, "trigger finalized"),
                Some(StoreEvent::SchedulingChange(candidate)) => debug!(?candidate, "scheduling change"),
                None => break,
            },
            _ = tokio::time::sleep(wait) => {}
        }
    }

    blocking(&store, |s| {
        s.shutdown();
        Ok(())
    })
    .await
}

/// One acquire → fire → execute → complete pass. Returns how many jobs ran.
fn fire_due(
    store: &JobStore,
    batch_size: usize,
    time_window: chrono::Duration,
) -> cairn_jobstore::Result<usize> {
    let acquired = store.acquire_next_triggers(Utc::now(), batch_size, time_window)?;
    if acquired.is_empty() {
        return Ok(0);
    }

    let results = store.triggers_fired(&acquired)?;
    let mut ran = 0;
    for (trigger, result) in acquired.iter().zip(results) {
        match result {
            Ok(Some(bundle)) => {
                let instruction = execute(&bundle);
                store.triggered_job_complete(&bundle.trigger, &bundle.job, instruction)?;
                ran += 1;
            }
            Ok(None) => store.release_acquired_trigger(trigger)?,
            Err(e) => {
                warn!(trigger = %trigger.key, error = %e, "trigger could not be fired");
                store.release_acquired_trigger(trigger)?;
            }
        }
    }
    Ok(ran)
}

fn execute(bundle: &TriggerFiredBundle) -> CompletedExecutionInstruction {
    match bundle.job.job_class.as_str() {
        "log" => {
            info!(
                job = %bundle.job.key,
                trigger = %bundle.trigger.key,
                scheduled = ?bundle.scheduled_fire_time,
                next = ?bundle.next_fire_time,
                recovering = bundle.recovering,
                "job fired"
            );
            bundle.trigger.execution_complete()
        }
        other => {
            warn!(job = %bundle.job.key, job_class = other, "no executor for job class");
            CompletedExecutionInstruction::SetTriggerError
        }
    }
}
