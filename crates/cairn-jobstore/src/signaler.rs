//! Notifications from the store back to the scheduler.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{Key, Trigger};

pub trait Signaler: Send + Sync {
    fn notify_trigger_misfired(&self, trigger: &Trigger);

    /// `None` means "re-evaluate immediately".
    fn notify_scheduling_change(&self, candidate_new_next_fire_time: Option<DateTime<Utc>>);

    /// The trigger will never fire again.
    fn notify_finalized(&self, trigger: &Trigger);
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    TriggerMisfired(Key),
    SchedulingChange(Option<DateTime<Utc>>),
    TriggerFinalized(Key),
}

/// Forwards events into a bounded tokio channel without blocking the store.
#[derive(Clone)]
pub struct ChannelSignaler {
    tx: mpsc::Sender<StoreEvent>,
}

impl ChannelSignaler {
    pub fn new(tx: mpsc::Sender<StoreEvent>) -> Self {
        Self { tx }
    }

    /// A signaler plus the receiving end of a channel of `capacity` events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StoreEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    fn send(&self, event: StoreEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "signaler channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("signaler channel closed");
            }
        }
    }
}

impl Signaler for ChannelSignaler {
    fn notify_trigger_misfired(&self, trigger: &Trigger) {
        self.send(StoreEvent::TriggerMisfired(trigger.key.clone()));
    }

    fn notify_scheduling_change(&self, candidate_new_next_fire_time: Option<DateTime<Utc>>) {
        self.send(StoreEvent::SchedulingChange(candidate_new_next_fire_time));
    }

    fn notify_finalized(&self, trigger: &Trigger) {
        self.send(StoreEvent::TriggerFinalized(trigger.key.clone()));
    }
}

/// Discards everything; used when no scheduler is listening.
pub(crate) struct NullSignaler;

impl Signaler for NullSignaler {
    fn notify_trigger_misfired(&self, _trigger: &Trigger) {}
    fn notify_scheduling_change(&self, _candidate: Option<DateTime<Utc>>) {}
    fn notify_finalized(&self, _trigger: &Trigger) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Schedule;

    #[test]
    fn full_channel_drops_without_blocking() {
        let (signaler, mut rx) = ChannelSignaler::channel(1);
        signaler.notify_scheduling_change(None);
        signaler.notify_scheduling_change(Some(Utc::now()));
        assert_eq!(rx.try_recv().unwrap(), StoreEvent::SchedulingChange(None));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn events_carry_trigger_keys() {
        let (signaler, mut rx) = ChannelSignaler::channel(4);
        let t = Trigger::new(Key::named("t"), Key::named("j"), Schedule::once(), Utc::now());
        signaler.notify_trigger_misfired(&t);
        signaler.notify_finalized(&t);
        assert_eq!(rx.try_recv().unwrap(), StoreEvent::TriggerMisfired(Key::named("t")));
        assert_eq!(rx.try_recv().unwrap(), StoreEvent::TriggerFinalized(Key::named("t")));
    }

    #[test]
    fn closed_channel_is_tolerated() {
        let (signaler, rx) = ChannelSignaler::channel(1);
        drop(rx);
        signaler.notify_scheduling_change(None);
    }
}
