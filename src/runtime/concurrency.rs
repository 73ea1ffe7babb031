/// Admission control per lock key
///
/// One mutex guards every slot, so admission, release and queue handoff are a
/// single critical section. A released slot is handed directly to the next
/// queued caller (its ticket is registered before the caller wakes), which
/// keeps FIFO order and avoids a thundering herd.

use crate::error::FlowError;
use crate::flow::{ConcurrencyPolicy, ConflictPolicy, LockScope};
use crate::history::log::Trigger;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};

/// Derive the admission key for a run
pub fn lock_key(flow_name: &str, scope: LockScope, trigger: &Trigger) -> String {
    match scope {
        LockScope::Global => flow_name.to_string(),
        LockScope::PerRecord => match &trigger.record_id {
            Some(id) => format!("{flow_name}:record:{id}"),
            None => flow_name.to_string(),
        },
        LockScope::PerUser => match &trigger.user_id {
            Some(id) => format!("{flow_name}:user:{id}"),
            None => flow_name.to_string(),
        },
    }
}

/// Outcome of an admission attempt
#[derive(Debug)]
pub enum Admission {
    Admitted,
    /// Waiting in line; pass the ticket to [`ConcurrencyController::wait`]
    Queued { position: usize, ticket: QueueTicket },
    Rejected,
    /// The oldest run holding the key must be cancelled; the caller waits in
    /// line for the freed slot
    CancelledExisting { execution_id: String, ticket: QueueTicket },
}

/// Handle on a queued admission
#[derive(Debug)]
pub struct QueueTicket {
    lock_key: String,
    execution_id: String,
    rx: oneshot::Receiver<()>,
}

#[derive(Debug)]
struct Holder {
    execution_id: String,
    admitted_at: Instant,
    /// Already picked as a cancel_existing victim
    cancelling: bool,
}

impl Holder {
    fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            admitted_at: Instant::now(),
            cancelling: false,
        }
    }
}

#[derive(Debug)]
struct Waiter {
    execution_id: String,
    tx: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct Slot {
    max_concurrent: usize,
    in_flight: Vec<Holder>,
    queue: VecDeque<Waiter>,
}

impl Slot {
    /// Move queued callers into free capacity, front first
    fn hand_off(&mut self) {
        while self.in_flight.len() < self.max_concurrent {
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            if waiter.tx.is_closed() {
                continue;
            }
            let holder = Holder::new(waiter.execution_id.as_str());
            if waiter.tx.send(()).is_ok() {
                self.in_flight.push(holder);
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.queue.is_empty()
    }
}

/// Per-key view for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSnapshot {
    pub in_flight: Vec<String>,
    pub queued: usize,
}

#[derive(Debug, Default)]
pub struct ConcurrencyController {
    slots: Mutex<HashMap<String, Slot>>,
}

impl ConcurrencyController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide admission for `execution_id` under `lock_key`
    pub async fn try_admit(
        &self,
        flow_name: &str,
        policy: &ConcurrencyPolicy,
        lock_key: &str,
        execution_id: &str,
    ) -> Admission {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(lock_key.to_string()).or_default();
        slot.max_concurrent = policy.max_concurrent.max(1) as usize;
        // A raised limit frees capacity for callers already in line
        slot.hand_off();

        if slot.in_flight.len() < slot.max_concurrent && slot.queue.is_empty() {
            slot.in_flight.push(Holder::new(execution_id));
            return Admission::Admitted;
        }

        match policy.on_conflict {
            ConflictPolicy::Reject => {
                tracing::info!(flow = flow_name, lock_key, "Admission rejected");
                if slot.is_idle() {
                    slots.remove(lock_key);
                }
                Admission::Rejected
            }
            ConflictPolicy::Queue => {
                let (tx, rx) = oneshot::channel();
                slot.queue.push_back(Waiter {
                    execution_id: execution_id.to_string(),
                    tx,
                });
                let position = slot.queue.len();
                tracing::info!(flow = flow_name, lock_key, position, "Admission queued");
                Admission::Queued {
                    position,
                    ticket: QueueTicket {
                        lock_key: lock_key.to_string(),
                        execution_id: execution_id.to_string(),
                        rx,
                    },
                }
            }
            ConflictPolicy::CancelExisting => {
                let oldest = slot
                    .in_flight
                    .iter_mut()
                    .filter(|h| !h.cancelling)
                    .min_by_key(|h| h.admitted_at)
                    .map(|h| {
                        h.cancelling = true;
                        h.execution_id.clone()
                    });
                let (tx, rx) = oneshot::channel();
                slot.queue.push_back(Waiter {
                    execution_id: execution_id.to_string(),
                    tx,
                });
                let position = slot.queue.len();
                let ticket = QueueTicket {
                    lock_key: lock_key.to_string(),
                    execution_id: execution_id.to_string(),
                    rx,
                };
                match oldest {
                    Some(victim) => {
                        tracing::info!(flow = flow_name, lock_key, victim = %victim, "Cancelling existing run");
                        Admission::CancelledExisting {
                            execution_id: victim,
                            ticket,
                        }
                    }
                    // Every holder is already being cancelled; wait in line
                    None => {
                        tracing::info!(flow = flow_name, lock_key, position, "Admission queued behind cancellation");
                        Admission::Queued { position, ticket }
                    }
                }
            }
        }
    }

    /// Block until the ticket is handed a slot or `timeout` elapses
    pub async fn wait(&self, ticket: QueueTicket, timeout: Option<Duration>) -> Result<(), FlowError> {
        let QueueTicket {
            lock_key,
            execution_id,
            mut rx,
        } = ticket;

        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, &mut rx).await.ok(),
            None => Some((&mut rx).await),
        };
        if let Some(Ok(())) = received {
            return Ok(());
        }

        // Timed out: leave the queue unless a handoff beat us to the lock
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(&lock_key) {
            if let Some(pos) = slot.queue.iter().position(|w| w.execution_id == execution_id) {
                slot.queue.remove(pos);
                if slot.is_idle() {
                    slots.remove(&lock_key);
                }
                tracing::info!(lock_key = %lock_key, execution_id = %execution_id, "Queue wait timed out");
                return Err(FlowError::ConcurrencyLimit { lock_key });
            }
        }
        drop(slots);

        match rx.try_recv() {
            Ok(()) => Ok(()),
            Err(_) => Err(FlowError::ConcurrencyLimit { lock_key }),
        }
    }

    /// Free the slot held by `execution_id` and hand it to the next caller
    pub async fn release(&self, lock_key: &str, execution_id: &str) {
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(lock_key) else {
            return;
        };
        if let Some(pos) = slot.in_flight.iter().position(|h| h.execution_id == execution_id) {
            slot.in_flight.remove(pos);
        }
        slot.hand_off();
        if slot.is_idle() {
            slots.remove(lock_key);
        }
    }

    /// Re-register a run that already holds a slot (startup recovery)
    pub async fn restore(&self, lock_key: &str, execution_id: &str, policy: &ConcurrencyPolicy) {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(lock_key.to_string()).or_default();
        slot.max_concurrent = policy.max_concurrent.max(1) as usize;
        if !slot.in_flight.iter().any(|h| h.execution_id == execution_id) {
            slot.in_flight.push(Holder::new(execution_id));
        }
    }

    /// Whether `execution_id` currently holds a slot under `lock_key`
    pub async fn holds(&self, lock_key: &str, execution_id: &str) -> bool {
        self.slots
            .lock()
            .await
            .get(lock_key)
            .is_some_and(|slot| slot.in_flight.iter().any(|h| h.execution_id == execution_id))
    }

    pub async fn snapshot(&self) -> HashMap<String, SlotSnapshot> {
        self.slots
            .lock()
            .await
            .iter()
            .map(|(key, slot)| {
                (
                    key.clone(),
                    SlotSnapshot {
                        in_flight: slot.in_flight.iter().map(|h| h.execution_id.clone()).collect(),
                        queued: slot.queue.len(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn policy(on_conflict: ConflictPolicy, max: u32) -> ConcurrencyPolicy {
        ConcurrencyPolicy {
            max_concurrent: max,
            on_conflict,
            lock_scope: LockScope::Global,
            queue_timeout_ms: None,
        }
    }

    #[test]
    fn lock_keys_follow_scope() {
        let trigger = Trigger::manual().with_record("order", "o-1").with_user("u-7");
        assert_eq!(lock_key("sync", LockScope::Global, &trigger), "sync");
        assert_eq!(lock_key("sync", LockScope::PerRecord, &trigger), "sync:record:o-1");
        assert_eq!(lock_key("sync", LockScope::PerUser, &trigger), "sync:user:u-7");
        assert_eq!(lock_key("sync", LockScope::PerUser, &Trigger::manual()), "sync");
    }

    #[tokio::test]
    async fn reject_at_limit() {
        let ctrl = ConcurrencyController::new();
        let p = policy(ConflictPolicy::Reject, 1);
        assert!(matches!(ctrl.try_admit("f", &p, "f", "a").await, Admission::Admitted));
        assert!(matches!(ctrl.try_admit("f", &p, "f", "b").await, Admission::Rejected));

        ctrl.release("f", "a").await;
        assert!(matches!(ctrl.try_admit("f", &p, "f", "c").await, Admission::Admitted));
    }

    #[tokio::test]
    async fn queue_hands_off_in_fifo_order() {
        let ctrl = Arc::new(ConcurrencyController::new());
        let p = policy(ConflictPolicy::Queue, 1);
        assert!(matches!(ctrl.try_admit("f", &p, "f", "a").await, Admission::Admitted));

        let Admission::Queued { position: 1, ticket: b } = ctrl.try_admit("f", &p, "f", "b").await else {
            panic!("b should queue first");
        };
        let Admission::Queued { position: 2, ticket: c } = ctrl.try_admit("f", &p, "f", "c").await else {
            panic!("c should queue second");
        };

        ctrl.release("f", "a").await;
        ctrl.wait(b, Some(Duration::from_millis(50))).await.unwrap();
        assert_eq!(ctrl.snapshot().await["f"].in_flight, vec!["b".to_string()]);

        ctrl.release("f", "b").await;
        ctrl.wait(c, Some(Duration::from_millis(50))).await.unwrap();
        assert_eq!(ctrl.snapshot().await["f"].in_flight, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn queue_timeout_fails_with_limit_code() {
        let ctrl = ConcurrencyController::new();
        let p = policy(ConflictPolicy::Queue, 1);
        ctrl.try_admit("f", &p, "f", "a").await;
        let Admission::Queued { ticket, .. } = ctrl.try_admit("f", &p, "f", "b").await else {
            panic!("expected queue");
        };

        let started = Instant::now();
        let err = ctrl.wait(ticket, Some(Duration::from_millis(100))).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(err.code(), "concurrent_execution_limit");
        assert_eq!(ctrl.snapshot().await["f"].queued, 0);
    }

    #[tokio::test]
    async fn cancel_existing_targets_oldest() {
        let ctrl = ConcurrencyController::new();
        let p = policy(ConflictPolicy::CancelExisting, 2);
        ctrl.try_admit("f", &p, "f", "old").await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        ctrl.try_admit("f", &p, "f", "young").await;

        let Admission::CancelledExisting { execution_id, ticket } = ctrl.try_admit("f", &p, "f", "new").await
        else {
            panic!("expected cancel_existing");
        };
        assert_eq!(execution_id, "old");

        ctrl.release("f", "old").await;
        ctrl.wait(ticket, None).await.unwrap();
        let mut holders = ctrl.snapshot().await["f"].in_flight.clone();
        holders.sort();
        assert_eq!(holders, vec!["new".to_string(), "young".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_admissions_never_exceed_limit() {
        let ctrl = Arc::new(ConcurrencyController::new());
        let p = policy(ConflictPolicy::Reject, 3);

        let attempts = (0..50).map(|i| {
            let ctrl = Arc::clone(&ctrl);
            let p = p.clone();
            tokio::spawn(async move { ctrl.try_admit("f", &p, "f", &format!("run-{i}")).await })
        });
        let results = futures::future::join_all(attempts).await;
        let admitted = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Admission::Admitted)))
            .count();
        assert_eq!(admitted, 3);
    }

    #[tokio::test]
    async fn cancel_existing_newcomers_queue_in_arrival_order() {
        let ctrl = ConcurrencyController::new();
        let p = policy(ConflictPolicy::CancelExisting, 1);
        ctrl.try_admit("f", &p, "f", "old").await;

        let Admission::CancelledExisting { execution_id, ticket: first } = ctrl.try_admit("f", &p, "f", "b").await
        else {
            panic!("b should cancel the holder");
        };
        assert_eq!(execution_id, "old");
        // The holder is already being cancelled, so c lines up behind b
        let Admission::Queued { position: 2, ticket: second } = ctrl.try_admit("f", &p, "f", "c").await else {
            panic!("c should queue behind b");
        };

        ctrl.release("f", "old").await;
        ctrl.wait(first, Some(Duration::from_millis(50))).await.unwrap();
        assert_eq!(ctrl.snapshot().await["f"].in_flight, vec!["b".to_string()]);
        assert_eq!(ctrl.snapshot().await["f"].queued, 1);
        assert!(ctrl.holds("f", "b").await);

        ctrl.release("f", "b").await;
        ctrl.wait(second, Some(Duration::from_millis(50))).await.unwrap();
        assert_eq!(ctrl.snapshot().await["f"].in_flight, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn raising_the_limit_admits_queued_callers() {
        let ctrl = ConcurrencyController::new();
        ctrl.try_admit("f", &policy(ConflictPolicy::Queue, 1), "f", "a").await;
        let Admission::Queued { ticket, .. } = ctrl.try_admit("f", &policy(ConflictPolicy::Queue, 1), "f", "b").await
        else {
            panic!("expected queue");
        };

        let wider = policy(ConflictPolicy::Queue, 2);
        assert!(matches!(ctrl.try_admit("f", &wider, "f", "c").await, Admission::Queued { .. }));
        ctrl.wait(ticket, Some(Duration::from_millis(50))).await.unwrap();

        let mut holders = ctrl.snapshot().await["f"].in_flight.clone();
        holders.sort();
        assert_eq!(holders, vec!["a".to_string(), "b".to_string()]);
    }
}
