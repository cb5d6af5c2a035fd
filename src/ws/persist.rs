use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::router::DiagramCommand;
use crate::db::{DiagramStore, PersistedMutation, StoreError};
use crate::models::{DiagramKey, DiagramSnapshot, HistoryKind};

/// Work for the persistence worker, executed strictly in queue order
#[derive(Debug)]
pub enum PersistJob {
    Mutation(PersistedMutation),
    Snapshot(DiagramSnapshot),
    History { kind: HistoryKind, conn_id: Uuid, seq: u64 },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(self.backoff_max)
    }
}

/// Spawn the worker that writes one diagram to the store.
///
/// Runs until the job sender is dropped and the queue is drained.
pub fn spawn_persist_worker(
    key: DiagramKey,
    store: Arc<dyn DiagramStore>,
    policy: RetryPolicy,
    mut jobs: mpsc::UnboundedReceiver<PersistJob>,
    actor: mpsc::Sender<DiagramCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            match job {
                PersistJob::Mutation(mutation) => {
                    let update_vector = mutation.update_vector;
                    let res = with_retries(&policy, "apply_mutation", &key, || store.apply_mutation(&key, &mutation)).await;
                    if res.is_err() {
                        report(&actor, DiagramCommand::PersistFailed { update_vector }).await;
                    }
                }
                PersistJob::Snapshot(snapshot) => {
                    let update_vector = snapshot.update_vector;
                    let res = with_retries(&policy, "save_snapshot", &key, || store.save_snapshot(&key, &snapshot)).await;
                    if res.is_err() {
                        report(&actor, DiagramCommand::PersistFailed { update_vector }).await;
                    }
                }
                PersistJob::History { kind, conn_id, seq } => {
                    // history is answered to a waiting client, so no retries
                    let result = match kind {
                        HistoryKind::Undo => store.undo(&key).await,
                        HistoryKind::Redo => store.redo(&key).await,
                    };
                    let result = result.map_err(|e| {
                        error!(diagram = %key, "{:?} failed: {}", kind, e);
                        e.to_string()
                    });
                    report(&actor, DiagramCommand::HistoryCompleted { seq, conn_id, kind, result }).await;
                }
            }
        }
        debug!(diagram = %key, "persistence worker drained");
    })
}

async fn with_retries<F, Fut>(policy: &RetryPolicy, what: &str, key: &DiagramKey, mut op: F) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            // nothing to retry against, the diagram is gone
            Err(e @ StoreError::NotFound(_)) => {
                error!(diagram = %key, "{} failed: {}", what, e);
                return Err(e);
            }
            Err(e) if attempt >= policy.max_retries => {
                error!(diagram = %key, attempts = attempt + 1, "{} failed, giving up: {}", what, e);
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay(attempt);
                warn!(diagram = %key, attempt = attempt + 1, "{} failed, retrying in {:?}: {}", what, delay, e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn report(actor: &mpsc::Sender<DiagramCommand>, cmd: DiagramCommand) {
    if actor.send(cmd).await.is_err() {
        debug!("diagram actor gone, dropping persistence report");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::HistoryOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Store that fails the first `failures` writes
    struct FlakyStore {
        failures: AtomicU32,
        calls: AtomicU32,
        written: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl DiagramStore for FlakyStore {
        async fn load(&self, _key: &DiagramKey) -> Result<Option<DiagramSnapshot>, StoreError> {
            Ok(None)
        }

        async fn apply_mutation(&self, _key: &DiagramKey, mutation: &PersistedMutation) -> Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("down".into()));
            }
            self.written.lock().unwrap().push(mutation.update_vector);
            Ok(())
        }

        async fn save_snapshot(&self, _key: &DiagramKey, _snapshot: &DiagramSnapshot) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
        }
    }

    fn key() -> DiagramKey {
        DiagramKey::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let p = RetryPolicy { max_retries: 5, backoff: Duration::from_millis(200), backoff_max: Duration::from_millis(1000) };
        assert_eq!(p.delay(0), Duration::from_millis(200));
        assert_eq!(p.delay(1), Duration::from_millis(400));
        assert_eq!(p.delay(3), Duration::from_millis(1000));
        assert_eq!(p.delay(40), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_in_order() {
        let store = Arc::new(FlakyStore { failures: AtomicU32::new(2), calls: AtomicU32::new(0), written: Mutex::new(vec![]) });
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (actor_tx, mut actor_rx) = mpsc::channel(8);
        let worker = spawn_persist_worker(key(), store.clone(), policy(3), jobs_rx, actor_tx);

        for uv in 1..=3 {
            jobs_tx.send(PersistJob::Mutation(PersistedMutation { update_vector: uv, cells: vec![] })).unwrap();
        }
        drop(jobs_tx);
        worker.await.unwrap();

        assert_eq!(*store.written.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(store.calls.load(Ordering::SeqCst), 5);
        assert!(actor_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn exhausted_retries_are_reported() {
        let store = Arc::new(FlakyStore { failures: AtomicU32::new(10), calls: AtomicU32::new(0), written: Mutex::new(vec![]) });
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (actor_tx, mut actor_rx) = mpsc::channel(8);
        let worker = spawn_persist_worker(key(), store.clone(), policy(2), jobs_rx, actor_tx);

        jobs_tx.send(PersistJob::Mutation(PersistedMutation { update_vector: 9, cells: vec![] })).unwrap();
        drop(jobs_tx);
        worker.await.unwrap();

        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert!(matches!(actor_rx.recv().await, Some(DiagramCommand::PersistFailed { update_vector: 9 })));
    }

    #[tokio::test]
    async fn store_without_history_reports_unsupported() {
        let store = Arc::new(FlakyStore { failures: AtomicU32::new(0), calls: AtomicU32::new(0), written: Mutex::new(vec![]) });
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (actor_tx, mut actor_rx) = mpsc::channel(8);
        let _worker = spawn_persist_worker(key(), store, policy(0), jobs_rx, actor_tx);

        let conn_id = Uuid::new_v4();
        jobs_tx.send(PersistJob::History { kind: HistoryKind::Undo, conn_id, seq: 7 }).unwrap();
        match actor_rx.recv().await {
            Some(DiagramCommand::HistoryCompleted { seq, conn_id: id, kind, result }) => {
                assert_eq!(seq, 7);
                assert_eq!(id, conn_id);
                assert_eq!(kind, HistoryKind::Undo);
                assert_eq!(result, Ok(HistoryOutcome::Unsupported));
            }
            other => panic!("unexpected report {:?}", other),
        }
    }
}
