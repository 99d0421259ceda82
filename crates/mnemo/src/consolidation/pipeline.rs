//! Transactional stage execution
//!
//! A transaction runs named stages in order. Stages may register a rollback
//! bound to their own result; if the runner fails (or skips) every committed
//! rollback runs in reverse order. Rollback failures are logged and never
//! stop the remaining rollbacks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::OnceCell;

use crate::error::{EngineError, Result};
use crate::memory::types::ConsolidationOutcome;

type Rollback = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct CommittedStage {
    name: String,
    rollback: Option<Rollback>,
}

/// Handle passed to a transaction runner
#[derive(Clone)]
pub struct Transaction {
    name: Arc<str>,
    stages: Arc<Mutex<Vec<CommittedStage>>>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("name", &self.name)
            .field("committed", &self.committed_stages())
            .finish()
    }
}

impl Transaction {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            stages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn stages(&self) -> MutexGuard<'_, Vec<CommittedStage>> {
        self.stages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of the stages committed so far, in order
    pub fn committed_stages(&self) -> Vec<String> {
        self.stages().iter().map(|s| s.name.clone()).collect()
    }

    /// Run a stage that has nothing to undo
    pub async fn step<T, Fut>(&self, stage: &str, action: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let value = action.await.map_err(|err| self.stage_error(stage, err))?;
        self.commit(stage, None);
        Ok(value)
    }

    /// Run a stage and register `rollback`, called with the stage's result if
    /// a later stage fails
    pub async fn step_with_rollback<T, Fut, R, RFut>(
        &self,
        stage: &str,
        action: Fut,
        rollback: R,
    ) -> Result<T>
    where
        T: Clone + Send + 'static,
        Fut: Future<Output = Result<T>>,
        R: FnOnce(T) -> RFut + Send + 'static,
        RFut: Future<Output = Result<()>> + Send + 'static,
    {
        let value = action.await.map_err(|err| self.stage_error(stage, err))?;
        let committed = value.clone();
        let undo: Rollback =
            Box::new(move || Box::pin(rollback(committed)) as BoxFuture<'static, Result<()>>);
        self.commit(stage, Some(undo));
        Ok(value)
    }

    /// Control signal that aborts the transaction, rolls back, and yields no result
    pub fn skip(reason: impl Into<String>) -> EngineError {
        EngineError::Skipped(reason.into())
    }

    fn commit(&self, stage: &str, rollback: Option<Rollback>) {
        tracing::trace!(transaction = %self.name, stage, "Stage committed");
        self.stages().push(CommittedStage {
            name: stage.to_string(),
            rollback,
        });
    }

    fn stage_error(&self, stage: &str, err: EngineError) -> EngineError {
        if err.is_typed() {
            return err;
        }
        EngineError::TransactionFailed {
            transaction: self.name.to_string(),
            stage: stage.to_string(),
            reason: err.to_string(),
        }
    }

    async fn rollback(&self) {
        let stages = std::mem::take(&mut *self.stages());
        for stage in stages.into_iter().rev() {
            let Some(rollback) = stage.rollback else {
                continue;
            };
            match rollback().await {
                Ok(()) => {
                    tracing::debug!(transaction = %self.name, stage = %stage.name, "Rolled back stage");
                }
                Err(err) => {
                    tracing::warn!(
                        transaction = %self.name,
                        stage = %stage.name,
                        error = %err,
                        "Rollback failed"
                    );
                }
            }
        }
    }

    /// Run `runner` as a transaction named `name`.
    ///
    /// Returns `Ok(None)` when the runner skipped. Any other failure is
    /// returned after rollback; untyped failures raised outside a stage are
    /// reported as `TransactionFailed` at stage `runner`.
    pub async fn execute<T, F, Fut>(name: &str, runner: F) -> Result<Option<T>>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let transaction = Transaction::new(name);
        match runner(transaction.clone()).await {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                transaction.rollback().await;
                match err {
                    EngineError::Skipped(reason) => {
                        tracing::debug!(transaction = name, %reason, "Transaction skipped");
                        Ok(None)
                    }
                    err => Err(transaction.stage_error("runner", err)),
                }
            }
        }
    }
}

/// Transaction executor with permanent per-key memoization
///
/// Once a key completes successfully its result is returned for every later
/// call for the lifetime of the pipeline, and the runner is never invoked
/// again. Failures and skips are not remembered.
#[derive(Debug)]
pub struct TransactionalConsolidationPipeline<T = ConsolidationOutcome> {
    completed: Mutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T> Default for TransactionalConsolidationPipeline<T> {
    fn default() -> Self {
        Self {
            completed: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> TransactionalConsolidationPipeline<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn completed(&self) -> MutexGuard<'_, HashMap<String, Arc<OnceCell<T>>>> {
        self.completed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a one-off transaction without memoization
    pub async fn execute<R, F, Fut>(&self, name: &str, runner: F) -> Result<Option<R>>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        Transaction::execute(name, runner).await
    }

    /// Run `runner` for `key` unless `key` already completed
    pub async fn run<F, Fut>(&self, key: &str, runner: F) -> Result<Option<T>>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cell = Arc::clone(self.completed().entry(key.to_string()).or_default());
        if let Some(value) = cell.get() {
            tracing::debug!(key, "Transaction result memoized");
            return Ok(Some(value.clone()));
        }

        let result = cell
            .get_or_try_init(|| async {
                match Transaction::execute(key, runner).await {
                    Ok(Some(value)) => Ok(value),
                    Ok(None) => Err(Transaction::skip(key)),
                    Err(err) => Err(err),
                }
            })
            .await
            .cloned();
        drop(cell);

        if result.is_err() {
            self.prune(key);
        }
        match result {
            Ok(value) => Ok(Some(value)),
            Err(EngineError::Skipped(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Forget an unset cell for `key` once no other caller holds it
    fn prune(&self, key: &str) {
        let mut completed = self.completed();
        let unused = completed
            .get(key)
            .is_some_and(|cell| !cell.initialized() && Arc::strong_count(cell) == 1);
        if unused {
            completed.remove(key);
        }
    }

    pub fn is_completed(&self, key: &str) -> bool {
        self.completed()
            .get(key)
            .is_some_and(|cell| cell.initialized())
    }

    /// Number of keys with a memoized result
    pub fn completed_count(&self) -> usize {
        self.completed()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::Tier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn record_rollback(
        log: &Log,
    ) -> impl FnOnce(u32) -> BoxFuture<'static, Result<()>> + Send + 'static {
        let log = Arc::clone(log);
        move |value: u32| {
            Box::pin(async move {
                log.lock().unwrap().push(format!("undo {value}"));
                Ok(())
            }) as BoxFuture<'static, Result<()>>
        }
    }

    mod execute {
        use super::*;

        #[tokio::test]
        async fn test_success_returns_value_without_rollback() {
            let log = log();
            let result = Transaction::execute("ok", |tx| {
                let log = Arc::clone(&log);
                async move {
                    let a = tx
                        .step_with_rollback("one", async { Ok(1u32) }, record_rollback(&log))
                        .await?;
                    let b = tx.step("two", async { Ok(2u32) }).await?;
                    assert_eq!(tx.committed_stages(), vec!["one", "two"]);
                    Ok(a + b)
                }
            })
            .await
            .unwrap();

            assert_eq!(result, Some(3));
            assert!(entries(&log).is_empty());
        }

        #[tokio::test]
        async fn test_failure_rolls_back_in_reverse_order() {
            let log = log();
            let result: Result<Option<()>> = Transaction::execute("move", |tx| {
                let log = Arc::clone(&log);
                async move {
                    tx.step_with_rollback("one", async { Ok(1u32) }, record_rollback(&log))
                        .await?;
                    tx.step_with_rollback("two", async { Ok(2u32) }, record_rollback(&log))
                        .await?;
                    tx.step("three", async {
                        Err::<(), _>(EngineError::Storage("disk gone".to_string()))
                    })
                    .await?;
                    Ok(())
                }
            })
            .await;

            match result {
                Err(EngineError::TransactionFailed {
                    transaction, stage, ..
                }) => {
                    assert_eq!(transaction, "move");
                    assert_eq!(stage, "three");
                }
                other => panic!("expected TransactionFailed, got {other:?}"),
            }
            assert_eq!(entries(&log), vec!["undo 2", "undo 1"]);
        }

        #[tokio::test]
        async fn test_rollback_failure_does_not_stop_remaining_rollbacks() {
            let log = log();
            let result: Result<Option<()>> = Transaction::execute("move", |tx| {
                let log = Arc::clone(&log);
                async move {
                    tx.step_with_rollback("one", async { Ok(1u32) }, record_rollback(&log))
                        .await?;
                    tx.step_with_rollback("two", async { Ok(2u32) }, |_| async {
                        Err::<(), _>(EngineError::Storage("cannot undo".to_string()))
                    })
                    .await?;
                    Err(EngineError::Storage("late failure".to_string()))
                }
            })
            .await;

            assert!(matches!(
                result,
                Err(EngineError::TransactionFailed { ref stage, .. }) if stage == "runner"
            ));
            assert_eq!(entries(&log), vec!["undo 1"]);
        }

        #[tokio::test]
        async fn test_skip_rolls_back_and_returns_none() {
            let log = log();
            let result: Option<()> = Transaction::execute("maybe", |tx| {
                let log = Arc::clone(&log);
                async move {
                    tx.step_with_rollback("one", async { Ok(1u32) }, record_rollback(&log))
                        .await?;
                    Err(Transaction::skip("nothing to do"))
                }
            })
            .await
            .unwrap();

            assert!(result.is_none());
            assert_eq!(entries(&log), vec!["undo 1"]);
        }

        #[tokio::test]
        async fn test_typed_errors_pass_through() {
            let result: Result<Option<()>> = Transaction::execute("move", |tx| async move {
                tx.step("read", async {
                    Err::<(), _>(EngineError::not_found("abc", Tier::Short))
                })
                .await
            })
            .await;
            assert!(matches!(result, Err(EngineError::NotFound { .. })));
        }
    }

    mod memoization {
        use super::*;

        #[tokio::test]
        async fn test_completed_key_never_reruns() {
            let pipeline = TransactionalConsolidationPipeline::<usize>::new();
            let runs = AtomicUsize::new(0);

            for _ in 0..3 {
                let value = pipeline
                    .run("k", |_tx| async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(42)
                    })
                    .await
                    .unwrap();
                assert_eq!(value, Some(42));
            }

            assert_eq!(runs.load(Ordering::SeqCst), 1);
            assert!(pipeline.is_completed("k"));
            assert_eq!(pipeline.completed_count(), 1);
        }

        #[tokio::test]
        async fn test_failures_and_skips_are_not_memoized() {
            let pipeline = TransactionalConsolidationPipeline::<usize>::new();

            let failed = pipeline
                .run("k", |_tx| async {
                    Err(EngineError::Storage("boom".to_string()))
                })
                .await;
            assert!(failed.is_err());

            let skipped = pipeline
                .run("k", |_tx| async { Err(Transaction::skip("later")) })
                .await
                .unwrap();
            assert!(skipped.is_none());
            assert!(!pipeline.is_completed("k"));

            let value = pipeline.run("k", |_tx| async { Ok(5) }).await.unwrap();
            assert_eq!(value, Some(5));
        }

        #[tokio::test]
        async fn test_unfinished_keys_leave_no_entry() {
            let pipeline = TransactionalConsolidationPipeline::<usize>::new();

            for i in 0..10 {
                let key = format!("failed-{i}");
                let result = pipeline
                    .run(&key, |_tx| async {
                        Err(EngineError::Storage("boom".to_string()))
                    })
                    .await;
                assert!(result.is_err());
            }
            let skipped = pipeline
                .run("skipped", |_tx| async { Err(Transaction::skip("later")) })
                .await
                .unwrap();
            assert!(skipped.is_none());
            assert!(pipeline.completed().is_empty());

            pipeline.run("done", |_tx| async { Ok(1) }).await.unwrap();
            assert_eq!(pipeline.completed().len(), 1);
        }

        #[tokio::test]
        async fn test_concurrent_runs_execute_once() {
            let pipeline = Arc::new(TransactionalConsolidationPipeline::<usize>::new());
            let runs = Arc::new(AtomicUsize::new(0));

            let tasks: Vec<_> = (0..4)
                .map(|_| {
                    let pipeline = Arc::clone(&pipeline);
                    let runs = Arc::clone(&runs);
                    tokio::spawn(async move {
                        pipeline
                            .run("k", |_tx| async move {
                                tokio::time::sleep(Duration::from_millis(30)).await;
                                Ok(runs.fetch_add(1, Ordering::SeqCst))
                            })
                            .await
                    })
                })
                .collect();

            for task in tasks {
                assert_eq!(task.await.unwrap().unwrap(), Some(0));
            }
            assert_eq!(runs.load(Ordering::SeqCst), 1);
        }
    }
}
