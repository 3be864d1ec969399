//! Integration tests for the pool: scheduling, cancellation, resize and eval
//! against the in-process engine.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use engine_pool::engine::builtin::Function;
use engine_pool::engine::{BuiltinFactory, Engine, EngineFactory, EngineFailure, FunctionRegistry};
use engine_pool::error::{EngineError, JobError, PoolError};
use engine_pool::job::{EvalJob, EvalStatus, JobId, JobStatus, TextSink};
use engine_pool::pool::Pool;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Blocks until the test opens the gate, then echoes its arguments.
struct Gate {
    open: watch::Receiver<bool>,
}

#[async_trait]
impl Function for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    async fn call(
        &self,
        _nlhs: usize,
        args: Vec<Value>,
        _output: &TextSink,
    ) -> Result<Vec<Value>, EngineFailure> {
        let mut open = self.open.clone();
        open.wait_for(|open| *open)
            .await
            .map_err(|_| EngineFailure::new("gate dropped"))?;
        Ok(args)
    }
}

/// Starts builtin engines until `limit` of them exist, then fails.
struct LimitedFactory {
    inner: BuiltinFactory,
    started: AtomicUsize,
    limit: usize,
}

#[async_trait]
impl EngineFactory for LimitedFactory {
    fn name(&self) -> &str {
        "limited"
    }

    async fn start(&self, options: &[String]) -> Result<Arc<dyn Engine>, EngineError> {
        if self.started.fetch_add(1, Ordering::SeqCst) >= self.limit {
            return Err(EngineError::StartFailed {
                reason: "no more engines".to_string(),
            });
        }
        self.inner.start(options).await
    }
}

async fn pool(workers: usize) -> Pool {
    Pool::start(Arc::new(BuiltinFactory::default()), workers, &[])
        .await
        .unwrap()
}

/// Pool whose engines also know the `gate` function. Send `true` to release it.
async fn gated_pool(workers: usize) -> (Pool, watch::Sender<bool>) {
    let (open_tx, open_rx) = watch::channel(false);
    let mut registry = FunctionRegistry::with_builtins();
    registry.register(Arc::new(Gate { open: open_rx }));

    let pool = Pool::start(Arc::new(BuiltinFactory::new(registry)), workers, &[])
        .await
        .unwrap();
    (pool, open_tx)
}

/// Poll `check` until it holds.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    while !check().await {
        sleep(Duration::from_millis(10)).await;
    }
}

async fn status_ids(pool: &Pool) -> Vec<JobId> {
    pool.get_job_status()
        .await
        .unwrap()
        .iter()
        .map(|entry| entry.id)
        .collect()
}

async fn endless(pool: &Pool) -> JobId {
    pool.submit(pool.job("pause", 0, vec![json!(1e10)])).await.unwrap()
}

#[tokio::test]
async fn square_roots_use_every_worker() {
    timeout(TEST_TIMEOUT, async {
        let pool = pool(2).await;

        // Submitted together so both workers are free when the queue fills.
        let submits = (0..50).map(|i| pool.submit(pool.job("sqrt", 1, vec![json!(i)])));
        let ids: Vec<JobId> = join_all(submits)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        let mut workers = HashSet::new();
        for (i, id) in ids.into_iter().enumerate() {
            let mut job = pool.wait(id).await.unwrap();
            assert_eq!(job.status(), JobStatus::Done);
            workers.insert(job.worker().unwrap());
            assert_eq!(job.pop_result().unwrap(), vec![json!((i as f64).sqrt())]);
        }

        assert!(workers.contains(&0));
        assert!(workers.contains(&1));
        assert!(pool.get_job_status().await.unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn second_wait_fails() {
    timeout(TEST_TIMEOUT, async {
        let pool = pool(1).await;
        let id = pool.submit(pool.job("sqrt", 1, vec![json!(4)])).await.unwrap();

        assert!(pool.wait(id).await.is_ok());
        assert!(matches!(
            pool.wait(id).await,
            Err(PoolError::JobNotExists { id: missing }) if missing == id
        ));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn canceled_waiting_job_leaves_no_status() {
    timeout(TEST_TIMEOUT, async {
        let pool = pool(1).await;
        let running = endless(&pool).await;
        let head = endless(&pool).await;
        let queued = endless(&pool).await;

        assert_eq!(pool.cancel(queued).await.unwrap(), JobStatus::Canceled);
        assert_eq!(status_ids(&pool).await, vec![head, running]);
        assert!(matches!(
            pool.cancel(queued).await,
            Err(PoolError::JobNotExists { .. })
        ));
        assert!(matches!(
            pool.wait(queued).await,
            Err(PoolError::JobNotExists { .. })
        ));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn head_canceled_while_waiting_for_worker_never_runs() {
    timeout(TEST_TIMEOUT, async {
        let (pool, open) = gated_pool(1).await;
        let running = pool.submit(pool.job("gate", 1, vec![json!(1)])).await.unwrap();
        let head = pool.submit(pool.job("sqrt", 1, vec![json!(9)])).await.unwrap();

        let entries = pool.get_job_status().await.unwrap();
        assert_eq!(entries[0].id, head);
        assert_eq!(entries[0].status, JobStatus::AssignToWorker);

        assert_eq!(pool.cancel(head).await.unwrap(), JobStatus::Canceled);
        open.send(true).unwrap();

        let mut job = pool.wait(running).await.unwrap();
        assert_eq!(job.pop_result().unwrap(), vec![json!(1)]);

        eventually(|| async { status_ids(&pool).await.is_empty() }).await;
        eventually(|| async { pool.get_worker_status().await.unwrap().ready == vec![true] }).await;
        assert!(matches!(
            pool.wait(head).await,
            Err(PoolError::JobNotExists { .. })
        ));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn resize_to_zero_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let pool = pool(3).await;
        assert!(matches!(pool.resize(0, &[]).await, Err(PoolError::EmptyPool)));
        assert_eq!(pool.size().await.unwrap(), 3);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn shrink_spares_jobs_on_low_workers() {
    timeout(TEST_TIMEOUT, async {
        let (pool, open) = gated_pool(4).await;
        let a = pool.submit(pool.job("gate", 1, vec![json!("a")])).await.unwrap();
        let b = pool.submit(pool.job("gate", 1, vec![json!("b")])).await.unwrap();

        assert_eq!(
            pool.get_worker_status().await.unwrap().ready,
            vec![false, false, true, true]
        );
        assert_eq!(pool.resize(2, &[]).await.unwrap(), 2);
        assert_eq!(pool.size().await.unwrap(), 2);

        open.send(true).unwrap();
        let mut job_a = pool.wait(a).await.unwrap();
        let mut job_b = pool.wait(b).await.unwrap();
        assert_eq!(job_a.worker(), Some(0));
        assert_eq!(job_b.worker(), Some(1));
        assert_eq!(job_a.pop_result().unwrap(), vec![json!("a")]);
        assert_eq!(job_b.pop_result().unwrap(), vec![json!("b")]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn shrink_waits_for_busy_high_worker() {
    timeout(TEST_TIMEOUT, async {
        let (pool, open) = gated_pool(2).await;
        let pool = Arc::new(pool);
        let low = pool.submit(pool.job("gate", 1, vec![json!(0)])).await.unwrap();
        let high = pool.submit(pool.job("gate", 1, vec![json!(1)])).await.unwrap();

        let resizing = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.resize(1, &[]).await })
        };

        sleep(Duration::from_millis(50)).await;
        assert!(!resizing.is_finished());
        // Paused: a new job must not be handed to a worker while the shrink drains.
        let queued = pool.submit(pool.job("sqrt", 1, vec![json!(16)])).await.unwrap();

        open.send(true).unwrap();
        assert_eq!(resizing.await.unwrap().unwrap(), 1);

        assert_eq!(pool.wait(low).await.unwrap().worker(), Some(0));
        assert_eq!(pool.wait(high).await.unwrap().worker(), Some(1));
        let mut job = pool.wait(queued).await.unwrap();
        assert_eq!(job.worker(), Some(0));
        assert_eq!(job.pop_result().unwrap(), vec![json!(4.0)]);
        assert_eq!(pool.get_worker_status().await.unwrap().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failed_grow_leaves_pool_unchanged() {
    timeout(TEST_TIMEOUT, async {
        let factory = LimitedFactory {
            inner: BuiltinFactory::default(),
            started: AtomicUsize::new(0),
            limit: 3,
        };
        let pool = Pool::start(Arc::new(factory), 2, &[]).await.unwrap();

        assert!(matches!(
            pool.resize(4, &[]).await,
            Err(PoolError::Engine(EngineError::StartFailed { .. }))
        ));
        assert_eq!(pool.size().await.unwrap(), 2);
        assert_eq!(pool.get_worker_status().await.unwrap().ready, vec![true, true]);

        let id = pool.submit(pool.job("sqrt", 1, vec![json!(49)])).await.unwrap();
        let mut job = pool.wait(id).await.unwrap();
        assert_eq!(job.pop_result().unwrap(), vec![json!(7.0)]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn grow_adds_ready_workers() {
    timeout(TEST_TIMEOUT, async {
        let pool = pool(1).await;
        let _running = endless(&pool).await;
        let queued = pool.submit(pool.job("sqrt", 1, vec![json!(36)])).await.unwrap();

        assert_eq!(pool.resize(2, &[]).await.unwrap(), 2);
        let mut job = pool.wait(queued).await.unwrap();
        assert_eq!(job.worker(), Some(1));
        assert_eq!(job.pop_result().unwrap(), vec![json!(6.0)]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn worker_status_after_filling_pool() {
    timeout(TEST_TIMEOUT, async {
        let pool = pool(3).await;
        for _ in 0..3 {
            endless(&pool).await;
        }

        let status = pool.get_worker_status().await.unwrap();
        assert_eq!(status.ready, vec![false, false, false]);
        assert_eq!(status.busy_count(), 3);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn invalid_function_reports_execution_error() {
    timeout(TEST_TIMEOUT, async {
        let pool = pool(1).await;
        let id = pool.submit(pool.job("sqqqqrt", 1, vec![json!(0)])).await.unwrap();

        let mut job = pool.wait(id).await.unwrap();
        assert_eq!(job.status(), JobStatus::Error);
        assert!(!job.error().is_empty());
        match job.pop_result() {
            Err(JobError::ExecutionError { id: failed, message }) => {
                assert_eq!(failed, id);
                assert!(message.contains("sqqqqrt"));
            }
            other => panic!("expected execution error, got {other:?}"),
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failures_stay_with_their_job() {
    timeout(TEST_TIMEOUT, async {
        let pool = pool(2).await;
        let bad = pool.submit(pool.job("error", 0, vec![json!("boom")])).await.unwrap();
        let good = pool.submit(pool.job("plus", 1, vec![json!(2), json!(3)])).await.unwrap();

        assert_eq!(pool.wait(bad).await.unwrap().status(), JobStatus::Error);
        let mut job = pool.wait(good).await.unwrap();
        assert_eq!(job.pop_result().unwrap(), vec![json!(5.0)]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn eval_broadcasts_to_every_worker() {
    timeout(TEST_TIMEOUT, async {
        let pool = pool(2).await;

        let mut job = EvalJob::new("pwd");
        pool.eval(&mut job).await.unwrap();
        assert_eq!(job.status(), EvalStatus::Success);
        assert!(!job.output().is_empty());
        assert!(job.error().is_empty());

        let mut job = EvalJob::new("pwwd");
        pool.eval(&mut job).await.unwrap();
        assert_eq!(job.status(), EvalStatus::Error);
        let error = job.error().contents();
        assert!(error.contains(&format!("==== error: worker 0, job {} ====", job.id())));
        assert!(error.contains(&format!("==== error: worker 1, job {} ====", job.id())));
        assert!(error.contains("pwwd"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn clear_drops_waiting_jobs_only() {
    timeout(TEST_TIMEOUT, async {
        let pool = Arc::new(pool(1).await);
        let running = endless(&pool).await;
        let head = endless(&pool).await;
        let first = endless(&pool).await;
        let second = endless(&pool).await;

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.wait(first).await })
        };
        sleep(Duration::from_millis(20)).await;

        assert_eq!(pool.clear().await.unwrap(), 2);
        assert_eq!(status_ids(&pool).await, vec![head, running]);
        assert!(matches!(
            waiter.await.unwrap(),
            Err(PoolError::JobNotExists { .. })
        ));
        assert!(matches!(
            pool.wait(second).await,
            Err(PoolError::JobNotExists { .. })
        ));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_endless_jobs_frees_every_worker() {
    timeout(TEST_TIMEOUT, async {
        let pool = pool(2).await;
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(endless(&pool).await);
        }

        for id in &ids {
            assert_eq!(pool.cancel(*id).await.unwrap(), JobStatus::Canceled);
        }

        eventually(|| async { status_ids(&pool).await.is_empty() }).await;
        eventually(|| async { pool.get_worker_status().await.unwrap().ready == vec![true, true] })
            .await;

        // The pool is still usable afterwards.
        let id = pool.submit(pool.job("sqrt", 1, vec![json!(1)])).await.unwrap();
        assert_eq!(pool.wait(id).await.unwrap().status(), JobStatus::Done);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn completion_wins_over_late_cancel() {
    timeout(TEST_TIMEOUT, async {
        let pool = pool(1).await;
        let id = pool.submit(pool.job("sqrt", 1, vec![json!(81)])).await.unwrap();

        eventually(|| async {
            pool.get_job_status()
                .await
                .unwrap()
                .iter()
                .any(|entry| entry.id == id && entry.status == JobStatus::Done)
        })
        .await;

        assert_eq!(pool.cancel(id).await.unwrap(), JobStatus::Done);
        assert!(matches!(
            pool.wait(id).await,
            Err(PoolError::JobNotExists { .. })
        ));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn concurrent_waiters_get_the_job_once() {
    timeout(TEST_TIMEOUT, async {
        let (pool, open) = gated_pool(1).await;
        let pool = Arc::new(pool);
        let id = pool.submit(pool.job("gate", 1, vec![json!(true)])).await.unwrap();

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.wait(id).await })
            })
            .collect();
        sleep(Duration::from_millis(20)).await;
        open.send(true).unwrap();

        let mut received = 0;
        let mut missing = 0;
        for waiter in waiters {
            match waiter.await.unwrap() {
                Ok(job) => {
                    assert_eq!(job.status(), JobStatus::Done);
                    received += 1;
                }
                Err(PoolError::JobNotExists { .. }) => missing += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((received, missing), (1, 1));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn shutdown_releases_pending_waiters() {
    timeout(TEST_TIMEOUT, async {
        let pool = Arc::new(pool(1).await);
        let _running = endless(&pool).await;
        let queued = endless(&pool).await;

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.wait(queued).await })
        };
        sleep(Duration::from_millis(20)).await;

        pool.shutdown().await.unwrap();
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));
        assert!(matches!(pool.size().await, Err(PoolError::Closed)));
    })
    .await
    .expect("test timed out");
}

#[cfg(unix)]
#[tokio::test]
async fn process_engines_serve_jobs() {
    use engine_pool::engine::ProcessFactory;

    timeout(TEST_TIMEOUT, async {
        // `cat` echoes each request, which reads back as an empty result.
        let pool = Pool::start(Arc::new(ProcessFactory::new("cat", vec![])), 2, &[])
            .await
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(pool.submit(pool.job("identity", 0, vec![json!(1)])).await.unwrap());
        }
        for id in ids {
            let job = pool.wait(id).await.unwrap();
            assert_eq!(job.status(), JobStatus::Done);
        }
        pool.shutdown().await.unwrap();
    })
    .await
    .expect("test timed out");
}

// `sleep` never answers, so its worker stays busy until shutdown kills it.
#[cfg(unix)]
#[tokio::test]
async fn shutdown_stops_busy_process_engines() {
    use engine_pool::engine::ProcessFactory;

    timeout(TEST_TIMEOUT, async {
        let factory = ProcessFactory::new("sleep", vec!["1000".to_string()]);
        let pool = Pool::start(Arc::new(factory), 1, &[]).await.unwrap();
        pool.submit(pool.job("sqrt", 1, vec![json!(4)])).await.unwrap();

        eventually(|| async { pool.get_worker_status().await.unwrap().ready == vec![false] })
            .await;
        pool.shutdown().await.unwrap();
        assert!(matches!(pool.size().await, Err(PoolError::Closed)));
    })
    .await
    .expect("test timed out");
}
