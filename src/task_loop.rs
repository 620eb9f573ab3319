//! C14 TaskLoop — deterministic dispatcher of named periodic maintenance jobs (§4.14), each
//! with its own interval/timeout/retry policy and a global overlap lock.

use crate::error::{CoreError, CoreResult};
use crate::model::Time;
use crate::store::kv::LockBackend;
use crate::store::lock::LockManager;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

type JobBody = Arc<dyn Fn(Time) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub interval_ms: i64,
    pub timeout_ms: i64,
    pub retry_attempts: u32,
    pub enabled: bool,
    /// `statsReset`-style jobs (§4.14) that only actually run inside a wall-clock window,
    /// independent of their interval. Checked against real local time, not an injected clock,
    /// since the window is a calendar concept, not a domain-time one.
    pub local_midnight_only: bool,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, interval_ms: i64, timeout_ms: i64) -> Self {
        Self {
            name: name.into(),
            interval_ms,
            timeout_ms,
            retry_attempts: 0,
            enabled: true,
            local_midnight_only: false,
        }
    }
}

struct RegisteredJob {
    spec: JobSpec,
    body: JobBody,
}

/// Dispatches every registered, enabled job on its own interval. `start`/`stop` are idempotent
/// (mirrors `BackupWorker`'s lifecycle shape); a job overlapping its own previous run (e.g.
/// across a process restart) is prevented by a global `scheduler:<name>` lock rather than any
/// in-process flag, so two processes racing the same job also serialise.
pub struct TaskLoop<B: LockBackend> {
    locks: Arc<LockManager<B>>,
    jobs: Vec<Arc<RegisteredJob>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: LockBackend + 'static> TaskLoop<B> {
    pub fn new(locks: Arc<LockManager<B>>) -> Self {
        Self { locks, jobs: Vec::new(), handles: Mutex::new(Vec::new()) }
    }

    pub fn register<F, Fut>(&mut self, spec: JobSpec, body: F)
    where
        F: Fn(Time) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<()>> + Send + 'static,
    {
        let body: JobBody = Arc::new(move |now| Box::pin(body(now)));
        self.jobs.push(Arc::new(RegisteredJob { spec, body }));
    }

    /// Spawns one interval loop per enabled job. A second call while already started is a
    /// no-op.
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().expect("task loop lock poisoned");
        if !handles.is_empty() {
            return;
        }
        for job in self.jobs.iter().filter(|j| j.spec.enabled) {
            let this = Arc::clone(self);
            let job = Arc::clone(job);
            let interval_ms = job.spec.interval_ms.max(1) as u64;
            let jh = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                    this.dispatch(&job).await;
                }
            });
            handles.push(jh);
        }
    }

    pub fn stop(&self) {
        let mut handles = self.handles.lock().expect("task loop lock poisoned");
        for jh in handles.drain(..) {
            jh.abort();
        }
    }

    /// Triggers a single registered job's dispatch immediately, bypassing its interval timer.
    /// Exposed for admin tooling and for tests that don't want to wait out a real interval.
    pub async fn run_job_now(&self, name: &str) -> CoreResult<()> {
        let job = self
            .jobs
            .iter()
            .find(|j| j.spec.name == name)
            .ok_or_else(|| CoreError::NotFound(format!("job {name}")))?;
        self.dispatch(job).await
    }

    async fn dispatch(&self, job: &Arc<RegisteredJob>) -> CoreResult<()> {
        if job.spec.local_midnight_only && !at_local_midnight_window() {
            tracing::debug!(job = %job.spec.name, "skipped: outside wall-clock window");
            return Ok(());
        }
        let lease_ms = job.spec.timeout_ms.max(0) + 5_000;
        let job_for_body = Arc::clone(job);
        let result = self
            .locks
            .with_lock("scheduler", &job.spec.name, lease_ms, move || run_with_retry(job_for_body))
            .await;
        if let Err(CoreError::LockTimeout { .. }) = &result {
            tracing::debug!(job = %job.spec.name, "skipped: already running elsewhere");
            return Ok(());
        }
        result
    }
}

async fn run_with_retry(job: Arc<RegisteredJob>) -> CoreResult<()> {
    let mut attempt = 0u32;
    loop {
        let now = chrono::Utc::now().timestamp_millis();
        let started = std::time::Instant::now();
        let timeout_dur = Duration::from_millis(job.spec.timeout_ms.max(1) as u64);
        let outcome = tokio::time::timeout(timeout_dur, (job.body)(now)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let err = match outcome {
            Ok(Ok(())) => {
                tracing::info!(job = %job.spec.name, duration_ms, outcome = "success", "job run complete");
                return Ok(());
            }
            Ok(Err(e)) => {
                tracing::warn!(job = %job.spec.name, duration_ms, outcome = "error", attempt, error = %e, "job run failed");
                e
            }
            Err(_) => {
                tracing::warn!(job = %job.spec.name, duration_ms, outcome = "timeout", attempt, "job run timed out");
                CoreError::TaskTimeout(timeout_dur)
            }
        };

        if attempt >= job.spec.retry_attempts {
            return Err(err);
        }
        attempt += 1;
    }
}

fn at_local_midnight_window() -> bool {
    use chrono::Timelike;
    let local = chrono::Local::now();
    local.hour() == 0 && local.minute() == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn task_loop() -> Arc<TaskLoop<MemoryStore>> {
        let locks = Arc::new(LockManager::new(Arc::new(MemoryStore::new())));
        Arc::new(TaskLoop::new(locks))
    }

    #[tokio::test]
    async fn run_job_now_invokes_the_registered_body() {
        let mut tl = TaskLoop::new(Arc::new(LockManager::new(Arc::new(MemoryStore::new()))));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        tl.register(JobSpec::new("sweep", 60_000, 1_000), move |_now| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let tl = Arc::new(tl);
        tl.run_job_now("sweep").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_job_name_is_not_found() {
        let tl = task_loop();
        let err = tl.run_job_now("does-not-exist").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn failing_job_retries_then_surfaces_the_error() {
        let mut tl = TaskLoop::new(Arc::new(LockManager::new(Arc::new(MemoryStore::new()))));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut spec = JobSpec::new("flaky", 60_000, 1_000);
        spec.retry_attempts = 2;
        tl.register(spec, move |_now| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::Validation("boom".into()))
            }
        });
        let tl = Arc::new(tl);
        let err = tl.run_job_now("flaky").await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3); // initial + 2 retries
    }

    #[tokio::test]
    async fn succeeding_on_a_later_retry_stops_the_loop() {
        let mut tl = TaskLoop::new(Arc::new(LockManager::new(Arc::new(MemoryStore::new()))));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut spec = JobSpec::new("eventually-ok", 60_000, 1_000);
        spec.retry_attempts = 3;
        tl.register(spec, move |_now| {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(CoreError::Validation("not yet".into()))
                } else {
                    Ok(())
                }
            }
        });
        let tl = Arc::new(tl);
        tl.run_job_now("eventually-ok").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_job_times_out_and_is_reported_as_a_task_timeout() {
        let mut tl = TaskLoop::new(Arc::new(LockManager::new(Arc::new(MemoryStore::new()))));
        tl.register(JobSpec::new("slow", 60_000, 20), |_now| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        });
        let tl = Arc::new(tl);
        let err = tl.run_job_now("slow").await.unwrap_err();
        assert!(matches!(err, CoreError::TaskTimeout(_)));
    }

    #[tokio::test]
    async fn local_midnight_only_job_is_skipped_outside_the_window() {
        use chrono::Timelike;
        let mut tl = TaskLoop::new(Arc::new(LockManager::new(Arc::new(MemoryStore::new()))));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut spec = JobSpec::new("statsReset", 60_000, 1_000);
        spec.local_midnight_only = true;
        tl.register(spec, move |_now| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let tl = Arc::new(tl);
        tl.run_job_now("statsReset").await.unwrap();
        // This test runs whenever the suite runs, not necessarily at local midnight, so the
        // call count is asserted conditionally on the clock rather than hardcoded.
        let local = chrono::Local::now();
        let expected = if local.hour() == 0 && local.minute() == 0 { 1 } else { 0 };
        assert_eq!(calls.load(Ordering::SeqCst), expected);
    }

    #[tokio::test]
    async fn start_then_stop_is_idempotent() {
        let tl = task_loop();
        tl.start();
        tl.start();
        tl.stop();
        tl.stop();
    }
}
