//! Fixed-interval background jobs keyed by id.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{BotError, BotResult};

type JobFuture = std::pin::Pin<Box<dyn Future<Output = BotResult<()>> + Send>>;
type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Owns one timer task per job id. Dropping the scheduler cancels them all.
#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run `task` every `every`, first after one full interval. Scheduling an
    /// id that already exists cancels the old timer.
    ///
    /// A failing or panicking run is logged and the schedule keeps going.
    pub fn schedule<F, Fut>(&self, id: impl Into<String>, every: Duration, task: F) -> BotResult<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BotResult<()>> + Send + 'static,
    {
        let id = id.into();
        if every.is_zero() {
            return Err(BotError::Config(format!("job `{id}` has a zero interval")));
        }

        let task: JobFn = Arc::new(move || Box::pin(task()) as JobFuture);
        let handle = tokio::spawn(run_job(id.clone(), every, task));

        if let Some(previous) = self.jobs().insert(id.clone(), handle) {
            previous.abort();
            info!(job = %id, "replaced scheduled job");
        } else {
            info!(job = %id, every_ms = every.as_millis() as u64, "scheduled job");
        }
        Ok(())
    }

    /// Stop a job's timer. A run already in progress finishes.
    pub fn cancel(&self, id: &str) -> bool {
        match self.jobs().remove(id) {
            Some(handle) => {
                handle.abort();
                info!(job = %id, "cancelled scheduled job");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (id, handle) in self.jobs().drain() {
            debug!(job = %id, "cancelling scheduled job");
            handle.abort();
        }
    }

    pub fn is_scheduled(&self, id: &str) -> bool {
        self.jobs()
            .get(id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Ids of all jobs, sorted.
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.job_ids())
            .finish()
    }
}

async fn run_job(id: String, every: Duration, task: JobFn) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        debug!(job = %id, "running scheduled job");

        // Each run gets its own task so a panic stays contained.
        match tokio::spawn(task()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(job = %id, error = %e, "scheduled job failed"),
            Err(e) if e.is_panic() => error!(job = %id, "scheduled job panicked"),
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_job(counter: &Arc<AtomicUsize>) -> impl Fn() -> std::future::Ready<BotResult<()>> {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(()))
        }
    }

    /// Let spawned tasks observe the advanced clock.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_on_interval() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler
            .schedule("tick", Duration::from_secs(10), counter_job(&runs))
            .unwrap();

        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        for expected in 1..=3 {
            tokio::time::advance(Duration::from_secs(10)).await;
            settle().await;
            assert_eq!(runs.load(Ordering::SeqCst), expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failures_and_panics_do_not_stop_the_schedule() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        scheduler
            .schedule("flaky", Duration::from_secs(1), move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        0 => Err(BotError::handler("first run fails")),
                        1 => panic!("second run panics"),
                        _ => Ok(()),
                    }
                }
            })
            .unwrap();

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(scheduler.is_scheduled("flaky"));
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_previous_timer() {
        let scheduler = Scheduler::new();
        let old_runs = Arc::new(AtomicUsize::new(0));
        let new_runs = Arc::new(AtomicUsize::new(0));

        scheduler
            .schedule("job", Duration::from_secs(1), counter_job(&old_runs))
            .unwrap();
        scheduler
            .schedule("job", Duration::from_secs(1), counter_job(&new_runs))
            .unwrap();
        assert_eq!(scheduler.job_ids(), ["job"]);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(old_runs.load(Ordering::SeqCst), 0);
        assert_eq!(new_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_future_runs() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler
            .schedule("job", Duration::from_secs(1), counter_job(&runs))
            .unwrap();

        assert!(scheduler.cancel("job"));
        assert!(!scheduler.cancel("job"));
        assert!(!scheduler.is_scheduled("job"));

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let err = scheduler
            .schedule("job", Duration::ZERO, counter_job(&runs))
            .unwrap_err();
        assert!(matches!(err, BotError::Config(_)));
        assert!(scheduler.job_ids().is_empty());
    }
}
