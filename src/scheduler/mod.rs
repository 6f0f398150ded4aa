//! Background job scheduler.
//!
//! A single cooperative tick loop collects due jobs every second, orders
//! them by priority then due time, and dispatches them as parallel tasks up
//! to the concurrency cap. Each run races its configured timeout; failures
//! and timeouts reschedule with linear backoff until the retry budget is
//! exhausted.
//!
//! The tick loop itself is single-threaded; only dispatched job bodies run
//! in parallel. Within one tick, higher priority runs before lower and
//! same-priority ties break by earlier due time. Across ticks no ordering is
//! guaranteed between concurrently running jobs.

mod job;
pub mod system_jobs;

pub use job::{
    Interval, JobFn, JobFuture, JobOptions, JobPriority, JobSnapshot, JobStatus, Trigger,
};
pub use system_jobs::{install_system_jobs, SystemJobContext};

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use self::job::Job;
use crate::config::SchedulerConfig;
use crate::error::DispatchError;

/// The job table and tick loop.
pub struct Scheduler {
    config: SchedulerConfig,
    jobs: Mutex<HashMap<String, Job>>,
    running: Mutex<HashSet<String>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            jobs: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Registers a job. Replaces any existing job with the same id.
    pub fn schedule<F, Fut>(&self, id: impl Into<String>, trigger: Trigger, opts: JobOptions, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        let run: JobFn = Arc::new(move || Box::pin(f()));
        self.schedule_fn(id, trigger, opts, run);
    }

    /// Registers a job from an already-boxed body.
    pub fn schedule_fn(&self, id: impl Into<String>, trigger: Trigger, opts: JobOptions, run: JobFn) {
        let id = id.into();
        let next_run = trigger.first_run(Instant::now());
        debug!(job = %id, ?trigger, "job scheduled");
        self.jobs.lock().expect("job table lock poisoned").insert(
            id,
            Job {
                run,
                trigger,
                opts,
                status: JobStatus::Scheduled,
                retry_count: 0,
                next_run,
                last_error: None,
            },
        );
    }

    /// Removes a job. Returns whether it existed. A run already in flight
    /// finishes but will not reschedule.
    pub fn cancel(&self, id: &str) -> bool {
        self.jobs
            .lock()
            .expect("job table lock poisoned")
            .remove(id)
            .is_some()
    }

    /// Runs the tick loop until shutdown is signalled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            tick_ms = self.config.tick.as_millis() as u64,
            max_concurrent = self.config.max_concurrent_jobs,
            "scheduler starting"
        );

        let mut interval = tokio::time::interval(self.config.tick);
        // Skip the immediate first tick.
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("scheduler shutting down");
                    break;
                }

                _ = interval.tick() => {
                    Arc::clone(&self).tick();
                }
            }
        }
    }

    /// One pass of the tick loop: collect due jobs, order them, dispatch up
    /// to the concurrency cap. Public so tests and embedders can drive the
    /// scheduler without the loop.
    pub fn tick(self: Arc<Self>) {
        let now = Instant::now();

        let mut due: Vec<(String, JobPriority, Instant)> = {
            let jobs = self.jobs.lock().expect("job table lock poisoned");
            jobs.iter()
                .filter(|(_, job)| job.status != JobStatus::Running && job.next_run <= now)
                .map(|(id, job)| (id.clone(), job.opts.priority, job.next_run))
                .collect()
        };
        due.sort_by(|a, b| (a.1, a.2).cmp(&(b.1, b.2)));

        for (id, _, _) in due {
            let at_capacity = {
                let running = self.running.lock().expect("running set lock poisoned");
                running.len() >= self.config.max_concurrent_jobs
            };
            if at_capacity {
                break;
            }
            Arc::clone(&self).dispatch(&id);
        }
    }

    fn dispatch(self: Arc<Self>, id: &str) {
        let (run, opts) = {
            let mut jobs = self.jobs.lock().expect("job table lock poisoned");
            let Some(job) = jobs.get_mut(id) else {
                return;
            };
            job.status = JobStatus::Running;
            (Arc::clone(&job.run), job.opts)
        };
        self.running
            .lock()
            .expect("running set lock poisoned")
            .insert(id.to_string());

        debug!(job = %id, "job dispatched");
        let scheduler = self;
        let id = id.to_string();
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(opts.timeout, (run)()).await;
            scheduler.on_complete(&id, outcome);
        });
    }

    fn on_complete(
        &self,
        id: &str,
        outcome: Result<Result<(), DispatchError>, tokio::time::error::Elapsed>,
    ) {
        self.running
            .lock()
            .expect("running set lock poisoned")
            .remove(id);

        let now = Instant::now();
        let mut jobs = self.jobs.lock().expect("job table lock poisoned");
        let Some(job) = jobs.get_mut(id) else {
            // Cancelled while running.
            return;
        };

        match outcome {
            Ok(Ok(())) => {
                job.status = JobStatus::Completed;
                job.retry_count = 0;
                job.last_error = None;
                match job.trigger {
                    Trigger::Every(interval) => {
                        job.status = JobStatus::Scheduled;
                        job.next_run = now + interval.duration();
                    }
                    Trigger::At(_) => {
                        debug!(job = %id, "one-shot job completed");
                        jobs.remove(id);
                    }
                }
            }
            Ok(Err(err)) => {
                let backoff = self.config.retry_backoff;
                Self::handle_failure(&mut jobs, id, JobStatus::Failed, err.to_string(), backoff, now);
            }
            Err(_elapsed) => {
                let backoff = self.config.timeout_backoff;
                let message = format!("timed out after {} ms", {
                    let timeout = jobs.get(id).map(|j| j.opts.timeout).unwrap_or_default();
                    timeout.as_millis()
                });
                Self::handle_failure(&mut jobs, id, JobStatus::Timeout, message, backoff, now);
            }
        }
    }

    /// Failure and timeout share the retry walk; only the recorded status
    /// and the backoff unit differ.
    fn handle_failure(
        jobs: &mut HashMap<String, Job>,
        id: &str,
        status: JobStatus,
        message: String,
        backoff: std::time::Duration,
        now: Instant,
    ) {
        let Some(job) = jobs.get_mut(id) else {
            return;
        };
        job.last_error = Some(message.clone());

        if job.retry_count < job.opts.max_retries {
            job.retry_count += 1;
            job.status = status;
            job.next_run = now + backoff * job.retry_count;
            debug!(
                job = %id,
                retry = job.retry_count,
                backoff_ms = (backoff * job.retry_count).as_millis() as u64,
                error = %message,
                "job run failed, rescheduled"
            );
        } else {
            error!(job = %id, error = %message, "job failed permanently, retries exhausted");
            match job.trigger {
                Trigger::At(_) => {
                    jobs.remove(id);
                }
                Trigger::Every(interval) => {
                    // Periodic maintenance must keep running; start a fresh
                    // retry budget at the next interval.
                    job.retry_count = 0;
                    job.status = JobStatus::Scheduled;
                    job.next_run = now + interval.duration();
                }
            }
        }
    }

    /// Operator snapshot of the job table, sorted by id.
    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        let now = Instant::now();
        let jobs = self.jobs.lock().expect("job table lock poisoned");
        let mut snapshots: Vec<JobSnapshot> = jobs
            .iter()
            .map(|(id, job)| JobSnapshot {
                id: id.clone(),
                status: job.status,
                priority: job.opts.priority,
                retry_count: job.retry_count,
                next_run_in_ms: job
                    .next_run
                    .checked_duration_since(now)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0),
                periodic: matches!(job.trigger, Trigger::Every(_)),
                last_error: job.last_error.clone(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Number of jobs in the table.
    pub fn len(&self) -> usize {
        self.jobs.lock().expect("job table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
