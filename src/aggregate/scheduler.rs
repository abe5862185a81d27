//! Cooperative task scheduling
//!
//! Each producer and job gets its own tokio task. A tick is spawned
//! separately from its timer so a slow compute never delays the timer;
//! the runner's running flag turns an overlapping tick into a skip.

use super::producer::{ProducerRunner, ProducerSpec, RunningGuard, SectionProducer};
use super::AggregateStore;
use crate::config::FeedsConfig;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveTime, TimeZone};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// A scheduled job that does not own a section (evaluation, archiving)
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<()>;
}

/// Spreads the first tick of each producer over time
#[derive(Debug, Clone)]
pub struct Stagger {
    pub base: Duration,
    pub step: Duration,
    pub jitter: Duration,
}

impl Stagger {
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            step: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Initial delay of the `index`-th registered producer
    pub fn delay_for(&self, index: usize) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        self.base + self.step * index as u32 + jitter
    }
}

impl From<&FeedsConfig> for Stagger {
    fn from(config: &FeedsConfig) -> Self {
        Self {
            base: Duration::from_secs(config.startup_delay_secs),
            step: Duration::from_secs(config.stagger_step_secs),
            jitter: Duration::from_millis(config.stagger_jitter_ms),
        }
    }
}

/// Next occurrence of local wall-clock time `at` strictly after `now`
pub fn next_daily_run<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut date = now.date_naive();
    for _ in 0..3 {
        let naive = date.and_time(at);
        // Times inside a DST gap move forward by an hour
        let candidate = tz
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| tz.from_local_datetime(&(naive + chrono::Duration::hours(1))).earliest());
        if let Some(candidate) = candidate {
            if candidate > *now {
                return candidate;
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    now.clone() + chrono::Duration::days(1)
}

struct JobSlot {
    job: Arc<dyn PeriodicJob>,
    running: AtomicBool,
}

impl JobSlot {
    async fn run_guarded(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("[Scheduler] {} still running, skipping", self.job.name());
            return;
        }
        let _guard = RunningGuard(&self.running);
        if let Err(e) = self.job.run().await {
            error!("[Scheduler] Job {} failed: {}", self.job.name(), e);
        }
    }
}

enum JobSchedule {
    Every { cadence: Duration, initial_delay: Duration },
    DailyAt(NaiveTime),
}

/// Owns every producer and job task
pub struct Scheduler {
    store: Arc<AggregateStore>,
    stagger: Stagger,
    producers: Vec<Arc<ProducerRunner>>,
    jobs: Vec<(Arc<JobSlot>, JobSchedule)>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(store: Arc<AggregateStore>, stagger: Stagger) -> Self {
        Self {
            store,
            stagger,
            producers: Vec::new(),
            jobs: Vec::new(),
            handles: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<AggregateStore> {
        &self.store
    }

    /// Bind `producer` to a new section. Fails if the section name is taken.
    pub fn register(
        &mut self,
        spec: ProducerSpec,
        producer: Arc<dyn SectionProducer>,
    ) -> Result<Arc<ProducerRunner>> {
        let runner = Arc::new(ProducerRunner::register(&self.store, spec, producer)?);
        self.producers.push(Arc::clone(&runner));
        Ok(runner)
    }

    /// Run `job` every `cadence`, first after `initial_delay`
    pub fn register_job(&mut self, job: Arc<dyn PeriodicJob>, cadence: Duration, initial_delay: Duration) {
        self.jobs.push((
            Arc::new(JobSlot {
                job,
                running: AtomicBool::new(false),
            }),
            JobSchedule::Every {
                cadence,
                initial_delay,
            },
        ));
    }

    /// Run `job` once a day at local time `at`
    pub fn register_daily(&mut self, job: Arc<dyn PeriodicJob>, at: NaiveTime) {
        self.jobs.push((
            Arc::new(JobSlot {
                job,
                running: AtomicBool::new(false),
            }),
            JobSchedule::DailyAt(at),
        ));
    }

    /// Spawn all tasks. Returns immediately.
    pub fn start(&mut self) {
        for (index, runner) in self.producers.iter().enumerate() {
            let runner = Arc::clone(runner);
            let cadence = runner.spec().cadence;
            let initial_delay = runner
                .spec()
                .initial_delay
                .unwrap_or_else(|| self.stagger.delay_for(index));

            info!(
                "[Scheduler] {} every {:?}, first tick in {:?}",
                runner.section(),
                cadence,
                initial_delay
            );

            self.handles.push(tokio::spawn(async move {
                tokio::time::sleep(initial_delay).await;
                let mut ticker = interval(cadence);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let runner = Arc::clone(&runner);
                    tokio::spawn(async move {
                        runner.tick().await;
                    });
                }
            }));
        }

        for (slot, schedule) in &self.jobs {
            let slot = Arc::clone(slot);
            let handle = match *schedule {
                JobSchedule::Every {
                    cadence,
                    initial_delay,
                } => {
                    info!("[Scheduler] Job {} every {:?}", slot.job.name(), cadence);
                    tokio::spawn(async move {
                        tokio::time::sleep(initial_delay).await;
                        let mut ticker = interval(cadence);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                        loop {
                            ticker.tick().await;
                            let slot = Arc::clone(&slot);
                            tokio::spawn(async move { slot.run_guarded().await });
                        }
                    })
                }
                JobSchedule::DailyAt(at) => {
                    info!("[Scheduler] Job {} daily at {}", slot.job.name(), at);
                    tokio::spawn(async move {
                        loop {
                            let now = Local::now();
                            let next = next_daily_run(&now, at);
                            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                            debug!("[Scheduler] {} next run at {}", slot.job.name(), next);
                            tokio::time::sleep(wait).await;
                            let slot = Arc::clone(&slot);
                            // Awaiting the spawned handle keeps a panicking job from ending this loop
                            let _ = tokio::spawn(async move { slot.run_guarded().await }).await;
                        }
                    })
                }
            };
            self.handles.push(handle);
        }
    }

    /// Abort every task
    pub fn shutdown(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        info!("[Scheduler] Stopped");
    }

    pub fn producers(&self) -> &[Arc<ProducerRunner>] {
        &self.producers
    }
}
