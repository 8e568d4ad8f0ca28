//! Periodic driver: each tick invokes `check` on every due agent, then runs
//! one propagation pass over whatever the checks emitted.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::engine::dispatch::{DispatchConfig, Dispatcher, InvocationReport, Job};
use crate::engine::invocable;
use crate::engine::propagation::{PassReport, Propagator};
use crate::lifecycle::failure::FailureTracker;
use crate::lifecycle::health::HealthPolicy;
use crate::notify::NotificationQueue;
use crate::registry::{AgentRegistry, KindFilter};
use crate::storage::traits::Storage;
use crate::types::{Agent, AgentId, TickWindow};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Offset applied to time-of-day schedules such as `5am`.
    pub utc_offset_secs: i64,
    /// `None` disables periodic cleanup of expired events.
    pub cleanup_interval: Option<Duration>,
    pub failure_threshold: u32,
    pub dispatch: DispatchConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            utc_offset_secs: 0,
            cleanup_interval: Some(Duration::from_secs(6 * 60 * 60)),
            failure_threshold: 5,
            dispatch: DispatchConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub window: TickWindow,
    pub checks: Vec<InvocationReport>,
    pub propagation: PassReport,
}

impl TickReport {
    pub fn failures(&self) -> usize {
        self.checks
            .iter()
            .chain(self.propagation.deliveries.iter())
            .filter(|r| r.failed())
            .count()
    }
}

pub struct Scheduler {
    storage: Arc<dyn Storage>,
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<Dispatcher>,
    propagator: Propagator,
    filter: KindFilter,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<AgentRegistry>,
        notifications: Option<NotificationQueue>,
        filter: KindFilter,
        config: SchedulerConfig,
    ) -> Self {
        let failures = FailureTracker::new(storage.clone(), config.failure_threshold, notifications);
        let dispatcher = Arc::new(Dispatcher::new(
            storage.clone(),
            registry.clone(),
            failures,
            config.dispatch.clone(),
        ));
        let propagator = Propagator::new(
            storage.clone(),
            registry.clone(),
            dispatcher.clone(),
            filter.clone(),
        );
        Self {
            storage,
            registry,
            dispatcher,
            propagator,
            filter,
            config,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub async fn enable_agent(&self, agent_id: AgentId) -> Result<()> {
        self.dispatcher.enable_agent(agent_id).await
    }

    /// Derived health of one agent, `None` if it does not exist. Agents of
    /// an unknown kind never count as working.
    pub async fn working(&self, agent_id: AgentId, now: DateTime<Utc>) -> Result<Option<bool>> {
        let Some(agent) = self.storage.get_agent(agent_id).await? else {
            return Ok(None);
        };
        let policy = HealthPolicy {
            failure_threshold: self.config.failure_threshold,
        };
        let working = match self.registry.build(&agent.kind) {
            Ok(capability) => capability.working(&agent, &policy, now),
            Err(_) => false,
        };
        Ok(Some(working))
    }

    /// Agents whose schedule has a boundary inside `window` and that this
    /// process is allowed to check.
    pub async fn due_agents(&self, window: &TickWindow) -> Result<Vec<Agent>> {
        let due = self
            .storage
            .list_due_agents(window, self.config.utc_offset_secs)
            .await?;
        Ok(due
            .into_iter()
            .filter(|agent| {
                matches!(
                    invocable(&self.registry, &self.filter, agent),
                    Some(capability) if capability.can_be_scheduled()
                )
            })
            .collect())
    }

    pub async fn tick(&self, window: TickWindow) -> Result<TickReport> {
        let due = self.due_agents(&window).await?;
        let jobs = due.into_iter().map(|agent| Job::Check { agent }).collect();
        let checks = self.dispatcher.run_all(jobs, window.end).await;
        let propagation = self.propagator.run_pass(window.end).await?;
        Ok(TickReport {
            window,
            checks,
            propagation,
        })
    }

    /// One propagation pass without running any checks.
    pub async fn propagate(&self, now: DateTime<Utc>) -> Result<PassReport> {
        self.propagator.run_pass(now).await
    }

    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<u64> {
        let removed = self.storage.cleanup_expired_events(now).await?;
        if removed > 0 {
            log::info!("Removed {} expired events", removed);
        }
        Ok(removed)
    }

    /// Ticks until `shutdown` resolves. A tick in flight is finished first.
    /// Errors inside a tick are logged and the loop keeps going.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let period = self.config.tick_interval;
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cleanup = self.config.cleanup_interval.map(|every| {
            let mut cleanup = interval(every);
            cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);
            cleanup
        });
        let mut last_end: Option<DateTime<Utc>> = None;

        log::info!("Scheduler started, ticking every {:?}", period);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, scheduler stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let window = match last_end {
                        Some(start) => TickWindow::new(start, now),
                        None => TickWindow::ending_at(now, period),
                    };
                    last_end = Some(now);

                    match self.tick(window).await {
                        Ok(report) => log::info!(
                            "Tick done: {} checks, {} deliveries, {} failures",
                            report.checks.len(),
                            report.propagation.deliveries.len(),
                            report.failures()
                        ),
                        Err(e) => log::error!("Tick failed: {:#}", e),
                    }
                }
                _ = next_cleanup(&mut cleanup) => {
                    if let Err(e) = self.cleanup(Utc::now()).await {
                        log::error!("Event cleanup failed: {:#}", e);
                    }
                }
            }
        }
    }
}

async fn next_cleanup(cleanup: &mut Option<Interval>) {
    match cleanup {
        Some(every) => {
            every.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
