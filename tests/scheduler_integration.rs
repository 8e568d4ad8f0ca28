//! End-to-end behaviour of the tick driver and propagator against the
//! in-memory store:
//! - failure counting, disabling and re-enabling
//! - consumer batching, ceilings and redelivery after failure
//! - timeouts and panics inside capabilities
//! - kind filters, health and expired-event cleanup
//! - parallel checks, the concurrency cap and per-agent serialization

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use muninn::capabilities::{AgentContext, Capability};
use muninn::engine::{DispatchConfig, InvocationStatus, Job, Scheduler, SchedulerConfig};
use muninn::registry::{AgentRegistry, KindFilter};
use muninn::storage::memory::InMemoryStore;
use muninn::storage::traits::Storage;
use muninn::types::{Agent, Event, EventDraft, EventId, LogLevel, OwnerId, Schedule, TickWindow};

type Batches = Arc<Mutex<Vec<Vec<EventId>>>>;

/// Records every batch it receives.
struct MockRecorder {
    batches: Batches,
}

#[async_trait::async_trait]
impl Capability for MockRecorder {
    fn kind(&self) -> &str {
        "recorder"
    }

    fn can_create_events(&self) -> bool {
        false
    }

    async fn receive(&self, ctx: &mut AgentContext, events: &[Event]) -> Result<()> {
        self.batches
            .lock()
            .unwrap()
            .push(events.iter().map(|e| e.id).collect());
        ctx.memory_mut().set("seen", events.len())?;
        Ok(())
    }
}

/// Re-emits every event it receives.
struct MockEcho;

#[async_trait::async_trait]
impl Capability for MockEcho {
    fn kind(&self) -> &str {
        "echo"
    }

    async fn receive(&self, ctx: &mut AgentContext, events: &[Event]) -> Result<()> {
        for event in events {
            ctx.create_event(json!({ "echo": event.id }))?;
        }
        Ok(())
    }
}

/// Fails the first `failures_left` receives after scribbling on memory and
/// emitting, then records batches like [`MockRecorder`].
struct MockFlaky {
    failures_left: Arc<AtomicUsize>,
    batches: Batches,
}

#[async_trait::async_trait]
impl Capability for MockFlaky {
    fn kind(&self) -> &str {
        "flaky"
    }

    async fn receive(&self, ctx: &mut AgentContext, events: &[Event]) -> Result<()> {
        ctx.memory_mut().push("attempts", json!(events.len()))?;
        ctx.create_event(json!({ "half": "done" }))?;
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            bail!("upstream service unavailable");
        }
        self.batches
            .lock()
            .unwrap()
            .push(events.iter().map(|e| e.id).collect());
        Ok(())
    }
}

/// Check always fails.
struct MockBroken {
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Capability for MockBroken {
    fn kind(&self) -> &str {
        "broken"
    }

    async fn check(&self, _ctx: &mut AgentContext) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        bail!("credentials rejected")
    }
}

/// Check outlives any reasonable timeout.
struct MockSlow;

#[async_trait::async_trait]
impl Capability for MockSlow {
    fn kind(&self) -> &str {
        "slow"
    }

    async fn check(&self, ctx: &mut AgentContext) -> Result<()> {
        ctx.memory_mut().set("started", true)?;
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        ctx.create_event(json!({ "late": true }))
    }
}

struct MockPanicky;

#[async_trait::async_trait]
impl Capability for MockPanicky {
    fn kind(&self) -> &str {
        "panicky"
    }

    async fn check(&self, _ctx: &mut AgentContext) -> Result<()> {
        panic!("index out of bounds");
    }
}

/// Check sleeps for `nap`, tracking how many checks overlap.
struct MockSleeper {
    nap: std::time::Duration,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Capability for MockSleeper {
    fn kind(&self) -> &str {
        "sleeper"
    }

    async fn check(&self, _ctx: &mut AgentContext) -> Result<()> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.nap).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

fn sleeper_registry(nap_ms: u64, peak: &Arc<AtomicUsize>) -> AgentRegistry {
    let mut registry = AgentRegistry::with_builtins();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = peak.clone();
    registry
        .register("sleeper", move || {
            Arc::new(MockSleeper {
                nap: std::time::Duration::from_millis(nap_ms),
                in_flight: in_flight.clone(),
                peak: peak.clone(),
            })
        })
        .unwrap();
    registry
}

fn concurrency(max_concurrency: usize) -> SchedulerConfig {
    SchedulerConfig {
        dispatch: DispatchConfig {
            max_concurrency,
            invocation_timeout: std::time::Duration::from_secs(5),
        },
        ..SchedulerConfig::default()
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    scheduler: Scheduler,
    owner: OwnerId,
}

impl Harness {
    fn new(registry: AgentRegistry, filter: KindFilter) -> Self {
        Self::with_config(registry, filter, config(5, 2_000))
    }

    fn with_config(registry: AgentRegistry, filter: KindFilter, config: SchedulerConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = Scheduler::new(store.clone(), Arc::new(registry), None, filter, config);
        Self {
            store,
            scheduler,
            owner: OwnerId::new_v4(),
        }
    }

    async fn agent(&self, kind: &str, schedule: Schedule, sources: Vec<&Agent>) -> Agent {
        let options = match kind {
            "emitter" => json!({ "payload": { "value": 1 } }),
            "digest" => json!({ "expected_receive_period_in_days": "2" }),
            _ => json!({}),
        };
        let agent = Agent::new(self.owner, kind, format!("{} agent", kind), schedule, options)
            .with_sources(sources.iter().map(|a| a.id).collect());
        self.store.create_agent(&agent).await.unwrap();
        agent
    }

    async fn emit(&self, producer: &Agent, n: usize) -> Vec<EventId> {
        let drafts = (0..n).map(|i| EventDraft::new(json!({ "n": i }))).collect();
        self.store
            .append_events(producer.id, drafts, t0(), 0)
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect()
    }

    async fn reload(&self, agent: &Agent) -> Agent {
        self.store.get_agent(agent.id).await.unwrap().unwrap()
    }
}

fn config(threshold: u32, timeout_ms: u64) -> SchedulerConfig {
    SchedulerConfig {
        failure_threshold: threshold,
        dispatch: DispatchConfig {
            max_concurrency: 4,
            invocation_timeout: std::time::Duration::from_millis(timeout_ms),
        },
        ..SchedulerConfig::default()
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()
}

/// The one-minute window ending `minute` minutes after midnight.
fn minute(minute: i64) -> TickWindow {
    TickWindow::new(
        t0() + Duration::minutes(minute - 1),
        t0() + Duration::minutes(minute),
    )
}

fn recorder_registry(batches: &Batches) -> AgentRegistry {
    let mut registry = AgentRegistry::with_builtins();
    let batches = batches.clone();
    registry
        .register("recorder", move || {
            Arc::new(MockRecorder {
                batches: batches.clone(),
            })
        })
        .unwrap();
    registry.register("echo", || Arc::new(MockEcho)).unwrap();
    registry
}

#[tokio::test]
async fn test_failures_disable_agent_at_threshold() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = AgentRegistry::with_builtins();
    {
        let calls = calls.clone();
        registry
            .register("broken", move || Arc::new(MockBroken { calls: calls.clone() }))
            .unwrap();
    }
    let h = Harness::with_config(registry, KindFilter::All, config(3, 2_000));
    let broken = h.agent("broken", Schedule::every_minutes(1), vec![]).await;

    for m in 1..=3 {
        let report = h.scheduler.tick(minute(m)).await.unwrap();
        assert_eq!(report.failures(), 1);
    }
    let after = h.reload(&broken).await;
    assert!(after.disabled);
    assert_eq!(after.consecutive_failures, 3);
    assert_eq!(after.last_checked_at, Some(minute(3).end));

    let report = h.scheduler.tick(minute(4)).await.unwrap();
    assert!(report.checks.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let logs = h.store.get_logs(broken.id).await.unwrap();
    assert_eq!(logs.iter().filter(|l| l.level == LogLevel::Error).count(), 3);
    assert!(logs[0].message.contains("disabled after 3 consecutive failures"));

    h.scheduler.enable_agent(broken.id).await.unwrap();
    let report = h.scheduler.tick(minute(5)).await.unwrap();
    assert_eq!(report.checks.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(h.reload(&broken).await.consecutive_failures, 1);
}

#[tokio::test]
async fn test_consumer_receives_pending_events_as_one_batch() {
    let batches = Batches::default();
    let h = Harness::new(recorder_registry(&batches), KindFilter::All);
    let producer = h.agent("emitter", Schedule::Never, vec![]).await;
    let consumer = h.agent("recorder", Schedule::Never, vec![&producer]).await;

    let first = h.emit(&producer, 3).await;
    h.scheduler.propagate(t0()).await.unwrap();
    let second = h.emit(&producer, 1).await;
    h.scheduler.propagate(t0()).await.unwrap();
    h.scheduler.propagate(t0()).await.unwrap();

    assert_eq!(*batches.lock().unwrap(), vec![first, second]);
    let consumer = h.reload(&consumer).await;
    assert_eq!(consumer.last_receive_at, Some(t0()));
    assert_eq!(consumer.memory.get("seen"), Some(&json!(1)));
}

#[tokio::test]
async fn test_repeated_source_never_delivers_an_event_twice() {
    let batches = Batches::default();
    let h = Harness::new(recorder_registry(&batches), KindFilter::All);
    let producer = h.agent("emitter", Schedule::Never, vec![]).await;

    let doubled = Agent::new(h.owner, "recorder", "doubled", Schedule::Never, json!({}))
        .with_sources(vec![producer.id, producer.id]);
    assert!(h.store.create_agent(&doubled).await.is_err());

    let consumer = h.agent("recorder", Schedule::Never, vec![&producer]).await;
    h.store.add_source(consumer.id, producer.id).await.unwrap();
    let ids = h.emit(&producer, 2).await;
    h.scheduler.propagate(t0()).await.unwrap();

    assert_eq!(*batches.lock().unwrap(), vec![ids]);
}

#[tokio::test]
async fn test_batch_merges_sources_in_event_order() {
    let batches = Batches::default();
    let h = Harness::new(recorder_registry(&batches), KindFilter::All);
    let left = h.agent("emitter", Schedule::Never, vec![]).await;
    let right = h.agent("emitter", Schedule::Never, vec![]).await;
    h.agent("recorder", Schedule::Never, vec![&left, &right]).await;

    h.emit(&left, 1).await;
    h.emit(&right, 2).await;
    h.emit(&left, 1).await;
    let report = h.scheduler.propagate(t0()).await.unwrap();

    assert_eq!(report.deliveries.len(), 1);
    assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2, 3, 4]]);
    let edges = h.store.list_edges().await.unwrap();
    let left_mark = edges.iter().find(|e| e.key.producer == left.id).unwrap();
    let right_mark = edges.iter().find(|e| e.key.producer == right.id).unwrap();
    assert_eq!(left_mark.watermark, 4);
    assert_eq!(right_mark.watermark, 3);
}

#[tokio::test]
async fn test_events_emitted_during_a_pass_wait_for_the_next() {
    let batches = Batches::default();
    let h = Harness::new(recorder_registry(&batches), KindFilter::All);
    let head = h.agent("emitter", Schedule::Never, vec![]).await;
    let echo = h.agent("echo", Schedule::Never, vec![&head]).await;
    h.agent("recorder", Schedule::Never, vec![&echo]).await;

    h.emit(&head, 1).await;
    let first = h.scheduler.propagate(t0()).await.unwrap();
    assert_eq!(first.ceiling, 1);
    assert_eq!(first.deliveries.len(), 1);
    assert!(batches.lock().unwrap().is_empty());

    let second = h.scheduler.propagate(t0()).await.unwrap();
    assert_eq!(second.ceiling, 2);
    assert_eq!(*batches.lock().unwrap(), vec![vec![2]]);
    assert_eq!(h.reload(&echo).await.last_event_at, Some(t0()));
}

#[tokio::test]
async fn test_failed_receive_is_retried_without_side_effects() {
    let batches = Batches::default();
    let failures_left = Arc::new(AtomicUsize::new(1));
    let mut registry = AgentRegistry::with_builtins();
    {
        let batches = batches.clone();
        let failures_left = failures_left.clone();
        registry
            .register("flaky", move || {
                Arc::new(MockFlaky {
                    failures_left: failures_left.clone(),
                    batches: batches.clone(),
                })
            })
            .unwrap();
    }
    let h = Harness::new(registry, KindFilter::All);
    let producer = h.agent("emitter", Schedule::Never, vec![]).await;
    let flaky = h.agent("flaky", Schedule::Never, vec![&producer]).await;
    let sent = h.emit(&producer, 2).await;

    let failed = h.scheduler.propagate(t0()).await.unwrap();
    assert!(matches!(
        failed.deliveries[0].status,
        InvocationStatus::Failed { disabled: false, .. }
    ));
    assert_eq!(h.store.list_edges().await.unwrap()[0].watermark, 0);
    assert!(h.reload(&flaky).await.memory.is_empty());
    assert_eq!(h.store.latest_event_id().await.unwrap(), 2);

    h.scheduler.propagate(t0()).await.unwrap();
    assert_eq!(*batches.lock().unwrap(), vec![sent.clone()]);
    let flaky = h.reload(&flaky).await;
    assert_eq!(flaky.consecutive_failures, 0);
    assert_eq!(flaky.memory.len_of("attempts"), 1);
    assert_eq!(h.store.list_edges().await.unwrap()[0].watermark, 2);

    let idle = h.scheduler.propagate(t0()).await.unwrap();
    assert!(idle.deliveries.is_empty());
    assert_eq!(batches.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_emitter_feeds_digest_across_ticks() {
    let h = Harness::new(AgentRegistry::with_builtins(), KindFilter::All);
    let emitter = h.agent("emitter", Schedule::every_minutes(1), vec![]).await;
    let digest = h.agent("digest", Schedule::Daily { hour: 5 }, vec![&emitter]).await;

    for m in 1..=3 {
        let report = h.scheduler.tick(minute(m)).await.unwrap();
        assert_eq!(report.checks.len(), 1);
        assert_eq!(report.propagation.delivered(), 1);
    }

    let memory = h.store.load_memory(digest.id).await.unwrap();
    assert_eq!(memory.len_of("queue"), 3);
    assert_eq!(memory.get("queue").unwrap()[0], json!({ "value": 1 }));
    assert_eq!(memory.get("events"), Some(&json!([1, 2, 3])));
    assert_eq!(h.reload(&emitter).await.last_checked_at, Some(minute(3).end));
}

#[tokio::test]
async fn test_digest_health_follows_receive_period() {
    let h = Harness::new(AgentRegistry::with_builtins(), KindFilter::All);
    let emitter = h.agent("emitter", Schedule::Never, vec![]).await;
    let digest = h.agent("digest", Schedule::Never, vec![&emitter]).await;

    assert_eq!(h.scheduler.working(digest.id, t0()).await.unwrap(), Some(false));

    h.emit(&emitter, 1).await;
    h.scheduler.propagate(t0()).await.unwrap();
    assert_eq!(h.scheduler.working(digest.id, t0()).await.unwrap(), Some(true));
    assert_eq!(
        h.scheduler
            .working(digest.id, t0() + Duration::days(2))
            .await
            .unwrap(),
        Some(false)
    );
    assert_eq!(
        h.scheduler.working(muninn::AgentId::new_v4(), t0()).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn test_timeout_counts_as_failure_and_discards_work() {
    let mut registry = AgentRegistry::with_builtins();
    registry.register("slow", || Arc::new(MockSlow)).unwrap();
    let h = Harness::with_config(registry, KindFilter::All, config(5, 50));
    let slow = h.agent("slow", Schedule::every_minutes(1), vec![]).await;

    let report = h.scheduler.tick(minute(1)).await.unwrap();

    match &report.checks[0].status {
        InvocationStatus::Failed { error, disabled } => {
            assert!(error.contains("timed out"));
            assert!(!disabled);
        }
        other => panic!("expected a failure, got {:?}", other),
    }
    let slow = h.reload(&slow).await;
    assert_eq!(slow.consecutive_failures, 1);
    assert!(slow.memory.is_empty());
    assert_eq!(h.store.latest_event_id().await.unwrap(), 0);
}

#[tokio::test]
async fn test_panicking_agent_does_not_affect_others() {
    let mut registry = AgentRegistry::with_builtins();
    registry.register("panicky", || Arc::new(MockPanicky)).unwrap();
    let h = Harness::new(registry, KindFilter::All);
    let panicky = h.agent("panicky", Schedule::every_minutes(1), vec![]).await;
    let emitter = h.agent("emitter", Schedule::every_minutes(1), vec![]).await;

    let report = h.scheduler.tick(minute(1)).await.unwrap();

    assert_eq!(report.checks.len(), 2);
    assert_eq!(report.failures(), 1);
    let failed = report.checks.iter().find(|r| r.failed()).unwrap();
    assert_eq!(failed.agent_id, panicky.id);
    assert!(matches!(
        &failed.status,
        InvocationStatus::Failed { error, .. } if error.contains("index out of bounds")
    ));
    assert_eq!(h.store.latest_event_id_for(emitter.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_kind_filter_partitions_work() {
    let batches = Batches::default();
    let emitters_only = Harness::new(recorder_registry(&batches), KindFilter::only(["emitter"]));
    let emitter = emitters_only.agent("emitter", Schedule::every_minutes(1), vec![]).await;
    emitters_only.agent("recorder", Schedule::Never, vec![&emitter]).await;

    let report = emitters_only.scheduler.tick(minute(1)).await.unwrap();
    assert_eq!(report.checks.len(), 1);
    assert!(report.propagation.deliveries.is_empty());
    assert_eq!(emitters_only.store.list_edges().await.unwrap()[0].watermark, 0);

    // A second process over the same store handles the rest.
    let recorders = Scheduler::new(
        emitters_only.store.clone(),
        Arc::new(recorder_registry(&batches)),
        None,
        KindFilter::except(["emitter"]),
        config(5, 2_000),
    );
    let report = recorders.tick(minute(2)).await.unwrap();
    assert!(report.checks.is_empty());
    assert_eq!(report.propagation.delivered(), 1);
    assert_eq!(*batches.lock().unwrap(), vec![vec![1]]);
}

#[tokio::test]
async fn test_invalid_options_skip_without_counting_failures() {
    let h = Harness::new(AgentRegistry::with_builtins(), KindFilter::All);
    let misconfigured = Agent::new(
        h.owner,
        "emitter",
        "no payload",
        Schedule::every_minutes(1),
        json!({ "payload": "not an object" }),
    );
    h.store.create_agent(&misconfigured).await.unwrap();

    let report = h.scheduler.tick(minute(1)).await.unwrap();

    assert!(report.checks.is_empty());
    let after = h.reload(&misconfigured).await;
    assert_eq!(after.consecutive_failures, 0);
    assert_eq!(after.last_checked_at, None);
}

#[tokio::test]
async fn test_cleanup_keeps_unread_events() {
    let batches = Batches::default();
    let h = Harness::new(recorder_registry(&batches), KindFilter::All);
    let emitter = Agent::new(
        h.owner,
        "emitter",
        "short lived",
        Schedule::every_minutes(1),
        json!({ "payload": { "message": "ping" } }),
    )
    .with_keep_events_for(60);
    h.store.create_agent(&emitter).await.unwrap();
    h.agent("recorder", Schedule::Never, vec![&emitter]).await;

    // Emit without propagating, so the event is expired but unread.
    let checks = h.scheduler.due_agents(&minute(1)).await.unwrap();
    assert_eq!(checks.len(), 1);
    h.scheduler
        .dispatcher()
        .run_all(
            vec![muninn::engine::Job::Check { agent: checks[0].clone() }],
            minute(1).end,
        )
        .await;
    let later = minute(1).end + Duration::minutes(5);
    assert_eq!(h.scheduler.cleanup(later).await.unwrap(), 0);

    h.scheduler.propagate(later).await.unwrap();
    assert_eq!(h.scheduler.cleanup(later).await.unwrap(), 1);
    assert!(h.store.all_events().unwrap().is_empty());
}

#[tokio::test]
async fn test_checks_in_one_tick_run_in_parallel() {
    let peak = Arc::new(AtomicUsize::new(0));
    let h = Harness::with_config(sleeper_registry(200, &peak), KindFilter::All, concurrency(4));
    for _ in 0..4 {
        h.agent("sleeper", Schedule::every_minutes(1), vec![]).await;
    }

    let started = std::time::Instant::now();
    let report = h.scheduler.tick(minute(1)).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.checks.len(), 4);
    assert!(report.checks.iter().all(|r| r.succeeded()));
    // Run one after another, four naps would take 800ms.
    assert!(elapsed < std::time::Duration::from_millis(600), "tick took {:?}", elapsed);
    assert_eq!(peak.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_max_concurrency_caps_running_checks() {
    let peak = Arc::new(AtomicUsize::new(0));
    let h = Harness::with_config(sleeper_registry(50, &peak), KindFilter::All, concurrency(2));
    for _ in 0..5 {
        h.agent("sleeper", Schedule::every_minutes(1), vec![]).await;
    }

    let report = h.scheduler.tick(minute(1)).await.unwrap();

    assert_eq!(report.checks.len(), 5);
    assert!(report.checks.iter().all(|r| r.succeeded()));
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_jobs_for_the_same_agent_never_overlap() {
    let peak = Arc::new(AtomicUsize::new(0));
    let h = Harness::with_config(sleeper_registry(50, &peak), KindFilter::All, concurrency(4));
    let sleeper = h.agent("sleeper", Schedule::every_minutes(1), vec![]).await;

    let jobs = vec![
        Job::Check {
            agent: sleeper.clone(),
        },
        Job::Check {
            agent: sleeper.clone(),
        },
    ];
    let reports = h.scheduler.dispatcher().run_all(jobs, t0()).await;

    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.succeeded()));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}
