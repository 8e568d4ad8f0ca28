use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Executor, PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;

use crate::graph::validate_sources;
use crate::storage::traits::Storage;
use crate::types::{
    Activity, Agent, AgentId, AgentLogEntry, AgentMemory, Edge, EdgeKey, Event, EventDraft,
    EventId, FailureState, LogLevel, Schedule,
};

// Transaction-scoped advisory lock keys.
const EVENT_LOG_LOCK: i64 = 0x6d75_6e01;
const GRAPH_LOCK: i64 = 0x6d75_6e02;

const AGENT_COLUMNS: &str = r#"
    a.id, a.owner_id, a.kind, a.name, a.schedule, a.options, a.memory, a.disabled,
    a.consecutive_failures, a.keep_events_for_secs, a.created_at, a.last_checked_at,
    a.last_receive_at, a.last_event_at,
    ARRAY(
        SELECT s.producer_id FROM agent_sources s
        WHERE s.consumer_id = a.id
        ORDER BY s.created_at, s.producer_id
    ) AS sources
"#;

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        // Simple query protocol, so the file may hold several statements.
        self.pool
            .execute(include_str!("../../migrations/V001__initial_schema.sql"))
            .await?;
        Ok(())
    }

    async fn select_agents(&self, filter: &str) -> Result<Vec<Agent>> {
        let sql = format!(
            "SELECT {} FROM agents a {} ORDER BY a.created_at, a.id",
            AGENT_COLUMNS, filter
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_agent).collect()
    }
}

async fn lock(tx: &mut Transaction<'_, Postgres>, key: i64) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn sources_of(tx: &mut Transaction<'_, Postgres>) -> Result<HashMap<AgentId, Vec<AgentId>>> {
    let rows = sqlx::query(
        r#"
        SELECT a.id,
               ARRAY(SELECT s.producer_id FROM agent_sources s WHERE s.consumer_id = a.id) AS sources
        FROM agents a
        "#,
    )
    .fetch_all(&mut **tx)
    .await?;

    Ok(rows
        .iter()
        .map(|r| (r.get("id"), r.get("sources")))
        .collect())
}

async fn insert_edge(
    tx: &mut Transaction<'_, Postgres>,
    producer: AgentId,
    consumer: AgentId,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO agent_sources (producer_id, consumer_id, watermark, created_at)
        VALUES ($1, $2, (SELECT COALESCE(MAX(id), 0) FROM events WHERE agent_id = $1), NOW())
        "#,
    )
    .bind(producer)
    .bind(consumer)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn create_agent(&self, agent: &Agent) -> Result<()> {
        agent.validate()?;
        let mut tx = self.pool.begin().await?;
        lock(&mut tx, GRAPH_LOCK).await?;

        let mut known = sources_of(&mut tx).await?;
        if known.contains_key(&agent.id) {
            return Err(anyhow!("Agent {} already exists", agent.id));
        }
        validate_sources(agent.id, &agent.sources, &known)?;
        known.insert(agent.id, Vec::new());

        sqlx::query(
            r#"
            INSERT INTO agents (
                id, owner_id, kind, name, schedule, options, memory, disabled,
                consecutive_failures, keep_events_for_secs, created_at, last_checked_at,
                last_receive_at, last_event_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(agent.id)
        .bind(agent.owner_id)
        .bind(&agent.kind)
        .bind(&agent.name)
        .bind(agent.schedule.to_string())
        .bind(&agent.options)
        .bind(agent.memory.to_value())
        .bind(agent.disabled)
        .bind(agent.consecutive_failures as i32)
        .bind(agent.keep_events_for_secs as i64)
        .bind(agent.created_at)
        .bind(agent.last_checked_at)
        .bind(agent.last_receive_at)
        .bind(agent.last_event_at)
        .execute(&mut *tx)
        .await?;

        for &producer in &agent.sources {
            insert_edge(&mut tx, producer, agent.id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_agent(&self, id: AgentId) -> Result<Option<Agent>> {
        let sql = format!("SELECT {} FROM agents a WHERE a.id = $1", AGENT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(row_to_agent(&r)?)),
            None => Ok(None),
        }
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        self.select_agents("").await
    }

    async fn list_active_agents(&self) -> Result<Vec<Agent>> {
        self.select_agents("WHERE NOT a.disabled").await
    }

    async fn record_activity(&self, id: AgentId, activity: Activity) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE agents
            SET last_checked_at = COALESCE($2, last_checked_at),
                last_receive_at = COALESCE($3, last_receive_at),
                last_event_at = COALESCE($4, last_event_at)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(activity.checked_at)
        .bind(activity.received_at)
        .bind(activity.event_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_source(&self, consumer: AgentId, producer: AgentId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        lock(&mut tx, GRAPH_LOCK).await?;

        let known = sources_of(&mut tx).await?;
        let current = known
            .get(&consumer)
            .ok_or_else(|| anyhow!("Agent {} not found", consumer))?;
        if current.contains(&producer) {
            return Ok(());
        }
        validate_sources(consumer, &[producer], &known)?;

        insert_edge(&mut tx, producer, consumer).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_edges(&self) -> Result<Vec<Edge>> {
        let rows = sqlx::query(
            r#"
            SELECT producer_id, consumer_id, watermark
            FROM agent_sources
            ORDER BY consumer_id, created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| Edge {
                key: EdgeKey::new(r.get("producer_id"), r.get("consumer_id")),
                watermark: r.get("watermark"),
            })
            .collect())
    }

    async fn commit_watermark(&self, key: EdgeKey, event_id: EventId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE agent_sources
            SET watermark = $3
            WHERE producer_id = $1 AND consumer_id = $2
            "#,
        )
        .bind(key.producer)
        .bind(key.consumer)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_events(
        &self,
        agent_id: AgentId,
        drafts: Vec<EventDraft>,
        created_at: DateTime<Utc>,
        keep_for_secs: u64,
    ) -> Result<Vec<Event>> {
        let mut tx = self.pool.begin().await?;
        // Appends commit one at a time so a reader never sees id N+1 before N.
        lock(&mut tx, EVENT_LOG_LOCK).await?;

        let mut appended = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let pending = draft.into_event(0, agent_id, created_at, keep_for_secs);
            let row = sqlx::query(
                r#"
                INSERT INTO events (agent_id, payload, created_at, expires_at)
                VALUES ($1, $2, $3, $4)
                RETURNING id
                "#,
            )
            .bind(agent_id)
            .bind(&pending.payload)
            .bind(pending.created_at)
            .bind(pending.expires_at)
            .fetch_one(&mut *tx)
            .await?;

            appended.push(Event {
                id: row.get("id"),
                ..pending
            });
        }
        tx.commit().await?;
        Ok(appended)
    }

    async fn events_after(
        &self,
        producer: AgentId,
        after: EventId,
        ceiling: EventId,
    ) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT id, agent_id, payload, created_at, expires_at
            FROM events
            WHERE agent_id = $1 AND id > $2 AND id <= $3
            ORDER BY id
            "#,
        )
        .bind(producer)
        .bind(after)
        .bind(ceiling)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_event).collect())
    }

    async fn latest_event_id(&self) -> Result<EventId> {
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS id FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("id"))
    }

    async fn latest_event_id_for(&self, producer: AgentId) -> Result<EventId> {
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS id FROM events WHERE agent_id = $1")
            .bind(producer)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("id"))
    }

    async fn cleanup_expired_events(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM events e
            WHERE e.expires_at IS NOT NULL
              AND e.expires_at <= $1
              AND NOT EXISTS (
                  SELECT 1 FROM agent_sources s
                  WHERE s.producer_id = e.agent_id AND s.watermark < e.id
              )
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn load_memory(&self, id: AgentId) -> Result<AgentMemory> {
        let row = sqlx::query("SELECT memory FROM agents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow!("Agent {} not found", id))?;
        AgentMemory::from_value(row.get("memory"))
    }

    async fn commit_memory(&self, id: AgentId, memory: &AgentMemory) -> Result<()> {
        let result = sqlx::query("UPDATE agents SET memory = $2 WHERE id = $1")
            .bind(id)
            .bind(memory.to_value())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("Agent {} not found", id));
        }
        Ok(())
    }

    async fn load_failure_state(&self, id: AgentId) -> Result<FailureState> {
        let row = sqlx::query("SELECT consecutive_failures, disabled FROM agents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow!("Agent {} not found", id))?;
        Ok(FailureState {
            consecutive_failures: row.get::<i32, _>("consecutive_failures").max(0) as u32,
            disabled: row.get("disabled"),
        })
    }

    async fn commit_failure_state(&self, id: AgentId, state: FailureState) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE agents
            SET consecutive_failures = $2, disabled = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(state.consecutive_failures.min(i32::MAX as u32) as i32)
        .bind(state.disabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_log(&self, entry: &AgentLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_logs (id, agent_id, level, message, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.id)
        .bind(entry.agent_id)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_logs(&self, id: AgentId) -> Result<Vec<AgentLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, agent_id, level, message, created_at
            FROM agent_logs
            WHERE agent_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let level: String = r.get("level");
                AgentLogEntry {
                    id: r.get("id"),
                    agent_id: r.get("agent_id"),
                    level: LogLevel::parse(&level),
                    message: r.get("message"),
                    created_at: r.get("created_at"),
                }
            })
            .collect())
    }
}

fn row_to_agent(r: &PgRow) -> Result<Agent> {
    let schedule: String = r.get("schedule");
    let schedule: Schedule = schedule.parse()?;

    Ok(Agent {
        id: r.get("id"),
        owner_id: r.get("owner_id"),
        kind: r.get("kind"),
        name: r.get("name"),
        schedule,
        options: r.get("options"),
        memory: AgentMemory::from_value(r.get("memory"))?,
        sources: r.get("sources"),
        disabled: r.get("disabled"),
        consecutive_failures: r.get::<i32, _>("consecutive_failures").max(0) as u32,
        keep_events_for_secs: r.get::<i64, _>("keep_events_for_secs").max(0) as u64,
        created_at: r.get("created_at"),
        last_checked_at: r.get("last_checked_at"),
        last_receive_at: r.get("last_receive_at"),
        last_event_at: r.get("last_event_at"),
    })
}

fn row_to_event(r: &PgRow) -> Event {
    Event {
        id: r.get("id"),
        agent_id: r.get("agent_id"),
        payload: r.get("payload"),
        created_at: r.get("created_at"),
        expires_at: r.get("expires_at"),
    }
}
