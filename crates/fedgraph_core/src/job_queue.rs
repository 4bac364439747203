/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Durable background job queue.
//!
//! Rows live in `event_queue` next to the triple store. A worker claims one due
//! row at a time by writing a lease (`claimed_until_ms`, `claim_token`) inside a
//! `BEGIN IMMEDIATE` transaction; a worker that finds the write lock taken treats
//! it as "nothing to claim" instead of waiting. Expired leases make a crashed
//! worker's job claimable again.

use crate::config::QueueConfig;
use crate::error::JobError;
use crate::notify::NotifyHub;
use crate::object::now_ms;
use crate::store::{ChangeSet, EntityStore, JobClaim, NewJob, StagingStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use fedgraph_protocol::CHANNEL_BACKGROUND_JOB;
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cap on the pause after a failed claim or poll.
const ERROR_PAUSE_MAX_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub added_at_ms: i64,
    pub attempt_count: u32,
    pub action: String,
    pub payload: String,
    claim_token: String,
}

impl Job {
    /// The lease this execution holds on the row.
    pub fn lease(&self) -> JobClaim {
        JobClaim {
            id: self.id.clone(),
            claim_token: self.claim_token.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub leased: u64,
}

/// Runs one job's action inside a transaction provided by the implementor.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Fresh transaction for one job execution.
    fn begin(&self) -> StagingStore;

    async fn execute(&self, store: &StagingStore, job: &Job) -> Result<(), JobError>;
}

#[derive(Clone)]
pub struct JobQueue {
    db_path: PathBuf,
    notify: Arc<Notify>,
    settings: QueueConfig,
}

impl JobQueue {
    pub fn open(db_path: impl AsRef<Path>, settings: QueueConfig) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path)
            .with_context(|| format!("open db: {}", db_path.display()))?;
        init_schema(&conn)?;
        Ok(Self {
            db_path,
            notify: Arc::new(Notify::new()),
            settings,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn settings(&self) -> &QueueConfig {
        &self.settings
    }

    /// Wakes this queue's worker whenever a job is committed through `hub`.
    pub fn attach(&self, hub: &NotifyHub) {
        let notify = self.notify.clone();
        hub.subscribe(CHANNEL_BACKGROUND_JOB, move |_| notify.notify_one());
    }

    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub fn start_worker(
        &self,
        shutdown: watch::Receiver<bool>,
        executor: Arc<dyn JobExecutor>,
    ) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move { queue.run_loop(shutdown, executor).await })
    }

    /// Claims and runs due jobs until `shutdown` flips. Storage errors are
    /// logged and retried after a pause; they never end the loop.
    pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>, executor: Arc<dyn JobExecutor>) {
        info!("job queue db: {}", self.db_path.display());
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.drain_due(&shutdown, executor.as_ref()).await {
                Ok(true) => break,
                Ok(false) => match self.next_wait().await {
                    Ok(wait) => {
                        failures = 0;
                        wait
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        warn!("job queue poll failed: {e:#}");
                        Some(next_backoff(failures, 1, ERROR_PAUSE_MAX_SECS))
                    }
                },
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!("job claim failed: {e:#}");
                    Some(next_backoff(failures, 1, ERROR_PAUSE_MAX_SECS))
                }
            };

            match wait {
                Some(d) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(d) => {}
                        res = shutdown.changed() => if res.is_err() { break },
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        res = shutdown.changed() => if res.is_err() { break },
                    }
                }
            }
        }
        info!("job worker stopped");
    }

    /// Runs jobs while one is due. `Ok(true)` means shutdown was requested.
    async fn drain_due(&self, shutdown: &watch::Receiver<bool>, executor: &dyn JobExecutor) -> Result<bool> {
        while let Some(job) = self.claim().await? {
            self.process(executor, job).await;
            if *shutdown.borrow() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// How long to sleep before the next row becomes due; `None` waits for a wake only.
    async fn next_wait(&self) -> Result<Option<Duration>> {
        let idle = self.settings.idle_poll_secs.map(Duration::from_secs);
        Ok(match self.next_due_ms().await? {
            Some(due) => {
                let d = Duration::from_millis((due - now_ms()).max(0) as u64);
                Some(idle.map_or(d, |i| i.min(d)))
            }
            None => idle,
        })
    }

    /// Executes every job that is due now, including jobs those jobs enqueue.
    /// Returns how many executions ran.
    pub async fn run_until_idle(&self, executor: &dyn JobExecutor) -> Result<usize> {
        let mut ran = 0usize;
        while let Some(job) = self.claim().await? {
            self.process(executor, job).await;
            ran += 1;
        }
        Ok(ran)
    }

    async fn process(&self, executor: &dyn JobExecutor, job: Job) {
        let store = executor.begin();
        let outcome = match executor.execute(&store, &job).await {
            Ok(()) => {
                let done = ChangeSet {
                    completed_jobs: vec![job.lease()],
                    ..ChangeSet::default()
                };
                let committed = async {
                    store.apply(done).await?;
                    store.commit_changes().await
                }
                .await;
                committed.map_err(JobError::from)
            }
            Err(e) => Err(e),
        };

        let res = match outcome {
            Ok(()) => {
                debug!(job = %job.id, action = %job.action, "job done");
                Ok(())
            }
            Err(JobError::Permanent(msg)) => {
                warn!(job = %job.id, action = %job.action, "job dropped: {msg}");
                self.drop_job(&job).await
            }
            Err(JobError::Retryable(msg)) => {
                let attempt_no = job.attempt_count.saturating_add(1);
                if attempt_no >= self.settings.max_attempts {
                    warn!(job = %job.id, action = %job.action, attempts = attempt_no, "job gave up: {msg}");
                    self.drop_job(&job).await
                } else {
                    let delay = next_backoff(
                        attempt_no,
                        self.settings.base_backoff_secs,
                        self.settings.max_backoff_secs,
                    );
                    info!(job = %job.id, action = %job.action, attempt = attempt_no, "job retry in {delay:?}: {msg}");
                    self.reschedule(&job, attempt_no, delay).await
                }
            }
        };
        if let Err(e) = res {
            warn!(job = %job.id, "job bookkeeping failed: {e:#}");
        }
    }

    /// Claims one due job, or `None` if nothing is due or another worker holds the lock.
    pub async fn claim(&self) -> Result<Option<Job>> {
        let lease_ms = (self.settings.claim_lease_secs as i64).saturating_mul(1000);
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Option<Job>> {
                let mut conn = Connection::open(db_path)?;
                conn.busy_timeout(Duration::from_millis(50))?;
                match try_claim(&mut conn, now_ms(), lease_ms) {
                    Err(e) if is_busy(&e) => Ok(None),
                    other => other.map_err(Into::into),
                }
            }
        })
        .await?
    }

    /// Earliest instant at which some row becomes claimable.
    pub async fn next_due_ms(&self) -> Result<Option<i64>> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Option<i64>> {
                let conn = Connection::open(db_path)?;
                conn.busy_timeout(Duration::from_secs(5))?;
                let due: Option<i64> = conn.query_row(
                    r#"
                    SELECT MIN(MAX(next_attempt_ms, COALESCE(claimed_until_ms, 0)))
                    FROM event_queue
                    "#,
                    [],
                    |r| r.get(0),
                )?;
                Ok(due)
            }
        })
        .await?
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<QueueStats> {
                let conn = Connection::open(db_path)?;
                let now = now_ms();
                let leased: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM event_queue WHERE claimed_until_ms > ?1",
                    params![now],
                    |r| r.get(0),
                )?;
                let total: u64 =
                    conn.query_row("SELECT COUNT(*) FROM event_queue", [], |r| r.get(0))?;
                Ok(QueueStats {
                    pending: total.saturating_sub(leased),
                    leased,
                })
            }
        })
        .await?
    }

    pub async fn get(&self, id: &str) -> Result<Option<(u32, i64)>> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            move || -> Result<Option<(u32, i64)>> {
                let conn = Connection::open(db_path)?;
                conn.query_row(
                    "SELECT attempt_count, next_attempt_ms FROM event_queue WHERE id=?1",
                    params![id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()
                .map_err(Into::into)
            }
        })
        .await?
    }

    async fn reschedule(&self, job: &Job, attempt_no: u32, delay: Duration) -> Result<()> {
        let next = now_ms() + delay.as_millis() as i64;
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = job.id.clone();
            let token = job.claim_token.clone();
            move || -> Result<()> {
                let conn = Connection::open(db_path)?;
                conn.busy_timeout(Duration::from_secs(5))?;
                conn.execute(
                    r#"
                    UPDATE event_queue
                    SET attempt_count=?1, next_attempt_ms=?2, claimed_until_ms=NULL, claim_token=NULL
                    WHERE id=?3 AND claim_token=?4
                    "#,
                    params![attempt_no, next, id, token],
                )?;
                Ok(())
            }
        })
        .await??;
        self.notify.notify_one();
        Ok(())
    }

    async fn drop_job(&self, job: &Job) -> Result<()> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let claim = job.lease();
            move || -> Result<()> {
                let conn = Connection::open(db_path)?;
                conn.busy_timeout(Duration::from_secs(5))?;
                if !delete_job(&conn, &claim)? {
                    debug!(job = %claim.id, "lease lost before drop");
                }
                Ok(())
            }
        })
        .await?
    }
}

fn try_claim(conn: &mut Connection, now: i64, lease_ms: i64) -> rusqlite::Result<Option<Job>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let row = tx
        .query_row(
            r#"
            SELECT id, added_at_ms, attempt_count, action, payload
            FROM event_queue
            WHERE next_attempt_ms <= ?1
              AND (claimed_until_ms IS NULL OR claimed_until_ms <= ?1)
            ORDER BY next_attempt_ms ASC
            LIMIT 1
            "#,
            params![now],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, u32>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;
    let Some((id, added_at_ms, attempt_count, action, payload)) = row else {
        return Ok(None);
    };
    let claim_token = new_job_id();
    tx.execute(
        "UPDATE event_queue SET claimed_until_ms=?1, claim_token=?2 WHERE id=?3",
        params![now + lease_ms, claim_token, id],
    )?;
    tx.commit()?;
    Ok(Some(Job {
        id,
        added_at_ms,
        attempt_count,
        action,
        payload,
        claim_token,
    }))
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == ErrorCode::DatabaseBusy || f.code == ErrorCode::DatabaseLocked
    )
}

pub(crate) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS event_queue (
          id TEXT PRIMARY KEY,
          added_at_ms INTEGER NOT NULL,
          next_attempt_ms INTEGER NOT NULL,
          attempt_count INTEGER NOT NULL,
          action TEXT NOT NULL,
          payload TEXT NOT NULL,
          claimed_until_ms INTEGER NULL,
          claim_token TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_event_queue_due ON event_queue(next_attempt_ms);
        "#,
    )?;
    Ok(())
}

/// Inserts a job row; used by the local store inside its commit transaction.
pub(crate) fn insert_job(conn: &Connection, job: &NewJob, now: i64) -> Result<String> {
    let id = new_job_id();
    conn.execute(
        r#"
        INSERT INTO event_queue (id, added_at_ms, next_attempt_ms, attempt_count, action, payload, claimed_until_ms, claim_token)
        VALUES (?1, ?2, ?3, 0, ?4, ?5, NULL, NULL)
        "#,
        params![id, now, now + job.delay_ms.max(0), job.action, job.payload],
    )?;
    Ok(id)
}

/// Deletes a row only while `claim` still holds its lease; a worker whose
/// lease expired and was re-claimed elsewhere deletes nothing.
pub(crate) fn delete_job(conn: &Connection, claim: &JobClaim) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM event_queue WHERE id=?1 AND claim_token=?2",
        params![claim.id, claim.claim_token],
    )?;
    Ok(n > 0)
}

fn new_job_id() -> String {
    // 16 random bytes -> 32 hex chars
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    hex::encode(b)
}

pub fn next_backoff(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let secs = base_secs.saturating_mul(1u64 << pow).min(max_secs);
    // jitter 0..1000ms
    let mut b = [0u8; 2];
    OsRng.fill_bytes(&mut b);
    let jitter_ms = u16::from_le_bytes(b) as u64 % 1000;
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}
