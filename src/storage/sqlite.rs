use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::job::{JobData, JobId, JobStatus};
use crate::queue::DequeueOptions;
use crate::retry::Attempts;
use crate::storage::{Result, Storage, StorageError};

/// SQLite-backed job storage
///
/// A single `jobs` table holds every queue; the `seq` rowid provides
/// the stable creation-order tie-break for equal priorities. Upserts
/// keep the original `seq`, so a retried job does not lose its place.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        let storage = Self { pool };
        storage.configure().await?;
        storage.migrate().await?;
        Ok(storage)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn configure(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await?;

        sqlx::query("PRAGMA busy_timeout=5000;")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                queue TEXT NOT NULL,
                name TEXT NOT NULL,
                params TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                delay TEXT,
                timeout_ms INTEGER,
                attempts_count INTEGER,
                attempts_remaining INTEGER,
                attempts_delay_ms INTEGER,
                attempts_strategy TEXT,
                enqueued TEXT,
                dequeued TEXT,
                ended TEXT,
                result TEXT,
                error TEXT,
                stack TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Covers the claim query: status first since status = 'queued'
        // is the most selective predicate
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON jobs(status, queue, priority, seq, delay)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_job(&self, row: sqlx::sqlite::SqliteRow) -> Result<JobData> {
        let id: String = row.get("id");
        let queue: String = row.get("queue");
        let name: String = row.get("name");
        let params_str: String = row.get("params");
        let status_str: String = row.get("status");
        let priority: i64 = row.get("priority");
        let delay_str: Option<String> = row.get("delay");
        let timeout_ms: Option<i64> = row.get("timeout_ms");
        let attempts_count: Option<i64> = row.get("attempts_count");
        let attempts_remaining: Option<i64> = row.get("attempts_remaining");
        let attempts_delay_ms: Option<i64> = row.get("attempts_delay_ms");
        let attempts_strategy: Option<String> = row.get("attempts_strategy");
        let enqueued_str: Option<String> = row.get("enqueued");
        let dequeued_str: Option<String> = row.get("dequeued");
        let ended_str: Option<String> = row.get("ended");
        let result_str: Option<String> = row.get("result");
        let error: Option<String> = row.get("error");
        let stack: Option<String> = row.get("stack");

        let params: Value = serde_json::from_str(&params_str)?;
        let result = result_str
            .map(|s| serde_json::from_str(&s))
            .transpose()?;

        let attempts = attempts_count.map(|count| Attempts {
            count: count as u32,
            remaining: attempts_remaining.unwrap_or(count) as u32,
            delay: attempts_delay_ms.map(|d| d as u64),
            strategy: attempts_strategy,
        });

        Ok(JobData {
            id: Some(JobId(id)),
            queue,
            name,
            params,
            status: JobStatus::from_db(&status_str),
            priority,
            delay: parse_timestamp(delay_str),
            timeout: timeout_ms.map(|t| t as u64),
            attempts,
            enqueued: parse_timestamp(enqueued_str),
            dequeued: parse_timestamp(dequeued_str),
            ended: parse_timestamp(ended_str),
            result,
            error,
            stack,
        })
    }
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn format_timestamp(value: &Option<DateTime<Utc>>) -> Option<String> {
    value.map(|dt| dt.to_rfc3339())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn upsert(&self, job: &JobData) -> Result<()> {
        let id = job.id.as_ref().ok_or(StorageError::MissingId)?;
        let params = serde_json::to_string(&job.params)?;
        let result = job
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue, name, params, status, priority, delay, timeout_ms,
                attempts_count, attempts_remaining, attempts_delay_ms, attempts_strategy,
                enqueued, dequeued, ended, result, error, stack
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                queue = excluded.queue,
                name = excluded.name,
                params = excluded.params,
                status = excluded.status,
                priority = excluded.priority,
                delay = excluded.delay,
                timeout_ms = excluded.timeout_ms,
                attempts_count = excluded.attempts_count,
                attempts_remaining = excluded.attempts_remaining,
                attempts_delay_ms = excluded.attempts_delay_ms,
                attempts_strategy = excluded.attempts_strategy,
                enqueued = excluded.enqueued,
                dequeued = excluded.dequeued,
                ended = excluded.ended,
                result = excluded.result,
                error = excluded.error,
                stack = excluded.stack
            "#,
        )
        .bind(&id.0)
        .bind(&job.queue)
        .bind(&job.name)
        .bind(params)
        .bind(job.status.as_str())
        .bind(job.priority)
        .bind(format_timestamp(&job.delay))
        .bind(job.timeout.map(|t| t as i64))
        .bind(job.attempts.as_ref().map(|a| a.count as i64))
        .bind(job.attempts.as_ref().map(|a| a.remaining as i64))
        .bind(job.attempts.as_ref().and_then(|a| a.delay).map(|d| d as i64))
        .bind(job.attempts.as_ref().and_then(|a| a.strategy.clone()))
        .bind(format_timestamp(&job.enqueued))
        .bind(format_timestamp(&job.dequeued))
        .bind(format_timestamp(&job.ended))
        .bind(result)
        .bind(&job.error)
        .bind(&job.stack)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim(&self, queue: &str, options: &DequeueOptions) -> Result<Option<JobData>> {
        // An empty allowed-name set can match nothing
        if let Some(names) = &options.names {
            if names.is_empty() {
                return Ok(None);
            }
        }

        // One atomic conditional update: pick the best eligible job and
        // mark it dequeued in the same statement, so concurrent workers
        // can never claim the same row.
        let mut sql = String::from(
            "UPDATE jobs SET status = 'dequeued', dequeued = ? \
             WHERE seq = ( \
                 SELECT seq FROM jobs \
                 WHERE status = 'queued' AND queue = ? AND delay <= ?",
        );

        if options.min_priority.is_some() {
            sql.push_str(" AND priority >= ?");
        }

        if let Some(names) = &options.names {
            sql.push_str(" AND name IN (");
            sql.push_str(&vec!["?"; names.len()].join(", "));
            sql.push(')');
        }

        sql.push_str(" ORDER BY priority DESC, seq ASC LIMIT 1) RETURNING *");

        let now = Utc::now().to_rfc3339();
        let mut query = sqlx::query(&sql).bind(&now).bind(queue).bind(&now);

        if let Some(min_priority) = options.min_priority {
            query = query.bind(min_priority);
        }

        if let Some(names) = &options.names {
            for name in names {
                query = query.bind(name);
            }
        }

        let row = query.fetch_optional(&self.pool).await?;

        match row {
            Some(row) => Ok(Some(self.row_to_job(row)?)),
            None => Ok(None),
        }
    }

    async fn get(&self, queue: &str, id: &JobId) -> Result<Option<JobData>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ? AND queue = ?")
            .bind(&id.0)
            .bind(queue)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_job(row)?)),
            None => Ok(None),
        }
    }

    async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs").execute(&self.pool).await?;

        Ok(result.rows_affected())
    }
}
