//! Job store implementations + HTTP fetch utilities for jobrank.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobrank_core::{JobAttributes, JobCandidate, JobRecord, JobStatus, JobType, StoreError, Tier};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobrank-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    CreatedAt,
    Score,
    Title,
    /// Lower bound of the posted rate; jobs without a parseable rate sort last.
    Budget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Listing filter used by the dashboard API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub priority: Option<Tier>,
    pub job_type: Option<JobType>,
    pub keyword: Option<String>,
    pub sort_by: SortKey,
    pub order: SortOrder,
    pub limit: usize,
    pub offset: usize,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            status: None,
            priority: None,
            job_type: None,
            keyword: None,
            sort_by: SortKey::default(),
            order: SortOrder::default(),
            limit: 100,
            offset: 0,
        }
    }
}

impl JobQuery {
    fn keyword_lower(&self) -> Option<String> {
        self.keyword
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_lowercase)
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        if self.status.is_some_and(|s| s != record.status) {
            return false;
        }
        if self.priority.is_some() && self.priority != record.priority {
            return false;
        }
        if self.job_type.is_some_and(|t| t != record.candidate.job_type) {
            return false;
        }
        match self.keyword_lower() {
            Some(needle) => {
                let c = &record.candidate;
                c.title.to_lowercase().contains(&needle)
                    || c.description.to_lowercase().contains(&needle)
                    || c.skills.iter().any(|s| s.to_lowercase().contains(&needle))
            }
            None => true,
        }
    }

    fn directed(&self, ord: Ordering) -> Ordering {
        match self.order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    }

    fn compare(&self, a: &JobRecord, b: &JobRecord) -> Ordering {
        let ord = match self.sort_by {
            SortKey::CreatedAt => self.directed(a.created_at.cmp(&b.created_at)),
            SortKey::Score => self.directed(a.score.cmp(&b.score)),
            SortKey::Title => self.directed(a.candidate.title.cmp(&b.candidate.title)),
            SortKey::Budget => match (a.candidate.budget(), b.candidate.budget()) {
                (Some(x), Some(y)) => self.directed(x.total_cmp(&y)),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
        };
        ord.then_with(|| a.identifier().cmp(b.identifier()))
    }

    /// Filter, sort and paginate an in-memory record set.
    pub fn apply<'a>(&self, records: impl IntoIterator<Item = &'a JobRecord>) -> Vec<JobRecord> {
        let mut rows = records
            .into_iter()
            .filter(|r| self.matches(r))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| self.compare(a, b));
        rows.into_iter().skip(self.offset).take(self.limit).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub by_job_type: BTreeMap<String, usize>,
}

impl JobStats {
    fn seeded() -> Self {
        Self {
            total: 0,
            by_status: JobStatus::ALL.iter().map(|s| (s.to_string(), 0)).collect(),
            by_priority: Tier::ALL.iter().map(|t| (t.to_string(), 0)).collect(),
            by_job_type: [JobType::Fixed, JobType::Hourly]
                .iter()
                .map(|t| (t.to_string(), 0))
                .collect(),
        }
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a JobRecord>) -> Self {
        let mut stats = Self::seeded();
        for record in records {
            stats.total += 1;
            *stats.by_status.entry(record.status.to_string()).or_default() += 1;
            if let Some(priority) = record.priority {
                *stats.by_priority.entry(priority.to_string()).or_default() += 1;
            }
            *stats
                .by_job_type
                .entry(record.candidate.job_type.to_string())
                .or_default() += 1;
        }
        stats
    }
}

pub type BatchUpsertResult = Vec<(String, Result<UpsertOutcome, StoreError>)>;

/// Keyed record store the pipeline persists ranked jobs into.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn exists(&self, identifier: &str) -> Result<bool, StoreError>;

    async fn known_identifiers(&self) -> Result<HashSet<String>, StoreError>;

    async fn upsert(
        &self,
        identifier: &str,
        attributes: JobAttributes,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Terminal write step of a batch. One identifier's failure never hides the others.
    ///
    /// Implementations commit all-or-nothing: if the returned future is dropped
    /// before it resolves (the caller's store timeout), no row of the batch is kept.
    async fn upsert_batch(&self, items: Vec<JobAttributes>) -> BatchUpsertResult;

    async fn get(&self, identifier: &str) -> Result<Option<JobRecord>, StoreError>;

    async fn list(&self, query: &JobQuery) -> Result<Vec<JobRecord>, StoreError>;

    async fn set_status(&self, identifier: &str, status: JobStatus) -> Result<JobRecord, StoreError>;

    async fn stats(&self) -> Result<JobStats, StoreError>;
}

fn check_identifier(identifier: &str, attributes: &JobAttributes) -> Result<(), StoreError> {
    if identifier.is_empty() || identifier != attributes.candidate.identifier {
        return Err(StoreError::WriteFailure {
            identifier: identifier.to_string(),
            reason: format!(
                "identifier does not match candidate `{}`",
                attributes.candidate.identifier
            ),
        });
    }
    Ok(())
}

fn write_failure(identifier: &str, reason: impl std::fmt::Display) -> StoreError {
    StoreError::WriteFailure {
        identifier: identifier.to_string(),
        reason: reason.to_string(),
    }
}

/// Turns every successful outcome into a write failure once the commit itself failed.
fn uncommitted(out: BatchUpsertResult, reason: &str) -> BatchUpsertResult {
    out.into_iter()
        .map(|(identifier, result)| {
            let result: Result<UpsertOutcome, StoreError> =
                result.and_then(|_| Err(write_failure(&identifier, reason)));
            (identifier, result)
        })
        .collect()
}

fn upsert_into(
    map: &mut BTreeMap<String, JobRecord>,
    identifier: &str,
    attributes: JobAttributes,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome, StoreError> {
    check_identifier(identifier, &attributes)?;
    match map.get_mut(identifier) {
        Some(existing) => {
            existing.apply(attributes, now);
            Ok(UpsertOutcome::Updated)
        }
        None => {
            map.insert(identifier.to_string(), JobRecord::new(attributes, now));
            Ok(UpsertOutcome::Created)
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: RwLock<BTreeMap<String, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn exists(&self, identifier: &str) -> Result<bool, StoreError> {
        Ok(self.records.read().await.contains_key(identifier))
    }

    async fn known_identifiers(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self.records.read().await.keys().cloned().collect())
    }

    async fn upsert(
        &self,
        identifier: &str,
        attributes: JobAttributes,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut map = self.records.write().await;
        upsert_into(&mut map, identifier, attributes, Utc::now())
    }

    async fn upsert_batch(&self, items: Vec<JobAttributes>) -> BatchUpsertResult {
        let mut map = self.records.write().await;
        let now = Utc::now();
        items
            .into_iter()
            .map(|attributes| {
                let identifier = attributes.candidate.identifier.clone();
                let result = upsert_into(&mut map, &identifier, attributes, now);
                (identifier, result)
            })
            .collect()
    }

    async fn get(&self, identifier: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.records.read().await.get(identifier).cloned())
    }

    async fn list(&self, query: &JobQuery) -> Result<Vec<JobRecord>, StoreError> {
        Ok(query.apply(self.records.read().await.values()))
    }

    async fn set_status(&self, identifier: &str, status: JobStatus) -> Result<JobRecord, StoreError> {
        let mut map = self.records.write().await;
        let record = map
            .get_mut(identifier)
            .ok_or_else(|| StoreError::NotFound(identifier.to_string()))?;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        Ok(JobStats::from_records(self.records.read().await.values()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JobFile {
    version: u32,
    jobs: Vec<JobRecord>,
}

/// JSON document store. Every mutation rewrites the file through a temp file + rename.
#[derive(Debug)]
pub struct JsonFileJobStore {
    path: PathBuf,
    records: RwLock<BTreeMap<String, JobRecord>>,
}

impl JsonFileJobStore {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let records = if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking store path {}", path.display()))?
        {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let file: JobFile =
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
            file.jobs
                .into_iter()
                .map(|r| (r.identifier().to_string(), r))
                .collect()
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), jobs = records.len(), "opened json job store");
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, map: &BTreeMap<String, JobRecord>) -> anyhow::Result<()> {
        let file = JobFile {
            version: 1,
            jobs: map.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file).context("serializing job store")?;
        write_atomically(&self.path, &bytes).await
    }
}

/// Writes `bytes` to a sibling temp file, then renames it over `path`.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[async_trait]
impl JobStore for JsonFileJobStore {
    async fn exists(&self, identifier: &str) -> Result<bool, StoreError> {
        Ok(self.records.read().await.contains_key(identifier))
    }

    async fn known_identifiers(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self.records.read().await.keys().cloned().collect())
    }

    async fn upsert(
        &self,
        identifier: &str,
        attributes: JobAttributes,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut map = self.records.write().await;
        let mut next = map.clone();
        let outcome = upsert_into(&mut next, identifier, attributes, Utc::now())?;
        self.persist(&next)
            .await
            .map_err(|err| StoreError::WriteFailure {
                identifier: identifier.to_string(),
                reason: format!("{err:#}"),
            })?;
        *map = next;
        Ok(outcome)
    }

    async fn upsert_batch(&self, items: Vec<JobAttributes>) -> BatchUpsertResult {
        let mut map = self.records.write().await;
        let mut next = map.clone();
        let now = Utc::now();
        let mut out = Vec::with_capacity(items.len());
        for attributes in items {
            let identifier = attributes.candidate.identifier.clone();
            let result = upsert_into(&mut next, &identifier, attributes, now);
            out.push((identifier, result));
        }

        if let Err(err) = self.persist(&next).await {
            let reason = format!("{err:#}");
            tracing::error!(path = %self.path.display(), error = %reason, "job store batch write failed");
            return uncommitted(out, &reason);
        }
        *map = next;
        out
    }

    async fn get(&self, identifier: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.records.read().await.get(identifier).cloned())
    }

    async fn list(&self, query: &JobQuery) -> Result<Vec<JobRecord>, StoreError> {
        Ok(query.apply(self.records.read().await.values()))
    }

    async fn set_status(&self, identifier: &str, status: JobStatus) -> Result<JobRecord, StoreError> {
        let mut map = self.records.write().await;
        let mut next = map.clone();
        let record = next
            .get_mut(identifier)
            .ok_or_else(|| StoreError::NotFound(identifier.to_string()))?;
        record.status = status;
        record.updated_at = Utc::now();
        let updated = record.clone();
        self.persist(&next)
            .await
            .map_err(|err| StoreError::WriteFailure {
                identifier: identifier.to_string(),
                reason: format!("{err:#}"),
            })?;
        *map = next;
        Ok(updated)
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        Ok(JobStats::from_records(self.records.read().await.values()))
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Postgres-backed store over a single `job_posts` table.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_posts (
                identifier   TEXT PRIMARY KEY,
                title        TEXT NOT NULL,
                description  TEXT NOT NULL,
                job_type     TEXT NOT NULL,
                status       TEXT NOT NULL DEFAULT 'New',
                score        INTEGER,
                priority     TEXT,
                explanation  TEXT,
                budget       DOUBLE PRECISION,
                candidate    JSONB NOT NULL,
                created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating job_posts table")?;
        sqlx::query("ALTER TABLE job_posts ADD COLUMN IF NOT EXISTS budget DOUBLE PRECISION")
            .execute(&self.pool)
            .await
            .context("adding job_posts.budget")?;
        Ok(())
    }

    async fn upsert_row(
        conn: &mut PgConnection,
        identifier: &str,
        attributes: &JobAttributes,
    ) -> Result<UpsertOutcome, StoreError> {
        check_identifier(identifier, attributes)?;
        let candidate = &attributes.candidate;
        let row = sqlx::query(
            r#"
            INSERT INTO job_posts
                (identifier, title, description, job_type, score, priority, explanation, budget, candidate)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (identifier) DO UPDATE
               SET title = EXCLUDED.title,
                   description = EXCLUDED.description,
                   job_type = EXCLUDED.job_type,
                   score = EXCLUDED.score,
                   priority = EXCLUDED.priority,
                   explanation = EXCLUDED.explanation,
                   budget = EXCLUDED.budget,
                   candidate = EXCLUDED.candidate,
                   updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(identifier)
        .bind(&candidate.title)
        .bind(&candidate.description)
        .bind(candidate.job_type.as_str())
        .bind(attributes.score.map(|s| s.min(i32::MAX as u32) as i32))
        .bind(attributes.priority.map(|p| p.as_str()))
        .bind(attributes.explanation.as_deref())
        .bind(candidate.budget())
        .bind(sqlx::types::Json(candidate))
        .fetch_one(&mut *conn)
        .await
        .map_err(|err| write_failure(identifier, err))?;
        let inserted: bool = row.try_get("inserted").map_err(backend)?;
        Ok(if inserted {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Updated
        })
    }

    /// One row inside the batch transaction; a failed row rolls back to its savepoint only.
    async fn upsert_savepoint(
        conn: &mut PgConnection,
        identifier: &str,
        attributes: &JobAttributes,
    ) -> Result<UpsertOutcome, StoreError> {
        sqlx::query("SAVEPOINT job_upsert")
            .execute(&mut *conn)
            .await
            .map_err(|err| write_failure(identifier, err))?;
        match Self::upsert_row(conn, identifier, attributes).await {
            Ok(outcome) => {
                sqlx::query("RELEASE SAVEPOINT job_upsert")
                    .execute(&mut *conn)
                    .await
                    .map_err(|err| write_failure(identifier, err))?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback) = sqlx::query("ROLLBACK TO SAVEPOINT job_upsert")
                    .execute(&mut *conn)
                    .await
                {
                    tracing::warn!(identifier, error = %rollback, "savepoint rollback failed");
                }
                Err(err)
            }
        }
    }

    fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<JobRecord, StoreError> {
        let candidate: sqlx::types::Json<JobCandidate> = row.try_get("candidate").map_err(backend)?;
        let status: String = row.try_get("status").map_err(backend)?;
        let priority: Option<String> = row.try_get("priority").map_err(backend)?;
        let score: Option<i32> = row.try_get("score").map_err(backend)?;
        Ok(JobRecord {
            candidate: candidate.0,
            status: status
                .parse()
                .map_err(|e: jobrank_core::InvalidStatus| StoreError::Backend(e.to_string()))?,
            score: score.map(|s| s.max(0) as u32),
            priority: priority.and_then(|p| p.parse().ok()),
            explanation: row.try_get("explanation").map_err(backend)?,
            created_at: row.try_get("created_at").map_err(backend)?,
            updated_at: row.try_get("updated_at").map_err(backend)?,
        })
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn exists(&self, identifier: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM job_posts WHERE identifier = $1) AS found")
            .bind(identifier)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        row.try_get("found").map_err(backend)
    }

    async fn known_identifiers(&self) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query("SELECT identifier FROM job_posts")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("identifier").map_err(backend))
            .collect()
    }

    async fn upsert(
        &self,
        identifier: &str,
        attributes: JobAttributes,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| write_failure(identifier, err))?;
        Self::upsert_row(&mut conn, identifier, &attributes).await
    }

    async fn upsert_batch(&self, items: Vec<JobAttributes>) -> BatchUpsertResult {
        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                let reason = err.to_string();
                return items
                    .into_iter()
                    .map(|a| {
                        let identifier = a.candidate.identifier;
                        let failure = write_failure(&identifier, &reason);
                        (identifier, Err(failure))
                    })
                    .collect();
            }
        };
        let mut out = Vec::with_capacity(items.len());
        for attributes in items {
            let identifier = attributes.candidate.identifier.clone();
            let result = Self::upsert_savepoint(&mut tx, &identifier, &attributes).await;
            out.push((identifier, result));
        }
        if let Err(err) = tx.commit().await {
            let reason = err.to_string();
            tracing::error!(error = %reason, "job batch commit failed");
            return uncommitted(out, &reason);
        }
        out
    }

    async fn get(&self, identifier: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT candidate, status, score, priority, explanation, created_at, updated_at
              FROM job_posts
             WHERE identifier = $1
            "#,
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn list(&self, query: &JobQuery) -> Result<Vec<JobRecord>, StoreError> {
        let column = match query.sort_by {
            SortKey::CreatedAt => "created_at",
            SortKey::Score => "score",
            SortKey::Title => "title",
            SortKey::Budget => "budget",
        };
        let direction = match query.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let sql = format!(
            r#"
            SELECT candidate, status, score, priority, explanation, created_at, updated_at
              FROM job_posts
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR priority = $2)
               AND ($3::text IS NULL OR job_type = $3)
               AND ($4::text IS NULL
                    OR title ILIKE $4
                    OR description ILIKE $4
                    OR (candidate->>'skills') ILIKE $4)
             ORDER BY {column} {direction} NULLS LAST, identifier
             LIMIT $5 OFFSET $6
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(query.status.map(|s| s.as_str()))
            .bind(query.priority.map(|p| p.as_str()))
            .bind(query.job_type.map(|t| t.as_str()))
            .bind(query.keyword_lower().map(|k| format!("%{k}%")))
            .bind(query.limit.min(i64::MAX as usize) as i64)
            .bind(query.offset.min(i64::MAX as usize) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn set_status(&self, identifier: &str, status: JobStatus) -> Result<JobRecord, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE job_posts
               SET status = $2,
                   updated_at = NOW()
             WHERE identifier = $1
            RETURNING candidate, status, score, priority, explanation, created_at, updated_at
            "#,
        )
        .bind(identifier)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| StoreError::WriteFailure {
            identifier: identifier.to_string(),
            reason: err.to_string(),
        })?;
        match row {
            Some(row) => Self::record_from_row(&row),
            None => Err(StoreError::NotFound(identifier.to_string())),
        }
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let mut stats = JobStats::seeded();
        for (column, bucket) in [
            ("status", &mut stats.by_status),
            ("priority", &mut stats.by_priority),
            ("job_type", &mut stats.by_job_type),
        ] {
            let sql = format!(
                "SELECT {column} AS bucket, COUNT(*) AS n FROM job_posts WHERE {column} IS NOT NULL GROUP BY {column}"
            );
            let rows = sqlx::query(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
            for row in rows {
                let key: String = row.try_get("bucket").map_err(backend)?;
                let n: i64 = row.try_get("n").map_err(backend)?;
                bucket.insert(key, n.max(0) as usize);
            }
        }
        stats.total = stats.by_job_type.values().sum();
        Ok(stats)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 8,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bursts up to `requests`, then one token every `60s / requests`. Zero disables limiting.
    pub fn per_minute(requests: u32) -> Option<Self> {
        (requests > 0).then(|| Self {
            capacity: requests,
            refill_every: Duration::from_secs(60) / requests,
        })
    }
}

/// Request-rate limiter for rate-limited inference APIs.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && !self.refill_every.is_zero() {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            drop(state);
            tokio::time::sleep(self.refill_every).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client is shutting down")]
    Closed,
}

/// Shared retrying HTTP client with a global in-flight limit.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            token_bucket: config
                .token_bucket
                .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every))),
            backoff: config.backoff,
        })
    }

    pub async fn get_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.send_with_retry("GET", url, || self.client.get(url)).await
    }

    pub async fn post_json<B>(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &B,
    ) -> Result<FetchedResponse, FetchError>
    where
        B: Serialize + ?Sized + Sync,
    {
        self.send_with_retry("POST", url, || {
            let request = self.client.post(url).json(body);
            match bearer {
                Some(token) => request.bearer_auth(token),
                None => request,
            }
        })
        .await
    }

    async fn send_with_retry<F>(
        &self,
        method: &'static str,
        url: &str,
        build: F,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_request", method, url);
        async {
            let mut attempt = 0usize;
            loop {
                match build().send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();
                        if status.is_success() {
                            let body = match resp.bytes().await {
                                Ok(bytes) => bytes.to_vec(),
                                Err(err) => return Err(FetchError::Request(err)),
                            };
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(attempt, error = %err, "retrying request");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}
