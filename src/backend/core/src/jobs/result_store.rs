//! Result store: job outcomes with a bounded lifetime.
//!
//! Every write replaces the previous record for the job and carries its own
//! TTL. Once the TTL has elapsed the record is gone for good; callers must poll
//! within the window.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;

use super::job::{JobId, JobResult};
use crate::error::{ErrorCode, ErrorContext, Result, VisionaryError};

/// Key-value storage for [`JobResult`]s.
#[async_trait]
pub trait ResultStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Store `result` for `job_id`, readable for `ttl`.
    async fn put(&self, job_id: JobId, result: JobResult, ttl: Duration) -> Result<()>;

    /// Current record, or `None` when absent or expired.
    async fn get(&self, job_id: JobId) -> Result<Option<JobResult>>;

    async fn delete(&self, job_id: JobId) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════════════

/// Writes between sweeps of expired records.
const PURGE_EVERY: u64 = 256;

/// DashMap-backed store; expiry is checked on read and swept periodically on write.
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    entries: DashMap<JobId, JobResult>,
    writes: AtomicU64,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, result| !result.is_expired_at(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, job_id: JobId, result: JobResult, ttl: Duration) -> Result<()> {
        self.entries.insert(job_id, result.with_ttl(ttl));
        if self.writes.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            let purged = self.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "Purged expired job results");
            }
        }
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobResult>> {
        let now = Utc::now();
        let found = self.entries.get(&job_id).map(|entry| entry.value().clone());
        match found {
            Some(result) if result.is_expired_at(now) => {
                self.entries.remove_if(&job_id, |_, r| r.is_expired_at(now));
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn delete(&self, job_id: JobId) -> Result<()> {
        self.entries.remove(&job_id);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis store
// ═══════════════════════════════════════════════════════════════════════════════

/// Results as JSON strings under `{prefix}:result:{job_id}` with `SET PX`.
pub struct RedisResultStore {
    client: redis::Client,
    conn: OnceCell<redis::aio::ConnectionManager>,
    key_prefix: String,
}

impl RedisResultStore {
    /// Create a store; the connection is opened on first use.
    pub fn new(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            VisionaryError::with_internal(
                ErrorCode::InvalidConfiguration,
                "Invalid result backend URL",
                e.to_string(),
            )
        })?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            key_prefix: key_prefix.into(),
        })
    }

    async fn get_conn(&self) -> Result<redis::aio::ConnectionManager> {
        self.conn
            .get_or_try_init(|| async {
                redis::aio::ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| VisionaryError::result_store_unavailable(e.to_string()))
            })
            .await
            .cloned()
    }

    fn key(&self, job_id: JobId) -> String {
        format!("{}:result:{}", self.key_prefix, job_id)
    }
}

fn store_error(error: redis::RedisError) -> VisionaryError {
    VisionaryError::from(error).into_result_store_error()
}

#[async_trait]
impl ResultStore for RedisResultStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn put(&self, job_id: JobId, result: JobResult, ttl: Duration) -> Result<()> {
        let result = result.with_ttl(ttl);
        let serialized = serde_json::to_string(&result)?;
        let mut conn = self.get_conn().await?;
        redis::cmd("SET")
            .arg(self.key(job_id))
            .arg(serialized)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobResult>> {
        let mut conn = self.get_conn().await?;
        let raw: Option<String> = conn.get(self.key(job_id)).await.map_err(store_error)?;
        match raw {
            Some(raw) => {
                let result: JobResult = serde_json::from_str(&raw)
                    .context(format!("stored result for job {} is unreadable", job_id))?;
                Ok((!result.is_expired()).then_some(result))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.get_conn().await?;
        conn.del::<_, ()>(self.key(job_id)).await.map_err(store_error)?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{Job, JobStatus};
    use crate::jobs::registry::TaskPolicy;

    fn job() -> Job {
        let policy = TaskPolicy {
            queue: None,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            soft_timeout: Duration::from_secs(5),
            hard_timeout: Duration::from_secs(10),
        };
        Job::new("media.extract_metadata", serde_json::json!({"file_path": "/a.pdf"}), "media", &policy)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = InMemoryResultStore::new();
        let job = job();
        store
            .put(job.job_id, JobResult::pending(&job), Duration::from_secs(60))
            .await
            .unwrap();

        let got = store.get(job.job_id).await.unwrap().unwrap();
        assert_eq!(got.status, JobStatus::Pending);
        assert_eq!(got.expires_at - got.updated_at, chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = InMemoryResultStore::new();
        let job = job();
        let ttl = Duration::from_secs(60);
        store.put(job.job_id, JobResult::pending(&job), ttl).await.unwrap();
        store
            .put(job.job_id, JobResult::completed(&job, serde_json::json!({"ok": true})), ttl)
            .await
            .unwrap();

        let got = store.get(job.job_id).await.unwrap().unwrap();
        assert_eq!(got.status, JobStatus::Completed);
        assert_eq!(got.return_value, Some(serde_json::json!({"ok": true})));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_are_gone() {
        let store = InMemoryResultStore::new();
        let job = job();
        store
            .put(job.job_id, JobResult::failed(&job, "boom"), Duration::from_millis(30))
            .await
            .unwrap();
        assert!(store.get(job.job_id).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get(job.job_id).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = InMemoryResultStore::new();
        let short = job();
        let long = job();
        store.put(short.job_id, JobResult::pending(&short), Duration::from_millis(10)).await.unwrap();
        store.put(long.job_id, JobResult::pending(&long), Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.purge_expired(), 1);
        assert!(store.get(long.job_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryResultStore::new();
        let job = job();
        store.put(job.job_id, JobResult::pending(&job), Duration::from_secs(60)).await.unwrap();
        store.delete(job.job_id).await.unwrap();
        assert!(store.get(job.job_id).await.unwrap().is_none());
    }
}
