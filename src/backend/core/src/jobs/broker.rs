//! Durable queue (broker) abstraction and backends.
//!
//! The broker gives at-least-once delivery over named queues. A consumed job is
//! held "in flight" under the consumer's tag until it is acked (removed) or
//! nacked (put back on its queue). Consumers renew a heartbeat while they run;
//! deliveries held by a consumer whose heartbeat lapsed are put back by
//! [`DurableQueue::recover_orphaned`], whatever tag the consumer had.
//! [`DurableQueue::recover`] does the same for one tag when a consumer restarts.
//!
//! Delayed publishing backs the fixed retry delay: the next attempt sits in the
//! broker, not in a worker slot, until it becomes due.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, OnceCell};
use tokio::time::Instant;

use super::job::Job;
use crate::error::{ErrorCode, Result, VisionaryError};

/// A job handed to one consumer, pending ack or nack.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: Job,
    consumer: String,
    receipt: String,
}

impl Delivery {
    pub fn new(job: Job, consumer: impl Into<String>, receipt: impl Into<String>) -> Self {
        Self {
            job,
            consumer: consumer.into(),
            receipt: receipt.into(),
        }
    }

    /// Consumer tag the job was delivered to.
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Backend-specific handle identifying this delivery.
    pub fn receipt(&self) -> &str {
        &self.receipt
    }
}

/// Broker operations used by the dispatcher, workers and beat.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Backend name for logs and health output.
    fn name(&self) -> &'static str;

    /// Append a job to `queue`.
    async fn publish(&self, queue: &str, job: &Job) -> Result<()>;

    /// Make a job visible on `queue` once `delay` has passed.
    async fn publish_delayed(&self, queue: &str, job: &Job, delay: Duration) -> Result<()>;

    /// Wait up to `timeout` for a job on any of `queues`.
    async fn consume(&self, consumer: &str, queues: &[String], timeout: Duration) -> Result<Option<Delivery>>;

    /// Remove a delivered job for good.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Return a delivered job to its queue for redelivery.
    async fn nack(&self, delivery: &Delivery) -> Result<()>;

    /// Requeue everything `consumer` left unacknowledged. Returns the count.
    async fn recover(&self, consumer: &str) -> Result<usize>;

    /// Mark `consumer` alive for `ttl`.
    async fn heartbeat(&self, consumer: &str, ttl: Duration) -> Result<()>;

    /// Requeue deliveries held by consumers whose heartbeat has lapsed.
    /// Returns the count.
    async fn recover_orphaned(&self) -> Result<usize>;

    /// Ready plus delayed jobs on `queue`.
    async fn depth(&self, queue: &str) -> Result<usize>;

    /// Take or renew the named lease for `holder`. False when another holder owns it.
    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// When the beat entry `entry` last fired, on any node.
    async fn last_fired(&self, entry: &str) -> Result<Option<DateTime<Utc>>>;

    async fn record_fired(&self, entry: &str, at: DateTime<Utc>) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory broker
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Job>,
    delayed: Vec<(Instant, Job)>,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        let mut due: Vec<(Instant, Job)> = Vec::new();
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                due.push(self.delayed.swap_remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by_key(|(eta, _)| *eta);
        self.ready.extend(due.into_iter().map(|(_, job)| job));
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(eta, _)| *eta).min()
    }
}

#[derive(Debug)]
struct InFlight {
    consumer: String,
    job: Job,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    in_flight: HashMap<String, InFlight>,
    leases: HashMap<String, (String, Instant)>,
    /// Consumer tag to heartbeat expiry
    heartbeats: HashMap<String, Instant>,
    fired: HashMap<String, DateTime<Utc>>,
}

impl BrokerState {
    /// Put the given deliveries back at the tail of their queues.
    fn requeue(&mut self, receipts: &[String]) -> usize {
        let mut count = 0;
        for receipt in receipts {
            if let Some(entry) = self.in_flight.remove(receipt) {
                self.queues
                    .entry(entry.job.queue_name.clone())
                    .or_default()
                    .ready
                    .push_back(entry.job);
                count += 1;
            }
        }
        count
    }
}

/// Process-local broker for tests and single-node development.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
    next_receipt: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs currently delivered and not yet acked.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    fn try_take(&self, consumer: &str, queues: &[String]) -> (Option<Delivery>, Option<Instant>) {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut next_due: Option<Instant> = None;

        for name in queues {
            let Some(queue) = state.queues.get_mut(name) else {
                continue;
            };
            queue.promote_due(now);
            if let Some(job) = queue.ready.pop_front() {
                let receipt = self.next_receipt.fetch_add(1, Ordering::Relaxed).to_string();
                state.in_flight.insert(
                    receipt.clone(),
                    InFlight {
                        consumer: consumer.to_string(),
                        job: job.clone(),
                    },
                );
                return (Some(Delivery::new(job, consumer, receipt)), None);
            }
            next_due = match (next_due, queue.next_due()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }

        (None, next_due)
    }
}

#[async_trait]
impl DurableQueue for InMemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, queue: &str, job: &Job) -> Result<()> {
        self.state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(job.clone());
        self.notify.notify_waiters();
        tracing::debug!(queue = %queue, job_id = %job.job_id, "Job published");
        Ok(())
    }

    async fn publish_delayed(&self, queue: &str, job: &Job, delay: Duration) -> Result<()> {
        self.state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .delayed
            .push((Instant::now() + delay, job.clone()));
        self.notify.notify_waiters();
        tracing::debug!(queue = %queue, job_id = %job.job_id, delay_ms = delay.as_millis() as u64, "Job scheduled");
        Ok(())
    }

    async fn consume(&self, consumer: &str, queues: &[String], timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (delivery, next_due) = self.try_take(consumer, queues);
            if delivery.is_some() {
                return Ok(delivery);
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }

            let wake_at = next_due.map_or(deadline, |due| due.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.state
            .lock()
            .in_flight
            .remove(delivery.receipt())
            .map(|_| ())
            .ok_or_else(|| {
                VisionaryError::new(ErrorCode::QueueError, "Delivery is not in flight")
                    .with_context("job_id", delivery.job.job_id)
            })
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        {
            let mut state = self.state.lock();
            let entry = state.in_flight.remove(delivery.receipt()).ok_or_else(|| {
                VisionaryError::new(ErrorCode::QueueError, "Delivery is not in flight")
                    .with_context("job_id", delivery.job.job_id)
            })?;
            state
                .queues
                .entry(entry.job.queue_name.clone())
                .or_default()
                .ready
                .push_front(entry.job);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn recover(&self, consumer: &str) -> Result<usize> {
        let recovered = {
            let mut state = self.state.lock();
            let receipts: Vec<String> = state
                .in_flight
                .iter()
                .filter(|(_, f)| f.consumer == consumer)
                .map(|(r, _)| r.clone())
                .collect();
            state.requeue(&receipts)
        };
        if recovered > 0 {
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    async fn heartbeat(&self, consumer: &str, ttl: Duration) -> Result<()> {
        self.state
            .lock()
            .heartbeats
            .insert(consumer.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn recover_orphaned(&self) -> Result<usize> {
        let recovered = {
            let now = Instant::now();
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.heartbeats.retain(|_, expires| *expires > now);

            let heartbeats = &state.heartbeats;
            let orphaned: Vec<String> = state
                .in_flight
                .iter()
                .filter(|(_, f)| !heartbeats.contains_key(&f.consumer))
                .map(|(r, _)| r.clone())
                .collect();
            state.requeue(&orphaned)
        };
        if recovered > 0 {
            self.notify.notify_waiters();
            tracing::info!(recovered, "Requeued jobs of silent consumers");
        }
        Ok(recovered)
    }

    async fn depth(&self, queue: &str) -> Result<usize> {
        Ok(self
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len() + q.delayed.len()))
    }

    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let free = match state.leases.get(name) {
            Some((owner, expires)) => owner == holder || *expires <= now,
            None => true,
        };
        if free {
            state.leases.insert(name.to_string(), (holder.to_string(), now + ttl));
        }
        Ok(free)
    }

    async fn last_fired(&self, entry: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.lock().fired.get(entry).copied())
    }

    async fn record_fired(&self, entry: &str, at: DateTime<Utc>) -> Result<()> {
        self.state.lock().fired.insert(entry.to_string(), at);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis broker
// ═══════════════════════════════════════════════════════════════════════════════

/// Moves due members of a delayed sorted set onto the ready list.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
    redis.call('RPUSH', KEYS[2], member)
end
return #due
"#;

/// Takes the lease when free, renews it when already held by the caller.
const LEASE_SCRIPT: &str = r#"
local owner = redis.call('GET', KEYS[1])
if owner == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
if not owner then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return 1
end
return 0
"#;

/// Drains a consumer's processing list back onto the queues named in each job.
///
/// KEYS: processing list, consumer heartbeat, consumer set.
/// ARGV: queue key prefix, consumer tag, `1` to leave live consumers alone.
/// Returns -1 when the consumer is alive.
const RECLAIM_SCRIPT: &str = r#"
if ARGV[3] == '1' and redis.call('EXISTS', KEYS[2]) == 1 then
    return -1
end
local moved = 0
local raw = redis.call('RPOP', KEYS[1])
while raw do
    local ok, job = pcall(cjson.decode, raw)
    if ok and type(job) == 'table' and type(job.queue_name) == 'string' then
        redis.call('LPUSH', ARGV[1] .. job.queue_name, raw)
        moved = moved + 1
    end
    raw = redis.call('RPOP', KEYS[1])
end
if ARGV[3] == '1' then
    redis.call('SREM', KEYS[3], ARGV[2])
end
return moved
"#;

const PROMOTE_BATCH: usize = 100;

/// Broker on Redis lists.
///
/// Keys, under `key_prefix`:
/// - `queue:{name}` ready list (RPUSH / LMOVE from the left)
/// - `delayed:{name}` sorted set scored by due time in epoch millis
/// - `processing:{consumer}` jobs in flight for one consumer
/// - `consumer:{consumer}` heartbeat, expiring with the consumer TTL
/// - `consumers` set of tags that have sent a heartbeat
/// - `lease:{name}` beat lease
/// - `beat:fired` hash of entry name to last firing in epoch millis
pub struct RedisBroker {
    client: redis::Client,
    conn: OnceCell<redis::aio::ConnectionManager>,
    key_prefix: String,
    poll_interval: Duration,
    promote: redis::Script,
    lease: redis::Script,
    reclaim: redis::Script,
}

impl RedisBroker {
    /// Create a broker; the connection is opened on first use.
    pub fn new(url: &str, key_prefix: impl Into<String>, poll_interval: Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            VisionaryError::with_internal(ErrorCode::InvalidConfiguration, "Invalid broker URL", e.to_string())
        })?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            key_prefix: key_prefix.into(),
            poll_interval,
            promote: redis::Script::new(PROMOTE_SCRIPT),
            lease: redis::Script::new(LEASE_SCRIPT),
            reclaim: redis::Script::new(RECLAIM_SCRIPT),
        })
    }

    async fn get_conn(&self) -> Result<redis::aio::ConnectionManager> {
        self.conn
            .get_or_try_init(|| async {
                redis::aio::ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| VisionaryError::queue_unavailable(e.to_string()))
            })
            .await
            .cloned()
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.key_prefix, queue)
    }

    fn delayed_key(&self, queue: &str) -> String {
        format!("{}:delayed:{}", self.key_prefix, queue)
    }

    fn processing_key(&self, consumer: &str) -> String {
        format!("{}:processing:{}", self.key_prefix, consumer)
    }

    fn consumer_key(&self, consumer: &str) -> String {
        format!("{}:consumer:{}", self.key_prefix, consumer)
    }

    fn consumers_key(&self) -> String {
        format!("{}:consumers", self.key_prefix)
    }

    fn lease_key(&self, name: &str) -> String {
        format!("{}:lease:{}", self.key_prefix, name)
    }

    fn fired_key(&self) -> String {
        format!("{}:beat:fired", self.key_prefix)
    }

    async fn reclaim_consumer(
        &self,
        conn: &mut redis::aio::ConnectionManager,
        consumer: &str,
        only_if_silent: bool,
    ) -> Result<i64> {
        let moved: i64 = self
            .reclaim
            .key(self.processing_key(consumer))
            .key(self.consumer_key(consumer))
            .key(self.consumers_key())
            .arg(format!("{}:queue:", self.key_prefix))
            .arg(consumer)
            .arg(if only_if_silent { "1" } else { "0" })
            .invoke_async(conn)
            .await?;
        Ok(moved)
    }

    async fn promote_due(&self, conn: &mut redis::aio::ConnectionManager, queue: &str) -> Result<()> {
        let moved: i64 = self
            .promote
            .key(self.delayed_key(queue))
            .key(self.queue_key(queue))
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(conn)
            .await?;
        if moved > 0 {
            tracing::debug!(queue = %queue, moved, "Promoted delayed jobs");
        }
        Ok(())
    }
}

#[async_trait]
impl DurableQueue for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, queue: &str, job: &Job) -> Result<()> {
        let serialized = serde_json::to_string(job)?;

        let mut conn = self.get_conn().await?;
        redis::cmd("RPUSH")
            .arg(self.queue_key(queue))
            .arg(&serialized)
            .query_async::<_, i64>(&mut conn)
            .await?;

        tracing::debug!(queue = %queue, job_id = %job.job_id, "Job published");
        Ok(())
    }

    async fn publish_delayed(&self, queue: &str, job: &Job, delay: Duration) -> Result<()> {
        let serialized = serde_json::to_string(job)?;
        let due = Utc::now().timestamp_millis() + delay.as_millis().min(i64::MAX as u128) as i64;

        let mut conn = self.get_conn().await?;
        redis::cmd("ZADD")
            .arg(self.delayed_key(queue))
            .arg(due)
            .arg(&serialized)
            .query_async::<_, i64>(&mut conn)
            .await?;

        tracing::debug!(queue = %queue, job_id = %job.job_id, due, "Job scheduled");
        Ok(())
    }

    async fn consume(&self, consumer: &str, queues: &[String], timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        let processing = self.processing_key(consumer);
        let mut conn = self.get_conn().await?;

        loop {
            for queue in queues {
                self.promote_due(&mut conn, queue).await?;
                let raw: Option<String> = redis::cmd("LMOVE")
                    .arg(self.queue_key(queue))
                    .arg(&processing)
                    .arg("LEFT")
                    .arg("RIGHT")
                    .query_async(&mut conn)
                    .await?;

                if let Some(raw) = raw {
                    match serde_json::from_str::<Job>(&raw) {
                        Ok(job) => return Ok(Some(Delivery::new(job, consumer, raw))),
                        Err(e) => {
                            // Unreadable payloads would be redelivered forever.
                            tracing::error!(queue = %queue, error = %e, "Dropping malformed job message");
                            redis::cmd("LREM")
                                .arg(&processing)
                                .arg(1)
                                .arg(&raw)
                                .query_async::<_, i64>(&mut conn)
                                .await?;
                        }
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let removed: i64 = redis::cmd("LREM")
            .arg(self.processing_key(delivery.consumer()))
            .arg(1)
            .arg(delivery.receipt())
            .query_async(&mut conn)
            .await?;
        if removed == 0 {
            tracing::warn!(job_id = %delivery.job.job_id, "Acked a delivery that was not in flight");
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(self.processing_key(delivery.consumer()))
            .arg(1)
            .arg(delivery.receipt())
            .ignore()
            .cmd("LPUSH")
            .arg(self.queue_key(&delivery.job.queue_name))
            .arg(delivery.receipt())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn recover(&self, consumer: &str) -> Result<usize> {
        let mut conn = self.get_conn().await?;
        let recovered = self.reclaim_consumer(&mut conn, consumer, false).await?.max(0) as usize;
        if recovered > 0 {
            tracing::info!(consumer = %consumer, recovered, "Requeued unacknowledged jobs");
        }
        Ok(recovered)
    }

    async fn heartbeat(&self, consumer: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::pipe()
            .cmd("SET")
            .arg(self.consumer_key(consumer))
            .arg(1)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .ignore()
            .cmd("SADD")
            .arg(self.consumers_key())
            .arg(consumer)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn recover_orphaned(&self) -> Result<usize> {
        let mut conn = self.get_conn().await?;
        let consumers: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.consumers_key())
            .query_async(&mut conn)
            .await?;

        let mut recovered = 0;
        for consumer in consumers {
            let moved = self.reclaim_consumer(&mut conn, &consumer, true).await?;
            if moved > 0 {
                tracing::info!(consumer = %consumer, recovered = moved, "Requeued jobs of silent consumer");
                recovered += moved as usize;
            }
        }
        Ok(recovered)
    }

    async fn depth(&self, queue: &str) -> Result<usize> {
        let mut conn = self.get_conn().await?;
        let (ready, delayed): (usize, usize) = redis::pipe()
            .cmd("LLEN")
            .arg(self.queue_key(queue))
            .cmd("ZCARD")
            .arg(self.delayed_key(queue))
            .query_async(&mut conn)
            .await?;
        Ok(ready + delayed)
    }

    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let granted: i64 = self
            .lease
            .key(self.lease_key(name))
            .arg(holder)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(granted == 1)
    }

    async fn last_fired(&self, entry: &str) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.get_conn().await?;
        let millis: Option<i64> = redis::cmd("HGET")
            .arg(self.fired_key())
            .arg(entry)
            .query_async(&mut conn)
            .await?;
        Ok(millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
    }

    async fn record_fired(&self, entry: &str, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("HSET")
            .arg(self.fired_key())
            .arg(entry)
            .arg(at.timestamp_millis())
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
