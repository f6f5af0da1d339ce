use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

/// A message handed out by [`JobQueue::receive`]. Stays leased until deleted
/// or until the visibility timeout runs out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: String,
    pub body: String,
    pub ack_token: String,
    /// How many times this message has been handed out, this delivery included.
    pub receive_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Entry in the dead-letter list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub body: String,
    pub reason: String,
    pub receive_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Durable at-least-once queue with visibility-timeout leases.
///
/// A received message that is not deleted becomes visible again once its
/// lease expires, so consumers must tolerate duplicate delivery.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a message body; returns the assigned message id.
    async fn publish(&self, body: &str) -> Result<String, QueueError>;

    /// Long-poll for up to `max_messages`. An empty result means nothing
    /// became available within `wait`.
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Remove a message for good. Deleting twice, or after expiry, is a no-op.
    async fn delete(&self, ack_token: &str) -> Result<(), QueueError>;

    /// Take a message out of circulation and record why.
    async fn dead_letter(&self, message: &ReceivedMessage, reason: &str) -> Result<(), QueueError>;

    /// Number of messages waiting to be received.
    async fn depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

fn ack_token_for(id: &str) -> String {
    format!("{id}:{}", Uuid::new_v4().simple())
}

fn message_id_from_token(ack_token: &str) -> Result<&str, QueueError> {
    ack_token
        .rsplit_once(':')
        .map(|(id, _)| id)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| QueueError::InvalidAckToken(ack_token.to_string()))
}

/// Stored form of a message in Redis.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    body: String,
    enqueued_at: DateTime<Utc>,
}

/// Moves leases whose deadline has passed back onto the ready list.
const RECLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[1], id)
    if redis.call('HEXISTS', KEYS[3], id) == 1 then
        redis.call('RPUSH', KEYS[2], id)
    end
end
return #expired
"#;

/// Claims up to ARGV[1] ready messages, leasing each until ARGV[2].
/// Returns a flat list of (id, envelope, receive_count) triples.
const CLAIM_SCRIPT: &str = r#"
local claimed = {}
for _ = 1, tonumber(ARGV[1]) do
    local id = redis.call('RPOP', KEYS[1])
    if not id then break end
    local envelope = redis.call('HGET', KEYS[3], id)
    if envelope then
        redis.call('ZADD', KEYS[2], ARGV[2], id)
        local count = redis.call('HINCRBY', KEYS[4], id, 1)
        table.insert(claimed, id)
        table.insert(claimed, envelope)
        table.insert(claimed, tostring(count))
    end
end
return claimed
"#;

/// Redis-backed queue.
///
/// Layout under the configured prefix: `:ready` (list of ids), `:leases`
/// (sorted set scored by lease deadline), `:messages` (hash id → envelope),
/// `:receives` (hash id → receive count) and `:dead` (list of dead letters).
pub struct RedisJobQueue {
    client: redis::Client,
    ready_key: String,
    leases_key: String,
    messages_key: String,
    receives_key: String,
    dead_key: String,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl RedisJobQueue {
    pub fn new(redis_url: &str, name: &str, visibility_timeout: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            ready_key: format!("{name}:ready"),
            leases_key: format!("{name}:leases"),
            messages_key: format!("{name}:messages"),
            receives_key: format!("{name}:receives"),
            dead_key: format!("{name}:dead"),
            visibility_timeout,
            poll_interval: Duration::from_millis(250),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    async fn reclaim_expired(&self, conn: &mut redis::aio::MultiplexedConnection) -> Result<u64, QueueError> {
        let reclaimed: u64 = redis::Script::new(RECLAIM_SCRIPT)
            .key(&self.leases_key)
            .key(&self.ready_key)
            .key(&self.messages_key)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(conn)
            .await
            .map_err(QueueError::Redis)?;
        if reclaimed > 0 {
            tracing::debug!(reclaimed, "Expired leases returned to the queue");
        }
        Ok(reclaimed)
    }

    async fn claim(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let lease_deadline = Utc::now().timestamp_millis() + self.visibility_timeout.as_millis() as i64;
        let flat: Vec<String> = redis::Script::new(CLAIM_SCRIPT)
            .key(&self.ready_key)
            .key(&self.leases_key)
            .key(&self.messages_key)
            .key(&self.receives_key)
            .arg(max_messages)
            .arg(lease_deadline)
            .invoke_async(conn)
            .await
            .map_err(QueueError::Redis)?;

        flat.chunks_exact(3)
            .map(|triple| {
                let envelope: Envelope = serde_json::from_str(&triple[1]).map_err(QueueError::Serialize)?;
                Ok(ReceivedMessage {
                    id: triple[0].clone(),
                    body: envelope.body,
                    ack_token: ack_token_for(&triple[0]),
                    receive_count: triple[2].parse().unwrap_or(1),
                    enqueued_at: envelope.enqueued_at,
                })
            })
            .collect()
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn publish(&self, body: &str) -> Result<String, QueueError> {
        let mut conn = self.connection().await?;
        let id = Uuid::new_v4().to_string();
        let envelope = serde_json::to_string(&Envelope {
            body: body.to_string(),
            enqueued_at: Utc::now(),
        })
        .map_err(QueueError::Serialize)?;

        redis::pipe()
            .atomic()
            .hset(&self.messages_key, &id, &envelope)
            .ignore()
            .lpush(&self.ready_key, &id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(id)
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut conn = self.connection().await?;
        let deadline = Instant::now() + wait;

        loop {
            self.reclaim_expired(&mut conn).await?;
            let messages = self.claim(&mut conn, max_messages.max(1)).await?;
            let now = Instant::now();
            if !messages.is_empty() || now >= deadline {
                return Ok(messages);
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn delete(&self, ack_token: &str) -> Result<(), QueueError> {
        let id = message_id_from_token(ack_token)?;
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .hdel(&self.messages_key, id)
            .ignore()
            .hdel(&self.receives_key, id)
            .ignore()
            .zrem(&self.leases_key, id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn dead_letter(&self, message: &ReceivedMessage, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let entry = serde_json::to_string(&DeadLetter {
            id: message.id.clone(),
            body: message.body.clone(),
            reason: reason.to_string(),
            receive_count: message.receive_count,
            dead_lettered_at: Utc::now(),
        })
        .map_err(QueueError::Serialize)?;

        redis::pipe()
            .atomic()
            .lpush(&self.dead_key, &entry)
            .ignore()
            .hdel(&self.messages_key, &message.id)
            .ignore()
            .hdel(&self.receives_key, &message.id)
            .ignore()
            .zrem(&self.leases_key, &message.id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(&self.ready_key).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Debug)]
struct StoredMessage {
    body: String,
    enqueued_at: DateTime<Utc>,
    receive_count: u32,
    leased_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct MemoryState {
    ready: VecDeque<String>,
    messages: HashMap<String, StoredMessage>,
    dead: Vec<DeadLetter>,
}

impl MemoryState {
    fn reclaim_expired(&mut self, now: Instant) {
        let mut expired: Vec<&String> = Vec::new();
        for (id, message) in &mut self.messages {
            if message.leased_until.is_some_and(|until| until <= now) {
                message.leased_until = None;
                expired.push(id);
            }
        }
        for id in expired {
            self.ready.push_back(id.clone());
        }
    }
}

/// Process-local queue with the same lease semantics as [`RedisJobQueue`].
/// Used for tests and single-process runs.
pub struct InMemoryJobQueue {
    state: Mutex<MemoryState>,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl InMemoryJobQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            visibility_timeout,
            poll_interval: Duration::from_millis(10),
        }
    }

    /// Messages that have not been deleted or dead-lettered, leased or not.
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, max_messages: usize) -> Vec<ReceivedMessage> {
        let now = Instant::now();
        let mut state = self.lock();
        state.reclaim_expired(now);

        let mut claimed = Vec::new();
        while claimed.len() < max_messages.max(1) {
            let Some(id) = state.ready.pop_back() else {
                break;
            };
            let Some(message) = state.messages.get_mut(&id) else {
                continue;
            };
            message.receive_count += 1;
            message.leased_until = Some(now + self.visibility_timeout);
            claimed.push(ReceivedMessage {
                ack_token: ack_token_for(&id),
                body: message.body.clone(),
                receive_count: message.receive_count,
                enqueued_at: message.enqueued_at,
                id,
            });
        }
        claimed
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn publish(&self, body: &str) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let mut state = self.lock();
        state.messages.insert(
            id.clone(),
            StoredMessage {
                body: body.to_string(),
                enqueued_at: Utc::now(),
                receive_count: 0,
                leased_until: None,
            },
        );
        state.ready.push_front(id.clone());
        Ok(id)
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let messages = self.claim(max_messages);
            let now = Instant::now();
            if !messages.is_empty() || now >= deadline {
                return Ok(messages);
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn delete(&self, ack_token: &str) -> Result<(), QueueError> {
        let id = message_id_from_token(ack_token)?;
        let mut state = self.lock();
        state.messages.remove(id);
        state.ready.retain(|ready| ready != id);
        Ok(())
    }

    async fn dead_letter(&self, message: &ReceivedMessage, reason: &str) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.messages.remove(&message.id);
        state.ready.retain(|ready| *ready != message.id);
        state.dead.push(DeadLetter {
            id: message.id.clone(),
            body: message.body.clone(),
            reason: reason.to_string(),
            receive_count: message.receive_count,
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.lock().ready.len() as u64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Malformed ack token: {0}")]
    InvalidAckToken(String),
}
