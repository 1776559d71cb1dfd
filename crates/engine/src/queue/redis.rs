use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use redis::Script;
use redis::aio::ConnectionManager;

use herald_common::error::AppError;
use herald_common::types::{Priority, QueueEntry};

use super::{QueueDepth, WorkQueue};

/// Maximum delayed entries moved into a lane per dequeue.
const PROMOTE_BATCH: usize = 100;

/// Promote due delayed entries, then pop by weighted round-robin.
///
/// KEYS: high lane, normal lane, delayed high, delayed normal, streak counter
/// ARGV: now (ms), high weight, promote batch
const DEQUEUE_SCRIPT: &str = r#"
local function promote(delayed, lane)
    local due = redis.call('ZRANGEBYSCORE', delayed, '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[3]))
    for _, member in ipairs(due) do
        redis.call('ZREM', delayed, member)
        redis.call('RPUSH', lane, member)
    end
end

promote(KEYS[3], KEYS[1])
promote(KEYS[4], KEYS[2])

local streak = tonumber(redis.call('GET', KEYS[5]) or '0')
local weight = tonumber(ARGV[2])
local item

if streak >= weight then
    item = redis.call('LPOP', KEYS[2])
    if item then
        redis.call('SET', KEYS[5], 0)
        return item
    end
end

item = redis.call('LPOP', KEYS[1])
if item then
    redis.call('INCR', KEYS[5])
    return item
end

item = redis.call('LPOP', KEYS[2])
if item then
    redis.call('SET', KEYS[5], 0)
end
return item
"#;

/// Redis-backed queue shared by every worker process.
///
/// Lanes are lists (`RPUSH`/`LPOP`), delayed entries are sorted sets scored by
/// their due time in milliseconds. The dequeue script runs atomically on the
/// server, so the weighted policy and the exactly-once pop hold across
/// processes.
pub struct RedisQueue {
    conn: ConnectionManager,
    keys: Keys,
    high_weight: u32,
    dequeue_script: Script,
}

struct Keys {
    high: String,
    normal: String,
    delayed_high: String,
    delayed_normal: String,
    streak: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        Self {
            high: format!("{}:queue:high", prefix),
            normal: format!("{}:queue:normal", prefix),
            delayed_high: format!("{}:queue:delayed:high", prefix),
            delayed_normal: format!("{}:queue:delayed:normal", prefix),
            streak: format!("{}:queue:high_streak", prefix),
        }
    }

    fn lane(&self, priority: Priority) -> &str {
        match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
        }
    }

    fn delayed(&self, priority: Priority) -> &str {
        match priority {
            Priority::High => &self.delayed_high,
            Priority::Normal => &self.delayed_normal,
        }
    }
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager, key_prefix: &str, high_weight: u32) -> Self {
        Self {
            conn,
            keys: Keys::new(key_prefix),
            high_weight: high_weight.max(1),
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
        }
    }
}

#[async_trait]
impl WorkQueue for RedisQueue {
    async fn enqueue(&self, entry: &QueueEntry) -> Result<(), AppError> {
        let member = serde_json::to_string(entry)?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(self.keys.lane(entry.priority), member)
            .await?;
        Ok(())
    }

    async fn enqueue_delayed(&self, entry: &QueueEntry, delay: Duration) -> Result<(), AppError> {
        let member = serde_json::to_string(entry)?;
        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(self.keys.delayed(entry.priority), member, due_ms)
            .await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<QueueEntry>, AppError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = self
            .dequeue_script
            .key(&self.keys.high)
            .key(&self.keys.normal)
            .key(&self.keys.delayed_high)
            .key(&self.keys.delayed_normal)
            .key(&self.keys.streak)
            .arg(Utc::now().timestamp_millis())
            .arg(self.high_weight)
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn depth(&self) -> Result<QueueDepth, AppError> {
        let mut conn = self.conn.clone();
        let (high, normal, delayed_high, delayed_normal): (u64, u64, u64, u64) = redis::pipe()
            .cmd("LLEN")
            .arg(&self.keys.high)
            .cmd("LLEN")
            .arg(&self.keys.normal)
            .cmd("ZCARD")
            .arg(&self.keys.delayed_high)
            .cmd("ZCARD")
            .arg(&self.keys.delayed_normal)
            .query_async(&mut conn)
            .await?;

        Ok(QueueDepth {
            high,
            normal,
            delayed: delayed_high + delayed_normal,
        })
    }

    async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
