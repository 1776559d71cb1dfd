use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;

use herald_common::config::BucketLimits;
use herald_common::error::AppError;

use super::BucketStore;

/// Refill-then-take on a bucket hash, mirroring `TokenBucket`.
///
/// KEYS: bucket hash
/// ARGV: capacity, refill per second, floor, now (ms), idle ttl (s)
/// Returns 1 when a token was taken, 0 otherwise.
const TAKE_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local floor = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill_ms')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
    tokens = capacity
    last = now
end

local elapsed = math.max(0, now - last)
tokens = math.min(capacity, tokens + elapsed / 1000 * rate)
last = math.max(last, now)

local granted = 0
if tokens - 1 >= floor then
    tokens = tokens - 1
    granted = 1
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'last_refill_ms', tostring(last))
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[5]))
return granted
"#;

/// Buckets shared by every worker process through Redis.
///
/// Idle buckets expire once they would have refilled completely, since a
/// missing bucket is recreated full anyway.
pub struct RedisBucketStore {
    conn: ConnectionManager,
    key_prefix: String,
    take_script: Script,
}

impl RedisBucketStore {
    pub fn new(conn: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.to_string(),
            take_script: Script::new(TAKE_SCRIPT),
        }
    }

    fn bucket_key(&self, channel_target: &str) -> String {
        format!("{}:ratelimit:{}", self.key_prefix, channel_target)
    }
}

/// Seconds for an empty bucket to refill completely, plus a minute of slack.
fn idle_ttl_secs(limits: BucketLimits) -> u64 {
    if limits.refill_per_sec <= 0.0 {
        return 86_400;
    }
    (limits.capacity / limits.refill_per_sec).ceil() as u64 + 60
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn try_take(
        &self,
        channel_target: &str,
        limits: BucketLimits,
        floor: f64,
        now_ms: i64,
    ) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();
        let granted: i64 = self
            .take_script
            .key(self.bucket_key(channel_target))
            .arg(limits.capacity)
            .arg(limits.refill_per_sec)
            .arg(floor)
            .arg(now_ms)
            .arg(idle_ttl_secs(limits))
            .invoke_async(&mut conn)
            .await?;
        Ok(granted == 1)
    }
}
