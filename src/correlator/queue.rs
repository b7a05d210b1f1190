//! Alert queue transport
//!
//! The IDS pushes eve records onto a Redis list; the correlator pops them
//! in batches. The queue is a trait so tests can run against an in-memory
//! double.

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Batch-pop source of alert records.
#[async_trait]
pub trait AlertQueue: Send {
    /// Pop up to `count` records; empty when the queue is drained.
    async fn pop_batch(&mut self, count: usize) -> Result<Vec<String>>;
}

/// Redis list consumer.
pub struct RedisQueue {
    conn: redis::aio::MultiplexedConnection,
    key: String,
}

impl RedisQueue {
    pub async fn connect(url: &str, key: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("failed to parse redis url")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to redis")?;

        Ok(Self {
            conn,
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl AlertQueue for RedisQueue {
    async fn pop_batch(&mut self, count: usize) -> Result<Vec<String>> {
        let lines: Vec<String> = redis::cmd("RPOP")
            .arg(&self.key)
            .arg(count)
            .query_async(&mut self.conn)
            .await
            .context("failed to pop from redis")?;
        Ok(lines)
    }
}

/// In-memory queue for tests.
#[cfg(test)]
pub struct VecQueue {
    pub records: std::collections::VecDeque<String>,
}

#[cfg(test)]
#[async_trait]
impl AlertQueue for VecQueue {
    async fn pop_batch(&mut self, count: usize) -> Result<Vec<String>> {
        let n = count.min(self.records.len());
        Ok(self.records.drain(..n).collect())
    }
}
