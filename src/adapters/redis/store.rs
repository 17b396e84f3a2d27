//! Redis QueueStore implementation.

use super::Keys;
use crate::config::RedisConfig;
use crate::ports::{Popped, QueueStore, StoreError};
use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands, Client};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;

/// Redis-backed store. Commands go through a connection pool; every
/// subscription opens its own pub/sub connection.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    client: Client,
    keys: Keys,
}

impl RedisStore {
    /// Create a new RedisStore with connection pool.
    pub fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        let pool = Config::from_url(&config.redis_url).create_pool(Some(Runtime::Tokio1))?;
        let client = Client::open(config.redis_url.as_str())?;
        Ok(Self {
            pool,
            client,
            keys: Keys::new(&config.namespace),
        })
    }

    async fn conn(&self) -> Result<Connection, StoreError> {
        Ok(self.pool.get().await?)
    }

    /// WATCH `key` and report whether it exists. When it does, the watch is
    /// released before returning.
    async fn watch_absent(conn: &mut Connection, key: &str) -> Result<bool, StoreError> {
        let _: () = redis::cmd("WATCH").arg(key).query_async(conn).await?;
        let exists: bool = conn.exists(key).await?;
        if exists {
            let _: () = redis::cmd("UNWATCH").query_async(conn).await?;
        }
        Ok(!exists)
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn push_existing(
        &self,
        queue: &str,
        item: &str,
        front: bool,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let key = self.keys.queue(queue);
        let len: i64 = if front {
            conn.lpush_exists(&key, item).await?
        } else {
            conn.rpush_exists(&key, item).await?
        };
        Ok(len > 0)
    }

    async fn create_and_push(
        &self,
        queue: &str,
        item: &str,
        front: bool,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let key = self.keys.queue(queue);
        if !Self::watch_absent(&mut conn, &key).await? {
            return Ok(false);
        }

        let mut tx = redis::pipe();
        tx.atomic().sadd(&self.keys.index, queue);
        if front {
            tx.lpush(&key, item);
        } else {
            tx.rpush(&key, item);
        }
        // EXEC answers nil when the watched key changed underneath us.
        let applied: Option<(i64, i64)> = tx.query_async(&mut conn).await?;
        Ok(applied.is_some())
    }

    async fn pop(&self, queue: &str) -> Result<Popped, StoreError> {
        let mut conn = self.conn().await?;
        let key = self.keys.queue(queue);
        let (item, remaining): (Option<String>, u64) = redis::pipe()
            .atomic()
            .lpop(&key, None)
            .llen(&key)
            .query_async(&mut conn)
            .await?;
        Ok(Popped { item, remaining })
    }

    async fn remove_if_empty(&self, queue: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let key = self.keys.queue(queue);
        if !Self::watch_absent(&mut conn, &key).await? {
            return Ok(false);
        }

        let applied: Option<Vec<i64>> = redis::pipe()
            .atomic()
            .srem(&self.keys.index, queue)
            .query_async(&mut conn)
            .await?;
        Ok(applied.is_some())
    }

    async fn queues(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(conn.smembers(&self.keys.index).await?)
    }

    async fn len(&self, queue: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        Ok(conn.llen(self.keys.queue(queue)).await?)
    }

    async fn touch(&self, queue: &str, at_millis: i64) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.hset::<_, _, _, ()>(&self.keys.active, queue, at_millis)
            .await?;
        Ok(())
    }

    async fn heartbeats(&self) -> Result<HashMap<String, i64>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(conn.hgetall(&self.keys.active).await?)
    }

    async fn forget(&self, queues: &[String]) -> Result<(), StoreError> {
        if queues.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        conn.hdel::<_, _, ()>(&self.keys.active, queues).await?;
        Ok(())
    }

    async fn publish_new_queue(&self, queue: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.publish::<_, _, ()>(&self.keys.channel, queue).await?;
        Ok(())
    }

    async fn subscribe_new_queues(
        &self,
    ) -> Result<BoxStream<'static, Result<String, StoreError>>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.keys.channel).await?;
        let messages = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload::<String>().map_err(StoreError::from));
        Ok(messages.boxed())
    }
}
