//! Mapping of Redis and pool failures onto store errors.

use crate::ports::StoreError;
use deadpool_redis::redis::ErrorKind;
use deadpool_redis::CreatePoolError;

pub type RedisError = deadpool_redis::redis::RedisError;
pub type PoolError = deadpool_redis::PoolError;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        match err.kind() {
            ErrorKind::TypeError => StoreError::Protocol(err.to_string()),
            _ => StoreError::Unavailable(format!("redis: {}", err)),
        }
    }
}

impl From<PoolError> for StoreError {
    fn from(err: PoolError) -> Self {
        StoreError::Unavailable(format!("pool: {}", err))
    }
}

impl From<CreatePoolError> for StoreError {
    fn from(err: CreatePoolError) -> Self {
        StoreError::Unavailable(format!("create pool: {}", err))
    }
}
