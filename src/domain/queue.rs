use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Identifier of a logical queue (a worker pool, a cluster key...).
///
/// Anything comparable and serializable qualifies.
pub trait QueueKey:
    Serialize + DeserializeOwned + Clone + Eq + Debug + Send + Sync + 'static
{
}

impl<T> QueueKey for T where
    T: Serialize + DeserializeOwned + Clone + Eq + Debug + Send + Sync + 'static
{
}

/// Opaque task payload. Only its position in the queue matters.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Encode a queue id or task into the string form kept in the store.
pub fn encode<V: Serialize + ?Sized>(value: &V) -> Result<String, serde_json::Error> {
    serde_json::to_string(value)
}

pub fn decode<V: DeserializeOwned>(raw: &str) -> Result<V, serde_json::Error> {
    serde_json::from_str(raw)
}
