use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("store connect failed: {0}")]
    Connect(String),

    #[error("store command failed: {0}")]
    Command(String),

    #[error("store response malformed: {0}")]
    Malformed(String),
}

impl From<redis::RedisError> for KvError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_timeout() || e.is_connection_dropped() {
            KvError::Connect(e.to_string())
        } else {
            KvError::Command(e.to_string())
        }
    }
}
