use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Direction};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use uuid::Uuid;

/// The two work queues: uploads waiting to be stored, and stored images
/// waiting to be classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum QueueName {
    Ingest,
    Analyze,
}

impl QueueName {
    pub fn key(self) -> &'static str {
        match self {
            QueueName::Ingest => "pic_analyzer:ingest",
            QueueName::Analyze => "pic_analyzer:analyze",
        }
    }

    pub fn processing_key(self) -> &'static str {
        match self {
            QueueName::Ingest => "pic_analyzer:ingest:processing",
            QueueName::Analyze => "pic_analyzer:analyze:processing",
        }
    }
}

/// A validated upload staged on local disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestTask {
    pub temp_path: String,
    pub original_name: String,
    /// Storage key chosen at submission; a redelivered message reuses it.
    pub image_key: String,
    pub user_id: i64,
    pub model_name: String,
    pub use_category: bool,
}

/// A stored image ready for classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeTask {
    pub job_id: Uuid,
    /// Run of the job this message was queued for.
    pub run_id: Uuid,
    pub image_url: String,
    pub model_name: String,
    pub use_category: bool,
}

/// Message payload serialized into Redis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskMessage {
    IngestImage(IngestTask),
    AnalyzeImage(AnalyzeTask),
}

impl TaskMessage {
    pub fn queue(&self) -> QueueName {
        match self {
            TaskMessage::IngestImage(_) => QueueName::Ingest,
            TaskMessage::AnalyzeImage(_) => QueueName::Analyze,
        }
    }
}

/// A received message, held in the processing list until acked.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub queue: QueueName,
    pub message: TaskMessage,
    /// Raw payload as stored, needed to remove it from the processing list.
    pub payload: String,
}

/// At-least-once work queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, message: &TaskMessage) -> Result<(), QueueError>;

    /// Wait up to `timeout` for the next message on `queue`.
    async fn receive(&self, queue: QueueName, timeout: Duration)
        -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Push everything left in the processing list back onto the queue.
    /// Returns the number of messages moved.
    async fn requeue_in_flight(&self, queue: QueueName) -> Result<u64, QueueError>;

    async fn depth(&self, queue: QueueName) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Redis list queue. Producers LPUSH, consumers BLMOVE the tail into a
/// processing list and LREM it on ack.
pub struct RedisQueue {
    client: redis::Client,
}

impl RedisQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn enqueue(&self, message: &TaskMessage) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(message).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(message.queue().key(), &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn receive(
        &self,
        queue: QueueName,
        timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn
            .blmove(
                queue.key(),
                queue.processing_key(),
                Direction::Right,
                Direction::Left,
                timeout.as_secs_f64(),
            )
            .await
            .map_err(QueueError::Redis)?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        match serde_json::from_str::<TaskMessage>(&payload) {
            Ok(message) => Ok(Some(Delivery {
                queue,
                message,
                payload,
            })),
            Err(e) => {
                // drop it, otherwise every restart would redeliver it
                conn.lrem::<_, _, ()>(queue.processing_key(), 1, &payload)
                    .await
                    .map_err(QueueError::Redis)?;
                Err(QueueError::Malformed {
                    queue,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.lrem::<_, _, ()>(delivery.queue.processing_key(), 1, &delivery.payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn requeue_in_flight(&self, queue: QueueName) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let mut moved = 0;
        loop {
            let payload: Option<String> = conn
                .lmove(
                    queue.processing_key(),
                    queue.key(),
                    Direction::Right,
                    Direction::Right,
                )
                .await
                .map_err(QueueError::Redis)?;
            if payload.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }

    async fn depth(&self, queue: QueueName) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(queue.key()).await.map_err(QueueError::Redis)?;
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

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Malformed message dropped from {queue}: {reason}")]
    Malformed { queue: QueueName, reason: String },
}
