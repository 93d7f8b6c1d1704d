use crate::Result;
use crate::message::Message;

/// Consumer side of the source topic, backed by [product_consumer_kafka::source::KafkaSource].
pub(crate) mod kafka;

/// Inbound connection. Offsets passed to `commit` are the last consumed offset; the
/// implementation translates to the broker's next-position convention.
#[trait_variant::make(BatchSource: Send)]
#[allow(dead_code)]
pub(crate) trait LocalBatchSource {
    /// Reads the next chunk of messages, possibly spanning several partitions. An empty read
    /// means nothing arrived within the read timeout.
    async fn read(&self) -> Result<Vec<Message>>;

    async fn commit(&self, partition: i32, offset: i64) -> Result<()>;

    /// Moves the read cursor of the partition so that `offset` is the next message read.
    /// The Kafka implementation only moves forward: a target at or behind the position of
    /// messages already handed out is a no-op, so no real reposition happens after a
    /// dead-lettered message of the current batch.
    async fn seek(&self, partition: i32, offset: i64) -> Result<()>;

    /// Liveness signal to the group coordinator after a batch.
    async fn heartbeat(&self, partition: i32) -> Result<()>;
}
