use bytes::Bytes;
use product_consumer_kafka::source::KafkaMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Error text of the envelope published when a message runs out of attempts.
pub(crate) const EXCEEDED_MAX_RETRIES: &str = "Exceeded max retries";

/// A product message read from the source topic.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Message {
    pub(crate) topic: String,
    pub(crate) partition: i32,
    /// Position of the message in its partition, the source of truth for resumption.
    pub(crate) offset: i64,
    /// The encoded product.
    pub(crate) value: Bytes,
}

impl Message {
    /// Decodes the payload into the product record. The record is not validated beyond
    /// being JSON.
    pub(crate) fn decode(&self) -> Result<Value> {
        serde_json::from_slice(&self.value).map_err(|e| {
            Error::Decode(format!(
                "parsing product at {}/{}@{}: {e}",
                self.topic, self.partition, self.offset
            ))
        })
    }

    /// The raw payload as text, for diagnostics.
    pub(crate) fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

impl From<KafkaMessage> for Message {
    fn from(message: KafkaMessage) -> Self {
        Self {
            topic: message.topic,
            partition: message.partition,
            offset: message.offset,
            value: message.value,
        }
    }
}

/// Messages of a single partition, in offset order, processed together.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Batch {
    pub(crate) partition: i32,
    pub(crate) messages: Vec<Message>,
}

/// Splits a read into one [Batch] per partition. Partitions keep the order in which they
/// first appear in the read, and messages keep their order within a partition.
pub(crate) fn into_batches(messages: Vec<Message>) -> Vec<Batch> {
    let mut batches: Vec<Batch> = Vec::new();
    for message in messages {
        match batches
            .iter_mut()
            .find(|batch| batch.partition == message.partition)
        {
            Some(batch) => batch.messages.push(message),
            None => batches.push(Batch {
                partition: message.partition,
                messages: vec![message],
            }),
        }
    }
    batches
}

/// Wire shape of everything published to the error topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub(crate) error: String,
    pub(crate) message: String,
}

impl ErrorEnvelope {
    /// Envelope for a message that failed every attempt, carrying the JSON encoded record.
    pub(crate) fn exhausted(record: &Value) -> Self {
        Self {
            error: EXCEEDED_MAX_RETRIES.to_string(),
            message: record.to_string(),
        }
    }

    /// Envelope for a message that faulted, carrying the raw payload.
    pub(crate) fn fault(error: impl Into<String>, payload: String) -> Self {
        Self {
            error: error.into(),
            message: payload,
        }
    }

    pub(crate) fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::DeadLetter(format!("encoding error envelope: {e}")))
    }
}
