use std::time::Duration;

use bytes::Bytes;
use rdkafka::{
    ClientConfig,
    config::RDKafkaLogLevel,
    producer::{FutureProducer, FutureRecord, Producer},
};

use crate::{Error, Result};

const SEND_QUEUE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSinkConfig {
    pub brokers: Vec<String>,
    /// The error topic envelopes are published to.
    pub topic: String,
    /// Client id reported to the brokers.
    pub client_id: String,
}

/// Idempotent producer for the error topic. Cloning is cheap, all clones share the
/// same librdkafka handle.
#[derive(Clone)]
pub struct KafkaSink {
    topic: String,
    producer: FutureProducer,
}

pub fn new_sink(config: KafkaSinkConfig) -> Result<KafkaSink> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.brokers.join(","))
        .set("client.id", &config.client_id)
        // wait for all in-sync replicas, and let the broker drop duplicate retries
        .set("acks", "all")
        .set("enable.idempotence", "true")
        .set("message.timeout.ms", "5000")
        .set_log_level(RDKafkaLogLevel::Warning);

    let producer: FutureProducer = client_config.create().map_err(|e| Error::Connection {
        server: config.brokers.join(","),
        error: format!("Failed to create producer: {e}"),
    })?;

    Ok(KafkaSink {
        producer,
        topic: config.topic,
    })
}

impl KafkaSink {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publishes a single payload and waits for the delivery report.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        let record: FutureRecord<'_, (), _> = FutureRecord::to(&self.topic).payload(payload.as_ref());
        match self.producer.send(record, SEND_QUEUE_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err((e, _)) => {
                tracing::error!(?e, topic = %self.topic, "Sending payload to Kafka topic");
                Err(Error::Kafka(format!("Sending payload to kafka: {e:?}")))
            }
        }
    }

    /// Waits for in-flight deliveries, used on shutdown.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        self.producer
            .flush(timeout)
            .map_err(|e| Error::Kafka(format!("Flushing producer: {e}")))
    }
}
