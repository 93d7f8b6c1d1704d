use bytes::Bytes;
use product_consumer_kafka::sink::{KafkaSink, KafkaSinkConfig, new_sink};
use tracing::info;

use crate::config::KafkaConfig;
use crate::dead_letter::ErrorPublisher;
use crate::{Error, Result};

/// Creates the error topic producer, or `None` when no error topic is configured.
pub(crate) fn connect(config: &KafkaConfig) -> Result<Option<KafkaSink>> {
    let Some(topic) = &config.error_topic else {
        info!("No error topic configured, dead-letter publishing is disabled");
        return Ok(None);
    };

    let sink = new_sink(KafkaSinkConfig {
        brokers: config.brokers.clone(),
        topic: topic.clone(),
        client_id: config.client_id.clone(),
    })?;
    info!(topic = sink.topic(), "Error topic producer created");
    Ok(Some(sink))
}

impl ErrorPublisher for KafkaSink {
    async fn publish(&self, payload: Bytes) -> Result<()> {
        self.send(payload)
            .await
            .map_err(|e| Error::DeadLetter(format!("publishing to {}: {e}", self.topic())))
    }
}
