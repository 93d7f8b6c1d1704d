use product_consumer_kafka::source::{KafkaSource, KafkaSourceConfig};

use crate::Result;
use crate::config::KafkaConfig;
use crate::message::Message;
use crate::source::BatchSource;

impl From<&KafkaConfig> for KafkaSourceConfig {
    fn from(config: &KafkaConfig) -> Self {
        KafkaSourceConfig {
            brokers: config.brokers.clone(),
            topic: config.topic.clone(),
            consumer_group: config.consumer_group.clone(),
            client_id: config.client_id.clone(),
            from_beginning: config.from_beginning,
        }
    }
}

/// Connects the consumer and subscribes to the source topic.
pub(crate) async fn connect(config: &KafkaConfig) -> Result<KafkaSource> {
    let source =
        KafkaSource::connect(config.into(), config.batch_size, config.read_timeout).await?;
    Ok(source)
}

impl BatchSource for KafkaSource {
    async fn read(&self) -> Result<Vec<Message>> {
        let messages = self.read_messages().await?;
        Ok(messages.into_iter().map(Message::from).collect())
    }

    async fn commit(&self, partition: i32, offset: i64) -> Result<()> {
        Ok(KafkaSource::commit(self, partition, offset).await?)
    }

    async fn seek(&self, partition: i32, offset: i64) -> Result<()> {
        Ok(KafkaSource::seek(self, partition, offset).await?)
    }

    async fn heartbeat(&self, partition: i32) -> Result<()> {
        Ok(KafkaSource::heartbeat(self, partition).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_config_from_settings() {
        let settings = crate::config::Settings::default();
        let source_config = KafkaSourceConfig::from(&settings.kafka);
        assert_eq!(source_config.brokers.len(), 3);
        assert_eq!(source_config.topic, "product");
        assert_eq!(source_config.consumer_group, "product-creator");
        assert_eq!(source_config.client_id, "product-consumer");
        assert!(!source_config.from_beginning);
    }

    #[cfg(feature = "kafka-tests")]
    #[tokio::test]
    async fn test_connect_fails_without_broker() {
        let mut settings = crate::config::Settings::default();
        settings.kafka.brokers = vec!["localhost:1".to_string()];
        let result = connect(&settings.kafka).await;
        assert!(matches!(result, Err(crate::Error::Connection(_))));
    }
}
