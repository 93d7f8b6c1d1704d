use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::Offset;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSourceConfig {
    /// The list of Kafka brokers to connect to.
    pub brokers: Vec<String>,
    /// The topic to consume products from.
    pub topic: String,
    /// The consumer group to use for the Kafka consumer.
    pub consumer_group: String,
    /// Client id reported to the brokers.
    pub client_id: String,
    /// Start from the earliest offset when the group has no committed offset.
    pub from_beginning: bool,
}

/// A message read from the source topic.
#[derive(Debug, Clone)]
pub struct KafkaMessage {
    /// The topic name.
    pub topic: String,
    /// The user payload.
    pub value: Bytes,
    /// Key of the message
    pub key: Option<String>,
    /// The partition number.
    pub partition: i32,
    /// The offset of the message.
    pub offset: i64,
}

// A context can be used to change the behavior of consumers by adding callbacks
// that will be executed by librdkafka.
struct KafkaContext;

impl ClientContext for KafkaContext {}

impl ConsumerContext for KafkaContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Pre rebalance {:?}", rebalance);
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        info!("Post rebalance {:?}", rebalance);
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        debug!("Committing offsets: {:?}", result);
    }
}

type ProductConsumer = StreamConsumer<KafkaContext>;

enum KafkaActorMessage {
    Read {
        respond_to: oneshot::Sender<Result<Vec<KafkaMessage>>>,
    },
    Commit {
        partition: i32,
        offset: i64,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Seek {
        partition: i32,
        offset: i64,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Heartbeat {
        partition: i32,
        respond_to: oneshot::Sender<Result<()>>,
    },
}

/// Owns the rdkafka consumer. Every operation on the consumer goes through this actor so
/// the consumer has a single writer even though batch processing fans out.
struct KafkaActor {
    consumer: Arc<ProductConsumer>,
    read_timeout: Duration,
    batch_size: usize,
    topic: String,
    /// Next offset the application will be handed, per partition.
    positions: HashMap<i32, i64>,
    handler_rx: mpsc::Receiver<KafkaActorMessage>,
}

impl KafkaActor {
    async fn start(
        config: KafkaSourceConfig,
        batch_size: usize,
        read_timeout: Duration,
        handler_rx: mpsc::Receiver<KafkaActorMessage>,
    ) -> Result<()> {
        let offset_reset = if config.from_beginning {
            "earliest"
        } else {
            "latest"
        };

        let mut client_config = ClientConfig::new();
        // https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
        client_config
            .set("group.id", &config.consumer_group)
            .set("client.id", &config.client_id)
            .set("bootstrap.servers", config.brokers.join(","))
            .set("enable.partition.eof", "false")
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "10000")
            .set("auto.offset.reset", offset_reset)
            .set_log_level(RDKafkaLogLevel::Warning);

        let consumer: Arc<ProductConsumer> = Arc::new(
            client_config
                .create_with_context(KafkaContext)
                .map_err(|err| Error::Connection {
                    server: config.brokers.join(","),
                    error: err.to_string(),
                })?,
        );

        // Subscribing never fails on unreachable brokers, so probe the cluster first.
        let probe = Arc::clone(&consumer);
        let topic = config.topic.clone();
        tokio::task::spawn_blocking(move || {
            probe
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map(|_| ())
        })
        .await
        .map_err(|e| Error::Other(format!("Tokio task join error: {e}")))?
        .map_err(|err| Error::Connection {
            server: config.brokers.join(","),
            error: err.to_string(),
        })?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|err| Error::Kafka(format!("Failed to subscribe to topic: {err}")))?;

        let actor = KafkaActor {
            consumer,
            read_timeout,
            batch_size,
            topic: config.topic,
            positions: HashMap::new(),
            handler_rx,
        };

        tokio::spawn(async move {
            info!(topic = %actor.topic, "Starting Kafka consumer...");
            // terminates when every KafkaSource handle is dropped
            actor.run().await;
        });

        Ok(())
    }

    async fn run(mut self) {
        while let Some(msg) = self.handler_rx.recv().await {
            self.handle_message(msg).await;
        }
    }

    async fn handle_message(&mut self, msg: KafkaActorMessage) {
        match msg {
            KafkaActorMessage::Read { respond_to } => {
                let messages = self.read_messages().await;
                if respond_to.send(messages).is_err() {
                    error!("Receiver dropped before Kafka read completed");
                }
            }
            KafkaActorMessage::Commit {
                partition,
                offset,
                respond_to,
            } => {
                let status = self.commit(partition, offset).await;
                if respond_to.send(status).is_err() {
                    error!("Receiver dropped before Kafka commit completed");
                }
            }
            KafkaActorMessage::Seek {
                partition,
                offset,
                respond_to,
            } => {
                let status = self.seek(partition, offset).await;
                if respond_to.send(status).is_err() {
                    error!("Receiver dropped before Kafka seek completed");
                }
            }
            KafkaActorMessage::Heartbeat {
                partition,
                respond_to,
            } => {
                let status = self.heartbeat(partition);
                if respond_to.send(status).is_err() {
                    error!("Receiver dropped before Kafka heartbeat completed");
                }
            }
        }
    }

    async fn read_messages(&mut self) -> Result<Vec<KafkaMessage>> {
        let mut messages: Vec<KafkaMessage> = vec![];
        let timeout = tokio::time::sleep(self.read_timeout);
        tokio::pin!(timeout);

        // A successful read resets the failure count.
        const MAX_FAILURE_COUNT: usize = 10;
        let mut continuous_failure_count = 0;
        loop {
            if messages.len() >= self.batch_size {
                break;
            }
            tokio::select! {
                biased;

                _ = &mut timeout => {
                    break;
                }

                message = self.consumer.recv() => {
                    let message = match message {
                        Ok(msg) => {
                            continuous_failure_count = 0;
                            msg
                        }
                        Err(e) => {
                            continuous_failure_count += 1;
                            if continuous_failure_count > MAX_FAILURE_COUNT {
                                return Err(Error::Kafka(format!(
                                    "Failed to read messages after {MAX_FAILURE_COUNT} retries: {e:?}"
                                )));
                            }
                            error!(?e, "Failed to read messages, will retry after 100 milliseconds");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    let value = match message.payload() {
                        Some(payload) => Bytes::copy_from_slice(payload),
                        // tombstones carry no payload
                        None => Bytes::new(),
                    };

                    self.positions.insert(message.partition(), message.offset() + 1);

                    messages.push(KafkaMessage {
                        topic: message.topic().to_string(),
                        value,
                        key: message.key().map(|k| String::from_utf8_lossy(k).to_string()),
                        partition: message.partition(),
                        offset: message.offset(),
                    });
                }
            }
        }
        debug!(msg_count = messages.len(), "Read messages from Kafka");
        Ok(messages)
    }

    async fn commit(&mut self, partition: i32, offset: i64) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        // Kafka stores the position of the next message to read, hence offset + 1.
        tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset + 1))
            .map_err(|e| Error::Kafka(format!("Failed to add partition offset: {e}")))?;

        // commit with CommitMode::Sync blocks on the broker round trip
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || {
            consumer
                .commit(&tpl, CommitMode::Sync)
                .map_err(|e| Error::Kafka(format!("Failed to commit offsets: {e}")))
        })
        .await
        .map_err(|e| Error::Kafka(format!("Waiting for commit task to complete: {e:?}")))?
    }

    /// Moves the fetch position of `partition` to `offset`. The position only ever moves
    /// forward: messages up to the current position were already handed to the application,
    /// rewinding would deliver them a second time.
    async fn seek(&mut self, partition: i32, offset: i64) -> Result<()> {
        let current = self.positions.get(&partition).copied();
        if let Some(position) = current.filter(|position| *position >= offset) {
            debug!(
                partition,
                offset, position, "Fetch position already past the seek target"
            );
            return Ok(());
        }

        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        tokio::task::spawn_blocking(move || {
            consumer
                .seek(&topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
                .map_err(|e| Error::Kafka(format!("Failed to seek partition {partition}: {e}")))
        })
        .await
        .map_err(|e| Error::Kafka(format!("Waiting for seek task to complete: {e:?}")))??;

        self.positions.insert(partition, offset);
        Ok(())
    }

    /// librdkafka heartbeats the group coordinator from its own thread as long as the
    /// application keeps polling. What is left to check here is that the partition we just
    /// processed is still assigned to this member.
    fn heartbeat(&self, partition: i32) -> Result<()> {
        let assignment = self
            .consumer
            .assignment()
            .map_err(|e| Error::Kafka(format!("Failed to fetch assignment: {e}")))?;

        let assigned = assignment
            .elements_for_topic(&self.topic)
            .iter()
            .any(|elem| elem.partition() == partition);
        if !assigned {
            warn!(partition, "Partition is no longer assigned to this consumer");
            return Err(Error::Kafka(format!(
                "partition {partition} of {} is not assigned",
                self.topic
            )));
        }
        Ok(())
    }
}

/// Handle to the consumer actor.
#[derive(Clone)]
pub struct KafkaSource {
    actor_tx: mpsc::Sender<KafkaActorMessage>,
}

impl KafkaSource {
    pub async fn connect(
        config: KafkaSourceConfig,
        batch_size: usize,
        read_timeout: Duration,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(10);
        KafkaActor::start(config, batch_size, read_timeout, rx).await?;
        Ok(Self { actor_tx: tx })
    }

    async fn call<T>(
        &self,
        msg: KafkaActorMessage,
        rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        self.actor_tx
            .send(msg)
            .await
            .map_err(|_| Error::Other("Actor task terminated".into()))?;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))?
    }

    pub async fn read_messages(&self) -> Result<Vec<KafkaMessage>> {
        let (tx, rx) = oneshot::channel();
        self.call(KafkaActorMessage::Read { respond_to: tx }, rx)
            .await
    }

    /// Commits `offset` as the last consumed message of `partition`.
    pub async fn commit(&self, partition: i32, offset: i64) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Commit {
            partition,
            offset,
            respond_to: tx,
        };
        self.call(msg, rx).await
    }

    pub async fn seek(&self, partition: i32, offset: i64) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Seek {
            partition,
            offset,
            respond_to: tx,
        };
        self.call(msg, rx).await
    }

    pub async fn heartbeat(&self, partition: i32) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let msg = KafkaActorMessage::Heartbeat {
            partition,
            respond_to: tx,
        };
        self.call(msg, rx).await
    }
}

/// Expose helpers so that the core crate doesn't have to depend on rdkafka for its tests.
#[cfg(feature = "kafka-tests-utils")]
pub mod test_utils {
    use super::*;
    use rdkafka::producer::{FutureProducer, FutureRecord};

    pub async fn setup_test_topic() -> (FutureProducer, String) {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .create()
            .expect("Failed to create producer");

        let topic_name = format!(
            "product_source_test_topic_{}",
            uuid::Uuid::new_v4().to_string().replace("-", "")
        );

        let admin_client = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .create::<rdkafka::admin::AdminClient<_>>()
            .expect("Failed to create admin client");

        let topic_config = rdkafka::admin::NewTopic::new(
            topic_name.as_str(),
            1,
            rdkafka::admin::TopicReplication::Fixed(1),
        );
        let _ = admin_client
            .create_topics(&[topic_config], &rdkafka::admin::AdminOptions::new())
            .await
            .expect("Failed to create topic");

        (producer, topic_name)
    }

    pub async fn produce_test_messages(producer: &FutureProducer, topic: &str, count: usize) {
        for i in 0..count {
            let payload = format!(r#"{{"name":"product {i}"}}"#);
            let key = format!("key {i}");
            let record = FutureRecord::to(topic).payload(&payload).key(&key);
            producer
                .send(record, Duration::from_secs(5))
                .await
                .expect("Failed to send message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(all(feature = "kafka-tests", feature = "kafka-tests-utils"))]
    #[tokio::test]
    async fn test_read_commit_and_seek() {
        let (producer, topic_name) = test_utils::setup_test_topic().await;
        test_utils::produce_test_messages(&producer, &topic_name, 20).await;

        let config = KafkaSourceConfig {
            brokers: vec!["localhost:9092".to_string()],
            topic: topic_name.clone(),
            consumer_group: format!("product_test_group_{topic_name}"),
            client_id: "product-consumer-test".to_string(),
            from_beginning: true,
        };

        let source = KafkaSource::connect(config, 10, Duration::from_secs(5))
            .await
            .expect("Failed to connect to Kafka");

        let messages = source
            .read_messages()
            .await
            .expect("Failed to read messages");
        assert_eq!(messages.len(), 10);
        assert_eq!(messages[0].offset, 0);
        assert_eq!(messages[9].offset, 9);
        assert_eq!(messages[0].value, Bytes::from(r#"{"name":"product 0"}"#));

        let partition = messages[0].partition;
        source
            .commit(partition, 9)
            .await
            .expect("Failed to commit offsets");
        source
            .heartbeat(partition)
            .await
            .expect("Partition should still be assigned");

        // seeking behind the fetch position must not rewind the consumer
        source
            .seek(partition, 5)
            .await
            .expect("Failed to seek partition");

        let messages = source
            .read_messages()
            .await
            .expect("Failed to read messages");
        assert_eq!(messages.len(), 10);
        assert_eq!(messages[0].offset, 10);
    }

    #[cfg(feature = "kafka-tests")]
    #[tokio::test]
    async fn test_connect_unreachable_broker() {
        let config = KafkaSourceConfig {
            brokers: vec!["localhost:1".to_string()],
            topic: "product".to_string(),
            consumer_group: "product-creator".to_string(),
            client_id: "product-consumer-test".to_string(),
            from_beginning: false,
        };

        let result = KafkaSource::connect(config, 10, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::Connection { .. })));
    }
}
