//! Dead-letter handling. A message that exhausted its attempts is resolved, published to the
//! error topic and skipped over; a message that faulted is mirrored to the same topic.
//! Failures on this path never escape, each one ends as a [ForwardOutcome].

use bytes::Bytes;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::message::{ErrorEnvelope, Message};
use crate::source::BatchSource;
use crate::tracker::OffsetTracker;
use crate::{Error, Result};

/// Error topic producer, backed by [product_consumer_kafka::sink::KafkaSink].
pub(crate) mod kafka;

/// Outbound connection to the error topic.
#[trait_variant::make(ErrorPublisher: Send)]
#[allow(dead_code)]
pub(crate) trait LocalErrorPublisher {
    async fn publish(&self, payload: Bytes) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ForwardOutcome {
    /// Every step succeeded.
    Forwarded,
    /// No error topic is configured, nothing was published.
    Skipped,
    /// A step failed; the error was logged and discarded.
    Failed(Error),
}

pub(crate) struct DeadLetterForwarder<'a, S, P> {
    source: &'a S,
    publisher: Option<&'a P>,
}

impl<'a, S, P> DeadLetterForwarder<'a, S, P>
where
    S: BatchSource + Sync,
    P: ErrorPublisher + Sync,
{
    pub(crate) fn new(source: &'a S, publisher: Option<&'a P>) -> Self {
        Self { source, publisher }
    }

    /// Resolves the exhausted message, publishes its envelope and moves the partition past
    /// it. A failing step ends the sequence; the offset stays resolved either way.
    pub(crate) async fn handle_exhausted(
        &self,
        offsets: &OffsetTracker,
        message: &Message,
        record: &Value,
    ) -> ForwardOutcome {
        info!(
            partition = message.partition,
            offset = message.offset,
            "Handling message that exceeded max retries"
        );
        offsets.resolve(message.partition, message.offset);

        let result = async {
            match self.publisher {
                Some(publisher) => {
                    publisher
                        .publish(ErrorEnvelope::exhausted(record).to_bytes()?)
                        .await?
                }
                None => warn!(
                    partition = message.partition,
                    offset = message.offset,
                    "No error topic configured, dropping exhausted message"
                ),
            }
            self.source
                .seek(message.partition, message.offset + 1)
                .await
        }
        .await;

        match result {
            Ok(()) => ForwardOutcome::Forwarded,
            Err(e) => {
                error!(
                    ?e,
                    partition = message.partition,
                    offset = message.offset,
                    "Error handling exhausted message"
                );
                ForwardOutcome::Failed(e)
            }
        }
    }

    /// Mirrors a faulted message to the error topic with the fault's description.
    pub(crate) async fn send_error(&self, fault: &Error, message: &Message) -> ForwardOutcome {
        let Some(publisher) = self.publisher else {
            return ForwardOutcome::Skipped;
        };
        warn!(
            ?fault,
            partition = message.partition,
            offset = message.offset,
            "Sending error message to error topic"
        );

        let envelope = ErrorEnvelope::fault(fault.to_string(), message.payload_lossy());
        let result = match envelope.to_bytes() {
            Ok(payload) => publisher.publish(payload).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => ForwardOutcome::Forwarded,
            Err(e) => {
                error!(?e, "Error sending error message");
                ForwardOutcome::Failed(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_utils::{FakePublisher, FakeSource, message};

    #[tokio::test]
    async fn test_exhausted_message_is_resolved_published_and_skipped() {
        let source = FakeSource::default();
        let publisher = FakePublisher::default();
        let forwarder = DeadLetterForwarder::new(&source, Some(&publisher));
        let offsets = OffsetTracker::new();
        let msg = message(2, 17, r#"{"name":"lamp"}"#);
        offsets.track(2, 17);

        let outcome = forwarder
            .handle_exhausted(&offsets, &msg, &json!({"name": "lamp"}))
            .await;

        assert_eq!(outcome, ForwardOutcome::Forwarded);
        assert!(offsets.is_resolved(2, 17));
        assert_eq!(
            publisher.envelopes(),
            vec![ErrorEnvelope {
                error: "Exceeded max retries".to_string(),
                message: r#"{"name":"lamp"}"#.to_string(),
            }]
        );
        assert_eq!(source.seeks(), vec![(2, 18)]);
    }

    #[tokio::test]
    async fn test_publish_failure_is_contained() {
        let source = FakeSource::default();
        let publisher = FakePublisher::failing();
        let forwarder = DeadLetterForwarder::new(&source, Some(&publisher));
        let offsets = OffsetTracker::new();
        let msg = message(0, 3, "{}");

        let outcome = forwarder.handle_exhausted(&offsets, &msg, &json!({})).await;

        assert!(matches!(outcome, ForwardOutcome::Failed(Error::DeadLetter(_))));
        // resolving happens before the publish and is kept
        assert!(offsets.is_resolved(0, 3));
        assert!(source.seeks().is_empty());
    }

    #[tokio::test]
    async fn test_seek_failure_is_contained() {
        let source = FakeSource::default().fail_seeks();
        let publisher = FakePublisher::default();
        let forwarder = DeadLetterForwarder::new(&source, Some(&publisher));
        let offsets = OffsetTracker::new();

        let outcome = forwarder
            .handle_exhausted(&offsets, &message(0, 3, "{}"), &json!({}))
            .await;

        assert!(matches!(outcome, ForwardOutcome::Failed(Error::Source(_))));
        assert_eq!(publisher.envelopes().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_without_error_topic_still_seeks() {
        let source = FakeSource::default();
        let forwarder = DeadLetterForwarder::<_, FakePublisher>::new(&source, None);
        let offsets = OffsetTracker::new();

        let outcome = forwarder
            .handle_exhausted(&offsets, &message(1, 9, "{}"), &json!({}))
            .await;

        assert_eq!(outcome, ForwardOutcome::Forwarded);
        assert_eq!(source.seeks(), vec![(1, 10)]);
    }

    #[tokio::test]
    async fn test_send_error() {
        let source = FakeSource::default();
        let publisher = FakePublisher::default();
        let forwarder = DeadLetterForwarder::new(&source, Some(&publisher));
        let msg = message(0, 5, "{broken");
        let fault = msg.decode().unwrap_err();

        let outcome = forwarder.send_error(&fault, &msg).await;

        assert_eq!(outcome, ForwardOutcome::Forwarded);
        let envelopes = publisher.envelopes();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].error, fault.to_string());
        assert_eq!(envelopes[0].message, "{broken");
        // the error sink never moves the cursor
        assert!(source.seeks().is_empty());

        let forwarder = DeadLetterForwarder::<_, FakePublisher>::new(&source, None);
        assert_eq!(
            forwarder.send_error(&fault, &msg).await,
            ForwardOutcome::Skipped
        );

        let failing = FakePublisher::failing();
        let forwarder = DeadLetterForwarder::new(&source, Some(&failing));
        assert!(matches!(
            forwarder.send_error(&fault, &msg).await,
            ForwardOutcome::Failed(_)
        ));
    }
}
