use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::Result;
use crate::config::{FaultPolicy, RetryConfig};
use crate::dead_letter::ErrorPublisher;
use crate::message::into_batches;
use crate::processor::BatchProcessor;
use crate::sink::RecordSink;
use crate::source::BatchSource;
use crate::tracker::OffsetTracker;

/// Reads from the source topic and processes what it reads one batch at a time, until
/// cancelled or the read path fails.
pub(crate) struct ConsumptionLoop<S, P, C> {
    source: S,
    publisher: Option<P>,
    sink: C,
    retry: RetryConfig,
    fault_policy: FaultPolicy,
    offsets: OffsetTracker,
}

impl<S, P, C> ConsumptionLoop<S, P, C>
where
    S: BatchSource + Sync,
    P: ErrorPublisher + Sync,
    C: RecordSink + Sync,
{
    pub(crate) fn new(
        source: S,
        publisher: Option<P>,
        sink: C,
        retry: RetryConfig,
        fault_policy: FaultPolicy,
    ) -> Self {
        Self {
            source,
            publisher,
            sink,
            retry,
            fault_policy,
            offsets: OffsetTracker::new(),
        }
    }

    /// Runs until `cln_token` is cancelled. A batch that is in flight when the token fires
    /// completes, without committing. Read errors end the loop.
    pub(crate) async fn run(&self, cln_token: CancellationToken) -> Result<()> {
        let processor = BatchProcessor::new(
            &self.source,
            self.publisher.as_ref(),
            &self.sink,
            &self.retry,
            self.fault_policy,
        );

        info!("Consumption loop started");
        loop {
            let messages = tokio::select! {
                biased;
                _ = cln_token.cancelled() => {
                    info!("Cancellation token received, stopping the consumption loop");
                    break;
                }
                read = self.source.read() => read?,
            };

            if messages.is_empty() {
                debug!("No messages received within the read timeout");
                continue;
            }

            for batch in into_batches(messages) {
                processor.process(batch, &self.offsets, &cln_token).await;
            }
        }
        info!("Consumption loop stopped");
        Ok(())
    }
}
