//! Drives one [Batch] to completion: every message runs its own retry loop against the
//! [RecordSink], all of them polled together on the current task, followed by a single
//! commit and a heartbeat for the partition.

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::config::{FaultPolicy, RetryConfig};
use crate::dead_letter::{DeadLetterForwarder, ErrorPublisher, ForwardOutcome};
use crate::message::{Batch, Message};
use crate::retry::Backoff;
use crate::sink::{RecordSink, SinkResponse};
use crate::source::BatchSource;
use crate::tracker::OffsetTracker;

/// Terminal state of a single message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MessageOutcome {
    Succeeded,
    /// Every attempt was rejected; carries what became of the dead-letter hand off.
    Exhausted(ForwardOutcome),
    /// Decoding or the sink failed unexpectedly, no further attempts were made.
    Faulted,
    /// A re-delivery of an offset that was already resolved.
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct BatchReport {
    pub(crate) partition: i32,
    pub(crate) succeeded: usize,
    pub(crate) exhausted: usize,
    pub(crate) faulted: usize,
    pub(crate) skipped: usize,
    /// Exhausted messages whose dead-letter hand off failed.
    pub(crate) dead_letter_failed: usize,
    /// Offset committed after the batch, `None` if nothing was committed.
    pub(crate) committed: Option<i64>,
    pub(crate) heartbeat_ok: bool,
}

impl BatchReport {
    fn record(&mut self, outcome: &MessageOutcome) {
        match outcome {
            MessageOutcome::Succeeded => self.succeeded += 1,
            MessageOutcome::Exhausted(forwarded) => {
                self.exhausted += 1;
                if matches!(forwarded, ForwardOutcome::Failed(_)) {
                    self.dead_letter_failed += 1;
                }
            }
            MessageOutcome::Faulted => self.faulted += 1,
            MessageOutcome::Duplicate => self.skipped += 1,
        }
    }
}

pub(crate) struct BatchProcessor<'a, S, P, C> {
    source: &'a S,
    sink: &'a C,
    forwarder: DeadLetterForwarder<'a, S, P>,
    retry: &'a RetryConfig,
    fault_policy: FaultPolicy,
}

impl<'a, S, P, C> BatchProcessor<'a, S, P, C>
where
    S: BatchSource + Sync,
    P: ErrorPublisher + Sync,
    C: RecordSink + Sync,
{
    pub(crate) fn new(
        source: &'a S,
        publisher: Option<&'a P>,
        sink: &'a C,
        retry: &'a RetryConfig,
        fault_policy: FaultPolicy,
    ) -> Self {
        Self {
            source,
            sink,
            forwarder: DeadLetterForwarder::new(source, publisher),
            retry,
            fault_policy,
        }
    }

    /// Processes the batch and commits its safe offset unless `cln_token` was cancelled.
    /// Never fails: per-message failures end in an outcome, commit and heartbeat failures
    /// are logged.
    pub(crate) async fn process(
        &self,
        batch: Batch,
        offsets: &OffsetTracker,
        cln_token: &CancellationToken,
    ) -> BatchReport {
        let mut report = BatchReport {
            partition: batch.partition,
            ..Default::default()
        };

        let mut in_flight = FuturesUnordered::new();
        for message in &batch.messages {
            if !offsets.track(message.partition, message.offset) {
                debug!(
                    partition = message.partition,
                    offset = message.offset,
                    "Skipping re-delivered message"
                );
                report.record(&MessageOutcome::Duplicate);
                continue;
            }
            in_flight.push(self.process_message(message, offsets));
        }

        while let Some(outcome) = in_flight.next().await {
            report.record(&outcome);
        }

        if cln_token.is_cancelled() {
            info!(
                partition = batch.partition,
                "Shutting down, skipping commit for the last batch"
            );
        } else if let Some(offset) = offsets.uncommitted(batch.partition) {
            match self.source.commit(batch.partition, offset).await {
                Ok(()) => {
                    offsets.mark_committed(batch.partition, offset);
                    report.committed = Some(offset);
                }
                Err(e) => error!(?e, partition = batch.partition, offset, "Committing offset"),
            }
        }

        if let Some(stalled) = offsets.stalled_at(batch.partition) {
            warn!(
                partition = batch.partition,
                offset = stalled,
                "Commit point is held back by an unresolved message"
            );
        }

        match self.source.heartbeat(batch.partition).await {
            Ok(()) => report.heartbeat_ok = true,
            Err(e) => error!(?e, partition = batch.partition, "Sending heartbeat"),
        }

        info!(
            partition = report.partition,
            succeeded = report.succeeded,
            exhausted = report.exhausted,
            faulted = report.faulted,
            skipped = report.skipped,
            dead_letter_failed = report.dead_letter_failed,
            committed = ?report.committed,
            "Processed batch"
        );
        report
    }

    async fn process_message(&self, message: &Message, offsets: &OffsetTracker) -> MessageOutcome {
        let record = match message.decode() {
            Ok(record) => record,
            Err(e) => return self.fault(e, message, offsets).await,
        };

        info!(
            partition = message.partition,
            offset = message.offset,
            "Creating product"
        );
        match self.deliver(message, &record).await {
            Ok(true) => {
                info!(
                    partition = message.partition,
                    offset = message.offset,
                    "Created product"
                );
                offsets.resolve(message.partition, message.offset);
                MessageOutcome::Succeeded
            }
            Ok(false) => {
                let outcome = self
                    .forwarder
                    .handle_exhausted(offsets, message, &record)
                    .await;
                MessageOutcome::Exhausted(outcome)
            }
            Err(e) => self.fault(e, message, offsets).await,
        }
    }

    /// Calls the sink until it creates the record or the attempts run out. Returns whether
    /// the record was created.
    async fn deliver(&self, message: &Message, record: &Value) -> Result<bool> {
        let mut backoff = Backoff::new(self.retry);
        let mut retries: u16 = 0;
        loop {
            match self.sink.create_record(record).await? {
                SinkResponse::Created(_) => return Ok(true),
                SinkResponse::Rejected {
                    status,
                    status_text,
                    ..
                } => {
                    retries += 1;
                    warn!(
                        partition = message.partition,
                        offset = message.offset,
                        ?status,
                        %status_text,
                        retries,
                        "Content API rejected product"
                    );
                    if retries >= self.retry.max_attempts {
                        return Ok(false);
                    }
                    let delay = backoff.next().unwrap_or_default();
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn fault(
        &self,
        e: crate::Error,
        message: &Message,
        offsets: &OffsetTracker,
    ) -> MessageOutcome {
        error!(
            ?e,
            partition = message.partition,
            offset = message.offset,
            policy = %self.fault_policy,
            "Processing message failed"
        );
        self.forwarder.send_error(&e, message).await;
        if self.fault_policy == FaultPolicy::Skip {
            offsets.resolve(message.partition, message.offset);
        }
        MessageOutcome::Faulted
    }
}
