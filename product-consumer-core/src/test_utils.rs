//! In-memory stand-ins for Kafka and the content API.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::dead_letter::ErrorPublisher;
use crate::message::{Batch, ErrorEnvelope, Message};
use crate::sink::{RecordSink, SinkResponse};
use crate::source::BatchSource;
use crate::{Error, Result};

pub(crate) fn message(partition: i32, offset: i64, value: &'static str) -> Message {
    Message {
        topic: "product".to_string(),
        partition,
        offset,
        value: Bytes::from_static(value.as_bytes()),
    }
}

pub(crate) fn batch(partition: i32, messages: Vec<Message>) -> Batch {
    Batch {
        partition,
        messages,
    }
}

/// Hands out the configured reads in order, then pends forever like an idle topic.
#[derive(Default)]
pub(crate) struct FakeSource {
    reads: Mutex<VecDeque<Vec<Message>>>,
    commits: Mutex<Vec<(i32, i64)>>,
    seeks: Mutex<Vec<(i32, i64)>>,
    heartbeats: Mutex<Vec<i32>>,
    fail_reads: bool,
    fail_commits: bool,
    fail_seeks: bool,
    fail_heartbeats: bool,
}

impl FakeSource {
    pub(crate) fn with_reads(reads: Vec<Vec<Message>>) -> Self {
        Self {
            reads: Mutex::new(reads.into()),
            ..Default::default()
        }
    }

    pub(crate) fn fail_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    pub(crate) fn fail_commits(mut self) -> Self {
        self.fail_commits = true;
        self
    }

    pub(crate) fn fail_seeks(mut self) -> Self {
        self.fail_seeks = true;
        self
    }

    pub(crate) fn fail_heartbeats(mut self) -> Self {
        self.fail_heartbeats = true;
        self
    }

    pub(crate) fn commits(&self) -> Vec<(i32, i64)> {
        self.commits.lock().clone()
    }

    pub(crate) fn seeks(&self) -> Vec<(i32, i64)> {
        self.seeks.lock().clone()
    }

    pub(crate) fn heartbeats(&self) -> Vec<i32> {
        self.heartbeats.lock().clone()
    }
}

impl BatchSource for FakeSource {
    async fn read(&self) -> Result<Vec<Message>> {
        if self.fail_reads {
            return Err(Error::Source("broker went away".to_string()));
        }
        let next = self.reads.lock().pop_front();
        match next {
            Some(messages) => Ok(messages),
            None => std::future::pending().await,
        }
    }

    async fn commit(&self, partition: i32, offset: i64) -> Result<()> {
        if self.fail_commits {
            return Err(Error::Source("commit failed".to_string()));
        }
        self.commits.lock().push((partition, offset));
        Ok(())
    }

    async fn seek(&self, partition: i32, offset: i64) -> Result<()> {
        if self.fail_seeks {
            return Err(Error::Source("seek failed".to_string()));
        }
        self.seeks.lock().push((partition, offset));
        Ok(())
    }

    async fn heartbeat(&self, partition: i32) -> Result<()> {
        if self.fail_heartbeats {
            return Err(Error::Source("partition revoked".to_string()));
        }
        self.heartbeats.lock().push(partition);
        Ok(())
    }
}

/// Records published envelopes.
#[derive(Default)]
pub(crate) struct FakePublisher {
    envelopes: Mutex<Vec<ErrorEnvelope>>,
    failing: bool,
}

impl FakePublisher {
    pub(crate) fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    pub(crate) fn envelopes(&self) -> Vec<ErrorEnvelope> {
        self.envelopes.lock().clone()
    }
}

impl ErrorPublisher for FakePublisher {
    async fn publish(&self, payload: Bytes) -> Result<()> {
        if self.failing {
            return Err(Error::DeadLetter("error topic unavailable".to_string()));
        }
        let envelope: ErrorEnvelope =
            serde_json::from_slice(&payload).expect("envelope is valid JSON");
        self.envelopes.lock().push(envelope);
        Ok(())
    }
}

enum SinkBehavior {
    Created,
    Rejected(u16),
    /// Rejects this many calls, then creates.
    RejectedThenCreated(usize),
    Failing,
}

/// Content API stand-in counting every call.
pub(crate) struct FakeSink {
    behavior: SinkBehavior,
    calls: AtomicUsize,
}

impl FakeSink {
    fn new(behavior: SinkBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn always_created() -> Self {
        Self::new(SinkBehavior::Created)
    }

    pub(crate) fn always_rejected(status: u16) -> Self {
        Self::new(SinkBehavior::Rejected(status))
    }

    pub(crate) fn rejected_then_created(rejections: usize) -> Self {
        Self::new(SinkBehavior::RejectedThenCreated(rejections))
    }

    pub(crate) fn failing() -> Self {
        Self::new(SinkBehavior::Failing)
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RecordSink for FakeSink {
    async fn create_record(&self, record: &Value) -> Result<SinkResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let rejected = |status: u16| SinkResponse::Rejected {
            status: Some(status),
            status_text: "Service Unavailable".to_string(),
            record: record.clone(),
        };
        match self.behavior {
            SinkBehavior::Created => Ok(SinkResponse::Created(json!({"data": record}))),
            SinkBehavior::Rejected(status) => Ok(rejected(status)),
            SinkBehavior::RejectedThenCreated(n) if call < n => Ok(rejected(503)),
            SinkBehavior::RejectedThenCreated(_) => {
                Ok(SinkResponse::Created(json!({"data": record})))
            }
            SinkBehavior::Failing => Err(Error::Sink("connection reset".to_string())),
        }
    }
}
