//! Consumes product messages from Kafka and creates each product through the Strapi content
//! API. A product the API keeps rejecting is published to the error topic and skipped, so
//! one bad record never stalls its partition.
//!
//! The pieces, from the outside in:
//! - [consumer] reads batches and drives them one at a time
//! - [processor] fans a batch out, retries each message and commits the safe offset
//! - [dead_letter] publishes exhausted or faulted messages to the error topic
//! - [tracker] keeps the per-partition commit point

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use self::config::Settings;
pub use self::error::{Error, Result};

use crate::consumer::ConsumptionLoop;
use crate::sink::http::HttpSinkClient;

pub mod config;
mod error;

mod consumer;
mod dead_letter;
mod message;
mod processor;
mod retry;
mod sink;
mod source;
mod tracker;

#[cfg(test)]
mod test_utils;

const PRODUCER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to Kafka and the content API and consumes until `cln_token` is cancelled.
/// Returns an error if startup fails or reading from the source topic fails.
pub async fn run(settings: &Settings, cln_token: CancellationToken) -> Result<()> {
    let (source, publisher) = tokio::try_join!(
        source::kafka::connect(&settings.kafka),
        async { dead_letter::kafka::connect(&settings.kafka) },
    )?;
    info!(topic = %settings.kafka.topic, "Subscribed to source topic");

    let sink = HttpSinkClient::new(&settings.strapi)?;
    let producer = publisher.clone();

    let consumer = ConsumptionLoop::new(
        source,
        publisher,
        sink,
        settings.retry.clone(),
        settings.fault_policy,
    );
    let result = consumer.run(cln_token).await;

    // deliver envelopes still queued in the producer
    if let Some(producer) = producer {
        match tokio::task::spawn_blocking(move || producer.flush(PRODUCER_FLUSH_TIMEOUT)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(?e, "Flushing error topic producer"),
            Err(e) => error!(?e, "Flushing error topic producer panicked"),
        }
    }
    result
}
