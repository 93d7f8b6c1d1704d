//! Kafka plumbing for the product consumer.
//!
//! [source] runs an rdkafka [StreamConsumer] inside an actor task and exposes batch reads,
//! offset commits, seeks and heartbeats through a cloneable handle. [sink] wraps an idempotent
//! [FutureProducer] used to publish error envelopes.
//!
//! [StreamConsumer]: rdkafka::consumer::StreamConsumer
//! [FutureProducer]: rdkafka::producer::FutureProducer

pub mod sink;
pub mod source;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("{0}")]
    Other(String),
}
