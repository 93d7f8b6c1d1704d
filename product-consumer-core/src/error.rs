use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Connection Error - {0}")]
    Connection(String),

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("Decode Error - {0}")]
    Decode(String),

    #[error("DeadLetter Error - {0}")]
    DeadLetter(String),
}

impl From<product_consumer_kafka::Error> for Error {
    fn from(err: product_consumer_kafka::Error) -> Self {
        match err {
            product_consumer_kafka::Error::Connection { .. } => Error::Connection(err.to_string()),
            other => Error::Source(other.to_string()),
        }
    }
}
