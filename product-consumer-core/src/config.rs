//! Process configuration. [Settings] is built once from the environment at startup and lent
//! to every component; nothing below this module reads the environment.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

const ENV_BROKER_1: &str = "BROKER_1";
const ENV_BROKER_2: &str = "BROKER_2";
const ENV_BROKER_3: &str = "BROKER_3";
const ENV_STRAPI_TOKEN: &str = "STRAPI_TOKEN";
const ENV_STRAPI_URL: &str = "STRAPI_URL";
const ENV_TOPIC: &str = "TOPIC";
const ENV_BEGINNING: &str = "BEGINNING";
const ENV_ERROR_TOPIC: &str = "ERROR_TOPIC";
const ENV_CONSUMER_GROUP: &str = "CONSUMER_GROUP";
const ENV_CLIENT_ID: &str = "CLIENT_ID";
const ENV_BATCH_SIZE: &str = "BATCH_SIZE";
const ENV_READ_TIMEOUT_MS: &str = "READ_TIMEOUT_MS";
const ENV_REQUEST_TIMEOUT_MS: &str = "REQUEST_TIMEOUT_MS";
const ENV_RETRY_INITIAL_INTERVAL_MS: &str = "RETRY_INITIAL_INTERVAL_MS";
const ENV_RETRY_MAX_INTERVAL_MS: &str = "RETRY_MAX_INTERVAL_MS";
const ENV_RETRY_FACTOR: &str = "RETRY_FACTOR";
const ENV_RETRY_JITTER: &str = "RETRY_JITTER";
const ENV_ON_DECODE_FAULT: &str = "ON_DECODE_FAULT";

const DEFAULT_BROKER: &str = "localhost:9092";
const DEFAULT_STRAPI_URL: &str = "http://localhost:8080";
const DEFAULT_TOPIC: &str = "product";
const DEFAULT_ERROR_TOPIC: &str = "errors";
const DEFAULT_CONSUMER_GROUP: &str = "product-creator";
const DEFAULT_CLIENT_ID: &str = "product-consumer";
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Attempts made against the downstream API before a message is dead-lettered.
pub const MAX_RETRIES: u16 = 5;
const DEFAULT_RETRY_INITIAL_INTERVAL_MS: u64 = 100;
const DEFAULT_RETRY_MAX_INTERVAL_MS: u64 = 5000;
const DEFAULT_RETRY_FACTOR: f64 = 2.0;
const DEFAULT_RETRY_JITTER: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub kafka: KafkaConfig,
    pub strapi: StrapiConfig,
    pub retry: RetryConfig,
    pub fault_policy: FaultPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    /// `None` disables both the dead-letter publish and the error sink.
    pub error_topic: Option<String>,
    pub consumer_group: String,
    pub client_id: String,
    pub from_beginning: bool,
    pub batch_size: usize,
    pub read_timeout: Duration,
}

#[derive(Clone, PartialEq)]
pub struct StrapiConfig {
    pub url: String,
    pub token: String,
    pub request_timeout: Duration,
}

// keeps the bearer token out of the logs
impl fmt::Debug for StrapiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrapiConfig")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Retry bound and the backoff applied between attempts. A zero `initial_interval`
/// disables the backoff and retries immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u16,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRIES,
            initial_interval: Duration::from_millis(DEFAULT_RETRY_INITIAL_INTERVAL_MS),
            max_interval: Duration::from_millis(DEFAULT_RETRY_MAX_INTERVAL_MS),
            factor: DEFAULT_RETRY_FACTOR,
            jitter: DEFAULT_RETRY_JITTER,
        }
    }
}

impl RetryConfig {
    /// Retries back to back, used by tests.
    pub fn without_backoff() -> Self {
        Self {
            initial_interval: Duration::ZERO,
            ..Default::default()
        }
    }
}

/// What to do with the offset of a message whose payload could not be decoded or whose
/// processing failed unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultPolicy {
    /// Leave the offset unresolved. The partition's commit point stays behind the faulted
    /// message until the process restarts and re-reads it.
    #[default]
    Block,
    /// Resolve the offset and move on, the message only survives on the error topic.
    Skip,
}

impl FromStr for FaultPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "block" => Ok(FaultPolicy::Block),
            "skip" => Ok(FaultPolicy::Skip),
            other => Err(Error::Config(format!(
                "{ENV_ON_DECODE_FAULT} must be one of block, skip; got {other:?}"
            ))),
        }
    }
}

impl fmt::Display for FaultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FaultPolicy::Block => write!(f, "block"),
            FaultPolicy::Skip => write!(f, "skip"),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kafka: KafkaConfig {
                brokers: vec![DEFAULT_BROKER.to_string(); 3],
                topic: DEFAULT_TOPIC.to_string(),
                error_topic: Some(DEFAULT_ERROR_TOPIC.to_string()),
                consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
                client_id: DEFAULT_CLIENT_ID.to_string(),
                from_beginning: false,
                batch_size: DEFAULT_BATCH_SIZE,
                read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            },
            strapi: StrapiConfig {
                url: DEFAULT_STRAPI_URL.to_string(),
                token: String::new(),
                request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            },
            retry: RetryConfig::default(),
            fault_policy: FaultPolicy::default(),
        }
    }
}

impl TryFrom<HashMap<String, String>> for Settings {
    type Error = Error;

    fn try_from(env: HashMap<String, String>) -> Result<Self> {
        let string_or = |key: &str, default: &str| {
            env.get(key)
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        let brokers = [ENV_BROKER_1, ENV_BROKER_2, ENV_BROKER_3]
            .into_iter()
            .map(|key| string_or(key, DEFAULT_BROKER))
            .collect();

        // an empty ERROR_TOPIC switches the error topic off
        let error_topic = Some(string_or(ENV_ERROR_TOPIC, DEFAULT_ERROR_TOPIC))
            .filter(|topic| !topic.trim().is_empty());

        let batch_size = parse_or(&env, ENV_BATCH_SIZE, DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            return Err(Error::Config(format!("{ENV_BATCH_SIZE} must be positive")));
        }

        let kafka = KafkaConfig {
            brokers,
            topic: string_or(ENV_TOPIC, DEFAULT_TOPIC),
            error_topic,
            consumer_group: string_or(ENV_CONSUMER_GROUP, DEFAULT_CONSUMER_GROUP),
            client_id: string_or(ENV_CLIENT_ID, DEFAULT_CLIENT_ID),
            from_beginning: parse_bool(&env, ENV_BEGINNING, false)?,
            batch_size,
            read_timeout: Duration::from_millis(parse_or(
                &env,
                ENV_READ_TIMEOUT_MS,
                DEFAULT_READ_TIMEOUT_MS,
            )?),
        };

        let strapi = StrapiConfig {
            url: string_or(ENV_STRAPI_URL, DEFAULT_STRAPI_URL)
                .trim_end_matches('/')
                .to_string(),
            token: string_or(ENV_STRAPI_TOKEN, ""),
            request_timeout: Duration::from_millis(parse_or(
                &env,
                ENV_REQUEST_TIMEOUT_MS,
                DEFAULT_REQUEST_TIMEOUT_MS,
            )?),
        };

        let retry = RetryConfig {
            max_attempts: MAX_RETRIES,
            initial_interval: Duration::from_millis(parse_or(
                &env,
                ENV_RETRY_INITIAL_INTERVAL_MS,
                DEFAULT_RETRY_INITIAL_INTERVAL_MS,
            )?),
            max_interval: Duration::from_millis(parse_or(
                &env,
                ENV_RETRY_MAX_INTERVAL_MS,
                DEFAULT_RETRY_MAX_INTERVAL_MS,
            )?),
            factor: parse_or(&env, ENV_RETRY_FACTOR, DEFAULT_RETRY_FACTOR)?,
            jitter: parse_or(&env, ENV_RETRY_JITTER, DEFAULT_RETRY_JITTER)?,
        };
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(Error::Config(format!(
                "{ENV_RETRY_JITTER} must be between 0 and 1, got {}",
                retry.jitter
            )));
        }
        if retry.factor < 1.0 {
            return Err(Error::Config(format!(
                "{ENV_RETRY_FACTOR} must be at least 1, got {}",
                retry.factor
            )));
        }

        let fault_policy = match env.get(ENV_ON_DECODE_FAULT) {
            Some(value) => value.parse()?,
            None => FaultPolicy::default(),
        };

        Ok(Settings {
            kafka,
            strapi,
            retry,
            fault_policy,
        })
    }
}

fn parse_or<T>(env: &HashMap<String, String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env.get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("parsing {key}={value:?}: {e}"))),
        None => Ok(default),
    }
}

/// Accepts only `true` or `false`, ignoring case.
fn parse_bool(env: &HashMap<String, String>, key: &str, default: bool) -> Result<bool> {
    let Some(value) = env.get(key) else {
        return Ok(default);
    };
    match value.trim().to_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::Config(format!(
            "{key} must be either true or false, got {value:?}"
        ))),
    }
}
