use serde_json::Value;

use crate::Result;

/// [Strapi] content API client.
///
/// [Strapi]: https://docs.strapi.io/dev-docs/api/rest
pub(crate) mod http;

/// Outcome of a single create call. A rejection is a value the caller decides about, not
/// an error.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SinkResponse {
    /// The API answered 200 with this body.
    Created(Value),
    /// Any other status, or no response at all (`status` is `None`).
    Rejected {
        status: Option<u16>,
        status_text: String,
        record: Value,
    },
}

/// The downstream the product records are written to.
#[trait_variant::make(RecordSink: Send)]
#[allow(dead_code)]
pub(crate) trait LocalRecordSink {
    /// Sends one record, without retrying. `Err` is reserved for unexpected faults such as an
    /// undecodable success body.
    async fn create_record(&self, record: &Value) -> Result<SinkResponse>;
}
