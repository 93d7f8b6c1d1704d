use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::StrapiConfig;
use crate::sink::{RecordSink, SinkResponse};
use crate::{Error, Result};

const PRODUCTS_PATH: &str = "/api/products";

/// Posts products to `{STRAPI_URL}/api/products`. Every call is bounded by the configured
/// request timeout.
#[derive(Clone)]
pub(crate) struct HttpSinkClient {
    client: Client,
    endpoint: String,
    token: String,
}

impl HttpSinkClient {
    pub(crate) fn new(config: &StrapiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Sink(format!("Creating HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}{PRODUCTS_PATH}", config.url),
            token: config.token.clone(),
        })
    }
}

impl RecordSink for HttpSinkClient {
    async fn create_record(&self, record: &Value) -> Result<SinkResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&json!({ "data": record }))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(?e, endpoint = %self.endpoint, "Request to content API failed");
                return Ok(SinkResponse::Rejected {
                    status: None,
                    status_text: e.to_string(),
                    record: record.clone(),
                });
            }
        };

        let status = response.status();
        // 200 only, a 201 or 204 is not treated as created
        if status == StatusCode::OK {
            let body = response
                .json::<Value>()
                .await
                .map_err(|e| Error::Sink(format!("Decoding content API response: {e}")))?;
            debug!(?body, "Content API accepted product");
            return Ok(SinkResponse::Created(body));
        }

        Ok(SinkResponse::Rejected {
            status: Some(status.as_u16()),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            record: record.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    use super::*;

    #[derive(Clone, Default)]
    struct Captured {
        requests: Arc<Mutex<Vec<(HeaderMap, Value)>>>,
    }

    async fn start_server(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(url: String, timeout: Duration) -> HttpSinkClient {
        HttpSinkClient::new(&StrapiConfig {
            url,
            token: "test-token".to_string(),
            request_timeout: timeout,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_record_success() {
        let captured = Captured::default();
        let router = Router::new()
            .route(
                "/api/products",
                post(
                    |State(captured): State<Captured>,
                     headers: HeaderMap,
                     axum::Json(body): axum::Json<Value>| async move {
                        captured.requests.lock().push((headers, body));
                        axum::Json(json!({"id": 1}))
                    },
                ),
            )
            .with_state(captured.clone());
        let url = start_server(router).await;

        let response = client(url, Duration::from_secs(2))
            .create_record(&json!({"name": "lamp"}))
            .await
            .unwrap();
        assert_eq!(response, SinkResponse::Created(json!({"id": 1})));

        let requests = captured.requests.lock();
        assert_eq!(requests.len(), 1);
        let (headers, body) = &requests[0];
        assert_eq!(body, &json!({"data": {"name": "lamp"}}));
        assert_eq!(headers["authorization"], "Bearer test-token");
        assert_eq!(headers["content-type"], "application/json");
    }

    #[tokio::test]
    async fn test_non_200_is_rejected() {
        let router = Router::new().route(
            "/api/products",
            post(|| async { AxumStatus::SERVICE_UNAVAILABLE }),
        );
        let url = start_server(router).await;

        let record = json!({"name": "lamp"});
        let response = client(url, Duration::from_secs(2))
            .create_record(&record)
            .await
            .unwrap();
        assert_eq!(
            response,
            SinkResponse::Rejected {
                status: Some(503),
                status_text: "Service Unavailable".to_string(),
                record,
            }
        );
    }

    #[tokio::test]
    async fn test_created_status_is_not_success() {
        let router = Router::new().route(
            "/api/products",
            post(|| async { (AxumStatus::CREATED, axum::Json(json!({"id": 1}))).into_response() }),
        );
        let url = start_server(router).await;

        let response = client(url, Duration::from_secs(2))
            .create_record(&json!({}))
            .await
            .unwrap();
        assert!(matches!(
            response,
            SinkResponse::Rejected {
                status: Some(201),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_slow_downstream_times_out() {
        let router = Router::new().route(
            "/api/products",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                axum::Json(json!({"id": 1}))
            }),
        );
        let url = start_server(router).await;

        let start = tokio::time::Instant::now();
        let response = client(url, Duration::from_millis(100))
            .create_record(&json!({}))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(matches!(response, SinkResponse::Rejected { status: None, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_downstream_is_rejected() {
        // bind and drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let response = client(format!("http://{addr}"), Duration::from_secs(1))
            .create_record(&json!({}))
            .await
            .unwrap();
        assert!(matches!(response, SinkResponse::Rejected { status: None, .. }));
    }

    #[tokio::test]
    async fn test_undecodable_success_body_is_an_error() {
        let router = Router::new().route("/api/products", post(|| async { "created!" }));
        let url = start_server(router).await;

        let result = client(url, Duration::from_secs(2))
            .create_record(&json!({}))
            .await;
        assert!(matches!(result, Err(Error::Sink(_))));
    }
}
