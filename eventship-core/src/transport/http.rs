//! HTTP transport for the data plane batch endpoint

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use super::{NetworkErrorStatus, SendFailure, Transport};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::payload::encode_header_value;

const BATCH_ENDPOINT: &str = "/v1/batch";
const ANONYMOUS_ID_HEADER: &str = "AnonymousId";

/// Posts batches to `<data_plane_url>/v1/batch`
pub struct HttpTransport {
    http_client: reqwest::Client,
    url: String,
    anonymous_id_header: RwLock<String>,
}

impl HttpTransport {
    /// Create a transport from validated client configuration
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.validate()?;

        let write_key = config
            .write_key
            .as_deref()
            .ok_or_else(|| Error::Config("client.write_key is required".to_string()))?;
        let data_plane_url = config
            .data_plane_url
            .as_deref()
            .ok_or_else(|| Error::Config("client.data_plane_url is required".to_string()))?;

        Self::new(write_key, data_plane_url, config.request_timeout())
    }

    pub fn new(write_key: &str, data_plane_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = data_plane_url.trim_end_matches('/');

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = format!("Basic {}", encode_header_value(write_key));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth_value)
                .map_err(|e| Error::Config(format!("invalid write_key: {}", e)))?,
        );

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http_client,
            url: format!("{}{}", base_url, BATCH_ENDPOINT),
            anonymous_id_header: RwLock::new(String::new()),
        })
    }

    /// Full URL batches are posted to
    pub fn url(&self) -> &str {
        &self.url
    }

    fn current_anonymous_id_header(&self) -> String {
        self.anonymous_id_header
            .read()
            .map(|value| value.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

fn request_failure(e: reqwest::Error) -> SendFailure {
    let status = if e.is_connect() {
        NetworkErrorStatus::NetworkUnavailable
    } else {
        NetworkErrorStatus::Unknown
    };
    SendFailure::new(status, format!("HTTP request failed: {}", e))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_data(&self, payload: &str) -> std::result::Result<String, SendFailure> {
        let mut request = self.http_client.post(&self.url).body(payload.to_string());

        let anonymous_id = self.current_anonymous_id_header();
        if !anonymous_id.is_empty() {
            request = request.header(ANONYMOUS_ID_HEADER, anonymous_id);
        }

        let response = request.send().await.map_err(request_failure)?;
        let status = response.status();

        if status.is_success() {
            // The batch is accepted once the status arrives.
            return Ok(response.text().await.unwrap_or_else(|e| {
                tracing::warn!(status = %status, error = %e, "failed to read accepted response body");
                String::new()
            }));
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        Err(SendFailure::new(
            NetworkErrorStatus::from_status(status.as_u16()),
            format!("API error ({}): {}", status, error_text),
        ))
    }

    fn update_anonymous_id_header(&self, encoded: &str) {
        match self.anonymous_id_header.write() {
            Ok(mut value) => *value = encoded.to_string(),
            Err(poisoned) => *poisoned.into_inner() = encoded.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(url: &str) -> HttpTransport {
        HttpTransport::new("write-key", url, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_url_trims_trailing_slash() {
        let t = transport("https://dataplane.example.com/");
        assert_eq!(t.url(), "https://dataplane.example.com/v1/batch");
    }

    #[test]
    fn test_from_config_requires_write_key() {
        let config = ClientConfig {
            data_plane_url: Some("https://dataplane.example.com".to_string()),
            ..Default::default()
        };
        assert!(HttpTransport::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_send_data_success_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/batch"))
            .and(header("authorization", "Basic d3JpdGUta2V5Og=="))
            .and(header("content-type", "application/json"))
            .and(header("anonymousid", "YW5vbi0xOg=="))
            .and(body_string(r#"{"batch":[]}"#))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&server)
            .await;

        let t = transport(&server.uri());
        t.update_anonymous_id_header(&encode_header_value("anon-1"));
        let body = t.send_data(r#"{"batch":[]}"#).await.unwrap();
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn test_send_data_maps_status_codes() {
        for (code, expected) in [
            (400, NetworkErrorStatus::BadRequest),
            (401, NetworkErrorStatus::Unauthorized),
            (404, NetworkErrorStatus::NotFound),
            (413, NetworkErrorStatus::PayloadTooLarge),
            (500, NetworkErrorStatus::Retry(500)),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/v1/batch"))
                .respond_with(ResponseTemplate::new(code).set_body_string("nope"))
                .mount(&server)
                .await;

            let failure = transport(&server.uri()).send_data("{}").await.unwrap_err();
            assert_eq!(failure.status, expected, "status {code}");
            assert!(failure.cause.contains("nope"));
        }
    }

    #[tokio::test]
    async fn test_accepted_status_with_truncated_body_is_success() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\nOK")
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
        });

        let t = transport(&format!("http://{}", addr));
        let body = t.send_data("{}").await.unwrap();
        assert_eq!(body, "");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_unavailable() {
        let t = transport("http://127.0.0.1:1");
        let failure = t.send_data("{}").await.unwrap_err();
        assert_eq!(failure.status, NetworkErrorStatus::NetworkUnavailable);
    }
}
