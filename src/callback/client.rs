use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use crate::config::CallbackApiConfig;
use crate::metrics::CallbackMetrics;

use super::{AuthHelper, CallbackSink, SendEventRequest, SinkError};

/// Longest response body kept in a `HttpStatus` error
const MAX_ERROR_BODY_LEN: usize = 1024;

/// HTTP client for the callback API.
pub struct CallbackApiClient {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    auth: AuthHelper,
}

impl CallbackApiClient {
    pub fn new(config: &CallbackApiConfig) -> Result<Self, SinkError> {
        let auth = AuthHelper::from_config(&config.auth)?;
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/event", config.base_url.trim_end_matches('/')),
            timeout: config.timeout(),
            auth,
        })
    }

    /// URL events are POSTed to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn classify(&self, error: reqwest::Error) -> SinkError {
        if error.is_timeout() {
            SinkError::Timeout(self.timeout)
        } else if error.is_connect() {
            SinkError::ConnectionRefused(error.to_string())
        } else {
            SinkError::Request(error)
        }
    }
}

#[async_trait]
impl CallbackSink for CallbackApiClient {
    async fn send_event(&self, request: &SendEventRequest) -> Result<(), SinkError> {
        let body = serde_json::to_vec(request)?;

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some((name, value)) = self.auth.header()? {
            builder = builder.header(name, value);
        }

        let started = Instant::now();
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                let err = self.classify(e);
                let label = match err {
                    SinkError::Timeout(_) => "timeout",
                    SinkError::ConnectionRefused(_) => "unreachable",
                    _ => "error",
                };
                CallbackMetrics::record_request(label, started.elapsed().as_secs_f64());
                return Err(err);
            }
        };

        let status = response.status();
        CallbackMetrics::record_request(status.as_str(), started.elapsed().as_secs_f64());

        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY_LEN {
                let mut cut = MAX_ERROR_BODY_LEN;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(SinkError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(
            event_id = %request.id,
            status = status.as_u16(),
            "Callback API accepted event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let config = CallbackApiConfig {
            base_url: "https://anchor.example.com/callbacks/".to_string(),
            ..Default::default()
        };
        let client = CallbackApiClient::new(&config).unwrap();
        assert_eq!(client.endpoint(), "https://anchor.example.com/callbacks/event");
    }

    #[test]
    fn test_invalid_auth_config_rejected() {
        let mut config = CallbackApiConfig::default();
        config.auth.auth_type = crate::config::CallbackAuthType::ApiKey;

        assert!(matches!(
            CallbackApiClient::new(&config),
            Err(SinkError::Auth(_))
        ));
    }
}
