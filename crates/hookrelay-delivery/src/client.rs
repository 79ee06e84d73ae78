//! HTTP client for push delivery with configurable timeouts.
//!
//! Builds the outbound POST for one attempt of one job and reports what the
//! consumer answered. Whether that answer counts as success is decided by
//! the caller; the client only separates transport failures from responses.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use hookrelay_core::models::{ChannelId, ConsumerId, JobId, MessageId};
use reqwest::{header::CONTENT_TYPE, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{DeliveryError, Result};

/// Header carrying the delivery job id.
pub const HEADER_JOB_ID: &str = "X-Broker-Job-Id";
/// Header carrying the message id.
pub const HEADER_MESSAGE_ID: &str = "X-Broker-Message-Id";
/// Header carrying the channel id.
pub const HEADER_CHANNEL_ID: &str = "X-Broker-Channel-Id";
/// Header carrying the consumer id.
pub const HEADER_CONSUMER_ID: &str = "X-Broker-Consumer-Id";
/// Header carrying the 1-based attempt number.
pub const HEADER_DELIVERY_ATTEMPT: &str = "X-Broker-Delivery-Attempt";

const MAX_RESPONSE_BODY_SIZE: usize = 1024;

/// Configuration for the push delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for one delivery request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: format!("hookrelay/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 3,
        }
    }
}

/// HTTP client shared by all delivery workers.
///
/// Wraps one pooled `reqwest::Client`, so connections to a consumer are
/// reused across jobs and workers.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// One push attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Job being attempted.
    pub job_id: JobId,
    /// Message being delivered.
    pub message_id: MessageId,
    /// Channel of the message.
    pub channel_id: ChannelId,
    /// Receiving consumer.
    pub consumer_id: ConsumerId,
    /// Consumer callback URL.
    pub url: String,
    /// Raw message payload.
    pub body: Bytes,
    /// Content type of the payload.
    pub content_type: String,
    /// Attempt number for this delivery.
    pub attempt_number: u32,
}

/// Response from a delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated for logging.
    pub body: String,
    /// Time from sending the request to reading the body.
    pub duration: Duration,
    /// Whether the consumer answered 2xx.
    pub is_success: bool,
}

impl DeliveryResponse {
    /// Converts a non-2xx response into the matching delivery error.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::HttpStatus` unless the status is 2xx.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success {
            Ok(self)
        } else {
            Err(DeliveryError::http_status(self.status_code, self.body))
        }
    }
}

impl DeliveryClient {
    /// Creates a client with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if reqwest rejects the settings or the
    /// TLS backend fails to initialize.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let redirects = usize::try_from(config.max_redirects).unwrap_or(usize::MAX);
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(redirects))
            .build()
            .map_err(|e| DeliveryError::configuration(format!("cannot build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Creates a client with [`ClientConfig::default`].
    ///
    /// # Errors
    ///
    /// See [`DeliveryClient::new`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// POSTs the payload to the consumer.
    ///
    /// Any HTTP response, 2xx or not, is returned as `Ok`.
    ///
    /// # Errors
    ///
    /// - `Timeout` if the consumer did not answer within the timeout
    /// - `NetworkError` for connection and protocol failures
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let span = info_span!(
            "push_delivery",
            job_id = %request.job_id,
            consumer_id = %request.consumer_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            let started = Instant::now();
            let response = self.post(request).send().await.map_err(|e| {
                warn!(duration_ms = started.elapsed().as_millis(), error = %e, "push failed");
                self.transport_error(&e)
            })?;

            let status = response.status();
            let body = read_body_head(response).await;
            let answer = DeliveryResponse {
                status_code: status.as_u16(),
                body,
                duration: started.elapsed(),
                is_success: status.is_success(),
            };

            debug!(
                status = answer.status_code,
                duration_ms = answer.duration.as_millis(),
                accepted = answer.is_success,
                "consumer answered"
            );
            Ok(answer)
        }
        .instrument(span)
        .await
    }

    fn post(&self, request: DeliveryRequest) -> RequestBuilder {
        self.client
            .post(&request.url)
            .header(CONTENT_TYPE, request.content_type)
            .header(HEADER_JOB_ID, request.job_id.to_string())
            .header(HEADER_MESSAGE_ID, request.message_id.as_str())
            .header(HEADER_CHANNEL_ID, request.channel_id.as_str())
            .header(HEADER_CONSUMER_ID, request.consumer_id.as_str())
            .header(HEADER_DELIVERY_ATTEMPT, request.attempt_number.to_string())
            .body(request.body)
    }

    fn transport_error(&self, error: &reqwest::Error) -> DeliveryError {
        if error.is_timeout() {
            DeliveryError::timeout(self.config.timeout.as_secs())
        } else if error.is_connect() {
            DeliveryError::network(format!("connection failed: {error}"))
        } else {
            DeliveryError::network(error.to_string())
        }
    }
}

/// Reads at most one byte past `MAX_RESPONSE_BODY_SIZE` of the body and
/// drops the connection's remaining bytes.
async fn read_body_head(mut response: Response) -> String {
    let mut head = BytesMut::with_capacity(MAX_RESPONSE_BODY_SIZE + 1);
    while head.len() <= MAX_RESPONSE_BODY_SIZE {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(MAX_RESPONSE_BODY_SIZE + 1 - head.len());
                head.extend_from_slice(&chunk[..take]);
            },
            Ok(None) => break,
            Err(e) => return format!("[unreadable response body: {e}]"),
        }
    }
    truncate_body(&head)
}

/// Lossy UTF-8 view of a response body, cut at `MAX_RESPONSE_BODY_SIZE`.
fn truncate_body(bytes: &[u8]) -> String {
    match bytes.get(..MAX_RESPONSE_BODY_SIZE) {
        Some(head) if bytes.len() > MAX_RESPONSE_BODY_SIZE => {
            format!("{}... (truncated)", String::from_utf8_lossy(head))
        },
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}
