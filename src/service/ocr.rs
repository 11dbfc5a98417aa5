use crate::config::OcrConfig;
use crate::models::OcrText;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

/// Total provider attempts for one recognition call (1 initial + 2 retries).
const MAX_ATTEMPTS: u32 = 3;

/// Normalized failure reasons. `NotConfigured` and `NoText` are decisions,
/// not provider errors, and are never retried here.
#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("OCR provider is not configured")]
    NotConfigured,

    #[error("no readable text found in image")]
    NoText,

    #[error("OCR provider error: {0}")]
    Provider(String),
}

/// One raw reply from the provider, before normalization.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    pub status: u16,
    pub body: Value,
}

/// Transport seam: the real implementation speaks HTTP, tests script
/// status sequences.
#[async_trait]
pub trait OcrTransport: Send + Sync {
    async fn analyze(&self, image: &[u8]) -> Result<ProviderReply, String>;
}

/// HTTP transport for an Azure Read-style endpoint: key header,
/// octet-stream body, JSON reply.
pub struct HttpOcrTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpOcrTransport {
    pub fn new(endpoint: String, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl OcrTransport for HttpOcrTransport {
    async fn analyze(&self, image: &[u8]) -> Result<ProviderReply, String> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .header("Content-Type", "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    format!("provider unreachable: {}", e)
                } else {
                    format!("network error: {}", e)
                }
            })?;

        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(ProviderReply { status, body })
    }
}

/// OCR client adapter. Construction from config decides once whether the
/// provider is usable; a disabled client fails every call with
/// `NotConfigured` instead of panicking somewhere deep in a worker.
pub struct OcrClient {
    transport: Option<Box<dyn OcrTransport>>,
    retry_base_delay: Duration,
}

impl OcrClient {
    pub fn from_config(config: &OcrConfig) -> Self {
        let transport: Option<Box<dyn OcrTransport>> =
            match (config.endpoint.clone(), config.api_key.clone()) {
                (Some(endpoint), Some(api_key)) => {
                    Some(Box::new(HttpOcrTransport::new(endpoint, api_key)))
                }
                _ => {
                    warn!("OCR credentials absent; receipt processing is disabled");
                    None
                }
            };
        Self {
            transport,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    /// Test/composition constructor with an explicit transport.
    pub fn with_transport(transport: Box<dyn OcrTransport>, retry_base_delay: Duration) -> Self {
        Self {
            transport: Some(transport),
            retry_base_delay,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }

    /// Linear backoff: attempt 1 waits 1×base before attempt 2, and so on.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay * attempt
    }

    /// Recognize text in image bytes. Retries rate-limit and server-side
    /// statuses up to the attempt budget; everything else fails at once.
    /// The full payload is resent on every attempt.
    pub async fn recognize(&self, image: &[u8]) -> Result<OcrText, OcrError> {
        let transport = self.transport.as_ref().ok_or(OcrError::NotConfigured)?;

        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match transport.analyze(image).await {
                Ok(reply) if (200..300).contains(&reply.status) => {
                    return normalize_reply(&reply.body);
                }
                Ok(reply) if is_transient_status(reply.status) => {
                    last_error = format!("provider returned {}", reply.status);
                    warn!(
                        attempt,
                        status = reply.status,
                        "transient OCR provider failure"
                    );
                }
                Ok(reply) => {
                    // Non-transient 4xx: retrying cannot help.
                    return Err(OcrError::Provider(format!(
                        "provider rejected request with status {}",
                        reply.status
                    )));
                }
                Err(e) => {
                    last_error = e;
                    warn!(attempt, error = %last_error, "OCR transport failure");
                }
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(self.retry_delay(attempt)).await;
            }
        }

        Err(OcrError::Provider(format!(
            "exhausted {} attempts: {}",
            MAX_ATTEMPTS, last_error
        )))
    }
}

fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..=504).contains(&status)
}

/// Flatten the provider's line/word structure into raw text plus the
/// averaged per-word confidence.
fn normalize_reply(body: &Value) -> Result<OcrText, OcrError> {
    let empty = Vec::new();
    let lines = body
        .get("lines")
        .and_then(|l| l.as_array())
        .unwrap_or(&empty);

    let mut texts: Vec<&str> = Vec::new();
    let mut confidence_sum = 0.0f64;
    let mut word_count = 0usize;

    for line in lines {
        if let Some(text) = line.get("text").and_then(|t| t.as_str()) {
            if !text.trim().is_empty() {
                texts.push(text);
            }
        }
        if let Some(words) = line.get("words").and_then(|w| w.as_array()) {
            for word in words {
                if let Some(c) = word.get("confidence").and_then(|c| c.as_f64()) {
                    confidence_sum += c;
                    word_count += 1;
                }
            }
        }
    }

    if texts.is_empty() {
        return Err(OcrError::NoText);
    }

    let confidence = if word_count > 0 {
        confidence_sum / word_count as f64
    } else {
        0.0
    };

    info!(
        lines = texts.len(),
        words = word_count,
        confidence,
        "OCR text extracted"
    );

    Ok(OcrText {
        raw_text: texts.join("\n"),
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Scripted transport: pops one reply per call and records how many
    /// calls were made.
    struct ScriptedTransport {
        replies: Mutex<Vec<Result<ProviderReply, String>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<ProviderReply, String>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl OcrTransport for ScriptedTransport {
        async fn analyze(&self, _image: &[u8]) -> Result<ProviderReply, String> {
            *self.calls.lock().unwrap() += 1;
            self.replies.lock().unwrap().remove(0)
        }
    }

    fn ok_body() -> Value {
        json!({
            "lines": [
                { "text": "WALMART", "words": [ {"confidence": 0.9}, {"confidence": 0.8} ] },
                { "text": "Milk 3.99", "words": [ {"confidence": 0.7} ] }
            ]
        })
    }

    fn reply(status: u16, body: Value) -> Result<ProviderReply, String> {
        Ok(ProviderReply { status, body })
    }

    fn client_with(replies: Vec<Result<ProviderReply, String>>) -> (OcrClient, std::sync::Arc<ScriptedTransport>) {
        let transport = std::sync::Arc::new(ScriptedTransport::new(replies));

        struct Shared(std::sync::Arc<ScriptedTransport>);
        #[async_trait]
        impl OcrTransport for Shared {
            async fn analyze(&self, image: &[u8]) -> Result<ProviderReply, String> {
                self.0.analyze(image).await
            }
        }

        let client = OcrClient::with_transport(
            Box::new(Shared(transport.clone())),
            Duration::from_millis(1),
        );
        (client, transport)
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt_after_rate_limits() {
        let (client, transport) = client_with(vec![
            reply(429, Value::Null),
            reply(429, Value::Null),
            reply(200, ok_body()),
        ]);

        let result = client.recognize(b"image").await.unwrap();
        assert_eq!(result.raw_text, "WALMART\nMilk 3.99");
        assert!((result.confidence - 0.8).abs() < 1e-9);
        assert_eq!(*transport.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_three_transient_failures() {
        let (client, transport) = client_with(vec![
            reply(503, Value::Null),
            reply(500, Value::Null),
            reply(429, Value::Null),
        ]);

        let err = client.recognize(b"image").await.unwrap_err();
        assert!(matches!(err, OcrError::Provider(_)));
        assert_eq!(*transport.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn non_transient_status_fails_immediately() {
        let (client, transport) = client_with(vec![reply(401, Value::Null)]);

        let err = client.recognize(b"image").await.unwrap_err();
        assert!(matches!(err, OcrError::Provider(_)));
        assert_eq!(*transport.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let (client, transport) = client_with(vec![
            Err("provider unreachable: connection refused".into()),
            reply(200, ok_body()),
        ]);

        assert!(client.recognize(b"image").await.is_ok());
        assert_eq!(*transport.calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_result_is_no_text() {
        let (client, _) = client_with(vec![reply(200, json!({ "lines": [] }))]);
        let err = client.recognize(b"image").await.unwrap_err();
        assert!(matches!(err, OcrError::NoText));
    }

    #[tokio::test]
    async fn disabled_client_fails_deterministically() {
        let config = OcrConfig {
            endpoint: None,
            api_key: None,
            retry_base_delay_ms: 1000,
        };
        let client = OcrClient::from_config(&config);
        assert!(!client.is_enabled());
        let err = client.recognize(b"image").await.unwrap_err();
        assert!(matches!(err, OcrError::NotConfigured));
    }

    #[test]
    fn backoff_grows_linearly() {
        let client = OcrClient::with_transport(
            Box::new(ScriptedTransport::new(vec![])),
            Duration::from_secs(1),
        );
        assert_eq!(client.retry_delay(1), Duration::from_secs(1));
        assert_eq!(client.retry_delay(2), Duration::from_secs(2));
        assert!(client.retry_delay(2) > client.retry_delay(1));
    }
}
