//! HTTP delivery of event envelopes to sinks.

use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use sha2::Sha256;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wagate_core::event::EventEnvelope;
use wagate_core::sink::Sink;

type HmacSha256 = Hmac<Sha256>;

/// Result of one POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    /// 5xx, 408, 429 or a network error.
    Retryable(String),
    /// Any other 4xx, or an envelope that cannot be encoded.
    Terminal(String),
}

/// Final verdict after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered { attempts: u32 },
    Failed { attempts: u32, reason: String },
    Canceled,
}

/// `sha256=<hex>` HMAC of the request body.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(body);
            format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
        }
        // HMAC accepts keys of any length.
        Err(_) => String::new(),
    }
}

fn classify(status: StatusCode) -> Outcome {
    if status.is_success() {
        Outcome::Delivered
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Outcome::Retryable(format!("HTTP {status}"))
    } else {
        Outcome::Terminal(format!("HTTP {status}"))
    }
}

#[derive(Clone)]
pub struct DeliveryClient {
    http: reqwest::Client,
}

impl DeliveryClient {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("wagate/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                warn!("webhook client builder failed, using defaults: {e}");
                reqwest::Client::new()
            });
        Self { http }
    }

    /// POST the envelope once.
    pub async fn post(&self, sink: &Sink, envelope: &EventEnvelope) -> Outcome {
        let body = match serde_json::to_vec(envelope) {
            Ok(b) => b,
            Err(e) => return Outcome::Terminal(format!("encode envelope: {e}")),
        };
        let mut req = self
            .http
            .post(&sink.target)
            .header("Content-Type", "application/json")
            .header("X-Event-Type", envelope.event_type.as_str())
            .header("X-Session-Id", envelope.session_id.to_string())
            .header("X-Event-Seq", envelope.monotonic_seq.to_string());
        if let Some(secret) = &sink.secret {
            req = req.header("X-Signature", sign_body(secret, &body));
        }
        match req.body(body).send().await {
            Ok(resp) => classify(resp.status()),
            Err(e) => Outcome::Retryable(e.to_string()),
        }
    }

    /// Deliver with the sink's retry policy. Waits race `cancel`.
    pub async fn deliver(
        &self,
        sink: &Sink,
        envelope: &EventEnvelope,
        cancel: &CancellationToken,
    ) -> Delivery {
        let policy = sink.retry_policy.normalized();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Delivery::Canceled,
                o = self.post(sink, envelope) => o,
            };
            match outcome {
                Outcome::Delivered => return Delivery::Delivered { attempts: attempt },
                Outcome::Terminal(reason) => {
                    return Delivery::Failed {
                        attempts: attempt,
                        reason,
                    }
                }
                Outcome::Retryable(reason) => {
                    if attempt >= policy.max_attempts {
                        return Delivery::Failed {
                            attempts: attempt,
                            reason,
                        };
                    }
                    let delay = policy.delay_after(attempt);
                    debug!(
                        sink_id = %sink.id,
                        seq = envelope.monotonic_seq,
                        "delivery attempt {attempt} failed ({reason}), retrying in {delay:?}"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Delivery::Canceled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_format() {
        let sig = sign_body("secret", b"{\"a\":1}");
        let hex_part = sig.strip_prefix("sha256=").unwrap();
        assert_eq!(hex_part.len(), 64);
        assert_eq!(sig, sign_body("secret", b"{\"a\":1}"));
        assert_ne!(sig, sign_body("other", b"{\"a\":1}"));
    }

    #[test]
    fn test_known_hmac_vector() {
        // RFC 4231 test case 2.
        let sig = sign_body("Jefe", b"what do ya want for nothing?");
        assert_eq!(
            sig,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(StatusCode::OK), Outcome::Delivered);
        assert_eq!(classify(StatusCode::NO_CONTENT), Outcome::Delivered);
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY),
            Outcome::Retryable(_)
        ));
        assert!(matches!(
            classify(StatusCode::REQUEST_TIMEOUT),
            Outcome::Retryable(_)
        ));
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS),
            Outcome::Retryable(_)
        ));
        assert!(matches!(
            classify(StatusCode::NOT_FOUND),
            Outcome::Terminal(_)
        ));
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED),
            Outcome::Terminal(_)
        ));
    }
}
