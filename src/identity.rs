//! Photo comparison collaborator.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::model::Verdict;
use crate::photo::ImagePayload;

/// Compares a reference photo against a freshly captured one.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn compare(&self, reference: &ImagePayload, submitted: &ImagePayload)
        -> Result<Verdict>;
}

#[derive(Clone)]
pub struct HttpIdentityClient {
    http: Client,
    endpoint: Url,
    api_key: String,
}

impl fmt::Debug for HttpIdentityClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpIdentityClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpIdentityClient {
    pub fn new(endpoint: Url, api_key: String, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent("attendance-sync/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build identity http client")?;
        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let endpoint = Url::parse(&cfg.identity.endpoint).context("invalid identity endpoint")?;
        Self::new(endpoint, cfg.identity.api_key.clone(), cfg.identity_timeout())
    }

    pub fn build_request(&self, body: &Value) -> Result<reqwest::Request> {
        self.http
            .post(self.endpoint.clone())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .build()
            .context("failed to build identity request")
    }
}

#[async_trait]
impl IdentityService for HttpIdentityClient {
    async fn compare(
        &self,
        reference: &ImagePayload,
        submitted: &ImagePayload,
    ) -> Result<Verdict> {
        let body = build_compare_request(reference, submitted);
        let request = self.build_request(&body)?;
        debug!(url = %request.url(), "sending identity comparison");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach identity service")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("received 429 from identity service: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("identity service error {}: {}", status, body));
        }

        let payload: CompareResponse = res
            .json()
            .await
            .context("invalid identity service response")?;
        payload.into_verdict()
    }
}

pub fn build_compare_request(reference: &ImagePayload, submitted: &ImagePayload) -> Value {
    json!({
        "referencePhoto": reference.to_data_uri(),
        "submittedPhoto": submitted.to_data_uri(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareResponse {
    pub is_validated: bool,
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
}

impl CompareResponse {
    /// Confidence is clamped into [0, 1]; a non-finite value is an error.
    pub fn into_verdict(self) -> Result<Verdict> {
        if !self.confidence.is_finite() {
            return Err(anyhow!("identity service returned non-finite confidence"));
        }
        Ok(Verdict {
            is_match: self.is_validated,
            confidence: self.confidence.clamp(0.0, 1.0),
            reason: self.reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpIdentityClient {
        HttpIdentityClient::new(
            Url::parse("https://faces.example.com/v1/compare").unwrap(),
            "secret".into(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn compare_request_carries_both_photos_as_data_uris() {
        let reference = ImagePayload::jpeg(vec![0xff, 0xd8]);
        let submitted = ImagePayload::new("image/png", vec![0x89, 0x50]);
        let body = build_compare_request(&reference, &submitted);
        assert_eq!(body["referencePhoto"], "data:image/jpeg;base64,/9g=");
        assert_eq!(body["submittedPhoto"], "data:image/png;base64,iVA=");
    }

    #[test]
    fn build_request_sets_headers() {
        let request = client().build_request(&json!({ "sample": true })).unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/v1/compare");
        let headers = request.headers();
        assert_eq!(
            headers
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer secret"
        );
        assert_eq!(
            headers
                .get("Content-Type")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "application/json"
        );
    }

    #[test]
    fn response_maps_to_clamped_verdict() {
        let resp: CompareResponse = serde_json::from_str(
            r#"{"isValidated": true, "confidence": 1.4, "reason": "same face"}"#,
        )
        .unwrap();
        let verdict = resp.into_verdict().unwrap();
        assert!(verdict.is_match);
        assert_eq!(verdict.confidence, 1.0);
        assert_eq!(verdict.reason, "same face");

        let resp: CompareResponse =
            serde_json::from_str(r#"{"isValidated": false, "confidence": -0.2}"#).unwrap();
        let verdict = resp.into_verdict().unwrap();
        assert!(!verdict.is_match);
        assert_eq!(verdict.confidence, 0.0);
        assert_eq!(verdict.reason, "");
    }

    #[test]
    fn non_finite_confidence_is_rejected() {
        let resp = CompareResponse {
            is_validated: true,
            confidence: f64::NAN,
            reason: String::new(),
        };
        assert!(resp.into_verdict().is_err());
    }
}
