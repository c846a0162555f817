//! Verification capability: crop in, label and confidence out.
//!
//! Backends are interchangeable implementations of [`Verifier`] chosen when the
//! engine is constructed. Two are provided: [`HttpVerifier`] for a remote
//! recognition/OCR service and [`LocalVerifier`] for an in-process model.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Timestamp;
use crate::error::VerificationError;
use crate::session::CropRef;

/// Identity assigned by verification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    #[default]
    Unknown,
    Known(String),
}

impl Label {
    /// Normalise a service-provided name; blank and "unknown" mean no match.
    pub fn from_service(name: Option<&str>) -> Self {
        match name.map(str::trim) {
            None | Some("") => Label::Unknown,
            Some(s) if s.eq_ignore_ascii_case("unknown") => Label::Unknown,
            Some(s) => Label::Known(s.to_string()),
        }
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        matches!(self, Label::Known(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Label::Unknown => "unknown",
            Label::Known(name) => name,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw answer of a verification backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub label: Label,
    /// Confidence on a 0-100 scale.
    pub confidence: f32,
}

impl Verdict {
    pub fn known(name: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: Label::Known(name.into()),
            confidence,
        }
    }

    pub fn unknown() -> Self {
        Self {
            label: Label::Unknown,
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultSource {
    Cache,
    External,
}

/// Last known verification outcome for a cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub label: Label,
    pub confidence: f32,
    pub source: ResultSource,
    pub verified_at: Timestamp,
}

impl VerificationResult {
    pub fn from_verdict(verdict: Verdict, verified_at: Timestamp) -> Self {
        let confidence = if verdict.confidence.is_finite() {
            verdict.confidence.clamp(0.0, 100.0)
        } else {
            0.0
        };
        Self {
            label: verdict.label,
            confidence,
            source: ResultSource::External,
            verified_at,
        }
    }

    /// Placeholder recorded when a call failed or timed out.
    pub fn unresolved(verified_at: Timestamp) -> Self {
        Self {
            label: Label::Unknown,
            confidence: 0.0,
            source: ResultSource::External,
            verified_at,
        }
    }

    /// A confirmed match: resolved label at or above `min_confidence`.
    #[inline]
    pub fn is_confirmed(&self, min_confidence: f32) -> bool {
        self.label.is_resolved() && self.confidence >= min_confidence
    }

    pub fn as_cached(&self) -> Self {
        Self {
            source: ResultSource::Cache,
            ..self.clone()
        }
    }
}

/// Trait for verification backends.
///
/// Implement this trait to connect a recognition service or model to the engine.
///
/// # Example
///
/// ```ignore
/// use tracksession_rs::{CropRef, Verdict, VerificationError, Verifier};
///
/// struct PlateReader;
///
/// #[async_trait::async_trait]
/// impl Verifier for PlateReader {
///     async fn verify(&self, crop: &CropRef) -> Result<Verdict, VerificationError> {
///         Ok(Verdict::known("ABC-123", 88.0))
///     }
/// }
/// ```
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str {
        "verifier"
    }

    /// Map an image crop to a label and confidence.
    async fn verify(&self, crop: &CropRef) -> Result<Verdict, VerificationError>;
}

// ============================================================================
// REMOTE BACKEND
// ============================================================================

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    image_base64: String,
    content_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    label: Option<String>,
    #[serde(default)]
    confidence: f32,
}

/// Remote recognition service reached over HTTP.
///
/// Sends `POST {base_url}/verify` with the crop as base64 JSON and expects
/// `{"label": "...", "confidence": 0-100}` back.
pub struct HttpVerifier {
    http_client: reqwest::Client,
    endpoint: String,
    hint: Option<String>,
    timeout: Duration,
}

impl HttpVerifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, VerificationError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VerificationError::Backend(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            endpoint: format!("{}/verify", base_url.trim_end_matches('/')),
            hint: None,
            timeout,
        })
    }

    /// Attach a task hint (e.g. "face" or "plate") sent with every request.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_request(&self, crop: &CropRef) -> VerifyRequest<'_> {
        VerifyRequest {
            image_base64: base64::engine::general_purpose::STANDARD.encode(crop.as_bytes()),
            content_length: crop.len(),
            hint: self.hint.as_deref(),
        }
    }
}

fn parse_response(body: &str) -> Result<Verdict, VerificationError> {
    let response: VerifyResponse =
        serde_json::from_str(body).map_err(|e| VerificationError::Decode(e.to_string()))?;
    Ok(Verdict {
        label: Label::from_service(response.label.as_deref()),
        confidence: response.confidence,
    })
}

#[async_trait]
impl Verifier for HttpVerifier {
    fn name(&self) -> &str {
        "http"
    }

    async fn verify(&self, crop: &CropRef) -> Result<Verdict, VerificationError> {
        let request = self.build_request(crop);
        debug!(endpoint = %self.endpoint, bytes = crop.len(), "sending verification request");

        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| VerificationError::from_reqwest(e, self.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| VerificationError::from_reqwest(e, self.timeout))?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "verification service rejected request");
            return Err(VerificationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        parse_response(&body)
    }
}

// ============================================================================
// LOCAL BACKEND
// ============================================================================

/// In-process model wrapped as a verifier.
///
/// The closure is blocking and runs on tokio's blocking pool so it never
/// stalls the runtime that drives frame ingestion.
pub struct LocalVerifier<F> {
    model: Arc<F>,
}

impl<F> LocalVerifier<F>
where
    F: Fn(&[u8]) -> Result<Verdict, VerificationError> + Send + Sync + 'static,
{
    pub fn new(model: F) -> Self {
        Self {
            model: Arc::new(model),
        }
    }
}

#[async_trait]
impl<F> Verifier for LocalVerifier<F>
where
    F: Fn(&[u8]) -> Result<Verdict, VerificationError> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "local"
    }

    async fn verify(&self, crop: &CropRef) -> Result<Verdict, VerificationError> {
        let model = Arc::clone(&self.model);
        let crop = crop.clone();
        tokio::task::spawn_blocking(move || model(crop.as_bytes()))
            .await
            .map_err(|e| VerificationError::Backend(format!("local model panicked: {e}")))?
    }
}
