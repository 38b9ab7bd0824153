//! Outbound endpoint clients.
//!
//! The controller talks to the two external services only through the
//! [`DetectionService`] and [`ExplanationService`] traits; the HTTP clients in
//! this module are the production implementations.

mod detection;
mod explanation;

pub use detection::DetectionClient;
pub use explanation::{build_user_prompt, ExplanationClient, SYSTEM_INSTRUCTION};

use crate::error::EndpointError;
use crate::model::{Detection, DetectionResult, SelectedImage, WorkflowConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Longest server error body kept in [`EndpointError::Server`].
pub const MAX_ERROR_BODY_CHARS: usize = 300;

/// Extra room on the transport timeout so the per-call deadline fires first.
const CLIENT_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// Locates findings in an uploaded image.
#[async_trait]
pub trait DetectionService: Send + Sync {
    async fn detect(&self, image: &SelectedImage) -> Result<DetectionResult, EndpointError>;
}

/// Produces a plain-language explanation for a finding.
#[async_trait]
pub trait ExplanationService: Send + Sync {
    async fn explain(&self, request: &ExplanationRequest) -> Result<String, EndpointError>;
}

/// Everything the explanation endpoint needs about the primary finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplanationRequest {
    pub label: String,
    /// Confidence as a percentage with two decimals, e.g. "87.00".
    pub confidence_pct: String,
}

impl ExplanationRequest {
    pub fn for_finding(finding: &Detection) -> Self {
        Self {
            label: finding.label.trim().to_string(),
            confidence_pct: finding.confidence_pct(),
        }
    }
}

/// Build the shared HTTP client used by both endpoint clients.
pub fn build_http_client(cfg: &WorkflowConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(cfg.user_agent.clone())
        .timeout(cfg.request_timeout.saturating_add(CLIENT_TIMEOUT_SLACK))
        .build()
        .context("build http client")
}

/// Production services wired from configuration.
pub fn http_services(
    cfg: &WorkflowConfig,
) -> Result<(Arc<dyn DetectionService>, Arc<dyn ExplanationService>)> {
    let http = build_http_client(cfg)?;
    let detector = DetectionClient::new(http.clone(), &cfg.detect_base_url);
    let explainer = ExplanationClient::new(
        http,
        &cfg.explain_base_url,
        &cfg.explain_model,
        cfg.api_key.clone(),
    );
    Ok((Arc::new(detector), Arc::new(explainer)))
}

/// Return the body as text, or a `Server` error for non-2xx statuses.
async fn read_success_body(resp: reqwest::Response) -> Result<String, EndpointError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(EndpointError::Server {
            status: status.as_u16(),
            body: clip_error_body(&body),
        });
    }
    Ok(resp.text().await?)
}

fn clip_error_body(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((end, _)) => format!("{}...", &body[..end]),
        None => body.to_string(),
    }
}
