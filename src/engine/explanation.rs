use super::{read_success_body, ExplanationRequest, ExplanationService};
use crate::error::EndpointError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Tone and structure the explanation model is asked to follow.
pub const SYSTEM_INSTRUCTION: &str = "You are a friendly, professional assistant for medical imaging results. \
Your goal is to provide a non-diagnostic, informational explanation of a detected bone injury in plain language. \
Do not offer medical advice. Structure your response into an Explanation, Potential Treatment Options, and a Disclaimer. \
Use Markdown for formatting.";

#[derive(Debug, Clone)]
pub struct ExplanationClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(rename = "systemInstruction")]
    system_instruction: Content<'a>,
    tools: Vec<Tool>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<TextPart<'a>>,
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct Tool {
    google_search: GoogleSearch,
}

#[derive(Serialize)]
struct GoogleSearch {}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

/// Prompt asking for a patient-facing explanation of the primary finding.
pub fn build_user_prompt(request: &ExplanationRequest) -> String {
    let label = if request.label.is_empty() {
        "fracture"
    } else {
        request.label.as_str()
    };
    format!(
        "The detection model found a '{label}' in a bone X-ray with {}% confidence. \
Please provide a detailed analysis for a patient, including: \
1. A simple explanation of this fracture type. \
2. Common, general treatment options for this type of injury. \
3. A strong medical disclaimer emphasizing that this is NOT a diagnosis.",
        request.confidence_pct
    )
}

impl ExplanationClient {
    pub fn new(http: reqwest::Client, base_url: &str, model: &str, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        }
    }

    pub fn generate_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }
}

#[async_trait]
impl ExplanationService for ExplanationClient {
    async fn explain(&self, request: &ExplanationRequest) -> Result<String, EndpointError> {
        let url = self.generate_url();
        let prompt = build_user_prompt(request);
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![TextPart { text: &prompt }],
            }],
            system_instruction: Content {
                parts: vec![TextPart {
                    text: SYSTEM_INSTRUCTION,
                }],
            },
            tools: vec![Tool {
                google_search: GoogleSearch {},
            }],
        };

        // The key goes in the query string; never log the full URL with it.
        let mut req = self.http.post(&url).json(&body);
        if let Some(key) = self.api_key.as_deref() {
            req = req.query(&[("key", key)]);
        }

        info!(url = %url, label = %request.label, "requesting explanation");
        let resp = req.send().await?;
        let text = read_success_body(resp).await?;
        extract_text(&text)
    }
}

/// Pull `candidates[0].content.parts[0].text` out of a response body.
pub(crate) fn extract_text(body: &str) -> Result<String, EndpointError> {
    let parsed: GenerateResponse =
        serde_json::from_str(body).map_err(|e| EndpointError::Malformed(e.to_string()))?;
    parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .and_then(|c| c.parts.into_iter().next())
        .and_then(|p| p.text)
        .filter(|t| !t.trim().is_empty())
        .ok_or(EndpointError::EmptyResponse("candidate text"))
}
