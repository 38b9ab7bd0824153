use super::{read_success_body, DetectionService};
use crate::error::EndpointError;
use crate::model::{BoundingBox, Detection, DetectionResult, SelectedImage};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, info};

const PREDICT_PATH: &str = "/predict_yolo";
/// Multipart field the inference server reads the image from.
const IMAGE_FIELD: &str = "file";

#[derive(Debug, Clone)]
pub struct DetectionClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct PredictResponse {
    detections: Option<Vec<WireDetection>>,
}

#[derive(Deserialize)]
struct WireDetection {
    #[serde(alias = "label")]
    name: Option<String>,
    confidence: f64,
    xmin: f64,
    ymin: f64,
    xmax: f64,
    ymax: f64,
}

impl DetectionClient {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn predict_url(&self) -> String {
        format!("{}{}", self.base_url, PREDICT_PATH)
    }
}

#[async_trait]
impl DetectionService for DetectionClient {
    async fn detect(&self, image: &SelectedImage) -> Result<DetectionResult, EndpointError> {
        let url = self.predict_url();
        let part = Part::bytes(image.bytes.to_vec())
            .file_name(image.file_name.clone())
            .mime_str(image.mime_type)?;
        let form = Form::new().part(IMAGE_FIELD, part);

        info!(url = %url, file = %image.file_name, bytes = image.bytes.len(), "uploading image for detection");
        let resp = self.http.post(&url).multipart(form).send().await?;
        let body = read_success_body(resp).await?;
        let result = parse_detections(&body)?;
        debug!(count = result.detections.len(), "detection response parsed");
        Ok(result)
    }
}

/// Parse and validate a detection response body.
pub(crate) fn parse_detections(body: &str) -> Result<DetectionResult, EndpointError> {
    let parsed: PredictResponse =
        serde_json::from_str(body).map_err(|e| EndpointError::Malformed(e.to_string()))?;
    let wire = parsed
        .detections
        .ok_or(EndpointError::EmptyResponse("the detections array"))?;

    let mut detections = Vec::with_capacity(wire.len());
    for (idx, d) in wire.into_iter().enumerate() {
        let values = [d.confidence, d.xmin, d.ymin, d.xmax, d.ymax];
        if values.iter().any(|v| !v.is_finite() || !(0.0..=1.0).contains(v)) {
            return Err(EndpointError::Malformed(format!(
                "detection {idx} has values outside [0, 1]"
            )));
        }
        detections.push(Detection {
            label: d.name.unwrap_or_default(),
            confidence: d.confidence,
            bounding_box: BoundingBox {
                xmin: d.xmin,
                ymin: d.ymin,
                xmax: d.xmax,
                ymax: d.ymax,
            },
        });
    }
    Ok(DetectionResult { detections })
}
