//! AnalysisClient - Generative Lip Analysis
//!
//! ## Responsibilities
//!
//! - Submit a captured lip image with the fixed analysis instruction to
//!   the generateContent endpoint
//! - Decode the structured hydration report out of the model response
//! - Classify failures: transport, model refusal, malformed payload
//!
//! One request per submitted image; retry is the caller's decision.

use crate::error::{Error, Result};
use crate::models::Report;
use base64::Engine;
use std::time::Duration;

pub mod types;

use types::{
    ApiError, Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig,
    InlineData, Part,
};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Instruction sent with every image. The response contract (field names,
/// status strings, metric ranges) is what models.rs deserializes.
const ANALYSIS_INSTRUCTION: &str = r#"You are a dermatology analysis assistant. Examine the provided photograph of a person's lips and assess their hydration.

Respond with a single JSON object and no surrounding prose, using exactly this shape:
{
  "dehydration_status": one of "Hydrated", "Mildly Dehydrated", "Severely Dehydrated",
  "metrics": {
    "crack_intensity": integer 0-100,
    "dryness_level": integer 0-100,
    "moisture_score": integer 0-100,
    "color_description": short string describing the lip color
  },
  "visual_observations": array of short strings describing visible features,
  "recommendations": array of short, actionable care suggestions,
  "summary": one or two sentences of overall assessment
}

If the image does not clearly show lips, still return the JSON with your best estimate and note the uncertainty in the summary."#;

/// AnalysisClient instance
pub struct AnalysisClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl AnalysisClient {
    /// Create new AnalysisClient
    pub fn new(base_url: &str, model: &str, api_key: &str) -> Self {
        Self::with_timeout(base_url, model, api_key, DEFAULT_TIMEOUT_SECS)
    }

    /// Create with custom timeout (for testing)
    pub fn with_timeout(base_url: &str, model: &str, api_key: &str, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// Analyze a PNG image and return the structured report
    pub async fn analyze(&self, png: &[u8]) -> Result<Report> {
        let url = format!(
            "{}/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let body = self.build_request(png);

        tracing::debug!(model = %self.model, image_size = png.len(), "Submitting image for analysis");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::AnalysisTransport(format!("request failed: {}", e)))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            tracing::warn!(status = %status, "Analysis endpoint returned error status");
            // 4xx系は本文に構造化エラーが入る。あれば拒否として扱う
            if let Ok(envelope) = serde_json::from_str::<GenerateContentResponse>(&text) {
                if let Some(api_error) = &envelope.error {
                    return Err(refusal(api_error));
                }
            }
            return Err(Error::AnalysisTransport(format!(
                "analysis endpoint returned {}: {}",
                status,
                truncate(&text, 200)
            )));
        }

        let envelope: GenerateContentResponse = serde_json::from_str(&text)
            .map_err(|e| Error::AnalysisParse(format!("malformed response envelope: {}", e)))?;

        if let Some(api_error) = &envelope.error {
            return Err(refusal(api_error));
        }

        if let Some(feedback) = &envelope.prompt_feedback {
            if let Some(reason) = &feedback.block_reason {
                return Err(Error::AnalysisRefused(format!("prompt blocked: {}", reason)));
            }
        }

        let Some(report_text) = envelope.first_text() else {
            return Err(Error::AnalysisRefused(
                "response carried no candidate text".to_string(),
            ));
        };

        let report: Report = serde_json::from_str(strip_code_fences(report_text))
            .map_err(|e| Error::AnalysisParse(format!("report decode failed: {}", e)))?;
        report.validate()?;

        tracing::info!(
            status = %report.dehydration_status,
            moisture = report.metrics.moisture_score,
            "Analysis completed"
        );

        Ok(report)
    }

    fn build_request(&self, png: &[u8]) -> GenerateContentRequest {
        let data = base64::engine::general_purpose::STANDARD.encode(png);

        GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![
                    Part::InlineData {
                        inline_data: InlineData {
                            mime_type: "image/png".to_string(),
                            data,
                        },
                    },
                    Part::Text {
                        text: "Analyze the lips in this photograph.".to_string(),
                    },
                ],
            }],
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part::Text {
                    text: ANALYSIS_INSTRUCTION.to_string(),
                }],
            }),
            generation_config: Some(GenerationConfig {
                response_mime_type: Some("application/json".to_string()),
                temperature: None,
            }),
        }
    }
}

fn refusal(api_error: &ApiError) -> Error {
    Error::AnalysisRefused(format!(
        "endpoint reported error (code {:?}, status {:?}): {}",
        api_error.code,
        api_error.status,
        api_error.message.as_deref().unwrap_or("no message")
    ))
}

/// Remove a Markdown code fence around the payload, if present.
/// モデルはJSON指定でもフェンスを付けて返すことがある。
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    inner.trim()
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DehydrationStatus;
    use axum::extract::Json;
    use axum::http::StatusCode;
    use axum::Router;
    use std::sync::{Arc, Mutex};

    async fn spawn_stub(status: StatusCode, body: serde_json::Value) -> String {
        let body = body.to_string();
        // The path contains a colon, so the stub answers on every route
        let app = Router::new().fallback(move || {
            let body = body.clone();
            async move { (status, [("content-type", "application/json")], body) }
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{}", addr)
    }

    fn report_json() -> serde_json::Value {
        serde_json::json!({
            "dehydration_status": "Mildly Dehydrated",
            "metrics": {
                "crack_intensity": 40,
                "dryness_level": 55,
                "moisture_score": 45,
                "color_description": "pale pink with dull patches"
            },
            "visual_observations": ["Visible vertical cracking on the lower lip"],
            "recommendations": ["Apply a hydrating balm", "Increase water intake"],
            "summary": "Mild dryness with early cracking."
        })
    }

    fn envelope_with_text(text: String) -> serde_json::Value {
        serde_json::json!({
            "candidates": [
                {
                    "content": { "role": "model", "parts": [{ "text": text }] },
                    "finishReason": "STOP"
                }
            ]
        })
    }

    #[tokio::test]
    async fn test_analyze_decodes_report() {
        let base = spawn_stub(StatusCode::OK, envelope_with_text(report_json().to_string())).await;
        let client = AnalysisClient::with_timeout(&base, "test-model", "test-key", 5);

        let report = client.analyze(b"fake png bytes").await.unwrap();
        assert_eq!(report.dehydration_status, DehydrationStatus::MildlyDehydrated);
        assert_eq!(report.metrics.moisture_score, 45);
        assert_eq!(
            report.metrics.color_description.as_deref(),
            Some("pale pink with dull patches")
        );
        assert_eq!(report.recommendations.len(), 2);
    }

    #[tokio::test]
    async fn test_analyze_accepts_fenced_report() {
        let fenced = format!("```json\n{}\n```", report_json());
        let base = spawn_stub(StatusCode::OK, envelope_with_text(fenced)).await;
        let client = AnalysisClient::with_timeout(&base, "test-model", "test-key", 5);

        let report = client.analyze(b"fake png bytes").await.unwrap();
        assert_eq!(report.metrics.dryness_level, 55);
    }

    #[tokio::test]
    async fn test_http_error_is_transport() {
        let base = spawn_stub(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({"boom": true}),
        )
        .await;
        let client = AnalysisClient::with_timeout(&base, "test-model", "test-key", 5);

        let err = client.analyze(b"fake png bytes").await.unwrap_err();
        assert!(matches!(err, Error::AnalysisTransport(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport() {
        let client = AnalysisClient::with_timeout("http://127.0.0.1:1", "test-model", "k", 2);

        let err = client.analyze(b"fake png bytes").await.unwrap_err();
        assert!(matches!(err, Error::AnalysisTransport(_)));
    }

    #[tokio::test]
    async fn test_error_body_is_refusal() {
        let body = serde_json::json!({
            "error": { "code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED" }
        });
        let base = spawn_stub(StatusCode::OK, body).await;
        let client = AnalysisClient::with_timeout(&base, "test-model", "test-key", 5);

        let err = client.analyze(b"fake png bytes").await.unwrap_err();
        match err {
            Error::AnalysisRefused(msg) => assert!(msg.contains("Quota exceeded")),
            other => panic!("expected refusal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_status_with_api_error_is_refusal() {
        let body = serde_json::json!({
            "error": { "code": 400, "message": "API key not valid", "status": "INVALID_ARGUMENT" }
        });
        let base = spawn_stub(StatusCode::BAD_REQUEST, body).await;
        let client = AnalysisClient::with_timeout(&base, "test-model", "test-key", 5);

        let err = client.analyze(b"fake png bytes").await.unwrap_err();
        match err {
            Error::AnalysisRefused(msg) => assert!(msg.contains("API key not valid")),
            other => panic!("expected refusal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blocked_prompt_is_refusal() {
        let body = serde_json::json!({
            "candidates": [],
            "promptFeedback": { "blockReason": "SAFETY" }
        });
        let base = spawn_stub(StatusCode::OK, body).await;
        let client = AnalysisClient::with_timeout(&base, "test-model", "test-key", 5);

        let err = client.analyze(b"fake png bytes").await.unwrap_err();
        assert!(matches!(err, Error::AnalysisRefused(_)));
    }

    #[tokio::test]
    async fn test_empty_candidates_is_refusal() {
        let base = spawn_stub(StatusCode::OK, serde_json::json!({ "candidates": [] })).await;
        let client = AnalysisClient::with_timeout(&base, "test-model", "test-key", 5);

        let err = client.analyze(b"fake png bytes").await.unwrap_err();
        assert!(matches!(err, Error::AnalysisRefused(_)));
    }

    #[tokio::test]
    async fn test_malformed_report_is_parse_error() {
        let base = spawn_stub(
            StatusCode::OK,
            envelope_with_text("this is not a report".to_string()),
        )
        .await;
        let client = AnalysisClient::with_timeout(&base, "test-model", "test-key", 5);

        let err = client.analyze(b"fake png bytes").await.unwrap_err();
        assert!(matches!(err, Error::AnalysisParse(_)));
    }

    #[tokio::test]
    async fn test_out_of_range_metric_is_parse_error() {
        let mut report = report_json();
        report["metrics"]["moisture_score"] = serde_json::json!(150);
        let base = spawn_stub(StatusCode::OK, envelope_with_text(report.to_string())).await;
        let client = AnalysisClient::with_timeout(&base, "test-model", "test-key", 5);

        let err = client.analyze(b"fake png bytes").await.unwrap_err();
        assert!(matches!(err, Error::AnalysisParse(_)));
    }

    #[tokio::test]
    async fn test_request_wire_shape() {
        let captured: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        let body = envelope_with_text(report_json().to_string()).to_string();

        let app = Router::new().fallback(move |Json(value): Json<serde_json::Value>| {
            let sink = sink.clone();
            let body = body.clone();
            async move {
                *sink.lock().unwrap() = Some(value);
                (StatusCode::OK, [("content-type", "application/json")], body)
            }
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client =
            AnalysisClient::with_timeout(&format!("http://{}", addr), "test-model", "test-key", 5);
        client.analyze(b"fake png bytes").await.unwrap();

        let request = captured.lock().unwrap().take().unwrap();
        let part = &request["contents"][0]["parts"][0]["inlineData"];
        assert_eq!(part["mimeType"], "image/png");
        assert_eq!(
            part["data"],
            base64::engine::general_purpose::STANDARD.encode(b"fake png bytes")
        );
        assert!(request["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("dehydration_status"));
        assert_eq!(
            request["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }
}
