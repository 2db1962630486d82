//! Content moderation gate.
//!
//! Every text message is screened before persistence. A flagged verdict or
//! a moderation API failure blocks the send (the gate fails closed); file
//! messages carry no text and are not screened.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use crate::error::{RelayError, Result};

/// Comment Analyzer endpoint, keyed per request.
const ANALYZE_URL: &str =
    "https://commentanalyzer.googleapis.com/v1alpha1/comments:analyze";

/// Default summary-score threshold above which content is flagged.
const DEFAULT_THRESHOLD: f64 = 0.8;

/// Outcome of screening one piece of text.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub flagged: bool,
    pub toxicity: f64,
    pub threat: f64,
}

impl Verdict {
    pub fn clean() -> Self {
        Self { flagged: false, toxicity: 0.0, threat: 0.0 }
    }
}

/// The screening seam the dispatcher calls through.
#[async_trait]
pub trait ModerationGate: Send + Sync {
    async fn screen(&self, text: &str) -> Result<Verdict>;
}

/// Build the configured gate: Perspective when an API key is present,
/// otherwise an explicit allow-all.
pub fn from_env() -> Box<dyn ModerationGate> {
    match std::env::var("PERSPECTIVE_API_KEY") {
        Ok(key) if !key.is_empty() => {
            let threshold = std::env::var("PERSPECTIVE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_THRESHOLD);
            info!("Content moderation: Perspective (threshold {threshold})");
            Box::new(PerspectiveGate::new(key, threshold))
        }
        _ => {
            info!("Content moderation: disabled (no PERSPECTIVE_API_KEY), all text allowed");
            Box::new(AllowAllGate)
        }
    }
}

/// Gate backed by the Perspective Comment Analyzer API.
pub struct PerspectiveGate {
    client: reqwest::Client,
    api_key: String,
    threshold: f64,
    endpoint: String,
}

impl PerspectiveGate {
    pub fn new(api_key: String, threshold: f64) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            threshold,
            endpoint: ANALYZE_URL.to_string(),
        }
    }

    /// Point the gate at a different endpoint. Test hook.
    #[allow(dead_code)]
    pub fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = endpoint;
        self
    }

    fn verdict_from(&self, response: &AnalyzeResponse) -> Verdict {
        let score = |attribute: &str| {
            response
                .attribute_scores
                .get(attribute)
                .map(|a| a.summary_score.value)
                .unwrap_or(0.0)
        };
        let toxicity = score("TOXICITY");
        let threat = score("THREAT");
        Verdict {
            flagged: toxicity >= self.threshold || threat >= self.threshold,
            toxicity,
            threat,
        }
    }
}

#[async_trait]
impl ModerationGate for PerspectiveGate {
    async fn screen(&self, text: &str) -> Result<Verdict> {
        // The API rejects empty comments; nothing to screen anyway.
        if text.trim().is_empty() {
            return Ok(Verdict::clean());
        }

        let body = AnalyzeRequest {
            comment: Comment { text },
            requested_attributes: HashMap::from([
                ("TOXICITY", Attribute {}),
                ("THREAT", Attribute {}),
            ]),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::ModerationUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RelayError::ModerationUnavailable(format!(
                "analyze returned {}",
                response.status()
            )));
        }

        let parsed: AnalyzeResponse = response
            .json()
            .await
            .map_err(|e| RelayError::ModerationUnavailable(e.to_string()))?;

        Ok(self.verdict_from(&parsed))
    }
}

/// Gate used when no API key is configured: everything passes.
pub struct AllowAllGate;

#[async_trait]
impl ModerationGate for AllowAllGate {
    async fn screen(&self, _text: &str) -> Result<Verdict> {
        Ok(Verdict::clean())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest<'a> {
    comment: Comment<'a>,
    requested_attributes: HashMap<&'static str, Attribute>,
}

#[derive(Serialize)]
struct Comment<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct Attribute {}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResponse {
    #[serde(default)]
    attribute_scores: HashMap<String, AttributeScore>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttributeScore {
    summary_score: SummaryScore,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryScore {
    value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(threshold: f64) -> PerspectiveGate {
        PerspectiveGate::new("test-key".into(), threshold)
    }

    fn response(toxicity: f64, threat: f64) -> AnalyzeResponse {
        serde_json::from_value(serde_json::json!({
            "attributeScores": {
                "TOXICITY": { "summaryScore": { "value": toxicity, "type": "PROBABILITY" } },
                "THREAT": { "summaryScore": { "value": threat, "type": "PROBABILITY" } },
            },
            "languages": ["en"],
        }))
        .unwrap()
    }

    #[test]
    fn scores_below_threshold_pass() {
        let verdict = gate(0.8).verdict_from(&response(0.2, 0.1));
        assert!(!verdict.flagged);
        assert_eq!(verdict.toxicity, 0.2);
    }

    #[test]
    fn either_attribute_at_threshold_flags() {
        assert!(gate(0.8).verdict_from(&response(0.9, 0.0)).flagged);
        assert!(gate(0.8).verdict_from(&response(0.0, 0.8)).flagged);
    }

    #[test]
    fn missing_attributes_score_zero() {
        let parsed: AnalyzeResponse = serde_json::from_value(serde_json::json!({})).unwrap();
        let verdict = gate(0.8).verdict_from(&parsed);
        assert!(!verdict.flagged);
        assert_eq!(verdict.threat, 0.0);
    }

    #[tokio::test]
    async fn blank_text_short_circuits_clean() {
        // Never reaches the network: an unroutable endpoint would fail.
        let gate = gate(0.8).with_endpoint("http://127.0.0.1:1/analyze".into());
        let verdict = gate.screen("   ").await.unwrap();
        assert!(!verdict.flagged);
    }

    #[tokio::test]
    async fn allow_all_gate_passes_everything() {
        let verdict = AllowAllGate.screen("anything at all").await.unwrap();
        assert!(!verdict.flagged);
    }
}
