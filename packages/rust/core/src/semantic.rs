//! JSON client for an external semantic extraction service.
//!
//! Request: `POST {endpoint}` with
//! `{"text": "...", "fields": [{"name", "kind", "required"}], "model"?}`.
//!
//! Response: `{"items": [{field: value | [values]}], "confidence": 0.8}`.
//! A single-record service may answer with `"fields": {...}` instead of
//! `"items"`. Non-string scalars are stringified and nulls dropped.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use adaptcrawl_shared::{
    AdaptError, FieldSchema, FieldValue, Item, Result, SemanticConfig, SemanticExtractor,
    SemanticOutput,
};

#[derive(Serialize)]
struct ExtractRequest<'a> {
    text: &'a str,
    fields: &'a FieldSchema,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Deserialize)]
struct ExtractResponse {
    #[serde(default)]
    items: Vec<Map<String, Value>>,
    #[serde(default)]
    fields: Option<Map<String, Value>>,
    #[serde(default)]
    confidence: f64,
}

/// `reqwest` client for the semantic extraction endpoint.
#[derive(Debug)]
pub struct HttpSemanticExtractor {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: Option<String>,
}

impl HttpSemanticExtractor {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdaptError::config(format!("failed to build semantic client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            model,
        })
    }

    /// Build from `[semantic]`; `None` when no endpoint is configured.
    ///
    /// The API key is read from the env var named by `api_key_env`; a missing
    /// variable means unauthenticated requests.
    pub fn from_config(config: &SemanticConfig, timeout: Duration) -> Result<Option<Self>> {
        let Some(endpoint) = &config.endpoint else {
            return Ok(None);
        };
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            warn!(var = %config.api_key_env, "semantic API key not set, sending unauthenticated requests");
        }
        Self::new(endpoint.clone(), api_key, config.model.clone(), timeout).map(Some)
    }
}

#[async_trait]
impl SemanticExtractor for HttpSemanticExtractor {
    async fn extract(&self, text: &str, schema: &FieldSchema) -> Result<SemanticOutput> {
        let body = ExtractRequest {
            text,
            fields: schema,
            model: self.model.as_deref(),
        };
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AdaptError::ExtractionBackend(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AdaptError::ExtractionBackend(format!(
                "service returned HTTP {status}"
            )));
        }

        let parsed: ExtractResponse = response
            .json()
            .await
            .map_err(|e| AdaptError::ExtractionBackend(format!("invalid response body: {e}")))?;

        let mut items: Vec<Item> = parsed.items.into_iter().map(to_item).collect();
        if items.is_empty() {
            items.extend(parsed.fields.map(to_item));
        }
        debug!(items = items.len(), confidence = parsed.confidence, "semantic extraction done");

        Ok(SemanticOutput {
            items,
            self_reported_confidence: parsed.confidence.clamp(0.0, 1.0),
        })
    }
}

fn to_item(map: Map<String, Value>) -> Item {
    map.into_iter()
        .filter_map(|(name, value)| to_field_value(value).map(|v| (name, v)))
        .collect()
}

fn to_field_value(value: Value) -> Option<FieldValue> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(FieldValue::Single(s)),
        Value::Array(values) => {
            let list: Vec<String> = values.into_iter().filter_map(scalar_string).collect();
            (!list.is_empty()).then_some(FieldValue::List(list))
        }
        other => scalar_string(other).map(FieldValue::Single),
    }
}

fn scalar_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adaptcrawl_shared::{FieldKind, FieldSpec};
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn schema() -> FieldSchema {
        FieldSchema::new(vec![
            FieldSpec::required("title", FieldKind::Text),
            FieldSpec::optional("price", FieldKind::Number),
        ])
    }

    #[tokio::test]
    async fn sends_text_and_schema_and_maps_items() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer k3y"))
            .and(body_partial_json(serde_json::json!({
                "text": "Blue kettle 19.99",
                "fields": [{ "name": "title" }, { "name": "price" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    { "title": "Blue kettle", "price": 19.99, "tags": ["home", "kitchen"], "note": null }
                ],
                "confidence": 0.9
            })))
            .mount(&server)
            .await;

        let client = HttpSemanticExtractor::new(
            server.uri(),
            Some("k3y".into()),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        let out = client.extract("Blue kettle 19.99", &schema()).await.unwrap();

        assert_eq!(out.items.len(), 1);
        let item = &out.items[0];
        assert_eq!(item["title"], FieldValue::Single("Blue kettle".into()));
        assert_eq!(item["price"], FieldValue::Single("19.99".into()));
        assert_eq!(
            item["tags"],
            FieldValue::List(vec!["home".into(), "kitchen".into()])
        );
        assert!(!item.contains_key("note"));
        assert!((out.self_reported_confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn single_record_fields_form_is_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "fields": { "title": "Only one" },
                "confidence": 1.7
            })))
            .mount(&server)
            .await;

        let client = HttpSemanticExtractor::new(server.uri(), None, None, Duration::from_secs(5)).unwrap();
        let out = client.extract("text", &schema()).await.unwrap();
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.self_reported_confidence, 1.0);
    }

    #[tokio::test]
    async fn server_error_is_a_backend_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let client = HttpSemanticExtractor::new(server.uri(), None, None, Duration::from_secs(5)).unwrap();
        let err = client.extract("text", &schema()).await.unwrap_err();
        assert!(matches!(err, AdaptError::ExtractionBackend(_)));
    }

    #[test]
    fn no_endpoint_means_no_extractor() {
        let config = SemanticConfig::default();
        assert!(
            HttpSemanticExtractor::from_config(&config, Duration::from_secs(1))
                .unwrap()
                .is_none()
        );
    }
}
