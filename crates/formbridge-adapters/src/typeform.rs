//! Typeform Responses API and form definitions.

use std::collections::HashMap;

use async_trait::async_trait;
use formbridge_core::SchemaGeneration;
use formbridge_storage::{HttpClient, HttpClientConfig, HttpError};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::{AdapterError, AnswerType, RawAnswer, RawSubmission, SourceBatch, SubmissionSource};

#[derive(Debug, Clone)]
pub struct TypeformConfig {
    pub token: String,
    pub form_id: String,
    pub api_base: String,
    pub page_size: usize,
}

impl TypeformConfig {
    pub fn new(token: impl Into<String>, form_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            form_id: form_id.into(),
            api_base: "https://api.typeform.com".to_string(),
            page_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponsePage {
    #[serde(default)]
    pub total_items: Option<u64>,
    #[serde(default)]
    pub items: Vec<ResponseItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseItem {
    #[serde(default)]
    pub response_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<String>,
    #[serde(default)]
    pub response_type: Option<String>,
    #[serde(default)]
    pub answers: Option<Vec<Answer>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnswerField {
    pub id: String,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceValue {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub other: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChoicesValue {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub other: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Answer {
    pub field: AnswerField,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub choice: Option<ChoiceValue>,
    #[serde(default)]
    pub choices: Option<ChoicesValue>,
    #[serde(default)]
    pub number: Option<f64>,
    #[serde(default)]
    pub boolean: Option<bool>,
    #[serde(default)]
    pub date: Option<String>,
}

impl Answer {
    /// Answer value as text, picked by the answer's declared type.
    pub fn value(&self) -> Option<String> {
        match self.kind.as_str() {
            "text" => self.text.clone(),
            "email" => self.email.clone(),
            "phone_number" => self.phone_number.clone(),
            "url" => self.url.clone(),
            "choice" => self
                .choice
                .as_ref()
                .and_then(|c| c.label.clone().or_else(|| c.other.clone())),
            "choices" => self.choices.as_ref().map(|c| {
                let mut labels = c.labels.clone();
                labels.extend(c.other.clone());
                labels.join(", ")
            }),
            "number" => self.number.map(|n| {
                if n.fract() == 0.0 {
                    format!("{}", n as i64)
                } else {
                    n.to_string()
                }
            }),
            "boolean" => self.boolean.map(|b| if b { "Yes" } else { "No" }.to_string()),
            "date" => self.date.clone(),
            _ => None,
        }
    }
}

/// Field id → question title, group fields flattened.
#[derive(Debug, Clone, Default)]
pub struct FormDefinition {
    titles: HashMap<String, String>,
}

impl FormDefinition {
    pub fn from_json(form: &JsonValue) -> Self {
        let mut titles = HashMap::new();
        if let Some(fields) = form.get("fields").and_then(JsonValue::as_array) {
            collect_titles(fields, &mut titles);
        }
        Self { titles }
    }

    pub fn title(&self, field_id: &str) -> Option<&str> {
        self.titles.get(field_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.titles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.titles.is_empty()
    }
}

fn collect_titles(fields: &[JsonValue], titles: &mut HashMap<String, String>) {
    for field in fields {
        if let (Some(id), Some(title)) = (
            field.get("id").and_then(JsonValue::as_str),
            field.get("title").and_then(JsonValue::as_str),
        ) {
            titles.insert(id.to_string(), title.to_string());
        }
        if let Some(children) = field
            .pointer("/properties/fields")
            .and_then(JsonValue::as_array)
        {
            collect_titles(children, titles);
        }
    }
}

/// Partial responses report a zero timestamp instead of omitting it.
fn real_timestamp(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.starts_with("0001-01-01"))
        .map(str::to_string)
}

pub fn to_raw_submission(item: &ResponseItem, form: &FormDefinition) -> RawSubmission {
    let submitted_at = real_timestamp(item.submitted_at.as_deref());
    let partial = item.response_type.as_deref() == Some("partial");
    let answers = item
        .answers
        .iter()
        .flatten()
        .filter_map(|answer| {
            let value = answer.value()?;
            Some(RawAnswer {
                field_id: answer.field.id.clone(),
                title: form
                    .title(&answer.field.id)
                    .map(str::to_string)
                    .or_else(|| answer.field.reference.clone()),
                answer_type: AnswerType::from_api(&answer.kind),
                value,
            })
        })
        .collect();
    RawSubmission {
        answers,
        completed: !partial && submitted_at.is_some(),
        submitted_at,
        response_id: item.response_id.clone().or_else(|| item.token.clone()),
    }
}

#[derive(Debug)]
pub struct TypeformClient {
    http: HttpClient,
    config: TypeformConfig,
}

impl TypeformClient {
    pub fn new(config: TypeformConfig, mut http: HttpClientConfig) -> Result<Self, HttpError> {
        http.bearer_token = Some(config.token.clone());
        Ok(Self {
            http: HttpClient::new(http)?,
            config,
        })
    }

    pub fn config(&self) -> &TypeformConfig {
        &self.config
    }

    pub async fn fetch_form(&self) -> Result<FormDefinition, HttpError> {
        let url = format!("{}/forms/{}", self.config.api_base, self.config.form_id);
        let form = self.http.get_json(&url).await?;
        Ok(FormDefinition::from_json(&form))
    }

    /// One page of responses, newest first, older than `before` when given.
    pub async fn fetch_page(&self, before: Option<&str>) -> Result<JsonValue, HttpError> {
        let mut url = format!(
            "{}/forms/{}/responses?page_size={}&response_type=completed,partial",
            self.config.api_base, self.config.form_id, self.config.page_size
        );
        if let Some(token) = before {
            url.push_str("&before=");
            url.push_str(token);
        }
        self.http.get_json(&url).await
    }

    /// Walk every page until a short one.
    pub async fn fetch_all(&self) -> Result<Vec<ResponseItem>, AdapterError> {
        let mut items = Vec::new();
        let mut before: Option<String> = None;
        loop {
            let raw = self.fetch_page(before.as_deref()).await?;
            let page: ResponsePage = serde_json::from_value(raw)?;
            let count = page.items.len();
            debug!(count, total = ?page.total_items, "fetched response page");
            before = page.items.last().and_then(|item| item.token.clone());
            items.extend(page.items);
            if count < self.config.page_size || before.is_none() {
                break;
            }
        }
        Ok(items)
    }
}

/// Live V2 responses from the Typeform API.
#[derive(Debug)]
pub struct TypeformApiSource {
    client: TypeformClient,
}

impl TypeformApiSource {
    pub fn new(client: TypeformClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SubmissionSource for TypeformApiSource {
    fn label(&self) -> &str {
        "typeform-api"
    }

    fn generation(&self) -> SchemaGeneration {
        SchemaGeneration::V2
    }

    async fn fetch(&self) -> Result<SourceBatch, AdapterError> {
        let form = match self.client.fetch_form().await {
            Ok(form) => form,
            Err(err) if err.is_auth() => return Err(err.into()),
            Err(err) => {
                warn!(error = %err, "form definition unavailable, open questions keep field ids");
                FormDefinition::default()
            }
        };
        let items = self.client.fetch_all().await?;
        let submissions: Vec<RawSubmission> = items
            .iter()
            .map(|item| to_raw_submission(item, &form))
            .collect();
        info!(
            form_id = %self.client.config().form_id,
            responses = submissions.len(),
            titles = form.len(),
            "loaded API responses"
        );
        Ok(SourceBatch {
            label: self.label().to_string(),
            generation: self.generation(),
            submissions,
        })
    }
}
