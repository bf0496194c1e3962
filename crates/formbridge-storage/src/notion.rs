//! Notion database as the destination store.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use formbridge_core::{truncate_chars, DestinationRecord, FieldKey, MergePlan, MAX_TEXT_LEN};
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, info};

use crate::{DestinationStore, HttpClient, HttpClientConfig, HttpError, StoreError};

pub const NOTION_API_BASE: &str = "https://api.notion.com/v1";
pub const NOTION_VERSION: &str = "2022-06-28";

const BUILTIN_SCHEMA: &str = include_str!("../../../rules/destination.yaml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    Title,
    RichText,
    Select,
    Email,
    PhoneNumber,
    Url,
}

impl PropertyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::RichText => "rich_text",
            Self::Select => "select",
            Self::Email => "email",
            Self::PhoneNumber => "phone_number",
            Self::Url => "url",
        }
    }

    /// Property payload for a write.
    pub fn encode(self, value: &str) -> JsonValue {
        match self {
            Self::Title => json!({ "title": [{ "text": { "content": truncate_chars(value, MAX_TEXT_LEN) } }] }),
            Self::RichText => {
                json!({ "rich_text": [{ "text": { "content": truncate_chars(value, MAX_TEXT_LEN) } }] })
            }
            Self::Select => json!({ "select": { "name": value } }),
            Self::Email => json!({ "email": value }),
            Self::PhoneNumber => json!({ "phone_number": value }),
            Self::Url => json!({ "url": value }),
        }
    }

    /// Current value of a property as plain text; empty when unset.
    pub fn decode(self, property: &JsonValue) -> String {
        match self {
            Self::Title | Self::RichText => property
                .get(self.as_str())
                .and_then(JsonValue::as_array)
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|p| p.get("plain_text").and_then(JsonValue::as_str))
                        .collect::<String>()
                })
                .unwrap_or_default()
                .trim()
                .to_string(),
            Self::Select => property
                .get("select")
                .and_then(|s| s.get("name"))
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
            Self::Email | Self::PhoneNumber | Self::Url => property
                .get(self.as_str())
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .trim()
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldMapping {
    pub property: String,
    pub kind: PropertyKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaFields {
    pub email: FieldMapping,
    pub phone: FieldMapping,
    pub address: FieldMapping,
    pub city: FieldMapping,
    pub state: FieldMapping,
    pub scheduling_link: FieldMapping,
    pub capabilities: FieldMapping,
    pub relational: FieldMapping,
    pub autonomy: FieldMapping,
    pub status: FieldMapping,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusLabels {
    pub complete: String,
    pub partial: String,
}

impl StatusLabels {
    pub fn for_completeness(&self, completed: bool) -> &str {
        if completed {
            &self.complete
        } else {
            &self.partial
        }
    }
}

/// Property names and kinds of the destination database.
#[derive(Debug, Clone, Deserialize)]
pub struct DestinationSchema {
    #[allow(dead_code)]
    version: u32,
    pub title_property: String,
    pub fields: SchemaFields,
    pub status_labels: StatusLabels,
    /// Rich-text properties holding profile buckets, filled from the routing layout.
    #[serde(default)]
    pub profile_properties: Vec<String>,
}

impl DestinationSchema {
    pub fn builtin() -> anyhow::Result<Self> {
        serde_yaml::from_str(BUILTIN_SCHEMA).context("parsing built-in destination.yaml")
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn with_profile_properties<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.profile_properties = properties.into_iter().map(Into::into).collect();
        self
    }

    pub fn mapping(&self, key: &FieldKey) -> Option<(&str, PropertyKind)> {
        let f = &self.fields;
        let mapping = match key {
            FieldKey::Email => &f.email,
            FieldKey::Phone => &f.phone,
            FieldKey::Address => &f.address,
            FieldKey::City => &f.city,
            FieldKey::State => &f.state,
            FieldKey::SchedulingLink => &f.scheduling_link,
            FieldKey::Capabilities => &f.capabilities,
            FieldKey::Relational => &f.relational,
            FieldKey::Autonomy => &f.autonomy,
            FieldKey::Status => &f.status,
            FieldKey::Profile(property) => {
                return self
                    .profile_properties
                    .iter()
                    .find(|p| *p == property)
                    .map(|p| (p.as_str(), PropertyKind::RichText));
            }
        };
        Some((mapping.property.as_str(), mapping.kind))
    }

    /// Every field the schema knows, profile properties last.
    pub fn all_fields(&self) -> Vec<FieldKey> {
        let mut keys = vec![
            FieldKey::Email,
            FieldKey::Phone,
            FieldKey::Address,
            FieldKey::City,
            FieldKey::State,
            FieldKey::SchedulingLink,
            FieldKey::Capabilities,
            FieldKey::Relational,
            FieldKey::Autonomy,
            FieldKey::Status,
        ];
        keys.extend(self.profile_properties.iter().cloned().map(FieldKey::Profile));
        keys
    }

    /// Snapshot of one page object from a database query.
    pub fn record_from_page(&self, page: &JsonValue) -> Option<DestinationRecord> {
        let id = page.get("id")?.as_str()?;
        let properties = page.get("properties")?;
        let name = properties
            .get(&self.title_property)
            .map(|p| PropertyKind::Title.decode(p))
            .unwrap_or_default();
        let mut record = DestinationRecord::new(id, name);
        for key in self.all_fields() {
            let Some((property, kind)) = self.mapping(&key) else {
                continue;
            };
            if let Some(value) = properties.get(property) {
                let text = kind.decode(value);
                if !text.is_empty() {
                    record.values.insert(key, text);
                }
            }
        }
        Some(record)
    }

    /// `properties` body for a page update.
    pub fn encode_plan(&self, plan: &MergePlan) -> Result<Map<String, JsonValue>, StoreError> {
        let mut properties = Map::new();
        for (key, value) in &plan.writes {
            let (property, kind) = self
                .mapping(key)
                .ok_or_else(|| StoreError::UnmappedField(key.label()))?;
            properties.insert(property.to_string(), kind.encode(value));
        }
        Ok(properties)
    }
}

#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub token: String,
    pub database_id: String,
    pub api_base: String,
    pub page_size: usize,
    pub search_page_size: usize,
}

impl NotionConfig {
    pub fn new(token: impl Into<String>, database_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            database_id: database_id.into(),
            api_base: NOTION_API_BASE.to_string(),
            page_size: 100,
            search_page_size: 10,
        }
    }
}

pub struct NotionStore {
    http: HttpClient,
    config: NotionConfig,
    schema: DestinationSchema,
}

impl NotionStore {
    pub fn new(
        config: NotionConfig,
        schema: DestinationSchema,
        http: HttpClientConfig,
    ) -> Result<Self, HttpError> {
        let mut http = http;
        http.bearer_token = Some(config.token.clone());
        http.extra_headers
            .push(("Notion-Version".to_string(), NOTION_VERSION.to_string()));
        Ok(Self {
            http: HttpClient::new(http)?,
            config,
            schema,
        })
    }

    pub fn schema(&self) -> &DestinationSchema {
        &self.schema
    }

    fn database_url(&self) -> String {
        format!("{}/databases/{}", self.config.api_base, self.config.database_id)
    }

    fn pages_from(&self, response: &JsonValue) -> Result<Vec<DestinationRecord>, StoreError> {
        let results = response
            .get("results")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| StoreError::Response("query response without results".into()))?;
        Ok(results
            .iter()
            .filter_map(|page| self.schema.record_from_page(page))
            .collect())
    }
}

#[async_trait]
impl DestinationStore for NotionStore {
    async fn list_records(&self) -> Result<Vec<DestinationRecord>, StoreError> {
        let url = format!("{}/query", self.database_url());
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut body = json!({ "page_size": self.config.page_size });
            if let Some(cursor) = &cursor {
                body["start_cursor"] = json!(cursor);
            }
            let response = self.http.post_json(&url, &body).await?;
            records.extend(self.pages_from(&response)?);

            let has_more = response
                .get("has_more")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false);
            cursor = response
                .get("next_cursor")
                .and_then(JsonValue::as_str)
                .map(str::to_string);
            if !has_more || cursor.is_none() {
                break;
            }
        }
        debug!(count = records.len(), "listed destination records");
        Ok(records)
    }

    async fn search_by_name(&self, fragment: &str) -> Result<Vec<DestinationRecord>, StoreError> {
        let url = format!("{}/query", self.database_url());
        let body = json!({
            "filter": { "property": self.schema.title_property, "title": { "contains": fragment } },
            "page_size": self.config.search_page_size,
        });
        let response = self.http.post_json(&url, &body).await?;
        self.pages_from(&response)
    }

    async fn update_record(&self, record_id: &str, plan: &MergePlan) -> Result<(), StoreError> {
        let properties = self.schema.encode_plan(plan)?;
        if properties.is_empty() {
            return Ok(());
        }
        let url = format!("{}/pages/{}", self.config.api_base, record_id);
        self.http
            .patch_json(&url, &json!({ "properties": properties }))
            .await?;
        Ok(())
    }

    async fn ensure_fields(&self, fields: &[FieldKey]) -> Result<Vec<String>, StoreError> {
        let database = self.http.get_json(&self.database_url()).await?;
        let existing = database
            .get("properties")
            .and_then(JsonValue::as_object)
            .ok_or_else(|| StoreError::Response("database without properties".into()))?;

        let mut missing = Map::new();
        for key in fields {
            let (property, kind) = self
                .schema
                .mapping(key)
                .ok_or_else(|| StoreError::UnmappedField(key.label()))?;
            if !existing.contains_key(property) && !missing.contains_key(property) {
                missing.insert(property.to_string(), json!({ (kind.as_str()): {} }));
            }
        }
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let added: Vec<String> = missing.keys().cloned().collect();
        info!(properties = ?added, "adding missing destination properties");
        self.http
            .patch_json(&self.database_url(), &json!({ "properties": missing }))
            .await?;
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> DestinationSchema {
        DestinationSchema::builtin()
            .unwrap()
            .with_profile_properties(["Pets", "Household Notes"])
    }

    #[test]
    fn builtin_schema_maps_every_fixed_field() {
        let schema = schema();
        for key in schema.all_fields() {
            assert!(schema.mapping(&key).is_some(), "{key:?} unmapped");
        }
        assert_eq!(
            schema.mapping(&FieldKey::Capabilities),
            Some(("Capability Requirements", PropertyKind::RichText))
        );
        assert_eq!(schema.mapping(&FieldKey::Profile("Unknown".into())), None);
        assert_eq!(schema.status_labels.for_completeness(false), "Partial");
    }

    #[test]
    fn page_values_are_decoded_per_kind() {
        let page = json!({
            "id": "page-1",
            "properties": {
                "Task name": { "title": [{ "plain_text": "Sam " }, { "plain_text": "Craft" }] },
                "Email": { "email": "sam@example.com" },
                "Phone": { "phone_number": null },
                "State": { "select": { "name": "MN" } },
                "Client Address": { "rich_text": [] },
                "Pets": { "rich_text": [{ "plain_text": "Pets: Dog" }] }
            }
        });
        let record = schema().record_from_page(&page).unwrap();
        assert_eq!(record.id, "page-1");
        assert_eq!(record.name, "Sam Craft");
        assert_eq!(record.get(&FieldKey::Email), "sam@example.com");
        assert_eq!(record.get(&FieldKey::Phone), "");
        assert_eq!(record.get(&FieldKey::State), "MN");
        assert_eq!(record.get(&FieldKey::Profile("Pets".into())), "Pets: Dog");
        assert!(!record.values.contains_key(&FieldKey::Address));
    }

    #[test]
    fn plan_encoding_uses_property_payloads() {
        let mut plan = MergePlan::default();
        plan.writes.insert(FieldKey::Phone, "555-1234".into());
        plan.writes.insert(FieldKey::Relational, "Reserved / Stealth".into());
        plan.writes
            .insert(FieldKey::Profile("Pets".into()), "x".repeat(MAX_TEXT_LEN + 50));

        let properties = schema().encode_plan(&plan).unwrap();
        assert_eq!(properties["Phone"], json!({ "phone_number": "555-1234" }));
        assert_eq!(
            properties["Relational Preference"],
            json!({ "select": { "name": "Reserved / Stealth" } })
        );
        let content = properties["Pets"]["rich_text"][0]["text"]["content"]
            .as_str()
            .unwrap();
        assert_eq!(content.chars().count(), MAX_TEXT_LEN);
    }

    #[test]
    fn unmapped_profile_property_is_rejected() {
        let mut plan = MergePlan::default();
        plan.writes.insert(FieldKey::Profile("Nope".into()), "x".into());
        assert!(matches!(
            schema().encode_plan(&plan),
            Err(StoreError::UnmappedField(_))
        ));
    }
}
