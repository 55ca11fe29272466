//! HTTP implementation of [`TrackerApi`] over the tracker's JSON API.
//!
//! Wire conventions (work-package style):
//! - `GET  {base}/api/v3/work_packages/{id}`
//! - `POST {base}/api/v3/projects/{project}/work_packages`
//! - `PATCH {base}/api/v3/work_packages/{id}` (carries `lockVersion`)
//! - `GET  {base}/api/v3/projects/{project}/work_packages?filters=...`
//!
//! Select-type custom fields travel as `{"href": ..., "title": ...}` option
//! links; blank values are omitted from write payloads so the server never
//! sees an explicit empty that would trip "can't be blank" validations.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use ordsync_core::types::{FieldValue, ItemKind, ProjectKey, RemoteId};

use crate::api::{ItemDraft, ItemPatch, RemoteItem, TrackerApi};
use crate::error::ApiError;

/// Connection settings for the remote tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Base URL without a trailing slash, e.g. `https://tracker.example.com`.
    pub base_url: String,
    /// Bearer token for the API user.
    pub api_token: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl TrackerConfig {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: api_token.into(),
            timeout_secs: 30,
        }
    }
}

/// reqwest-backed tracker client.
pub struct HttpTracker {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl HttpTracker {
    pub fn new(config: TrackerConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(Self {
            client,
            base_url,
            api_token: config.api_token,
        })
    }

    fn item_url(&self, id: &RemoteId) -> String {
        format!("{}/api/v3/work_packages/{}", self.base_url, id)
    }

    fn collection_url(&self, project: &ProjectKey) -> String {
        format!("{}/api/v3/projects/{}/work_packages", self.base_url, project)
    }

    async fn read_item(&self, response: reqwest::Response, id: Option<&RemoteId>) -> Result<RemoteItem, ApiError> {
        let status = response.status().as_u16();
        let retry_after = parse_retry_after(&response);
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if (200..300).contains(&status) {
            return parse_item(&body);
        }
        Err(classify_error(status, retry_after, &body, id))
    }

    async fn search(
        &self,
        project: &ProjectKey,
        filters: Value,
    ) -> Result<Option<RemoteItem>, ApiError> {
        let response = self
            .client
            .get(self.collection_url(project))
            .bearer_auth(&self.api_token)
            .query(&[("filters", filters.to_string()), ("pageSize", "5".to_string())])
            .send()
            .await?;

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(&response);
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !(200..300).contains(&status) {
            return Err(classify_error(status, retry_after, &body, None));
        }

        let elements = body
            .pointer("/_embedded/elements")
            .and_then(Value::as_array);
        match elements.and_then(|list| list.first()) {
            Some(first) => parse_item(first).map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TrackerApi for HttpTracker {
    async fn check_access(&self, project: &ProjectKey) -> Result<(), ApiError> {
        let url = format!("{}/api/v3/projects/{}", self.base_url, project);
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(());
        }
        let retry_after = parse_retry_after(&response);
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Err(classify_error(status, retry_after, &body, None))
    }

    async fn fetch(&self, id: &RemoteId) -> Result<RemoteItem, ApiError> {
        tracing::debug!(%id, "fetch work package");
        let response = self
            .client
            .get(self.item_url(id))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        self.read_item(response, Some(id)).await
    }

    async fn create(&self, project: &ProjectKey, draft: ItemDraft) -> Result<RemoteItem, ApiError> {
        tracing::debug!(%project, kind = %draft.kind, subject = %draft.subject, "create work package");
        let payload = draft_payload(&draft);
        let response = self
            .client
            .post(self.collection_url(project))
            .bearer_auth(&self.api_token)
            .json(&payload)
            .send()
            .await?;
        self.read_item(response, None).await
    }

    async fn update(
        &self,
        id: &RemoteId,
        patch: ItemPatch,
        lock_version: u64,
    ) -> Result<RemoteItem, ApiError> {
        tracing::debug!(%id, lock_version, "update work package");
        let payload = patch_payload(&patch, lock_version);
        let response = self
            .client
            .patch(self.item_url(id))
            .bearer_auth(&self.api_token)
            .json(&payload)
            .send()
            .await?;
        self.read_item(response, Some(id)).await
    }

    async fn find_by_field(
        &self,
        project: &ProjectKey,
        kind: ItemKind,
        field_id: &str,
        value: &str,
    ) -> Result<Option<RemoteItem>, ApiError> {
        let filters = json!([
            { "type": { "operator": "=", "values": [type_title(kind)] } },
            { field_id: { "operator": "=", "values": [value] } }
        ]);
        self.search(project, filters).await
    }

    async fn find_by_subject(
        &self,
        project: &ProjectKey,
        kind: ItemKind,
        subject: &str,
    ) -> Result<Option<RemoteItem>, ApiError> {
        let filters = json!([
            { "type": { "operator": "=", "values": [type_title(kind)] } },
            { "subject": { "operator": "=", "values": [subject] } }
        ]);
        self.search(project, filters).await
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

fn type_title(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::Epic => "Epic",
        ItemKind::Story => "Story",
    }
}

fn kind_from_title(title: &str) -> Option<ItemKind> {
    match title.trim().to_lowercase().as_str() {
        "epic" => Some(ItemKind::Epic),
        "story" | "user story" => Some(ItemKind::Story),
        _ => None,
    }
}

fn field_value_json(value: &FieldValue) -> Value {
    match value {
        FieldValue::Text { value } => Value::String(value.clone()),
        FieldValue::Number { value } => json!(value),
        FieldValue::Ref { reference, label } => json!({ "href": reference, "title": label }),
    }
}

fn insert_fields(payload: &mut Map<String, Value>, fields: &BTreeMap<String, FieldValue>) {
    for (remote_id, value) in fields {
        // Blank values are omitted rather than sent as explicit empties.
        if value.is_blank() {
            continue;
        }
        payload.insert(remote_id.clone(), field_value_json(value));
    }
}

pub(crate) fn draft_payload(draft: &ItemDraft) -> Value {
    let mut payload = Map::new();
    payload.insert("subject".into(), Value::String(draft.subject.clone()));
    payload.insert(
        "description".into(),
        json!({ "raw": draft.description, "format": "markdown" }),
    );

    let mut links = Map::new();
    links.insert("type".into(), json!({ "title": type_title(draft.kind) }));
    if let Some(parent) = &draft.parent {
        links.insert(
            "parent".into(),
            json!({ "href": format!("/api/v3/work_packages/{parent}") }),
        );
    }
    payload.insert("_links".into(), Value::Object(links));

    insert_fields(&mut payload, &draft.fields);
    Value::Object(payload)
}

pub(crate) fn patch_payload(patch: &ItemPatch, lock_version: u64) -> Value {
    let mut payload = Map::new();
    payload.insert("lockVersion".into(), json!(lock_version));
    if let Some(subject) = &patch.subject {
        payload.insert("subject".into(), Value::String(subject.clone()));
    }
    if let Some(description) = &patch.description {
        payload.insert(
            "description".into(),
            json!({ "raw": description, "format": "markdown" }),
        );
    }
    insert_fields(&mut payload, &patch.fields);
    Value::Object(payload)
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

pub(crate) fn parse_item(body: &Value) -> Result<RemoteItem, ApiError> {
    let id = match body.get("id") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => {
            return Err(ApiError::Unexpected {
                status: 200,
                message: "response item is missing an id".into(),
            })
        }
    };

    let title = body
        .pointer("/_links/type/title")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let kind = kind_from_title(title).ok_or_else(|| ApiError::Unexpected {
        status: 200,
        message: format!("unrecognized work package type '{title}'"),
    })?;

    let subject = body
        .get("subject")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let description = body
        .pointer("/description/raw")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let lock_version = body
        .get("lockVersion")
        .and_then(Value::as_u64)
        .unwrap_or_default();
    let parent = body
        .pointer("/_links/parent/href")
        .and_then(Value::as_str)
        .and_then(|href| href.rsplit('/').next())
        .filter(|tail| !tail.is_empty())
        .map(RemoteId::from);

    let mut fields = BTreeMap::new();
    if let Some(object) = body.as_object() {
        for (key, value) in object {
            if !key.starts_with("customField") {
                continue;
            }
            if let Some(parsed) = parse_field_value(value) {
                fields.insert(key.clone(), parsed);
            }
        }
    }

    Ok(RemoteItem {
        id: RemoteId(id),
        kind,
        subject,
        description,
        lock_version,
        parent,
        fields,
    })
}

fn parse_field_value(value: &Value) -> Option<FieldValue> {
    match value {
        Value::String(s) => Some(FieldValue::text(s.clone())),
        Value::Number(n) => n.as_f64().map(FieldValue::number),
        Value::Object(obj) => {
            let reference = obj.get("href").and_then(Value::as_str)?;
            let label = obj.get("title").and_then(Value::as_str).unwrap_or_default();
            Some(FieldValue::option_ref(reference, label))
        }
        _ => None,
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

pub(crate) fn classify_error(
    status: u16,
    retry_after: Option<Duration>,
    body: &Value,
    id: Option<&RemoteId>,
) -> ApiError {
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("no message")
        .to_string();

    match status {
        404 => match id {
            Some(id) => ApiError::Gone { id: id.clone() },
            None => ApiError::Unexpected { status, message },
        },
        409 => ApiError::Conflict,
        422 => ApiError::Validation {
            field: body
                .pointer("/_embedded/details/attribute")
                .and_then(Value::as_str)
                .map(str::to_string),
            message,
        },
        429 => ApiError::RateLimited { retry_after },
        500..=599 => ApiError::Server { status },
        _ => ApiError::Unexpected { status, message },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item_body() -> Value {
        json!({
            "id": 42,
            "lockVersion": 3,
            "subject": "Acme :: O-100",
            "description": { "raw": "**Customer**: Acme", "format": "markdown" },
            "_links": {
                "type": { "title": "Epic" },
                "parent": { "href": "/api/v3/work_packages/41" }
            },
            "customField2": "O-100",
            "customField10": { "href": "/api/v3/custom_options/41", "title": "Approved" },
            "customField23": 2.5
        })
    }

    #[test]
    fn parses_item_with_custom_fields() {
        let item = parse_item(&sample_item_body()).expect("parse");
        assert_eq!(item.id, RemoteId::from("42"));
        assert_eq!(item.kind, ItemKind::Epic);
        assert_eq!(item.subject, "Acme :: O-100");
        assert_eq!(item.lock_version, 3);
        assert_eq!(item.parent, Some(RemoteId::from("41")));
        assert_eq!(item.fields.get("customField2"), Some(&FieldValue::text("O-100")));
        assert_eq!(
            item.fields.get("customField10"),
            Some(&FieldValue::option_ref("/api/v3/custom_options/41", "Approved")),
        );
        assert_eq!(item.fields.get("customField23"), Some(&FieldValue::number(2.5)));
    }

    #[test]
    fn user_story_type_maps_to_story() {
        let mut body = sample_item_body();
        body["_links"]["type"]["title"] = json!("User story");
        let item = parse_item(&body).expect("parse");
        assert_eq!(item.kind, ItemKind::Story);
    }

    #[test]
    fn draft_payload_skips_blank_fields() {
        let mut fields = BTreeMap::new();
        fields.insert("customField5".to_string(), FieldValue::text("Acme"));
        fields.insert("customField7".to_string(), FieldValue::text("   "));
        let draft = ItemDraft {
            kind: ItemKind::Story,
            subject: "O-100-1".into(),
            description: String::new(),
            parent: Some(RemoteId::from("41")),
            fields,
        };

        let payload = draft_payload(&draft);
        assert_eq!(payload["subject"], "O-100-1");
        assert_eq!(payload["_links"]["type"]["title"], "Story");
        assert_eq!(payload["_links"]["parent"]["href"], "/api/v3/work_packages/41");
        assert_eq!(payload["customField5"], "Acme");
        assert!(payload.get("customField7").is_none());
    }

    #[test]
    fn patch_payload_carries_lock_version_and_only_patched_entries() {
        let mut fields = BTreeMap::new();
        fields.insert(
            "customField10".to_string(),
            FieldValue::option_ref("/api/v3/custom_options/42", "Rejected"),
        );
        let patch = ItemPatch {
            subject: None,
            description: None,
            fields,
        };

        let payload = patch_payload(&patch, 7);
        assert_eq!(payload["lockVersion"], 7);
        assert!(payload.get("subject").is_none());
        assert!(payload.get("description").is_none());
        assert_eq!(payload["customField10"]["href"], "/api/v3/custom_options/42");
    }

    #[test]
    fn classifies_statuses() {
        let id = RemoteId::from("9");
        assert!(matches!(
            classify_error(404, None, &Value::Null, Some(&id)),
            ApiError::Gone { .. }
        ));
        assert!(matches!(
            classify_error(409, None, &Value::Null, Some(&id)),
            ApiError::Conflict
        ));
        assert!(matches!(
            classify_error(429, Some(Duration::from_secs(3)), &Value::Null, None),
            ApiError::RateLimited { retry_after: Some(_) }
        ));
        assert!(matches!(
            classify_error(503, None, &Value::Null, None),
            ApiError::Server { status: 503 }
        ));
    }

    #[test]
    fn validation_errors_extract_the_attribute() {
        let body = json!({
            "message": "customField10 can't be blank",
            "_embedded": { "details": { "attribute": "customField10" } }
        });
        match classify_error(422, None, &body, None) {
            ApiError::Validation { field, message } => {
                assert_eq!(field.as_deref(), Some("customField10"));
                assert!(message.contains("can't be blank"));
            }
            other => panic!("expected validation, got {other:?}"),
        }
    }
}
