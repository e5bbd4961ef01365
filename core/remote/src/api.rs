//! Batch API trait and wire-level request/response types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use catalogsync_common::{DestinationId, NaturalKey, Result};

/// Default ceiling on items per batch call.
pub const DEFAULT_MAX_BATCH_ITEMS: usize = 100;

/// Fields to send for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub natural_key: NaturalKey,
    pub fields: Map<String, Value>,
    /// Fields known to have changed since the last sync. `None` means the
    /// change set is unknown and every field is sent.
    pub changed: Option<BTreeSet<String>>,
}

impl Payload {
    pub fn new(natural_key: NaturalKey, fields: Map<String, Value>) -> Self {
        Self {
            natural_key,
            fields,
            changed: None,
        }
    }

    /// Restrict updates to `changed` fields.
    pub fn with_changed(mut self, changed: BTreeSet<String>) -> Self {
        self.changed = Some(changed);
        self
    }

    /// Whether an update built from this payload would carry nothing.
    pub fn is_noop(&self) -> bool {
        self.changed.as_ref().is_some_and(|c| c.is_empty())
    }

    /// Body for a create: every field plus the natural key.
    pub fn create_body(&self) -> Map<String, Value> {
        let mut body = self.fields.clone();
        body.insert(
            self.natural_key.field_name().to_string(),
            Value::String(self.natural_key.value().to_string()),
        );
        body
    }

    /// Body for an update of `id`: the destination id plus the changed
    /// fields, or every field when the change set is unknown. Keys the
    /// destination treats as read-only are never included.
    pub fn update_body(&self, id: DestinationId) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert("id".to_string(), Value::from(id.get()));
        for (name, value) in &self.fields {
            if self.changed.as_ref().is_none_or(|c| c.contains(name)) {
                body.insert(name.clone(), value.clone());
            }
        }
        let key_field = self.natural_key.field_name();
        if self.natural_key.writable_on_update()
            && self.changed.as_ref().is_none_or(|c| c.contains(key_field))
        {
            body.insert(
                key_field.to_string(),
                Value::String(self.natural_key.value().to_string()),
            );
        } else {
            body.remove(key_field);
        }
        body
    }
}

/// Update of an existing remote record.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOp {
    pub id: DestinationId,
    pub payload: Payload,
}

/// One batch call's worth of work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchRequest {
    pub create: Vec<Payload>,
    pub update: Vec<UpdateOp>,
    pub delete: Vec<DestinationId>,
}

impl BatchRequest {
    pub fn len(&self) -> usize {
        self.create.len() + self.update.len() + self.delete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Standard `{create, update, delete}` body, omitting empty sections.
    /// `create_section` names the creation list.
    pub fn to_json(&self, create_section: &str) -> Value {
        let mut body = Map::new();
        if !self.create.is_empty() {
            body.insert(
                create_section.to_string(),
                Value::Array(
                    self.create
                        .iter()
                        .map(|p| Value::Object(p.create_body()))
                        .collect(),
                ),
            );
        }
        if !self.update.is_empty() {
            body.insert(
                "update".to_string(),
                Value::Array(
                    self.update
                        .iter()
                        .map(|u| Value::Object(u.payload.update_body(u.id)))
                        .collect(),
                ),
            );
        }
        if !self.delete.is_empty() {
            body.insert(
                "delete".to_string(),
                Value::Array(self.delete.iter().map(|id| Value::from(id.get())).collect()),
            );
        }
        Value::Object(body)
    }
}

/// Outcome of one item in a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemResult {
    pub id: Option<DestinationId>,
    pub natural_key: Option<NaturalKey>,
    pub fields: Map<String, Value>,
    pub error: Option<String>,
}

impl ItemResult {
    /// Parse a response item, reading the natural key from `key_field`.
    pub fn from_json(item: &Value, key_field: &str, make_key: fn(String) -> NaturalKey) -> Self {
        let fields = item.as_object().cloned().unwrap_or_default();
        let id = fields.get("id").and_then(DestinationId::from_value);
        let natural_key = fields
            .get(key_field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| make_key(s.to_string()));
        let error = fields.get("error").and_then(error_message);
        Self {
            id,
            natural_key,
            fields,
            error,
        }
    }

    /// Item-level failure.
    pub fn failed(id: Option<DestinationId>, natural_key: Option<NaturalKey>, error: impl ToString) -> Self {
        Self {
            id,
            natural_key,
            fields: Map::new(),
            error: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

fn error_message(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => Some(
            obj.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string()),
        ),
        other => Some(other.to_string()),
    }
}

/// Per-section results of one batch call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResponse {
    pub created: Vec<ItemResult>,
    pub updated: Vec<ItemResult>,
    pub deleted: Vec<ItemResult>,
}

impl BatchResponse {
    /// Parse a `{<create_section>, update, delete}` response body.
    pub fn from_json(
        body: &Value,
        create_section: &str,
        key_field: &str,
        make_key: fn(String) -> NaturalKey,
    ) -> Self {
        let section = |name: &str| -> Vec<ItemResult> {
            body.get(name)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .map(|item| ItemResult::from_json(item, key_field, make_key))
                        .collect()
                })
                .unwrap_or_default()
        };
        Self {
            created: section(create_section),
            updated: section("update"),
            deleted: section("delete"),
        }
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A remote catalog that accepts create/update/delete batches.
///
/// # Errors
/// `submit` fails only when the call as a whole did not go through
/// (transport failure, non-success status). Rejected items come back as
/// [`ItemResult`]s carrying an error.
#[async_trait]
pub trait BatchApi: Send + Sync {
    /// API name for logging (e.g., "woocommerce").
    fn name(&self) -> &str;

    /// Most items the API accepts in one call.
    fn max_batch_items(&self) -> usize {
        DEFAULT_MAX_BATCH_ITEMS
    }

    /// Send one batch.
    async fn submit(&self, request: &BatchRequest) -> Result<BatchResponse>;
}
