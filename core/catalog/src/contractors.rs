//! Contractors: contact people synced as shop customers.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::warn;

use catalogsync_common::{EntityScope, NaturalKey, Result, SyncError};
use catalogsync_remote::Payload;
use catalogsync_source::{Row, RowQuery};
use catalogsync_sync::{DiffTarget, MapContext, RecordMapper, SyncEntity, TrackedField, TrackedTable};

pub struct Contractors {
    scope: EntityScope,
}

impl Contractors {
    pub fn new() -> Result<Self> {
        Ok(Self {
            scope: EntityScope::new(crate::CONTRACTORS)?,
        })
    }

    /// Source tables whose changes make a record a candidate.
    pub fn tables() -> Vec<TrackedTable> {
        vec![TrackedTable::new("contacts", "contact_id")]
    }

    fn diff_targets() -> Vec<DiffTarget> {
        vec![DiffTarget::new("contacts", "contact_id")
            .field(TrackedField::column("full_name"))
            .field(TrackedField::column("email"))
            .field(TrackedField::column("contractor_id"))]
    }
}

/// First and last word of a full name. A single word has no last name.
pub fn split_name(full_name: &str) -> Option<(&str, &str)> {
    let mut words = full_name.split_whitespace();
    let first = words.next()?;
    Some((first, words.last().unwrap_or_default()))
}

/// Login derived from the name and contact id: up to three characters of
/// the first name, up to three lowercased characters of the last name,
/// then the id.
pub fn username(first_name: &str, last_name: &str, contact_id: i64) -> String {
    let mut login: String = first_name.chars().take(3).collect();
    login.extend(last_name.to_lowercase().chars().take(3));
    login.push_str(&contact_id.to_string());
    login
}

#[async_trait]
impl RecordMapper for Contractors {
    async fn map(
        &self,
        row: &Row,
        ctx: &MapContext<'_>,
    ) -> std::result::Result<Option<Payload>, SyncError> {
        let Some(id) = row.i64("contact_id") else {
            return Err(SyncError::recoverable("?", "contact without id"));
        };
        let record = id.to_string();
        let full_name = row.str("full_name").unwrap_or_default();
        let Some((first_name, last_name)) = split_name(full_name) else {
            return Err(SyncError::recoverable(record, "contact without a name"));
        };
        let email = row.str("email").map(str::trim).unwrap_or_default();
        if email.is_empty() {
            return Err(SyncError::recoverable(record, "contact without an email"));
        }
        let login = username(first_name, last_name, id);
        let business = row
            .get("contractor_id")
            .and_then(catalogsync_common::SourceId::from_value)
            .map(|b| b.to_string())
            .unwrap_or_default();

        let diff = ctx
            .diff(&Self::diff_targets(), &json!(id))
            .await
            .map_err(|e| SyncError::degraded(record.clone(), e))?;
        if diff.is_precise() {
            if let Some(change) = diff.changes.get("full_name") {
                warn!(
                    "Contact {} renamed from {} to {}, but the username '{}' cannot change",
                    id, change.old, change.new, login
                );
            }
        }

        let mut fields = Map::new();
        fields.insert("email".to_string(), Value::from(email));
        fields.insert("first_name".to_string(), Value::from(first_name));
        fields.insert("last_name".to_string(), Value::from(last_name));
        fields.insert("roles".to_string(), json!(["customer"]));
        fields.insert("erp_business".to_string(), Value::from(business));
        let payload = Payload::new(NaturalKey::Username(login), fields);

        Ok(Some(ctx.restrict(payload, &diff, |field| match field {
            "full_name" => vec!["first_name", "last_name"],
            "email" => vec!["email"],
            "contractor_id" => vec!["erp_business"],
            _ => vec![],
        })))
    }
}

impl SyncEntity for Contractors {
    fn scope(&self) -> &EntityScope {
        &self.scope
    }

    fn id_column(&self) -> &str {
        "contact_id"
    }

    fn tracked_tables(&self) -> Vec<TrackedTable> {
        Self::tables()
    }

    fn query(&self) -> RowQuery {
        RowQuery::new("contacts", "contact_id")
    }
}
