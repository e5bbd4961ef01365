//! Products: `products` joined with their selling price.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use catalogsync_common::{EntityScope, NaturalKey, Result, SyncError};
use catalogsync_remote::Payload;
use catalogsync_source::{Filter, Join, Row, RowQuery};
use catalogsync_sync::{
    to_cents, DiffTarget, MapContext, RecordMapper, SyncEntity, TrackedField, TrackedTable,
};

/// Price type holding the regular selling price.
pub const SELLING_PRICE_TYPE: i64 = 2;

pub struct Products {
    scope: EntityScope,
    include_free: bool,
}

impl Products {
    pub fn new(include_free: bool) -> Result<Self> {
        Ok(Self {
            scope: EntityScope::new(crate::PRODUCTS)?,
            include_free,
        })
    }

    /// Source tables whose changes make a record a candidate.
    pub fn tables() -> Vec<TrackedTable> {
        vec![
            TrackedTable::new("products", "product_id"),
            TrackedTable::new("product_prices", "product_id")
                .filter(Filter::eq("price_type", SELLING_PRICE_TYPE)),
        ]
    }

    fn diff_targets() -> Vec<DiffTarget> {
        vec![
            DiffTarget::new("products", "product_id")
                .field(TrackedField::column("name"))
                .field(TrackedField::column("description")),
            DiffTarget::new("product_prices", "product_id")
                .filter(Filter::eq("price_type", SELLING_PRICE_TYPE))
                .field(TrackedField::rounded("regular_price", "value", "rounding")),
        ]
    }
}

/// Regular price as sent to the shop: rounded to the row's increment and
/// printed with two decimals.
pub fn regular_price(value: f64, rounding: f64) -> String {
    format!("{:.2}", to_cents(value, rounding) as f64 / 100.0)
}

#[async_trait]
impl RecordMapper for Products {
    async fn map(
        &self,
        row: &Row,
        ctx: &MapContext<'_>,
    ) -> std::result::Result<Option<Payload>, SyncError> {
        let Some(id) = row.i64("product_id") else {
            return Err(SyncError::recoverable("?", "product without id"));
        };
        let Some(value) = row.f64("value") else {
            return Err(SyncError::recoverable(id.to_string(), "product without price"));
        };
        let rounding = row.f64("rounding").unwrap_or(0.0);
        let name = row.str("name").unwrap_or_default();

        if to_cents(value, rounding) == 0 && !self.include_free {
            warn!(
                "Skipping free product '{}' ({}); pass --include-free to sync it",
                name, id
            );
            return Ok(None);
        }

        let diff = ctx
            .diff(&Self::diff_targets(), &json!(id))
            .await
            .map_err(|e| SyncError::degraded(id.to_string(), e))?;
        for (field, change) in &diff.changes {
            debug!("Product {}: {} {} -> {}", id, field, change.old, change.new);
        }

        let mut fields = Map::new();
        fields.insert("name".to_string(), Value::from(name));
        fields.insert(
            "description".to_string(),
            Value::from(row.str("description").unwrap_or_default()),
        );
        fields.insert(
            "regular_price".to_string(),
            Value::from(regular_price(value, rounding)),
        );
        let payload = Payload::new(NaturalKey::Sku(id.to_string()), fields);

        Ok(Some(ctx.restrict(payload, &diff, |field| match field {
            "name" => vec!["name"],
            "description" => vec!["description"],
            "regular_price" => vec!["regular_price"],
            _ => vec![],
        })))
    }
}

impl SyncEntity for Products {
    fn scope(&self) -> &EntityScope {
        &self.scope
    }

    fn id_column(&self) -> &str {
        "product_id"
    }

    fn tracked_tables(&self) -> Vec<TrackedTable> {
        Self::tables()
    }

    fn query(&self) -> RowQuery {
        RowQuery::new("products", "product_id").join(
            Join::new("product_prices", "product_id", "product_id")
                .filter(Filter::eq("price_type", SELLING_PRICE_TYPE)),
        )
    }
}
