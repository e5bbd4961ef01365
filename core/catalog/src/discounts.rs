//! Discounts: per-contractor and per-product price rules.
//!
//! The discount kind decides who and what a rule applies to:
//! - contractors: kinds 7, 8, 11 apply to everyone, kinds 2, 5, 6, 13 to the
//!   subject contractor, kinds 1, 3, 4, 12 to contractor groups
//! - products: kinds 1, 2 apply to every product, kinds 4, 6, 8, 11, 12, 13
//!   to one product, kinds 3, 5, 7 to product groups
//!
//! Group discounts are not supported.
//! Kinds below 10 are percentages, the rest fixed amounts.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use catalogsync_common::{EntityScope, NaturalKey, Result, SourceId, SyncError};
use catalogsync_remote::Payload;
use catalogsync_source::{Filter, Row, RowQuery};
use catalogsync_sync::{
    DiffTarget, IdentityMap, MapContext, RecordMapper, SyncEntity, TrackedField, TrackedTable,
};

/// Subject type of discounts granted to contractors.
pub const CONTRACTOR_SUBJECT: i64 = 1;

/// Applies to every contractor or every product.
const EVERYONE: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscountType {
    Percentage = 1,
    Fixed = 2,
}

impl DiscountType {
    pub fn of_kind(kind: i64) -> Self {
        if kind < 10 {
            DiscountType::Percentage
        } else {
            DiscountType::Fixed
        }
    }

    /// Rate as sent to the price rules API: a fraction for percentages,
    /// the amount itself otherwise.
    pub fn price(&self, rate: f64) -> String {
        let price = match self {
            DiscountType::Percentage => rate / 100.0,
            DiscountType::Fixed => rate,
        };
        format!("{}", (price * 10_000.0).round() / 10_000.0)
    }
}

/// Who a discount of `kind` applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Everyone,
    One,
}

fn contractor_target(kind: i64) -> std::result::Result<Target, String> {
    match kind {
        7 | 8 | 11 => Ok(Target::Everyone),
        2 | 5 | 6 | 13 => Ok(Target::One),
        1 | 3 | 4 | 12 => Err(format!("contractor group discounts are not supported (kind {})", kind)),
        _ => Err(format!("unknown discount kind {}", kind)),
    }
}

fn product_target(kind: i64) -> std::result::Result<Target, String> {
    match kind {
        1 | 2 => Ok(Target::Everyone),
        4 | 6 | 8 | 11 | 12 | 13 => Ok(Target::One),
        3 | 5 | 7 => Err(format!("product group discounts are not supported (kind {})", kind)),
        _ => Err(format!("unknown discount kind {}", kind)),
    }
}

pub struct Discounts {
    scope: EntityScope,
    /// Remote ids of synced products.
    products: IdentityMap,
}

impl Discounts {
    /// `products` is the products identity map, loaded after products
    /// were synced.
    pub fn new(products: IdentityMap) -> Result<Self> {
        Ok(Self {
            scope: EntityScope::new(crate::DISCOUNTS)?,
            products,
        })
    }

    /// Source tables whose changes make a record a candidate.
    pub fn tables() -> Vec<TrackedTable> {
        vec![TrackedTable::new("discounts", "discount_id")
            .filter(Filter::eq("subject_type", CONTRACTOR_SUBJECT))]
    }

    fn diff_targets() -> Vec<DiffTarget> {
        vec![DiffTarget::new("discounts", "discount_id")
            .filter(Filter::eq("subject_type", CONTRACTOR_SUBJECT))
            .field(TrackedField::column("kind"))
            .field(TrackedField::column("product_id"))
            .field(TrackedField::column("subject_id"))
            .field(TrackedField::column("rate"))]
    }
}

#[async_trait]
impl RecordMapper for Discounts {
    async fn map(
        &self,
        row: &Row,
        ctx: &MapContext<'_>,
    ) -> std::result::Result<Option<Payload>, SyncError> {
        let Some(id) = row.i64("discount_id") else {
            return Err(SyncError::recoverable("?", "discount without id"));
        };
        let record = id.to_string();
        let Some(kind) = row.i64("kind") else {
            return Err(SyncError::recoverable(record, "discount without kind"));
        };

        let business = match contractor_target(kind).map_err(|e| SyncError::recoverable(&record, e))? {
            Target::Everyone => Value::from(EVERYONE),
            Target::One => row
                .get("subject_id")
                .and_then(SourceId::from_value)
                .and_then(|s| s.as_str().parse::<i64>().ok())
                .map(Value::from)
                .ok_or_else(|| SyncError::recoverable(&record, "discount without contractor"))?,
        };

        let product = match product_target(kind).map_err(|e| SyncError::recoverable(&record, e))? {
            Target::Everyone => Value::from(EVERYONE),
            Target::One => {
                let source_product = row
                    .get("product_id")
                    .and_then(SourceId::from_value)
                    .ok_or_else(|| SyncError::recoverable(&record, "discount without product"))?;
                let remote = self.products.get(&source_product).ok_or_else(|| {
                    SyncError::recoverable(
                        &record,
                        format!("product {} has not been synced", source_product),
                    )
                })?;
                Value::from(remote.get())
            }
        };

        let discount_type = DiscountType::of_kind(kind);
        let rate = row.f64("rate").unwrap_or(0.0);

        let diff = ctx
            .diff(&Self::diff_targets(), &json!(id))
            .await
            .map_err(|e| SyncError::degraded(record.clone(), e))?;

        let mut fields = Map::new();
        fields.insert("business_id".to_string(), business);
        fields.insert("product_id".to_string(), product);
        fields.insert("discount_type".to_string(), Value::from(discount_type as i64));
        fields.insert("price".to_string(), Value::from(discount_type.price(rate)));
        let payload = Payload::new(NaturalKey::Sku(format!("DISC_{}", id)), fields);

        Ok(Some(ctx.restrict(payload, &diff, |field| match field {
            "kind" => vec!["business_id", "product_id", "discount_type", "price"],
            "product_id" => vec!["product_id"],
            "subject_id" => vec!["business_id"],
            "rate" => vec!["price"],
            _ => vec![],
        })))
    }
}

impl SyncEntity for Discounts {
    fn scope(&self) -> &EntityScope {
        &self.scope
    }

    fn id_column(&self) -> &str {
        "discount_id"
    }

    fn tracked_tables(&self) -> Vec<TrackedTable> {
        Self::tables()
    }

    fn query(&self) -> RowQuery {
        RowQuery::new("discounts", "discount_id")
            .filter(Filter::eq("subject_type", CONTRACTOR_SUBJECT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalogsync_common::DestinationId;
    use catalogsync_source::MemorySource;
    use catalogsync_sync::{DetectionStrategy, FieldDiffResolver, IdentityMapping};
    use chrono::Utc;

    fn discounts() -> Discounts {
        let products = [IdentityMapping {
            source_id: SourceId::new("5"),
            destination_id: DestinationId::new(105),
            last_synced_at: Utc::now(),
        }]
        .into_iter()
        .collect();
        Discounts::new(products).unwrap()
    }

    fn row(kind: i64, product: i64) -> Row {
        Row::new()
            .with("discount_id", 3)
            .with("kind", kind)
            .with("product_id", product)
            .with("subject_type", 1)
            .with("subject_id", 77)
            .with("rate", 15.0)
    }

    async fn map(row: &Row) -> std::result::Result<Option<Payload>, SyncError> {
        let source = MemorySource::new();
        let ctx = MapContext {
            watermark: None,
            force: false,
            strategy: DetectionStrategy::History,
            resolver: FieldDiffResolver::new(&source),
        };
        discounts().map(row, &ctx).await
    }

    #[test]
    fn test_price_by_type() {
        assert_eq!(DiscountType::of_kind(6), DiscountType::Percentage);
        assert_eq!(DiscountType::of_kind(11), DiscountType::Fixed);
        assert_eq!(DiscountType::Percentage.price(15.0), "0.15");
        assert_eq!(DiscountType::Fixed.price(4.5), "4.5");
    }

    #[tokio::test]
    async fn test_contractor_and_product_discount() {
        let payload = map(&row(6, 5)).await.unwrap().unwrap();
        let body = payload.create_body();
        assert_eq!(body.get("sku"), Some(&json!("DISC_3")));
        assert_eq!(body.get("business_id"), Some(&json!(77)));
        assert_eq!(body.get("product_id"), Some(&json!(105)));
        assert_eq!(body.get("discount_type"), Some(&json!(1)));
        assert_eq!(body.get("price"), Some(&json!("0.15")));
    }

    #[tokio::test]
    async fn test_general_discounts() {
        let everyone = map(&row(11, 5)).await.unwrap().unwrap();
        assert_eq!(everyone.fields.get("business_id"), Some(&json!(-1)));
        assert_eq!(everyone.fields.get("discount_type"), Some(&json!(2)));
        assert_eq!(everyone.fields.get("price"), Some(&json!("15")));

        let all_products = map(&row(2, 999)).await.unwrap().unwrap();
        assert_eq!(all_products.fields.get("product_id"), Some(&json!(-1)));
        assert_eq!(all_products.fields.get("business_id"), Some(&json!(77)));
    }

    #[tokio::test]
    async fn test_unsupported_kinds_are_recoverable() {
        for kind in [1, 3, 4, 5, 7, 12, 42] {
            let err = map(&row(kind, 5)).await.unwrap_err();
            assert!(matches!(err, SyncError::Recoverable { .. }), "kind {}", kind);
        }
    }

    #[tokio::test]
    async fn test_unsynced_product_is_recoverable() {
        let err = map(&row(13, 6)).await.unwrap_err();
        assert!(matches!(err, SyncError::Recoverable { ref reason, .. } if reason.contains("6")));
    }
}
