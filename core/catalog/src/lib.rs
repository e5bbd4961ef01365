//! Catalog entities synced by catalogsync.
//!
//! Each entity describes which source rows it reads, which tables make a
//! record a candidate, and how a row becomes a remote payload:
//! - [`Products`]: shop products with their selling price
//! - [`Contractors`]: contact people, synced as shop customers
//! - [`Discounts`]: contractor discounts, synced as price rules

pub mod contractors;
pub mod discounts;
pub mod products;

use std::fmt;
use std::str::FromStr;

use catalogsync_common::Error;
use catalogsync_sync::TrackedTable;

pub use contractors::Contractors;
pub use discounts::Discounts;
pub use products::Products;

pub const PRODUCTS: &str = "products";
pub const CONTRACTORS: &str = "contractors";
pub const DISCOUNTS: &str = "discounts";

/// Entity kinds, in the order they must be synced: discounts refer to
/// products by their remote id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    Products,
    Contractors,
    Discounts,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Products,
        EntityKind::Contractors,
        EntityKind::Discounts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Products => PRODUCTS,
            EntityKind::Contractors => CONTRACTORS,
            EntityKind::Discounts => DISCOUNTS,
        }
    }

    pub fn tracked_tables(&self) -> Vec<TrackedTable> {
        match self {
            EntityKind::Products => Products::tables(),
            EntityKind::Contractors => Contractors::tables(),
            EntityKind::Discounts => Discounts::tables(),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            PRODUCTS => Ok(EntityKind::Products),
            CONTRACTORS => Ok(EntityKind::Contractors),
            DISCOUNTS => Ok(EntityKind::Discounts),
            other => Err(Error::InvalidInput(format!(
                "unknown entity '{}' (expected products, contractors or discounts)",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalogsync_common::{NaturalKey, Watermark};
    use catalogsync_remote::MemoryCatalog;
    use catalogsync_source::{Filter, MemorySource, Row};
    use catalogsync_sync::{
        DetectionStrategy, EngineConfig, FullReason, IdentityStore, MemoryIdentityStore,
        MemoryStateStore, ReconcileConfig, RetryConfig, StateStore, SyncEngine, SyncEntity,
        SyncOptions,
    };
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    struct Setup {
        source: Arc<MemorySource>,
        identities: Arc<MemoryIdentityStore>,
        state: Arc<MemoryStateStore>,
        engine: SyncEngine,
    }

    async fn setup(strategy: DetectionStrategy) -> Setup {
        let source = Arc::new(MemorySource::new());
        for table in ["products", "product_prices", "contacts", "discounts"] {
            source.create_table(table).await;
        }
        for kind in EntityKind::ALL {
            for tracked in kind.tracked_tables() {
                source.enable_tracking(&tracked.table).await.unwrap();
            }
        }
        for (id, name, price) in [(1, "Chair", 10.0), (2, "Desk", 20.0), (3, "Lamp", 5.0)] {
            source
                .insert(
                    "products",
                    Row::new()
                        .with("product_id", id)
                        .with("name", name)
                        .with("description", ""),
                )
                .await
                .unwrap();
            for (price_type, value) in [(1, price * 0.8), (2, price)] {
                source
                    .insert(
                        "product_prices",
                        Row::new()
                            .with("product_id", id)
                            .with("price_type", price_type)
                            .with("value", value)
                            .with("rounding", 0.01),
                    )
                    .await
                    .unwrap();
            }
        }

        let identities = Arc::new(MemoryIdentityStore::new());
        let state = Arc::new(MemoryStateStore::new());
        let engine = SyncEngine::new(
            source.clone(),
            identities.clone(),
            state.clone(),
            EngineConfig {
                strategy,
                reconcile: ReconcileConfig {
                    pause: Duration::ZERO,
                    retry: RetryConfig::disabled(),
                    ..Default::default()
                },
            },
        );
        Setup {
            source,
            identities,
            state,
            engine,
        }
    }

    #[test]
    fn test_entity_names() {
        assert_eq!("Products".parse::<EntityKind>().unwrap(), EntityKind::Products);
        assert_eq!(" discounts".parse::<EntityKind>().unwrap(), EntityKind::Discounts);
        assert!("invoices".parse::<EntityKind>().is_err());
        assert_eq!(EntityKind::Contractors.to_string(), "contractors");
    }

    async fn products_lifecycle(strategy: DetectionStrategy) {
        let s = setup(strategy).await;
        let shop = MemoryCatalog::new("shop");
        let products = Products::new(false).unwrap();
        let scope = products.scope().clone();

        // first run: everything is new
        let first = s
            .engine
            .sync_entity(&products, &shop, SyncOptions::default())
            .await
            .unwrap();
        assert!(first.is_success());
        assert_eq!(first.full_reason, Some(FullReason::FirstRun));
        assert_eq!(first.created.succeeded, 3);
        assert_eq!(s.identities.load(&scope).await.unwrap().len(), 3);
        let first_mark = s.state.load().await.unwrap().watermark(&scope).cloned().unwrap();
        let (_, chair) = shop.find(&NaturalKey::Sku("1".to_string())).await.unwrap();
        assert_eq!(chair.fields.get("regular_price"), Some(&json!("10.00")));

        // one selling price changes
        s.source
            .update(
                "product_prices",
                &[Filter::eq("product_id", 2), Filter::eq("price_type", 2)],
                Row::new().with("value", 24.5),
            )
            .await
            .unwrap();
        let second = s
            .engine
            .sync_entity(&products, &shop, SyncOptions::default())
            .await
            .unwrap();
        assert!(second.is_success());
        assert_eq!(second.full_reason, None);
        assert_eq!(second.candidates, 1);
        assert_eq!(second.updated.succeeded, 1);

        let last = shop.requests().await.pop().unwrap();
        assert!(last.create.is_empty());
        let op = &last.update[0];
        let body = op.payload.update_body(op.id);
        assert_eq!(body.len(), 2);
        assert_eq!(body.get("regular_price"), Some(&json!("24.50")));
        let second_mark = s.state.load().await.unwrap().watermark(&scope).cloned().unwrap();
        assert_eq!(
            second_mark.compare(&first_mark),
            Some(std::cmp::Ordering::Greater)
        );

        // a change to a price type nobody reads is not a candidate
        s.source
            .update(
                "product_prices",
                &[Filter::eq("product_id", 3), Filter::eq("price_type", 1)],
                Row::new().with("value", 1.0),
            )
            .await
            .unwrap();
        let calls = shop.call_count().await;
        let third = s
            .engine
            .sync_entity(&products, &shop, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(third.candidates, 0);
        assert_eq!(shop.call_count().await, calls);

        // regeneration starts over
        let before: Vec<_> = s.identities.load(&scope).await.unwrap().destination_ids().collect();
        let regen = s
            .engine
            .regenerate(&products, &shop, SyncOptions::default())
            .await
            .unwrap();
        assert!(regen.is_success());
        assert_eq!(regen.deleted.succeeded, 3);
        assert_eq!(regen.full_reason, Some(FullReason::FirstRun));
        assert_eq!(regen.created.succeeded, 3);
        for id in before {
            assert!(shop.record(id).await.is_none());
        }
        assert_eq!(shop.len().await, 3);
        assert_eq!(s.identities.load(&scope).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_products_lifecycle_with_history() {
        products_lifecycle(DetectionStrategy::History).await;
    }

    #[tokio::test]
    async fn test_products_lifecycle_with_version_counter() {
        products_lifecycle(DetectionStrategy::VersionCounter).await;
    }

    #[tokio::test]
    async fn test_discounts_follow_product_ids() {
        let s = setup(DetectionStrategy::VersionCounter).await;
        let shop = MemoryCatalog::new("shop");
        let rules = MemoryCatalog::new("rules");
        let products = Products::new(false).unwrap();
        s.engine
            .sync_entity(&products, &shop, SyncOptions::default())
            .await
            .unwrap();

        for (id, kind, product) in [(1, 6, 2), (2, 3, 2), (3, 11, 9)] {
            s.source
                .insert(
                    "discounts",
                    Row::new()
                        .with("discount_id", id)
                        .with("kind", kind)
                        .with("product_id", product)
                        .with("subject_type", 1)
                        .with("subject_id", 40)
                        .with("rate", 10.0),
                )
                .await
                .unwrap();
        }

        let product_ids = s.identities.load(products.scope()).await.unwrap();
        let desk = product_ids.get(&catalogsync_common::SourceId::new("2")).unwrap();
        let discounts = Discounts::new(product_ids).unwrap();
        let report = s
            .engine
            .sync_entity(&discounts, &rules, SyncOptions::default())
            .await
            .unwrap();

        // group discount and unsynced product are skipped
        assert!(report.is_success());
        assert_eq!(report.skipped, 2);
        assert_eq!(report.created.succeeded, 1);
        let (_, rule) = rules.find(&NaturalKey::Sku("DISC_1".to_string())).await.unwrap();
        assert_eq!(rule.fields.get("product_id"), Some(&json!(desk.get())));
        assert!(matches!(
            s.state.load().await.unwrap().watermark(discounts.scope()),
            Some(Watermark::Version(_))
        ));
    }
}
