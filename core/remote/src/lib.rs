//! Destination catalog clients for catalogsync.
//!
//! Every destination is reached through the [`BatchApi`] trait, which takes
//! creates, updates and deletes together and reports per-item outcomes.
//! Implementations:
//! - [`WooCommerceProducts`]: WooCommerce `products/batch`
//! - [`WordPressUsers`]: WordPress users, one call per item
//! - [`PriceRules`]: ERP-flow price rules plugin
//! - [`MemoryCatalog`]: in-memory destination for tests

pub mod api;
mod http;
pub mod memory;
pub mod prices;
pub mod woocommerce;
pub mod wordpress;

pub use api::{
    BatchApi, BatchRequest, BatchResponse, ItemResult, Payload, UpdateOp, DEFAULT_MAX_BATCH_ITEMS,
};
pub use http::ApiSettings;
pub use memory::{MemoryCatalog, RemoteRecord};
pub use prices::PriceRules;
pub use woocommerce::WooCommerceProducts;
pub use wordpress::WordPressUsers;
