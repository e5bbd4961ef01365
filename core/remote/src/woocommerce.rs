//! WooCommerce products batch endpoint.

use async_trait::async_trait;
use tracing::debug;

use catalogsync_common::{NaturalKey, Result};

use crate::api::{BatchApi, BatchRequest, BatchResponse};
use crate::http::{ApiSettings, HttpClient};

const BATCH_PATH: &str = "wp-json/wc/v3/products/batch";

/// WooCommerce `products/batch` client. Records are keyed by SKU.
pub struct WooCommerceProducts {
    client: HttpClient,
}

impl WooCommerceProducts {
    pub fn new(settings: ApiSettings) -> Result<Self> {
        Ok(Self {
            client: HttpClient::new(settings)?,
        })
    }
}

#[async_trait]
impl BatchApi for WooCommerceProducts {
    fn name(&self) -> &str {
        "woocommerce"
    }

    async fn submit(&self, request: &BatchRequest) -> Result<BatchResponse> {
        debug!(
            "Submitting products batch: {} create, {} update, {} delete",
            request.create.len(),
            request.update.len(),
            request.delete.len()
        );
        let body = self
            .client
            .post_json(BATCH_PATH, &request.to_json("create"))
            .await?;
        Ok(BatchResponse::from_json(&body, "create", "sku", NaturalKey::Sku))
    }
}
