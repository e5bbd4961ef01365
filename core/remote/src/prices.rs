//! ERP-flow price rules batch endpoint.

use async_trait::async_trait;
use tracing::debug;

use catalogsync_common::{NaturalKey, Result};

use crate::api::{BatchApi, BatchRequest, BatchResponse};
use crate::http::{ApiSettings, HttpClient};

const BATCH_PATH: &str = "wp-json/erpflow/v1/prices/batch";

/// Creations go out as upserts so a rule left behind by an interrupted run
/// is adopted instead of duplicated.
const CREATE_SECTION: &str = "upsert";

/// Price rule client for the ERP-flow WordPress plugin. Rules are keyed by
/// their `sku` (`DISC_<discount id>`).
pub struct PriceRules {
    client: HttpClient,
}

impl PriceRules {
    pub fn new(settings: ApiSettings) -> Result<Self> {
        Ok(Self {
            client: HttpClient::new(settings)?,
        })
    }
}

#[async_trait]
impl BatchApi for PriceRules {
    fn name(&self) -> &str {
        "erpflow-prices"
    }

    async fn submit(&self, request: &BatchRequest) -> Result<BatchResponse> {
        debug!(
            "Submitting price rules batch: {} upsert, {} update, {} delete",
            request.create.len(),
            request.update.len(),
            request.delete.len()
        );
        let body = self
            .client
            .post_json(BATCH_PATH, &request.to_json(CREATE_SECTION))
            .await?;
        Ok(BatchResponse::from_json(
            &body,
            CREATE_SECTION,
            "sku",
            NaturalKey::Sku,
        ))
    }
}
