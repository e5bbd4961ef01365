//! In-memory destination catalog for testing.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::Mutex;

use catalogsync_common::{DestinationId, Error, NaturalKey, Result};

use crate::api::{BatchApi, BatchRequest, BatchResponse, ItemResult, DEFAULT_MAX_BATCH_ITEMS};

/// A record held by the in-memory catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub natural_key: NaturalKey,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Default)]
struct CatalogState {
    next_id: u64,
    records: BTreeMap<DestinationId, RemoteRecord>,
    requests: Vec<BatchRequest>,
    calls: usize,
    fail_on_calls: HashSet<usize>,
    rejected_keys: HashSet<NaturalKey>,
}

impl CatalogState {
    fn key_taken(&self, key: &NaturalKey) -> bool {
        self.records.values().any(|r| &r.natural_key == key)
    }

    fn create(&mut self, body: Map<String, Value>, key: &NaturalKey) -> ItemResult {
        if self.rejected_keys.contains(key) {
            return ItemResult::failed(None, Some(key.clone()), format!("{} rejected", key));
        }
        if self.key_taken(key) {
            return ItemResult::failed(None, Some(key.clone()), format!("duplicate {}", key));
        }
        self.next_id += 1;
        let id = DestinationId::new(self.next_id);
        let mut echoed = body.clone();
        echoed.insert("id".to_string(), Value::from(id.get()));
        self.records.insert(
            id,
            RemoteRecord {
                natural_key: key.clone(),
                fields: body,
            },
        );
        ItemResult {
            id: Some(id),
            natural_key: Some(key.clone()),
            fields: echoed,
            error: None,
        }
    }

    fn update(&mut self, id: DestinationId, body: Map<String, Value>, key: &NaturalKey) -> ItemResult {
        if self.rejected_keys.contains(key) {
            return ItemResult::failed(Some(id), Some(key.clone()), format!("{} rejected", key));
        }
        let Some(record) = self.records.get_mut(&id) else {
            return ItemResult::failed(Some(id), Some(key.clone()), "invalid id");
        };
        for (name, value) in body {
            if name != "id" {
                record.fields.insert(name, value);
            }
        }
        let mut echoed = record.fields.clone();
        echoed.insert("id".to_string(), Value::from(id.get()));
        ItemResult {
            id: Some(id),
            natural_key: Some(record.natural_key.clone()),
            fields: echoed,
            error: None,
        }
    }

    fn delete(&mut self, id: DestinationId) -> ItemResult {
        match self.records.remove(&id) {
            Some(record) => ItemResult {
                id: Some(id),
                natural_key: Some(record.natural_key),
                fields: record.fields,
                error: None,
            },
            None => ItemResult::failed(Some(id), None, "invalid id"),
        }
    }
}

/// In-memory destination.
///
/// Assigns sequential ids, rejects duplicate natural keys, and records
/// every accepted request. Transport failures and per-key rejections can
/// be injected.
pub struct MemoryCatalog {
    name: String,
    max_batch_items: usize,
    state: Mutex<CatalogState>,
}

impl MemoryCatalog {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_batch_items: DEFAULT_MAX_BATCH_ITEMS,
            state: Mutex::new(CatalogState::default()),
        }
    }

    pub fn with_max_batch_items(mut self, max: usize) -> Self {
        self.max_batch_items = max;
        self
    }

    /// Add a record directly, bypassing the batch interface.
    pub async fn seed(&self, natural_key: NaturalKey, fields: Map<String, Value>) -> DestinationId {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = DestinationId::new(state.next_id);
        state.records.insert(id, RemoteRecord { natural_key, fields });
        id
    }

    /// Fail the `call`-th submission (1-based) with a transport error.
    pub async fn fail_transport_on_call(&self, call: usize) {
        self.state.lock().await.fail_on_calls.insert(call);
    }

    /// Reject every create or update carrying `key`.
    pub async fn reject_key(&self, key: NaturalKey) {
        self.state.lock().await.rejected_keys.insert(key);
    }

    pub async fn record(&self, id: DestinationId) -> Option<RemoteRecord> {
        self.state.lock().await.records.get(&id).cloned()
    }

    pub async fn find(&self, key: &NaturalKey) -> Option<(DestinationId, RemoteRecord)> {
        self.state
            .lock()
            .await
            .records
            .iter()
            .find(|(_, r)| &r.natural_key == key)
            .map(|(id, r)| (*id, r.clone()))
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Requests accepted so far, in order.
    pub async fn requests(&self) -> Vec<BatchRequest> {
        self.state.lock().await.requests.clone()
    }

    /// Number of submissions, failed ones included.
    pub async fn call_count(&self) -> usize {
        self.state.lock().await.calls
    }
}

#[async_trait]
impl BatchApi for MemoryCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_batch_items(&self) -> usize {
        self.max_batch_items
    }

    async fn submit(&self, request: &BatchRequest) -> Result<BatchResponse> {
        let mut state = self.state.lock().await;
        state.calls += 1;
        let call = state.calls;
        if state.fail_on_calls.contains(&call) {
            return Err(Error::Network(format!("injected transport failure on call {}", call)));
        }
        state.requests.push(request.clone());

        let mut response = BatchResponse::default();
        for payload in &request.create {
            let item = state.create(payload.create_body(), &payload.natural_key);
            response.created.push(item);
        }
        for op in &request.update {
            let item = state.update(op.id, op.payload.update_body(op.id), &op.payload.natural_key);
            response.updated.push(item);
        }
        for id in &request.delete {
            let item = state.delete(*id);
            response.deleted.push(item);
        }
        Ok(response)
    }
}
