//! WordPress users, exposed through an emulated batch interface.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use catalogsync_common::{DestinationId, Error, NaturalKey, Result};

use crate::api::{BatchApi, BatchRequest, BatchResponse, ItemResult, Payload};
use crate::http::{ApiSettings, HttpClient};

const USERS_PATH: &str = "wp-json/wp/v2/users";

/// WordPress REST users client.
///
/// WordPress has no batch endpoint for users, so each item becomes its own
/// call. A rejected user is an item error. A transient failure (network,
/// HTTP 429 or 5xx gateway errors) fails the whole batch so that it can be
/// retried or aborted.
pub struct WordPressUsers {
    client: HttpClient,
}

impl WordPressUsers {
    pub fn new(settings: ApiSettings) -> Result<Self> {
        Ok(Self {
            client: HttpClient::new(settings)?,
        })
    }

    fn random_password() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Item error for a rejection, `Err` for a transient failure.
    fn rejected(
        e: Error,
        id: Option<DestinationId>,
        natural_key: Option<NaturalKey>,
    ) -> Result<ItemResult> {
        if e.is_transient() {
            return Err(e);
        }
        Ok(ItemResult::failed(id, natural_key, e))
    }

    async fn create(&self, payload: &Payload) -> Result<ItemResult> {
        let mut body = payload.create_body();
        body.insert(
            "password".to_string(),
            Value::String(Self::random_password()),
        );
        match self.client.post_json(USERS_PATH, &Value::Object(body)).await {
            Ok(response) => Ok(Self::echo(&response, None, payload)),
            Err(e) => {
                warn!("Failed to create user {}: {}", payload.natural_key, e);
                Self::rejected(e, None, Some(payload.natural_key.clone()))
            }
        }
    }

    async fn update(&self, id: DestinationId, payload: &Payload) -> Result<ItemResult> {
        let mut body = payload.update_body(id);
        body.remove("id");
        let path = format!("{}/{}", USERS_PATH, id);
        match self.client.post_json(&path, &Value::Object(body)).await {
            Ok(response) => Ok(Self::echo(&response, Some(id), payload)),
            Err(e) => {
                warn!("Failed to update user {}: {}", id, e);
                Self::rejected(e, Some(id), Some(payload.natural_key.clone()))
            }
        }
    }

    async fn delete(&self, id: DestinationId) -> Result<ItemResult> {
        let path = format!("{}/{}", USERS_PATH, id);
        match self
            .client
            .delete(&path, &[("force", "true"), ("reassign", "0")])
            .await
        {
            Ok(response) => {
                let mut result = ItemResult::from_json(
                    response.get("previous").unwrap_or(&response),
                    "username",
                    NaturalKey::Username,
                );
                result.id = Some(id);
                Ok(result)
            }
            Err(e) => {
                warn!("Failed to delete user {}: {}", id, e);
                Self::rejected(e, Some(id), None)
            }
        }
    }

    /// Successful responses are user objects; the username is only echoed in
    /// edit context, so fall back to the key that was sent.
    fn echo(response: &Value, id: Option<DestinationId>, payload: &Payload) -> ItemResult {
        let mut result = ItemResult::from_json(response, "username", NaturalKey::Username);
        if result.natural_key.is_none() {
            result.natural_key = Some(payload.natural_key.clone());
        }
        if result.id.is_none() {
            result.id = id;
        }
        result
    }
}

#[async_trait]
impl BatchApi for WordPressUsers {
    fn name(&self) -> &str {
        "wordpress-users"
    }

    async fn submit(&self, request: &BatchRequest) -> Result<BatchResponse> {
        debug!(
            "Submitting users batch: {} create, {} update, {} delete",
            request.create.len(),
            request.update.len(),
            request.delete.len()
        );
        let mut response = BatchResponse::default();
        for payload in &request.create {
            response.created.push(self.create(payload).await?);
        }
        for op in &request.update {
            response.updated.push(self.update(op.id, &op.payload).await?);
        }
        for id in &request.delete {
            response.deleted.push(self.delete(*id).await?);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use url::Url;

    fn user(login: &str) -> Payload {
        Payload::new(
            NaturalKey::Username(login.to_string()),
            json!({"email": format!("{}@example.com", login)})
                .as_object()
                .cloned()
                .unwrap(),
        )
    }

    #[test]
    fn test_rejection_is_an_item_error() {
        let result = WordPressUsers::rejected(
            Error::Http {
                status: 400,
                body: "existing_user_login".to_string(),
            },
            None,
            Some(NaturalKey::Username("annkow1".to_string())),
        )
        .unwrap();
        assert!(!result.is_ok());
        assert_eq!(
            result.natural_key,
            Some(NaturalKey::Username("annkow1".to_string()))
        );

        let transient = WordPressUsers::rejected(
            Error::Http {
                status: 503,
                body: String::new(),
            },
            Some(DestinationId::new(4)),
            None,
        );
        assert!(transient.is_err());
    }

    #[tokio::test]
    async fn test_refused_connection_fails_the_batch() {
        let settings = ApiSettings::new(Url::parse("http://127.0.0.1:1/").unwrap(), "admin", "pw")
            .with_timeout(Duration::from_secs(5));
        let users = WordPressUsers::new(settings).unwrap();
        let request = BatchRequest {
            create: vec![user("annkow1"), user("janbar2")],
            ..Default::default()
        };

        let err = users.submit(&request).await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {}", err);
    }

    #[test]
    fn test_echo_falls_back_to_sent_username() {
        let payload = Payload::new(
            NaturalKey::Username("janKow12".to_string()),
            json!({"email": "j@k.pl"}).as_object().cloned().unwrap(),
        );
        let result = WordPressUsers::echo(&json!({"id": 31, "email": "j@k.pl"}), None, &payload);
        assert_eq!(result.id, Some(DestinationId::new(31)));
        assert_eq!(
            result.natural_key,
            Some(NaturalKey::Username("janKow12".to_string()))
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_random_passwords_differ() {
        let a = WordPressUsers::random_password();
        let b = WordPressUsers::random_password();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
