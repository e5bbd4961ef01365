//! Shared HTTP plumbing for the WordPress-family APIs.

use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use catalogsync_common::{Error, Result};

const USER_AGENT: &str = concat!("catalogsync/", env!("CARGO_PKG_VERSION"));

/// Connection settings for one remote API.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    /// Site root, e.g. `https://shop.example.com`.
    pub base_url: Url,
    pub username: String,
    pub secret: String,
    /// Applied to every request individually.
    pub timeout: Duration,
}

impl ApiSettings {
    pub fn new(base_url: Url, username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            base_url,
            username: username.into(),
            secret: secret.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Authenticated JSON client rooted at a site URL.
pub(crate) struct HttpClient {
    http: Client,
    settings: ApiSettings,
}

impl HttpClient {
    pub(crate) fn new(settings: ApiSettings) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http, settings })
    }

    /// Resolve `path` below the site root.
    pub(crate) fn endpoint(&self, path: &str) -> Result<Url> {
        let base = self.settings.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{}/{}", base, path.trim_start_matches('/')))
            .map_err(|e| Error::Config(format!("Invalid endpoint {}: {}", path, e)))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.settings.username, Some(&self.settings.secret))
            .timeout(self.settings.timeout)
    }

    pub(crate) async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = self.endpoint(path)?;
        debug!("POST {}", url);
        let response = self
            .request(Method::POST, url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("POST {} failed: {}", path, e)))?;
        handle_response(response).await
    }

    pub(crate) async fn delete(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = self.endpoint(path)?;
        debug!("DELETE {}", url);
        let response = self
            .request(Method::DELETE, url)
            .query(query)
            .send()
            .await
            .map_err(|e| Error::Network(format!("DELETE {} failed: {}", path, e)))?;
        handle_response(response).await
    }
}

/// Map a response to its JSON body or an `Error::Http`.
async fn handle_response(response: Response) -> Result<Value> {
    let status = response.status();
    if status.is_success() {
        response
            .json()
            .await
            .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(Error::Http {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_below_site_root() {
        let settings = ApiSettings::new(
            Url::parse("https://shop.example.com/store/").unwrap(),
            "ck",
            "cs",
        );
        let client = HttpClient::new(settings).unwrap();
        assert_eq!(
            client.endpoint("/wp-json/wc/v3/products/batch").unwrap().as_str(),
            "https://shop.example.com/store/wp-json/wc/v3/products/batch"
        );
    }
}
