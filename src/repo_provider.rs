//! Client for the Git hosting service that issues learner repos.
//!
//! Every call is a bearer-authenticated HTTP request; any non-2xx answer is a
//! [`RepoProviderError::Status`]. Nothing here retries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::errors::RepoProviderError;

pub type ProviderResult<T> = Result<T, RepoProviderError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub git_url: String,
}

#[derive(Debug, Deserialize)]
struct CreatedRepo {
    id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Hook {
    #[serde(default)]
    url: Option<String>,
}

#[async_trait]
pub trait RepoProvider: Send + Sync {
    /// Create an anonymous repo. Returns its handle.
    async fn create_repo(&self, name: &str) -> ProviderResult<String>;
    async fn get_repo(&self, id: &str) -> ProviderResult<RepoInfo>;
    async fn delete_repo(&self, id: &str) -> ProviderResult<()>;
    async fn get_webhook(&self, id: &str) -> ProviderResult<Option<String>>;
    /// Set the post-push webhook. Returns the stored URL.
    async fn set_webhook(&self, id: &str, url: &str) -> ProviderResult<String>;
    async fn delete_webhook(&self, id: &str) -> ProviderResult<()>;
}

/// `RepoProvider` over the gitto HTTP API.
pub struct GittoClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl GittoClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> ProviderResult<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RepoProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> ProviderResult<T> {
        let response = self.send(builder).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| RepoProviderError::InvalidResponse(format!("{}: {}", e, text)))
    }
}

#[async_trait]
impl RepoProvider for GittoClient {
    async fn create_repo(&self, name: &str) -> ProviderResult<String> {
        let created: CreatedRepo = self
            .send_json(
                self.request(reqwest::Method::POST, "/api/repos")
                    .json(&json!({"name": name})),
            )
            .await?;
        tracing::info!(repo_id = %created.id, name, "Created repo");
        Ok(created.id)
    }

    async fn get_repo(&self, id: &str) -> ProviderResult<RepoInfo> {
        self.send_json(self.request(reqwest::Method::GET, &format!("/api/repos/{}", id)))
            .await
    }

    async fn delete_repo(&self, id: &str) -> ProviderResult<()> {
        self.send(self.request(reqwest::Method::DELETE, &format!("/api/repos/{}", id)))
            .await?;
        tracing::info!(repo_id = %id, "Deleted repo");
        Ok(())
    }

    async fn get_webhook(&self, id: &str) -> ProviderResult<Option<String>> {
        let hook: Hook = self
            .send_json(self.request(reqwest::Method::GET, &format!("/api/repos/{}/hook", id)))
            .await?;
        Ok(hook.url)
    }

    async fn set_webhook(&self, id: &str, url: &str) -> ProviderResult<String> {
        let hook: Hook = self
            .send_json(
                self.request(reqwest::Method::POST, &format!("/api/repos/{}/hook", id))
                    .json(&json!({"url": url})),
            )
            .await?;
        hook.url
            .ok_or_else(|| RepoProviderError::InvalidResponse("Webhook response has no url".to_string()))
    }

    async fn delete_webhook(&self, id: &str) -> ProviderResult<()> {
        self.send(self.request(reqwest::Method::DELETE, &format!("/api/repos/{}/hook", id)))
            .await?;
        Ok(())
    }
}
