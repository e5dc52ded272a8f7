//! GitHub repository hook management via the REST v3 API.
//!
//! Endpoints under `/repos/{owner}/{repo}/hooks`, pinned to API version
//! 2022-11-28.

use serde::Serialize;

use crate::error::ServerError;

const API_BASE: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";

/// A registered hook, as returned by the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredHook {
    pub id: i64,
    pub url: String,
    pub events: Vec<String>,
    pub active: bool,
}

pub struct GithubHooksClient {
    http: reqwest::Client,
}

impl Default for GithubHooksClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GithubHooksClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(20))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        token: &str,
    ) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .header("User-Agent", "ensemble-server")
    }

    /// Create a webhook on `owner/repo` pointing at `callback_url`.
    pub async fn create_hook(
        &self,
        repo: &str,
        token: &str,
        callback_url: &str,
        secret: &str,
        events: &[String],
    ) -> Result<RegisteredHook, ServerError> {
        let url = format!("{}/repos/{}/hooks", API_BASE, repo);
        let body = serde_json::json!({
            "name": "web",
            "active": true,
            "events": events,
            "config": {
                "url": callback_url,
                "content_type": "json",
                "secret": secret,
                "insecure_ssl": "0",
            }
        });

        let response = self
            .request(reqwest::Method::POST, &url, token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServerError::Upstream(format!("POST {}: {}", url, e)))?;

        let status = response.status();
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ServerError::Upstream(format!("hook create parse: {}", e)))?;
        if !status.is_success() {
            return Err(ServerError::Upstream(format!(
                "Hook creation failed ({}): {}",
                status,
                json.get("message").and_then(|v| v.as_str()).unwrap_or("")
            )));
        }

        Ok(parse_hook(&json))
    }

    /// List hooks registered on `owner/repo`.
    pub async fn list_hooks(
        &self,
        repo: &str,
        token: &str,
    ) -> Result<Vec<RegisteredHook>, ServerError> {
        let url = format!("{}/repos/{}/hooks", API_BASE, repo);
        let response = self
            .request(reqwest::Method::GET, &url, token)
            .send()
            .await
            .map_err(|e| ServerError::Upstream(format!("GET {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServerError::Upstream(format!(
                "Hook listing failed ({}) for {}",
                status, repo
            )));
        }
        let hooks: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| ServerError::Upstream(format!("hook list parse: {}", e)))?;
        Ok(hooks.iter().map(parse_hook).collect())
    }

    /// Delete a hook by id.
    pub async fn delete_hook(&self, repo: &str, token: &str, hook_id: i64) -> Result<(), ServerError> {
        let url = format!("{}/repos/{}/hooks/{}", API_BASE, repo, hook_id);
        let response = self
            .request(reqwest::Method::DELETE, &url, token)
            .send()
            .await
            .map_err(|e| ServerError::Upstream(format!("DELETE {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(ServerError::Upstream(format!(
                "Hook deletion failed ({}) for {}#{}",
                response.status(),
                repo,
                hook_id
            )));
        }
        Ok(())
    }
}

fn parse_hook(json: &serde_json::Value) -> RegisteredHook {
    RegisteredHook {
        id: json.get("id").and_then(|v| v.as_i64()).unwrap_or(0),
        url: json
            .pointer("/config/url")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        events: json
            .get("events")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|e| e.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default(),
        active: json.get("active").and_then(|v| v.as_bool()).unwrap_or(false),
    }
}
