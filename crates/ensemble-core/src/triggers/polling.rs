//! GitHub Events-API polling — the webhook alternative for hosts that can't
//! receive deliveries.
//!
//! Every tick, each unique repo across enabled configs is polled with
//! `GET /repos/{repo}/events?per_page=30`. Events newer than the stored
//! marker (`last_event_ids[repo]`) are converted to the webhook payload
//! shape and run through the same matcher/prompter; the marker then advances
//! to the newest id in the batch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::ServerError;
use crate::models::background_task::TriggerSource;
use crate::store::WebhookStore;
use crate::triggers::webhook::WebhookReceiver;

const EVENTS_PER_PAGE: u32 = 30;

/// Poller configuration and dedup markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollerConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// repo → newest event id already seen.
    pub last_event_ids: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<String>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: std::env::var("POLL_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            last_event_ids: HashMap::new(),
            last_checked_at: None,
        }
    }
}

/// Outcome of polling one repo.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResult {
    pub repo: String,
    pub events_found: u32,
    pub events_processed: u32,
    pub events_skipped: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct GithubPoller {
    webhook_store: WebhookStore,
    receiver: Arc<WebhookReceiver>,
    http: reqwest::Client,
    config: RwLock<PollerConfig>,
    running: AtomicBool,
}

impl GithubPoller {
    pub fn new(webhook_store: WebhookStore, receiver: Arc<WebhookReceiver>) -> Self {
        Self {
            webhook_store,
            receiver,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(20))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            config: RwLock::new(PollerConfig::default()),
            running: AtomicBool::new(false),
        }
    }

    pub async fn get_config(&self) -> PollerConfig {
        self.config.read().await.clone()
    }

    pub async fn set_enabled(&self, enabled: bool) {
        self.config.write().await.enabled = enabled;
    }

    pub async fn set_interval(&self, interval_seconds: u64) {
        if interval_seconds >= 10 {
            self.config.write().await.interval_seconds = interval_seconds;
        }
    }

    /// Start the polling loop. Each tick checks every unique repo; a failing
    /// repo is logged and retried next tick.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let poller = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = {
                    let config = poller.config.read().await;
                    std::time::Duration::from_secs(config.interval_seconds)
                };
                tokio::time::sleep(interval).await;
                if !poller.running.load(Ordering::SeqCst) {
                    break;
                }
                if !poller.config.read().await.enabled {
                    continue;
                }
                match poller.check_now().await {
                    Ok(results) => {
                        let processed: u32 = results.iter().map(|r| r.events_processed).sum();
                        if processed > 0 {
                            tracing::info!(
                                "[Poller] {} repos checked, {} events processed",
                                results.len(),
                                processed
                            );
                        }
                    }
                    Err(e) => tracing::error!("[Poller] check failed: {}", e),
                }
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Poll every unique repo across enabled configs once.
    pub async fn check_now(&self) -> Result<Vec<PollResult>, ServerError> {
        let configs = self.webhook_store.list_enabled_configs().await?;

        // repo → (token, configs)
        let mut repos: HashMap<String, (String, Vec<usize>)> = HashMap::new();
        for (idx, config) in configs.iter().enumerate() {
            let entry = repos
                .entry(config.repo.clone())
                .or_insert_with(|| (config.github_token.clone(), Vec::new()));
            if entry.0.is_empty() && !config.github_token.is_empty() {
                entry.0 = config.github_token.clone();
            }
            entry.1.push(idx);
        }

        let mut results = Vec::new();
        for (repo, (token, config_idxs)) in repos {
            let marker = self
                .config
                .read()
                .await
                .last_event_ids
                .get(&repo)
                .cloned();

            let result = match self.poll_repo(&repo, &token, marker.as_deref()).await {
                Ok((events, new_marker)) => {
                    let found = events.len() as u32;
                    let mut processed = 0u32;

                    // Oldest first, so downstream ordering matches reality.
                    for event in events.iter().rev() {
                        let (event_type, payload) = match convert_event(event) {
                            Some(converted) => converted,
                            None => continue,
                        };
                        for idx in &config_idxs {
                            let outcome = self
                                .receiver
                                .dispatch_matched(
                                    &configs[*idx],
                                    &event_type,
                                    &payload,
                                    true,
                                    TriggerSource::Polling,
                                )
                                .await;
                            tracing::debug!(
                                "[Poller] {} {} via config {} → {:?}",
                                repo,
                                event_type,
                                outcome.config_id,
                                outcome.outcome
                            );
                        }
                        processed += 1;
                    }

                    if let Some(new_marker) = new_marker {
                        self.config
                            .write()
                            .await
                            .last_event_ids
                            .insert(repo.clone(), new_marker);
                    }

                    PollResult {
                        repo: repo.clone(),
                        events_found: found,
                        events_processed: processed,
                        events_skipped: found - processed,
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::warn!("[Poller] {} failed: {}", repo, e);
                    PollResult {
                        repo: repo.clone(),
                        events_found: 0,
                        events_processed: 0,
                        events_skipped: 0,
                        error: Some(e.to_string()),
                    }
                }
            };
            results.push(result);
        }

        self.config.write().await.last_checked_at = Some(chrono::Utc::now().to_rfc3339());
        Ok(results)
    }

    /// Fetch a repo's event page and split out the entries newer than the
    /// marker. Returns (new events newest-first, new marker).
    async fn poll_repo(
        &self,
        repo: &str,
        token: &str,
        marker: Option<&str>,
    ) -> Result<(Vec<serde_json::Value>, Option<String>), ServerError> {
        let url = format!(
            "https://api.github.com/repos/{}/events?per_page={}",
            repo, EVENTS_PER_PAGE
        );
        let mut request = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "ensemble-server");
        if !token.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ServerError::Upstream(format!("GET {}: {}", url, e)))?;

        let status = response.status();
        if status.as_u16() == 403 {
            let remaining = response
                .headers()
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if remaining == "0" {
                return Err(ServerError::RateLimited);
            }
        }
        if !status.is_success() {
            return Err(ServerError::Upstream(format!(
                "Events API returned {} for {}",
                status, repo
            )));
        }

        let events: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| ServerError::Upstream(format!("Events API parse: {}", e)))?;

        Ok(filter_new_events(events, marker))
    }
}

/// Split the newest-first batch at the marker. Everything before the marker
/// is new; the marker itself and anything older is skipped. The new marker is
/// the newest id in the batch.
pub fn filter_new_events(
    events: Vec<serde_json::Value>,
    marker: Option<&str>,
) -> (Vec<serde_json::Value>, Option<String>) {
    let newest_id = events
        .first()
        .and_then(|e| e.get("id"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let new_events = match marker {
        Some(marker) => events
            .into_iter()
            .take_while(|e| e.get("id").and_then(|v| v.as_str()) != Some(marker))
            .collect(),
        None => events,
    };

    (new_events, newest_id)
}

/// Convert an Events-API entry to the webhook payload shape, so the same
/// matcher/prompter applies. Returns (webhook event type, payload).
pub fn convert_event(event: &serde_json::Value) -> Option<(String, serde_json::Value)> {
    let api_type = event.get("type").and_then(|v| v.as_str())?;
    let event_type = match api_type {
        "IssuesEvent" => "issues",
        "IssueCommentEvent" => "issue_comment",
        "PullRequestEvent" => "pull_request",
        "PullRequestReviewEvent" => "pull_request_review",
        "CheckRunEvent" => "check_run",
        "CheckSuiteEvent" => "check_suite",
        "WorkflowRunEvent" => "workflow_run",
        "WorkflowJobEvent" => "workflow_job",
        "CreateEvent" => "create",
        "DeleteEvent" => "delete",
        "PushEvent" => "push",
        _ => return None,
    };

    let mut payload = event.get("payload").cloned().unwrap_or(serde_json::json!({}));
    if let Some(repo_name) = event.pointer("/repo/name").and_then(|v| v.as_str()) {
        payload["repository"] = serde_json::json!({ "full_name": repo_name });
    }

    Some((event_type.to_string(), payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "type": "IssuesEvent",
            "repo": { "name": "acme/widgets" },
            "payload": { "action": "opened", "issue": { "number": 1, "title": "t", "body": "b" } }
        })
    }

    #[test]
    fn marker_splits_new_from_seen() {
        // Events arrive newest-first.
        let events = vec![event("5"), event("4"), event("3"), event("2")];
        let (new, marker) = filter_new_events(events, Some("3"));

        let ids: Vec<&str> = new.iter().filter_map(|e| e["id"].as_str()).collect();
        assert_eq!(ids, vec!["5", "4"]);
        assert_eq!(marker.as_deref(), Some("5"));
    }

    #[test]
    fn marker_event_itself_is_never_processed() {
        let events = vec![event("7"), event("6")];
        let (new, _) = filter_new_events(events, Some("7"));
        assert!(new.is_empty());
    }

    #[test]
    fn missing_marker_processes_all() {
        let events = vec![event("2"), event("1")];
        let (new, marker) = filter_new_events(events, None);
        assert_eq!(new.len(), 2);
        assert_eq!(marker.as_deref(), Some("2"));
    }

    #[test]
    fn empty_batch_leaves_marker_unset() {
        let (new, marker) = filter_new_events(Vec::new(), Some("9"));
        assert!(new.is_empty());
        assert!(marker.is_none());
    }

    #[test]
    fn converts_events_api_shape_to_webhook_shape() {
        let (event_type, payload) = convert_event(&event("1")).unwrap();
        assert_eq!(event_type, "issues");
        assert_eq!(
            payload.pointer("/repository/full_name").and_then(|v| v.as_str()),
            Some("acme/widgets")
        );
        assert_eq!(payload["action"], "opened");

        assert!(convert_event(&serde_json::json!({ "type": "WatchEvent" })).is_none());
    }
}
