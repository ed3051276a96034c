//! Trigger checkers.
//!
//! A checker inspects an external source and returns triggers; it never
//! fails out of band, problems travel back in `CheckResult::error`. The
//! HTTP poll checker ships in-tree; tracker and forge checkers are
//! registered by their API clients at startup.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::types::{CheckResult, JobType, Trigger};
use crate::error::Result;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait TriggerChecker: Send + Sync {
    /// Evaluate the job's configuration against the external source.
    async fn check(&self, config: &Value) -> CheckResult;
}

/// Maps each job type to its checker.
#[derive(Default)]
pub struct CheckerRegistry {
    checkers: HashMap<JobType, Arc<dyn TriggerChecker>>,
}

impl CheckerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the in-tree checkers installed.
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(JobType::HttpPoll, Arc::new(HttpPollChecker::new()?));
        Ok(registry)
    }

    pub fn register(&mut self, job_type: JobType, checker: Arc<dyn TriggerChecker>) {
        self.checkers.insert(job_type, checker);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn TriggerChecker>> {
        self.checkers.get(&job_type).cloned()
    }
}

#[derive(Debug, Deserialize)]
struct HttpPollConfig {
    url: String,
    #[serde(default)]
    session_name_prefix: Option<String>,
}

/// One pollable item. The endpoint returns either a bare array or
/// `{"items": [...]}`.
#[derive(Debug, Deserialize)]
struct PollItem {
    #[serde(alias = "id")]
    key: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
}

/// Polls a JSON endpoint and turns each item into a trigger keyed by the
/// item's id.
pub struct HttpPollChecker {
    client: reqwest::Client,
}

impl HttpPollChecker {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TriggerChecker for HttpPollChecker {
    async fn check(&self, config: &Value) -> CheckResult {
        let config: HttpPollConfig = match serde_json::from_value(config.clone()) {
            Ok(c) => c,
            Err(e) => return CheckResult::failed(format!("invalid config: {e}")),
        };

        let response = match self.client.get(&config.url).send().await {
            Ok(r) => r,
            Err(e) => return CheckResult::failed(format!("fetch failed: {e}")),
        };
        if !response.status().is_success() {
            return CheckResult::failed(format!("endpoint returned {}", response.status()));
        }

        let body: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => return CheckResult::failed(format!("invalid response body: {e}")),
        };

        match parse_poll_items(&body) {
            Ok(items) => CheckResult {
                triggers: items_to_triggers(items, config.session_name_prefix.as_deref()),
                error: None,
            },
            Err(e) => CheckResult::failed(e),
        }
    }
}

fn parse_poll_items(body: &Value) -> std::result::Result<Vec<PollItem>, String> {
    let items = match body {
        Value::Array(_) => body.clone(),
        Value::Object(map) => map
            .get("items")
            .cloned()
            .ok_or_else(|| "response has no 'items' array".to_string())?,
        _ => return Err("response is neither an array nor an object".to_string()),
    };
    serde_json::from_value(items).map_err(|e| format!("malformed items: {e}"))
}

fn items_to_triggers(items: Vec<PollItem>, prefix: Option<&str>) -> Vec<Trigger> {
    items
        .into_iter()
        .map(|item| {
            let title = item.title.unwrap_or_else(|| item.key.clone());
            let session_name = match prefix {
                Some(prefix) => format!("{prefix} {title}"),
                None => title.clone(),
            };
            Trigger {
                dedupe_key: item.key,
                session_name,
                prompt: item.prompt.unwrap_or_else(|| title.clone()),
                cwd: item.cwd,
                summary: title,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn items_from_bare_array_and_wrapped_object() {
        let bare = json!([{"key": "a"}, {"id": "b", "title": "Issue B"}]);
        let items = parse_poll_items(&bare).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].key, "b");
        assert_eq!(items[1].title.as_deref(), Some("Issue B"));

        let wrapped = json!({"items": [{"key": "c", "prompt": "do c"}]});
        let items = parse_poll_items(&wrapped).unwrap();
        assert_eq!(items[0].prompt.as_deref(), Some("do c"));

        assert!(parse_poll_items(&json!("nope")).is_err());
        assert!(parse_poll_items(&json!({"other": []})).is_err());
    }

    #[test]
    fn triggers_inherit_titles_and_prefix() {
        let items = vec![
            PollItem {
                key: "42".to_string(),
                title: Some("Fix flaky test".to_string()),
                prompt: None,
                cwd: Some("/repo".to_string()),
            },
            PollItem {
                key: "43".to_string(),
                title: None,
                prompt: Some("triage the report".to_string()),
                cwd: None,
            },
        ];
        let triggers = items_to_triggers(items, Some("[poll]"));
        assert_eq!(triggers[0].dedupe_key, "42");
        assert_eq!(triggers[0].session_name, "[poll] Fix flaky test");
        assert_eq!(triggers[0].prompt, "Fix flaky test");
        assert_eq!(triggers[0].cwd.as_deref(), Some("/repo"));
        assert_eq!(triggers[1].session_name, "[poll] 43");
        assert_eq!(triggers[1].prompt, "triage the report");
    }

    #[tokio::test]
    async fn invalid_config_reports_error() {
        let checker = HttpPollChecker::new().unwrap();
        let result = checker.check(&json!({"no_url": true})).await;
        assert!(result.triggers.is_empty());
        assert!(result.error.unwrap().contains("invalid config"));
    }

    #[test]
    fn registry_lookup() {
        let registry = CheckerRegistry::with_builtins().unwrap();
        assert!(registry.get(JobType::HttpPoll).is_some());
        assert!(registry.get(JobType::IssueTracker).is_none());
    }
}
