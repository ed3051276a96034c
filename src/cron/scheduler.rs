//! Cron scheduler.
//!
//! One process-wide ticker re-evaluates which enabled jobs are due every
//! few seconds. A due job runs its checker; every trigger whose dedupe key
//! is new for the job becomes a freshly launched, bridged session with the
//! trigger's prompt injected as the first user message. Once a dedupe key
//! is recorded it is never acted on again unless the job is reset.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use super::checkers::CheckerRegistry;
use super::store::CronStore;
use super::types::{CronJob, CronRun, RunStatus};
use crate::ws::bridge::WsBridge;
use crate::ws::launcher::{CliLauncher, LaunchOptions};

const TICK_INTERVAL: Duration = Duration::from_secs(5);

pub struct CronScheduler {
    store: Arc<CronStore>,
    registry: Arc<CheckerRegistry>,
    launcher: Arc<CliLauncher>,
    bridge: Arc<WsBridge>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CronScheduler {
    pub fn new(
        store: Arc<CronStore>,
        registry: Arc<CheckerRegistry>,
        launcher: Arc<CliLauncher>,
        bridge: Arc<WsBridge>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            registry,
            launcher,
            bridge,
            shutdown,
            handle: Mutex::new(None),
        }
    }

    /// Start the tick loop.
    pub async fn start(self: Arc<Self>) {
        let scheduler = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => scheduler.tick().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("Cron scheduler stopped");
        });
        *self.handle.lock().await = Some(handle);
        info!("Cron scheduler started");
    }

    /// Stop the tick loop and wait for it to wind down.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn tick(&self) {
        let now = Utc::now();
        for job in self.store.list_jobs().await {
            if job.is_due(now) {
                self.run_job(&job).await;
            }
        }
    }

    /// One immediate invocation, bypassing the due check. Used by the
    /// manual-trigger endpoint.
    pub async fn trigger_now(&self, job_id: &str) -> Option<CronRun> {
        let job = self.store.get_job(job_id).await?;
        Some(self.run_job(&job).await)
    }

    /// Forget every trigger the job has acted on.
    pub async fn reset(&self, job_id: &str) {
        self.store.reset_seen(job_id).await;
    }

    async fn run_job(&self, job: &CronJob) -> CronRun {
        let run_id = uuid::Uuid::new_v4().to_string();
        let run = CronRun {
            id: run_id.clone(),
            job_id: job.id.clone(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            spawned_session_id: None,
            trigger_summary: String::new(),
            error: None,
            trigger_count: 0,
        };
        self.store.record_run(run.clone()).await;
        self.store
            .update_job(&job.id, |j| j.last_run_at = Some(Utc::now()))
            .await;

        let Some(checker) = self.registry.get(job.job_type) else {
            warn!("No checker registered for job type {:?}", job.job_type);
            return self
                .finalize(
                    &run_id,
                    RunStatus::Failed,
                    0,
                    String::new(),
                    Some(format!("no checker registered for {:?}", job.job_type)),
                    None,
                )
                .await;
        };

        let result = checker.check(&job.config).await;
        if let Some(error) = result.error {
            warn!("Checker for job '{}' failed: {error}", job.name);
            return self
                .finalize(&run_id, RunStatus::Failed, 0, String::new(), Some(error), None)
                .await;
        }

        let mut spawned: Option<String> = None;
        let mut summaries: Vec<String> = Vec::new();

        for trigger in result.triggers {
            if self.store.is_seen(&job.id, &trigger.dedupe_key).await {
                continue;
            }

            let record = self
                .launcher
                .launch(LaunchOptions {
                    model: job.model.clone(),
                    permission_mode: job.permission_mode.clone(),
                    cwd: trigger.cwd.clone(),
                    session_name: Some(trigger.session_name.clone()),
                    ..Default::default()
                })
                .await;
            self.bridge.create_session(&record.id).await;
            // The queue covers the window before the subprocess attaches.
            self.bridge
                .route_client_message(
                    &record.id,
                    json!({"type": "user_message", "content": trigger.prompt}),
                )
                .await;

            info!(
                "Job '{}' trigger '{}' spawned session {}",
                job.name, trigger.dedupe_key, record.id
            );
            self.store.mark_seen(&job.id, &trigger.dedupe_key).await;
            spawned = Some(record.id.clone());
            summaries.push(trigger.summary);
        }

        let count = summaries.len() as u32;
        let status = if count == 0 {
            RunStatus::Skipped
        } else {
            RunStatus::Completed
        };
        let summary = if summaries.is_empty() {
            "no new triggers".to_string()
        } else {
            summaries.join("; ")
        };
        self.finalize(&run_id, status, count, summary, None, spawned)
            .await
    }

    async fn finalize(
        &self,
        run_id: &str,
        status: RunStatus,
        trigger_count: u32,
        trigger_summary: String,
        error: Option<String>,
        spawned_session_id: Option<String>,
    ) -> CronRun {
        match self
            .store
            .update_run(run_id, |run| {
                run.finished_at = Some(Utc::now());
                run.status = status;
                run.trigger_count = trigger_count;
                run.trigger_summary = trigger_summary.clone();
                run.error = error.clone();
                run.spawned_session_id = spawned_session_id.clone();
            })
            .await
        {
            Some(run) => run,
            None => {
                // The run was evicted from the capped history mid-flight.
                warn!("Run {run_id} vanished before finalization");
                CronRun {
                    id: run_id.to_string(),
                    job_id: String::new(),
                    started_at: Utc::now(),
                    finished_at: Some(Utc::now()),
                    status,
                    spawned_session_id,
                    trigger_summary,
                    error,
                    trigger_count,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::{NullStore, SessionStore};
    use crate::cron::checkers::TriggerChecker;
    use crate::cron::types::{CheckResult, JobType, Trigger};
    use crate::ws::launcher::LauncherConfig;
    use async_trait::async_trait;
    use serde_json::Value;
    use tempfile::TempDir;
    use tokio::sync::Mutex as AsyncMutex;

    struct ScriptedChecker {
        batches: AsyncMutex<Vec<CheckResult>>,
    }

    #[async_trait]
    impl TriggerChecker for ScriptedChecker {
        async fn check(&self, _config: &Value) -> CheckResult {
            let mut batches = self.batches.lock().await;
            if batches.is_empty() {
                CheckResult::default()
            } else {
                batches.remove(0)
            }
        }
    }

    fn trigger(key: &str) -> Trigger {
        Trigger {
            dedupe_key: key.to_string(),
            session_name: format!("session for {key}"),
            prompt: format!("work on {key}"),
            cwd: None,
            summary: format!("summary {key}"),
        }
    }

    async fn fixtures(
        batches: Vec<CheckResult>,
    ) -> (Arc<CronScheduler>, Arc<CronStore>, Arc<CliLauncher>, Arc<WsBridge>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CronStore::new(dir.path()).await);
        let session_store: Arc<dyn SessionStore> = Arc::new(NullStore);
        let (launcher, _rx) = CliLauncher::new(
            LauncherConfig {
                binary: "definitely-not-a-real-binary".to_string(),
                port: 9,
                tls: false,
                self_signed: false,
                default_cwd: Some(std::env::temp_dir()),
            },
            session_store.clone(),
        );
        let launcher = Arc::new(launcher);
        let bridge = Arc::new(WsBridge::new(session_store, launcher.clone()));

        let mut registry = CheckerRegistry::new();
        registry.register(
            JobType::HttpPoll,
            Arc::new(ScriptedChecker {
                batches: AsyncMutex::new(batches),
            }),
        );

        let scheduler = Arc::new(CronScheduler::new(
            store.clone(),
            Arc::new(registry),
            launcher.clone(),
            bridge.clone(),
        ));
        (scheduler, store, launcher, bridge, dir)
    }

    fn job(id: &str) -> CronJob {
        CronJob {
            id: id.to_string(),
            name: format!("job {id}"),
            job_type: JobType::HttpPoll,
            enabled: true,
            interval_seconds: 1,
            config: serde_json::json!({}),
            model: Some("m1".to_string()),
            permission_mode: Some("default".to_string()),
            last_run_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn triggers_spawn_sessions_with_queued_prompts() {
        let (scheduler, store, launcher, bridge, _dir) = fixtures(vec![CheckResult {
            triggers: vec![trigger("k1"), trigger("k2")],
            error: None,
        }])
        .await;
        store.insert_job(job("j1")).await;

        let run = scheduler.trigger_now("j1").await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.trigger_count, 2);
        assert!(run.spawned_session_id.is_some());
        assert!(run.trigger_summary.contains("summary k1"));
        assert!(run.finished_at.is_some());

        let sessions = launcher.list_sessions().await;
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].model.as_deref(), Some("m1"));
        assert!(sessions[0]
            .session_name
            .as_deref()
            .unwrap()
            .starts_with("session for"));

        // The prompt is waiting in each session's history and queue.
        for session in sessions {
            let history = bridge.history(&session.id).await;
            assert_eq!(history.len(), 1);
            assert!(history[0].is_user_message());
        }
    }

    #[tokio::test]
    async fn dedupe_holds_across_runs() {
        let (scheduler, store, launcher, _bridge, _dir) = fixtures(vec![
            CheckResult {
                triggers: vec![trigger("k1"), trigger("k2")],
                error: None,
            },
            CheckResult {
                triggers: vec![trigger("k2"), trigger("k3")],
                error: None,
            },
        ])
        .await;
        store.insert_job(job("j1")).await;

        let first = scheduler.trigger_now("j1").await.unwrap();
        assert_eq!(first.trigger_count, 2);

        let second = scheduler.trigger_now("j1").await.unwrap();
        assert_eq!(second.trigger_count, 1, "only k3 is new");
        assert_eq!(launcher.list_sessions().await.len(), 3);
    }

    #[tokio::test]
    async fn reset_reopens_seen_triggers() {
        let (scheduler, store, launcher, _bridge, _dir) = fixtures(vec![
            CheckResult {
                triggers: vec![trigger("k1")],
                error: None,
            },
            CheckResult {
                triggers: vec![trigger("k1")],
                error: None,
            },
        ])
        .await;
        store.insert_job(job("j1")).await;

        scheduler.trigger_now("j1").await.unwrap();
        scheduler.reset("j1").await;
        let run = scheduler.trigger_now("j1").await.unwrap();
        assert_eq!(run.trigger_count, 1);
        assert_eq!(launcher.list_sessions().await.len(), 2);
    }

    #[tokio::test]
    async fn checker_error_records_failed_run() {
        let (scheduler, store, launcher, _bridge, _dir) =
            fixtures(vec![CheckResult::failed("upstream is down")]).await;
        store.insert_job(job("j1")).await;

        let run = scheduler.trigger_now("j1").await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("upstream is down"));
        assert!(launcher.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn empty_batch_is_skipped() {
        let (scheduler, store, _launcher, _bridge, _dir) = fixtures(vec![CheckResult::default()]).await;
        store.insert_job(job("j1")).await;

        let run = scheduler.trigger_now("j1").await.unwrap();
        assert_eq!(run.status, RunStatus::Skipped);
        assert_eq!(run.trigger_summary, "no new triggers");
    }

    #[tokio::test]
    async fn missing_checker_fails_the_run() {
        let (scheduler, store, _launcher, _bridge, _dir) = fixtures(Vec::new()).await;
        let mut tracker_job = job("j2");
        tracker_job.job_type = JobType::IssueTracker;
        store.insert_job(tracker_job).await;

        let run = scheduler.trigger_now("j2").await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("no checker registered"));
    }

    #[tokio::test]
    async fn disabled_jobs_do_not_tick() {
        let (scheduler, store, launcher, _bridge, _dir) = fixtures(vec![CheckResult {
            triggers: vec![trigger("k1")],
            error: None,
        }])
        .await;
        let mut disabled = job("j1");
        disabled.enabled = false;
        store.insert_job(disabled).await;

        scheduler.tick().await;
        assert!(launcher.list_sessions().await.is_empty());
        assert!(store.all_runs().await.is_empty());
    }
}
