//! Cron persistence.
//!
//! Jobs and run history live in `jobs.json` and `runs.json` under the cron
//! directory; each job's seen-trigger set lives in `seen/<job-id>.json`.
//! Mutations persist eagerly through the same atomic temp-and-rename path
//! as the session store.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::warn;

use super::types::{CronJob, CronRun};
use crate::core::storage::file::{read_json, write_json_atomic};

/// Run history kept per store, oldest evicted first.
const MAX_RUNS: usize = 200;

pub struct CronStore {
    base_dir: PathBuf,
    jobs: RwLock<Vec<CronJob>>,
    runs: RwLock<Vec<CronRun>>,
    seen: RwLock<HashMap<String, HashSet<String>>>,
}

impl CronStore {
    pub async fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        if let Err(e) = tokio::fs::create_dir_all(base_dir.join("seen")).await {
            warn!("Failed to create cron dir {}: {e}", base_dir.display());
        }

        let jobs: Vec<CronJob> = read_json(&base_dir.join("jobs.json")).await.unwrap_or_default();
        let runs: Vec<CronRun> = read_json(&base_dir.join("runs.json")).await.unwrap_or_default();

        let mut seen = HashMap::new();
        for job in &jobs {
            let keys: HashSet<String> = read_json(&base_dir.join("seen").join(format!("{}.json", job.id)))
                .await
                .map(|keys: Vec<String>| keys.into_iter().collect())
                .unwrap_or_default();
            seen.insert(job.id.clone(), keys);
        }

        Self {
            base_dir,
            jobs: RwLock::new(jobs),
            runs: RwLock::new(runs),
            seen: RwLock::new(seen),
        }
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    pub async fn list_jobs(&self) -> Vec<CronJob> {
        self.jobs.read().await.clone()
    }

    pub async fn get_job(&self, id: &str) -> Option<CronJob> {
        self.jobs.read().await.iter().find(|j| j.id == id).cloned()
    }

    pub async fn insert_job(&self, job: CronJob) {
        {
            let mut jobs = self.jobs.write().await;
            jobs.push(job);
        }
        self.persist_jobs().await;
    }

    /// Apply `mutate` to the job and persist; returns the updated job.
    pub async fn update_job<F>(&self, id: &str, mutate: F) -> Option<CronJob>
    where
        F: FnOnce(&mut CronJob),
    {
        let updated = {
            let mut jobs = self.jobs.write().await;
            let job = jobs.iter_mut().find(|j| j.id == id)?;
            mutate(job);
            job.updated_at = chrono::Utc::now();
            Some(job.clone())
        };
        if updated.is_some() {
            self.persist_jobs().await;
        }
        updated
    }

    pub async fn delete_job(&self, id: &str) -> bool {
        let removed = {
            let mut jobs = self.jobs.write().await;
            let before = jobs.len();
            jobs.retain(|j| j.id != id);
            before != jobs.len()
        };
        if removed {
            self.persist_jobs().await;
            self.seen.write().await.remove(id);
            let path = self.seen_path(id);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove seen set {}: {e}", path.display());
                }
            }
        }
        removed
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    pub async fn record_run(&self, run: CronRun) {
        {
            let mut runs = self.runs.write().await;
            runs.push(run);
            if runs.len() > MAX_RUNS {
                let excess = runs.len() - MAX_RUNS;
                runs.drain(0..excess);
            }
        }
        self.persist_runs().await;
    }

    pub async fn update_run<F>(&self, id: &str, mutate: F) -> Option<CronRun>
    where
        F: FnOnce(&mut CronRun),
    {
        let updated = {
            let mut runs = self.runs.write().await;
            let run = runs.iter_mut().find(|r| r.id == id)?;
            mutate(run);
            Some(run.clone())
        };
        if updated.is_some() {
            self.persist_runs().await;
        }
        updated
    }

    /// Runs for one job, newest first.
    pub async fn runs_for_job(&self, job_id: &str) -> Vec<CronRun> {
        let mut runs: Vec<CronRun> = self
            .runs
            .read()
            .await
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        runs.reverse();
        runs
    }

    pub async fn all_runs(&self) -> Vec<CronRun> {
        let mut runs = self.runs.read().await.clone();
        runs.reverse();
        runs
    }

    // ------------------------------------------------------------------
    // Seen-trigger sets
    // ------------------------------------------------------------------

    pub async fn is_seen(&self, job_id: &str, dedupe_key: &str) -> bool {
        self.seen
            .read()
            .await
            .get(job_id)
            .map(|set| set.contains(dedupe_key))
            .unwrap_or(false)
    }

    pub async fn mark_seen(&self, job_id: &str, dedupe_key: &str) {
        {
            let mut seen = self.seen.write().await;
            seen.entry(job_id.to_string())
                .or_default()
                .insert(dedupe_key.to_string());
        }
        self.persist_seen(job_id).await;
    }

    /// Forget every trigger the job has acted on.
    pub async fn reset_seen(&self, job_id: &str) {
        self.seen.write().await.remove(job_id);
        let path = self.seen_path(job_id);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to reset seen set {}: {e}", path.display());
            }
        }
    }

    /// Write everything out; called on shutdown.
    pub async fn flush(&self) {
        self.persist_jobs().await;
        self.persist_runs().await;
        let job_ids: Vec<String> = self.seen.read().await.keys().cloned().collect();
        for id in job_ids {
            self.persist_seen(&id).await;
        }
    }

    fn seen_path(&self, job_id: &str) -> PathBuf {
        self.base_dir.join("seen").join(format!("{job_id}.json"))
    }

    async fn persist_jobs(&self) {
        let jobs = self.jobs.read().await.clone();
        let _ = write_json_atomic(&self.base_dir.join("jobs.json"), &jobs).await;
    }

    async fn persist_runs(&self) {
        let runs = self.runs.read().await.clone();
        let _ = write_json_atomic(&self.base_dir.join("runs.json"), &runs).await;
    }

    async fn persist_seen(&self, job_id: &str) {
        let keys: Option<Vec<String>> = self
            .seen
            .read()
            .await
            .get(job_id)
            .map(|set| set.iter().cloned().collect());
        if let Some(keys) = keys {
            let _ = write_json_atomic(&self.seen_path(job_id), &keys).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::types::{JobType, RunStatus};
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn job(id: &str) -> CronJob {
        CronJob {
            id: id.to_string(),
            name: format!("job {id}"),
            job_type: JobType::HttpPoll,
            enabled: true,
            interval_seconds: 60,
            config: json!({"url": "https://example.com"}),
            model: None,
            permission_mode: None,
            last_run_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn run(id: &str, job_id: &str) -> CronRun {
        CronRun {
            id: id.to_string(),
            job_id: job_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            spawned_session_id: None,
            trigger_summary: String::new(),
            error: None,
            trigger_count: 0,
        }
    }

    #[tokio::test]
    async fn jobs_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = CronStore::new(dir.path()).await;
            store.insert_job(job("j1")).await;
            store
                .update_job("j1", |j| j.interval_seconds = 120)
                .await
                .unwrap();
        }
        let store = CronStore::new(dir.path()).await;
        let jobs = store.list_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].interval_seconds, 120);
    }

    #[tokio::test]
    async fn seen_set_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = CronStore::new(dir.path()).await;
            store.insert_job(job("j1")).await;
            store.mark_seen("j1", "k1").await;
            store.mark_seen("j1", "k2").await;
        }
        let store = CronStore::new(dir.path()).await;
        assert!(store.is_seen("j1", "k1").await);
        assert!(store.is_seen("j1", "k2").await);
        assert!(!store.is_seen("j1", "k3").await);

        store.reset_seen("j1").await;
        assert!(!store.is_seen("j1", "k1").await);
    }

    #[tokio::test]
    async fn run_history_is_capped() {
        let dir = TempDir::new().unwrap();
        let store = CronStore::new(dir.path()).await;
        for i in 0..(MAX_RUNS + 10) {
            store.record_run(run(&format!("r{i}"), "j1")).await;
        }
        let runs = store.all_runs().await;
        assert_eq!(runs.len(), MAX_RUNS);
        // Newest first, oldest evicted.
        assert_eq!(runs[0].id, format!("r{}", MAX_RUNS + 9));
        assert!(!runs.iter().any(|r| r.id == "r0"));
    }

    #[tokio::test]
    async fn update_run_finalizes() {
        let dir = TempDir::new().unwrap();
        let store = CronStore::new(dir.path()).await;
        store.record_run(run("r1", "j1")).await;
        store
            .update_run("r1", |r| {
                r.status = RunStatus::Completed;
                r.finished_at = Some(Utc::now());
                r.trigger_count = 2;
            })
            .await
            .unwrap();

        let runs = store.runs_for_job("j1").await;
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(runs[0].trigger_count, 2);
        assert!(runs[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn delete_job_drops_seen_set() {
        let dir = TempDir::new().unwrap();
        let store = CronStore::new(dir.path()).await;
        store.insert_job(job("j1")).await;
        store.mark_seen("j1", "k1").await;

        assert!(store.delete_job("j1").await);
        assert!(store.get_job("j1").await.is_none());
        assert!(!store.is_seen("j1", "k1").await);
        assert!(!dir.path().join("seen/j1.json").exists());
    }
}
