//! Startup recovery and background liveness maintenance.
//!
//! On boot every persisted session is classified live-or-archived by a
//! signal-0 probe of its recorded pid and reattached to the launcher and
//! bridge. Two tickers keep the picture honest afterwards: a pid monitor
//! demotes sessions whose process has gone away, and a TTL sweep deletes
//! old archived sessions.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::storage::SessionStore;
use crate::ws::bridge::WsBridge;
use crate::ws::launcher::{CliLauncher, LaunchState, LauncherRecord};

const PID_MONITOR_INTERVAL: Duration = Duration::from_secs(30);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Load all persisted sessions and reattach them. Returns how many came
/// back live.
pub async fn recover_sessions(
    store: &Arc<dyn SessionStore>,
    launcher: &Arc<CliLauncher>,
    bridge: &Arc<WsBridge>,
) -> usize {
    let mut live = 0;
    let persisted = store.load_all().await;
    let total = persisted.len();

    for session in persisted {
        let alive = session
            .meta
            .pid
            .map(CliLauncher::pid_alive)
            .unwrap_or(false);

        let (state, exit_code, archived) = if alive {
            live += 1;
            (LaunchState::Connected, None, false)
        } else {
            (LaunchState::Exited, Some(-1), true)
        };

        launcher
            .restore_session(LauncherRecord::from_meta(&session.meta, state, exit_code))
            .await;
        bridge
            .restore_session(&session.meta.id, session.state, session.history, archived)
            .await;
    }

    info!("Recovered {total} persisted sessions ({live} live)");
    live
}

/// Re-probe sessions that claim to be live but whose process this runtime
/// does not own, demoting them on the first failed probe.
pub fn spawn_pid_monitor(launcher: Arc<CliLauncher>, bridge: Arc<WsBridge>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PID_MONITOR_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            for record in launcher.list_sessions().await {
                if record.state == LaunchState::Exited {
                    continue;
                }
                if launcher.has_process(&record.id).await {
                    continue;
                }
                let alive = record.pid.map(CliLauncher::pid_alive).unwrap_or(false);
                if !alive {
                    warn!("Session {} lost its process, marking exited", record.id);
                    launcher.mark_exited(&record.id, -1).await;
                    bridge.mark_archived(&record.id).await;
                }
            }
        }
    })
}

/// Delete archived sessions whose last activity predates the TTL.
/// A TTL of zero disables the sweep entirely.
pub fn spawn_cleanup(
    launcher: Arc<CliLauncher>,
    bridge: Arc<WsBridge>,
    ttl_days: u64,
) -> Option<JoinHandle<()>> {
    if ttl_days == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            sweep_expired(&launcher, &bridge, ttl_days).await;
        }
    }))
}

pub(crate) async fn sweep_expired(
    launcher: &Arc<CliLauncher>,
    bridge: &Arc<WsBridge>,
    ttl_days: u64,
) -> usize {
    let cutoff = Utc::now() - chrono::Duration::days(ttl_days as i64);
    let mut removed = 0;
    for record in launcher.list_sessions().await {
        if record.state != LaunchState::Exited {
            continue;
        }
        let reference = record.last_activity_at.unwrap_or(record.created_at);
        if reference < cutoff {
            info!("Cleaning up expired session {}", record.id);
            launcher.remove_session(&record.id).await;
            bridge.remove_session(&record.id).await;
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::NullStore;
    use crate::ws::launcher::LauncherConfig;
    use crate::ws::types::{Provider, SessionMeta};

    fn fixtures() -> (Arc<dyn SessionStore>, Arc<CliLauncher>, Arc<WsBridge>) {
        let store: Arc<dyn SessionStore> = Arc::new(NullStore);
        let (launcher, _rx) = CliLauncher::new(
            LauncherConfig {
                binary: "definitely-not-a-real-binary".to_string(),
                port: 9,
                tls: false,
                self_signed: false,
                default_cwd: None,
            },
            store.clone(),
        );
        let launcher = Arc::new(launcher);
        let bridge = Arc::new(WsBridge::new(store.clone(), launcher.clone()));
        (store, launcher, bridge)
    }

    fn meta(id: &str, pid: Option<u32>, age_days: i64) -> SessionMeta {
        SessionMeta {
            id: id.to_string(),
            pid,
            model: None,
            permission_mode: None,
            provider: Provider::Claude,
            cwd: "/".to_string(),
            created_at: Utc::now() - chrono::Duration::days(age_days),
            session_name: None,
            last_activity_at: None,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn live_pid_probe_distinguishes_our_own_process() {
        // Our own pid is certainly alive; a huge pid almost certainly not.
        assert!(CliLauncher::pid_alive(std::process::id()));
        assert!(!CliLauncher::pid_alive(u32::MAX - 1));
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_exited_sessions() {
        let (_store, launcher, bridge) = fixtures();

        let old = meta("old-archived", None, 90);
        launcher
            .restore_session(LauncherRecord::from_meta(
                &old,
                LaunchState::Exited,
                Some(-1),
            ))
            .await;

        let fresh = meta("fresh-archived", None, 1);
        launcher
            .restore_session(LauncherRecord::from_meta(
                &fresh,
                LaunchState::Exited,
                Some(0),
            ))
            .await;

        let live = meta("still-live", Some(std::process::id()), 90);
        launcher
            .restore_session(LauncherRecord::from_meta(&live, LaunchState::Connected, None))
            .await;

        let removed = sweep_expired(&launcher, &bridge, 30).await;
        assert_eq!(removed, 1);
        assert!(launcher.get_session("old-archived").await.is_none());
        assert!(launcher.get_session("fresh-archived").await.is_some());
        assert!(launcher.get_session("still-live").await.is_some());
    }

    #[tokio::test]
    async fn recent_activity_defers_cleanup() {
        let (_store, launcher, bridge) = fixtures();

        let mut touched = meta("touched", None, 90);
        touched.last_activity_at = Some(Utc::now());
        launcher
            .restore_session(LauncherRecord::from_meta(
                &touched,
                LaunchState::Exited,
                Some(0),
            ))
            .await;

        assert_eq!(sweep_expired(&launcher, &bridge, 30).await, 0);
        assert!(launcher.get_session("touched").await.is_some());
    }
}
