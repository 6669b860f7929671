use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::voice_engine::VoiceEngine;

/// Periods for the background sweeps.
#[derive(Debug, Clone)]
pub struct ReaperSchedule {
    /// How often idle rooms are checked, and how long a room must sit empty.
    pub room_idle: Duration,
    pub ban_sweep: Duration,
    pub log_sweep: Duration,
}

impl Default for ReaperSchedule {
    fn default() -> Self {
        Self {
            room_idle: Duration::from_secs(10 * 60),
            ban_sweep: Duration::from_secs(5 * 60),
            log_sweep: Duration::from_secs(60 * 60),
        }
    }
}

/// Start the room, ban and log reapers. They stop when `cancel` fires.
pub fn spawn_reapers(
    engine: Arc<VoiceEngine>,
    schedule: ReaperSchedule,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let room_idle = chrono::Duration::from_std(schedule.room_idle)
        .unwrap_or_else(|_| chrono::Duration::minutes(10));

    vec![
        spawn_sweep("rooms", schedule.room_idle, cancel.clone(), {
            let engine = engine.clone();
            move || {
                engine.reap_idle_rooms(room_idle);
            }
        }),
        spawn_sweep("bans", schedule.ban_sweep, cancel.clone(), {
            let engine = engine.clone();
            move || {
                engine.reap_expired_bans();
            }
        }),
        spawn_sweep("logs", schedule.log_sweep, cancel, move || {
            engine.reap_stale_logs();
        }),
    ]
}

/// Run `sweep` every `period` until `cancel` fires. The first run happens
/// one period after spawn.
pub fn spawn_sweep(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    sweep: impl Fn() + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(reaper = name, "reaper shutting down");
                    break;
                }
                _ = ticker.tick() => sweep(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::admin::AdminAuth;
    use crate::auth::media_token::MediaTokenIssuer;
    use crate::engine::voice_engine::EngineSettings;

    #[tokio::test]
    async fn test_reapers_stop_on_cancel() {
        let engine = Arc::new(VoiceEngine::new(
            Arc::new(MediaTokenIssuer::new("k", "s", "ws://media.test")),
            AdminAuth::new("", vec![]),
            EngineSettings::default(),
        ));
        let cancel = CancellationToken::new();
        let handles = spawn_reapers(engine, ReaperSchedule::default(), cancel.clone());
        assert_eq!(handles.len(), 3);

        cancel.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_sweep_runs_on_tick() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = spawn_sweep("test", Duration::from_millis(10), cancel.clone(), move || {
            let _ = tx.send(());
        });

        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_ban_sweep_keeps_live_bans() {
        let engine = VoiceEngine::new(
            Arc::new(MediaTokenIssuer::new("k", "s", "ws://media.test")),
            AdminAuth::new("", vec![]),
            EngineSettings::default(),
        );
        let (conn, _rx) = engine.connect("10.0.0.9");
        engine.handle_text(
            &conn,
            r#"{"type":"join_room","payload":{"room_name":"jam","user_name":"eve"}}"#,
        );
        let ban = engine.admin_ban(&conn.user_id, "spam", 1).unwrap();
        assert_eq!(engine.list_bans().len(), 1);
        assert_eq!(engine.reap_expired_bans(), 0);
        assert_eq!(ban.ip, "10.0.0.9");
    }
}
