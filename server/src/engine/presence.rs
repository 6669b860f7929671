use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use super::events::ServerEvent;
use super::registry::{Connection, ConnectionRegistry, Presence};

/// Compare the current occupancy against the tone flag and return the event
/// to send, if the "alone in room" state flipped.
pub fn observe(tone_playing: &AtomicBool, occupancy: usize) -> Option<ServerEvent> {
    let alone = occupancy == 1;
    let was_alone = tone_playing.swap(alone, Ordering::AcqRel);
    match (was_alone, alone) {
        (false, true) => Some(ServerEvent::PlayTestTone),
        (true, false) => Some(ServerEvent::StopTestTone),
        _ => None,
    }
}

/// Observe once and push the resulting event, if any.
pub fn observe_and_notify(conn: &Connection, occupancy: usize) {
    if let Some(event) = observe(conn.tone_flag(), occupancy) {
        conn.send(event);
    }
}

/// Poll the registry every `period` for as long as `conn` stays in `room_id`
/// under membership `epoch`.
pub fn spawn_presence_watch(
    registry: Arc<ConnectionRegistry>,
    conn: Arc<Connection>,
    room_id: String,
    epoch: u64,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the join handler already observed.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match registry.presence(conn.id, &room_id, epoch) {
                Presence::Occupancy(n) => observe_and_notify(&conn, n),
                Presence::Gone => break,
            }
        }
        debug!(conn_id = %conn.id, %room_id, "presence watch stopped");
    })
}
