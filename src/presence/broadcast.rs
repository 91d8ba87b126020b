//! Broadcast Scheduler
//!
//! Fixed-rate loop that sends every non-empty room a full `players_update`.
//! Runs independently of inbound traffic.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::network::protocol::ServerMessage;
use crate::presence::registry::RoomRegistry;

/// Summary of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Rooms that had members and were sent an update.
    pub rooms_updated: usize,
    /// Rooms skipped because they were empty.
    pub rooms_skipped: usize,
    /// Individual messages accepted by member mailboxes.
    pub deliveries: usize,
}

/// Periodic snapshot broadcaster.
pub struct BroadcastScheduler {
    registry: Arc<RoomRegistry>,
    period: Duration,
}

impl BroadcastScheduler {
    /// Create a scheduler over `registry` firing every `period`.
    pub fn new(registry: Arc<RoomRegistry>, period: Duration) -> Self {
        Self { registry, period }
    }

    /// Tick period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run one tick.
    ///
    /// Each room is locked on its own while its snapshot is taken and
    /// delivered, so a member list never mixes two states of the room.
    pub async fn tick_once(&self) -> TickReport {
        let mut report = TickReport::default();

        for (room_id, room) in self.registry.entries().await {
            let room = room.lock().await;
            if !room.has_members() {
                report.rooms_skipped += 1;
                continue;
            }

            let update = ServerMessage::PlayersUpdate(room.players());
            let delivered = room.deliver(&update);
            if delivered < room.len() {
                debug!(room_id = %room_id, delivered, members = room.len(), "partial players_update delivery");
            }
            report.rooms_updated += 1;
            report.deliveries += delivered;
        }

        report
    }

    /// Tick until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Broadcast scheduler running every {:?}", self.period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_once().await;
                }
                _ = shutdown.recv() => {
                    info!("Broadcast scheduler stopped");
                    break;
                }
            }
        }
    }
}
