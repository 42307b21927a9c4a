use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::lifecycle::RoomLifecycle;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub participants_removed: usize,
    pub rooms_removed: usize,
    pub failures: usize,
}

pub struct CleanupScheduler {
    lifecycle: Arc<RoomLifecycle>,
    interval: Duration,
}

impl CleanupScheduler {
    pub fn new(lifecycle: Arc<RoomLifecycle>, interval: Duration) -> Self {
        Self { lifecycle, interval }
    }

    /// One full pass. Never fails as a whole: each item that cannot be
    /// removed is logged, counted and skipped.
    pub async fn run_once(&self) -> SweepReport {
        let liveness = self.lifecycle.liveness();
        let threshold = liveness.threshold();
        let mut report = SweepReport::default();
        let mut candidates = BTreeSet::new();

        match liveness.stale_participants(threshold).await {
            Ok(stale) => {
                for participant in stale {
                    match self.lifecycle.retire_participant(&participant).await {
                        Ok(true) => {
                            report.participants_removed += 1;
                            candidates.insert(participant.room_id);
                        }
                        // an explicit leave got there first
                        Ok(false) => {}
                        Err(e) => {
                            report.failures += 1;
                            warn!(
                                participant_id = %participant.id,
                                room_id = %participant.room_id,
                                error = %e,
                                "failed to remove stale participant"
                            );
                        }
                    }
                }
            }
            Err(e) => {
                report.failures += 1;
                warn!(error = %e, "failed to query stale participants");
            }
        }

        for room_id in &candidates {
            match self.lifecycle.reap_if_empty(room_id).await {
                Ok(true) => report.rooms_removed += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failures += 1;
                    warn!(room_id, error = %e, "failed to remove emptied room");
                }
            }
        }

        // rooms nobody ever heartbeated in, or whose delete failed last pass
        match liveness.stale_rooms(threshold).await {
            Ok(stale) => {
                for room in stale {
                    match self.lifecycle.delete_room(&room.id).await {
                        Ok(true) => report.rooms_removed += 1,
                        Ok(false) => {}
                        Err(e) => {
                            report.failures += 1;
                            warn!(room_id = %room.id, error = %e, "failed to remove stale room");
                        }
                    }
                }
            }
            Err(e) => {
                report.failures += 1;
                warn!(error = %e, "failed to query stale rooms");
            }
        }

        if report == SweepReport::default() {
            debug!("cleanup sweep found nothing stale");
        } else {
            info!(
                participants_removed = report.participants_removed,
                rooms_removed = report.rooms_removed,
                failures = report.failures,
                "cleanup sweep finished"
            );
        }
        report
    }

    /// Sweep now, then every `interval`. The returned handle is the only way
    /// to stop it.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(interval_secs = self.interval.as_secs(), "cleanup scheduler started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}
