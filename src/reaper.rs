use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info};

use crate::controller::LifecycleController;

/// Recurring idle cleanup. Each tick runs one reap pass through the
/// controller; the pass itself excludes labs that are still provisioning,
/// so a stuck create never gets reaped out from under its creator.
pub struct IdleReaper {
    controller: Arc<LifecycleController>,
    interval: Duration,
    max_idle_hours: i64,
}

/// Handle to a spawned reaper. Dropping it without calling shutdown leaves
/// the task running for the life of the process.
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signal the loop to stop and wait for the in-flight pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("reaper task ended abnormally: {}", e);
        }
    }
}

impl IdleReaper {
    pub fn new(
        controller: Arc<LifecycleController>,
        interval: Duration,
        max_idle_hours: i64,
    ) -> Self {
        Self {
            controller,
            interval,
            max_idle_hours,
        }
    }

    pub fn spawn(self) -> ReaperHandle {
        let (tx, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            // The first tick fires immediately; skip it so a freshly
            // started daemon does not reap before adoption settles.
            ticker.tick().await;
            info!(
                "idle reaper running every {:?} with a {}h threshold",
                self.interval, self.max_idle_hours
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reclaimed = self
                            .controller
                            .cleanup_idle_labs(self.max_idle_hours)
                            .await;
                        if reclaimed > 0 {
                            info!("idle reaper reclaimed {} lab(s)", reclaimed);
                        }
                    }
                    _ = rx.changed() => {
                        info!("idle reaper shutting down");
                        break;
                    }
                }
            }
        });

        ReaperHandle { shutdown: tx, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::driver::mock::{MockDriver, MockStorage};
    use crate::models::LabConfig;
    use chrono::Utc;

    fn controller() -> Arc<LifecycleController> {
        Arc::new(LifecycleController::new(
            OrchestratorConfig::default(),
            Arc::new(MockDriver::new()),
            Arc::new(MockStorage::new()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_ticks_and_reclaims_stale_labs() {
        let controller = controller();
        let id = controller
            .create_student_lab("alice", "cs101", LabConfig::default())
            .await
            .lab_id
            .unwrap();
        controller.registry().update(id, |lab| {
            lab.created_at = Utc::now() - chrono::Duration::hours(25);
            lab.last_accessed = None;
        });

        let handle = IdleReaper::new(controller.clone(), Duration::from_secs(60), 24).spawn();

        // Cross one tick boundary
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert!(controller.registry().is_empty());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_loop() {
        let controller = controller();
        let handle = IdleReaper::new(controller.clone(), Duration::from_secs(60), 24).spawn();
        handle.shutdown().await;

        // A lab aged after shutdown is left alone
        let id = controller
            .create_student_lab("alice", "cs101", LabConfig::default())
            .await
            .lab_id
            .unwrap();
        controller.registry().update(id, |lab| {
            lab.created_at = Utc::now() - chrono::Duration::hours(40);
        });
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(controller.registry().len(), 1);
    }
}
