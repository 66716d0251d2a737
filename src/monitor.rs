//! Periodic inactivity sweep. The monitor never blocks on I/O itself; it
//! only schedules demotion tasks, and the final inactivity decision is
//! re-checked under the record lock inside the stage manager.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::registry::Registry;
use crate::stage::StageManager;

/// Spawn the sweep task. Ticks at half the inactivity timeout (floor 1 s).
pub fn spawn(registry: Arc<Registry>, manager: Arc<StageManager>) -> JoinHandle<()> {
    let period = (manager.settings().stage_timeout / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweep(&registry, &manager).await;
        }
    })
}

async fn sweep(registry: &Arc<Registry>, manager: &Arc<StageManager>) {
    let timeout = manager.settings().stage_timeout;
    let farthest = manager.stages().farthest();

    for record in registry.records().await {
        let idle = {
            let state = record.read().await;
            state.stage != farthest && state.last_accessed.elapsed() >= timeout
        };
        if !idle {
            continue;
        }

        tracing::debug!(name = %record.name(), "scheduling demotion for idle database");
        let manager = Arc::clone(manager);
        tokio::spawn(async move {
            if let Err(err) = manager.demote_to_farther_stage(&record).await {
                tracing::warn!(name = %record.name(), error = %err, "demotion failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Settings, StorageConfig};
    use crate::storage::Stages;
    use std::path::PathBuf;

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_records_are_demoted_by_a_sweep() {
        crate::storage::memory::register().unwrap();
        crate::storage::local::register().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let local_dir = crate::storage::local::prepare_directory(dir.path()).unwrap();
        let stages = Stages::without_remote(&StorageConfig::default(), local_dir).unwrap();
        let settings = Settings {
            stage_timeout: Duration::from_millis(0),
            persistence_stage: 2,
            ..Default::default()
        };
        let registry = Arc::new(Registry::new(stages.clone()));
        let manager = Arc::new(StageManager::new(stages, settings, None));

        let record = registry.create("idle_db", 1).await.unwrap();
        sweep(&registry, &manager).await;

        // The demotion task runs in the background; wait for it to land.
        for _ in 0..50 {
            if record.read().await.stage == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(record.read().await.stage, 2);

        crate::storage::memory::remove("/idle_db");
    }

    #[tokio::test]
    async fn fresh_records_are_left_alone() {
        crate::storage::memory::register().unwrap();
        let stages =
            Stages::without_remote(&StorageConfig::default(), PathBuf::from("/tmp")).unwrap();
        let settings = Settings {
            stage_timeout: Duration::from_secs(3600),
            ..Default::default()
        };
        let registry = Arc::new(Registry::new(stages.clone()));
        let manager = Arc::new(StageManager::new(stages, settings, None));

        let record = registry.create("fresh_db", 1).await.unwrap();
        sweep(&registry, &manager).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(record.read().await.stage, 1);

        crate::storage::memory::remove("/fresh_db");
    }
}
