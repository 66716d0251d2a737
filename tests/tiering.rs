//! End-to-end lifecycle across the memory and local tiers, through real
//! SQLite connections and the registered VFS backends.

use std::sync::Arc;
use std::time::Duration;

use persisto::config::{Settings, StorageConfig};
use persisto::executor::Executor;
use persisto::registry::Registry;
use persisto::stage::StageManager;
use persisto::storage::{self, Stages};

fn setup(
    dir: &std::path::Path,
    settings: Settings,
) -> (Arc<Registry>, Arc<StageManager>, Executor) {
    storage::memory::register().unwrap();
    storage::local::register().unwrap();
    let local_dir = storage::local::prepare_directory(dir).unwrap();
    let stages = Stages::without_remote(&StorageConfig::default(), local_dir).unwrap();
    let registry = Arc::new(Registry::new(stages.clone()));
    let manager = Arc::new(StageManager::new(stages, settings, None));
    let executor = Executor::new(Arc::clone(&registry), Arc::clone(&manager));
    (registry, manager, executor)
}

fn quiet_settings() -> Settings {
    Settings {
        auto_stage_movement: false,
        auto_sync_enabled: false,
        persistence_stage: 2,
        default_creation_stage: 1,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn demote_then_promote_round_trip_preserves_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = quiet_settings();
    settings.auto_sync_enabled = true;
    settings.stage_timeout = Duration::from_secs(0);
    let (registry, manager, executor) = setup(dir.path(), settings);

    let record = registry.create("roundtrip", 1).await.unwrap();
    executor
        .execute(
            "roundtrip",
            vec![
                "CREATE TABLE x (id INTEGER)".to_string(),
                "INSERT INTO x VALUES (1)".to_string(),
            ],
        )
        .await
        .unwrap();

    manager.demote_to_farther_stage(&record).await.unwrap();
    assert_eq!(record.read().await.stage, 2);
    assert_eq!(record.read().await.request_count, 0);
    // The memory tier was vacated.
    assert!(!storage::memory::exists("/roundtrip"));

    manager.promote_to_closer_stage(&record).await.unwrap();
    assert_eq!(record.read().await.stage, 1);

    let results = executor
        .query("roundtrip", vec!["SELECT id FROM x".to_string()])
        .await
        .unwrap();
    let rows = results[0].as_ref().unwrap();
    assert_eq!(rows[0]["id"], serde_json::json!(1.0));

    storage::memory::remove("/roundtrip");
}

#[tokio::test(flavor = "multi_thread")]
async fn write_through_sync_lands_on_the_upper_tier() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = quiet_settings();
    settings.auto_sync_enabled = true;
    let (registry, _manager, executor) = setup(dir.path(), settings);

    registry.create("written", 1).await.unwrap();
    executor
        .execute(
            "written",
            vec![
                "CREATE TABLE t (n INT)".to_string(),
                "INSERT INTO t VALUES (42)".to_string(),
            ],
        )
        .await
        .unwrap();

    // The sync runs as a background task; wait for the copy to land.
    let synced = dir.path().canonicalize().unwrap().join("written.db");
    for _ in 0..100 {
        if synced.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(synced.exists(), "write-through sync never materialized");

    let conn = rusqlite::Connection::open(&synced).unwrap();
    let n: i64 = conn
        .query_row("SELECT n FROM t", [], |row| row.get(0))
        .unwrap();
    assert_eq!(n, 42);

    storage::memory::remove("/written");
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_queries_trigger_promotion() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = quiet_settings();
    settings.auto_stage_movement = true;
    settings.request_count_threshold = 2;
    settings.default_creation_stage = 2;
    let (registry, _manager, executor) = setup(dir.path(), settings);

    let record = registry.create("hot", 2).await.unwrap();
    executor
        .execute("hot", vec!["CREATE TABLE t (n INT)".to_string()])
        .await
        .unwrap();

    // Threshold is two; the second request schedules a promotion.
    executor
        .query("hot", vec!["SELECT * FROM t".to_string()])
        .await
        .unwrap();

    let mut promoted = false;
    for _ in 0..100 {
        if record.read().await.stage == 1 {
            promoted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(promoted, "database never reached the closer stage");

    storage::memory::remove("/hot");
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_tears_down_every_tier() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = quiet_settings();
    settings.auto_sync_enabled = true;
    let (registry, manager, executor) = setup(dir.path(), settings);

    registry.create("doomed", 1).await.unwrap();
    executor
        .execute(
            "doomed",
            vec![
                "CREATE TABLE t (n INT)".to_string(),
                "INSERT INTO t VALUES (1)".to_string(),
            ],
        )
        .await
        .unwrap();

    let on_disk = dir.path().canonicalize().unwrap().join("doomed.db");
    for _ in 0..100 {
        if on_disk.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let record = registry.find_by_name("doomed").await.unwrap();
    registry.delete(&manager, &record).await.unwrap();

    assert!(registry.find_by_name("doomed").await.is_none());
    assert!(!on_disk.exists());
    assert!(!storage::memory::exists("/doomed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn listing_reflects_placement_and_counters() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _manager, executor) = setup(dir.path(), quiet_settings());

    registry.create("listed", 1).await.unwrap();
    executor
        .execute("listed", vec!["CREATE TABLE t (n INT)".to_string()])
        .await
        .unwrap();

    let listing = registry.list().await;
    let entry = listing
        .iter()
        .find(|snapshot| snapshot.name == "listed")
        .unwrap();
    assert_eq!(entry.stage, 1);
    assert_eq!(entry.request_count, 1);

    storage::memory::remove("/listed");
}
