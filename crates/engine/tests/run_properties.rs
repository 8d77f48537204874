//! Run-level behaviour of the migration and seed pipelines against the
//! in-memory store.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tidemark_engine::backends::{MemoryPool, Operation};
use tidemark_engine::{
    ApplyPhase, FileLoader, Manager, Migration, MigrationError, Seed, SeedRunner, StoreError,
    StoreResult, Transaction, UnitId,
};
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

fn create_table(name: &str) -> String {
    format!("CREATE TABLE {} (id INT);", name)
}

fn numbered_migrations(versions: impl IntoIterator<Item = u32>) -> Vec<Migration> {
    versions
        .into_iter()
        .map(|v| Migration::new(v, format!("create_t{}", v), create_table(&format!("t{}", v))))
        .collect()
}

#[tokio::test]
async fn test_second_run_applies_nothing() {
    let pool = MemoryPool::new();
    let ctx = CancellationToken::new();
    let mut manager = Manager::with_pool(pool.clone());
    manager.add_migrations(numbered_migrations([1, 2, 3])).unwrap();

    let first = manager.run_migrations(&ctx).await.unwrap();
    assert_eq!(first.applied_count(), 3);
    assert_eq!(first.skipped, 0);

    let second = manager.run_migrations(&ctx).await.unwrap();
    assert!(second.applied.is_empty());
    assert_eq!(second.skipped, 3);
    assert_eq!(pool.committed_scripts().len(), 3);
    assert_eq!(pool.attempted_scripts().len(), 3);
}

#[tokio::test]
async fn test_migrations_apply_in_version_order() {
    let pool = MemoryPool::new();
    let ctx = CancellationToken::new();
    let mut manager = Manager::with_pool(pool.clone());
    manager.add_migrations(numbered_migrations([3, 1, 2])).unwrap();

    let summary = manager.run_migrations(&ctx).await.unwrap();

    assert_eq!(
        pool.committed_scripts(),
        vec![create_table("t1"), create_table("t2"), create_table("t3")]
    );
    let versions: Vec<u32> = summary
        .applied
        .iter()
        .map(|unit| match unit {
            UnitId::Migration { version, .. } => *version,
            other => panic!("Unexpected unit {}", other),
        })
        .collect();
    assert_eq!(versions, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_failure_stops_run_and_leaves_no_partial_unit() {
    let pool = MemoryPool::new();
    let ctx = CancellationToken::new();
    let mut manager = Manager::with_pool(pool.clone());
    manager.add_migrations(numbered_migrations(1..=6)).unwrap();
    pool.fail_script("CREATE TABLE t5 ", StoreError::Query("syntax error".to_string()));

    let err = manager.run_migrations(&ctx).await.unwrap_err();

    match &err {
        MigrationError::Apply { unit, phase, source } => {
            assert_eq!(
                *unit,
                UnitId::Migration {
                    version: 5,
                    description: "create_t5".to_string()
                }
            );
            assert_eq!(*phase, ApplyPhase::Execute);
            assert_eq!(*source, StoreError::Query("syntax error".to_string()));
        }
        other => panic!("Expected apply error, got {:?}", other),
    }
    assert_eq!(pool.applied_versions(), vec![1, 2, 3, 4]);
    assert!(!pool.committed_scripts().contains(&create_table("t5")));
    assert!(!pool.attempted_scripts().contains(&create_table("t6")));
    assert_eq!(pool.open_transactions(), 0);
}

#[tokio::test]
async fn test_resume_after_partial_failure() {
    let pool = MemoryPool::new();
    let ctx = CancellationToken::new();
    let mut manager = Manager::with_pool(pool.clone());
    manager.add_migrations(numbered_migrations(1..=6)).unwrap();
    pool.fail_script("CREATE TABLE t5 ", StoreError::Query("syntax error".to_string()));
    assert!(manager.run_migrations(&ctx).await.is_err());

    pool.clear_faults();
    let summary = manager.run_migrations(&ctx).await.unwrap();

    assert_eq!(summary.applied_count(), 2);
    assert_eq!(summary.skipped, 4);
    assert_eq!(pool.applied_versions(), vec![1, 2, 3, 4, 5, 6]);

    let committed = pool.committed_scripts();
    for v in 1..=6 {
        let script = create_table(&format!("t{}", v));
        assert_eq!(committed.iter().filter(|s| **s == script).count(), 1);
    }
}

#[tokio::test]
async fn test_seeds_run_by_priority() {
    let pool = MemoryPool::new();
    let ctx = CancellationToken::new();
    let mut manager = Manager::with_pool(pool.clone());
    manager
        .add_seeds(vec![
            Seed::sql("orders", 20, "INSERT orders;"),
            Seed::sql("roles", 5, "INSERT roles;"),
            Seed::sql("users", 10, "INSERT users;"),
        ])
        .unwrap();

    let summary = manager.run_seeds(&ctx).await.unwrap();

    assert_eq!(
        pool.committed_scripts(),
        vec!["INSERT roles;", "INSERT users;", "INSERT orders;"]
    );
    assert_eq!(summary.applied_count(), 3);
    assert_eq!(pool.applied_seeds(), vec!["orders", "roles", "users"]);

    let again = manager.run_seeds(&ctx).await.unwrap();
    assert!(again.applied.is_empty());
    assert_eq!(again.skipped, 3);
}

struct TwoStepSeed;

#[async_trait]
impl SeedRunner for TwoStepSeed {
    async fn run(&self, ctx: &CancellationToken, tx: &mut Transaction) -> StoreResult<()> {
        tx.execute(ctx, "INSERT INTO roles VALUES ('admin');", &[]).await?;
        tx.execute(ctx, "INSERT INTO users VALUES ('root', 'admin');", &[]).await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_failed_seed_discards_its_earlier_statements() {
    let pool = MemoryPool::new();
    let ctx = CancellationToken::new();
    let mut manager = Manager::with_pool(pool.clone());
    manager.add_seed(Seed::new("admin", 1, TwoStepSeed)).unwrap();
    manager.add_seed(Seed::sql("later", 2, "INSERT later;")).unwrap();
    pool.fail_script("INSERT INTO users", StoreError::Query("fk violation".to_string()));

    let err = manager.run_seeds(&ctx).await.unwrap_err();

    assert_eq!(
        err.unit(),
        Some(&UnitId::Seed {
            name: "admin".to_string()
        })
    );
    assert!(pool.committed_scripts().is_empty());
    assert!(pool.applied_seeds().is_empty());
    assert!(!pool.attempted_scripts().contains(&"INSERT later;".to_string()));
    assert_eq!(pool.call_count(Operation::Rollback), 1);
}

#[tokio::test]
async fn test_concurrent_runs_record_a_migration_once() {
    let pool = MemoryPool::new();
    let ctx = CancellationToken::new();
    let migration = Migration::new(1, "create_accounts", create_table("accounts"));

    let mut first = Manager::with_pool(pool.clone());
    let mut second = Manager::with_pool(pool.clone());
    first.add_migration(migration.clone()).unwrap();
    second.add_migration(migration).unwrap();

    // Both runs read an empty applied set before either records the version.
    pool.hold_script("CREATE TABLE accounts", Arc::new(Barrier::new(2)));

    let (a, b) = tokio::join!(first.run_migrations(&ctx), second.run_migrations(&ctx));

    let results = [a, b];
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1);

    let failure = results
        .into_iter()
        .find_map(|r| r.err())
        .expect("one run should fail");
    match failure {
        MigrationError::Apply { phase, source, .. } => {
            assert_eq!(phase, ApplyPhase::Record);
            assert!(source.is_unique_violation());
        }
        other => panic!("Expected apply error, got {:?}", other),
    }
    assert_eq!(pool.applied_versions(), vec![1]);
    assert_eq!(pool.committed_scripts(), vec![create_table("accounts")]);
}

#[tokio::test]
async fn test_cancellation_aborts_in_flight_unit() {
    let pool = MemoryPool::new();
    let ctx = CancellationToken::new();
    let mut manager = Manager::with_pool(pool.clone());
    manager.add_migrations(numbered_migrations([1, 2, 3])).unwrap();

    // Nothing else ever reaches the barrier, so t2 blocks until cancelled.
    pool.hold_script("CREATE TABLE t2 ", Arc::new(Barrier::new(2)));

    let (result, _) = tokio::join!(manager.run_migrations(&ctx), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.cancel();
    });

    match result.unwrap_err() {
        MigrationError::Apply { unit, phase, source } => {
            assert_eq!(
                unit,
                UnitId::Migration {
                    version: 2,
                    description: "create_t2".to_string()
                }
            );
            assert_eq!(phase, ApplyPhase::Execute);
            assert!(source.is_cancelled());
        }
        other => panic!("Expected apply error, got {:?}", other),
    }
    assert_eq!(pool.applied_versions(), vec![1]);
    assert_eq!(pool.open_transactions(), 0);
}

#[tokio::test]
async fn test_loaded_directory_round_trip() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("001_init_up.sql"), "CREATE TABLE users (id INT);").unwrap();
    fs::write(dir.path().join("001_init_down.sql"), "DROP TABLE users;").unwrap();

    let migrations = FileLoader::default().load_migrations(dir.path()).unwrap();
    assert_eq!(
        migrations,
        vec![Migration {
            version: 1,
            description: "init".to_string(),
            up: "CREATE TABLE users (id INT);".to_string(),
            down: Some("DROP TABLE users;".to_string()),
        }]
    );

    let pool = MemoryPool::new();
    let ctx = CancellationToken::new();
    let mut manager = Manager::with_pool(pool.clone());
    manager.add_migrations(migrations).unwrap();
    manager.run_migrations(&ctx).await.unwrap();

    // Down scripts are never executed by a run.
    assert_eq!(pool.attempted_scripts(), vec!["CREATE TABLE users (id INT);"]);
}
