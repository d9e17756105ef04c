//! Integration tests for the `dots-db` access layer.
//!
//! Every test runs against its own temporary `SQLite` file through the same
//! `Any` driver used for `MySQL` and `PostgreSQL`, so no services are
//! needed. The `MySQL` smoke test at the bottom needs a live server and is
//! marked `#[ignore]`:
//!
//! ```bash
//! DOTS_TEST_MYSQL="user:password@/dots_test?charset=utf8" \
//!     cargo test -p dots-db -- --ignored
//! ```

// Integration tests use expect/unwrap extensively for clarity -- panicking
// on failure is the correct behavior in test code.
#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::items_after_statements,
    clippy::missing_panics_doc,
    clippy::too_many_lines,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]

use std::sync::Arc;
use std::time::Duration;

use dots_db::{
    Column, ConsumerConfig, ConsumerPhase, DbDotConsumer, DbDotProvider, DbError, DotConsumer,
    DotProvider, FieldValue, KeyRange, PoolConfig, ProviderConfig, ProviderPhase, ProviderPool,
    Slot, StoreConfig,
};
use dots_types::Dot;
use rand::Rng;
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A fresh `SQLite` database file, removed when dropped.
struct TempStore {
    _dir: TempDir,
    source: String,
}

fn temp_store() -> TempStore {
    init_tracing();
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let source = format!("sqlite://{}?mode=rwc", dir.path().join("dots.db").display());
    TempStore { _dir: dir, source }
}

/// Columns of the `dots` table with a primary key on `Id`.
fn keyed_columns() -> Vec<Column> {
    let mut columns = dots_db::sql::dots_columns();
    columns[0] = Column::new("Id", "BIGINT PRIMARY KEY");
    columns
}

async fn provider_with_schema(store: &TempStore, config: ProviderConfig) -> DbDotProvider {
    let mut provider = DbDotProvider::new(config, StoreConfig::default());
    provider
        .init(&store.source)
        .await
        .expect("Failed to init provider");
    provider
        .construct_schema()
        .await
        .expect("Failed to create table");
    provider
}

async fn scan(provider: &mut DbDotProvider, range: KeyRange) -> Vec<Dot> {
    provider.begin(range).await.expect("Failed to begin scan");
    let mut dots = Vec::new();
    while provider.has_more().await.expect("has_more failed") {
        dots.push(provider.produce_dot().await.expect("produce failed"));
    }
    provider.finalize().await.expect("finalize failed");
    dots
}

fn ids(dots: &[Dot]) -> Vec<u64> {
    dots.iter().map(|d| d.id.0).collect()
}

// =============================================================================
// Provider
// =============================================================================

#[tokio::test]
async fn range_scan_yields_rows_in_key_order() {
    let store = temp_store();
    let mut provider = provider_with_schema(&store, ProviderConfig::dots()).await;

    for (id, name) in [(99, "c"), (0, "a"), (50, "b")] {
        let affected = provider
            .create_dot(&Dot::new(id, 0, name, ""))
            .await
            .unwrap();
        assert_eq!(affected, 1);
    }
    provider.create_dot(&Dot::new(100, 0, "d", "")).await.unwrap();

    let dots = scan(&mut provider, KeyRange::new(0, 100)).await;
    assert_eq!(ids(&dots), vec![0, 50, 99]);
    assert_eq!(
        dots.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
        vec!["a", "b", "c"]
    );
    assert!(dots.iter().all(|d| d.parent_id.0 == 0));
    assert_eq!(provider.phase(), ProviderPhase::Ready);

    // A new scan on the same provider starts from the beginning.
    provider.begin(KeyRange::new(0, 100)).await.unwrap();
    assert!(provider.has_more().await.unwrap());
    assert!(provider.has_more().await.unwrap());
    assert_eq!(provider.produce_dot().await.unwrap().id.0, 0);
    provider.finalize().await.unwrap();
}

#[tokio::test]
async fn empty_range_and_exhausted_cursor() {
    let store = temp_store();
    let mut provider = provider_with_schema(&store, ProviderConfig::dots()).await;
    provider.create_dot(&Dot::new(5, 0, "e", "")).await.unwrap();

    provider.begin(KeyRange::new(10, 20)).await.unwrap();
    assert!(!provider.has_more().await.unwrap());
    assert!(matches!(
        provider.produce_dot().await,
        Err(DbError::InvalidState(_))
    ));
    assert!(matches!(
        provider.begin(KeyRange::ALL).await,
        Err(DbError::InvalidState(_))
    ));
    provider.finalize().await.unwrap();
}

#[tokio::test]
async fn produce_checks_arity_without_consuming_the_row() {
    let store = temp_store();
    let mut provider = provider_with_schema(&store, ProviderConfig::dots()).await;
    provider.create_dot(&Dot::new(7, 1, "seven", "v")).await.unwrap();
    provider.begin(KeyRange::ALL).await.unwrap();

    let (mut id, mut parent) = (-1_i64, -1_i64);
    let err = provider
        .produce(&mut [Slot::Int(&mut id), Slot::Int(&mut parent)])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::ArityMismatch { expected: 4, actual: 2 }));
    assert_eq!((id, parent), (-1, -1));

    // A type mismatch in the last column leaves every slot untouched.
    let (mut name, mut bad) = (String::from("unset"), 0_i64);
    let err = provider
        .produce(&mut [
            Slot::Int(&mut id),
            Slot::Int(&mut parent),
            Slot::Text(&mut name),
            Slot::Int(&mut bad),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Scan { column: 3, .. }));
    assert_eq!((id, parent, name.as_str()), (-1, -1, "unset"));

    let dot = provider.produce_dot().await.unwrap();
    assert_eq!(dot, Dot::new(7, 1, "seven", "v"));
    assert!(!provider.has_more().await.unwrap());
    provider.finalize().await.unwrap();
}

#[tokio::test]
async fn nullable_values_read_through_optional_slots() {
    let store = temp_store();
    let mut provider = provider_with_schema(&store, ProviderConfig::dots()).await;
    provider
        .create_row(&[
            FieldValue::Int(3),
            FieldValue::Int(0),
            FieldValue::from("three"),
            FieldValue::Null,
        ])
        .await
        .unwrap();

    provider.begin(KeyRange::single(3_u64.into())).await.unwrap();
    let (mut id, mut parent) = (0_u64, 0_u64);
    let (mut name, mut value) = (String::new(), Some(String::from("stale")));
    provider
        .produce(&mut [
            Slot::UInt(&mut id),
            Slot::UInt(&mut parent),
            Slot::Text(&mut name),
            Slot::OptText(&mut value),
        ])
        .await
        .unwrap();
    provider.finalize().await.unwrap();

    assert_eq!((id, parent, name.as_str()), (3, 0, "three"));
    assert_eq!(value, None);
}

#[tokio::test]
async fn updates_respect_key_bounds() {
    let store = temp_store();
    let mut provider = provider_with_schema(&store, ProviderConfig::dots()).await;
    for id in 0..6 {
        provider
            .create_dot(&Dot::new(id, 0, format!("n{id}"), "old"))
            .await
            .unwrap();
    }

    let affected = provider.update_dot(&Dot::new(2, 0, "renamed", "new")).await.unwrap();
    assert_eq!(affected, 1);

    // Write the value column only, for keys in [4, 6).
    let mut value_only = ProviderConfig::dots();
    value_only.columns = vec![Column::new("Value", "VARCHAR(20000)")];
    value_only.bounds = KeyRange::new(4, 6);
    provider.configure(value_only).unwrap();
    let affected = provider.update_row(&[FieldValue::from("bulk")]).await.unwrap();
    assert_eq!(affected, 2);

    provider.configure(ProviderConfig::dots()).unwrap();
    let dots = scan(&mut provider, KeyRange::ALL).await;
    let values: Vec<_> = dots.iter().map(|d| d.value.as_str()).collect();
    assert_eq!(values, vec!["old", "old", "new", "old", "bulk", "bulk"]);
    assert_eq!(dots[2].name, "renamed");
}

#[tokio::test]
async fn destroy_schema_drops_the_table() {
    let store = temp_store();
    let mut provider = provider_with_schema(&store, ProviderConfig::dots()).await;
    provider.destroy_schema().await.unwrap();

    let err = provider.begin(KeyRange::ALL).await.unwrap_err();
    assert!(matches!(err, DbError::Query(_)));
    assert_eq!(provider.phase(), ProviderPhase::Ready);

    assert!(provider.destroy_schema().await.is_err());
    provider.construct_schema().await.unwrap();
    assert!(scan(&mut provider, KeyRange::ALL).await.is_empty());
}

// =============================================================================
// Provider pool
// =============================================================================

#[tokio::test]
async fn pooled_provider_released_mid_scan_comes_back_ready() {
    let store = temp_store();
    let mut seed = provider_with_schema(&store, ProviderConfig::dots()).await;
    for id in 0..3 {
        seed.create_dot(&Dot::new(id, 0, "x", "")).await.unwrap();
    }

    let pool = ProviderPool::new(PoolConfig::default().with_capacity(1));
    let mut provider = pool.acquire(&store.source).await.unwrap();
    provider.begin(KeyRange::ALL).await.unwrap();
    assert_eq!(provider.produce_dot().await.unwrap().id.0, 0);
    assert_eq!(provider.phase(), ProviderPhase::Scanning);
    pool.release(provider);

    let mut provider = pool.acquire(&store.source).await.unwrap();
    assert_eq!(provider.phase(), ProviderPhase::Ready);
    assert_eq!(ids(&scan(&mut provider, KeyRange::ALL).await), vec![0, 1, 2]);
    assert_eq!(pool.warm_ups(), 1);
}

// =============================================================================
// Consumer
// =============================================================================

#[tokio::test]
async fn commit_inserts_every_submitted_dot() {
    let store = temp_store();
    let mut provider = provider_with_schema(&store, ProviderConfig::dots()).await;
    let consumer = DbDotConsumer::new(provider.store().clone(), ConsumerConfig::dots());

    for id in [99, 0, 50] {
        let ticket = consumer.prepare().unwrap();
        consumer
            .consume(ticket, Dot::new(id, 0, format!("n{id}"), "v"))
            .await
            .unwrap();
    }

    assert_eq!(consumer.commit().await.unwrap(), 3);
    assert_eq!(consumer.phase(), ConsumerPhase::Committed);
    assert!(!consumer.abort());
    assert!(consumer.finalize());

    assert_eq!(ids(&scan(&mut provider, KeyRange::ALL).await), vec![0, 50, 99]);
}

#[tokio::test]
async fn failed_insert_rolls_back_the_whole_commit() {
    let store = temp_store();
    let keyed = ProviderConfig::dots().with_columns(keyed_columns(), "Id");
    let mut provider = provider_with_schema(&store, keyed).await;
    let consumer = Arc::new(DbDotConsumer::new(
        provider.store().clone(),
        ConsumerConfig::dots().with_queue_capacity(4),
    ));

    const K: u64 = 10;
    let tickets: Vec<_> = (0..K).map(|_| consumer.prepare().unwrap()).collect();
    let submitter = tokio::spawn(async move {
        for (i, ticket) in (0..K).zip(tickets) {
            // The (K/2)-th record reuses the first record's key.
            let id = if i == K / 2 { 0 } else { i };
            let _ = ticket.consume(Dot::new(id, 0, "dup", "")).await;
        }
    });

    let err = consumer.commit().await.unwrap_err();
    assert!(matches!(err, DbError::Query(_)), "unexpected error: {err}");
    assert_eq!(consumer.phase(), ConsumerPhase::RolledBack);
    submitter.await.unwrap();

    assert!(scan(&mut provider, KeyRange::ALL).await.is_empty());
}

#[tokio::test]
async fn abort_during_drain_rolls_back() {
    let store = temp_store();
    let mut provider = provider_with_schema(&store, ProviderConfig::dots()).await;
    let consumer = Arc::new(DbDotConsumer::new(
        provider.store().clone(),
        ConsumerConfig::dots(),
    ));

    let straggler = consumer.prepare().unwrap();
    for id in 0..5 {
        let ticket = consumer.prepare().unwrap();
        consumer.consume(ticket, Dot::new(id, 0, "a", "")).await.unwrap();
    }

    let committer = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.commit().await })
    };
    // The straggler keeps the queue open, so the drain cannot finish.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(consumer.phase(), ConsumerPhase::Committing);
    assert_eq!(consumer.pending(), 1);

    assert!(consumer.abort());
    assert!(matches!(committer.await.unwrap(), Err(DbError::Aborted)));
    assert_eq!(consumer.phase(), ConsumerPhase::Aborted);

    assert!(straggler.consume(Dot::new(9, 0, "late", "")).await.is_err());
    assert!(scan(&mut provider, KeyRange::ALL).await.is_empty());
}

#[tokio::test]
async fn commit_timeout_aborts_a_stalled_drain() {
    let store = temp_store();
    let mut provider = provider_with_schema(&store, ProviderConfig::dots()).await;
    let consumer = DbDotConsumer::new(provider.store().clone(), ConsumerConfig::dots());

    let _stalled = consumer.prepare().unwrap();
    let ticket = consumer.prepare().unwrap();
    consumer.consume(ticket, Dot::new(1, 0, "a", "")).await.unwrap();

    let err = consumer
        .commit_timeout(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Aborted));
    assert_eq!(consumer.phase(), ConsumerPhase::Aborted);
    assert!(scan(&mut provider, KeyRange::ALL).await.is_empty());
}

#[tokio::test]
async fn rejected_pre_commit_rolls_back() {
    let store = temp_store();
    let mut provider = provider_with_schema(&store, ProviderConfig::dots()).await;
    let consumer = DbDotConsumer::new(provider.store().clone(), ConsumerConfig::dots())
        .with_pre_commit(Arc::new(|| Ok::<_, DbError>(false)));

    let ticket = consumer.prepare().unwrap();
    consumer.consume(ticket, Dot::new(1, 0, "a", "")).await.unwrap();

    assert!(matches!(consumer.commit().await, Err(DbError::Rejected)));
    assert_eq!(consumer.phase(), ConsumerPhase::RolledBack);
    assert!(scan(&mut provider, KeyRange::ALL).await.is_empty());
}

#[tokio::test]
async fn commit_waits_for_every_outstanding_submission() {
    let store = temp_store();
    let mut provider = provider_with_schema(&store, ProviderConfig::dots()).await;
    let consumer = Arc::new(DbDotConsumer::new(
        provider.store().clone(),
        ConsumerConfig::dots().with_queue_capacity(3),
    ));

    const SUBMITTERS: u64 = 40;
    let mut rng = rand::rng();
    let mut expected = Vec::new();
    let mut handles = Vec::new();
    for id in 0..SUBMITTERS {
        let ticket = consumer.prepare().unwrap();
        let delay = Duration::from_millis(rng.random_range(0..30));
        // Every fifth submitter gives up without enqueuing anything.
        let gives_up = id % 5 == 0;
        if !gives_up {
            expected.push(id);
        }
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if gives_up {
                drop(ticket);
                Ok(())
            } else {
                ticket.consume(Dot::new(id, 0, "c", "")).await
            }
        }));
    }

    let committed = consumer.commit().await.unwrap();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(committed, expected.len());
    assert_eq!(consumer.pending(), 0);
    assert_eq!(ids(&scan(&mut provider, KeyRange::ALL).await), expected);
}

#[tokio::test]
async fn consumer_with_wrong_column_count_fails_commit() {
    let store = temp_store();
    let provider = provider_with_schema(&store, ProviderConfig::dots()).await;
    let mut config = ConsumerConfig::dots();
    config.columns.truncate(2);
    let consumer = DbDotConsumer::new(provider.store().clone(), config);

    let ticket = consumer.prepare().unwrap();
    consumer.consume(ticket, Dot::new(1, 0, "a", "")).await.unwrap();
    let err = consumer.commit().await.unwrap_err();
    assert!(matches!(err, DbError::ArityMismatch { expected: 4, actual: 2 }));
}

// =============================================================================
// MySQL
// =============================================================================

#[tokio::test]
#[ignore = "requires live MySQL instance (set DOTS_TEST_MYSQL)"]
async fn mysql_scenario() {
    init_tracing();
    let source = std::env::var("DOTS_TEST_MYSQL")
        .unwrap_or_else(|_| "root:@/dots_test?charset=utf8".to_owned());
    let config = ProviderConfig::dots().with_table("dots_it");

    let mut provider = DbDotProvider::new(config.clone(), StoreConfig::default());
    provider.init(&source).await.expect("Failed to init provider");
    let _ = provider.destroy_schema().await;
    provider.construct_schema().await.expect("Failed to create table");

    let consumer = DbDotConsumer::new(
        provider.store().clone(),
        ConsumerConfig::dots().with_table("dots_it"),
    );
    for (id, name) in [(0, "a"), (50, "b"), (99, "c")] {
        let ticket = consumer.prepare().unwrap();
        consumer.consume(ticket, Dot::new(id, 0, name, "")).await.unwrap();
    }
    assert_eq!(consumer.commit().await.unwrap(), 3);

    let pool = ProviderPool::new(PoolConfig::default().with_provider(config));
    let mut pooled = pool.acquire(&source).await.unwrap();
    pooled.begin(KeyRange::new(0, 100)).await.unwrap();
    let mut seen = Vec::new();
    while pooled.has_more().await.unwrap() {
        seen.push(pooled.produce_dot().await.unwrap().id.0);
    }
    pooled.finalize().await.unwrap();
    assert_eq!(seen, vec![0, 50, 99]);

    provider.destroy_schema().await.expect("Failed to drop table");
}
