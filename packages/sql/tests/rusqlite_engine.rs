#![cfg(feature = "sqlite-rusqlite")]

use std::ops::ControlFlow;
use std::sync::Arc;

use jobrunr_sql::dialect::AnsiDialect;
use jobrunr_sql::rusqlite::{DEFAULT_BUSY_TIMEOUT, RusqliteConnectionSource};
use jobrunr_sql::{BatchRowResult, BindFields, DatabaseValue, SqlEngine, SqlError};
use pretty_assertions::assert_eq;
use uuid::Uuid;

const SCHEMA: &str = "
    create table myapp_jobrunr_jobs (
        id char(36) primary key,
        version int not null,
        state varchar(36) not null,
        updatedAt timestamp not null
    );
    create table myapp_jobrunr_metadata (
        id varchar(156) primary key,
        value text not null
    );
    insert into myapp_jobrunr_metadata values ('succeeded-jobs-counter-cluster', '0');
";

#[derive(Debug, Clone, PartialEq)]
struct JobRow {
    id: Uuid,
    version: i64,
    state: &'static str,
}

impl BindFields for JobRow {
    fn bind_field(&self, name: &str) -> Option<DatabaseValue> {
        Some(match name {
            "id" => self.id.into(),
            "version" => self.version.into(),
            "state" => self.state.into(),
            "updatedAt" => chrono::Utc::now().into(),
            _ => return None,
        })
    }
}

fn setup(pool_size: usize) -> (tempfile::TempDir, SqlEngine) {
    let dir = tempfile::tempdir().unwrap();
    let source =
        RusqliteConnectionSource::open(dir.path().join("jobrunr.db"), pool_size, DEFAULT_BUSY_TIMEOUT)
            .unwrap();
    let engine = SqlEngine::new(Arc::new(source), Arc::new(AnsiDialect), Some("myapp_"));
    engine.execute_script(SCHEMA).unwrap();
    (dir, engine)
}

fn job(version: i64) -> JobRow {
    JobRow {
        id: Uuid::new_v4(),
        version,
        state: "ENQUEUED",
    }
}

const INSERT: &str = "into jobrunr_jobs values (:id, :version, :state, :updatedAt)";

fn state_and_version(engine: &SqlEngine, id: Uuid) -> (String, i64) {
    engine
        .sql::<()>("jobrunr_jobs")
        .with("id", id)
        .select_first("state, version from jobrunr_jobs where id = :id", |row| {
            Ok((row.as_string("state")?, row.as_long("version")?))
        })
        .unwrap()
        .unwrap()
}

#[test_log::test]
fn stale_version_update_is_a_conflict_and_current_version_succeeds() {
    let (_dir, engine) = setup(2);
    let row = job(4);
    engine.sql::<JobRow>("jobrunr_jobs").insert(&row, INSERT).unwrap();

    let update = "jobrunr_jobs set state = :state, version = version + 1 \
                  where id = :id and version = :expectedVersion";

    let stale = engine
        .sql::<()>("jobrunr_jobs")
        .with("state", "FAILED")
        .with("id", row.id)
        .with("expectedVersion", 3)
        .update_without_entity(update)
        .unwrap_err();
    assert!(stale.is_concurrent_modification());
    assert_eq!(state_and_version(&engine, row.id), ("ENQUEUED".to_string(), 4));

    engine
        .sql::<()>("jobrunr_jobs")
        .with("state", "FAILED")
        .with("id", row.id)
        .with("expectedVersion", 4)
        .update_without_entity(update)
        .unwrap();
    assert_eq!(state_and_version(&engine, row.id), ("FAILED".to_string(), 5));
}

#[test_log::test]
fn duplicate_insert_is_a_conflict_carrying_the_entity() {
    let (_dir, engine) = setup(2);
    let row = job(1);
    engine.sql::<JobRow>("jobrunr_jobs").insert(&row, INSERT).unwrap();

    let err = engine
        .sql::<JobRow>("jobrunr_jobs")
        .insert(&row, INSERT)
        .unwrap_err();

    match err {
        SqlError::ConcurrentModification(conflict) => {
            assert_eq!(conflict.entities, vec![row]);
            assert_eq!(conflict.results, vec![BatchRowResult::Affected(0)]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test_log::test]
fn batch_update_with_stale_row_reports_every_result() {
    let (_dir, engine) = setup(2);
    let rows = vec![job(1), job(1), job(1)];
    engine
        .sql::<JobRow>("jobrunr_jobs")
        .insert_all(&rows, INSERT)
        .unwrap();

    let mut next = rows.iter().map(|x| JobRow { version: 2, ..x.clone() }).collect::<Vec<_>>();
    next[1].version = 7;

    let err = engine
        .sql::<JobRow>("jobrunr_jobs")
        .update_all(
            &next,
            "jobrunr_jobs set version = :version where id = :id and version = :previousVersion",
        )
        .unwrap_err();

    match err {
        SqlError::ConcurrentModification(conflict) => {
            assert_eq!(conflict.entities, next);
            assert_eq!(
                conflict.results,
                vec![
                    BatchRowResult::Affected(1),
                    BatchRowResult::Affected(0),
                    BatchRowResult::Affected(1),
                ]
            );
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test_log::test]
fn failed_batch_insert_leaves_no_rows_behind() {
    let (_dir, engine) = setup(2);
    let existing = job(1);
    engine.sql::<JobRow>("jobrunr_jobs").insert(&existing, INSERT).unwrap();

    let err = engine
        .sql::<JobRow>("jobrunr_jobs")
        .insert_all(&[job(1), existing.clone()], INSERT)
        .unwrap_err();

    assert!(matches!(err, SqlError::Database(_)));
    assert_eq!(
        engine
            .sql::<()>("jobrunr_jobs")
            .select_count("from jobrunr_jobs")
            .unwrap(),
        1
    );
}

#[test_log::test]
fn concurrent_counter_increments_lose_no_updates() {
    let (_dir, engine) = setup(4);
    let amounts = (1..=24_i64).collect::<Vec<_>>();

    std::thread::scope(|scope| {
        for amount in &amounts {
            let engine = &engine;
            scope.spawn(move || {
                engine
                    .sql::<()>("jobrunr_metadata")
                    .with("id", "succeeded-jobs-counter-cluster")
                    .with("amount", *amount)
                    .update_without_entity(
                        "jobrunr_metadata set value = cast((cast(cast(value as char(10)) as decimal) + :amount) as char(10)) where id = :id",
                    )
                    .unwrap();
            });
        }
    });

    let value = engine
        .sql::<()>("jobrunr_metadata")
        .with("id", "succeeded-jobs-counter-cluster")
        .select_first("value from jobrunr_metadata where id = :id", |row| {
            row.as_long("value")
        })
        .unwrap();

    assert_eq!(value, Some(amounts.iter().sum::<i64>()));
}

#[test_log::test]
fn early_termination_releases_the_connection() {
    let (_dir, engine) = setup(1);
    engine
        .sql::<JobRow>("jobrunr_jobs")
        .insert_all(&[job(1), job(1), job(1)], INSERT)
        .unwrap();

    let mut seen = 0;
    engine
        .sql::<()>("jobrunr_jobs")
        .select_each("id from jobrunr_jobs", |_| {
            seen += 1;
            Ok(ControlFlow::Break(()))
        })
        .unwrap();

    assert_eq!(seen, 1);
    assert_eq!(
        engine
            .sql::<()>("jobrunr_jobs")
            .with("id", Uuid::new_v4())
            .delete("from jobrunr_jobs where id = :id")
            .unwrap(),
        0
    );
}
