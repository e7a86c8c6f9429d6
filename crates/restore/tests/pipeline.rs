//! End-to-end scheduling tests: a dump directory on disk, the real worker
//! pools and dispatcher, and a fake client recording statement order.

use std::{
    path::Path,
    sync::Arc,
};

use restore::{
    coordinator::run_restore,
    errors::{
        ClientError,
        ER_NO_SUCH_TABLE,
    },
    testing::FakeFactory,
    RestoreOptions,
    RestoreSummary,
};
use tempfile::TempDir;

fn write_dump(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, contents) in files {
        std::fs::write(dir.path().join(name), contents).unwrap();
    }
    dir
}

fn test_options(directory: &Path, threads: usize) -> RestoreOptions {
    let mut options = RestoreOptions::new(directory.to_path_buf());
    options.threads = threads;
    options.max_threads_per_table = threads;
    options.max_threads_for_schema_creation = 2;
    options.max_threads_for_index_creation = 2;
    // Most tests want to observe the CREATE path, not the purge path.
    options.overwrite_tables = false;
    options
}

async fn run(options: RestoreOptions, factory: &FakeFactory) -> RestoreSummary {
    run_restore(options, Arc::new(factory.clone()))
        .await
        .expect("restore run failed")
}

#[tokio::test]
async fn test_schema_before_data_barrier() {
    let dump = write_dump(&[
        ("shop-schema-create.sql", "CREATE DATABASE `shop`;\n"),
        ("shop.t-schema.sql", "CREATE TABLE t (id int);\n"),
        ("shop.t.00000.sql", "INSERT INTO t VALUES (1),(2);\n"),
    ]);
    let factory = FakeFactory::new();
    let summary = run(test_options(dump.path(), 8), &factory).await;

    assert!(summary.success());
    assert_eq!(summary.tables, 1);
    assert_eq!(summary.tables_all_done, 1);
    assert_eq!(summary.rows_affected, 2);

    let create = factory.first_index("CREATE TABLE t").unwrap();
    let insert = factory.first_index("INSERT INTO t").unwrap();
    assert!(
        create < insert,
        "INSERT must never run before CREATE TABLE is committed",
    );
    let create_db = factory.first_index("CREATE DATABASE").unwrap();
    assert!(create_db < create);
}

#[tokio::test]
async fn test_empty_dump_terminates_cleanly() {
    let dump = write_dump(&[]);
    let factory = FakeFactory::new();
    let summary = run(test_options(dump.path(), 4), &factory).await;
    assert!(summary.success());
    assert_eq!(summary.tables, 0);
    assert_eq!(summary.jobs_dispatched, 0);
    assert!(factory.statements().is_empty());
}

#[tokio::test]
async fn test_views_only_dump_never_dispatches_data() {
    let dump = write_dump(&[
        ("shop-schema-create.sql", "CREATE DATABASE `shop`;\n"),
        (
            "shop.totals-schema-view.sql",
            "CREATE VIEW totals AS SELECT 1;\n",
        ),
    ]);
    let factory = FakeFactory::new();
    let summary = run(test_options(dump.path(), 4), &factory).await;
    assert!(summary.success());
    assert_eq!(summary.jobs_dispatched, 0);
    assert_eq!(summary.tables_all_done, 1);
    assert!(factory.first_index("CREATE VIEW").is_some());
}

#[tokio::test]
async fn test_single_worker_preserves_job_order() {
    let dump = write_dump(&[
        ("shop-schema-create.sql", "CREATE DATABASE `shop`;\n"),
        ("shop.t-schema.sql", "CREATE TABLE t (id int);\n"),
        ("shop.t.00000.sql", "INSERT INTO t VALUES (0);\n"),
        ("shop.t.00001.sql", "INSERT INTO t VALUES (1);\n"),
        ("shop.t.00002.sql", "INSERT INTO t VALUES (2);\n"),
    ]);
    let factory = FakeFactory::new();
    let summary = run(test_options(dump.path(), 1), &factory).await;
    assert!(summary.success());
    assert_eq!(summary.jobs_dispatched, 3);

    let order: Vec<usize> = ["VALUES (0)", "VALUES (1)", "VALUES (2)"]
        .iter()
        .map(|needle| factory.first_index(needle).unwrap())
        .collect();
    assert!(order[0] < order[1] && order[1] < order[2], "strict FIFO");
}

#[tokio::test]
async fn test_many_tables_ready_queue_hit_rate() {
    let mut files: Vec<(String, String)> = vec![(
        "shop-schema-create.sql".to_owned(),
        "CREATE DATABASE `shop`;\n".to_owned(),
    )];
    for t in 0..30 {
        files.push((
            format!("shop.t{t}-schema.sql"),
            format!("CREATE TABLE t{t} (id int);\n"),
        ));
        for part in 0..4 {
            files.push((
                format!("shop.t{t}.0000{part}.sql"),
                format!("INSERT INTO t{t} VALUES ({part});\n"),
            ));
        }
    }
    let dump = tempfile::tempdir().unwrap();
    for (name, contents) in &files {
        std::fs::write(dump.path().join(name), contents).unwrap();
    }

    let factory = FakeFactory::new();
    let summary = run(test_options(dump.path(), 8), &factory).await;
    assert!(summary.success());
    assert_eq!(summary.jobs_dispatched, 120);
    assert_eq!(summary.tables_all_done, 30);
    assert!(
        summary.ready_queue_hit_rate > 0.5,
        "steady-state dispatch should be served by the ready queue, got {}",
        summary.ready_queue_hit_rate,
    );
}

#[tokio::test]
async fn test_visibility_failure_retries_and_reconnects() {
    let dump = write_dump(&[
        ("shop-schema-create.sql", "CREATE DATABASE `shop`;\n"),
        ("shop.t-schema.sql", "CREATE TABLE t (id int);\n"),
        ("shop.t.00000.sql", "INSERT INTO t VALUES (1),(2),(3);\n"),
    ]);
    let factory = FakeFactory::new();
    // First three attempts see the table as missing; the third retry forces
    // a connection reset, after which the insert goes through.
    factory.fail_matching(
        "INSERT INTO t",
        3,
        ClientError::server(ER_NO_SUCH_TABLE, "Table 'shop.t' doesn't exist"),
    );
    let summary = run(test_options(dump.path(), 2), &factory).await;
    assert!(summary.success(), "retry must recover, not fail the run");
    assert_eq!(summary.rows_affected, 3);
    assert!(
        factory.resets() >= 1,
        "every third visibility retry resets the connection",
    );
}

#[tokio::test]
async fn test_no_data_phase_terminates_with_index_sentinels() {
    let dump = write_dump(&[
        ("shop-schema-create.sql", "CREATE DATABASE `shop`;\n"),
        ("shop.t-schema.sql", "CREATE TABLE t (id int);\n"),
        ("shop.t.00000.sql", "INSERT INTO t VALUES (1);\n"),
    ]);
    let factory = FakeFactory::new();
    let mut options = test_options(dump.path(), 4);
    options.no_data = true;
    // Completing at all proves the index workers received their shutdown
    // sentinels despite the skipped data phase.
    let summary = run(options, &factory).await;
    assert!(summary.success());
    assert_eq!(summary.data_jobs_completed, 0);
    assert_eq!(summary.jobs_dispatched, 0);
    assert!(factory.first_index("CREATE TABLE t").is_some());
    assert!(factory.first_index("INSERT").is_none());
}

#[tokio::test]
async fn test_two_phase_load_matches_single_phase() {
    let files: &[(&str, &str)] = &[
        ("shop-schema-create.sql", "CREATE DATABASE `shop`;\n"),
        ("shop.t-schema.sql", "CREATE TABLE t (id int);\n"),
        ("shop.t.00000.sql", "INSERT INTO t VALUES (1),(2);\n"),
        ("shop.t.00001.sql", "INSERT INTO t VALUES (3);\n"),
    ];
    let dump = write_dump(files);

    // Single phase.
    let single = FakeFactory::new();
    let single_summary = run(test_options(dump.path(), 4), &single).await;

    // Phase one: schemas only.
    let phased = FakeFactory::new();
    let mut phase1 = test_options(dump.path(), 4);
    phase1.no_data = true;
    let phase1_summary = run(phase1, &phased).await;
    assert!(phase1_summary.success());

    // Phase two: data only.
    let mut phase2 = test_options(dump.path(), 4);
    phase2.no_schemas = true;
    let phase2_summary = run(phase2, &phased).await;
    assert!(phase2_summary.success());

    assert_eq!(phase2_summary.rows_affected, single_summary.rows_affected);
    assert_eq!(
        phase2_summary.data_jobs_completed,
        single_summary.data_jobs_completed,
    );
    // Phase two ran no DDL.
    assert_eq!(phased.count_matching("CREATE TABLE"), 1);
}

#[tokio::test]
async fn test_tables_without_database_create_file() {
    // No `-schema-create` file: the database is marked created when schema
    // producers finish, and its buffered table jobs drain then.
    let dump = write_dump(&[
        ("shop.t-schema.sql", "CREATE TABLE t (id int);\n"),
        ("shop.t.00000.sql", "INSERT INTO t VALUES (7);\n"),
    ]);
    let factory = FakeFactory::new();
    let summary = run(test_options(dump.path(), 4), &factory).await;
    assert!(summary.success());
    assert_eq!(summary.rows_affected, 1);
    assert!(factory.first_index("CREATE DATABASE").is_none());
    assert!(factory.first_index("CREATE TABLE t").is_some());
}

#[tokio::test]
async fn test_data_without_schema_is_discarded() {
    let dump = write_dump(&[
        ("shop-schema-create.sql", "CREATE DATABASE `shop`;\n"),
        ("shop.orphan.00000.sql", "INSERT INTO orphan VALUES (1);\n"),
    ]);
    let factory = FakeFactory::new();
    let summary = run(test_options(dump.path(), 4), &factory).await;
    // The run terminates (nothing hangs on the orphan) and the orphan is
    // reported failed.
    assert_eq!(summary.tables_failed, 1);
    assert_eq!(summary.rows_affected, 0);
    assert!(factory.first_index("INSERT INTO orphan").is_none());
}

#[tokio::test]
async fn test_truncate_purge_keeps_existing_schema() {
    let dump = write_dump(&[
        ("shop-schema-create.sql", "CREATE DATABASE `shop`;\n"),
        ("shop.t-schema.sql", "CREATE TABLE t (id int);\n"),
        ("shop.t.00000.sql", "INSERT INTO t VALUES (1);\n"),
    ]);
    let factory = FakeFactory::new();
    let mut options = test_options(dump.path(), 4);
    options.overwrite_tables = true; // purge_mode defaults to Truncate
    let summary = run(options, &factory).await;
    assert!(summary.success());
    assert_eq!(summary.rows_affected, 1);
    assert!(factory.first_index("TRUNCATE TABLE `t`").is_some());
    assert!(
        factory.first_index("CREATE TABLE t").is_none(),
        "a successful TRUNCATE keeps the existing schema",
    );
}

#[tokio::test]
async fn test_truncate_of_missing_table_falls_through_to_create() {
    let dump = write_dump(&[
        ("shop-schema-create.sql", "CREATE DATABASE `shop`;\n"),
        ("shop.t-schema.sql", "CREATE TABLE t (id int);\n"),
        ("shop.t.00000.sql", "INSERT INTO t VALUES (1);\n"),
    ]);
    let factory = FakeFactory::new();
    factory.fail_matching(
        "TRUNCATE TABLE `t`",
        1,
        ClientError::server(ER_NO_SUCH_TABLE, "Table 'shop.t' doesn't exist"),
    );
    let mut options = test_options(dump.path(), 4);
    options.overwrite_tables = true;
    let summary = run(options, &factory).await;
    assert!(summary.success());
    assert_eq!(summary.rows_affected, 1);
    assert!(
        factory.first_index("CREATE TABLE t").is_some(),
        "missing table on TRUNCATE is benign and proceeds to CREATE",
    );
}

#[tokio::test]
async fn test_ignored_error_codes_count_as_success() {
    let dump = write_dump(&[
        ("shop-schema-create.sql", "CREATE DATABASE `shop`;\n"),
        ("shop.t-schema.sql", "CREATE TABLE t (id int);\n"),
        ("shop.t.00000.sql", "INSERT INTO t VALUES (1);\n"),
    ]);
    let factory = FakeFactory::new();
    // Duplicate-entry errors are in the operator's ignore set.
    factory.fail_matching(
        "INSERT INTO t",
        1,
        ClientError::server(1062, "Duplicate entry '1' for key 'PRIMARY'"),
    );
    let mut options = test_options(dump.path(), 4);
    options.ignore_errors.insert(1062);
    let summary = run(options, &factory).await;
    assert!(summary.success());
    assert_eq!(summary.fatal_errors, 0);
}

#[tokio::test]
async fn test_schema_failure_is_terminal_but_restore_continues() {
    let dump = write_dump(&[
        ("shop-schema-create.sql", "CREATE DATABASE `shop`;\n"),
        ("shop.bad-schema.sql", "CREATE TABLE bad (syntax error;\n"),
        ("shop.good-schema.sql", "CREATE TABLE good (id int);\n"),
        ("shop.good.00000.sql", "INSERT INTO good VALUES (1);\n"),
    ]);
    let factory = FakeFactory::new();
    factory.fail_matching(
        "CREATE TABLE bad",
        100,
        ClientError::server(1064, "You have an error in your SQL syntax"),
    );
    let summary = run(test_options(dump.path(), 4), &factory).await;
    assert!(!summary.success(), "a non-ignored fatal fails the run");
    assert_eq!(summary.tables_failed, 1);
    assert!(summary.first_error.is_some());
    // The healthy table still restored fully.
    assert_eq!(summary.rows_affected, 1);
    assert!(factory.first_index("INSERT INTO good").is_some());
}

#[tokio::test]
async fn test_optimize_keys_defers_secondary_indexes_until_after_data() {
    let dump = write_dump(&[
        ("shop-schema-create.sql", "CREATE DATABASE `shop`;\n"),
        (
            "shop.t-schema.sql",
            "CREATE TABLE `t` (\n  `id` int NOT NULL,\n  `c` int DEFAULT NULL,\n  PRIMARY KEY \
             (`id`),\n  KEY `idx_c` (`c`)\n) ENGINE=InnoDB;\n",
        ),
        ("shop.t.00000.sql", "INSERT INTO t VALUES (1,2);\n"),
    ]);
    let factory = FakeFactory::new();
    let mut options = test_options(dump.path(), 4);
    options.optimize_keys = true;
    let summary = run(options, &factory).await;
    assert!(summary.success());
    assert_eq!(summary.tables_all_done, 1);

    let create = factory.first_index("CREATE TABLE `t`").unwrap();
    let insert = factory.first_index("INSERT INTO t").unwrap();
    let alter = factory.first_index("ADD KEY `idx_c`").unwrap();
    assert!(create < insert);
    assert!(
        insert < alter,
        "deferred keys are built only after the data is loaded",
    );
    // The executed CREATE TABLE does not carry the secondary key.
    let statements = factory.statements();
    assert!(!statements[create].contains("idx_c"));
}

#[tokio::test]
async fn test_post_data_statements_run_after_data() {
    let dump = write_dump(&[
        ("shop-schema-create.sql", "CREATE DATABASE `shop`;\n"),
        ("shop.t-schema.sql", "CREATE TABLE t (id int);\n"),
        ("shop.t.00000.sql", "INSERT INTO t VALUES (1);\n"),
        (
            "shop.t-schema-post.sql",
            "ALTER TABLE t ADD CONSTRAINT c CHECK (id > 0);\n",
        ),
    ]);
    let factory = FakeFactory::new();
    let summary = run(test_options(dump.path(), 4), &factory).await;
    assert!(summary.success());
    let insert = factory.first_index("INSERT INTO t").unwrap();
    let post = factory.first_index("ADD CONSTRAINT c").unwrap();
    assert!(insert < post, "post-data statements run after the loads");
}

#[tokio::test]
async fn test_database_remapping() {
    let dump = write_dump(&[
        ("prod-schema-create.sql", "CREATE DATABASE `prod`;\n"),
        ("prod.t-schema.sql", "CREATE TABLE t (id int);\n"),
        ("prod.t.00000.sql", "INSERT INTO t VALUES (1);\n"),
    ]);
    let factory = FakeFactory::new();
    let mut options = test_options(dump.path(), 4);
    options.source_db = Some("prod".to_owned());
    options.target_db = Some("staging".to_owned());
    let summary = run(options, &factory).await;
    assert!(summary.success());
    assert!(factory
        .first_index("CREATE DATABASE IF NOT EXISTS `staging`")
        .is_some());
    assert!(factory.first_index("USE `staging`").is_some());
    assert!(factory.first_index("USE `prod`").is_none());
}
