//! Per-database schema buffering: table jobs submitted before their database
//! exists are buffered on the descriptor and drained into the schema queue
//! exactly once, atomically with the `Created` transition.

use restore::{
    jobs::{
        Compression,
        SchemaJob,
        SchemaMessage,
    },
    registry::{
        DbSchemaState,
        Registry,
    },
    schema::SchemaPipeline,
};

fn table_job(registry: &Registry, database: &str, table_name: &str) -> SchemaJob {
    let db = registry.database(database);
    let table = registry.table(&db, table_name, table_name, 4);
    SchemaJob::CreateTable {
        table,
        path: format!("{database}.{table_name}-schema.sql").into(),
        compression: Compression::None,
        attempts: 0,
    }
}

fn drain_jobs(pipeline: &SchemaPipeline) -> usize {
    let rx = pipeline.receiver();
    let mut count = 0;
    while let Some(message) = rx.try_recv() {
        match message {
            SchemaMessage::Job(_) => count += 1,
            SchemaMessage::Shutdown => {},
        }
    }
    count
}

#[tokio::test]
async fn test_jobs_buffer_until_database_created() {
    let registry = Registry::new();
    let pipeline = SchemaPipeline::new();
    let db = registry.database("d");

    for t in 0..3 {
        pipeline.submit(table_job(&registry, "d", &format!("t{t}")));
    }
    assert_eq!(
        drain_jobs(&pipeline),
        0,
        "nothing reaches the queue before CREATE DATABASE",
    );
    assert_eq!(db.state().pending_schema_jobs.len(), 3);

    pipeline.mark_created_and_drain(&db);
    assert_eq!(db.state().schema_state, DbSchemaState::Created);
    assert_eq!(db.state().pending_schema_jobs.len(), 0);
    assert_eq!(drain_jobs(&pipeline), 3, "all three drained");

    // Exactly once: a second drain releases nothing.
    pipeline.mark_created_and_drain(&db);
    assert_eq!(drain_jobs(&pipeline), 0);
}

#[tokio::test]
async fn test_jobs_bypass_buffer_once_created() {
    let registry = Registry::new();
    let pipeline = SchemaPipeline::new();
    let db = registry.database("d");
    pipeline.mark_created_and_drain(&db);

    pipeline.submit(table_job(&registry, "d", "t"));
    assert_eq!(db.state().pending_schema_jobs.len(), 0);
    assert_eq!(drain_jobs(&pipeline), 1, "straight to the schema queue");
}

#[tokio::test]
async fn test_end_phase_drains_databases_without_create_jobs() {
    let registry = Registry::new();
    let pipeline = SchemaPipeline::new();
    let db = registry.database("d");
    pipeline.submit(table_job(&registry, "d", "t"));
    assert_eq!(db.state().pending_schema_jobs.len(), 1);

    pipeline.end_phase(&registry);
    assert_eq!(db.state().schema_state, DbSchemaState::Created);
    assert_eq!(drain_jobs(&pipeline), 1);
}

#[tokio::test]
async fn test_created_event_broadcast_on_drain() {
    let registry = Registry::new();
    let pipeline = SchemaPipeline::new();
    let db = registry.database("d");

    // Two concurrent waiters; a broadcast must wake both.
    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let db = db.clone();
            tokio::spawn(async move {
                loop {
                    let listener = {
                        if db.state().schema_state == DbSchemaState::Created {
                            return;
                        }
                        db.listen_created()
                    };
                    listener.await;
                }
            })
        })
        .collect();
    tokio::task::yield_now().await;
    pipeline.mark_created_and_drain(&db);
    for waiter in waiters {
        waiter.await.unwrap();
    }
}
