//! Dump-directory scanner: classifies the files of a multi-file logical dump
//! into schema and data records.
//!
//! Filename grammar (each name optionally suffixed `.gz` or `.zst`):
//!
//! - `metadata`: dump metadata, informational only
//! - `<db>-schema-create.sql`: CREATE DATABASE
//! - `<db>.<table>-schema.sql`: CREATE TABLE
//! - `<db>.<table>-schema-view.sql`: CREATE VIEW
//! - `<db>.<table>-schema-sequence.sql`: CREATE SEQUENCE
//! - `<db>.<table>-schema-post.sql`: post-data statements for the table
//! - `<db>.<table>.<part>.sql` / `<db>.<table>.sql`: INSERT batches
//!
//! Database names containing `.` are not representable in this layout and
//! are rejected by the dump producer, not here.

use std::path::{
    Path,
    PathBuf,
};

use anyhow::Context;

use crate::jobs::Compression;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Metadata,
    CreateDatabase,
    CreateTable,
    CreateView,
    CreateSequence,
    SchemaPost,
    Data,
}

impl FileKind {
    pub fn is_schema(&self) -> bool {
        matches!(
            self,
            FileKind::CreateDatabase
                | FileKind::CreateTable
                | FileKind::CreateView
                | FileKind::CreateSequence
        )
    }
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub kind: FileKind,
    pub database: String,
    pub table: Option<String>,
    pub part: Option<u32>,
    pub path: PathBuf,
    pub compression: Compression,
}

/// Scan a dump directory. Records come back grouped for the producer:
/// database creates, then table schemas, then post files, then data files in
/// `(database, table, part)` order.
pub fn scan_dump_dir(directory: &Path) -> anyhow::Result<Vec<FileRecord>> {
    let mut records = Vec::new();
    let entries = std::fs::read_dir(directory)
        .with_context(|| format!("cannot read dump directory {}", directory.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            tracing::warn!(path = %entry.path().display(), "skipping non-UTF-8 file name");
            continue;
        };
        match classify_file_name(name) {
            Some((kind, database, table, part, compression)) => records.push(FileRecord {
                kind,
                database,
                table,
                part,
                path: entry.path(),
                compression,
            }),
            None => {
                tracing::debug!(name, "skipping unrecognized file");
            },
        }
    }
    records.sort_by(|a, b| {
        phase_rank(a.kind)
            .cmp(&phase_rank(b.kind))
            .then_with(|| a.database.cmp(&b.database))
            .then_with(|| a.table.cmp(&b.table))
            .then_with(|| a.part.cmp(&b.part))
    });
    Ok(records)
}

fn phase_rank(kind: FileKind) -> u8 {
    match kind {
        FileKind::Metadata => 0,
        FileKind::CreateDatabase => 1,
        FileKind::CreateTable | FileKind::CreateView | FileKind::CreateSequence => 2,
        FileKind::SchemaPost => 3,
        FileKind::Data => 4,
    }
}

fn classify_file_name(
    name: &str,
) -> Option<(FileKind, String, Option<String>, Option<u32>, Compression)> {
    let (compression, stem) = Compression::split_suffix(name);
    if stem == "metadata" {
        return Some((
            FileKind::Metadata,
            String::new(),
            None,
            None,
            Compression::None,
        ));
    }
    let stem = stem.strip_suffix(".sql")?;

    if let Some(database) = stem.strip_suffix("-schema-create") {
        if database.is_empty() {
            return None;
        }
        return Some((
            FileKind::CreateDatabase,
            database.to_owned(),
            None,
            None,
            compression,
        ));
    }

    for (suffix, kind) in [
        ("-schema-view", FileKind::CreateView),
        ("-schema-sequence", FileKind::CreateSequence),
        ("-schema-post", FileKind::SchemaPost),
        ("-schema", FileKind::CreateTable),
    ] {
        if let Some(qualified) = stem.strip_suffix(suffix) {
            let (database, table) = qualified.split_once('.')?;
            if database.is_empty() || table.is_empty() {
                return None;
            }
            return Some((
                kind,
                database.to_owned(),
                Some(table.to_owned()),
                None,
                compression,
            ));
        }
    }

    // Data file: `<db>.<table>.<part>` or `<db>.<table>`.
    let (database, rest) = stem.split_once('.')?;
    if database.is_empty() || rest.is_empty() {
        return None;
    }
    let (table, part) = match rest.rsplit_once('.') {
        Some((table, part_str)) => match part_str.parse::<u32>() {
            Ok(part) => (table, Some(part)),
            // A trailing non-numeric component is part of the table name.
            Err(_) => (rest, None),
        },
        None => (rest, None),
    };
    if table.is_empty() {
        return None;
    }
    Some((
        FileKind::Data,
        database.to_owned(),
        Some(table.to_owned()),
        part,
        compression,
    ))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{
        classify_file_name,
        scan_dump_dir,
        FileKind,
    };
    use crate::jobs::Compression;

    #[test]
    fn test_classify_schema_create() {
        let (kind, db, table, part, compression) =
            classify_file_name("shop-schema-create.sql").unwrap();
        assert_eq!(kind, FileKind::CreateDatabase);
        assert_eq!(db, "shop");
        assert_eq!(table, None);
        assert_eq!(part, None);
        assert_eq!(compression, Compression::None);
    }

    #[test]
    fn test_classify_table_schema() {
        let (kind, db, table, ..) = classify_file_name("shop.orders-schema.sql").unwrap();
        assert_eq!(kind, FileKind::CreateTable);
        assert_eq!(db, "shop");
        assert_eq!(table.as_deref(), Some("orders"));
    }

    #[test]
    fn test_classify_view_sequence_post() {
        assert_eq!(
            classify_file_name("shop.totals-schema-view.sql").unwrap().0,
            FileKind::CreateView
        );
        assert_eq!(
            classify_file_name("shop.ids-schema-sequence.sql").unwrap().0,
            FileKind::CreateSequence
        );
        assert_eq!(
            classify_file_name("shop.orders-schema-post.sql").unwrap().0,
            FileKind::SchemaPost
        );
    }

    #[test]
    fn test_classify_data_files() {
        let (kind, db, table, part, compression) =
            classify_file_name("shop.orders.00042.sql.gz").unwrap();
        assert_eq!(kind, FileKind::Data);
        assert_eq!(db, "shop");
        assert_eq!(table.as_deref(), Some("orders"));
        assert_eq!(part, Some(42));
        assert_eq!(compression, Compression::Gzip);

        let (kind, _, table, part, compression) =
            classify_file_name("shop.orders.sql.zst").unwrap();
        assert_eq!(kind, FileKind::Data);
        assert_eq!(table.as_deref(), Some("orders"));
        assert_eq!(part, None);
        assert_eq!(compression, Compression::Zstd);
    }

    #[test]
    fn test_table_name_with_dots_keeps_numeric_part() {
        // `shop.order.items.00001.sql`: the final numeric component is the
        // part; everything between the database and it is the table.
        let (_, db, table, part, _) = classify_file_name("shop.order.items.00001.sql").unwrap();
        assert_eq!(db, "shop");
        assert_eq!(table.as_deref(), Some("order.items"));
        assert_eq!(part, Some(1));
    }

    #[test]
    fn test_unrecognized_files_rejected() {
        assert!(classify_file_name("README.md").is_none());
        assert!(classify_file_name("shop-schema-create.txt").is_none());
        assert!(classify_file_name(".sql").is_none());
    }

    #[test]
    fn test_scan_orders_schema_before_data() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "shop.orders.00001.sql",
            "shop.orders-schema.sql",
            "shop-schema-create.sql",
            "shop.orders.00000.sql",
            "metadata",
        ] {
            fs::write(dir.path().join(name), "-- test").unwrap();
        }
        let records = scan_dump_dir(dir.path()).unwrap();
        let kinds: Vec<FileKind> = records.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                FileKind::Metadata,
                FileKind::CreateDatabase,
                FileKind::CreateTable,
                FileKind::Data,
                FileKind::Data,
            ]
        );
        assert_eq!(records[3].part, Some(0));
        assert_eq!(records[4].part, Some(1));
    }
}
