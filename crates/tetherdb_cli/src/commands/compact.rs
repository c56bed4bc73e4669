//! Compact command implementation.

use super::store::{configuration, read_log};
use serde::Serialize;
use std::path::Path;
use tetherdb_core::compact_store;
use tetherdb_core::engine::{decode_log, RecordKind};

/// What compaction did, or would do.
#[derive(Debug, Serialize)]
pub struct CompactStats {
    /// Records in the log before compaction.
    pub records: usize,
    /// Commit records among them.
    pub commits: usize,
    /// Log size before compaction.
    pub bytes_before: u64,
    /// Log size after compaction, if it ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_after: Option<u64>,
}

/// Runs the compact command.
pub fn run(path: &Path, key: Option<&str>, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let stats = compact(path, key, dry_run)?;

    println!("Records:      {}", stats.records);
    println!("Commits:      {}", stats.commits);
    println!("Size before:  {} bytes", stats.bytes_before);
    match stats.bytes_after {
        Some(after) => println!("Size after:   {after} bytes"),
        None => println!("Dry run, nothing written."),
    }

    Ok(())
}

fn compact(path: &Path, key: Option<&str>, dry_run: bool) -> Result<CompactStats, Box<dyn std::error::Error>> {
    let log = read_log(path, key)?;
    let decoded = decode_log(&log)?;
    let commits = decoded
        .records
        .iter()
        .filter(|r| r.kind() == RecordKind::Commit)
        .count();

    let mut stats = CompactStats {
        records: decoded.records.len(),
        commits,
        bytes_before: std::fs::metadata(path)?.len(),
        bytes_after: None,
    };
    if !dry_run {
        let config = configuration(path, key)?;
        let (before, after) = compact_store(&config)?;
        stats.bytes_before = before;
        stats.bytes_after = Some(after);
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tetherdb_core::{Handle, Object, ObjectSchema, PropertyType, StaticSchemaMediator, StoreConfiguration};

    fn seeded(dir: &Path) -> std::path::PathBuf {
        let mediator = StaticSchemaMediator::new(vec![ObjectSchema::builder("Note")
            .property("text", PropertyType::Text)
            .build()
            .unwrap()])
        .unwrap();
        let config = StoreConfiguration::builder()
            .directory(dir)
            .name("notes.tether")
            .mediator(mediator)
            .build()
            .unwrap();
        let handle = Handle::open(&config).unwrap();
        for i in 0..5 {
            handle
                .execute_transaction(|h| {
                    h.copy_to_store(&Object::new("Note").with("text", format!("note {i}")))
                        .map(drop)
                })
                .unwrap();
        }
        handle.close().unwrap();
        config.location().path().unwrap().to_path_buf()
    }

    #[test]
    fn test_dry_run_leaves_log_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded(dir.path());
        let size = std::fs::metadata(&path).unwrap().len();

        let stats = compact(&path, None, true).unwrap();
        assert!(stats.records >= 6);
        assert!(stats.bytes_after.is_none());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
    }

    #[test]
    fn test_compaction_leaves_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded(dir.path());

        let stats = compact(&path, None, false).unwrap();
        assert!(stats.bytes_after.unwrap() < stats.bytes_before);

        let again = compact(&path, None, true).unwrap();
        assert_eq!(again.records, 1);
        assert_eq!(again.commits, 0);
    }
}
