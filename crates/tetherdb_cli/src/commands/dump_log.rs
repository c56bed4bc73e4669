//! Dump-log command implementation.

use super::store::read_log;
use serde::Serialize;
use std::path::Path;
use tetherdb_core::engine::{decode_log, LogRecord};

/// Summary of one commit log record.
#[derive(Debug, Serialize)]
pub struct RecordSummary {
    /// Position in the log.
    pub index: usize,
    /// Record kind.
    pub kind: String,
    /// Version the record produces.
    pub version: u64,
    /// Operations in a commit record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ops: Option<usize>,
    /// Tables in a snapshot record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables: Option<usize>,
    /// Full record, with `--full`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<LogRecord>,
}

/// Runs the dump-log command.
pub fn run(
    path: &Path,
    key: Option<&str>,
    limit: Option<usize>,
    full: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let log = read_log(path, key)?;
    let decoded = decode_log(&log)?;
    let torn = decoded.has_torn_tail(log.len());
    let records = summarize(decoded.records, limit, full);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => {
            for r in &records {
                let detail = match (r.ops, r.tables) {
                    (Some(ops), _) => format!("{ops} ops"),
                    (_, Some(tables)) => format!("{tables} tables"),
                    _ => String::new(),
                };
                println!("#{:<6} {:<9} v{:<8} {detail}", r.index, r.kind, r.version);
                if let Some(record) = &r.record {
                    println!("        {record:?}");
                }
            }
            if torn {
                println!("(log ends with an incomplete record)");
            }
        }
    }

    Ok(())
}

fn summarize(records: Vec<LogRecord>, limit: Option<usize>, full: bool) -> Vec<RecordSummary> {
    records
        .into_iter()
        .take(limit.unwrap_or(usize::MAX))
        .enumerate()
        .map(|(index, record)| {
            let (kind, ops, tables) = match &record {
                LogRecord::Commit { ops, .. } => ("commit", Some(ops.len()), None),
                LogRecord::Snapshot { tables, .. } => ("snapshot", None, Some(tables.len())),
            };
            RecordSummary {
                index,
                kind: kind.to_string(),
                version: record.version().as_u64(),
                ops,
                tables,
                record: full.then_some(record),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tetherdb_core::engine::Op;
    use tetherdb_core::Version;

    fn commit(version: u64) -> LogRecord {
        LogRecord::Commit {
            version: Version(version),
            ops: vec![Op::SetSchemaVersion(version)],
        }
    }

    #[test]
    fn test_summaries_respect_limit() {
        let records = vec![commit(1), commit(2), commit(3)];
        let summaries = summarize(records, Some(2), false);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[1].version, 2);
        assert_eq!(summaries[1].ops, Some(1));
        assert!(summaries[1].record.is_none());
    }

    #[test]
    fn test_full_keeps_records() {
        let summaries = summarize(vec![commit(1)], None, true);
        assert_eq!(summaries[0].kind, "commit");
        assert!(summaries[0].record.is_some());
    }
}
