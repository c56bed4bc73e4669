//! Inspect command implementation.

use super::store::{configuration, require_existing};
use std::path::Path;
use tetherdb_core::{inspect_store, StoreSummary};

/// Runs the inspect command.
pub fn run(
    path: &Path,
    key: Option<&str>,
    show_columns: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    require_existing(path)?;
    let config = configuration(path, key)?;
    let summary = inspect_store(&config)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        _ => {
            print!("{}", render_text(&summary, show_columns));
        }
    }

    Ok(())
}

fn render_text(summary: &StoreSummary, show_columns: bool) -> String {
    let mut out = String::new();
    out.push_str(&format!("Store: {}\n", summary.location));
    out.push_str(&format!("Version: {}\n", summary.version));
    match summary.schema_version {
        Some(v) => out.push_str(&format!("Schema version: {v}\n")),
        None => out.push_str("Schema version: (unversioned)\n"),
    }
    out.push_str(&format!("Tables: {}\n", summary.tables.len()));

    for table in &summary.tables {
        out.push_str(&format!("  {:<24} {:>8} rows", table.name, table.rows));
        if let Some(pk) = &table.primary_key {
            out.push_str(&format!("  primary key: {pk}"));
        }
        out.push('\n');
        if show_columns {
            for column in &table.columns {
                out.push_str(&format!("    - {column}\n"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tetherdb_core::TableSummary;

    fn summary() -> StoreSummary {
        StoreSummary {
            location: "/tmp/app.tether".into(),
            version: 4,
            schema_version: Some(2),
            tables: vec![TableSummary {
                name: "class_Person".into(),
                rows: 3,
                columns: vec!["id".into(), "name".into()],
                primary_key: Some("id".into()),
            }],
        }
    }

    #[test]
    fn test_text_output() {
        let text = render_text(&summary(), false);
        assert!(text.contains("Version: 4"));
        assert!(text.contains("Schema version: 2"));
        assert!(text.contains("class_Person"));
        assert!(text.contains("primary key: id"));
        assert!(!text.contains("- name"));
    }

    #[test]
    fn test_text_output_with_columns() {
        let text = render_text(&summary(), true);
        assert!(text.contains("    - id\n"));
        assert!(text.contains("    - name\n"));
    }
}
