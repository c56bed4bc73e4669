//! Delete command implementation.

use super::store::{configuration, require_existing, CliError};
use std::path::Path;
use tetherdb_core::delete_store;

/// Runs the delete command.
pub fn run(path: &Path, key: Option<&str>, confirmed: bool) -> Result<(), Box<dyn std::error::Error>> {
    if delete(path, key, confirmed)? {
        println!("Deleted {}", path.display());
    } else {
        println!("Nothing to delete at {}", path.display());
    }
    Ok(())
}

fn delete(path: &Path, key: Option<&str>, confirmed: bool) -> Result<bool, CliError> {
    if !confirmed {
        return Err(CliError::NotConfirmed("delete a store"));
    }
    require_existing(path)?;
    Ok(delete_store(&configuration(path, key)?)?)
}
