//! The `status` command: open the store and print counts.

#![allow(clippy::print_stdout)]

use crate::config::HomeGraphConfig;
use crate::models::sync::metadata_keys;
use crate::storage::{GraphStore, SqliteGraphStore};
use crate::Result;

/// Prints store statistics and sync bookkeeping.
pub struct StatusCommand;

impl StatusCommand {
    /// Opens the configured database read-only-ish and reports its state.
    pub fn execute(config: &HomeGraphConfig) -> Result<()> {
        let store = SqliteGraphStore::new(&config.database_url)?;
        let stats = store.stats()?;

        println!("database: {}", config.database_url);
        println!("entities: {}", stats.entity_count);
        println!("versions: {}", stats.version_count);
        println!("relationships: {}", stats.relationship_count);
        for (entity_type, count) in &stats.entities_by_type {
            println!("  {entity_type}: {count}");
        }

        if let Some(last) = store.get_sync_metadata(metadata_keys::LAST_SYNC_TIME)? {
            println!("last sync: {last}");
        }
        if let Some(device) = store.get_sync_metadata(metadata_keys::DEVICE_ID)? {
            println!("device id: {device}");
        }
        Ok(())
    }
}
