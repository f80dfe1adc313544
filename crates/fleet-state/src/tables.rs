//! redb table definitions for the fleet store.
//!
//! Values are JSON-serialized domain types.

use redb::TableDefinition;

/// Instance records keyed by instance id.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Launch templates keyed by version.
pub const TEMPLATES: TableDefinition<u32, &[u8]> = TableDefinition::new("templates");

/// Counters and pointers (`next_seq`, `active_template`).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const META_NEXT_SEQ: &str = "next_seq";
pub const META_ACTIVE_TEMPLATE: &str = "active_template";
