//! redb table definitions for the Cirrus instance store.

use redb::TableDefinition;

/// Instance records keyed by instance id.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");
