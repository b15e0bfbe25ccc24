//! redb table definitions for the membership table.

use redb::TableDefinition;

/// Host records keyed by `{group}/{id:010}`.
pub const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");

/// Connection id (decimal) → host key, for O(1) disconnect handling.
pub const CONNECTIONS: TableDefinition<&str, &str> = TableDefinition::new("connections");
