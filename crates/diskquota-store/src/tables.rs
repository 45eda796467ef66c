//! Redb table definitions for persistent quota storage.

use redb::TableDefinition;

/// Quota limits: (db, target_oid, quota_type) → JSON(QuotaConfigRecord)
pub const QUOTA_CONFIG: TableDefinition<(u32, u32, u32), &str> =
    TableDefinition::new("quota_config");

/// Tablespace-qualified targets: (db, primary_oid, tablespace_oid, quota_type) → ()
pub const TARGET: TableDefinition<(u32, u32, u32, u32), ()> = TableDefinition::new("target");

/// Relation sizes: (db, table_oid, seg_id) → size in bytes
pub const TABLE_SIZE: TableDefinition<(u32, u32, i32), u64> = TableDefinition::new("table_size");

/// Extension state: db → state discriminant (0 unknown, 1 ready)
pub const STATE: TableDefinition<u32, u32> = TableDefinition::new("state");

/// Monitored databases: db → ()
pub const DATABASE_LIST: TableDefinition<u32, ()> = TableDefinition::new("database_list");
