//! Core identifier and classification types shared by every diskquota
//! component.

use serde::{Deserialize, Serialize};

/// Object identifier, matching the host catalog's oid width.
pub type Oid = u32;

/// The zero oid, never assigned to a real object.
pub const INVALID_OID: Oid = 0;

/// Oids below this boundary belong to host-reserved catalog objects and are
/// never quota-tracked.
pub const FIRST_NORMAL_OBJECT_ID: Oid = 16384;

/// Shard identifier. `-1` denotes the cluster-wide total.
pub type SegId = i16;

/// The pseudo seg id carrying the cluster-wide aggregate.
pub const CLUSTER_SEG_ID: SegId = -1;

/// Maximum number of databases that can be monitored at once.
pub const MAX_NUM_MONITORED_DB: usize = 10;

/// Default capacity of the active-file map.
pub const DEFAULT_MAX_ACTIVE_TABLES: usize = 1024 * 1024;

/// Default worker refresh interval in seconds.
pub const DEFAULT_NAPTIME_SECS: u64 = 2;

/// Marker for a permanent (non-temp) relation's backend slot.
pub const INVALID_BACKEND_ID: i32 = -1;

/// Backend slot used when sizing a temp relation from outside its owning
/// session.
pub const TEMP_UTILITY_BACKEND: i32 = 0;

/// On-disk file identifier. Relfilenode numbers are only unique within a
/// tablespace, so the full key carries all three parts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelFileNode {
    pub db: Oid,
    pub tablespace: Oid,
    pub relfilenode: Oid,
}

impl RelFileNode {
    pub fn new(db: Oid, tablespace: Oid, relfilenode: Oid) -> Self {
        Self {
            db,
            tablespace,
            relfilenode,
        }
    }
}

/// A relfilenode plus the backend slot that owns it. Temp relations carry
/// the creating backend's id; permanent relations use `INVALID_BACKEND_ID`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RelFileNodeBackend {
    pub node: RelFileNode,
    pub backend: i32,
}

impl RelFileNodeBackend {
    pub fn permanent(node: RelFileNode) -> Self {
        Self {
            node,
            backend: INVALID_BACKEND_ID,
        }
    }

    pub fn is_temp(&self) -> bool {
        self.backend != INVALID_BACKEND_ID
    }
}

/// The four quota target categories.
///
/// Discriminants are wire- and storage-stable; they appear in the persisted
/// `quota_config` table and in RPC messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum QuotaType {
    Schema = 0,
    Role = 1,
    SchemaTablespace = 2,
    RoleTablespace = 3,
}

/// All quota types, in evaluation order.
pub const QUOTA_TYPES: [QuotaType; 4] = [
    QuotaType::Schema,
    QuotaType::Role,
    QuotaType::SchemaTablespace,
    QuotaType::RoleTablespace,
];

impl QuotaType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(QuotaType::Schema),
            1 => Some(QuotaType::Role),
            2 => Some(QuotaType::SchemaTablespace),
            3 => Some(QuotaType::RoleTablespace),
            _ => None,
        }
    }

    /// Number of key columns for this quota type: 1 for plain schema/role
    /// quotas, 2 for the tablespace-qualified variants.
    pub fn num_keys(&self) -> usize {
        match self {
            QuotaType::Schema | QuotaType::Role => 1,
            QuotaType::SchemaTablespace | QuotaType::RoleTablespace => 2,
        }
    }

    pub fn is_tablespace_qualified(&self) -> bool {
        self.num_keys() == 2
    }

    /// Whether the first key is a role oid (as opposed to a namespace oid).
    pub fn targets_role(&self) -> bool {
        matches!(self, QuotaType::Role | QuotaType::RoleTablespace)
    }
}

/// Role a node plays in the cluster. Probes and the segment-side stat
/// service only do work on primary segments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Coordinator,
    Segment,
    Mirror,
}

impl NodeRole {
    pub fn collects_active_tables(&self) -> bool {
        matches!(self, NodeRole::Segment)
    }
}

/// Storage classification of a relation, including the auxiliary kinds
/// that roll up into a primary table's size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Heap,
    AppendOptimized,
    External,
    Index,
    Toast,
    AoSegment,
    AoVisimap,
    AoBlockDirectory,
}

impl StorageKind {
    /// Auxiliary kinds never own a quota target themselves; their size is
    /// charged to the primary relation.
    pub fn is_auxiliary(&self) -> bool {
        !matches!(
            self,
            StorageKind::Heap | StorageKind::AppendOptimized | StorageKind::External
        )
    }
}

/// Catalog attributes of one relation, as returned by the host catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationMeta {
    pub oid: Oid,
    pub name: String,
    pub db: Oid,
    pub namespace: Oid,
    pub owner: Oid,
    pub tablespace: Oid,
    pub relfilenode: Oid,
    pub kind: StorageKind,
    pub backend: i32,
    /// Primary relation for auxiliary kinds; `None` for primaries.
    pub parent: Option<Oid>,
}

impl RelationMeta {
    pub fn rnode(&self) -> RelFileNodeBackend {
        RelFileNodeBackend {
            node: RelFileNode::new(self.db, self.tablespace, self.relfilenode),
            backend: self.backend,
        }
    }

    pub fn is_temp(&self) -> bool {
        self.backend != INVALID_BACKEND_ID
    }
}

/// One row of the segment stat RPC: a relation's on-disk size on one shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableStat {
    pub oid: Oid,
    pub size_bytes: u64,
    pub seg_id: SegId,
}

/// Modes of the segment-side `fetch_table_stat` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum FetchMode {
    /// Drain the active-file map and return the primary relation oids.
    ActiveOids = 0,
    /// Compute on-disk sizes for the given relation oids.
    ActiveSize = 1,
}

impl FetchMode {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(FetchMode::ActiveOids),
            1 => Some(FetchMode::ActiveSize),
            _ => None,
        }
    }
}

/// Persisted-schema generation. V1 stores one size row per relation; V2
/// stores one row per (relation, shard) and a three-column stat RPC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    V1,
    V2,
}

impl SchemaVersion {
    pub fn stat_columns(&self) -> usize {
        match self {
            SchemaVersion::V1 => 2,
            SchemaVersion::V2 => 3,
        }
    }
}

/// Extension lifecycle state persisted in the `state` table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum QuotaState {
    /// First install; table sizes have not been initialized yet.
    Unknown = 0,
    /// `init_table_size_table` has run; the model is trustworthy.
    Ready = 1,
}

/// Commands accepted by the launcher mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DdlCommand {
    CreateExtension,
    DropExtension,
}

/// Launcher mailbox reply codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DdlResult {
    Pending,
    Ok,
    /// The number of monitored databases would exceed the maximum.
    Exceed,
    AddToDbFailed,
    DelFromDbFailed,
    StartWorkerFailed,
    InvalidDbid,
    Unknown,
}

impl DdlResult {
    pub fn describe(&self) -> &'static str {
        match self {
            DdlResult::Pending => {
                "no response from the diskquota launcher, check whether the launcher is running"
            }
            DdlResult::Ok => "succeeded",
            DdlResult::Exceed => "too many databases to monitor",
            DdlResult::AddToDbFailed => "adding the database to the monitored list failed",
            DdlResult::DelFromDbFailed => "removing the database from the monitored list failed",
            DdlResult::StartWorkerFailed => "starting the diskquota worker failed",
            DdlResult::InvalidDbid => "invalid database oid",
            DdlResult::Unknown => "unknown error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_type_roundtrip() {
        for ty in QUOTA_TYPES {
            assert_eq!(QuotaType::from_u32(ty as u32), Some(ty));
        }
        assert_eq!(QuotaType::from_u32(4), None);
    }

    #[test]
    fn quota_type_key_shape() {
        assert_eq!(QuotaType::Schema.num_keys(), 1);
        assert_eq!(QuotaType::RoleTablespace.num_keys(), 2);
        assert!(QuotaType::SchemaTablespace.is_tablespace_qualified());
        assert!(!QuotaType::Role.is_tablespace_qualified());
        assert!(QuotaType::RoleTablespace.targets_role());
        assert!(!QuotaType::SchemaTablespace.targets_role());
    }

    #[test]
    fn temp_relation_marker() {
        let node = RelFileNode::new(5, 1663, 16390);
        assert!(!RelFileNodeBackend::permanent(node).is_temp());
        let temp = RelFileNodeBackend { node, backend: 3 };
        assert!(temp.is_temp());
    }

    #[test]
    fn auxiliary_kinds() {
        assert!(StorageKind::Toast.is_auxiliary());
        assert!(StorageKind::AoBlockDirectory.is_auxiliary());
        assert!(!StorageKind::Heap.is_auxiliary());
        assert!(!StorageKind::AppendOptimized.is_auxiliary());
    }
}
