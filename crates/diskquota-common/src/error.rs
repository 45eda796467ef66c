//! Error types for diskquota
//!
//! `Error` is the common currency across crate boundaries. The only error
//! the write-path gate ever surfaces to a client is `QuotaExceeded`;
//! everything else stays inside the engine and is logged.

use crate::types::{DdlResult, Oid, QuotaType};
use std::fmt;
use thiserror::Error;

/// Common result type for diskquota operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for diskquota.
#[derive(Debug, Error)]
pub enum Error {
    /// A write was rejected because its target is over quota. This maps to
    /// the host's disk-full SQLSTATE.
    #[error("{0}")]
    QuotaExceeded(ExceededQuota),

    #[error("invalid size: \"{0}\"")]
    InvalidSize(String),

    #[error("invalid size unit: \"{unit}\" (valid units are kB, MB, GB and TB)")]
    InvalidSizeUnit { unit: String },

    #[error("per segment quota ratio must be greater than 0, got {0}")]
    InvalidSegRatio(f32),

    #[error("{kind} \"{name}\" does not exist")]
    UnknownTarget { kind: &'static str, name: String },

    #[error("relation {0} does not exist")]
    UnknownRelation(Oid),

    #[error("database {0} is not monitored by diskquota")]
    DatabaseNotMonitored(Oid),

    #[error("too many databases to monitor")]
    TooManyDatabases,

    #[error("extension ddl failed: {}", .0.describe())]
    DdlFailed(DdlResult),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Details of a quota violation, rendered in the same shape the original
/// enforcement errors used.
#[derive(Clone, Debug, PartialEq)]
pub struct ExceededQuota {
    pub quota_type: QuotaType,
    pub target_name: String,
    pub tablespace_name: Option<String>,
    pub seg_exceeded: bool,
}

impl fmt::Display for ExceededQuota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.quota_type, &self.tablespace_name) {
            (QuotaType::Schema, _) => {
                write!(
                    f,
                    "schema's disk space quota exceeded with name: {}",
                    self.target_name
                )
            }
            (QuotaType::Role, _) => {
                write!(
                    f,
                    "role's disk space quota exceeded with name: {}",
                    self.target_name
                )
            }
            (QuotaType::SchemaTablespace, spc) => {
                let spc = spc.as_deref().unwrap_or("?");
                if self.seg_exceeded {
                    write!(
                        f,
                        "tablespace: {} schema: {} diskquota exceeded per segment quota",
                        spc, self.target_name
                    )
                } else {
                    write!(
                        f,
                        "tablespace: {} schema: {} diskquota exceeded",
                        spc, self.target_name
                    )
                }
            }
            (QuotaType::RoleTablespace, spc) => {
                let spc = spc.as_deref().unwrap_or("?");
                if self.seg_exceeded {
                    write!(
                        f,
                        "tablespace: {} role: {} diskquota exceeded per segment quota",
                        spc, self.target_name
                    )
                } else {
                    write!(
                        f,
                        "tablespace: {} role: {} diskquota exceeded",
                        spc, self.target_name
                    )
                }
            }
        }
    }
}

impl Error {
    /// True for violations the write gate should surface; everything else
    /// fails open.
    pub fn is_quota_violation(&self) -> bool {
        matches!(self, Error::QuotaExceeded(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exceeded_message_shapes() {
        let schema = Error::QuotaExceeded(ExceededQuota {
            quota_type: QuotaType::Schema,
            target_name: "sales".into(),
            tablespace_name: None,
            seg_exceeded: false,
        });
        assert_eq!(
            schema.to_string(),
            "schema's disk space quota exceeded with name: sales"
        );

        let per_seg = Error::QuotaExceeded(ExceededQuota {
            quota_type: QuotaType::RoleTablespace,
            target_name: "etl".into(),
            tablespace_name: Some("fast".into()),
            seg_exceeded: true,
        });
        assert_eq!(
            per_seg.to_string(),
            "tablespace: fast role: etl diskquota exceeded per segment quota"
        );
    }

    #[test]
    fn violation_classification() {
        let v = Error::QuotaExceeded(ExceededQuota {
            quota_type: QuotaType::Role,
            target_name: "r".into(),
            tablespace_name: None,
            seg_exceeded: false,
        });
        assert!(v.is_quota_violation());
        assert!(!Error::TooManyDatabases.is_quota_violation());
    }
}
