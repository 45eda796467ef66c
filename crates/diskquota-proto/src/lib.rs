//! Diskquota Protocol - gRPC service definitions
//!
//! This crate contains the protobuf-generated code for diskquota's
//! internal gRPC services.

/// Segment service (per-shard stat and control operations)
pub mod segment {
    tonic::include_proto!("diskquota.segment");
}

/// Management service (coordinator-side administration)
pub mod manage {
    tonic::include_proto!("diskquota.manage");
}
