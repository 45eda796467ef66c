//! On-disk layout of relation storage, mirroring the host's
//! `<base>/<tablespace>/<db>/<relfilenode>` scheme. Large relations split
//! into numbered segment files (`.1`, `.2`, …); temp relations prefix the
//! owning backend id.

use diskquota_common::RelFileNodeBackend;
use std::path::{Path, PathBuf};

/// Relation forks that contribute to a relation's size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fork {
    Main,
    FreeSpaceMap,
    VisibilityMap,
}

pub const FORKS: [Fork; 3] = [Fork::Main, Fork::FreeSpaceMap, Fork::VisibilityMap];

impl Fork {
    fn suffix(&self) -> &'static str {
        match self {
            Fork::Main => "",
            Fork::FreeSpaceMap => "_fsm",
            Fork::VisibilityMap => "_vm",
        }
    }
}

/// Path of one fork's first segment file. Higher segments append `.N`.
pub fn relation_path(base: &Path, rnode: &RelFileNodeBackend, fork: Fork) -> PathBuf {
    let file = if rnode.is_temp() {
        format!(
            "t{}_{}{}",
            rnode.backend,
            rnode.node.relfilenode,
            fork.suffix()
        )
    } else {
        format!("{}{}", rnode.node.relfilenode, fork.suffix())
    };
    base.join(rnode.node.tablespace.to_string())
        .join(rnode.node.db.to_string())
        .join(file)
}

/// Path of the `segno`-th segment file of a fork.
pub fn segment_file_path(base: &Path, rnode: &RelFileNodeBackend, fork: Fork, segno: u32) -> PathBuf {
    let first = relation_path(base, rnode, fork);
    if segno == 0 {
        first
    } else {
        let mut s = first.into_os_string();
        s.push(format!(".{segno}"));
        PathBuf::from(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskquota_common::RelFileNode;

    #[test]
    fn permanent_relation_paths() {
        let rnode = RelFileNodeBackend::permanent(RelFileNode::new(16385, 1663, 16400));
        let base = Path::new("/data");
        assert_eq!(
            relation_path(base, &rnode, Fork::Main),
            Path::new("/data/1663/16385/16400")
        );
        assert_eq!(
            relation_path(base, &rnode, Fork::FreeSpaceMap),
            Path::new("/data/1663/16385/16400_fsm")
        );
        assert_eq!(
            segment_file_path(base, &rnode, Fork::Main, 2),
            Path::new("/data/1663/16385/16400.2")
        );
    }

    #[test]
    fn temp_relation_paths_carry_the_backend() {
        let rnode = RelFileNodeBackend {
            node: RelFileNode::new(16385, 1663, 16400),
            backend: 7,
        };
        assert_eq!(
            relation_path(Path::new("/data"), &rnode, Fork::Main),
            Path::new("/data/1663/16385/t7_16400")
        );
    }
}
