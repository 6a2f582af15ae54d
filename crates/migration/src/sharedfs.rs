// Copyright (c) 2024 The vmmd Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host filesystem probing for the migration safety check.
//!
//! Cache-mode corruption on migration is a cross-host page-cache problem:
//! it needs a filesystem that both hosts mount. Cluster filesystems keep
//! their caches coherent and are exempt.

use std::path::Path;

const NFS_SUPER_MAGIC: u32 = 0x6969;
const GFS2_MAGIC: u32 = 0x0116_1970;
const OCFS2_SUPER_MAGIC: u32 = 0x7461_636f;
const AFS_FS_MAGIC: u32 = 0x6B41_4653;
const SMB_SUPER_MAGIC: u32 = 0x517B;
const CIFS_SUPER_MAGIC: u32 = 0xFF53_4D42;
const CEPH_SUPER_MAGIC: u32 = 0x00C3_6400;

fn is_shared_magic(magic: u32) -> bool {
    matches!(
        magic,
        NFS_SUPER_MAGIC
            | GFS2_MAGIC
            | OCFS2_SUPER_MAGIC
            | AFS_FS_MAGIC
            | SMB_SUPER_MAGIC
            | CIFS_SUPER_MAGIC
            | CEPH_SUPER_MAGIC
    )
}

fn is_cluster_magic(magic: u32) -> bool {
    matches!(magic, GFS2_MAGIC | OCFS2_SUPER_MAGIC | CEPH_SUPER_MAGIC)
}

/// The filesystem magic under `path`. The image itself may not exist yet
/// (destination pre-creation), so the nearest existing ancestor answers.
fn filesystem_magic(path: &Path) -> Option<u32> {
    let mut probe = path;
    loop {
        match nix::sys::statfs::statfs(probe) {
            Ok(st) => return Some(st.filesystem_type().0 as u32),
            Err(nix::errno::Errno::ENOENT) => probe = probe.parent()?,
            Err(e) => {
                debug!(sl!(), "statfs failed"; "path" => probe.display().to_string(),
                    "error" => e.to_string());
                return None;
            }
        }
    }
}

/// Whether `path` sits on a filesystem mounted from somewhere both
/// migration peers can reach (NFS, SMB/CIFS, AFS, GFS2, OCFS2, CephFS).
pub(crate) fn is_shared_filesystem(path: &Path) -> bool {
    filesystem_magic(path).map(is_shared_magic).unwrap_or(false)
}

/// Whether `path` sits on a cluster filesystem whose caches stay coherent
/// across hosts (GFS2, OCFS2, CephFS).
pub(crate) fn is_cluster_filesystem(path: &Path) -> bool {
    filesystem_magic(path).map(is_cluster_magic).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_classification() {
        assert!(is_shared_magic(NFS_SUPER_MAGIC));
        assert!(is_shared_magic(CIFS_SUPER_MAGIC));
        assert!(!is_cluster_magic(NFS_SUPER_MAGIC));

        // Every cluster filesystem is also a shared one.
        for magic in [GFS2_MAGIC, OCFS2_SUPER_MAGIC, CEPH_SUPER_MAGIC] {
            assert!(is_shared_magic(magic));
            assert!(is_cluster_magic(magic));
        }

        // ext4 and tmpfs stay local.
        assert!(!is_shared_magic(0xEF53));
        assert!(!is_shared_magic(0x0102_1994));
    }

    #[test]
    fn test_probe_walks_to_existing_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("images").join("a.qcow2");
        // The ancestor exists, so the probe answers something, and a
        // scratch directory is never on a shared filesystem.
        assert!(filesystem_magic(&missing).is_some());
        assert!(!is_shared_filesystem(&missing));
        assert!(!is_cluster_filesystem(&missing));
    }
}
