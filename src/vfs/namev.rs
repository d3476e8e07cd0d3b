//! Path resolution (component E). Splitting, walking, and the parent+name
//! split `unlink`/`rename`/`mkdir`/`rmdir` need before they can act.
//!
//! `.` and `..` are not special-cased here: `fs::ramfs` stores them as
//! ordinary directory entries (pointing at itself and its parent), so a
//! plain repeated `lookup` handles them the same as any other component —
//! matching how a real directory on disk carries both entries physically.

use crate::error::{KError, KResult};
use crate::param::{MAXPATHLEN, NAMELEN};
use crate::vfs::vnode::{VnodeKind, VnodeTable};
use crate::vfs::VnodeId;

/// Split `path` into (is_absolute, non-empty components), collapsing
/// repeated and trailing slashes the way `/a///b/` and `/a/b` both resolve
/// to the same two components.
pub fn split_path(path: &str) -> KResult<(bool, Vec<&str>)> {
    if path.len() >= MAXPATHLEN {
        return Err(KError::Enametoolong);
    }
    let absolute = path.starts_with('/');
    let comps: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    for c in &comps {
        if c.len() >= NAMELEN {
            return Err(KError::Enametoolong);
        }
    }
    Ok((absolute, comps))
}

/// Resolve a single component against a directory vnode.
pub fn lookup(table: &VnodeTable, dir: VnodeId, name: &str) -> KResult<VnodeId> {
    let v = table.get(dir)?;
    if v.ops.kind() != VnodeKind::Directory {
        return Err(KError::Enotdir);
    }
    v.ops.lookup(name)
}

/// Resolve all but the last component of `path`, returning the containing
/// directory and the final component's name (unresolved — the caller may be
/// about to create it). A path with no final component (`/`, or the empty
/// relative path) has no name to split off: it resolves to its starting
/// point (root or cwd) paired with an empty name, for the caller to reject
/// or accept as it sees fit.
pub fn dir_namev(
    table: &VnodeTable,
    path: &str,
    root: VnodeId,
    cwd: VnodeId,
) -> KResult<(VnodeId, String)> {
    let (absolute, comps) = split_path(path)?;
    let mut cur = if absolute { root } else { cwd };
    let Some((last, parents)) = comps.split_last() else {
        return Ok((cur, String::new()));
    };
    for c in parents {
        cur = lookup(table, cur, c)?;
    }
    Ok((cur, (*last).to_string()))
}

/// Resolve `path` fully, returning the vnode it names.
pub fn open_namev(table: &VnodeTable, path: &str, root: VnodeId, cwd: VnodeId) -> KResult<VnodeId> {
    let (absolute, comps) = split_path(path)?;
    let mut cur = if absolute { root } else { cwd };
    for c in &comps {
        cur = lookup(table, cur, c)?;
    }
    Ok(cur)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_collapses_repeated_and_trailing_slashes() {
        let (abs, comps) = split_path("/a///b/").unwrap();
        assert!(abs);
        assert_eq!(comps, vec!["a", "b"]);
    }

    #[test]
    fn dir_namev_on_bare_slash_resolves_to_root_with_empty_name() {
        let table = VnodeTable::default();
        let root = VnodeId(1);
        let cwd = VnodeId(2);
        let (dir, name) = dir_namev(&table, "/", root, cwd).unwrap();
        assert_eq!(dir, root);
        assert_eq!(name, "");
    }

    #[test]
    fn dir_namev_on_empty_relative_path_resolves_to_cwd_with_empty_name() {
        let table = VnodeTable::default();
        let root = VnodeId(1);
        let cwd = VnodeId(2);
        let (dir, name) = dir_namev(&table, "", root, cwd).unwrap();
        assert_eq!(dir, cwd);
        assert_eq!(name, "");
    }
}
