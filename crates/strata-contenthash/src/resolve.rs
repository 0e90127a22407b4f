//! Scope-safe directory resolution inside a mounted layer.
//!
//! [`root_path`] walks a path component by component under a mount root,
//! following symlinks on the way but never allowing the resolution to escape
//! the root: `..` clamps at the root and absolute link targets restart from
//! it. Every symlink traversed is reported through a callback so the caller
//! can materialize a record for it; the checksum engine later resolves
//! links logically through those records instead of re-walking the OS tree.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{CacheError, Result};
use crate::path::{is_abs, parent};
use crate::MAX_SYMLINK_HOPS;

/// Resolves `p` (an absolute in-scope path, `""` for the root) under `root`.
///
/// `on_symlink` is invoked with the in-scope path of each symlink traversed
/// and its raw target. Components that do not exist on disk resolve
/// lexically, so the returned path may not exist.
pub(crate) fn root_path(
    root: &Path,
    p: &str,
    on_symlink: &mut dyn FnMut(&str, &str) -> Result<()>,
) -> Result<PathBuf> {
    let mut queue: VecDeque<String> = p
        .split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    // In-scope path of the resolved prefix; "" is the root itself.
    let mut done = String::new();
    let mut hops = 0u32;

    while let Some(comp) = queue.pop_front() {
        match comp.as_str() {
            "." => continue,
            ".." => {
                done = parent(&done);
                continue;
            }
            _ => {}
        }

        let candidate = format!("{done}/{comp}");
        let fs_path = scoped(root, &candidate);
        match fs::symlink_metadata(&fs_path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // Missing suffixes resolve lexically; the caller decides what
                // a nonexistent result means.
                done = candidate;
            }
            Err(err) => return Err(err.into()),
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(CacheError::TooManySymlinks { path: candidate });
                }
                let target = fs::read_link(&fs_path)?;
                let target = target.to_string_lossy().into_owned();
                on_symlink(&candidate, &target)?;
                if is_abs(&target) {
                    done.clear();
                }
                for part in target.split('/').rev().filter(|c| !c.is_empty()) {
                    queue.push_front(part.to_string());
                }
            }
            Ok(_) => {
                done = candidate;
            }
        }
    }

    Ok(scoped(root, &done))
}

fn scoped(root: &Path, p: &str) -> PathBuf {
    if p.is_empty() {
        root.to_path_buf()
    } else {
        root.join(&p[1..])
    }
}
