//! Mount-provider contracts and the lazy per-call mount handle.
//!
//! A [`Mountable`] describes a layer as a set of mount entries; a
//! [`LocalMounter`] materializes those entries at a local path and hands back
//! the unmount callback. The checksum engine only ever asks for read-only
//! mounts, and only when it actually has to touch the filesystem; a fully
//! cached request never mounts at all.

use std::path::{Path, PathBuf};

use crate::cancel::CancellationToken;
use crate::error::{CacheError, Result};

/// One entry of a layer mount, in the shape mount providers speak.
#[derive(Debug, Clone)]
pub struct MountEntry {
    /// Mount type, e.g. `"bind"` or `"overlay"`.
    pub kind: String,
    pub source: PathBuf,
    pub options: Vec<String>,
}

/// A handle that can surface a layer as a set of mount entries.
pub trait Mountable: Send + Sync {
    fn mount(&self, readonly: bool, cancel: &CancellationToken) -> Result<Vec<MountEntry>>;
}

/// Materializes mount entries at a local filesystem path.
pub trait LocalMounter: Send + Sync {
    fn mount(&self, entries: Vec<MountEntry>) -> Result<ActiveMount>;
}

type UnmountFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// A materialized mount; unmounts when dropped.
pub struct ActiveMount {
    path: PathBuf,
    unmount: Option<UnmountFn>,
}

impl ActiveMount {
    pub fn new(path: PathBuf, unmount: Option<UnmountFn>) -> Self {
        Self { path, unmount }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ActiveMount {
    fn drop(&mut self) {
        if let Some(unmount) = self.unmount.take() {
            if let Err(err) = unmount() {
                tracing::warn!(
                    target = "strata.contenthash",
                    path = %self.path.display(),
                    error = %err,
                    "failed to unmount layer"
                );
            }
        }
    }
}

impl std::fmt::Debug for ActiveMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveMount")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Stock mounter for bind entries: the source directory is the mount.
#[derive(Debug, Default, Clone, Copy)]
pub struct BindMounter;

impl LocalMounter for BindMounter {
    fn mount(&self, entries: Vec<MountEntry>) -> Result<ActiveMount> {
        let entry = match entries.as_slice() {
            [entry] if entry.kind == "bind" || entry.kind == "rbind" => entry,
            _ => {
                return Err(CacheError::Mount {
                    message: format!(
                        "bind mounter expects a single bind entry, got {}",
                        entries.len()
                    ),
                })
            }
        };
        Ok(ActiveMount::new(entry.source.clone(), None))
    }
}

/// Lazy, idempotent mount scoped to one top-level checksum call.
///
/// The first [`Mount::mount_path`] acquires a read-only mount and memoizes
/// the local path; dropping the handle releases it on every exit path.
pub(crate) struct Mount<'a> {
    mountable: &'a dyn Mountable,
    mounter: &'a dyn LocalMounter,
    active: Option<ActiveMount>,
}

impl<'a> Mount<'a> {
    pub(crate) fn new(mountable: &'a dyn Mountable, mounter: &'a dyn LocalMounter) -> Self {
        Self {
            mountable,
            mounter,
            active: None,
        }
    }

    pub(crate) fn mount_path(&mut self, cancel: &CancellationToken) -> Result<&Path> {
        if self.active.is_none() {
            cancel.check()?;
            let entries = self.mountable.mount(true, cancel)?;
            self.active = Some(self.mounter.mount(entries)?);
        }
        Ok(self.active.as_ref().expect("mount was just materialized").path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_mounter_rejects_non_bind_entries() {
        let err = BindMounter
            .mount(vec![MountEntry {
                kind: "overlay".into(),
                source: PathBuf::from("/tmp"),
                options: Vec::new(),
            }])
            .unwrap_err();
        assert!(matches!(err, CacheError::Mount { .. }));
    }

    #[test]
    fn active_mount_runs_unmount_on_drop() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let mount = ActiveMount::new(
            PathBuf::from("/tmp"),
            Some(Box::new(move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })),
        );
        drop(mount);
        assert!(released.load(Ordering::SeqCst));
    }
}
