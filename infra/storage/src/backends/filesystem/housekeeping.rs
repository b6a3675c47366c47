use super::security::TMP_MARKER;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use sysinfo::{Disk, Disks};
use walkdir::{DirEntry, WalkDir};

/// Temporaries untouched for this long belong to writes that never finished.
pub(super) const ABANDONED_AFTER: Duration = Duration::from_secs(300);

/// What one pass of [`Sweep::run`] deleted and what it could not.
#[derive(Debug, Default)]
pub(super) struct Sweep {
    pub removed: usize,
    pub failed: Vec<(PathBuf, std::io::Error)>,
}

impl Sweep {
    /// Deletes every temporary below `base` last modified before `cutoff`.
    pub(super) fn run(base: &Path, cutoff: SystemTime) -> Self {
        abandoned_writes(base, cutoff).fold(Self::default(), |mut sweep, path| {
            match std::fs::remove_file(&path) {
                Ok(()) => sweep.removed += 1,
                Err(e) => sweep.failed.push((path, e)),
            }
            sweep
        })
    }

    pub(super) fn is_empty(&self) -> bool {
        self.removed == 0 && self.failed.is_empty()
    }
}

fn abandoned_writes(base: &Path, cutoff: SystemTime) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(base)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name().to_str().is_some_and(|name| name.contains(TMP_MARKER)))
        .filter(move |entry| last_modified(entry).is_none_or(|modified| modified < cutoff))
        .map(DirEntry::into_path)
}

fn last_modified(entry: &DirEntry) -> Option<SystemTime> {
    entry.metadata().ok()?.modified().ok()
}

/// Free bytes on the volume holding `path`: the disk whose mount point is its longest prefix.
/// Blocking; `None` when no listed disk contains `path`.
pub(super) fn volume_available(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().components().count())
        .map(Disk::available_space)
}
