use crate::error::StorageError;
use std::path::{Component, Path, PathBuf};

/// Marker embedded in temporary file names; ids containing it are refused so that listings and
/// the stale-file purge can tell the two apart.
pub(super) const TMP_MARKER: &str = ".lumentmp.";

/// Checks that `id` names exactly one entry inside a directory.
///
/// Rejects empty ids, `.`/`..`, path separators, NUL bytes, absolute or prefixed paths and
/// anything that looks like one of our temporary files.
pub(super) fn validate_id(id: &str) -> Result<&str, StorageError> {
    let reject = |reason: &'static str| {
        Err(StorageError::InvalidData {
            message: format!("Invalid file id {id:?}").into(),
            context: Some(reason.into()),
            source: None,
        })
    };

    if id.is_empty() {
        return reject("id is empty");
    }
    if id.contains(['/', '\\', '\0']) {
        return reject("id contains a path separator or NUL");
    }
    if id.contains(TMP_MARKER) {
        return reject("id collides with the temporary file marker");
    }

    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(id),
        _ => reject("id must be a single plain path segment"),
    }
}

/// Joins a validated id below `dir` and verifies the result cannot escape `base`.
///
/// `base` must already be canonical. Existing targets are canonicalized so that a planted
/// symlink pointing outside the sandbox is refused.
pub(super) fn resolve_entry(base: &Path, dir: &str, id: &str) -> Result<PathBuf, StorageError> {
    let id = validate_id(id)?;
    let joined = base.join(dir).join(id);

    match joined.canonicalize() {
        Ok(canonical) if canonical.starts_with(base) => Ok(joined),
        Ok(canonical) => Err(StorageError::PermissionDenied {
            message: canonical.display().to_string().into(),
            context: Some("Entry resolves outside the storage root".into()),
            source: None,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(joined),
        Err(e) => Err(e.into()),
    }
}
