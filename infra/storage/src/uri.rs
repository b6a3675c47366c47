//! Storage URIs of the form `scheme://id`, returned by `save_file` and resolved back into
//! object URLs by the manager.

use crate::error::StorageError;
use crate::metadata::StorageType;
use std::fmt;
use std::str::FromStr;

const SEPARATOR: &str = "://";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum UriScheme {
    Opfs,
    Idb,
    Memory,
}

impl From<StorageType> for UriScheme {
    fn from(value: StorageType) -> Self {
        match value {
            StorageType::Filesystem => Self::Opfs,
            StorageType::Database => Self::Idb,
            StorageType::Memory => Self::Memory,
        }
    }
}

/// A reference to a file inside a specific backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageUri {
    scheme: UriScheme,
    id: String,
}

impl StorageUri {
    pub fn new(scheme: impl Into<UriScheme>, id: impl Into<String>) -> Self {
        Self { scheme: scheme.into(), id: id.into() }
    }

    #[must_use]
    pub const fn scheme(&self) -> UriScheme {
        self.scheme
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn into_id(self) -> String {
        self.id
    }
}

impl fmt::Display for StorageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.scheme, self.id)
    }
}

impl FromStr for StorageUri {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_storage_uri(s)
            .ok_or_else(|| StorageError::invalid(format!("Not a storage URI: {s}")))
    }
}

/// Parses `opfs://`, `idb://` or `memory://` URIs.
///
/// The scheme is matched exactly. Everything after the first `://` is the id, so ids may
/// themselves contain `://`. Empty ids and ids spanning lines are rejected.
#[must_use]
pub fn parse_storage_uri(value: &str) -> Option<StorageUri> {
    let (scheme, id) = value.split_once(SEPARATOR)?;
    let scheme = UriScheme::from_str(scheme).ok()?;

    if id.is_empty() || id.contains(['\n', '\r', '\u{2028}', '\u{2029}']) {
        return None;
    }

    Some(StorageUri { scheme, id: id.to_owned() })
}

/// Whether `value` is a storage URI rather than a regular, `blob:` or `data:` URL.
#[must_use]
pub fn is_storage_uri(value: &str) -> bool {
    parse_storage_uri(value).is_some()
}
