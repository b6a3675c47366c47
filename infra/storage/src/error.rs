use std::borrow::Cow;
use std::io;

/// Boxed underlying cause attached to a [`StorageError`] for diagnostics.
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The closed set of failures a storage backend may report.
///
/// "Not found" is deliberately absent: lookups return `Ok(None)` instead.
#[lumen_derive::lumen_error(fallback = OperationFailed)]
pub enum StorageError {
    /// The backend's capacity (quota, memory ceiling, disk) would be exceeded.
    #[error("Storage quota exceeded{}: {message}", format_context(.context))]
    QuotaExceeded {
        message: Cow<'static, str>,
        context: Option<Cow<'static, str>>,
        source: Option<Cause>,
    },

    /// The platform refused access to the underlying resource.
    #[error("Permission denied{}: {message}", format_context(.context))]
    PermissionDenied {
        message: Cow<'static, str>,
        context: Option<Cow<'static, str>>,
        source: Option<Cause>,
    },

    /// Input or persisted data is malformed (bad id, bad URI, corrupt record).
    #[error("Invalid data{}: {message}", format_context(.context))]
    InvalidData {
        message: Cow<'static, str>,
        context: Option<Cow<'static, str>>,
        source: Option<Cause>,
    },

    /// A backend could not be prepared for use.
    #[error("Storage initialization failed{}: {message}", format_context(.context))]
    InitializationFailed {
        message: Cow<'static, str>,
        context: Option<Cow<'static, str>>,
        source: Option<Cause>,
    },

    /// Any other failure while performing an operation.
    #[error("Storage operation failed{}: {message}", format_context(.context))]
    OperationFailed {
        message: Cow<'static, str>,
        context: Option<Cow<'static, str>>,
        source: Option<Cause>,
    },
}

/// Discriminant of [`StorageError`], convenient for matching and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum StorageErrorKind {
    QuotaExceeded,
    PermissionDenied,
    InvalidData,
    InitializationFailed,
    OperationFailed,
}

impl StorageError {
    #[must_use]
    pub const fn kind(&self) -> StorageErrorKind {
        match self {
            Self::QuotaExceeded { .. } => StorageErrorKind::QuotaExceeded,
            Self::PermissionDenied { .. } => StorageErrorKind::PermissionDenied,
            Self::InvalidData { .. } => StorageErrorKind::InvalidData,
            Self::InitializationFailed { .. } => StorageErrorKind::InitializationFailed,
            Self::OperationFailed { .. } => StorageErrorKind::OperationFailed,
        }
    }

    pub fn quota(message: impl Into<Cow<'static, str>>) -> Self {
        Self::QuotaExceeded { message: message.into(), context: None, source: None }
    }

    pub fn invalid(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidData { message: message.into(), context: None, source: None }
    }

    pub fn failed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::OperationFailed { message: message.into(), context: None, source: None }
    }

    /// Wraps any error as an initialization failure, keeping it as the cause.
    pub fn init_failed(
        message: impl Into<Cow<'static, str>>,
        cause: impl Into<Cause>,
    ) -> Self {
        Self::InitializationFailed {
            message: message.into(),
            context: None,
            source: Some(cause.into()),
        }
    }

    /// Re-labels this error as an initialization failure, keeping the original as the cause.
    #[must_use]
    pub fn into_init_failure(self, message: impl Into<Cow<'static, str>>) -> Self {
        if self.is_initialization_failed() {
            return self;
        }
        Self::init_failed(message, self)
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        let kind = err.kind();
        let message: Cow<'static, str> = err.to_string().into();
        let source = Some(Box::new(err) as Cause);

        match kind {
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => {
                Self::PermissionDenied { message, context: None, source }
            },
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => {
                Self::QuotaExceeded { message, context: None, source }
            },
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
                Self::InvalidData { message, context: None, source }
            },
            _ => Self::OperationFailed { message, context: None, source },
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidData {
            message: err.to_string().into(),
            context: None,
            source: Some(Box::new(err)),
        }
    }
}

/// Adds context to foreign results while translating them into [`StorageError`].
pub(crate) trait IntoStorage<T> {
    fn storage_context(self, context: impl Into<Cow<'static, str>>) -> Result<T, StorageError>;
}

impl<T, E> IntoStorage<T> for Result<T, E>
where
    E: Into<StorageError>,
{
    fn storage_context(self, context: impl Into<Cow<'static, str>>) -> Result<T, StorageError> {
        self.map_err(Into::into).context(context)
    }
}
