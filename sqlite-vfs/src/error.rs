use std::ffi::CString;

use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error<External = Box<dyn std::error::Error>> {
    #[snafu(display("object not found"))]
    NotFound,

    #[snafu(display("database must be valid utf8 (received {name:?})"))]
    InvalidDbName {
        name: CString,
    },

    #[snafu(display("path too long"))]
    PathTooLong,

    #[snafu(display("invalid open flags"))]
    InvalidOpenFlags,

    #[snafu(display("file class not supported by this vfs"))]
    UnsupportedOpenKind,

    #[snafu(display("invalid file pointer"))]
    InvalidFilePtr,

    #[snafu(display("file handle is read-only"))]
    ReadOnly,

    #[snafu(display("permission denied"))]
    PermissionDenied,

    #[snafu(display("received null pointer"))]
    NullPtr,

    External {
        cause: External,
    },
}

impl<T> From<T> for Error<T> {
    fn from(value: T) -> Self {
        Self::External { cause: value }
    }
}
