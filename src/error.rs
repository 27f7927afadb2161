//! Error taxonomy for port operations.
//!
//! Every native failure maps to exactly one variant; codes with no specific
//! meaning fall back to [`Error::Driver`], which keeps the native error for
//! diagnostics. Timeout expiry during a read is *not* represented here — it
//! is a valid zero-byte outcome of [`SerialPort::read`](crate::SerialPort::read).

use std::io;
use thiserror::Error;

/// A specialized `Result` type for serial port operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while opening, configuring or using a serial port.
#[derive(Debug, Error)]
pub enum Error {
    /// The named device does not exist on this system.
    #[error("serial port not found: {0}")]
    NotFound(String),

    /// The device exists but could not be acquired, typically because it is
    /// already in use or the process lacks privilege.
    #[error("access denied opening serial port: {0}")]
    AccessDenied(String),

    /// The operation requires an open port, but the handle has been closed.
    #[error("serial port is closed")]
    ClosedPort,

    /// The native driver rejected the requested line configuration.
    #[error("unsupported serial configuration: {0}")]
    UnsupportedConfig(String),

    /// The operation did not complete within its bound.
    ///
    /// Core reads report expiry as a zero-byte success; this variant only
    /// surfaces through the [`io::Read`](std::io::Read) adapter, where a
    /// stream contract needs a distinct condition.
    #[error("serial operation timed out")]
    Timeout,

    /// Any other native failure, with the OS error attached.
    #[error("serial driver error: {0}")]
    Driver(#[source] io::Error),
}

impl Error {
    /// Create a `NotFound` error from a port name.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound(name.into())
    }

    /// Create an `AccessDenied` error from a port name.
    pub fn access_denied(name: impl Into<String>) -> Self {
        Self::AccessDenied(name.into())
    }

    /// Create an `UnsupportedConfig` error from a message.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedConfig(message.into())
    }

    /// The raw OS error code, when one is attached.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::Driver(err) => err.raw_os_error(),
            _ => None,
        }
    }

    /// Translate a native failure raised while opening `name`.
    ///
    /// Open is the one call where "no such device" and "device busy" are
    /// distinguishable conditions worth their own variants; everywhere else
    /// native failures go straight to [`Error::Driver`].
    pub(crate) fn from_open(name: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::not_found(name),
            io::ErrorKind::PermissionDenied => Self::access_denied(name),
            _ => match err.raw_os_error() {
                #[cfg(unix)]
                Some(code)
                    if code == libc::ENXIO || code == libc::ENODEV || code == libc::ENOTTY =>
                {
                    Self::not_found(name)
                }
                #[cfg(unix)]
                Some(code) if code == libc::EBUSY => Self::access_denied(name),
                #[cfg(windows)]
                Some(code)
                    if code == winapi::shared::winerror::ERROR_SHARING_VIOLATION as i32 =>
                {
                    Self::access_denied(name)
                }
                _ => Self::Driver(err),
            },
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Driver(err)
    }
}

/// Lossy conversion for the stream adapter: keeps the `io::Error` payload
/// where one exists so callers can still reach the native code.
impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Driver(io) => io,
            Error::ClosedPort => io::Error::new(io::ErrorKind::NotConnected, err.to_string()),
            Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, err.to_string()),
            Error::NotFound(_) => io::Error::new(io::ErrorKind::NotFound, err.to_string()),
            Error::AccessDenied(_) => {
                io::Error::new(io::ErrorKind::PermissionDenied, err.to_string())
            }
            Error::UnsupportedConfig(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
            }
        }
    }
}
