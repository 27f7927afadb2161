//! Platform seam for the native port implementations.
//!
//! One backend per target platform; everything above this module depends on
//! the [`RawPort`] trait alone, never on a specific backend.

use crate::config::{SerialConfig, Timeout};
use crate::error::Result;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(test)]
pub(crate) mod mock;

#[cfg(unix)]
pub(crate) use unix::TtyPort as NativePort;
#[cfg(windows)]
pub(crate) use windows::ComPort as NativePort;

/// Capability surface a platform backend must provide.
///
/// Methods take `&self`: a port is read and written from different threads
/// concurrently (full duplex), and [`RawPort::wake`] is called from the
/// closing thread while a read is in flight. The caller (the engine in
/// `crate::port`) guarantees that [`RawPort::close_native`] only runs once no
/// other call is in flight, so implementations do not need to defend the
/// native handle against use-after-release.
pub(crate) trait RawPort: Send + Sync {
    /// Read up to `buf.len()` bytes under the given timeout policy.
    ///
    /// Returns as soon as at least one byte is available; expiry of a bounded
    /// timeout is `Ok(0)`. A wake-up triggered by [`RawPort::wake`] returns
    /// `Err(Error::ClosedPort)`.
    fn read_with_timeout(&self, buf: &mut [u8], timeout: Timeout) -> Result<usize>;

    /// Write bytes, blocking while the native output buffer is full.
    ///
    /// Returns the number of bytes the driver accepted, which may be short.
    fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Read the live line configuration from the driver.
    fn native_config(&self) -> Result<SerialConfig>;

    /// Apply a line configuration at the driver.
    fn set_native_config(&self, config: &SerialConfig) -> Result<()>;

    /// Number of bytes currently buffered by the driver for reading.
    fn bytes_to_read(&self) -> Result<usize>;

    /// Discard unread input and unsent output held by the driver.
    fn discard_buffers(&self) -> Result<()>;

    /// Unblock every in-flight read or write; they return `ClosedPort`.
    /// Persistent: calls that start after a wake also return immediately.
    fn wake(&self);

    /// Release the native handle. Idempotent; errors are swallowed because
    /// no corrective action is possible at this point.
    fn close_native(&self);
}
