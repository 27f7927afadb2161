//! The port handle and its timeout-governed I/O engine.
//!
//! [`SerialPort`] owns one native device handle. All methods take `&self`:
//! the supported concurrency pattern is full duplex — one thread blocked in
//! [`SerialPort::read`] while another calls [`SerialPort::write`] — plus
//! [`SerialPort::close`] from any thread as the sole cancellation mechanism.
//! Close wakes every blocked call (they return [`Error::ClosedPort`]), waits
//! for them to drain, then releases the native handle so the same device can
//! be reopened immediately.

use std::fmt;
use std::io;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::config::{SerialConfig, Timeout};
use crate::error::{Error, Result};
use crate::sys::{self, RawPort};

/// An open serial port.
///
/// Created by [`SerialPort::open`]; destroyed by [`SerialPort::close`] or by
/// dropping the value. After close, every operation fails with
/// [`Error::ClosedPort`]; reopening requires a fresh `open` call.
pub struct SerialPort {
    inner: Inner<sys::NativePort>,
}

struct Inner<P: RawPort> {
    port: P,
    name: String,
    state: Mutex<IoState>,
    idle: Condvar,
}

struct IoState {
    closed: bool,
    /// Calls currently inside the backend. Close waits for this to drain
    /// before releasing the native handle, so no call can touch a dead fd.
    in_flight: usize,
    timeout: Timeout,
}

impl<P: RawPort> Inner<P> {
    fn new(port: P, name: String) -> Self {
        Self {
            port,
            name,
            state: Mutex::new(IoState {
                closed: false,
                in_flight: 0,
                timeout: Timeout::Infinite,
            }),
            idle: Condvar::new(),
        }
    }

    /// Enter the backend: fails once closed, otherwise registers the call and
    /// snapshots the timeout it should run under.
    fn begin(&self) -> Result<Timeout> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ClosedPort);
        }
        state.in_flight += 1;
        Ok(state.timeout)
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        state.in_flight -= 1;
        if state.closed && state.in_flight == 0 {
            self.idle.notify_all();
        }
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let timeout = self.begin()?;
        let result = self.port.read_with_timeout(buf, timeout);
        self.finish();
        result
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        self.begin()?;
        let result = self.port.write(buf);
        self.finish();
        result
    }

    fn config(&self) -> Result<SerialConfig> {
        self.begin()?;
        let result = self.port.native_config();
        self.finish();
        result
    }

    fn set_config(&self, config: &SerialConfig) -> Result<()> {
        self.begin()?;
        let result = self.port.set_native_config(config);
        self.finish();
        if result.is_ok() {
            debug!(port = %self.name, %config, "serial configuration applied");
        }
        result
    }

    fn bytes_to_read(&self) -> Result<usize> {
        self.begin()?;
        let result = self.port.bytes_to_read();
        self.finish();
        result
    }

    fn discard_buffers(&self) -> Result<()> {
        self.begin()?;
        let result = self.port.discard_buffers();
        self.finish();
        result
    }

    fn set_timeout(&self, timeout: Timeout) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ClosedPort);
        }
        state.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Timeout {
        self.state.lock().timeout
    }

    fn is_open(&self) -> bool {
        !self.state.lock().closed
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.port.wake();
        while state.in_flight > 0 {
            self.idle.wait(&mut state);
        }
        drop(state);
        self.port.close_native();
        debug!(port = %self.name, "serial port closed");
    }
}

impl SerialPort {
    /// Open the named serial device with exclusive access.
    ///
    /// The name is passed to the OS as-is (`"COM4"`, `"/dev/ttyUSB0"`, ...);
    /// no naming scheme is imposed here. The line keeps whatever
    /// configuration the driver currently has — only session flags are
    /// touched — and the read timeout starts out [`Timeout::Infinite`].
    pub fn open(name: &str) -> Result<Self> {
        let port = sys::NativePort::open(name)?;
        debug!(port = %name, "serial port opened");
        Ok(Self {
            inner: Inner::new(port, name.to_string()),
        })
    }

    /// The name this port was opened with.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the handle is still open.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Read the live line configuration from the driver.
    ///
    /// This queries the device rather than a cached value, so it observes
    /// configuration applied by a previous handle or another process. Whether
    /// a driver retains configuration across close/reopen is a platform
    /// capability: POSIX termios does, some Windows drivers reset.
    pub fn config(&self) -> Result<SerialConfig> {
        self.inner.config()
    }

    /// Apply a line configuration at the driver.
    ///
    /// On success an immediately following [`SerialPort::config`] returns an
    /// equal value. Combinations the driver cannot express fail with
    /// [`Error::UnsupportedConfig`]; this is reported here, at apply time,
    /// because some combinations are only invalid on particular hardware.
    pub fn set_config(&self, config: &SerialConfig) -> Result<()> {
        self.inner.set_config(config)
    }

    /// Set the bound used by subsequent reads.
    ///
    /// Takes effect before the next read begins; a read already in progress
    /// keeps the bound it started with.
    pub fn set_timeout(&self, timeout: Timeout) -> Result<()> {
        self.inner.set_timeout(timeout)
    }

    /// The currently configured read timeout.
    pub fn timeout(&self) -> Timeout {
        self.inner.timeout()
    }

    /// Read up to `buf.len()` bytes.
    ///
    /// Under [`Timeout::Infinite`] this blocks until at least one byte is
    /// available and then returns immediately with whatever the driver has,
    /// without waiting for the buffer to fill. [`Timeout::Immediate`] never
    /// blocks. [`Timeout::Milliseconds`] blocks until data arrives or the
    /// bound elapses; expiry is the valid outcome `Ok(0)`, not an error, so
    /// callers can poll in a loop without error-driven control flow.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf)
    }

    /// Write bytes synchronously.
    ///
    /// Blocks platform-default while the native output buffer is full — the
    /// read timeout does not govern writes. Returns the number of bytes the
    /// driver accepted, which may be less than `buf.len()`.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.inner.write(buf)
    }

    /// Number of bytes currently buffered by the driver for reading.
    pub fn bytes_to_read(&self) -> Result<usize> {
        self.inner.bytes_to_read()
    }

    /// Discard unread input and unsent output held by the driver.
    pub fn discard_buffers(&self) -> Result<()> {
        self.inner.discard_buffers()
    }

    /// Close the port.
    ///
    /// Idempotent and infallible: native release errors are swallowed since
    /// no corrective action is possible. Any thread blocked in a read or
    /// write on this handle is unblocked promptly and observes
    /// [`Error::ClosedPort`]. The native handle is released before this call
    /// returns, so the same device can be reopened right away.
    pub fn close(&self) {
        self.inner.close()
    }
}

impl fmt::Debug for SerialPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialPort")
            .field("name", &self.inner.name)
            .field("open", &self.is_open())
            .finish()
    }
}

fn stream_read(port: &SerialPort, buf: &mut [u8]) -> io::Result<usize> {
    let n = port.read(buf).map_err(io::Error::from)?;
    // A stream cannot distinguish "no data within bound" from end-of-stream
    // by count alone, so bounded expiry surfaces as TimedOut here. Immediate
    // mode keeps its poll-style Ok(0).
    if n == 0 && !buf.is_empty() && matches!(port.timeout(), Timeout::Milliseconds(_)) {
        return Err(io::Error::from(Error::Timeout));
    }
    Ok(n)
}

/// Byte-stream view over the port, the conventional way to hand the port to
/// code that speaks `Read`/`Write`. Implemented for `&SerialPort` as well so
/// a reader thread and a writer thread can each hold their own adapter.
impl io::Read for SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        stream_read(self, buf)
    }
}

impl io::Write for SerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        SerialPort::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for &SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        stream_read(self, buf)
    }
}

impl io::Write for &SerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        SerialPort::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
