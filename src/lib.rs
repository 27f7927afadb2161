//! Cross-platform serial (COM/TTY) port I/O.
//!
//! This library opens a named serial device, configures its line parameters
//! and performs blocking reads and writes under a single timeout contract:
//! a read blocks until at least one byte arrives or the configured bound
//! elapses, whichever comes first, and is safely interruptible by closing the
//! port from another thread. The platform differences — overlapped I/O on
//! Windows, termios plus `poll(2)` on POSIX — stay inside the `sys` backends.
//!
//! # Modules
//!
//! - `config`: line configuration value types and the read timeout policy
//! - `error`: the closed error taxonomy for all port operations
//! - `port`: the port handle and its timeout-governed I/O engine
//! - `sys`: per-platform native backends (private)
//!
//! # Example
//!
//! ```no_run
//! use comline::{BaudRate, DataBits, Parity, SerialConfig, SerialPort, StopBits, Timeout};
//!
//! let port = SerialPort::open("/dev/ttyUSB0")?;
//! port.set_config(&SerialConfig::new(
//!     BaudRate::B115200,
//!     Parity::None,
//!     StopBits::One,
//!     DataBits::Eight,
//! ))?;
//! port.set_timeout(Timeout::Milliseconds(500))?;
//!
//! let mut buf = [0u8; 64];
//! let n = port.read(&mut buf)?;
//! println!("got {n} bytes");
//! # Ok::<(), comline::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod port;

mod sys;

// Re-export the whole public surface at the crate root for convenience.
pub use config::{BaudRate, DataBits, Parity, SerialConfig, StopBits, Timeout};
pub use error::{Error, Result};
pub use port::SerialPort;
